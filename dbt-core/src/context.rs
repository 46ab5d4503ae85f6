//! 客户机CPU上下文模型
//!
//! 寄存器 0–29 为通用寄存器，30 为链接寄存器。编号 31 根据指令的不同
//! 解释为栈指针或零寄存器，调用方通过 [`Reg31`] 显式选择。

use serde::{Deserialize, Serialize};

use crate::Vector128;

/// 通用寄存器数量（不含链接寄存器）
pub const GPR_COUNT: usize = 30;
/// 链接寄存器编号
pub const LINK_REGISTER: u8 = 30;
/// 向量寄存器数量
pub const VECTOR_COUNT: usize = 32;

/// FPCR.DN：NaN 结果一律替换为默认 NaN
pub const FPCR_DN: u32 = 1 << 25;

/// FPSR 累积异常位
pub const FPSR_IOC: u32 = 1 << 0;
pub const FPSR_DZC: u32 = 1 << 1;
pub const FPSR_OFC: u32 = 1 << 2;
pub const FPSR_UFC: u32 = 1 << 3;
pub const FPSR_IXC: u32 = 1 << 4;

/// 编号 31 的含义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg31 {
    /// 栈指针
    Sp,
    /// 零寄存器：读为 0，写入丢弃
    Zero,
}

/// NZCV 条件标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nzcv {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

impl Nzcv {
    /// 从 4 位值构造（N 为最高位）
    pub const fn from_nibble(nibble: u8) -> Self {
        Self {
            n: nibble & 0b1000 != 0,
            z: nibble & 0b0100 != 0,
            c: nibble & 0b0010 != 0,
            v: nibble & 0b0001 != 0,
        }
    }

    pub const fn nibble(self) -> u8 {
        (self.n as u8) << 3 | (self.z as u8) << 2 | (self.c as u8) << 1 | self.v as u8
    }

    /// 从标志字构造，N=bit31, Z=bit30, C=bit29, V=bit28
    pub const fn from_word(word: u64) -> Self {
        Self::from_nibble(((word >> 28) & 0xF) as u8)
    }

    pub const fn to_word(self) -> u64 {
        (self.nibble() as u64) << 28
    }
}

/// 条件码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Eq = 0,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    Nv,
}

impl Condition {
    pub const ALL: [Condition; 16] = [
        Condition::Eq,
        Condition::Ne,
        Condition::Cs,
        Condition::Cc,
        Condition::Mi,
        Condition::Pl,
        Condition::Vs,
        Condition::Vc,
        Condition::Hi,
        Condition::Ls,
        Condition::Ge,
        Condition::Lt,
        Condition::Gt,
        Condition::Le,
        Condition::Al,
        Condition::Nv,
    ];

    /// 取低 4 位解码
    pub const fn from_bits(bits: u32) -> Self {
        Self::ALL[(bits & 0xF) as usize]
    }

    /// 判断条件在给定标志下是否成立
    pub const fn holds(self, f: Nzcv) -> bool {
        match self {
            Condition::Eq => f.z,
            Condition::Ne => !f.z,
            Condition::Cs => f.c,
            Condition::Cc => !f.c,
            Condition::Mi => f.n,
            Condition::Pl => !f.n,
            Condition::Vs => f.v,
            Condition::Vc => !f.v,
            Condition::Hi => f.c && !f.z,
            Condition::Ls => !(f.c && !f.z),
            Condition::Ge => f.n == f.v,
            Condition::Lt => f.n != f.v,
            Condition::Gt => !f.z && f.n == f.v,
            Condition::Le => !(!f.z && f.n == f.v),
            Condition::Al | Condition::Nv => true,
        }
    }
}

/// FPCR 舍入模式（bit 22–23）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundingMode {
    Nearest,
    PlusInfinity,
    MinusInfinity,
    Zero,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneralRegisters {
    pub x: [u64; GPR_COUNT],
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    /// 打包的 NZCV 标志字
    pub nzcv: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorRegisters {
    pub v: [Vector128; VECTOR_COUNT],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FpRegisters {
    pub fpcr: u32,
    pub fpsr: u32,
}

/// 本地独占监视器
///
/// LDXR 记录地址、访问大小和读到的值；STXR 只在地址和大小一致且内存中仍是
/// 该值时写入成功。`size` 为 0 表示监视器处于开放状态。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExclusiveMonitor {
    pub addr: u64,
    pub value: u64,
    pub size: u32,
}

impl ExclusiveMonitor {
    pub fn is_open(&self) -> bool {
        self.size == 0
    }

    pub fn arm(&mut self, addr: u64, size: u32, value: u64) {
        *self = Self { addr, value, size };
    }

    /// 取出当前记录并回到开放状态；与 `addr`/`size` 不匹配时返回 `None`
    pub fn take(&mut self, addr: u64, size: u32) -> Option<u64> {
        let armed = *self;
        self.clear();
        (!armed.is_open() && armed.addr == addr && armed.size == size).then_some(armed.value)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// 每个执行线程拥有的CPU上下文
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuContext {
    pub gpr: GeneralRegisters,
    pub vec: VectorRegisters,
    pub fp: FpRegisters,
    pub monitor: ExclusiveMonitor,
}

impl CpuContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定入口地址和栈指针创建上下文
    pub fn with_entry(pc: u64, sp: u64) -> Self {
        let mut ctx = Self::default();
        ctx.gpr.pc = pc;
        ctx.gpr.sp = sp;
        ctx
    }

    /// 读取 64 位寄存器，编号 31 按 `r31` 解释
    pub fn reg(&self, index: u8, r31: Reg31) -> u64 {
        match index {
            0..=29 => self.gpr.x[index as usize],
            30 => self.gpr.lr,
            _ => match r31 {
                Reg31::Sp => self.gpr.sp,
                Reg31::Zero => 0,
            },
        }
    }

    /// 写入 64 位寄存器，编号 31 按 `r31` 解释
    pub fn set_reg(&mut self, index: u8, value: u64, r31: Reg31) {
        match index {
            0..=29 => self.gpr.x[index as usize] = value,
            30 => self.gpr.lr = value,
            _ => {
                if r31 == Reg31::Sp {
                    self.gpr.sp = value;
                }
            }
        }
    }

    /// 读取 Xn（31 为零寄存器）
    pub fn x(&self, index: u8) -> u64 {
        self.reg(index, Reg31::Zero)
    }

    /// 写入 Xn（31 写入被丢弃）
    pub fn set_x(&mut self, index: u8, value: u64) {
        self.set_reg(index, value, Reg31::Zero);
    }

    /// 读取 Wn
    pub fn w(&self, index: u8) -> u32 {
        self.x(index) as u32
    }

    /// 写入 Wn，高 32 位清零
    pub fn set_w(&mut self, index: u8, value: u32) {
        self.set_x(index, value as u64);
    }

    pub fn pc(&self) -> u64 {
        self.gpr.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.gpr.pc = pc;
    }

    pub fn sp(&self) -> u64 {
        self.gpr.sp
    }

    pub fn lr(&self) -> u64 {
        self.gpr.lr
    }

    pub fn nzcv(&self) -> Nzcv {
        Nzcv::from_word(self.gpr.nzcv)
    }

    pub fn set_nzcv(&mut self, flags: Nzcv) {
        self.gpr.nzcv = flags.to_word();
    }

    pub fn condition_holds(&self, cond: Condition) -> bool {
        cond.holds(self.nzcv())
    }

    pub fn v(&self, index: u8) -> Vector128 {
        self.vec.v[(index & 0x1F) as usize]
    }

    pub fn set_v(&mut self, index: u8, value: Vector128) {
        self.vec.v[(index & 0x1F) as usize] = value;
    }

    /// 标量双精度视图（Dn）
    pub fn d(&self, index: u8) -> f64 {
        f64::from_bits(self.v(index).lo)
    }

    /// 写入 Dn，寄存器其余位清零
    pub fn set_d(&mut self, index: u8, value: f64) {
        self.set_v(index, Vector128::new(value.to_bits(), 0));
    }

    /// 标量单精度视图（Sn）
    pub fn s(&self, index: u8) -> f32 {
        f32::from_bits(self.v(index).lo as u32)
    }

    /// 写入 Sn，寄存器其余位清零
    pub fn set_s(&mut self, index: u8, value: f32) {
        self.set_v(index, Vector128::new(value.to_bits() as u64, 0));
    }

    pub fn rounding_mode(&self) -> RoundingMode {
        match (self.fp.fpcr >> 22) & 0b11 {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::PlusInfinity,
            2 => RoundingMode::MinusInfinity,
            _ => RoundingMode::Zero,
        }
    }

    /// 置位 FPSR 累积异常标志
    pub fn raise_fp_exception(&mut self, bits: u32) {
        self.fp.fpsr |= bits;
    }

    pub fn default_nan_mode(&self) -> bool {
        self.fp.fpcr & FPCR_DN != 0
    }
}
