//! x86-64 指令编码
//!
//! 只覆盖生成代码实际用到的指令形式。内存操作数统一编码为 `mod=10` 加 32 位
//! 位移，基址为 RSP/R12 时补 SIB 字节 `0x24`。强制前缀 (66/F2/F3) 总是位于
//! REX 之前；引用 r8–r15 或 xmm8–xmm15 时一定带 REX。

use super::{EmitError, Emitter, Rel8Fixup};

/// XMM 寄存器编号 (0..16)
pub type Xmm = u8;

/// 通用寄存器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// 作为 8 位操作数时，4..8 需要 REX 才表示 SPL/BPL/SIL/DIL
    const fn needs_rex_as_byte(self) -> bool {
        matches!(self, Gpr::Rsp | Gpr::Rbp | Gpr::Rsi | Gpr::Rdi)
    }
}

/// 整数操作宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    /// 由 A64 的 `sf` 位选择宽度
    pub const fn from_sf(sf: bool) -> Self {
        if sf { Width::W64 } else { Width::W32 }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// 该宽度下的全 1 掩码
    pub const fn mask(self) -> u64 {
        match self {
            Width::W32 => u32::MAX as u64,
            Width::W64 => u64::MAX,
        }
    }

    const fn rex_w(self) -> bool {
        matches!(self, Width::W64)
    }
}

/// 标量浮点精度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    const fn scalar_prefix(self) -> u8 {
        match self {
            Precision::Single => 0xF3,
            Precision::Double => 0xF2,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

/// `[base + disp32]` 内存操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub disp: i32,
}

impl Mem {
    pub const fn new(base: Gpr, disp: i32) -> Self {
        Self { base, disp }
    }

    /// 保存区中的槽位（RDI 指向保存区）
    pub const fn area(disp: i32) -> Self {
        Self::new(Gpr::Rdi, disp)
    }

    /// 栈顶
    pub const fn stack() -> Self {
        Self::new(Gpr::Rsp, 0)
    }
}

/// 双操作数整数运算，值为 `/digit` 扩展码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// 移位运算，值为 `/digit` 扩展码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// x86 条件码 (Jcc/SETcc/CMOVcc 的低 4 位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Self {
        match code & 0xF {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }

    /// 取反条件（x86 条件码最低位取反）
    pub const fn invert(self) -> Self {
        Self::from_code(self.code() ^ 1)
    }

    /// `0F 8x` 近跳转的第二个操作码字节
    pub const fn jcc_opcode(self) -> u8 {
        0x80 | self.code()
    }

    /// `0F 4x` 条件传送的第二个操作码字节
    pub const fn cmov_opcode(self) -> u8 {
        0x40 | self.code()
    }
}

/// 标量 SSE 运算的操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScalarOp {
    Sqrt = 0x51,
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Min = 0x5D,
    Div = 0x5E,
    Max = 0x5F,
}

/// 66 前缀的打包整数运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedOp {
    Movdqa,
    Paddb,
    Paddw,
    Paddd,
    Paddq,
    Psubb,
    Psubw,
    Psubd,
    Psubq,
    Pmullw,
    /// SSE4.1
    Pmulld,
    Pand,
    Pandn,
    Por,
    Pxor,
    Pcmpeqb,
    Pcmpeqw,
    Pcmpeqd,
    /// SSE4.1
    Pcmpeqq,
    Pcmpgtb,
    Pcmpgtw,
    Pcmpgtd,
    /// SSE4.2
    Pcmpgtq,
    Pmaxub,
    /// SSE4.1
    Pmaxuw,
    /// SSE4.1
    Pmaxud,
    Punpcklbw,
    Punpcklwd,
    Punpckldq,
    Punpcklqdq,
    Punpckhbw,
    Punpckhwd,
    Punpckhdq,
    Punpckhqdq,
}

impl PackedOp {
    const fn opcode(self) -> &'static [u8] {
        match self {
            PackedOp::Movdqa => &[0x0F, 0x6F],
            PackedOp::Paddb => &[0x0F, 0xFC],
            PackedOp::Paddw => &[0x0F, 0xFD],
            PackedOp::Paddd => &[0x0F, 0xFE],
            PackedOp::Paddq => &[0x0F, 0xD4],
            PackedOp::Psubb => &[0x0F, 0xF8],
            PackedOp::Psubw => &[0x0F, 0xF9],
            PackedOp::Psubd => &[0x0F, 0xFA],
            PackedOp::Psubq => &[0x0F, 0xFB],
            PackedOp::Pmullw => &[0x0F, 0xD5],
            PackedOp::Pmulld => &[0x0F, 0x38, 0x40],
            PackedOp::Pand => &[0x0F, 0xDB],
            PackedOp::Pandn => &[0x0F, 0xDF],
            PackedOp::Por => &[0x0F, 0xEB],
            PackedOp::Pxor => &[0x0F, 0xEF],
            PackedOp::Pcmpeqb => &[0x0F, 0x74],
            PackedOp::Pcmpeqw => &[0x0F, 0x75],
            PackedOp::Pcmpeqd => &[0x0F, 0x76],
            PackedOp::Pcmpeqq => &[0x0F, 0x38, 0x29],
            PackedOp::Pcmpgtb => &[0x0F, 0x64],
            PackedOp::Pcmpgtw => &[0x0F, 0x65],
            PackedOp::Pcmpgtd => &[0x0F, 0x66],
            PackedOp::Pcmpgtq => &[0x0F, 0x38, 0x37],
            PackedOp::Pmaxub => &[0x0F, 0xDE],
            PackedOp::Pmaxuw => &[0x0F, 0x38, 0x3E],
            PackedOp::Pmaxud => &[0x0F, 0x38, 0x3F],
            PackedOp::Punpcklbw => &[0x0F, 0x60],
            PackedOp::Punpcklwd => &[0x0F, 0x61],
            PackedOp::Punpckldq => &[0x0F, 0x62],
            PackedOp::Punpcklqdq => &[0x0F, 0x6C],
            PackedOp::Punpckhbw => &[0x0F, 0x68],
            PackedOp::Punpckhwd => &[0x0F, 0x69],
            PackedOp::Punpckhdq => &[0x0F, 0x6A],
            PackedOp::Punpckhqdq => &[0x0F, 0x6D],
        }
    }
}

/// 打包立即数移位 (`66 0F 71/72/73 /digit ib`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedShift {
    Psllw,
    Pslld,
    Psllq,
    Psrlw,
    Psrld,
    Psrlq,
    Psraw,
    Psrad,
}

impl PackedShift {
    const fn encoding(self) -> (u8, u8) {
        match self {
            PackedShift::Psrlw => (0x71, 2),
            PackedShift::Psraw => (0x71, 4),
            PackedShift::Psllw => (0x71, 6),
            PackedShift::Psrld => (0x72, 2),
            PackedShift::Psrad => (0x72, 4),
            PackedShift::Pslld => (0x72, 6),
            PackedShift::Psrlq => (0x73, 2),
            PackedShift::Psllq => (0x73, 6),
        }
    }
}

/// VEX 编码的标量融合乘加
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmaOp {
    /// a*b + c
    Madd,
    /// a*b - c
    Msub,
    /// -(a*b) + c
    Nmadd,
    /// -(a*b) - c
    Nmsub,
}

/// FMA 操作数顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmaForm {
    /// dst = src2 * dst ± src3
    F213,
    /// dst = src2 * src3 ± dst
    F231,
}

#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(Mem),
}

/// 一条传统（非 VEX）指令的编码参数
#[derive(Debug, Clone, Copy)]
struct Legacy<'a> {
    prefix: Option<u8>,
    w: bool,
    force_rex: bool,
    opcode: &'a [u8],
    reg: u8,
    rm: Rm,
    imm: &'a [u8],
}

impl Default for Legacy<'_> {
    fn default() -> Self {
        Self {
            prefix: None,
            w: false,
            force_rex: false,
            opcode: &[],
            reg: 0,
            rm: Rm::Reg(0),
            imm: &[],
        }
    }
}

fn push_mem_operand(bytes: &mut Vec<u8>, reg: u8, mem: Mem) {
    let base = mem.base.code();
    bytes.push(0x80 | ((reg & 7) << 3) | (base & 7));
    if base & 7 == 4 {
        bytes.push(0x24);
    }
    bytes.extend_from_slice(&mem.disp.to_le_bytes());
}

impl Emitter {
    fn legacy(&mut self, insn: Legacy<'_>) -> Result<(), EmitError> {
        let mut bytes = Vec::with_capacity(16);
        if let Some(prefix) = insn.prefix {
            bytes.push(prefix);
        }
        let rm_code = match insn.rm {
            Rm::Reg(r) => r,
            Rm::Mem(m) => m.base.code(),
        };
        let rex = 0x40 | (u8::from(insn.w) << 3) | (((insn.reg >> 3) & 1) << 2) | ((rm_code >> 3) & 1);
        if rex != 0x40 || insn.force_rex {
            bytes.push(rex);
        }
        bytes.extend_from_slice(insn.opcode);
        match insn.rm {
            Rm::Reg(r) => bytes.push(0xC0 | ((insn.reg & 7) << 3) | (r & 7)),
            Rm::Mem(m) => push_mem_operand(&mut bytes, insn.reg, m),
        }
        bytes.extend_from_slice(insn.imm);
        self.emit_bytes(&bytes)
    }

    /// 单字节操作码 + 寄存器编号 (push/pop/mov imm)
    fn plus_reg(&mut self, w: bool, opcode: u8, reg: Gpr, imm: &[u8]) -> Result<(), EmitError> {
        let mut bytes = Vec::with_capacity(10);
        let rex = 0x40 | (u8::from(w) << 3) | ((reg.code() >> 3) & 1);
        if rex != 0x40 {
            bytes.push(rex);
        }
        bytes.push(opcode + (reg.code() & 7));
        bytes.extend_from_slice(imm);
        self.emit_bytes(&bytes)
    }

    // ------------------------------------------------------------------
    // 整数传送
    // ------------------------------------------------------------------

    pub fn mov_rr(&mut self, width: Width, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x89],
            reg: src.code(),
            rm: Rm::Reg(dst.code()),
            ..Legacy::default()
        })
    }

    pub fn load(&mut self, width: Width, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x8B],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    pub fn store(&mut self, width: Width, mem: Mem, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x89],
            reg: src.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    pub fn store8(&mut self, mem: Mem, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            force_rex: src.needs_rex_as_byte(),
            opcode: &[0x88],
            reg: src.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    pub fn store16(&mut self, mem: Mem, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            prefix: Some(0x66),
            opcode: &[0x89],
            reg: src.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// movzx r32, byte [mem]
    pub fn load_zx8(&mut self, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            opcode: &[0x0F, 0xB6],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// movzx r32, word [mem]
    pub fn load_zx16(&mut self, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            opcode: &[0x0F, 0xB7],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    pub fn load_sx8(&mut self, width: Width, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x0F, 0xBE],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    pub fn load_sx16(&mut self, width: Width, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x0F, 0xBF],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// movsxd r64, dword [mem]
    pub fn load_sx32(&mut self, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: true,
            opcode: &[0x63],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// movsxd r64, r32
    pub fn movsxd(&mut self, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: true,
            opcode: &[0x63],
            reg: dst.code(),
            rm: Rm::Reg(src.code()),
            ..Legacy::default()
        })
    }

    /// mov dword/qword [mem], imm32（qword 时符号扩展）
    pub fn store_imm32(&mut self, width: Width, mem: Mem, imm: i32) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0xC7],
            reg: 0,
            rm: Rm::Mem(mem),
            imm: &imm.to_le_bytes(),
            ..Legacy::default()
        })
    }

    /// movzx r32, r8
    pub fn movzx8(&mut self, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            force_rex: src.needs_rex_as_byte(),
            opcode: &[0x0F, 0xB6],
            reg: dst.code(),
            rm: Rm::Reg(src.code()),
            ..Legacy::default()
        })
    }

    /// mov r32, imm32（零扩展到 64 位）
    pub fn mov_imm32(&mut self, dst: Gpr, imm: u32) -> Result<(), EmitError> {
        self.plus_reg(false, 0xB8, dst, &imm.to_le_bytes())
    }

    /// 加载 64 位立即数；能放进 32 位时使用零扩展的短形式
    pub fn mov_imm64(&mut self, dst: Gpr, imm: u64) -> Result<(), EmitError> {
        match u32::try_from(imm) {
            Ok(short) => self.mov_imm32(dst, short),
            Err(_) => self.plus_reg(true, 0xB8, dst, &imm.to_le_bytes()),
        }
    }

    pub fn lea(&mut self, dst: Gpr, mem: Mem) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: true,
            opcode: &[0x8D],
            reg: dst.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    // ------------------------------------------------------------------
    // 整数运算
    // ------------------------------------------------------------------

    pub fn alu_rr(&mut self, op: Alu, width: Width, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[((op as u8) << 3) | 1],
            reg: src.code(),
            rm: Rm::Reg(dst.code()),
            ..Legacy::default()
        })
    }

    /// 立即数按 32 位有符号扩展；能放进 8 位时用 `83` 短形式
    pub fn alu_ri(&mut self, op: Alu, width: Width, dst: Gpr, imm: i32) -> Result<(), EmitError> {
        match i8::try_from(imm) {
            Ok(short) => self.legacy(Legacy {
                w: width.rex_w(),
                opcode: &[0x83],
                reg: op as u8,
                rm: Rm::Reg(dst.code()),
                imm: &[short as u8],
                ..Legacy::default()
            }),
            Err(_) => self.legacy(Legacy {
                w: width.rex_w(),
                opcode: &[0x81],
                reg: op as u8,
                rm: Rm::Reg(dst.code()),
                imm: &imm.to_le_bytes(),
                ..Legacy::default()
            }),
        }
    }

    /// 立即数移位；移位量为 0 时不发射任何字节
    pub fn shift_ri(&mut self, op: Shift, width: Width, dst: Gpr, amount: u8) -> Result<(), EmitError> {
        if amount == 0 {
            return Ok(());
        }
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0xC1],
            reg: op as u8,
            rm: Rm::Reg(dst.code()),
            imm: &[amount],
            ..Legacy::default()
        })
    }

    /// 按 CL 移位；硬件把移位量按宽度取模
    pub fn shift_cl(&mut self, op: Shift, width: Width, dst: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0xD3],
            reg: op as u8,
            rm: Rm::Reg(dst.code()),
            ..Legacy::default()
        })
    }

    /// imul dst, src（双操作数，低位结果与有无符号无关）
    pub fn imul_rr(&mut self, width: Width, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x0F, 0xAF],
            reg: dst.code(),
            rm: Rm::Reg(src.code()),
            ..Legacy::default()
        })
    }

    fn group3(&mut self, digit: u8, width: Width, reg: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0xF7],
            reg: digit,
            rm: Rm::Reg(reg.code()),
            ..Legacy::default()
        })
    }

    pub fn not(&mut self, width: Width, reg: Gpr) -> Result<(), EmitError> {
        self.group3(2, width, reg)
    }

    pub fn neg(&mut self, width: Width, reg: Gpr) -> Result<(), EmitError> {
        self.group3(3, width, reg)
    }

    /// 无符号除法：rdx:rax / reg
    pub fn div(&mut self, width: Width, reg: Gpr) -> Result<(), EmitError> {
        self.group3(6, width, reg)
    }

    /// 有符号除法：rdx:rax / reg
    pub fn idiv(&mut self, width: Width, reg: Gpr) -> Result<(), EmitError> {
        self.group3(7, width, reg)
    }

    /// cdq / cqo
    pub fn sign_extend_acc(&mut self, width: Width) -> Result<(), EmitError> {
        match width {
            Width::W32 => self.emit_u8(0x99),
            Width::W64 => self.emit_bytes(&[0x48, 0x99]),
        }
    }

    pub fn test_rr(&mut self, width: Width, a: Gpr, b: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x85],
            reg: b.code(),
            rm: Rm::Reg(a.code()),
            ..Legacy::default()
        })
    }

    fn bit_op(&mut self, digit: u8, width: Width, reg: Gpr, bit: u8) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x0F, 0xBA],
            reg: digit,
            rm: Rm::Reg(reg.code()),
            imm: &[bit],
            ..Legacy::default()
        })
    }

    /// bt：把指定位复制到 CF
    pub fn bt_ri(&mut self, width: Width, reg: Gpr, bit: u8) -> Result<(), EmitError> {
        self.bit_op(4, width, reg, bit)
    }

    /// btr：清除指定位
    pub fn btr_ri(&mut self, width: Width, reg: Gpr, bit: u8) -> Result<(), EmitError> {
        self.bit_op(6, width, reg, bit)
    }

    /// btc：翻转指定位
    pub fn btc_ri(&mut self, width: Width, reg: Gpr, bit: u8) -> Result<(), EmitError> {
        self.bit_op(7, width, reg, bit)
    }

    pub fn setcc(&mut self, cond: Cond, dst: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            force_rex: dst.needs_rex_as_byte(),
            opcode: &[0x0F, 0x90 | cond.code()],
            reg: 0,
            rm: Rm::Reg(dst.code()),
            ..Legacy::default()
        })
    }

    pub fn cmov(&mut self, cond: Cond, width: Width, dst: Gpr, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x0F, cond.cmov_opcode()],
            reg: dst.code(),
            rm: Rm::Reg(src.code()),
            ..Legacy::default()
        })
    }

    // ------------------------------------------------------------------
    // 栈与控制流
    // ------------------------------------------------------------------

    pub fn push(&mut self, reg: Gpr) -> Result<(), EmitError> {
        self.plus_reg(false, 0x50, reg, &[])
    }

    pub fn pop(&mut self, reg: Gpr) -> Result<(), EmitError> {
        self.plus_reg(false, 0x58, reg, &[])
    }

    pub fn pushfq(&mut self) -> Result<(), EmitError> {
        self.emit_u8(0x9C)
    }

    pub fn popfq(&mut self) -> Result<(), EmitError> {
        self.emit_u8(0x9D)
    }

    pub fn ret(&mut self) -> Result<(), EmitError> {
        self.emit_u8(0xC3)
    }

    /// call reg
    pub fn call(&mut self, target: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            opcode: &[0xFF],
            reg: 2,
            rm: Rm::Reg(target.code()),
            ..Legacy::default()
        })
    }

    /// 翻转 CF
    pub fn cmc(&mut self) -> Result<(), EmitError> {
        self.emit_u8(0xF5)
    }

    // ------------------------------------------------------------------
    // 原子操作与屏障
    // ------------------------------------------------------------------

    pub fn mfence(&mut self) -> Result<(), EmitError> {
        self.emit_bytes(&[0x0F, 0xAE, 0xF0])
    }

    /// lock cmpxchg [mem], src：与 RAX/EAX 比较，失败时把内存值读入 RAX
    pub fn lock_cmpxchg(&mut self, width: Width, mem: Mem, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            prefix: Some(0xF0),
            w: width.rex_w(),
            opcode: &[0x0F, 0xB1],
            reg: src.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// lock xadd [mem], src：src 得到原值
    pub fn lock_xadd(&mut self, width: Width, mem: Mem, src: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            prefix: Some(0xF0),
            w: width.rex_w(),
            opcode: &[0x0F, 0xC1],
            reg: src.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// xchg [mem], reg（隐含 lock）
    pub fn xchg(&mut self, width: Width, mem: Mem, reg: Gpr) -> Result<(), EmitError> {
        self.legacy(Legacy {
            w: width.rex_w(),
            opcode: &[0x87],
            reg: reg.code(),
            rm: Rm::Mem(mem),
            ..Legacy::default()
        })
    }

    /// 条件短跳转，目标稍后绑定
    pub fn jcc_rel8(&mut self, cond: Cond) -> Result<Rel8Fixup, EmitError> {
        self.jump_rel8(0x70 | cond.code())
    }

    /// 条件短跳转回 `target`（循环）
    pub fn jcc_back(&mut self, cond: Cond, target: usize) -> Result<(), EmitError> {
        self.jump_back_rel8(0x70 | cond.code(), target)
    }

    /// 无条件短跳转，目标稍后绑定
    pub fn jmp_rel8(&mut self) -> Result<Rel8Fixup, EmitError> {
        self.jump_rel8(0xEB)
    }

    // ------------------------------------------------------------------
    // SSE 传送
    // ------------------------------------------------------------------

    fn sse(
        &mut self,
        prefix: Option<u8>,
        w: bool,
        opcode: &[u8],
        reg: u8,
        rm: Rm,
        imm: &[u8],
    ) -> Result<(), EmitError> {
        self.legacy(Legacy {
            prefix,
            w,
            opcode,
            reg,
            rm,
            imm,
            ..Legacy::default()
        })
    }

    /// movapd dst, src
    pub fn movapd(&mut self, dst: Xmm, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, &[0x0F, 0x28], dst, Rm::Reg(src), &[])
    }

    /// movq dst, src：复制低 64 位并清零高 64 位
    pub fn movq_xx(&mut self, dst: Xmm, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0xF3), false, &[0x0F, 0x7E], dst, Rm::Reg(src), &[])
    }

    pub fn movdqu_load(&mut self, dst: Xmm, mem: Mem) -> Result<(), EmitError> {
        self.sse(Some(0xF3), false, &[0x0F, 0x6F], dst, Rm::Mem(mem), &[])
    }

    pub fn movdqu_store(&mut self, mem: Mem, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0xF3), false, &[0x0F, 0x7F], src, Rm::Mem(mem), &[])
    }

    /// movq xmm, qword [mem]（高 64 位清零）
    pub fn movq_load(&mut self, dst: Xmm, mem: Mem) -> Result<(), EmitError> {
        self.sse(Some(0xF3), false, &[0x0F, 0x7E], dst, Rm::Mem(mem), &[])
    }

    pub fn movq_store(&mut self, mem: Mem, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, &[0x0F, 0xD6], src, Rm::Mem(mem), &[])
    }

    /// movd xmm, dword [mem]（高 96 位清零）
    pub fn movd_load(&mut self, dst: Xmm, mem: Mem) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, &[0x0F, 0x6E], dst, Rm::Mem(mem), &[])
    }

    pub fn movd_store(&mut self, mem: Mem, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, &[0x0F, 0x7E], src, Rm::Mem(mem), &[])
    }

    /// movd/movq xmm, r32/r64（其余位清零）
    pub fn mov_to_xmm(&mut self, width: Width, dst: Xmm, src: Gpr) -> Result<(), EmitError> {
        self.sse(Some(0x66), width.rex_w(), &[0x0F, 0x6E], dst, Rm::Reg(src.code()), &[])
    }

    /// movd/movq r32/r64, xmm
    pub fn mov_from_xmm(&mut self, width: Width, dst: Gpr, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0x66), width.rex_w(), &[0x0F, 0x7E], src, Rm::Reg(dst.code()), &[])
    }

    // ------------------------------------------------------------------
    // SSE 标量浮点
    // ------------------------------------------------------------------

    /// addsd/subsd/... dst, src（只写低位元素）
    pub fn scalar(&mut self, op: ScalarOp, precision: Precision, dst: Xmm, src: Xmm) -> Result<(), EmitError> {
        self.sse(
            Some(precision.scalar_prefix()),
            false,
            &[0x0F, op as u8],
            dst,
            Rm::Reg(src),
            &[],
        )
    }

    /// 第二操作数来自内存的标量运算
    pub fn scalar_mem(&mut self, op: ScalarOp, precision: Precision, dst: Xmm, src: Mem) -> Result<(), EmitError> {
        self.sse(
            Some(precision.scalar_prefix()),
            false,
            &[0x0F, op as u8],
            dst,
            Rm::Mem(src),
            &[],
        )
    }

    /// ucomisd (66 0F 2E) / ucomiss (0F 2E)
    pub fn ucomis(&mut self, precision: Precision, a: Xmm, b: Xmm) -> Result<(), EmitError> {
        let prefix = match precision {
            Precision::Double => Some(0x66),
            Precision::Single => None,
        };
        self.sse(prefix, false, &[0x0F, 0x2E], a, Rm::Reg(b), &[])
    }

    /// comisd (66 0F 2F) / comiss (0F 2F)，对 QNaN 也报告无效操作
    pub fn comis(&mut self, precision: Precision, a: Xmm, b: Xmm) -> Result<(), EmitError> {
        let prefix = match precision {
            Precision::Double => Some(0x66),
            Precision::Single => None,
        };
        self.sse(prefix, false, &[0x0F, 0x2F], a, Rm::Reg(b), &[])
    }

    /// cvtsi2sd/cvtsi2ss xmm, r32/r64
    pub fn cvt_int_to_fp(&mut self, precision: Precision, width: Width, dst: Xmm, src: Gpr) -> Result<(), EmitError> {
        self.sse(
            Some(precision.scalar_prefix()),
            width.rex_w(),
            &[0x0F, 0x2A],
            dst,
            Rm::Reg(src.code()),
            &[],
        )
    }

    /// cvttsd2si/cvttss2si r32/r64, xmm（向零截断）
    pub fn cvt_fp_to_int_trunc(&mut self, precision: Precision, width: Width, dst: Gpr, src: Xmm) -> Result<(), EmitError> {
        self.sse(
            Some(precision.scalar_prefix()),
            width.rex_w(),
            &[0x0F, 0x2C],
            dst.code(),
            Rm::Reg(src),
            &[],
        )
    }

    /// cvtsd2ss（from = Double）或 cvtss2sd（from = Single）
    pub fn cvt_precision(&mut self, from: Precision, dst: Xmm, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(from.scalar_prefix()), false, &[0x0F, 0x5A], dst, Rm::Reg(src), &[])
    }

    /// roundsd/roundss（SSE4.1）
    pub fn round(&mut self, precision: Precision, dst: Xmm, src: Xmm, mode: u8) -> Result<(), EmitError> {
        let op = match precision {
            Precision::Single => 0x0A,
            Precision::Double => 0x0B,
        };
        self.sse(Some(0x66), false, &[0x0F, 0x3A, op], dst, Rm::Reg(src), &[mode])
    }

    // ------------------------------------------------------------------
    // SSE 打包整数
    // ------------------------------------------------------------------

    pub fn packed(&mut self, op: PackedOp, dst: Xmm, src: Xmm) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, op.opcode(), dst, Rm::Reg(src), &[])
    }

    pub fn packed_shift(&mut self, op: PackedShift, dst: Xmm, amount: u8) -> Result<(), EmitError> {
        let (opcode, digit) = op.encoding();
        self.sse(Some(0x66), false, &[0x0F, opcode], digit, Rm::Reg(dst), &[amount])
    }

    /// palignr dst, src, imm（SSSE3）：dst = (dst:src) >> imm*8
    pub fn palignr(&mut self, dst: Xmm, src: Xmm, bytes: u8) -> Result<(), EmitError> {
        self.sse(Some(0x66), false, &[0x0F, 0x3A, 0x0F], dst, Rm::Reg(src), &[bytes])
    }

    /// pinsrb/pinsrw/pinsrd/pinsrq；`lane_bytes` 为元素字节数
    pub fn pinsr(&mut self, lane_bytes: usize, dst: Xmm, src: Gpr, index: u8) -> Result<(), EmitError> {
        let reg = dst;
        let rm = Rm::Reg(src.code());
        match lane_bytes {
            1 => self.sse(Some(0x66), false, &[0x0F, 0x3A, 0x20], reg, rm, &[index]),
            2 => self.sse(Some(0x66), false, &[0x0F, 0xC4], reg, rm, &[index]),
            4 => self.sse(Some(0x66), false, &[0x0F, 0x3A, 0x22], reg, rm, &[index]),
            _ => self.sse(Some(0x66), true, &[0x0F, 0x3A, 0x22], reg, rm, &[index]),
        }
    }

    /// pextrb/pextrw/pextrd/pextrq，结果零扩展
    pub fn pextr(&mut self, lane_bytes: usize, dst: Gpr, src: Xmm, index: u8) -> Result<(), EmitError> {
        match lane_bytes {
            1 => self.sse(Some(0x66), false, &[0x0F, 0x3A, 0x14], src, Rm::Reg(dst.code()), &[index]),
            2 => self.sse(Some(0x66), false, &[0x0F, 0xC5], dst.code(), Rm::Reg(src), &[index]),
            4 => self.sse(Some(0x66), false, &[0x0F, 0x3A, 0x16], src, Rm::Reg(dst.code()), &[index]),
            _ => self.sse(Some(0x66), true, &[0x0F, 0x3A, 0x16], src, Rm::Reg(dst.code()), &[index]),
        }
    }

    // ------------------------------------------------------------------
    // VEX 融合乘加
    // ------------------------------------------------------------------

    /// vfm*{213,231}s{s,d} dst, src2, src3
    pub fn fma(
        &mut self,
        op: FmaOp,
        form: FmaForm,
        precision: Precision,
        dst: Xmm,
        src2: Xmm,
        src3: Xmm,
    ) -> Result<(), EmitError> {
        let base = match form {
            FmaForm::F213 => 0xA9,
            FmaForm::F231 => 0xB9,
        };
        let opcode = base
            + match op {
                FmaOp::Madd => 0,
                FmaOp::Msub => 2,
                FmaOp::Nmadd => 4,
                FmaOp::Nmsub => 6,
            };
        let r = (dst >> 3) & 1;
        let b = (src3 >> 3) & 1;
        // 0F38 映射，X 位恒为 1（无变址寄存器）
        let byte1 = ((r ^ 1) << 7) | (1 << 6) | ((b ^ 1) << 5) | 0x02;
        let w = u8::from(precision == Precision::Double);
        // L=0，pp=01 (66)
        let byte2 = (w << 7) | ((!src2 & 0xF) << 3) | 0x01;
        let modrm = 0xC0 | ((dst & 7) << 3) | (src3 & 7);
        self.emit_bytes(&[0xC4, byte1, byte2, opcode, modrm])
    }

    // ------------------------------------------------------------------
    // 临时 XMM 保存
    // ------------------------------------------------------------------

    /// 把 `reg` 压栈保存，配合 [`Emitter::unspill_xmm`] 使用
    pub fn spill_xmm(&mut self, reg: Xmm) -> Result<(), EmitError> {
        self.alu_ri(Alu::Sub, Width::W64, Gpr::Rsp, 16)?;
        self.movdqu_store(Mem::stack(), reg)
    }

    pub fn unspill_xmm(&mut self, reg: Xmm) -> Result<(), EmitError> {
        self.movdqu_load(reg, Mem::stack())?;
        self.alu_ri(Alu::Add, Width::W64, Gpr::Rsp, 16)
    }
}

/// 选择一个不与 `avoid` 冲突的 XMM 作为临时寄存器（从 xmm15 向下找）
pub fn scratch_xmm(avoid: &[Xmm]) -> Xmm {
    (0..16u8).rev().find(|x| !avoid.contains(x)).unwrap_or(15)
}
