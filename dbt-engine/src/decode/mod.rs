//! 指令解码与分发
//!
//! 每个指令族是一张静态的 [`Pattern`] 表，按 `(encoding & mask) == value`
//! 顺序匹配。表内与表间的模式互斥，顺序只影响查找速度。
//!
//! 同一个解码结果有两种执行方式（[`ExecTarget`]）：
//! - `Interpret`：直接修改 [`CpuContext`]，通过 [`GuestMemory`] 访存；
//! - `Emit`：向 [`Emitter`] 追加 x86-64 代码。失败时发射器被回退到指令开始前
//!   的长度，不会留下半条指令。
//!
//! 两种执行方式必须语义一致。

pub mod arith;
pub mod branch;
pub mod compare;
pub mod convert;
pub mod fields;
pub mod flags;
pub mod fp;
pub mod loadstore;
pub(crate) mod nan;
pub mod vector;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{trace, warn};
use serde::Serialize;
use thiserror::Error;

use dbt_core::save_area::offsets;
use dbt_core::{BlockExit, CpuContext, GuestAddr, GuestMemory, MemoryFault, Reg31, RoundingMode, VectorAliasPolicy};

use crate::emit::x86::{Alu, Gpr, Mem, Precision, Width, Xmm};
use crate::emit::{EmitError, Emitter, HostFeatures, gpr_slot, host_xmm, is_aliased};

pub use flags::{COND_TABLE, CarryMode, HostCond};

/// 分发错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// 不属于该指令族（或任何指令族）
    #[error("encoding {encoding:#010x} not matched")]
    NotMatched { encoding: u32 },

    /// 匹配到指令组但编码未分配
    #[error("unallocated encoding {encoding:#010x} in {mnemonic}")]
    Unallocated { encoding: u32, mnemonic: &'static str },

    /// 已识别但当前执行方式不支持
    #[error("{mnemonic}: {reason}")]
    Unimplemented { mnemonic: &'static str, reason: &'static str },

    /// 客户机向量寄存器与另一个寄存器共用宿主 XMM
    #[error("vector register v{reg} aliases host xmm{host}")]
    AliasedVectorRegister { reg: u8, host: u8 },

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Memory(#[from] MemoryFault),
}

impl DispatchError {
    /// 该错误是否应当交给解释器处理该指令
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            DispatchError::NotMatched { .. }
                | DispatchError::Unimplemented { .. }
                | DispatchError::AliasedVectorRegister { .. }
        )
    }
}

pub(crate) fn unimplemented(mnemonic: &'static str, reason: &'static str) -> DispatchError {
    DispatchError::Unimplemented { mnemonic, reason }
}

pub(crate) fn unallocated(encoding: u32, mnemonic: &'static str) -> DispatchError {
    DispatchError::Unallocated { encoding, mnemonic }
}

/// 一条解码模式
pub struct Pattern<Op> {
    pub mask: u32,
    pub value: u32,
    pub mnemonic: &'static str,
    pub decode: fn(u32) -> Result<Op, DispatchError>,
}

impl<Op> Pattern<Op> {
    #[inline]
    pub const fn matches(&self, encoding: u32) -> bool {
        encoding & self.mask == self.value
    }
}

impl<Op> fmt::Debug for Pattern<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("mask", &format_args!("{:#010x}", self.mask))
            .field("value", &format_args!("{:#010x}", self.value))
            .field("mnemonic", &self.mnemonic)
            .finish()
    }
}

/// 与操作类型无关的模式描述，用于检查表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatternInfo {
    pub family: Family,
    pub mask: u32,
    pub value: u32,
    pub mnemonic: &'static str,
}

/// 指令执行后的控制流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Control {
    /// 顺序执行下一条
    Continue,
    /// 目标在翻译时已知
    Direct {
        taken: GuestAddr,
        /// 条件分支不成立时的下一条地址
        fallthrough: Option<GuestAddr>,
    },
    /// 目标来自寄存器
    Indirect,
}

impl Control {
    /// 是否结束基本块
    pub const fn ends_block(&self) -> bool {
        !matches!(self, Control::Continue)
    }

    /// 翻译时已知的后继
    pub fn successors(&self) -> impl Iterator<Item = GuestAddr> {
        let (a, b) = match *self {
            Control::Direct { taken, fallthrough } => (Some(taken), fallthrough),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

/// 发射选项
#[derive(Debug, Default)]
pub struct EmitOptions {
    pub features: HostFeatures,
    pub alias_policy: VectorAliasPolicy,
    alias_hits: AtomicU64,
}

impl EmitOptions {
    pub fn new(features: HostFeatures, alias_policy: VectorAliasPolicy) -> Self {
        Self {
            features,
            alias_policy,
            alias_hits: AtomicU64::new(0),
        }
    }

    /// 按别名策略发射过的寄存器引用次数
    pub fn alias_hits(&self) -> u64 {
        self.alias_hits.load(Ordering::Relaxed)
    }

    /// 把客户机向量寄存器映射到宿主 XMM，V16–V31 按别名策略处理
    pub(crate) fn vreg(&self, reg: u8) -> Result<Xmm, DispatchError> {
        let host = host_xmm(reg);
        if is_aliased(reg) {
            match self.alias_policy {
                VectorAliasPolicy::Reject => {
                    return Err(DispatchError::AliasedVectorRegister { reg, host });
                }
                VectorAliasPolicy::Alias => {
                    warn!("guest v{reg} aliased onto host xmm{host}");
                    self.alias_hits.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(host)
    }

    pub(crate) fn require(&self, available: bool, mnemonic: &'static str, reason: &'static str) -> Result<(), DispatchError> {
        if available {
            Ok(())
        } else {
            Err(unimplemented(mnemonic, reason))
        }
    }
}

/// 分发目标
pub enum ExecTarget<'a> {
    Interpret {
        ctx: &'a mut CpuContext,
        mem: &'a dyn GuestMemory,
    },
    Emit {
        emitter: &'a mut Emitter,
        options: &'a EmitOptions,
    },
}

/// 成功处理一条指令的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled {
    pub family: Family,
    pub mnemonic: &'static str,
    pub control: Control,
    /// 发射的字节数（解释执行时为 0）
    pub emitted: usize,
}

/// 指令族的实现
pub(crate) trait FamilyImpl {
    type Op: Copy + fmt::Debug + 'static;

    const FAMILY: Family;

    fn patterns() -> &'static [Pattern<Self::Op>];

    fn control(op: &Self::Op, pc: GuestAddr) -> Control;

    /// 执行；返回 `Some(target)` 表示改写 PC
    fn interpret(
        op: &Self::Op,
        pc: GuestAddr,
        ctx: &mut CpuContext,
        mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError>;

    fn emit(op: &Self::Op, pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError>;
}

fn run<F: FamilyImpl>(encoding: u32, pc: GuestAddr, target: &mut ExecTarget<'_>) -> Result<Handled, DispatchError> {
    let pattern = F::patterns()
        .iter()
        .find(|p| p.matches(encoding))
        .ok_or(DispatchError::NotMatched { encoding })?;
    let op = (pattern.decode)(encoding)?;
    let control = F::control(&op, pc);

    let emitted = match target {
        ExecTarget::Interpret { ctx, mem } => {
            let next = F::interpret(&op, pc, ctx, *mem)?;
            ctx.set_pc(next.unwrap_or_else(|| pc.wrapping_add(4)));
            0
        }
        ExecTarget::Emit { emitter, options } => {
            let start = emitter.len();
            if let Err(e) = F::emit(&op, pc, emitter, options) {
                emitter.truncate(start);
                return Err(e);
            }
            emitter.len() - start
        }
    };

    trace!("{pc:#x}: {encoding:08x} {} {op:?}", pattern.mnemonic);
    Ok(Handled {
        family: F::FAMILY,
        mnemonic: pattern.mnemonic,
        control,
        emitted,
    })
}

fn infos<Op: 'static>(family: Family, patterns: &'static [Pattern<Op>]) -> Vec<PatternInfo> {
    patterns
        .iter()
        .map(|p| PatternInfo {
            family,
            mask: p.mask,
            value: p.value,
            mnemonic: p.mnemonic,
        })
        .collect()
}

/// 指令族，按分发顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    Branch,
    LoadStore,
    Arithmetic,
    Compare,
    Convert,
    FloatingPoint,
    Vector,
}

impl Family {
    pub const ALL: [Family; 7] = [
        Family::Branch,
        Family::LoadStore,
        Family::Arithmetic,
        Family::Compare,
        Family::Convert,
        Family::FloatingPoint,
        Family::Vector,
    ];

    pub fn dispatch(self, encoding: u32, pc: GuestAddr, target: &mut ExecTarget<'_>) -> Result<Handled, DispatchError> {
        match self {
            Family::Branch => run::<branch::BranchFamily>(encoding, pc, target),
            Family::LoadStore => run::<loadstore::LoadStoreFamily>(encoding, pc, target),
            Family::Arithmetic => run::<arith::ArithFamily>(encoding, pc, target),
            Family::Compare => run::<compare::CompareFamily>(encoding, pc, target),
            Family::Convert => run::<convert::ConvertFamily>(encoding, pc, target),
            Family::FloatingPoint => run::<fp::FpFamily>(encoding, pc, target),
            Family::Vector => run::<vector::VectorFamily>(encoding, pc, target),
        }
    }

    pub fn patterns(self) -> Vec<PatternInfo> {
        match self {
            Family::Branch => infos(self, branch::PATTERNS),
            Family::LoadStore => infos(self, loadstore::PATTERNS),
            Family::Arithmetic => infos(self, arith::PATTERNS),
            Family::Compare => infos(self, compare::PATTERNS),
            Family::Convert => infos(self, convert::PATTERNS),
            Family::FloatingPoint => infos(self, fp::PATTERNS),
            Family::Vector => infos(self, vector::PATTERNS),
        }
    }
}

/// 依次尝试各指令族
#[derive(Debug, Clone)]
pub struct Dispatcher {
    families: Vec<Family>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_families(&Family::ALL)
    }

    pub fn with_families(families: &[Family]) -> Self {
        Self {
            families: families.to_vec(),
        }
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// 全部模式，按分发顺序
    pub fn patterns(&self) -> Vec<PatternInfo> {
        self.families.iter().flat_map(|f| f.patterns()).collect()
    }

    pub fn dispatch(&self, encoding: u32, pc: GuestAddr, target: &mut ExecTarget<'_>) -> Result<Handled, DispatchError> {
        for family in &self.families {
            match family.dispatch(encoding, pc, target) {
                Err(DispatchError::NotMatched { .. }) => continue,
                other => return other,
            }
        }
        Err(DispatchError::NotMatched { encoding })
    }

    pub fn interpret(
        &self,
        encoding: u32,
        pc: GuestAddr,
        ctx: &mut CpuContext,
        mem: &dyn GuestMemory,
    ) -> Result<Handled, DispatchError> {
        self.dispatch(encoding, pc, &mut ExecTarget::Interpret { ctx, mem })
    }

    pub fn emit(
        &self,
        encoding: u32,
        pc: GuestAddr,
        emitter: &mut Emitter,
        options: &EmitOptions,
    ) -> Result<Handled, DispatchError> {
        self.dispatch(encoding, pc, &mut ExecTarget::Emit { emitter, options })
    }
}

// ----------------------------------------------------------------------
// 各指令族共用的发射片段
// ----------------------------------------------------------------------

/// 读取客户机通用寄存器到 `dst`；零寄存器发射 `xor dst, dst`
pub(crate) fn load_gpr(em: &mut Emitter, width: Width, dst: Gpr, reg: u8, r31: Reg31) -> Result<(), EmitError> {
    match gpr_slot(reg, r31) {
        Some(disp) => em.load(width, dst, Mem::area(disp)),
        None => em.alu_rr(Alu::Xor, Width::W32, dst, dst),
    }
}

/// 把 `src` 的 64 位写回客户机寄存器；零寄存器不发射任何指令
pub(crate) fn store_gpr(em: &mut Emitter, reg: u8, r31: Reg31, src: Gpr) -> Result<(), EmitError> {
    match gpr_slot(reg, r31) {
        Some(disp) => em.store(Width::W64, Mem::area(disp), src),
        None => Ok(()),
    }
}

/// 写回下一条 PC 并返回调度器
pub fn emit_exit(em: &mut Emitter, next_pc: GuestAddr) -> Result<(), EmitError> {
    em.mov_imm64(Gpr::Rax, next_pc)?;
    em.store(Width::W64, Mem::area(offsets::PC as i32), Gpr::Rax)?;
    em.ret()
}

/// 侧出口：PC 停在 `pc`，由解释器执行这条指令
///
/// 调用点不能处于 XMM 溢出期间（栈上不能有未弹出的数据）。
pub(crate) fn emit_side_exit(em: &mut Emitter, pc: GuestAddr) -> Result<(), EmitError> {
    em.mov_imm64(Gpr::Rax, pc)?;
    em.store(Width::W64, Mem::area(offsets::PC as i32), Gpr::Rax)?;
    em.store_imm32(Width::W32, Mem::area(offsets::EXIT as i32), BlockExit::Interpret.code() as i32)?;
    em.ret()
}

/// 置位 FPSR 累积标志，经 EAX，会改写标志位
pub(crate) fn emit_raise_fpsr(em: &mut Emitter, bits: u32) -> Result<(), EmitError> {
    let fpsr = Mem::area(offsets::FPSR as i32);
    em.load(Width::W32, Gpr::Rax, fpsr)?;
    em.alu_ri(Alu::Or, Width::W32, Gpr::Rax, bits as i32)?;
    em.store(Width::W32, fpsr, Gpr::Rax)
}

/// 标量写回后清零寄存器其余位
pub(crate) fn clear_upper(em: &mut Emitter, precision: Precision, reg: Xmm) -> Result<(), EmitError> {
    match precision {
        Precision::Double => em.movq_xx(reg, reg),
        Precision::Single => {
            em.mov_from_xmm(Width::W32, Gpr::Rax, reg)?;
            em.mov_to_xmm(Width::W32, reg, Gpr::Rax)
        }
    }
}

/// 解释执行的浮点运算只支持就近舍入
pub(crate) fn require_nearest(ctx: &CpuContext, mnemonic: &'static str) -> Result<(), DispatchError> {
    if ctx.rounding_mode() == RoundingMode::Nearest {
        Ok(())
    } else {
        Err(unimplemented(mnemonic, "FPCR rounding mode other than round-to-nearest"))
    }
}
