//! 标量浮点数据处理
//!
//! 双源：FMUL/FDIV/FADD/FSUB/FMAX/FMIN/FMAXNM/FMINNM/FNMUL；单源：FMOV/FABS/FNEG/FSQRT；
//! FMOV（立即数）；三源：FMADD/FMSUB/FNMADD/FNMSUB。
//!
//! 标量写入会清零目标寄存器其余位，发射的代码在 SSE 标量指令之后补一次清零。
//! NaN 输入与无效结果按 [`super::nan`] 的规则处理。

use std::ops::{Add, Div, Mul, Neg, Sub};

use dbt_core::{CpuContext, GuestAddr, GuestMemory, Vector128};

use super::fields::{bit, bits, expand_fp_imm32, expand_fp_imm64, ra, rd, rm, rn};
use super::nan::{FloatBits, check_invalid, emit_default_nan_if_invalid, emit_nan_inputs_exit, process_nans};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, clear_upper, require_nearest, unallocated,
    unimplemented,
};
use dbt_core::context::FPSR_IOC;
use crate::emit::x86::{Alu, FmaForm, FmaOp, Gpr, Mem, Precision, ScalarOp, Width, Xmm};
use crate::emit::Emitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpBinOp {
    Mul,
    Div,
    Add,
    Sub,
    Max,
    Min,
    MaxNm,
    MinNm,
    Nmul,
}

impl FpBinOp {
    fn mnemonic(self) -> &'static str {
        match self {
            FpBinOp::Mul => "FMUL",
            FpBinOp::Div => "FDIV",
            FpBinOp::Add => "FADD",
            FpBinOp::Sub => "FSUB",
            FpBinOp::Max => "FMAX",
            FpBinOp::Min => "FMIN",
            FpBinOp::MaxNm => "FMAXNM",
            FpBinOp::MinNm => "FMINNM",
            FpBinOp::Nmul => "FNMUL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpUnOp {
    Mov,
    Abs,
    Neg,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedOp {
    /// a + n*m
    Madd,
    /// a + (-n)*m
    Msub,
    /// (-a) + (-n)*m
    Nmadd,
    /// (-a) + n*m
    Nmsub,
}

impl FusedOp {
    fn mnemonic(self) -> &'static str {
        match self {
            FusedOp::Madd => "FMADD",
            FusedOp::Msub => "FMSUB",
            FusedOp::Nmadd => "FNMADD",
            FusedOp::Nmsub => "FNMSUB",
        }
    }

    /// 对应的 x86 FMA 运算（宿主形式为 ±(x*y) ± z）
    fn host(self) -> FmaOp {
        match self {
            FusedOp::Madd => FmaOp::Madd,
            FusedOp::Msub => FmaOp::Nmadd,
            FusedOp::Nmadd => FmaOp::Nmsub,
            FusedOp::Nmsub => FmaOp::Msub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Binary {
        op: FpBinOp,
        precision: Precision,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    Unary {
        op: FpUnOp,
        precision: Precision,
        rd: u8,
        rn: u8,
    },
    /// FMOV（立即数），`bits` 为展开后的位模式
    MovImm { precision: Precision, rd: u8, bits: u64 },
    Fused {
        op: FusedOp,
        precision: Precision,
        rd: u8,
        rn: u8,
        rm: u8,
        ra: u8,
    },
}

fn precision(encoding: u32, mnemonic: &'static str) -> Result<Precision, DispatchError> {
    match bits(encoding, 22, 2) {
        0 => Ok(Precision::Single),
        1 => Ok(Precision::Double),
        3 => Err(unimplemented(mnemonic, "half-precision operands")),
        _ => Err(unallocated(encoding, mnemonic)),
    }
}

fn decode_binary(encoding: u32) -> Result<FpOp, DispatchError> {
    let op = match bits(encoding, 12, 4) {
        0 => FpBinOp::Mul,
        1 => FpBinOp::Div,
        2 => FpBinOp::Add,
        3 => FpBinOp::Sub,
        4 => FpBinOp::Max,
        5 => FpBinOp::Min,
        6 => FpBinOp::MaxNm,
        7 => FpBinOp::MinNm,
        8 => FpBinOp::Nmul,
        _ => return Err(unallocated(encoding, "FP data-processing (2 source)")),
    };
    Ok(FpOp::Binary {
        op,
        precision: precision(encoding, op.mnemonic())?,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_unary(encoding: u32) -> Result<FpOp, DispatchError> {
    let op = match bits(encoding, 15, 2) {
        0 => FpUnOp::Mov,
        1 => FpUnOp::Abs,
        2 => FpUnOp::Neg,
        _ => FpUnOp::Sqrt,
    };
    Ok(FpOp::Unary {
        op,
        precision: precision(encoding, "FP data-processing (1 source)")?,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_mov_imm(encoding: u32) -> Result<FpOp, DispatchError> {
    let precision = precision(encoding, "FMOV (immediate)")?;
    let imm8 = bits(encoding, 13, 8) as u8;
    let bits = match precision {
        Precision::Double => expand_fp_imm64(imm8),
        Precision::Single => u64::from(expand_fp_imm32(imm8)),
    };
    Ok(FpOp::MovImm {
        precision,
        rd: rd(encoding),
        bits,
    })
}

fn decode_fused(encoding: u32) -> Result<FpOp, DispatchError> {
    let op = match (bit(encoding, 21), bit(encoding, 15)) {
        (false, false) => FusedOp::Madd,
        (false, true) => FusedOp::Msub,
        (true, false) => FusedOp::Nmadd,
        (true, true) => FusedOp::Nmsub,
    };
    Ok(FpOp::Fused {
        op,
        precision: precision(encoding, op.mnemonic())?,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
        ra: ra(encoding),
    })
}

pub static PATTERNS: &[Pattern<FpOp>] = &[
    Pattern { mask: 0xFF20_0C00, value: 0x1E20_0800, mnemonic: "FP data-processing (2 source)", decode: decode_binary },
    Pattern { mask: 0xFF3E_7C00, value: 0x1E20_4000, mnemonic: "FP data-processing (1 source)", decode: decode_unary },
    Pattern { mask: 0xFF20_1FE0, value: 0x1E20_1000, mnemonic: "FMOV (immediate)", decode: decode_mov_imm },
    Pattern { mask: 0xFF00_0000, value: 0x1F00_0000, mnemonic: "FP data-processing (3 source)", decode: decode_fused },
];

pub(crate) struct FpFamily;

// ----------------------------------------------------------------------
// 解释执行
// ----------------------------------------------------------------------

trait Scalar:
    FloatBits
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn is_sign_negative(self) -> bool;
    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn mul_add(self, a: Self, b: Self) -> Self;
    fn read(ctx: &CpuContext, reg: u8) -> Self;
    fn write(ctx: &mut CpuContext, reg: u8, value: Self);
}

macro_rules! impl_scalar {
    ($t:ty, $read:ident, $write:ident) => {
        impl Scalar for $t {
            fn is_sign_negative(self) -> bool {
                <$t>::is_sign_negative(self)
            }

            fn abs(self) -> Self {
                <$t>::abs(self)
            }

            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }

            fn mul_add(self, a: Self, b: Self) -> Self {
                <$t>::mul_add(self, a, b)
            }

            fn read(ctx: &CpuContext, reg: u8) -> Self {
                ctx.$read(reg)
            }

            fn write(ctx: &mut CpuContext, reg: u8, value: Self) {
                ctx.$write(reg, value)
            }
        }
    };
}

impl_scalar!(f32, s, set_s);
impl_scalar!(f64, d, set_d);

/// FMAX/FMIN 的数值部分（NaN 已处理）：+0 大于 -0
fn max_min<T: Scalar>(a: T, b: T, max: bool) -> T {
    if a == b {
        // 只有 ±0 需要区分
        return if a.is_sign_negative() == max { b } else { a };
    }
    if (a > b) == max { a } else { b }
}

fn eval_binary<T: Scalar>(ctx: &mut CpuContext, op: FpBinOp, a: T, b: T) -> T {
    let (a, b) = match op {
        // 只有一个静默 NaN 时取另一个操作数；信号 NaN 照常传播
        FpBinOp::MaxNm | FpBinOp::MinNm => match (a.is_quiet_nan(), b.is_quiet_nan()) {
            (true, false) => (b, b),
            (false, true) => (a, a),
            _ => (a, b),
        },
        _ => (a, b),
    };
    let value = match process_nans(ctx, &[a, b]) {
        Some(nan) => nan,
        None => {
            let value = match op {
                FpBinOp::Mul | FpBinOp::Nmul => a * b,
                FpBinOp::Div => a / b,
                FpBinOp::Add => a + b,
                FpBinOp::Sub => a - b,
                FpBinOp::Max | FpBinOp::MaxNm => max_min(a, b, true),
                FpBinOp::Min | FpBinOp::MinNm => max_min(a, b, false),
            };
            check_invalid(ctx, value)
        }
    };
    // FNMUL 对结果取反，NaN 也一样
    if op == FpBinOp::Nmul { -value } else { value }
}

fn eval_unary<T: Scalar>(ctx: &mut CpuContext, op: FpUnOp, a: T) -> T {
    match op {
        FpUnOp::Mov => a,
        FpUnOp::Abs => a.abs(),
        FpUnOp::Neg => -a,
        FpUnOp::Sqrt => match process_nans(ctx, &[a]) {
            Some(nan) => nan,
            None => check_invalid(ctx, a.sqrt()),
        },
    }
}

/// 先对操作数取反再做一次舍入的乘加，NaN 按 a、n、m 的顺序挑选
fn eval_fused<T: Scalar>(ctx: &mut CpuContext, op: FusedOp, n: T, m: T, a: T) -> T {
    let (n, a) = match op {
        FusedOp::Madd => (n, a),
        FusedOp::Msub => (-n, a),
        FusedOp::Nmadd => (-n, -a),
        FusedOp::Nmsub => (n, -a),
    };
    if let Some(nan) = process_nans(ctx, &[a, n, m]) {
        let inf_times_zero = (n.is_infinite() && m.is_zero()) || (n.is_zero() && m.is_infinite());
        if a.is_quiet_nan() && inf_times_zero {
            ctx.raise_fp_exception(FPSR_IOC);
            return T::DEFAULT_NAN;
        }
        return nan;
    }
    check_invalid(ctx, n.mul_add(m, a))
}

fn interpret_as<T: Scalar>(op: &FpOp, ctx: &mut CpuContext) -> Result<(), DispatchError> {
    match *op {
        FpOp::Binary { op, rd, rn, rm, .. } => {
            let (a, b) = (T::read(ctx, rn), T::read(ctx, rm));
            let value = eval_binary(ctx, op, a, b);
            T::write(ctx, rd, value);
        }
        FpOp::Unary { op, rd, rn, .. } => {
            let a = T::read(ctx, rn);
            let value = eval_unary(ctx, op, a);
            T::write(ctx, rd, value);
        }
        FpOp::MovImm { rd, bits, .. } => ctx.set_v(rd, Vector128::new(bits, 0)),
        FpOp::Fused { op, rd, rn, rm, ra, .. } => {
            let (n, m, a) = (T::read(ctx, rn), T::read(ctx, rm), T::read(ctx, ra));
            let value = eval_fused(ctx, op, n, m, a);
            T::write(ctx, rd, value);
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// 发射
// ----------------------------------------------------------------------

const fn sign_width(precision: Precision) -> Width {
    match precision {
        Precision::Double => Width::W64,
        Precision::Single => Width::W32,
    }
}

/// 经 RAX 修改符号位：`clear` 为 true 时清除（FABS），否则翻转（FNEG/FNMUL）
fn emit_sign(em: &mut Emitter, precision: Precision, d: Xmm, n: Xmm, clear: bool) -> Result<(), DispatchError> {
    let width = sign_width(precision);
    let sign = (width.bits() - 1) as u8;
    em.mov_from_xmm(width, Gpr::Rax, n)?;
    if clear {
        em.btr_ri(width, Gpr::Rax, sign)?;
    } else {
        em.btc_ri(width, Gpr::Rax, sign)?;
    }
    em.mov_to_xmm(width, d, Gpr::Rax)?;
    Ok(())
}

fn emit_binary(
    em: &mut Emitter,
    pc: GuestAddr,
    op: FpBinOp,
    precision: Precision,
    (d, n, m): (Xmm, Xmm, Xmm),
) -> Result<(), DispatchError> {
    let host = match op {
        FpBinOp::Add => ScalarOp::Add,
        FpBinOp::Sub => ScalarOp::Sub,
        FpBinOp::Mul | FpBinOp::Nmul => ScalarOp::Mul,
        FpBinOp::Div => ScalarOp::Div,
        // x86 maxsd/minsd 对 NaN 与 ±0 的处理与客户机不同
        FpBinOp::Max | FpBinOp::Min | FpBinOp::MaxNm | FpBinOp::MinNm => {
            return Err(unimplemented(op.mnemonic(), "host min/max differ on NaN and signed zero"));
        }
    };
    emit_nan_inputs_exit(em, pc, precision, &[n, m])?;
    if d == m && d != n {
        // movapd d, n 会覆盖 m，先把 m 压栈
        em.spill_xmm(m)?;
        em.movapd(d, n)?;
        em.scalar_mem(host, precision, d, Mem::stack())?;
        em.alu_ri(Alu::Add, Width::W64, Gpr::Rsp, 16)?;
    } else {
        em.movapd(d, n)?;
        em.scalar(host, precision, d, m)?;
    }
    clear_upper(em, precision, d)?;
    emit_default_nan_if_invalid(em, precision, d)?;
    if op == FpBinOp::Nmul {
        emit_sign(em, precision, d, d, false)?;
    }
    Ok(())
}

fn emit_fused(
    em: &mut Emitter,
    pc: GuestAddr,
    op: FusedOp,
    precision: Precision,
    (d, n, m, a): (Xmm, Xmm, Xmm, Xmm),
) -> Result<(), DispatchError> {
    let host = op.host();
    emit_nan_inputs_exit(em, pc, precision, &[a, n, m])?;
    if d == a {
        em.fma(host, FmaForm::F231, precision, d, n, m)?;
    } else if d == n {
        em.fma(host, FmaForm::F213, precision, d, m, a)?;
    } else if d == m {
        em.fma(host, FmaForm::F213, precision, d, n, a)?;
    } else {
        em.movapd(d, a)?;
        em.fma(host, FmaForm::F231, precision, d, n, m)?;
    }
    clear_upper(em, precision, d)?;
    emit_default_nan_if_invalid(em, precision, d)?;
    Ok(())
}

impl FamilyImpl for FpFamily {
    type Op = FpOp;

    const FAMILY: Family = Family::FloatingPoint;

    fn patterns() -> &'static [Pattern<FpOp>] {
        PATTERNS
    }

    fn control(_op: &FpOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &FpOp,
        _pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        let precision = match *op {
            FpOp::Binary { op: bin, precision, .. } => {
                require_nearest(ctx, bin.mnemonic())?;
                precision
            }
            FpOp::Unary { op: FpUnOp::Sqrt, precision, .. } => {
                require_nearest(ctx, "FSQRT")?;
                precision
            }
            FpOp::Fused { op: fused, precision, .. } => {
                require_nearest(ctx, fused.mnemonic())?;
                precision
            }
            FpOp::Unary { precision, .. } | FpOp::MovImm { precision, .. } => precision,
        };
        match precision {
            Precision::Double => interpret_as::<f64>(op, ctx)?,
            Precision::Single => interpret_as::<f32>(op, ctx)?,
        }
        Ok(None)
    }

    fn emit(op: &FpOp, pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            FpOp::Binary { op, precision, rd, rn, rm } => {
                let regs = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                emit_binary(em, pc, op, precision, regs)?;
            }
            FpOp::Unary { op, precision, rd, rn } => {
                let d = options.vreg(rd)?;
                let n = options.vreg(rn)?;
                match op {
                    FpUnOp::Mov => match precision {
                        Precision::Double => em.movq_xx(d, n)?,
                        Precision::Single => {
                            em.mov_from_xmm(Width::W32, Gpr::Rax, n)?;
                            em.mov_to_xmm(Width::W32, d, Gpr::Rax)?;
                        }
                    },
                    FpUnOp::Abs => emit_sign(em, precision, d, n, true)?,
                    FpUnOp::Neg => emit_sign(em, precision, d, n, false)?,
                    FpUnOp::Sqrt => {
                        emit_nan_inputs_exit(em, pc, precision, &[n])?;
                        em.scalar(ScalarOp::Sqrt, precision, d, n)?;
                        clear_upper(em, precision, d)?;
                        emit_default_nan_if_invalid(em, precision, d)?;
                    }
                }
            }
            FpOp::MovImm { precision, rd, bits } => {
                let d = options.vreg(rd)?;
                em.mov_imm64(Gpr::Rax, bits)?;
                em.mov_to_xmm(sign_width(precision), d, Gpr::Rax)?;
            }
            FpOp::Fused { op, precision, rd, rn, rm, ra } => {
                options.require(options.features.fma, op.mnemonic(), "host lacks FMA3")?;
                let regs = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?, options.vreg(ra)?);
                emit_fused(em, pc, op, precision, regs)?;
            }
        }
        Ok(())
    }
}
