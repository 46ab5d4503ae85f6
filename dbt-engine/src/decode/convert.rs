//! 整数与浮点之间的转换：SCVTF/UCVTF、FCVTZS/FCVTZU、FMOV（通用寄存器）、
//! FCVT、FRINT*
//!
//! 发射的 FCVT/FRINT 遇到 NaN 输入、FCVTZS 遇到不可表示的输入时走侧出口，
//! FPSR 由解释器设置。

use dbt_core::context::{FPSR_IOC, FPSR_IXC};
use dbt_core::{CpuContext, GuestAddr, GuestMemory, Reg31, RoundingMode, Vector128};

use dbt_core::save_area::offsets;

use super::fields::{bit, bits, rd, rn};
use super::nan::{default_nan_bits, emit_nan_inputs_exit, process_nans};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, clear_upper, emit_side_exit, load_gpr,
    require_nearest, store_gpr, unallocated, unimplemented,
};
use crate::emit::x86::{Alu, Cond, Gpr, Mem, PackedOp, Precision, Shift, Width, Xmm, scratch_xmm};
use crate::emit::Emitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmovDirection {
    /// FMOV Wd, Sn / FMOV Xd, Dn
    ToGpr,
    /// FMOV Sd, Wn / FMOV Dd, Xn
    ToFp,
}

/// FRINT 的舍入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// FRINTN：就近，偶数优先
    TiesEven,
    /// FRINTP
    PlusInfinity,
    /// FRINTM
    MinusInfinity,
    /// FRINTZ
    Zero,
    /// FRINTA：就近，远离零
    TiesAway,
    /// FRINTX：按 FPCR，不精确时报告
    Exact,
    /// FRINTI：按 FPCR
    Current,
}

impl RoundMode {
    fn mnemonic(self) -> &'static str {
        match self {
            RoundMode::TiesEven => "FRINTN",
            RoundMode::PlusInfinity => "FRINTP",
            RoundMode::MinusInfinity => "FRINTM",
            RoundMode::Zero => "FRINTZ",
            RoundMode::TiesAway => "FRINTA",
            RoundMode::Exact => "FRINTX",
            RoundMode::Current => "FRINTI",
        }
    }

    /// roundsd/roundss 的立即数（低两位为舍入方式，位 3 屏蔽精度异常）
    fn host_imm(self) -> Option<u8> {
        let mode = match self {
            RoundMode::TiesEven => 0,
            RoundMode::MinusInfinity => 1,
            RoundMode::PlusInfinity => 2,
            RoundMode::Zero => 3,
            _ => return None,
        };
        Some(mode | 8)
    }

    fn apply(self, value: f64, fpcr: RoundingMode) -> f64 {
        let effective = match self {
            RoundMode::Exact | RoundMode::Current => match fpcr {
                RoundingMode::Nearest => RoundMode::TiesEven,
                RoundingMode::PlusInfinity => RoundMode::PlusInfinity,
                RoundingMode::MinusInfinity => RoundMode::MinusInfinity,
                RoundingMode::Zero => RoundMode::Zero,
            },
            other => other,
        };
        match effective {
            RoundMode::PlusInfinity => value.ceil(),
            RoundMode::MinusInfinity => value.floor(),
            RoundMode::Zero => value.trunc(),
            RoundMode::TiesAway => value.round(),
            _ => value.round_ties_even(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOp {
    /// SCVTF / UCVTF
    IntToFp {
        signed: bool,
        width: Width,
        precision: Precision,
        rd: u8,
        rn: u8,
    },
    /// FCVTZS / FCVTZU
    FpToInt {
        signed: bool,
        width: Width,
        precision: Precision,
        rd: u8,
        rn: u8,
    },
    Fmov {
        direction: FmovDirection,
        width: Width,
        rd: u8,
        rn: u8,
    },
    /// FCVT
    Fcvt { from: Precision, to: Precision, rd: u8, rn: u8 },
    Round {
        mode: RoundMode,
        precision: Precision,
        rd: u8,
        rn: u8,
    },
}

fn precision_field(encoding: u32, lo: u32, mnemonic: &'static str) -> Result<Precision, DispatchError> {
    match bits(encoding, lo, 2) {
        0 => Ok(Precision::Single),
        1 => Ok(Precision::Double),
        3 => Err(unimplemented(mnemonic, "half-precision operands")),
        _ => Err(unallocated(encoding, mnemonic)),
    }
}

fn int_to_fp(signed: bool, mnemonic: &'static str, encoding: u32) -> Result<ConvertOp, DispatchError> {
    Ok(ConvertOp::IntToFp {
        signed,
        width: Width::from_sf(bit(encoding, 31)),
        precision: precision_field(encoding, 22, mnemonic)?,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn fp_to_int(signed: bool, mnemonic: &'static str, encoding: u32) -> Result<ConvertOp, DispatchError> {
    Ok(ConvertOp::FpToInt {
        signed,
        width: Width::from_sf(bit(encoding, 31)),
        precision: precision_field(encoding, 22, mnemonic)?,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_scvtf(encoding: u32) -> Result<ConvertOp, DispatchError> {
    int_to_fp(true, "SCVTF", encoding)
}

fn decode_ucvtf(encoding: u32) -> Result<ConvertOp, DispatchError> {
    int_to_fp(false, "UCVTF", encoding)
}

fn decode_fcvtzs(encoding: u32) -> Result<ConvertOp, DispatchError> {
    fp_to_int(true, "FCVTZS", encoding)
}

fn decode_fcvtzu(encoding: u32) -> Result<ConvertOp, DispatchError> {
    fp_to_int(false, "FCVTZU", encoding)
}

fn decode_fmov(encoding: u32) -> Result<ConvertOp, DispatchError> {
    Ok(ConvertOp::Fmov {
        direction: if bit(encoding, 16) { FmovDirection::ToFp } else { FmovDirection::ToGpr },
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_fcvt(encoding: u32) -> Result<ConvertOp, DispatchError> {
    let from = precision_field(encoding, 22, "FCVT")?;
    let to = precision_field(encoding, 15, "FCVT")?;
    if from == to {
        return Err(unallocated(encoding, "FCVT"));
    }
    Ok(ConvertOp::Fcvt {
        from,
        to,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_frint(encoding: u32) -> Result<ConvertOp, DispatchError> {
    let mode = match bits(encoding, 15, 3) {
        0 => RoundMode::TiesEven,
        1 => RoundMode::PlusInfinity,
        2 => RoundMode::MinusInfinity,
        3 => RoundMode::Zero,
        4 => RoundMode::TiesAway,
        6 => RoundMode::Exact,
        7 => RoundMode::Current,
        _ => return Err(unallocated(encoding, "FRINT")),
    };
    Ok(ConvertOp::Round {
        mode,
        precision: precision_field(encoding, 22, mode.mnemonic())?,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

pub static PATTERNS: &[Pattern<ConvertOp>] = &[
    Pattern { mask: 0x7F3F_FC00, value: 0x1E22_0000, mnemonic: "SCVTF", decode: decode_scvtf },
    Pattern { mask: 0x7F3F_FC00, value: 0x1E23_0000, mnemonic: "UCVTF", decode: decode_ucvtf },
    Pattern { mask: 0x7F3F_FC00, value: 0x1E38_0000, mnemonic: "FCVTZS", decode: decode_fcvtzs },
    Pattern { mask: 0x7F3F_FC00, value: 0x1E39_0000, mnemonic: "FCVTZU", decode: decode_fcvtzu },
    Pattern { mask: 0xFFFF_FC00, value: 0x9E66_0000, mnemonic: "FMOV (general)", decode: decode_fmov },
    Pattern { mask: 0xFFFF_FC00, value: 0x9E67_0000, mnemonic: "FMOV (general)", decode: decode_fmov },
    Pattern { mask: 0xFFFF_FC00, value: 0x1E26_0000, mnemonic: "FMOV (general)", decode: decode_fmov },
    Pattern { mask: 0xFFFF_FC00, value: 0x1E27_0000, mnemonic: "FMOV (general)", decode: decode_fmov },
    Pattern { mask: 0xFF3E_7C00, value: 0x1E22_4000, mnemonic: "FCVT", decode: decode_fcvt },
    Pattern { mask: 0xFF3C_7C00, value: 0x1E24_4000, mnemonic: "FRINT", decode: decode_frint },
];

pub(crate) struct ConvertFamily;

fn read_fp(ctx: &CpuContext, precision: Precision, reg: u8) -> f64 {
    match precision {
        Precision::Double => ctx.d(reg),
        Precision::Single => f64::from(ctx.s(reg)),
    }
}

fn write_fp(ctx: &mut CpuContext, precision: Precision, reg: u8, value: f64) {
    match precision {
        Precision::Double => ctx.set_d(reg, value),
        Precision::Single => ctx.set_s(reg, value as f32),
    }
}

/// 向零截断并饱和；第二个返回值表示结果不可表示（NaN 或越界）
fn truncate_saturating(value: f64, signed: bool, width: Width) -> (u64, bool) {
    let t = value.trunc();
    match (signed, width) {
        (true, Width::W64) => (
            value as i64 as u64,
            value.is_nan() || t < i64::MIN as f64 || t >= -(i64::MIN as f64),
        ),
        (true, Width::W32) => (
            u64::from(value as i32 as u32),
            value.is_nan() || t < f64::from(i32::MIN) || t > f64::from(i32::MAX),
        ),
        (false, Width::W64) => (value as u64, value.is_nan() || t < 0.0 || t >= u64::MAX as f64),
        (false, Width::W32) => (u64::from(value as u32), value.is_nan() || t < 0.0 || t > f64::from(u32::MAX)),
    }
}

/// 源寄存器为 NaN 时按客户机规则得到的结果位模式
fn nan_operand(ctx: &mut CpuContext, precision: Precision, reg: u8) -> Option<u64> {
    match precision {
        Precision::Double => {
            let value = ctx.d(reg);
            process_nans(ctx, &[value]).map(f64::to_bits)
        }
        Precision::Single => {
            let value = ctx.s(reg);
            process_nans(ctx, &[value]).map(|v| u64::from(v.to_bits()))
        }
    }
}

/// 精度转换中的 NaN：静默化，负载保留高位
fn convert_nan(ctx: &mut CpuContext, from: Precision, to: Precision, raw: u64) -> u64 {
    let (sign, frac, signaling) = match from {
        Precision::Double => (raw >> 63, raw & ((1 << 51) - 1), raw & (1 << 51) == 0),
        Precision::Single => ((raw >> 31) & 1, (raw & 0x3F_FFFF) << 29, raw & (1 << 22) == 0),
    };
    if signaling {
        ctx.raise_fp_exception(FPSR_IOC);
    }
    if ctx.default_nan_mode() {
        return default_nan_bits(to);
    }
    match to {
        Precision::Double => (sign << 63) | default_nan_bits(to) | frac,
        Precision::Single => (sign << 31) | default_nan_bits(to) | (frac >> 29),
    }
}

fn is_nan_bits(precision: Precision, raw: u64) -> bool {
    match precision {
        Precision::Double => f64::from_bits(raw).is_nan(),
        Precision::Single => f32::from_bits(raw as u32).is_nan(),
    }
}

/// FCVTZS 的发射
///
/// 宿主截断在不可表示（NaN 或越界）时返回最小负数，此时走侧出口；
/// 其余情况把结果转回浮点与源比较，不相等即置 FPSR.IXC。
fn emit_fcvtzs(
    em: &mut Emitter,
    pc: GuestAddr,
    precision: Precision,
    width: Width,
    rd: u8,
    n: Xmm,
) -> Result<(), DispatchError> {
    em.cvt_fp_to_int_trunc(precision, width, Gpr::Rax, n)?;
    match width {
        Width::W64 => {
            em.mov_imm64(Gpr::Rcx, 1 << 63)?;
            em.alu_rr(Alu::Cmp, Width::W64, Gpr::Rax, Gpr::Rcx)?;
        }
        Width::W32 => em.alu_ri(Alu::Cmp, Width::W32, Gpr::Rax, i32::MIN)?,
    }
    let representable = em.jcc_rel8(Cond::Ne)?;
    emit_side_exit(em, pc)?;
    em.bind(representable)?;

    let t = scratch_xmm(&[n]);
    em.spill_xmm(t)?;
    em.cvt_int_to_fp(precision, width, t, Gpr::Rax)?;
    em.ucomis(precision, t, n)?;
    em.setcc(Cond::Ne, Gpr::Rcx)?;
    em.unspill_xmm(t)?;
    em.movzx8(Gpr::Rcx, Gpr::Rcx)?;
    em.shift_ri(Shift::Shl, Width::W32, Gpr::Rcx, FPSR_IXC.trailing_zeros() as u8)?;
    let fpsr = Mem::area(offsets::FPSR as i32);
    em.load(Width::W32, Gpr::Rdx, fpsr)?;
    em.alu_rr(Alu::Or, Width::W32, Gpr::Rdx, Gpr::Rcx)?;
    em.store(Width::W32, fpsr, Gpr::Rdx)?;
    store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
    Ok(())
}

impl FamilyImpl for ConvertFamily {
    type Op = ConvertOp;

    const FAMILY: Family = Family::Convert;

    fn patterns() -> &'static [Pattern<ConvertOp>] {
        PATTERNS
    }

    fn control(_op: &ConvertOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &ConvertOp,
        _pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        match *op {
            ConvertOp::IntToFp { signed, width, precision, rd, rn } => {
                require_nearest(ctx, if signed { "SCVTF" } else { "UCVTF" })?;
                let raw = ctx.x(rn) & width.mask();
                match (precision, signed) {
                    (Precision::Double, true) => {
                        ctx.set_d(rd, super::fields::sign_extend(raw, width.bits()) as f64);
                    }
                    (Precision::Double, false) => ctx.set_d(rd, raw as f64),
                    (Precision::Single, true) => {
                        ctx.set_s(rd, super::fields::sign_extend(raw, width.bits()) as f32);
                    }
                    (Precision::Single, false) => ctx.set_s(rd, raw as f32),
                }
            }
            ConvertOp::FpToInt { signed, width, precision, rd, rn } => {
                let source = read_fp(ctx, precision, rn);
                let (value, invalid) = truncate_saturating(source, signed, width);
                if invalid {
                    ctx.raise_fp_exception(FPSR_IOC);
                } else if source.trunc() != source {
                    ctx.raise_fp_exception(FPSR_IXC);
                }
                ctx.set_x(rd, value);
            }
            ConvertOp::Fmov { direction, width, rd, rn } => match direction {
                FmovDirection::ToGpr => {
                    let value = ctx.v(rn).lo & width.mask();
                    ctx.set_x(rd, value);
                }
                FmovDirection::ToFp => {
                    let value = ctx.x(rn) & width.mask();
                    ctx.set_v(rd, Vector128::new(value, 0));
                }
            },
            ConvertOp::Fcvt { from, to, rd, rn } => {
                let raw = match from {
                    Precision::Double => ctx.v(rn).lo,
                    Precision::Single => ctx.v(rn).lo & u64::from(u32::MAX),
                };
                if is_nan_bits(from, raw) {
                    let bits = convert_nan(ctx, from, to, raw);
                    ctx.set_v(rd, Vector128::new(bits, 0));
                    return Ok(None);
                }
                if to == Precision::Single {
                    require_nearest(ctx, "FCVT")?;
                }
                let value = read_fp(ctx, from, rn);
                write_fp(ctx, to, rd, value);
            }
            ConvertOp::Round { mode, precision, rd, rn } => {
                if let Some(bits) = nan_operand(ctx, precision, rn) {
                    ctx.set_v(rd, Vector128::new(bits, 0));
                    return Ok(None);
                }
                let value = read_fp(ctx, precision, rn);
                let rounded = mode.apply(value, ctx.rounding_mode());
                if mode == RoundMode::Exact && !value.is_nan() && rounded != value {
                    ctx.raise_fp_exception(FPSR_IXC);
                }
                write_fp(ctx, precision, rd, rounded);
            }
        }
        Ok(None)
    }

    fn emit(op: &ConvertOp, pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            ConvertOp::IntToFp { signed, width, precision, rd, rn } => {
                let host_width = match (signed, width) {
                    (true, w) => w,
                    // 32 位无符号数零扩展后按 64 位有符号数转换
                    (false, Width::W32) => Width::W64,
                    (false, Width::W64) => {
                        return Err(unimplemented("UCVTF", "64-bit unsigned source in emitted code"));
                    }
                };
                let d = options.vreg(rd)?;
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                em.packed(PackedOp::Pxor, d, d)?;
                em.cvt_int_to_fp(precision, host_width, d, Gpr::Rax)?;
            }
            ConvertOp::FpToInt { signed, width, precision, rd, rn } => {
                if !signed {
                    return Err(unimplemented("FCVTZU", "unsigned truncation in emitted code"));
                }
                let n = options.vreg(rn)?;
                emit_fcvtzs(em, pc, precision, width, rd, n)?;
            }
            ConvertOp::Fmov { direction, width, rd, rn } => match direction {
                FmovDirection::ToGpr => {
                    let n = options.vreg(rn)?;
                    em.mov_from_xmm(width, Gpr::Rax, n)?;
                    store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                }
                FmovDirection::ToFp => {
                    let d = options.vreg(rd)?;
                    load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                    em.mov_to_xmm(width, d, Gpr::Rax)?;
                }
            },
            ConvertOp::Fcvt { from, to, rd, rn } => {
                let d = options.vreg(rd)?;
                let n = options.vreg(rn)?;
                emit_nan_inputs_exit(em, pc, from, &[n])?;
                em.cvt_precision(from, d, n)?;
                clear_upper(em, to, d)?;
            }
            ConvertOp::Round { mode, precision, rd, rn } => {
                let Some(imm) = mode.host_imm() else {
                    return Err(unimplemented(mode.mnemonic(), "rounding mode not encodable in emitted code"));
                };
                options.require(options.features.sse41, mode.mnemonic(), "roundsd/roundss require SSE4.1")?;
                let d = options.vreg(rd)?;
                let n = options.vreg(rn)?;
                emit_nan_inputs_exit(em, pc, precision, &[n])?;
                em.round(precision, d, n, imm)?;
                clear_upper(em, precision, d)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Dispatcher, ExecTarget};
    use crate::emit::HostFeatures;
    use dbt_core::{FlatMemory, VectorAliasPolicy};
    use proptest::prelude::*;

    fn exec(ctx: &mut CpuContext, encoding: u32) -> Result<(), DispatchError> {
        let mem = FlatMemory::new(0, 16);
        let handled = Dispatcher::new().dispatch(encoding, 0x3000, &mut ExecTarget::Interpret { ctx, mem: &mem })?;
        assert_eq!(handled.family, Family::Convert);
        Ok(())
    }

    fn emit(encoding: u32, features: HostFeatures) -> Result<Vec<u8>, DispatchError> {
        let options = EmitOptions::new(features, VectorAliasPolicy::Reject);
        let mut em = Emitter::new(512);
        Dispatcher::new().emit(encoding, 0x3000, &mut em, &options)?;
        Ok(em.into_bytes())
    }

    #[test]
    fn test_int_to_fp() {
        let mut ctx = CpuContext::new();
        ctx.set_x(1, (-3i64) as u64);
        // SCVTF D0, X1
        exec(&mut ctx, 0x9E62_0020).unwrap();
        assert_eq!(ctx.d(0), -3.0);
        // SCVTF S0, W1
        exec(&mut ctx, 0x1E22_0020).unwrap();
        assert_eq!(ctx.s(0), -3.0);
        // UCVTF D0, W1
        exec(&mut ctx, 0x1E63_0020).unwrap();
        assert_eq!(ctx.d(0), 4_294_967_293.0);
    }

    #[test]
    fn test_fp_to_int_saturates() {
        let mut ctx = CpuContext::new();
        ctx.set_d(1, -2.75);
        // FCVTZS X0, D1
        exec(&mut ctx, 0x9E78_0020).unwrap();
        assert_eq!(ctx.x(0) as i64, -2);
        assert_eq!(ctx.fp.fpsr & FPSR_IOC, 0);
        ctx.set_d(1, 1e20);
        // FCVTZS W0, D1
        exec(&mut ctx, 0x1E78_0020).unwrap();
        assert_eq!(ctx.x(0), i32::MAX as u64);
        assert_ne!(ctx.fp.fpsr & FPSR_IOC, 0);
        ctx.set_s(1, -1.5);
        // FCVTZU W0, S1
        exec(&mut ctx, 0x1E39_0020).unwrap();
        assert_eq!(ctx.x(0), 0);
        ctx.set_d(1, f64::NAN);
        exec(&mut ctx, 0x9E78_0020).unwrap();
        assert_eq!(ctx.x(0), 0);
    }

    #[test]
    fn test_fmov_general() {
        let mut ctx = CpuContext::new();
        ctx.set_v(1, Vector128::new(0x4009_21FB_5444_2D18, 0xFFFF));
        // FMOV X0, D1
        exec(&mut ctx, 0x9E66_0020).unwrap();
        assert_eq!(ctx.x(0), 0x4009_21FB_5444_2D18);
        // FMOV W0, S1
        exec(&mut ctx, 0x1E26_0020).unwrap();
        assert_eq!(ctx.x(0), 0x5444_2D18);
        ctx.set_x(3, 0x1122_3344_5566_7788);
        // FMOV S2, W3
        exec(&mut ctx, 0x1E27_0062).unwrap();
        assert_eq!(ctx.v(2), Vector128::new(0x5566_7788, 0));
        // FMOV D2, X3
        exec(&mut ctx, 0x9E67_0062).unwrap();
        assert_eq!(ctx.v(2), Vector128::new(0x1122_3344_5566_7788, 0));
    }

    #[test]
    fn test_fcvt_and_frint() {
        let mut ctx = CpuContext::new();
        ctx.set_d(1, 2.5);
        // FCVT S0, D1
        exec(&mut ctx, 0x1E62_4020).unwrap();
        assert_eq!(ctx.v(0), Vector128::new(2.5f32.to_bits() as u64, 0));
        // FRINTN D0, D1：偶数优先
        exec(&mut ctx, 0x1E64_4020).unwrap();
        assert_eq!(ctx.d(0), 2.0);
        // FRINTA D0, D1：远离零
        exec(&mut ctx, 0x1E66_4020).unwrap();
        assert_eq!(ctx.d(0), 3.0);
        // FRINTP / FRINTM / FRINTZ
        ctx.set_d(1, -2.5);
        exec(&mut ctx, 0x1E64_C020).unwrap();
        assert_eq!(ctx.d(0), -2.0);
        exec(&mut ctx, 0x1E65_4020).unwrap();
        assert_eq!(ctx.d(0), -3.0);
        exec(&mut ctx, 0x1E65_C020).unwrap();
        assert_eq!(ctx.d(0), -2.0);
        // FRINTX 报告不精确
        exec(&mut ctx, 0x1E67_4020).unwrap();
        assert_eq!(ctx.d(0), -2.0);
        assert_ne!(ctx.fp.fpsr & FPSR_IXC, 0);
    }

    #[test]
    fn test_non_nearest_rounding_is_reported() {
        let mut ctx = CpuContext::new();
        // FPCR.RMode = Zero
        ctx.fp.fpcr = 0b11 << 22;
        let err = exec(&mut ctx, 0x9E62_0020).unwrap_err();
        assert!(matches!(err, DispatchError::Unimplemented { mnemonic: "SCVTF", .. }));
        // FRINTI 按 FPCR 截断
        ctx.set_d(1, 2.9);
        exec(&mut ctx, 0x1E67_C020).unwrap();
        assert_eq!(ctx.d(0), 2.0);
    }

    #[test]
    fn test_emit_conversions() {
        // FCVTZS X0, D1：cvttsd2si rax, xmm1
        let bytes = emit(0x9E78_0020, HostFeatures::baseline()).unwrap();
        assert_eq!(&bytes[..5], &[0xF2, 0x48, 0x0F, 0x2C, 0xC1]);
        // FRINTM D0, D1：NaN 检查之后 roundsd xmm0, xmm1, 9；movq xmm0, xmm0
        let bytes = emit(0x1E65_4020, HostFeatures::all()).unwrap();
        assert_eq!(&bytes[..4], &[0x66, 0x0F, 0x2E, 0xC9]);
        assert!(bytes.ends_with(&[0x66, 0x0F, 0x3A, 0x0B, 0xC1, 0x09, 0xF3, 0x0F, 0x7E, 0xC0]));
        assert!(emit(0x1E65_4020, HostFeatures::baseline()).is_err());
        // FRINTA、FCVTZU、64 位 UCVTF 不发射
        for encoding in [0x1E66_4020, 0x1E39_0020, 0x9E63_0020] {
            let err = emit(encoding, HostFeatures::all()).unwrap_err();
            assert!(matches!(err, DispatchError::Unimplemented { .. }), "{encoding:#x}");
        }
    }

    #[test]
    fn test_fcvtzs_reports_inexact() {
        let mut ctx = CpuContext::new();
        ctx.set_d(1, 2.0);
        // FCVTZS X0, D1
        exec(&mut ctx, 0x9E78_0020).unwrap();
        assert_eq!(ctx.fp.fpsr, 0);
        ctx.set_d(1, 2.5);
        exec(&mut ctx, 0x9E78_0020).unwrap();
        assert_eq!(ctx.x(0), 2);
        assert_eq!(ctx.fp.fpsr, FPSR_IXC);
        // 不可表示时只报告无效操作
        ctx.fp.fpsr = 0;
        ctx.set_d(1, -1e30);
        exec(&mut ctx, 0x9E78_0020).unwrap();
        assert_eq!(ctx.fp.fpsr, FPSR_IOC);
    }

    #[test]
    fn test_fcvtzs_emission_updates_fpsr() {
        // FCVTZS W0, S1：cvttss2si eax, xmm1；cmp eax, 0x80000000
        let bytes = emit(0x1E38_0020, HostFeatures::baseline()).unwrap();
        assert_eq!(&bytes[..4], &[0xF3, 0x0F, 0x2C, 0xC1]);
        let windows = |needle: &[u8]| bytes.windows(needle.len()).any(|w| w == needle);
        // 侧出口写入退出原因
        assert!(windows(&[0xC7, 0x87, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xC3]));
        // setne cl；or edx, ecx
        assert!(windows(&[0x0F, 0x95, 0xC1]));
        assert!(windows(&[0x09, 0xCA]));
    }

    #[test]
    fn test_nan_conversions() {
        let mut ctx = CpuContext::new();
        // 信号 NaN，负载高 22 位为 0x15
        ctx.set_d(1, f64::from_bits(0xFFF0_0002_A000_0000));
        // FCVT S0, D1
        exec(&mut ctx, 0x1E62_4020).unwrap();
        assert_eq!(ctx.v(0), Vector128::new(0xFFC0_0015, 0));
        assert_eq!(ctx.fp.fpsr & FPSR_IOC, FPSR_IOC);
        // FCVT D0, S2：静默 NaN 负载左移
        ctx.fp.fpsr = 0;
        ctx.set_s(2, f32::from_bits(0x7FC0_0003));
        exec(&mut ctx, 0x1E22_C040).unwrap();
        assert_eq!(ctx.v(0), Vector128::new(0x7FF8_0000_6000_0000, 0));
        assert_eq!(ctx.fp.fpsr, 0);
        // FRINTN D0, D3：信号 NaN 被静默化
        ctx.set_d(3, f64::from_bits(0x7FF0_0000_0000_0001));
        exec(&mut ctx, 0x1E64_4060).unwrap();
        assert_eq!(ctx.v(0), Vector128::new(0x7FF8_0000_0000_0001, 0));
        assert_eq!(ctx.fp.fpsr, FPSR_IOC);
    }

    proptest! {
        #[test]
        fn prop_fcvtzs_w_matches_saturating_cast(value in proptest::num::f64::ANY) {
            let (result, _) = truncate_saturating(value, true, Width::W32);
            prop_assert_eq!(result as u32 as i32, value as i32);
        }
    }
}
