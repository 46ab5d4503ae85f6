//! 比较与条件选择：FCMP/FCMPE、CCMP/CCMN、CSEL/CSINC/CSINV/CSNEG、FCSEL、
//! 向量 CMEQ/CMGT/CMGE/CMHI/CMHS
//!
//! 发射的 FCMP 遇到 NaN 输入时走侧出口，由解释器设置 FPSR.IOC。

use dbt_core::context::FPSR_IOC;
use dbt_core::save_area::offsets;
use dbt_core::{Condition, CpuContext, GuestAddr, GuestMemory, Nzcv, Reg31, Vector128};
use dbt_simd::{LaneWidth, v128_eq, v128_ge, v128_gt, v128_uge, v128_ugt};

use super::fields::{bit, bits, rd, rm, rn};
use super::flags::{
    CarryMode, HostCond, add_with_carry, emit_load_flags, emit_store_fcmp_flags, emit_store_flags, fcmp_flags,
    host_cond,
};
use super::nan::{FloatBits, emit_nan_inputs_exit};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, load_gpr, store_gpr, unallocated,
    unimplemented,
};
use crate::emit::x86::{Alu, Gpr, Mem, PackedOp, Precision, Width, Xmm, scratch_xmm};
use crate::emit::Emitter;

/// CSEL 系列对 Rm 的变换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectKind {
    Csel,
    Csinc,
    Csinv,
    Csneg,
}

impl SelectKind {
    fn apply(self, value: u64, width: Width) -> u64 {
        let value = match self {
            SelectKind::Csel => value,
            SelectKind::Csinc => value.wrapping_add(1),
            SelectKind::Csinv => !value,
            SelectKind::Csneg => value.wrapping_neg(),
        };
        value & width.mask()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorCmp {
    /// CMEQ
    Eq,
    /// CMGT
    Gt,
    /// CMGE
    Ge,
    /// CMHI
    Hi,
    /// CMHS
    Hs,
}

/// CCMP/CCMN 的第二操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOperand {
    Reg(u8),
    Imm(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Fcmp {
        precision: Precision,
        /// FCMPE：QNaN 也报告无效操作
        signaling: bool,
        /// 与 #0.0 比较
        zero: bool,
        rn: u8,
        rm: u8,
    },
    /// 条件不成立时 NZCV 取 `nzcv`
    CondCompare {
        /// CCMN
        negate: bool,
        width: Width,
        cond: Condition,
        rn: u8,
        operand: CondOperand,
        nzcv: u8,
    },
    Select {
        kind: SelectKind,
        width: Width,
        cond: Condition,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    Vector {
        cmp: VectorCmp,
        q: bool,
        width: LaneWidth,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    FpSelect {
        precision: Precision,
        cond: Condition,
        rd: u8,
        rn: u8,
        rm: u8,
    },
}

fn fp_type(encoding: u32, mnemonic: &'static str) -> Result<Precision, DispatchError> {
    match bits(encoding, 22, 2) {
        0 => Ok(Precision::Single),
        1 => Ok(Precision::Double),
        3 => Err(unimplemented(mnemonic, "half-precision operands")),
        _ => Err(unallocated(encoding, mnemonic)),
    }
}

fn decode_fcmp(encoding: u32) -> Result<CompareOp, DispatchError> {
    let precision = fp_type(encoding, "FCMP")?;
    Ok(CompareOp::Fcmp {
        precision,
        signaling: bit(encoding, 4),
        zero: bit(encoding, 3),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_cond_compare(encoding: u32) -> Result<CompareOp, DispatchError> {
    let operand = if bit(encoding, 11) {
        CondOperand::Imm(bits(encoding, 16, 5) as u8)
    } else {
        CondOperand::Reg(rm(encoding))
    };
    Ok(CompareOp::CondCompare {
        negate: !bit(encoding, 30),
        width: Width::from_sf(bit(encoding, 31)),
        cond: Condition::from_bits(bits(encoding, 12, 4)),
        rn: rn(encoding),
        operand,
        nzcv: bits(encoding, 0, 4) as u8,
    })
}

fn decode_fp_select(encoding: u32) -> Result<CompareOp, DispatchError> {
    Ok(CompareOp::FpSelect {
        precision: fp_type(encoding, "FCSEL")?,
        cond: Condition::from_bits(bits(encoding, 12, 4)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_select(encoding: u32) -> Result<CompareOp, DispatchError> {
    let kind = match (bit(encoding, 30), bit(encoding, 10)) {
        (false, false) => SelectKind::Csel,
        (false, true) => SelectKind::Csinc,
        (true, false) => SelectKind::Csinv,
        (true, true) => SelectKind::Csneg,
    };
    Ok(CompareOp::Select {
        kind,
        width: Width::from_sf(bit(encoding, 31)),
        cond: Condition::from_bits(bits(encoding, 12, 4)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_vector(cmp: VectorCmp, mnemonic: &'static str, encoding: u32) -> Result<CompareOp, DispatchError> {
    let q = bit(encoding, 30);
    let size = bits(encoding, 22, 2);
    if size == 3 && !q {
        return Err(unallocated(encoding, mnemonic));
    }
    Ok(CompareOp::Vector {
        cmp,
        q,
        width: LaneWidth::from_size_field(size),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_cmeq(encoding: u32) -> Result<CompareOp, DispatchError> {
    decode_vector(VectorCmp::Eq, "CMEQ", encoding)
}

fn decode_cmgt(encoding: u32) -> Result<CompareOp, DispatchError> {
    decode_vector(VectorCmp::Gt, "CMGT", encoding)
}

fn decode_cmge(encoding: u32) -> Result<CompareOp, DispatchError> {
    decode_vector(VectorCmp::Ge, "CMGE", encoding)
}

fn decode_cmhi(encoding: u32) -> Result<CompareOp, DispatchError> {
    decode_vector(VectorCmp::Hi, "CMHI", encoding)
}

fn decode_cmhs(encoding: u32) -> Result<CompareOp, DispatchError> {
    decode_vector(VectorCmp::Hs, "CMHS", encoding)
}

pub static PATTERNS: &[Pattern<CompareOp>] = &[
    Pattern { mask: 0xFF20_FC00, value: 0x1E20_2000, mnemonic: "FCMP/FCMPE", decode: decode_fcmp },
    Pattern { mask: 0x3FE0_0800, value: 0x1A80_0000, mnemonic: "CSEL/CSINC/CSINV/CSNEG", decode: decode_select },
    Pattern { mask: 0x3FE0_0410, value: 0x3A40_0000, mnemonic: "CCMP/CCMN", decode: decode_cond_compare },
    Pattern { mask: 0xFF20_0C00, value: 0x1E20_0C00, mnemonic: "FCSEL", decode: decode_fp_select },
    Pattern { mask: 0xBF20_FC00, value: 0x0E20_3400, mnemonic: "CMGT", decode: decode_cmgt },
    Pattern { mask: 0xBF20_FC00, value: 0x0E20_3C00, mnemonic: "CMGE", decode: decode_cmge },
    Pattern { mask: 0xBF20_FC00, value: 0x2E20_3400, mnemonic: "CMHI", decode: decode_cmhi },
    Pattern { mask: 0xBF20_FC00, value: 0x2E20_3C00, mnemonic: "CMHS", decode: decode_cmhs },
    Pattern { mask: 0xBF20_FC00, value: 0x2E20_8C00, mnemonic: "CMEQ", decode: decode_cmeq },
];

pub(crate) struct CompareFamily;

/// FCMP 的标志与是否无效：信号 NaN 总是无效，FCMPE 对静默 NaN 也无效
fn fcmp_as<T: FloatBits + PartialOrd>(a: T, b: T, signaling: bool) -> (Nzcv, bool) {
    let any_nan = a.is_nan() || b.is_nan();
    let invalid = a.is_signaling() || b.is_signaling() || (signaling && any_nan);
    (fcmp_flags(a, b), invalid)
}

fn nzcv_slot() -> Mem {
    Mem::area(offsets::NZCV as i32)
}

fn pcmpeq(width: LaneWidth) -> PackedOp {
    match width {
        LaneWidth::B8 => PackedOp::Pcmpeqb,
        LaneWidth::B16 => PackedOp::Pcmpeqw,
        LaneWidth::B32 => PackedOp::Pcmpeqd,
        LaneWidth::B64 => PackedOp::Pcmpeqq,
    }
}

fn pcmpgt(width: LaneWidth) -> PackedOp {
    match width {
        LaneWidth::B8 => PackedOp::Pcmpgtb,
        LaneWidth::B16 => PackedOp::Pcmpgtw,
        LaneWidth::B32 => PackedOp::Pcmpgtd,
        LaneWidth::B64 => PackedOp::Pcmpgtq,
    }
}

fn emit_vector_compare(
    em: &mut Emitter,
    options: &EmitOptions,
    cmp: VectorCmp,
    q: bool,
    width: LaneWidth,
    (rd, rn, rm): (u8, u8, u8),
) -> Result<(), DispatchError> {
    let mnemonic = match cmp {
        VectorCmp::Eq => "CMEQ",
        VectorCmp::Gt => "CMGT",
        VectorCmp::Ge => "CMGE",
        VectorCmp::Hi => "CMHI",
        VectorCmp::Hs => "CMHS",
    };
    let features = options.features;
    match (cmp, width) {
        (VectorCmp::Eq, LaneWidth::B64) => options.require(features.sse41, mnemonic, "pcmpeqq requires SSE4.1")?,
        (VectorCmp::Gt | VectorCmp::Ge, LaneWidth::B64) => {
            options.require(features.sse42, mnemonic, "pcmpgtq requires SSE4.2")?
        }
        (VectorCmp::Hi | VectorCmp::Hs, LaneWidth::B64) => {
            return Err(unimplemented(mnemonic, "no unsigned 64-bit lane compare on the host"));
        }
        (VectorCmp::Hi | VectorCmp::Hs, LaneWidth::B16 | LaneWidth::B32) => {
            options.require(features.sse41, mnemonic, "pmaxuw/pmaxud require SSE4.1")?
        }
        _ => {}
    }

    let d = options.vreg(rd)?;
    let n = options.vreg(rn)?;
    let m = options.vreg(rm)?;
    let t = scratch_xmm(&[d, n, m]);
    let pmaxu = match width {
        LaneWidth::B8 => PackedOp::Pmaxub,
        LaneWidth::B16 => PackedOp::Pmaxuw,
        _ => PackedOp::Pmaxud,
    };

    em.spill_xmm(t)?;
    // 先在 t 中算出结果（或其补），n、m 之后不再读取，d 可与二者重叠
    let invert = match cmp {
        VectorCmp::Eq => {
            em.movapd(t, n)?;
            em.packed(pcmpeq(width), t, m)?;
            false
        }
        VectorCmp::Gt => {
            em.movapd(t, n)?;
            em.packed(pcmpgt(width), t, m)?;
            false
        }
        VectorCmp::Ge => {
            em.movapd(t, m)?;
            em.packed(pcmpgt(width), t, n)?;
            true
        }
        VectorCmp::Hs => {
            em.movapd(t, n)?;
            em.packed(pmaxu, t, m)?;
            em.packed(pcmpeq(width), t, n)?;
            false
        }
        VectorCmp::Hi => {
            em.movapd(t, n)?;
            em.packed(pmaxu, t, m)?;
            em.packed(pcmpeq(width), t, m)?;
            true
        }
    };
    if invert {
        em.packed(PackedOp::Pcmpeqd, d, d)?;
        em.packed(PackedOp::Pxor, d, t)?;
    } else {
        em.movapd(d, t)?;
    }
    if !q {
        em.movq_xx(d, d)?;
    }
    em.unspill_xmm(t)?;
    Ok(())
}

fn emit_fcmp(em: &mut Emitter, precision: Precision, signaling: bool, a: Xmm, b: Xmm) -> Result<(), DispatchError> {
    if signaling {
        em.comis(precision, a, b)?;
    } else {
        em.ucomis(precision, a, b)?;
    }
    emit_store_fcmp_flags(em)?;
    Ok(())
}

impl FamilyImpl for CompareFamily {
    type Op = CompareOp;

    const FAMILY: Family = Family::Compare;

    fn patterns() -> &'static [Pattern<CompareOp>] {
        PATTERNS
    }

    fn control(_op: &CompareOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &CompareOp,
        _pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        match *op {
            CompareOp::Fcmp { precision, signaling, zero, rn, rm } => {
                let (flags, invalid) = match precision {
                    Precision::Double => {
                        let b = if zero { 0.0 } else { ctx.d(rm) };
                        fcmp_as(ctx.d(rn), b, signaling)
                    }
                    Precision::Single => {
                        let b = if zero { 0.0 } else { ctx.s(rm) };
                        fcmp_as(ctx.s(rn), b, signaling)
                    }
                };
                if invalid {
                    ctx.raise_fp_exception(FPSR_IOC);
                }
                ctx.set_nzcv(flags);
            }
            CompareOp::CondCompare { negate, width, cond, rn, operand, nzcv } => {
                let flags = if ctx.condition_holds(cond) {
                    let b = match operand {
                        CondOperand::Reg(rm) => ctx.x(rm),
                        CondOperand::Imm(imm) => u64::from(imm),
                    };
                    let a = ctx.x(rn);
                    if negate {
                        add_with_carry(width, a, b, false).1
                    } else {
                        add_with_carry(width, a, !b, true).1
                    }
                } else {
                    Nzcv::from_nibble(nzcv)
                };
                ctx.set_nzcv(flags);
            }
            CompareOp::FpSelect { precision, cond, rd, rn, rm } => {
                let src = if ctx.condition_holds(cond) { rn } else { rm };
                let lo = ctx.v(src).lo;
                let lo = match precision {
                    Precision::Double => lo,
                    Precision::Single => lo & u64::from(u32::MAX),
                };
                ctx.set_v(rd, Vector128::new(lo, 0));
            }
            CompareOp::Select { kind, width, cond, rd, rn, rm } => {
                let value = if ctx.condition_holds(cond) {
                    ctx.x(rn) & width.mask()
                } else {
                    kind.apply(ctx.x(rm), width)
                };
                ctx.set_x(rd, value);
            }
            CompareOp::Vector { cmp, q, width, rd, rn, rm } => {
                let (n, m) = (ctx.v(rn), ctx.v(rm));
                let mut result = match cmp {
                    VectorCmp::Eq => v128_eq(n, m, width),
                    VectorCmp::Gt => v128_gt(n, m, width),
                    VectorCmp::Ge => v128_ge(n, m, width),
                    VectorCmp::Hi => v128_ugt(n, m, width),
                    VectorCmp::Hs => v128_uge(n, m, width),
                };
                if !q {
                    result = result.clear_upper();
                }
                ctx.set_v(rd, result);
            }
        }
        Ok(None)
    }

    fn emit(op: &CompareOp, pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            CompareOp::Fcmp { precision, signaling, zero, rn, rm } => {
                let n = options.vreg(rn)?;
                if zero {
                    // NaN 检查必须在溢出之前
                    emit_nan_inputs_exit(em, pc, precision, &[n])?;
                    let t = scratch_xmm(&[n]);
                    em.spill_xmm(t)?;
                    em.packed(PackedOp::Pxor, t, t)?;
                    emit_fcmp(em, precision, signaling, n, t)?;
                    em.unspill_xmm(t)?;
                } else {
                    let m = options.vreg(rm)?;
                    emit_nan_inputs_exit(em, pc, precision, &[n, m])?;
                    emit_fcmp(em, precision, signaling, n, m)?;
                }
            }
            CompareOp::CondCompare { negate, width, cond, rn, operand, nzcv } => {
                let mut skip = None;
                if let HostCond::Jcc(cc) = host_cond(cond) {
                    emit_load_flags(em)?;
                    let holds = em.jcc_rel8(cc)?;
                    em.mov_imm32(Gpr::Rax, Nzcv::from_nibble(nzcv).to_word() as u32)?;
                    em.store(Width::W64, nzcv_slot(), Gpr::Rax)?;
                    skip = Some(em.jmp_rel8()?);
                    em.bind(holds)?;
                }
                let alu = if negate { Alu::Add } else { Alu::Sub };
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                match operand {
                    CondOperand::Reg(rm) => {
                        load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                        em.alu_rr(alu, width, Gpr::Rax, Gpr::Rcx)?;
                    }
                    CondOperand::Imm(imm) => em.alu_ri(alu, width, Gpr::Rax, i32::from(imm))?,
                }
                emit_store_flags(em, if negate { CarryMode::Carry } else { CarryMode::Borrow })?;
                if let Some(skip) = skip {
                    em.bind(skip)?;
                }
            }
            CompareOp::FpSelect { precision, cond, rd, rn, rm } => {
                let (d, n, m) = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                let width = match precision {
                    Precision::Double => Width::W64,
                    Precision::Single => Width::W32,
                };
                match host_cond(cond) {
                    HostCond::Always => em.mov_from_xmm(width, Gpr::Rax, n)?,
                    HostCond::Jcc(cc) => {
                        emit_load_flags(em)?;
                        em.mov_from_xmm(width, Gpr::Rax, m)?;
                        em.mov_from_xmm(width, Gpr::Rcx, n)?;
                        em.cmov(cc, width, Gpr::Rax, Gpr::Rcx)?;
                    }
                }
                em.mov_to_xmm(width, d, Gpr::Rax)?;
            }
            CompareOp::Select { kind, width, cond, rd, rn, rm } => {
                load_gpr(em, width, Gpr::Rsi, rn, Reg31::Zero)?;
                match host_cond(cond) {
                    HostCond::Always => store_gpr(em, rd, Reg31::Zero, Gpr::Rsi)?,
                    HostCond::Jcc(cc) => {
                        load_gpr(em, width, Gpr::R8, rm, Reg31::Zero)?;
                        match kind {
                            SelectKind::Csel => {}
                            SelectKind::Csinc => em.alu_ri(Alu::Add, width, Gpr::R8, 1)?,
                            SelectKind::Csinv => em.not(width, Gpr::R8)?,
                            SelectKind::Csneg => em.neg(width, Gpr::R8)?,
                        }
                        emit_load_flags(em)?;
                        em.cmov(cc, width, Gpr::R8, Gpr::Rsi)?;
                        store_gpr(em, rd, Reg31::Zero, Gpr::R8)?;
                    }
                }
            }
            CompareOp::Vector { cmp, q, width, rd, rn, rm } => {
                emit_vector_compare(em, options, cmp, q, width, (rd, rn, rm))?;
            }
        }
        Ok(())
    }
}
