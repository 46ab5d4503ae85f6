//! 向量数据处理：ADD/SUB/MUL/NEG、AND/BIC/ORR/ORN/EOR/NOT、SHL/USHR/SSHR、
//! ZIP1/ZIP2、EXT、INS（通用寄存器）、UMOV、ADDV/SMAXV/UMAXV/SMINV/UMINV
//!
//! Q=0 的形式只写低 64 位并清零高 64 位。发射时中间结果放在临时 XMM 中，
//! 临时寄存器用前压栈、用后恢复，目标寄存器可以与任一源寄存器相同。

use dbt_core::{CpuContext, GuestAddr, GuestMemory, Reg31, Vector128};
use dbt_simd::{
    LaneWidth, v128_add, v128_addv, v128_and, v128_bic, v128_ext, v128_mul, v128_neg, v128_not, v128_or,
    v128_orn, v128_shl_lanes, v128_shr, v128_smaxv, v128_sminv, v128_sshr_lanes, v128_sub, v128_umaxv,
    v128_uminv, v128_ushr_lanes, v128_xor, v128_zip_hi, v128_zip_lo,
};

use super::fields::{bit, bits, rd, rm, rn};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, load_gpr, store_gpr, unallocated,
    unimplemented,
};
use crate::emit::x86::{Gpr, PackedOp, PackedShift, Width, Xmm, scratch_xmm};
use crate::emit::Emitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithKind {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicKind {
    And,
    Bic,
    Orr,
    Orn,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Shl,
    Ushr,
    Sshr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Addv,
    Smaxv,
    Umaxv,
    Sminv,
    Uminv,
}

impl ReduceKind {
    fn mnemonic(self) -> &'static str {
        match self {
            ReduceKind::Addv => "ADDV",
            ReduceKind::Smaxv => "SMAXV",
            ReduceKind::Umaxv => "UMAXV",
            ReduceKind::Sminv => "SMINV",
            ReduceKind::Uminv => "UMINV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Arith {
        kind: ArithKind,
        q: bool,
        width: LaneWidth,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    Neg {
        q: bool,
        width: LaneWidth,
        rd: u8,
        rn: u8,
    },
    Logic {
        kind: LogicKind,
        q: bool,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    Not {
        q: bool,
        rd: u8,
        rn: u8,
    },
    Shift {
        kind: ShiftKind,
        q: bool,
        width: LaneWidth,
        amount: u8,
        rd: u8,
        rn: u8,
    },
    Zip {
        high: bool,
        q: bool,
        width: LaneWidth,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    /// EXT，`index` 以字节计
    Ext {
        q: bool,
        index: u8,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    /// INS Vd.T[index], Rn
    Ins {
        width: LaneWidth,
        index: u8,
        rd: u8,
        rn: u8,
    },
    /// UMOV Rd, Vn.T[index]
    Umov {
        width: LaneWidth,
        index: u8,
        rd: u8,
        rn: u8,
    },
    Reduce {
        kind: ReduceKind,
        q: bool,
        width: LaneWidth,
        rd: u8,
        rn: u8,
    },
}

/// 按 size 字段取通道宽度；64 位通道要求 Q=1
fn lane_width(encoding: u32, mnemonic: &'static str) -> Result<(bool, LaneWidth), DispatchError> {
    let q = bit(encoding, 30);
    let size = bits(encoding, 22, 2);
    if size == 3 && !q {
        return Err(unallocated(encoding, mnemonic));
    }
    Ok((q, LaneWidth::from_size_field(size)))
}

fn arith(kind: ArithKind, mnemonic: &'static str, encoding: u32) -> Result<VectorOp, DispatchError> {
    let (q, width) = lane_width(encoding, mnemonic)?;
    if kind == ArithKind::Mul && width == LaneWidth::B64 {
        return Err(unallocated(encoding, mnemonic));
    }
    Ok(VectorOp::Arith {
        kind,
        q,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_add(encoding: u32) -> Result<VectorOp, DispatchError> {
    arith(ArithKind::Add, "ADD (vector)", encoding)
}

fn decode_sub(encoding: u32) -> Result<VectorOp, DispatchError> {
    arith(ArithKind::Sub, "SUB (vector)", encoding)
}

fn decode_mul(encoding: u32) -> Result<VectorOp, DispatchError> {
    arith(ArithKind::Mul, "MUL (vector)", encoding)
}

fn decode_neg(encoding: u32) -> Result<VectorOp, DispatchError> {
    let (q, width) = lane_width(encoding, "NEG (vector)")?;
    Ok(VectorOp::Neg {
        q,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn logic(kind: LogicKind, encoding: u32) -> Result<VectorOp, DispatchError> {
    Ok(VectorOp::Logic {
        kind,
        q: bit(encoding, 30),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_and(encoding: u32) -> Result<VectorOp, DispatchError> {
    logic(LogicKind::And, encoding)
}

fn decode_bic(encoding: u32) -> Result<VectorOp, DispatchError> {
    logic(LogicKind::Bic, encoding)
}

fn decode_orr(encoding: u32) -> Result<VectorOp, DispatchError> {
    logic(LogicKind::Orr, encoding)
}

fn decode_orn(encoding: u32) -> Result<VectorOp, DispatchError> {
    logic(LogicKind::Orn, encoding)
}

fn decode_eor(encoding: u32) -> Result<VectorOp, DispatchError> {
    logic(LogicKind::Eor, encoding)
}

fn decode_not(encoding: u32) -> Result<VectorOp, DispatchError> {
    Ok(VectorOp::Not {
        q: bit(encoding, 30),
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

/// immh:immb 编码的移位立即数；immh 为 0 时属于修改立即数指令类
fn shift(kind: ShiftKind, mnemonic: &'static str, encoding: u32) -> Result<VectorOp, DispatchError> {
    let immh = bits(encoding, 19, 4);
    if immh == 0 {
        return Err(DispatchError::NotMatched { encoding });
    }
    let q = bit(encoding, 30);
    let width = match immh {
        0b1000..=0b1111 => LaneWidth::B64,
        0b0100..=0b0111 => LaneWidth::B32,
        0b0010..=0b0011 => LaneWidth::B16,
        _ => LaneWidth::B8,
    };
    if width == LaneWidth::B64 && !q {
        return Err(unallocated(encoding, mnemonic));
    }
    let imm = bits(encoding, 16, 7);
    let esize = width.bits();
    let amount = match kind {
        ShiftKind::Shl => imm - esize,
        ShiftKind::Ushr | ShiftKind::Sshr => 2 * esize - imm,
    };
    Ok(VectorOp::Shift {
        kind,
        q,
        width,
        amount: amount as u8,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_shl(encoding: u32) -> Result<VectorOp, DispatchError> {
    shift(ShiftKind::Shl, "SHL", encoding)
}

fn decode_ushr(encoding: u32) -> Result<VectorOp, DispatchError> {
    shift(ShiftKind::Ushr, "USHR", encoding)
}

fn decode_sshr(encoding: u32) -> Result<VectorOp, DispatchError> {
    shift(ShiftKind::Sshr, "SSHR", encoding)
}

fn zip(high: bool, mnemonic: &'static str, encoding: u32) -> Result<VectorOp, DispatchError> {
    let (q, width) = lane_width(encoding, mnemonic)?;
    Ok(VectorOp::Zip {
        high,
        q,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_zip1(encoding: u32) -> Result<VectorOp, DispatchError> {
    zip(false, "ZIP1", encoding)
}

fn decode_zip2(encoding: u32) -> Result<VectorOp, DispatchError> {
    zip(true, "ZIP2", encoding)
}

fn decode_ext(encoding: u32) -> Result<VectorOp, DispatchError> {
    let q = bit(encoding, 30);
    let index = bits(encoding, 11, 4);
    if !q && index >= 8 {
        return Err(unallocated(encoding, "EXT"));
    }
    Ok(VectorOp::Ext {
        q,
        index: index as u8,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

/// imm5 最低的置位决定元素宽度，其上的位是元素下标
fn element(encoding: u32, mnemonic: &'static str) -> Result<(LaneWidth, u8), DispatchError> {
    let imm5 = bits(encoding, 16, 5);
    let width = match imm5.trailing_zeros() {
        0 => LaneWidth::B8,
        1 => LaneWidth::B16,
        2 => LaneWidth::B32,
        3 => LaneWidth::B64,
        _ => return Err(unallocated(encoding, mnemonic)),
    };
    let index = imm5 >> (imm5.trailing_zeros() + 1);
    Ok((width, index as u8))
}

fn decode_ins(encoding: u32) -> Result<VectorOp, DispatchError> {
    let (width, index) = element(encoding, "INS (general)")?;
    Ok(VectorOp::Ins {
        width,
        index,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_umov(encoding: u32) -> Result<VectorOp, DispatchError> {
    let (width, index) = element(encoding, "UMOV")?;
    // Q=1 只用于 64 位元素（UMOV Xd），Q=0 只用于 8/16/32 位元素
    if bit(encoding, 30) != (width == LaneWidth::B64) {
        return Err(unallocated(encoding, "UMOV"));
    }
    Ok(VectorOp::Umov {
        width,
        index,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn reduce(kind: ReduceKind, encoding: u32) -> Result<VectorOp, DispatchError> {
    let (q, width) = lane_width(encoding, kind.mnemonic())?;
    // 至少需要 4 个通道
    if width == LaneWidth::B64 || (width == LaneWidth::B32 && !q) {
        return Err(unallocated(encoding, kind.mnemonic()));
    }
    Ok(VectorOp::Reduce {
        kind,
        q,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
    })
}

fn decode_addv(encoding: u32) -> Result<VectorOp, DispatchError> {
    reduce(ReduceKind::Addv, encoding)
}

fn decode_smaxv(encoding: u32) -> Result<VectorOp, DispatchError> {
    reduce(ReduceKind::Smaxv, encoding)
}

fn decode_umaxv(encoding: u32) -> Result<VectorOp, DispatchError> {
    reduce(ReduceKind::Umaxv, encoding)
}

fn decode_sminv(encoding: u32) -> Result<VectorOp, DispatchError> {
    reduce(ReduceKind::Sminv, encoding)
}

fn decode_uminv(encoding: u32) -> Result<VectorOp, DispatchError> {
    reduce(ReduceKind::Uminv, encoding)
}

pub static PATTERNS: &[Pattern<VectorOp>] = &[
    Pattern { mask: 0xBF20_FC00, value: 0x0E20_8400, mnemonic: "ADD (vector)", decode: decode_add },
    Pattern { mask: 0xBF20_FC00, value: 0x2E20_8400, mnemonic: "SUB (vector)", decode: decode_sub },
    Pattern { mask: 0xBF20_FC00, value: 0x0E20_9C00, mnemonic: "MUL (vector)", decode: decode_mul },
    Pattern { mask: 0xBF3F_FC00, value: 0x2E20_B800, mnemonic: "NEG (vector)", decode: decode_neg },
    Pattern { mask: 0xBFE0_FC00, value: 0x0E20_1C00, mnemonic: "AND (vector)", decode: decode_and },
    Pattern { mask: 0xBFE0_FC00, value: 0x0E60_1C00, mnemonic: "BIC (vector)", decode: decode_bic },
    Pattern { mask: 0xBFE0_FC00, value: 0x0EA0_1C00, mnemonic: "ORR (vector)", decode: decode_orr },
    Pattern { mask: 0xBFE0_FC00, value: 0x0EE0_1C00, mnemonic: "ORN (vector)", decode: decode_orn },
    Pattern { mask: 0xBFE0_FC00, value: 0x2E20_1C00, mnemonic: "EOR (vector)", decode: decode_eor },
    Pattern { mask: 0xBFFF_FC00, value: 0x2E20_5800, mnemonic: "NOT", decode: decode_not },
    Pattern { mask: 0xBF80_FC00, value: 0x0F00_5400, mnemonic: "SHL", decode: decode_shl },
    Pattern { mask: 0xBF80_FC00, value: 0x2F00_0400, mnemonic: "USHR", decode: decode_ushr },
    Pattern { mask: 0xBF80_FC00, value: 0x0F00_0400, mnemonic: "SSHR", decode: decode_sshr },
    Pattern { mask: 0xBF20_FC00, value: 0x0E00_3800, mnemonic: "ZIP1", decode: decode_zip1 },
    Pattern { mask: 0xBF20_FC00, value: 0x0E00_7800, mnemonic: "ZIP2", decode: decode_zip2 },
    Pattern { mask: 0xBFE0_8400, value: 0x2E00_0000, mnemonic: "EXT", decode: decode_ext },
    Pattern { mask: 0xFFE0_FC00, value: 0x4E00_1C00, mnemonic: "INS (general)", decode: decode_ins },
    Pattern { mask: 0xBFE0_FC00, value: 0x0E00_3C00, mnemonic: "UMOV", decode: decode_umov },
    Pattern { mask: 0xBF3F_FC00, value: 0x0E31_B800, mnemonic: "ADDV", decode: decode_addv },
    Pattern { mask: 0xBF3F_FC00, value: 0x0E30_A800, mnemonic: "SMAXV", decode: decode_smaxv },
    Pattern { mask: 0xBF3F_FC00, value: 0x2E30_A800, mnemonic: "UMAXV", decode: decode_umaxv },
    Pattern { mask: 0xBF3F_FC00, value: 0x0E31_A800, mnemonic: "SMINV", decode: decode_sminv },
    Pattern { mask: 0xBF3F_FC00, value: 0x2E31_A800, mnemonic: "UMINV", decode: decode_uminv },
];

pub(crate) struct VectorFamily;

fn finish(value: Vector128, q: bool) -> Vector128 {
    if q { value } else { value.clear_upper() }
}

fn interpret_reduce(kind: ReduceKind, q: bool, width: LaneWidth, n: Vector128) -> u64 {
    // 64 位形式：求和时高半部补零，求极值时复制低半部，二者都不改变结果
    let value = match kind {
        ReduceKind::Addv => v128_addv(finish(n, q), width),
        ReduceKind::Smaxv | ReduceKind::Umaxv | ReduceKind::Sminv | ReduceKind::Uminv => {
            let n = if q { n } else { Vector128::new(n.lo, n.lo) };
            match kind {
                ReduceKind::Smaxv => v128_smaxv(n, width) as u64,
                ReduceKind::Umaxv => v128_umaxv(n, width),
                ReduceKind::Sminv => v128_sminv(n, width) as u64,
                _ => v128_uminv(n, width),
            }
        }
    };
    value & width.mask()
}

// ----------------------------------------------------------------------
// 发射
// ----------------------------------------------------------------------

/// 在临时寄存器中计算 `f(t)`，结果写入 `d`；`f` 可以自由读取源寄存器
fn via_scratch(
    em: &mut Emitter,
    d: Xmm,
    sources: &[Xmm],
    f: impl FnOnce(&mut Emitter, Xmm) -> Result<(), DispatchError>,
) -> Result<(), DispatchError> {
    let mut avoid = sources.to_vec();
    avoid.push(d);
    let t = scratch_xmm(&avoid);
    em.spill_xmm(t)?;
    f(em, t)?;
    em.movapd(d, t)?;
    em.unspill_xmm(t)?;
    Ok(())
}

/// d = a op b，op 为双操作数形式 `op dst, src`
fn emit_binary(em: &mut Emitter, op: PackedOp, commutative: bool, d: Xmm, a: Xmm, b: Xmm) -> Result<(), DispatchError> {
    if d == a {
        em.packed(op, d, b)?;
    } else if d == b && commutative {
        em.packed(op, d, a)?;
    } else if d != b {
        em.movapd(d, a)?;
        em.packed(op, d, b)?;
    } else {
        via_scratch(em, d, &[a, b], |em, t| {
            em.movapd(t, a)?;
            em.packed(op, t, b)?;
            Ok(())
        })?;
    }
    Ok(())
}

fn clear_if_narrow(em: &mut Emitter, q: bool, d: Xmm) -> Result<(), DispatchError> {
    if !q {
        em.movq_xx(d, d)?;
    }
    Ok(())
}

fn arith_op(kind: ArithKind, width: LaneWidth, options: &EmitOptions) -> Result<PackedOp, DispatchError> {
    Ok(match (kind, width) {
        (ArithKind::Add, LaneWidth::B8) => PackedOp::Paddb,
        (ArithKind::Add, LaneWidth::B16) => PackedOp::Paddw,
        (ArithKind::Add, LaneWidth::B32) => PackedOp::Paddd,
        (ArithKind::Add, LaneWidth::B64) => PackedOp::Paddq,
        (ArithKind::Sub, LaneWidth::B8) => PackedOp::Psubb,
        (ArithKind::Sub, LaneWidth::B16) => PackedOp::Psubw,
        (ArithKind::Sub, LaneWidth::B32) => PackedOp::Psubd,
        (ArithKind::Sub, LaneWidth::B64) => PackedOp::Psubq,
        (ArithKind::Mul, LaneWidth::B16) => PackedOp::Pmullw,
        (ArithKind::Mul, LaneWidth::B32) => {
            options.require(options.features.sse41, "MUL (vector)", "pmulld requires SSE4.1")?;
            PackedOp::Pmulld
        }
        (ArithKind::Mul, _) => return Err(unimplemented("MUL (vector)", "no packed byte multiply on the host")),
    })
}

fn shift_op(kind: ShiftKind, width: LaneWidth) -> Result<PackedShift, DispatchError> {
    let mnemonic = match kind {
        ShiftKind::Shl => "SHL",
        ShiftKind::Ushr => "USHR",
        ShiftKind::Sshr => "SSHR",
    };
    Ok(match (kind, width) {
        (_, LaneWidth::B8) => return Err(unimplemented(mnemonic, "no packed byte shift on the host")),
        (ShiftKind::Shl, LaneWidth::B16) => PackedShift::Psllw,
        (ShiftKind::Shl, LaneWidth::B32) => PackedShift::Pslld,
        (ShiftKind::Shl, LaneWidth::B64) => PackedShift::Psllq,
        (ShiftKind::Ushr, LaneWidth::B16) => PackedShift::Psrlw,
        (ShiftKind::Ushr, LaneWidth::B32) => PackedShift::Psrld,
        (ShiftKind::Ushr, LaneWidth::B64) => PackedShift::Psrlq,
        (ShiftKind::Sshr, LaneWidth::B16) => PackedShift::Psraw,
        (ShiftKind::Sshr, LaneWidth::B32) => PackedShift::Psrad,
        (ShiftKind::Sshr, LaneWidth::B64) => {
            return Err(unimplemented(mnemonic, "no packed 64-bit arithmetic shift on the host"));
        }
    })
}

const fn unpack_op(high: bool, width: LaneWidth) -> PackedOp {
    match (high, width) {
        (false, LaneWidth::B8) => PackedOp::Punpcklbw,
        (false, LaneWidth::B16) => PackedOp::Punpcklwd,
        (false, LaneWidth::B32) => PackedOp::Punpckldq,
        (false, LaneWidth::B64) => PackedOp::Punpcklqdq,
        (true, LaneWidth::B8) => PackedOp::Punpckhbw,
        (true, LaneWidth::B16) => PackedOp::Punpckhwd,
        (true, LaneWidth::B32) => PackedOp::Punpckhdq,
        (true, LaneWidth::B64) => PackedOp::Punpckhqdq,
    }
}

/// pinsrw/pextrw 是 SSE2，其余宽度需要 SSE4.1
fn require_lane_access(options: &EmitOptions, width: LaneWidth, mnemonic: &'static str) -> Result<(), DispatchError> {
    if width == LaneWidth::B16 {
        return Ok(());
    }
    options.require(options.features.sse41, mnemonic, "pinsr/pextr for this lane width require SSE4.1")
}

const fn gpr_width(width: LaneWidth) -> Width {
    match width {
        LaneWidth::B64 => Width::W64,
        _ => Width::W32,
    }
}

impl FamilyImpl for VectorFamily {
    type Op = VectorOp;

    const FAMILY: Family = Family::Vector;

    fn patterns() -> &'static [Pattern<VectorOp>] {
        PATTERNS
    }

    fn control(_op: &VectorOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &VectorOp,
        _pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        match *op {
            VectorOp::Arith { kind, q, width, rd, rn, rm } => {
                let (n, m) = (ctx.v(rn), ctx.v(rm));
                let value = match kind {
                    ArithKind::Add => v128_add(n, m, width),
                    ArithKind::Sub => v128_sub(n, m, width),
                    ArithKind::Mul => v128_mul(n, m, width),
                };
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Neg { q, width, rd, rn } => {
                let value = v128_neg(ctx.v(rn), width);
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Logic { kind, q, rd, rn, rm } => {
                let (n, m) = (ctx.v(rn), ctx.v(rm));
                let value = match kind {
                    LogicKind::And => v128_and(n, m),
                    LogicKind::Bic => v128_bic(n, m),
                    LogicKind::Orr => v128_or(n, m),
                    LogicKind::Orn => v128_orn(n, m),
                    LogicKind::Eor => v128_xor(n, m),
                };
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Not { q, rd, rn } => {
                let value = v128_not(ctx.v(rn));
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Shift { kind, q, width, amount, rd, rn } => {
                let n = ctx.v(rn);
                let amount = u32::from(amount);
                let value = match kind {
                    ShiftKind::Shl => v128_shl_lanes(n, amount, width),
                    ShiftKind::Ushr => v128_ushr_lanes(n, amount, width),
                    ShiftKind::Sshr => v128_sshr_lanes(n, amount, width),
                };
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Zip { high, q, width, rd, rn, rm } => {
                let (n, m) = (ctx.v(rn), ctx.v(rm));
                let value = match (high, q) {
                    (false, _) => v128_zip_lo(n, m, width),
                    (true, true) => v128_zip_hi(n, m, width),
                    // 64 位形式的高半部分是第 32..64 位
                    (true, false) => v128_zip_lo(v128_shr(n, 32), v128_shr(m, 32), width),
                };
                ctx.set_v(rd, finish(value, q));
            }
            VectorOp::Ext { q, index, rd, rn, rm } => {
                let (n, m) = (ctx.v(rn), ctx.v(rm));
                let value = if q {
                    v128_ext(n, m, u32::from(index))
                } else {
                    let joined = u128::from(n.lo) | (u128::from(m.lo) << 64);
                    Vector128::from_u128(joined >> (u32::from(index) * 8)).clear_upper()
                };
                ctx.set_v(rd, value);
            }
            VectorOp::Ins { width, index, rd, rn } => {
                let value = ctx.v(rd).with_lane(width, usize::from(index), ctx.x(rn) & width.mask());
                ctx.set_v(rd, value);
            }
            VectorOp::Umov { width, index, rd, rn } => {
                let value = ctx.v(rn).lane(width, usize::from(index));
                ctx.set_x(rd, value);
            }
            VectorOp::Reduce { kind, q, width, rd, rn } => {
                let value = interpret_reduce(kind, q, width, ctx.v(rn));
                ctx.set_v(rd, Vector128::new(value, 0));
            }
        }
        Ok(None)
    }

    fn emit(op: &VectorOp, _pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            VectorOp::Arith { kind, q, width, rd, rn, rm } => {
                let host = arith_op(kind, width, options)?;
                let (d, n, m) = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                emit_binary(em, host, kind != ArithKind::Sub, d, n, m)?;
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Neg { q, width, rd, rn } => {
                let host = arith_op(ArithKind::Sub, width, options)?;
                let (d, n) = (options.vreg(rd)?, options.vreg(rn)?);
                via_scratch(em, d, &[n], |em, t| {
                    em.packed(PackedOp::Pxor, t, t)?;
                    em.packed(host, t, n)?;
                    Ok(())
                })?;
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Logic { kind, q, rd, rn, rm } => {
                let (d, n, m) = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                match kind {
                    LogicKind::And => emit_binary(em, PackedOp::Pand, true, d, n, m)?,
                    LogicKind::Orr => emit_binary(em, PackedOp::Por, true, d, n, m)?,
                    LogicKind::Eor => emit_binary(em, PackedOp::Pxor, true, d, n, m)?,
                    // pandn dst, src = !dst & src
                    LogicKind::Bic => via_scratch(em, d, &[n, m], |em, t| {
                        em.movapd(t, m)?;
                        em.packed(PackedOp::Pandn, t, n)?;
                        Ok(())
                    })?,
                    LogicKind::Orn => via_scratch(em, d, &[n, m], |em, t| {
                        em.packed(PackedOp::Pcmpeqd, t, t)?;
                        em.packed(PackedOp::Pxor, t, m)?;
                        em.packed(PackedOp::Por, t, n)?;
                        Ok(())
                    })?,
                }
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Not { q, rd, rn } => {
                let (d, n) = (options.vreg(rd)?, options.vreg(rn)?);
                via_scratch(em, d, &[n], |em, t| {
                    em.packed(PackedOp::Pcmpeqd, t, t)?;
                    em.packed(PackedOp::Pxor, t, n)?;
                    Ok(())
                })?;
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Shift { kind, q, width, amount, rd, rn } => {
                let host = shift_op(kind, width)?;
                let (d, n) = (options.vreg(rd)?, options.vreg(rn)?);
                if d != n {
                    em.movapd(d, n)?;
                }
                em.packed_shift(host, d, amount)?;
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Zip { high, q, width, rd, rn, rm } => {
                if high && !q {
                    return Err(unimplemented("ZIP2", "64-bit form in emitted code"));
                }
                let (d, n, m) = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                emit_binary(em, unpack_op(high, width), false, d, n, m)?;
                clear_if_narrow(em, q, d)?;
            }
            VectorOp::Ext { q, index, rd, rn, rm } => {
                if !q {
                    return Err(unimplemented("EXT", "64-bit form in emitted code"));
                }
                options.require(options.features.ssse3, "EXT", "palignr requires SSSE3")?;
                let (d, n, m) = (options.vreg(rd)?, options.vreg(rn)?, options.vreg(rm)?);
                // palignr dst, src 取 dst:src 右移，所以 m 作为高半部分
                if d == m {
                    em.palignr(d, n, index)?;
                } else {
                    via_scratch(em, d, &[n, m], |em, t| {
                        em.movapd(t, m)?;
                        em.palignr(t, n, index)?;
                        Ok(())
                    })?;
                }
            }
            VectorOp::Ins { width, index, rd, rn } => {
                require_lane_access(options, width, "INS (general)")?;
                let d = options.vreg(rd)?;
                load_gpr(em, gpr_width(width), Gpr::Rax, rn, Reg31::Zero)?;
                em.pinsr(width.bytes(), d, Gpr::Rax, index)?;
            }
            VectorOp::Umov { width, index, rd, rn } => {
                require_lane_access(options, width, "UMOV")?;
                let n = options.vreg(rn)?;
                em.pextr(width.bytes(), Gpr::Rax, n, index)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            VectorOp::Reduce { kind, .. } => {
                return Err(unimplemented(kind.mnemonic(), "across-lane reduction in emitted code"));
            }
        }
        Ok(())
    }
}
