//! 整数运算指令族
//!
//! ADD/SUB/ADDS/SUBS（移位寄存器、立即数），ADC/SBC(S)，AND/BIC/ORR/ORN/EOR/EON/ANDS/BICS
//! （移位寄存器），AND/ORR/EOR/ANDS（位掩码立即数），MADD/MSUB，UDIV/SDIV，
//! LSLV/LSRV/ASRV/RORV，SBFM/BFM/UBFM（含 LSL/LSR/ASR/SXTW/UXTB 等别名），EXTR，
//! MOVZ/MOVN/MOVK，ADR/ADRP。
//!
//! 生成代码在 RAX/RCX 中计算，结果先写回目标槽位再保存标志；
//! `mov` 不影响 EFLAGS，所以顺序不会破坏 setcc 的输入。

use dbt_core::{CpuContext, GuestAddr, GuestMemory, Reg31};

use super::fields::{bit, bits, rd, rm, rn, ra, signed_field};
use super::flags::{CarryMode, add_with_carry, emit_store_flags, logic_flags};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, load_gpr, store_gpr, unallocated,
};
use dbt_core::save_area::offsets;

use crate::emit::Emitter;
use crate::emit::x86::{Alu, Cond, Gpr, Mem, Shift, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ShiftKind::Lsl,
            1 => ShiftKind::Lsr,
            2 => ShiftKind::Asr,
            _ => ShiftKind::Ror,
        }
    }

    const fn host(self) -> Shift {
        match self {
            ShiftKind::Lsl => Shift::Shl,
            ShiftKind::Lsr => Shift::Shr,
            ShiftKind::Asr => Shift::Sar,
            ShiftKind::Ror => Shift::Ror,
        }
    }

    /// 在给定宽度内移位，结果按宽度截断
    pub fn apply(self, value: u64, amount: u32, width: Width) -> u64 {
        let mask = width.mask();
        let bits = width.bits();
        let value = value & mask;
        let amount = amount % bits;
        let result = match self {
            ShiftKind::Lsl => value << amount,
            ShiftKind::Lsr => value >> amount,
            ShiftKind::Asr => (super::fields::sign_extend(value, bits) >> amount) as u64,
            ShiftKind::Ror if amount == 0 => value,
            ShiftKind::Ror => (value >> amount) | (value << (bits - amount)),
        };
        result & mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWideKind {
    /// MOVN
    Not,
    /// MOVZ
    Zero,
    /// MOVK
    Keep,
}

/// SBFM/BFM/UBFM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldKind {
    Signed,
    Insert,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    AddSubShifted {
        sub: bool,
        set_flags: bool,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftKind,
        amount: u8,
    },
    AddSubImm {
        sub: bool,
        set_flags: bool,
        width: Width,
        rd: u8,
        rn: u8,
        imm: u32,
    },
    Logical {
        op: LogicOp,
        invert: bool,
        set_flags: bool,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftKind,
        amount: u8,
    },
    MulAdd {
        sub: bool,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
        ra: u8,
    },
    Divide {
        signed: bool,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    MoveWide {
        kind: MoveWideKind,
        width: Width,
        rd: u8,
        imm16: u16,
        shift: u8,
    },
    /// ADC/ADCS/SBC/SBCS
    AddSubCarry {
        sub: bool,
        set_flags: bool,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    /// 位掩码立即数；不设置标志时 Rd=31 是 SP
    LogicalImm {
        op: LogicOp,
        set_flags: bool,
        width: Width,
        rd: u8,
        rn: u8,
        imm: u64,
    },
    /// LSLV/LSRV/ASRV/RORV，移位量按宽度取模
    ShiftVariable {
        shift: ShiftKind,
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    Bitfield {
        kind: BitfieldKind,
        width: Width,
        rd: u8,
        rn: u8,
        immr: u8,
        imms: u8,
        wmask: u64,
        tmask: u64,
    },
    /// EXTR：从 Rn:Rm 的第 `lsb` 位起取一个寄存器宽度
    Extract {
        width: Width,
        rd: u8,
        rn: u8,
        rm: u8,
        lsb: u8,
    },
    /// ADR/ADRP
    PcRelative { page: bool, rd: u8, offset: i64 },
}

const fn ones(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}

/// 展开 N:immr:imms 位掩码，返回 (wmask, tmask)
///
/// 元素大小由 N:NOT(imms) 的最高位决定，`immediate` 为真时全 1 元素是保留编码。
pub fn decode_bit_masks(n: bool, imms: u32, immr: u32, immediate: bool, width: Width) -> Option<(u64, u64)> {
    let combined = (u32::from(n) << 6) | (!imms & 0x3F);
    if combined <= 1 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    let esize = 1u32 << len;
    if esize > width.bits() {
        return None;
    }
    let levels = esize - 1;
    if immediate && imms & levels == levels {
        return None;
    }
    let s = imms & levels;
    let r = immr & levels;
    let d = s.wrapping_sub(r) & levels;

    let welem = ones(s + 1);
    let welem = if r == 0 {
        welem
    } else {
        ((welem >> r) | (welem << (esize - r))) & ones(esize)
    };
    let replicate = |elem: u64| {
        (0..width.bits() / esize).fold(0u64, |acc, i| acc | (elem << (i * esize)))
    };
    Some((replicate(welem), replicate(ones(d + 1))))
}

impl ArithOp {
    /// ADR/ADRP 的目标地址
    const fn pc_relative_target(page: bool, pc: GuestAddr, offset: i64) -> u64 {
        if page {
            (pc & !0xFFF).wrapping_add((offset << 12) as u64)
        } else {
            pc.wrapping_add(offset as u64)
        }
    }
}

/// 32 位形式的移位量不能超过 31
fn shift_amount(encoding: u32, width: Width, mnemonic: &'static str) -> Result<u8, DispatchError> {
    let amount = bits(encoding, 10, 6);
    if amount >= width.bits() {
        return Err(unallocated(encoding, mnemonic));
    }
    Ok(amount as u8)
}

fn decode_add_sub_shifted(encoding: u32) -> Result<ArithOp, DispatchError> {
    const MNEMONIC: &str = "ADD/SUB (shifted register)";
    let width = Width::from_sf(bit(encoding, 31));
    let shift = ShiftKind::from_bits(bits(encoding, 22, 2));
    if shift == ShiftKind::Ror {
        return Err(unallocated(encoding, MNEMONIC));
    }
    Ok(ArithOp::AddSubShifted {
        sub: bit(encoding, 30),
        set_flags: bit(encoding, 29),
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
        shift,
        amount: shift_amount(encoding, width, MNEMONIC)?,
    })
}

fn decode_add_sub_imm(encoding: u32) -> Result<ArithOp, DispatchError> {
    let imm = bits(encoding, 10, 12) << if bit(encoding, 22) { 12 } else { 0 };
    Ok(ArithOp::AddSubImm {
        sub: bit(encoding, 30),
        set_flags: bit(encoding, 29),
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
        imm,
    })
}

fn decode_logical(encoding: u32) -> Result<ArithOp, DispatchError> {
    let width = Width::from_sf(bit(encoding, 31));
    let opc = bits(encoding, 29, 2);
    let op = match opc {
        0 | 3 => LogicOp::And,
        1 => LogicOp::Orr,
        _ => LogicOp::Eor,
    };
    Ok(ArithOp::Logical {
        op,
        invert: bit(encoding, 21),
        set_flags: opc == 3,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
        shift: ShiftKind::from_bits(bits(encoding, 22, 2)),
        amount: shift_amount(encoding, width, "logical (shifted register)")?,
    })
}

fn decode_mul_add(encoding: u32) -> Result<ArithOp, DispatchError> {
    Ok(ArithOp::MulAdd {
        sub: bit(encoding, 15),
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
        ra: ra(encoding),
    })
}

fn decode_divide(encoding: u32) -> Result<ArithOp, DispatchError> {
    Ok(ArithOp::Divide {
        signed: bit(encoding, 10),
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_move_wide(encoding: u32) -> Result<ArithOp, DispatchError> {
    const MNEMONIC: &str = "MOVN/MOVZ/MOVK";
    let width = Width::from_sf(bit(encoding, 31));
    let kind = match bits(encoding, 29, 2) {
        0 => MoveWideKind::Not,
        2 => MoveWideKind::Zero,
        3 => MoveWideKind::Keep,
        _ => return Err(unallocated(encoding, MNEMONIC)),
    };
    let hw = bits(encoding, 21, 2);
    if width == Width::W32 && hw >= 2 {
        return Err(unallocated(encoding, MNEMONIC));
    }
    Ok(ArithOp::MoveWide {
        kind,
        width,
        rd: rd(encoding),
        imm16: bits(encoding, 5, 16) as u16,
        shift: (hw * 16) as u8,
    })
}

fn decode_add_sub_carry(encoding: u32) -> Result<ArithOp, DispatchError> {
    Ok(ArithOp::AddSubCarry {
        sub: bit(encoding, 30),
        set_flags: bit(encoding, 29),
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_logical_imm(encoding: u32) -> Result<ArithOp, DispatchError> {
    const MNEMONIC: &str = "logical (immediate)";
    let width = Width::from_sf(bit(encoding, 31));
    let n = bit(encoding, 22);
    if width == Width::W32 && n {
        return Err(unallocated(encoding, MNEMONIC));
    }
    let (imm, _) = decode_bit_masks(n, bits(encoding, 10, 6), bits(encoding, 16, 6), true, width)
        .ok_or_else(|| unallocated(encoding, MNEMONIC))?;
    let opc = bits(encoding, 29, 2);
    let op = match opc {
        0 | 3 => LogicOp::And,
        1 => LogicOp::Orr,
        _ => LogicOp::Eor,
    };
    Ok(ArithOp::LogicalImm {
        op,
        set_flags: opc == 3,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        imm,
    })
}

fn decode_shift_variable(encoding: u32) -> Result<ArithOp, DispatchError> {
    Ok(ArithOp::ShiftVariable {
        shift: ShiftKind::from_bits(bits(encoding, 10, 2)),
        width: Width::from_sf(bit(encoding, 31)),
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
    })
}

fn decode_bitfield(encoding: u32) -> Result<ArithOp, DispatchError> {
    const MNEMONIC: &str = "SBFM/BFM/UBFM";
    let width = Width::from_sf(bit(encoding, 31));
    let n = bit(encoding, 22);
    let immr = bits(encoding, 16, 6);
    let imms = bits(encoding, 10, 6);
    let kind = match bits(encoding, 29, 2) {
        0 => BitfieldKind::Signed,
        1 => BitfieldKind::Insert,
        2 => BitfieldKind::Unsigned,
        _ => return Err(unallocated(encoding, MNEMONIC)),
    };
    if n != (width == Width::W64) || immr >= width.bits() || imms >= width.bits() {
        return Err(unallocated(encoding, MNEMONIC));
    }
    let (wmask, tmask) =
        decode_bit_masks(n, imms, immr, false, width).ok_or_else(|| unallocated(encoding, MNEMONIC))?;
    Ok(ArithOp::Bitfield {
        kind,
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        immr: immr as u8,
        imms: imms as u8,
        wmask,
        tmask,
    })
}

fn decode_extract(encoding: u32) -> Result<ArithOp, DispatchError> {
    const MNEMONIC: &str = "EXTR";
    let width = Width::from_sf(bit(encoding, 31));
    let lsb = bits(encoding, 10, 6);
    if bit(encoding, 22) != (width == Width::W64) || lsb >= width.bits() {
        return Err(unallocated(encoding, MNEMONIC));
    }
    Ok(ArithOp::Extract {
        width,
        rd: rd(encoding),
        rn: rn(encoding),
        rm: rm(encoding),
        lsb: lsb as u8,
    })
}

fn decode_pc_relative(encoding: u32) -> Result<ArithOp, DispatchError> {
    let immlo = i64::from(bits(encoding, 29, 2));
    let immhi = signed_field(encoding, 5, 19);
    Ok(ArithOp::PcRelative {
        page: bit(encoding, 31),
        rd: rd(encoding),
        offset: (immhi << 2) | immlo,
    })
}

pub static PATTERNS: &[Pattern<ArithOp>] = &[
    Pattern { mask: 0x1F20_0000, value: 0x0B00_0000, mnemonic: "ADD/SUB (shifted register)", decode: decode_add_sub_shifted },
    Pattern { mask: 0x1F80_0000, value: 0x1100_0000, mnemonic: "ADD/SUB (immediate)", decode: decode_add_sub_imm },
    Pattern { mask: 0x1F00_0000, value: 0x0A00_0000, mnemonic: "logical (shifted register)", decode: decode_logical },
    Pattern { mask: 0x7FE0_0000, value: 0x1B00_0000, mnemonic: "MADD/MSUB", decode: decode_mul_add },
    Pattern { mask: 0x7FE0_F800, value: 0x1AC0_0800, mnemonic: "UDIV/SDIV", decode: decode_divide },
    Pattern { mask: 0x1F80_0000, value: 0x1280_0000, mnemonic: "MOVN/MOVZ/MOVK", decode: decode_move_wide },
    Pattern { mask: 0x1FE0_FC00, value: 0x1A00_0000, mnemonic: "ADC/SBC", decode: decode_add_sub_carry },
    Pattern { mask: 0x1F80_0000, value: 0x1200_0000, mnemonic: "logical (immediate)", decode: decode_logical_imm },
    Pattern { mask: 0x7FE0_F000, value: 0x1AC0_2000, mnemonic: "LSLV/LSRV/ASRV/RORV", decode: decode_shift_variable },
    Pattern { mask: 0x1F80_0000, value: 0x1300_0000, mnemonic: "SBFM/BFM/UBFM", decode: decode_bitfield },
    Pattern { mask: 0x7FA0_0000, value: 0x1380_0000, mnemonic: "EXTR", decode: decode_extract },
    Pattern { mask: 0x1F00_0000, value: 0x1000_0000, mnemonic: "ADR/ADRP", decode: decode_pc_relative },
];

pub(crate) struct ArithFamily;

fn add_sub(width: Width, sub: bool, a: u64, b: u64) -> (u64, dbt_core::Nzcv) {
    if sub {
        add_with_carry(width, a, !b, true)
    } else {
        add_with_carry(width, a, b, false)
    }
}

impl MoveWideKind {
    fn value(self, width: Width, old: u64, imm16: u16, shift: u8) -> u64 {
        let placed = u64::from(imm16) << shift;
        let value = match self {
            MoveWideKind::Zero => placed,
            MoveWideKind::Not => !placed,
            MoveWideKind::Keep => (old & !(0xFFFF << shift)) | placed,
        };
        value & width.mask()
    }
}

impl FamilyImpl for ArithFamily {
    type Op = ArithOp;

    const FAMILY: Family = Family::Arithmetic;

    fn patterns() -> &'static [Pattern<ArithOp>] {
        PATTERNS
    }

    fn control(_op: &ArithOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &ArithOp,
        pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        match *op {
            ArithOp::AddSubShifted { sub, set_flags, width, rd, rn, rm, shift, amount } => {
                let b = shift.apply(ctx.x(rm), u32::from(amount), width);
                let (result, flags) = add_sub(width, sub, ctx.x(rn), b);
                ctx.set_x(rd, result);
                if set_flags {
                    ctx.set_nzcv(flags);
                }
            }
            ArithOp::AddSubImm { sub, set_flags, width, rd, rn, imm } => {
                let (result, flags) = add_sub(width, sub, ctx.reg(rn, Reg31::Sp), u64::from(imm));
                if set_flags {
                    ctx.set_x(rd, result);
                    ctx.set_nzcv(flags);
                } else {
                    ctx.set_reg(rd, result, Reg31::Sp);
                }
            }
            ArithOp::Logical { op, invert, set_flags, width, rd, rn, rm, shift, amount } => {
                let mut b = shift.apply(ctx.x(rm), u32::from(amount), width);
                if invert {
                    b = !b;
                }
                let a = ctx.x(rn);
                let result = match op {
                    LogicOp::And => a & b,
                    LogicOp::Orr => a | b,
                    LogicOp::Eor => a ^ b,
                } & width.mask();
                ctx.set_x(rd, result);
                if set_flags {
                    ctx.set_nzcv(logic_flags(width, result));
                }
            }
            ArithOp::MulAdd { sub, width, rd, rn, rm, ra } => {
                let product = ctx.x(rn).wrapping_mul(ctx.x(rm));
                let acc = ctx.x(ra);
                let result = if sub { acc.wrapping_sub(product) } else { acc.wrapping_add(product) };
                ctx.set_x(rd, result & width.mask());
            }
            ArithOp::Divide { signed, width, rd, rn, rm } => {
                let mask = width.mask();
                let (a, b) = (ctx.x(rn) & mask, ctx.x(rm) & mask);
                let result = if b == 0 {
                    0
                } else if signed {
                    let bits = width.bits();
                    let a = super::fields::sign_extend(a, bits);
                    let b = super::fields::sign_extend(b, bits);
                    a.wrapping_div(b) as u64
                } else {
                    a / b
                };
                ctx.set_x(rd, result & mask);
            }
            ArithOp::MoveWide { kind, width, rd, imm16, shift } => {
                let value = kind.value(width, ctx.x(rd), imm16, shift);
                ctx.set_x(rd, value);
            }
            ArithOp::AddSubCarry { sub, set_flags, width, rd, rn, rm } => {
                let b = if sub { !ctx.x(rm) } else { ctx.x(rm) };
                let (result, flags) = add_with_carry(width, ctx.x(rn), b, ctx.nzcv().c);
                ctx.set_x(rd, result);
                if set_flags {
                    ctx.set_nzcv(flags);
                }
            }
            ArithOp::LogicalImm { op, set_flags, width, rd, rn, imm } => {
                let a = ctx.x(rn);
                let result = match op {
                    LogicOp::And => a & imm,
                    LogicOp::Orr => a | imm,
                    LogicOp::Eor => a ^ imm,
                } & width.mask();
                if set_flags {
                    ctx.set_x(rd, result);
                    ctx.set_nzcv(logic_flags(width, result));
                } else {
                    ctx.set_reg(rd, result, Reg31::Sp);
                }
            }
            ArithOp::ShiftVariable { shift, width, rd, rn, rm } => {
                let amount = (ctx.x(rm) % u64::from(width.bits())) as u32;
                ctx.set_x(rd, shift.apply(ctx.x(rn), amount, width));
            }
            ArithOp::Bitfield { kind, width, rd, rn, immr, imms, wmask, tmask } => {
                let mask = width.mask();
                let src = ctx.x(rn) & mask;
                let dst = if kind == BitfieldKind::Insert { ctx.x(rd) & mask } else { 0 };
                let bot = (dst & !wmask) | (ShiftKind::Ror.apply(src, u32::from(immr), width) & wmask);
                let top = match kind {
                    BitfieldKind::Signed if src >> imms & 1 != 0 => mask,
                    BitfieldKind::Signed | BitfieldKind::Unsigned => 0,
                    BitfieldKind::Insert => dst,
                };
                ctx.set_x(rd, ((top & !tmask) | (bot & tmask)) & mask);
            }
            ArithOp::Extract { width, rd, rn, rm, lsb } => {
                let mask = width.mask();
                let low = ctx.x(rm) & mask;
                let value = if lsb == 0 {
                    low
                } else {
                    ((low >> lsb) | (ctx.x(rn) << (width.bits() - u32::from(lsb)))) & mask
                };
                ctx.set_x(rd, value);
            }
            ArithOp::PcRelative { page, rd, offset } => {
                ctx.set_x(rd, ArithOp::pc_relative_target(page, pc, offset));
            }
        }
        Ok(None)
    }

    fn emit(op: &ArithOp, pc: GuestAddr, em: &mut Emitter, _options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            ArithOp::AddSubShifted { sub, set_flags, width, rd, rn, rm, shift, amount } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                em.shift_ri(shift.host(), width, Gpr::Rcx, amount)?;
                em.alu_rr(if sub { Alu::Sub } else { Alu::Add }, width, Gpr::Rax, Gpr::Rcx)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                if set_flags {
                    emit_store_flags(em, if sub { CarryMode::Borrow } else { CarryMode::Carry })?;
                }
            }
            ArithOp::AddSubImm { sub, set_flags, width, rd, rn, imm } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Sp)?;
                // imm12 最多左移 12 位，总在 i32 范围内
                em.alu_ri(if sub { Alu::Sub } else { Alu::Add }, width, Gpr::Rax, imm as i32)?;
                if set_flags {
                    store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                    emit_store_flags(em, if sub { CarryMode::Borrow } else { CarryMode::Carry })?;
                } else {
                    store_gpr(em, rd, Reg31::Sp, Gpr::Rax)?;
                }
            }
            ArithOp::Logical { op, invert, set_flags, width, rd, rn, rm, shift, amount } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                em.shift_ri(shift.host(), width, Gpr::Rcx, amount)?;
                if invert {
                    em.not(width, Gpr::Rcx)?;
                }
                let alu = match op {
                    LogicOp::And => Alu::And,
                    LogicOp::Orr => Alu::Or,
                    LogicOp::Eor => Alu::Xor,
                };
                em.alu_rr(alu, width, Gpr::Rax, Gpr::Rcx)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                if set_flags {
                    emit_store_flags(em, CarryMode::Clear)?;
                }
            }
            ArithOp::MulAdd { sub, width, rd, rn, rm, ra } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                em.imul_rr(width, Gpr::Rax, Gpr::Rcx)?;
                load_gpr(em, width, Gpr::Rcx, ra, Reg31::Zero)?;
                em.alu_rr(if sub { Alu::Sub } else { Alu::Add }, width, Gpr::Rcx, Gpr::Rax)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rcx)?;
            }
            ArithOp::Divide { signed, width, rd, rn, rm } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                em.test_rr(width, Gpr::Rcx, Gpr::Rcx)?;
                let nonzero = em.jcc_rel8(Cond::Ne)?;
                // 除数为 0 时结果为 0
                em.alu_rr(Alu::Xor, Width::W32, Gpr::Rax, Gpr::Rax)?;
                let mut done = vec![em.jmp_rel8()?];
                em.bind(nonzero)?;
                if signed {
                    // INT_MIN / -1 在 x86 上会触发 #DE，改用取负（结果仍为 INT_MIN）
                    em.alu_ri(Alu::Cmp, width, Gpr::Rcx, -1)?;
                    let divide = em.jcc_rel8(Cond::Ne)?;
                    em.neg(width, Gpr::Rax)?;
                    done.push(em.jmp_rel8()?);
                    em.bind(divide)?;
                    em.sign_extend_acc(width)?;
                    em.idiv(width, Gpr::Rcx)?;
                } else {
                    em.alu_rr(Alu::Xor, Width::W32, Gpr::Rdx, Gpr::Rdx)?;
                    em.div(width, Gpr::Rcx)?;
                }
                for fixup in done {
                    em.bind(fixup)?;
                }
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::MoveWide { kind, width, rd, imm16, shift } => {
                let placed = u64::from(imm16) << shift;
                match kind {
                    MoveWideKind::Zero | MoveWideKind::Not => {
                        em.mov_imm64(Gpr::Rax, kind.value(width, 0, imm16, shift))?;
                    }
                    MoveWideKind::Keep => {
                        load_gpr(em, width, Gpr::Rax, rd, Reg31::Zero)?;
                        em.mov_imm64(Gpr::Rcx, !(0xFFFFu64 << shift) & width.mask())?;
                        em.alu_rr(Alu::And, width, Gpr::Rax, Gpr::Rcx)?;
                        em.mov_imm64(Gpr::Rcx, placed)?;
                        em.alu_rr(Alu::Or, width, Gpr::Rax, Gpr::Rcx)?;
                    }
                }
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::AddSubCarry { sub, set_flags, width, rd, rn, rm } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                // C (槽位第 29 位) -> CF；SBC 借位是 !C
                em.load(Width::W32, Gpr::Rdx, Mem::area(offsets::NZCV as i32))?;
                em.bt_ri(Width::W32, Gpr::Rdx, 29)?;
                if sub {
                    em.cmc()?;
                }
                em.alu_rr(if sub { Alu::Sbb } else { Alu::Adc }, width, Gpr::Rax, Gpr::Rcx)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                if set_flags {
                    emit_store_flags(em, if sub { CarryMode::Borrow } else { CarryMode::Carry })?;
                }
            }
            ArithOp::LogicalImm { op, set_flags, width, rd, rn, imm } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                em.mov_imm64(Gpr::Rcx, imm)?;
                let alu = match op {
                    LogicOp::And => Alu::And,
                    LogicOp::Orr => Alu::Or,
                    LogicOp::Eor => Alu::Xor,
                };
                em.alu_rr(alu, width, Gpr::Rax, Gpr::Rcx)?;
                if set_flags {
                    store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
                    emit_store_flags(em, CarryMode::Clear)?;
                } else {
                    store_gpr(em, rd, Reg31::Sp, Gpr::Rax)?;
                }
            }
            ArithOp::ShiftVariable { shift, width, rd, rn, rm } => {
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rcx, rm, Reg31::Zero)?;
                em.shift_cl(shift.host(), width, Gpr::Rax)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::Bitfield { kind: BitfieldKind::Insert, width, rd, rn, immr, wmask, tmask, .. } => {
                let field = wmask & tmask;
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                em.shift_ri(Shift::Ror, width, Gpr::Rax, immr)?;
                em.mov_imm64(Gpr::Rdx, field)?;
                em.alu_rr(Alu::And, width, Gpr::Rax, Gpr::Rdx)?;
                load_gpr(em, width, Gpr::Rcx, rd, Reg31::Zero)?;
                em.not(width, Gpr::Rdx)?;
                em.alu_rr(Alu::And, width, Gpr::Rcx, Gpr::Rdx)?;
                em.alu_rr(Alu::Or, width, Gpr::Rax, Gpr::Rcx)?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::Bitfield { kind, width, rd, rn, immr, imms, .. } => {
                let right = if kind == BitfieldKind::Signed { Shift::Sar } else { Shift::Shr };
                let top = (width.bits() - 1) as u8 - imms;
                load_gpr(em, width, Gpr::Rax, rn, Reg31::Zero)?;
                em.shift_ri(Shift::Shl, width, Gpr::Rax, top)?;
                if imms >= immr {
                    // 取出 [immr, imms] 放到低位
                    em.shift_ri(right, width, Gpr::Rax, top + immr)?;
                } else {
                    // 低 imms+1 位扩展后放到 width-immr 处
                    em.shift_ri(right, width, Gpr::Rax, top)?;
                    em.shift_ri(Shift::Shl, width, Gpr::Rax, width.bits() as u8 - immr)?;
                }
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::Extract { width, rd, rn, rm, lsb } => {
                load_gpr(em, width, Gpr::Rax, rm, Reg31::Zero)?;
                if lsb != 0 {
                    load_gpr(em, width, Gpr::Rcx, rn, Reg31::Zero)?;
                    em.shift_ri(Shift::Shr, width, Gpr::Rax, lsb)?;
                    em.shift_ri(Shift::Shl, width, Gpr::Rcx, width.bits() as u8 - lsb)?;
                    em.alu_rr(Alu::Or, width, Gpr::Rax, Gpr::Rcx)?;
                }
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
            ArithOp::PcRelative { page, rd, offset } => {
                em.mov_imm64(Gpr::Rax, ArithOp::pc_relative_target(page, pc, offset))?;
                store_gpr(em, rd, Reg31::Zero, Gpr::Rax)?;
            }
        }
        Ok(())
    }
}
