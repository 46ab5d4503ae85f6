//! 分支指令族：B、BL、B.cond、CBZ/CBNZ、TBZ/TBNZ、BR、BLR、RET
//!
//! 所有分支都结束基本块。发射的代码把下一条客户机 PC 写入保存区后 `ret`，
//! 条件分支用 cmov 在两个候选地址之间选择。

use dbt_core::save_area::offsets;
use dbt_core::{Condition, CpuContext, GuestAddr, GuestMemory, Reg31};

use super::fields::{bit, bits, pc_relative, rd, rn, signed_field};
use super::flags::{HostCond, emit_load_flags, host_cond};
use super::{Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, load_gpr};
use crate::emit::Emitter;
use crate::emit::x86::{Cond, Gpr, Mem, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    /// B / BL
    Immediate { link: bool, offset: i64 },
    /// B.cond
    Conditional { cond: Condition, offset: i64 },
    /// CBZ / CBNZ
    CompareZero { nonzero: bool, width: Width, rt: u8, offset: i64 },
    /// TBZ / TBNZ
    TestBit { nonzero: bool, bit: u8, rt: u8, offset: i64 },
    /// BR / BLR / RET
    Register { link: bool, rn: u8 },
}

fn decode_imm26(encoding: u32) -> Result<BranchOp, DispatchError> {
    Ok(BranchOp::Immediate {
        link: bit(encoding, 31),
        offset: signed_field(encoding, 0, 26),
    })
}

fn decode_cond(encoding: u32) -> Result<BranchOp, DispatchError> {
    Ok(BranchOp::Conditional {
        cond: Condition::from_bits(bits(encoding, 0, 4)),
        offset: signed_field(encoding, 5, 19),
    })
}

fn decode_cbz(encoding: u32) -> Result<BranchOp, DispatchError> {
    Ok(BranchOp::CompareZero {
        nonzero: bit(encoding, 24),
        width: Width::from_sf(bit(encoding, 31)),
        rt: rd(encoding),
        offset: signed_field(encoding, 5, 19),
    })
}

fn decode_tbz(encoding: u32) -> Result<BranchOp, DispatchError> {
    Ok(BranchOp::TestBit {
        nonzero: bit(encoding, 24),
        bit: ((bits(encoding, 31, 1) << 5) | bits(encoding, 19, 5)) as u8,
        rt: rd(encoding),
        offset: signed_field(encoding, 5, 14),
    })
}

fn decode_register(encoding: u32) -> Result<BranchOp, DispatchError> {
    Ok(BranchOp::Register {
        link: bits(encoding, 21, 2) == 0b01,
        rn: rn(encoding),
    })
}

pub static PATTERNS: &[Pattern<BranchOp>] = &[
    Pattern { mask: 0xFC00_0000, value: 0x1400_0000, mnemonic: "B", decode: decode_imm26 },
    Pattern { mask: 0xFC00_0000, value: 0x9400_0000, mnemonic: "BL", decode: decode_imm26 },
    Pattern { mask: 0xFF00_0010, value: 0x5400_0000, mnemonic: "B.cond", decode: decode_cond },
    Pattern { mask: 0x7F00_0000, value: 0x3400_0000, mnemonic: "CBZ", decode: decode_cbz },
    Pattern { mask: 0x7F00_0000, value: 0x3500_0000, mnemonic: "CBNZ", decode: decode_cbz },
    Pattern { mask: 0x7F00_0000, value: 0x3600_0000, mnemonic: "TBZ", decode: decode_tbz },
    Pattern { mask: 0x7F00_0000, value: 0x3700_0000, mnemonic: "TBNZ", decode: decode_tbz },
    Pattern { mask: 0xFFFF_FC1F, value: 0xD61F_0000, mnemonic: "BR", decode: decode_register },
    Pattern { mask: 0xFFFF_FC1F, value: 0xD63F_0000, mnemonic: "BLR", decode: decode_register },
    Pattern { mask: 0xFFFF_FC1F, value: 0xD65F_0000, mnemonic: "RET", decode: decode_register },
];

pub(crate) struct BranchFamily;

impl BranchOp {
    fn offset(&self) -> Option<i64> {
        match *self {
            BranchOp::Immediate { offset, .. }
            | BranchOp::Conditional { offset, .. }
            | BranchOp::CompareZero { offset, .. }
            | BranchOp::TestBit { offset, .. } => Some(offset),
            BranchOp::Register { .. } => None,
        }
    }

    fn is_unconditional(&self) -> bool {
        match *self {
            BranchOp::Immediate { .. } | BranchOp::Register { .. } => true,
            BranchOp::Conditional { cond, .. } => host_cond(cond) == HostCond::Always,
            _ => false,
        }
    }
}

fn pc_slot() -> Mem {
    Mem::area(offsets::PC as i32)
}

/// 在 RAX（不成立）与 RCX（成立）之间按 `taken_when` 选择并退出
fn emit_select_exit(em: &mut Emitter, taken_when: Cond, fallthrough: GuestAddr, target: GuestAddr) -> Result<(), DispatchError> {
    em.mov_imm64(Gpr::Rax, fallthrough)?;
    em.mov_imm64(Gpr::Rcx, target)?;
    em.cmov(taken_when, Width::W64, Gpr::Rax, Gpr::Rcx)?;
    em.store(Width::W64, pc_slot(), Gpr::Rax)?;
    em.ret()?;
    Ok(())
}

impl FamilyImpl for BranchFamily {
    type Op = BranchOp;

    const FAMILY: Family = Family::Branch;

    fn patterns() -> &'static [Pattern<BranchOp>] {
        PATTERNS
    }

    fn control(op: &BranchOp, pc: GuestAddr) -> Control {
        match op.offset() {
            None => Control::Indirect,
            Some(offset) => Control::Direct {
                taken: pc_relative(pc, offset),
                fallthrough: (!op.is_unconditional()).then(|| pc.wrapping_add(4)),
            },
        }
    }

    fn interpret(
        op: &BranchOp,
        pc: GuestAddr,
        ctx: &mut CpuContext,
        _mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        let next = pc.wrapping_add(4);
        let taken = |offset: i64| pc_relative(pc, offset);
        let target = match *op {
            BranchOp::Immediate { link, offset } => {
                if link {
                    ctx.set_x(30, next);
                }
                taken(offset)
            }
            BranchOp::Conditional { cond, offset } => {
                if ctx.condition_holds(cond) { taken(offset) } else { next }
            }
            BranchOp::CompareZero { nonzero, width, rt, offset } => {
                let value = ctx.x(rt) & width.mask();
                if (value != 0) == nonzero { taken(offset) } else { next }
            }
            BranchOp::TestBit { nonzero, bit, rt, offset } => {
                let set = (ctx.x(rt) >> bit) & 1 != 0;
                if set == nonzero { taken(offset) } else { next }
            }
            BranchOp::Register { link, rn } => {
                // 先读目标，BLR X30 也能得到旧值
                let target = ctx.x(rn);
                if link {
                    ctx.set_x(30, next);
                }
                target
            }
        };
        Ok(Some(target))
    }

    fn emit(op: &BranchOp, pc: GuestAddr, em: &mut Emitter, _options: &EmitOptions) -> Result<(), DispatchError> {
        let next = pc.wrapping_add(4);
        match *op {
            BranchOp::Immediate { link, offset } => {
                if link {
                    em.mov_imm64(Gpr::Rax, next)?;
                    em.store(Width::W64, Mem::area(offsets::LR as i32), Gpr::Rax)?;
                }
                super::emit_exit(em, pc_relative(pc, offset))?;
            }
            BranchOp::Conditional { cond, offset } => match host_cond(cond) {
                HostCond::Always => super::emit_exit(em, pc_relative(pc, offset))?,
                HostCond::Jcc(host) => {
                    emit_load_flags(em)?;
                    emit_select_exit(em, host, next, pc_relative(pc, offset))?;
                }
            },
            BranchOp::CompareZero { nonzero, width, rt, offset } => {
                load_gpr(em, width, Gpr::Rdx, rt, Reg31::Zero)?;
                em.test_rr(width, Gpr::Rdx, Gpr::Rdx)?;
                let when = if nonzero { Cond::Ne } else { Cond::E };
                emit_select_exit(em, when, next, pc_relative(pc, offset))?;
            }
            BranchOp::TestBit { nonzero, bit, rt, offset } => {
                load_gpr(em, Width::W64, Gpr::Rdx, rt, Reg31::Zero)?;
                em.bt_ri(Width::W64, Gpr::Rdx, bit)?;
                let when = if nonzero { Cond::B } else { Cond::Ae };
                emit_select_exit(em, when, next, pc_relative(pc, offset))?;
            }
            BranchOp::Register { link, rn } => {
                load_gpr(em, Width::W64, Gpr::Rax, rn, Reg31::Zero)?;
                if link {
                    em.mov_imm64(Gpr::Rcx, next)?;
                    em.store(Width::W64, Mem::area(offsets::LR as i32), Gpr::Rcx)?;
                }
                em.store(Width::W64, pc_slot(), Gpr::Rax)?;
                em.ret()?;
            }
        }
        Ok(())
    }
}
