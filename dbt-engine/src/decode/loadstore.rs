//! 访存指令族
//!
//! - LDR/STR 无符号立即数偏移（B/H/W/X、符号扩展变体、B/H/S/D/Q）
//! - LDUR/STUR 与前/后变址（9 位有符号立即数）
//! - LDR 字面量（W/X/SW/S/D/Q，PRFM 视为空操作）
//! - LDP/STP（偏移、前/后变址，W/X/SW、S/D/Q）
//! - LDR/STR 寄存器偏移（UXTW/SXTW/LSL 扩展，可按访问大小缩放）
//! - LDAR/STLR/LDAPR，LDXR/STXR（含 acquire/release 变体），CAS
//! - LDADD/LDCLR/LDEOR/LDSET/LD{S,U}{MAX,MIN}/SWP
//! - DMB/DSB/ISB/CLREX 与 HINT（NOP、YIELD 等按空操作处理）
//!
//! 解释执行经由 [`GuestMemory`] 访问；生成代码运行在用户态同一地址空间，
//! 客户机地址直接作为宿主地址解引用。
//!
//! 变址写回在访存之后进行。
//!
//! 独占监视器保存在上下文（生成代码中是保存区的 MONITOR_* 槽）里：LDXR 记录
//! 地址、大小和读到的值，STXR 在记录匹配时用比较交换写入，成功与否都会清除
//! 记录。宿主是 TSO，加载天然具有 acquire 语义，STLR 之后补一个 mfence。
//! 生成代码中的比较交换和读改写只支持 4/8 字节，其余大小交给解释器。

use dbt_core::save_area::offsets;
use dbt_core::{CpuContext, GuestAddr, GuestMemory, Reg31, Vector128};

use super::fields::{bit, bits, pc_relative, rd, rm, rn, sign_extend, signed_field};
use super::{
    Control, DispatchError, EmitOptions, Family, FamilyImpl, Pattern, load_gpr, store_gpr, unallocated,
    unimplemented,
};
use crate::emit::Emitter;
use crate::emit::x86::{Alu, Cond, Gpr, Mem, Shift, Width};

/// 传输的寄存器类型与大小
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// 通用寄存器；`sign` 为符号扩展的目标宽度
    Gpr { size: u8, sign: Option<Width> },
    /// SIMD&FP 寄存器，1/2/4/8/16 字节，其余位清零
    Fp { size: u8 },
}

impl Access {
    pub const fn size(self) -> u8 {
        match self {
            Access::Gpr { size, .. } | Access::Fp { size } => size,
        }
    }

    const fn scale(self) -> u32 {
        self.size().trailing_zeros()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indexing {
    Offset,
    PreIndex,
    PostIndex,
}

/// 寄存器偏移的扩展方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Uxtw,
    Sxtw,
    /// LSL / SXTX：使用完整 64 位
    X,
}

impl Extend {
    fn apply(self, value: u64) -> u64 {
        match self {
            Extend::Uxtw => u64::from(value as u32),
            Extend::Sxtw => i64::from(value as u32 as i32) as u64,
            Extend::X => value,
        }
    }
}

/// 原子读改写运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Clear,
    Eor,
    Set,
    SMax,
    SMin,
    UMax,
    UMin,
    Swap,
}

impl AtomicOp {
    /// 按 `size` 字节计算新值
    pub fn apply(self, size: u8, old: u64, operand: u64) -> u64 {
        let bits = u32::from(size) * 8;
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let (a, b) = (old & mask, operand & mask);
        let (sa, sb) = (sign_extend(a, bits), sign_extend(b, bits));
        let value = match self {
            AtomicOp::Add => a.wrapping_add(b),
            AtomicOp::Clear => a & !b,
            AtomicOp::Eor => a ^ b,
            AtomicOp::Set => a | b,
            AtomicOp::SMax => if sa >= sb { a } else { b },
            AtomicOp::SMin => if sa <= sb { a } else { b },
            AtomicOp::UMax => a.max(b),
            AtomicOp::UMin => a.min(b),
            AtomicOp::Swap => b,
        };
        value & mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// DMB/DSB
    Memory,
    /// ISB
    Instruction,
    /// CLREX
    ClearExclusive,
    /// HINT 空间（NOP、YIELD、WFE 等）
    Hint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStoreOp {
    Single {
        load: bool,
        access: Access,
        rt: u8,
        rn: u8,
        offset: i64,
        indexing: Indexing,
    },
    Pair {
        load: bool,
        access: Access,
        rt: u8,
        rt2: u8,
        rn: u8,
        offset: i64,
        indexing: Indexing,
    },
    /// PC 相对加载
    Literal { access: Access, rt: u8, offset: i64 },
    Prefetch,
    /// 基址加扩展、缩放后的索引寄存器
    RegisterOffset {
        load: bool,
        access: Access,
        rt: u8,
        rn: u8,
        rm: u8,
        extend: Extend,
        shift: u8,
    },
    /// LDAR/STLR/LDAPR
    Ordered { load: bool, size: u8, rt: u8, rn: u8 },
    /// LDXR/STXR；`rs` 是 STXR 的状态寄存器
    Exclusive { load: bool, size: u8, rs: u8, rt: u8, rn: u8 },
    /// CAS：`rs` 是比较值，返回原值
    CompareSwap { size: u8, rs: u8, rt: u8, rn: u8 },
    /// LSE 读改写：`rt` 得到原值
    Atomic { op: AtomicOp, size: u8, rs: u8, rt: u8, rn: u8 },
    Barrier(BarrierKind),
}

enum Classified {
    Transfer { load: bool, access: Access },
    Prefetch,
}

/// 按 size/V/opc 区分单寄存器访存的种类
fn classify_single(encoding: u32, mnemonic: &'static str) -> Result<Classified, DispatchError> {
    let size = bits(encoding, 30, 2);
    let opc = bits(encoding, 22, 2);
    if bit(encoding, 26) {
        let bytes = if opc & 0b10 != 0 {
            if size != 0 {
                return Err(unallocated(encoding, mnemonic));
            }
            16
        } else {
            1 << size
        };
        return Ok(Classified::Transfer {
            load: opc & 1 != 0,
            access: Access::Fp { size: bytes },
        });
    }
    let bytes = 1u8 << size;
    let transfer = |load, sign| Classified::Transfer {
        load,
        access: Access::Gpr { size: bytes, sign },
    };
    match opc {
        0 => Ok(transfer(false, None)),
        1 => Ok(transfer(true, None)),
        2 if size == 3 => Ok(Classified::Prefetch),
        2 => Ok(transfer(true, Some(Width::W64))),
        _ if size >= 2 => Err(unallocated(encoding, mnemonic)),
        _ => Ok(transfer(true, Some(Width::W32))),
    }
}

fn decode_unsigned_offset(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    match classify_single(encoding, "LDR/STR (unsigned offset)")? {
        Classified::Prefetch => Ok(LoadStoreOp::Prefetch),
        Classified::Transfer { load, access } => Ok(LoadStoreOp::Single {
            load,
            access,
            rt: rd(encoding),
            rn: rn(encoding),
            offset: i64::from(bits(encoding, 10, 12)) << access.scale(),
            indexing: Indexing::Offset,
        }),
    }
}

fn decode_imm9(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    const MNEMONIC: &str = "LDUR/STUR (imm9)";
    // 10：非特权访问，在用户态与普通访问相同
    let indexing = match bits(encoding, 10, 2) {
        0b01 => Indexing::PostIndex,
        0b11 => Indexing::PreIndex,
        _ => Indexing::Offset,
    };
    match classify_single(encoding, MNEMONIC)? {
        Classified::Prefetch if indexing == Indexing::Offset => Ok(LoadStoreOp::Prefetch),
        Classified::Prefetch => Err(unallocated(encoding, MNEMONIC)),
        Classified::Transfer { load, access } => Ok(LoadStoreOp::Single {
            load,
            access,
            rt: rd(encoding),
            rn: rn(encoding),
            offset: signed_field(encoding, 12, 9),
            indexing,
        }),
    }
}

fn decode_literal(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    let opc = bits(encoding, 30, 2);
    let access = if bit(encoding, 26) {
        match opc {
            0 => Access::Fp { size: 4 },
            1 => Access::Fp { size: 8 },
            2 => Access::Fp { size: 16 },
            _ => return Err(unallocated(encoding, "LDR (literal)")),
        }
    } else {
        match opc {
            0 => Access::Gpr { size: 4, sign: None },
            1 => Access::Gpr { size: 8, sign: None },
            2 => Access::Gpr { size: 4, sign: Some(Width::W64) },
            _ => return Ok(LoadStoreOp::Prefetch),
        }
    };
    Ok(LoadStoreOp::Literal {
        access,
        rt: rd(encoding),
        offset: signed_field(encoding, 5, 19),
    })
}

fn decode_pair(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    const MNEMONIC: &str = "LDP/STP";
    let opc = bits(encoding, 30, 2);
    let load = bit(encoding, 22);
    let access = if bit(encoding, 26) {
        match opc {
            0 => Access::Fp { size: 4 },
            1 => Access::Fp { size: 8 },
            2 => Access::Fp { size: 16 },
            _ => return Err(unallocated(encoding, MNEMONIC)),
        }
    } else {
        match opc {
            0 => Access::Gpr { size: 4, sign: None },
            1 if load => Access::Gpr { size: 4, sign: Some(Width::W64) },
            2 => Access::Gpr { size: 8, sign: None },
            _ => return Err(unallocated(encoding, MNEMONIC)),
        }
    };
    let indexing = match bits(encoding, 23, 2) {
        0b01 => Indexing::PostIndex,
        0b11 => Indexing::PreIndex,
        // 00 为非临时提示（LDNP/STNP），语义与偏移形式相同
        0b00 if matches!(access, Access::Gpr { sign: Some(_), .. }) => {
            return Err(unallocated(encoding, MNEMONIC));
        }
        _ => Indexing::Offset,
    };
    Ok(LoadStoreOp::Pair {
        load,
        access,
        rt: rd(encoding),
        rt2: bits(encoding, 10, 5) as u8,
        rn: rn(encoding),
        offset: signed_field(encoding, 15, 7) << access.scale(),
        indexing,
    })
}

fn decode_register_offset(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    const MNEMONIC: &str = "LDR/STR (register offset)";
    let extend = match bits(encoding, 13, 3) {
        0b010 => Extend::Uxtw,
        0b110 => Extend::Sxtw,
        0b011 | 0b111 => Extend::X,
        _ => return Err(unallocated(encoding, MNEMONIC)),
    };
    match classify_single(encoding, MNEMONIC)? {
        Classified::Prefetch => Ok(LoadStoreOp::Prefetch),
        Classified::Transfer { load, access } => Ok(LoadStoreOp::RegisterOffset {
            load,
            access,
            rt: rd(encoding),
            rn: rn(encoding),
            rm: rm(encoding),
            extend,
            shift: if bit(encoding, 12) { access.scale() as u8 } else { 0 },
        }),
    }
}

/// 独占与有序访问组：o2 (位 23)、o1 (位 21) 区分 LDXR/STXR、LDAR/STLR、CAS
fn decode_exclusive(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    const MNEMONIC: &str = "load/store exclusive";
    let size = 1u8 << bits(encoding, 30, 2);
    let load = bit(encoding, 22);
    let (rs, rt, rn) = (rm(encoding), rd(encoding), rn(encoding));
    match (bit(encoding, 23), bit(encoding, 21)) {
        (false, false) => Ok(LoadStoreOp::Exclusive { load, size, rs, rt, rn }),
        (true, false) => Ok(LoadStoreOp::Ordered { load, size, rt, rn }),
        (true, true) if bits(encoding, 10, 5) == 0x1F => Ok(LoadStoreOp::CompareSwap { size, rs, rt, rn }),
        (true, true) => Err(unallocated(encoding, MNEMONIC)),
        (false, true) => Err(unimplemented("LDXP/STXP/CASP", "register pair exclusives are not supported")),
    }
}

fn decode_atomic(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    let size = 1u8 << bits(encoding, 30, 2);
    let (rs, rt, rn) = (rm(encoding), rd(encoding), rn(encoding));
    let op = match (bit(encoding, 15), bits(encoding, 12, 3)) {
        (false, 0) => AtomicOp::Add,
        (false, 1) => AtomicOp::Clear,
        (false, 2) => AtomicOp::Eor,
        (false, 3) => AtomicOp::Set,
        (false, 4) => AtomicOp::SMax,
        (false, 5) => AtomicOp::SMin,
        (false, 6) => AtomicOp::UMax,
        (false, 7) => AtomicOp::UMin,
        (true, 0) => AtomicOp::Swap,
        // LDAPR：A=1、R=0、Rs=11111
        (true, 4) if bits(encoding, 22, 2) == 0b10 && rs == 0x1F => {
            return Ok(LoadStoreOp::Ordered { load: true, size, rt, rn });
        }
        _ => return Err(unallocated(encoding, "atomic memory operation")),
    };
    Ok(LoadStoreOp::Atomic { op, size, rs, rt, rn })
}

fn decode_barrier(encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    let kind = match bits(encoding, 5, 3) {
        0b010 => BarrierKind::ClearExclusive,
        0b100 | 0b101 => BarrierKind::Memory,
        0b110 => BarrierKind::Instruction,
        _ => return Err(unallocated(encoding, "barrier")),
    };
    Ok(LoadStoreOp::Barrier(kind))
}

fn decode_hint(_encoding: u32) -> Result<LoadStoreOp, DispatchError> {
    Ok(LoadStoreOp::Barrier(BarrierKind::Hint))
}

pub static PATTERNS: &[Pattern<LoadStoreOp>] = &[
    Pattern { mask: 0x3B00_0000, value: 0x3900_0000, mnemonic: "LDR/STR (unsigned offset)", decode: decode_unsigned_offset },
    Pattern { mask: 0x3B20_0000, value: 0x3800_0000, mnemonic: "LDUR/STUR (imm9)", decode: decode_imm9 },
    Pattern { mask: 0x3B00_0000, value: 0x1800_0000, mnemonic: "LDR (literal)", decode: decode_literal },
    Pattern { mask: 0x3A00_0000, value: 0x2800_0000, mnemonic: "LDP/STP", decode: decode_pair },
    Pattern { mask: 0x3B20_0C00, value: 0x3820_0800, mnemonic: "LDR/STR (register offset)", decode: decode_register_offset },
    Pattern { mask: 0x3F00_0000, value: 0x0800_0000, mnemonic: "load/store exclusive", decode: decode_exclusive },
    Pattern { mask: 0x3F20_0C00, value: 0x3820_0000, mnemonic: "atomic memory operation", decode: decode_atomic },
    Pattern { mask: 0xFFFF_F01F, value: 0xD503_301F, mnemonic: "DMB/DSB/ISB/CLREX", decode: decode_barrier },
    Pattern { mask: 0xFFFF_F01F, value: 0xD503_201F, mnemonic: "HINT", decode: decode_hint },
];

pub(crate) struct LoadStoreFamily;

// ----------------------------------------------------------------------
// 解释执行
// ----------------------------------------------------------------------

fn load_value(mem: &dyn GuestMemory, access: Access, addr: GuestAddr) -> Result<Vector128, DispatchError> {
    let size = usize::from(access.size());
    let value = match access {
        Access::Fp { size: 16 } => Vector128::from_u128(mem.read_u128(addr)?),
        Access::Fp { .. } => Vector128::new(mem.read_sized(addr, size)?, 0),
        Access::Gpr { sign, .. } => {
            let raw = mem.read_sized(addr, size)?;
            let bits = size as u32 * 8;
            let value = match sign {
                None => raw,
                Some(Width::W64) => super::fields::sign_extend(raw, bits) as u64,
                Some(Width::W32) => u64::from(super::fields::sign_extend(raw, bits) as u32),
            };
            Vector128::new(value, 0)
        }
    };
    Ok(value)
}

fn write_back_register(ctx: &mut CpuContext, access: Access, rt: u8, value: Vector128) {
    match access {
        Access::Gpr { .. } => ctx.set_x(rt, value.lo),
        Access::Fp { .. } => ctx.set_v(rt, value),
    }
}

fn store_value(
    ctx: &CpuContext,
    mem: &dyn GuestMemory,
    access: Access,
    rt: u8,
    addr: GuestAddr,
) -> Result<(), DispatchError> {
    match access {
        Access::Gpr { size, .. } => mem.write_sized(addr, ctx.x(rt), usize::from(size))?,
        Access::Fp { size: 16 } => mem.write_u128(addr, ctx.v(rt).to_u128())?,
        Access::Fp { size } => mem.write_sized(addr, ctx.v(rt).lo, usize::from(size))?,
    }
    Ok(())
}

fn address(ctx: &CpuContext, rn: u8, offset: i64, indexing: Indexing) -> (GuestAddr, GuestAddr) {
    let base = ctx.reg(rn, Reg31::Sp);
    let updated = base.wrapping_add(offset as u64);
    let addr = if indexing == Indexing::PostIndex { base } else { updated };
    (addr, updated)
}

// ----------------------------------------------------------------------
// 发射
// ----------------------------------------------------------------------

/// 地址寄存器
const ADDR: Gpr = Gpr::Rsi;

fn emit_load(em: &mut Emitter, options: &EmitOptions, access: Access, rt: u8, disp: i32) -> Result<(), DispatchError> {
    let mem = Mem::new(ADDR, disp);
    match access {
        Access::Gpr { size, sign } => {
            match (size, sign) {
                (1, None) => em.load_zx8(Gpr::Rax, mem)?,
                (1, Some(w)) => em.load_sx8(w, Gpr::Rax, mem)?,
                (2, None) => em.load_zx16(Gpr::Rax, mem)?,
                (2, Some(w)) => em.load_sx16(w, Gpr::Rax, mem)?,
                (4, None) => em.load(Width::W32, Gpr::Rax, mem)?,
                (4, Some(_)) => em.load_sx32(Gpr::Rax, mem)?,
                _ => em.load(Width::W64, Gpr::Rax, mem)?,
            }
            store_gpr(em, rt, Reg31::Zero, Gpr::Rax)?;
        }
        Access::Fp { size } => {
            let x = options.vreg(rt)?;
            match size {
                1 => {
                    em.load_zx8(Gpr::Rax, mem)?;
                    em.mov_to_xmm(Width::W32, x, Gpr::Rax)?;
                }
                2 => {
                    em.load_zx16(Gpr::Rax, mem)?;
                    em.mov_to_xmm(Width::W32, x, Gpr::Rax)?;
                }
                4 => em.movd_load(x, mem)?,
                8 => em.movq_load(x, mem)?,
                _ => em.movdqu_load(x, mem)?,
            }
        }
    }
    Ok(())
}

fn emit_store(em: &mut Emitter, options: &EmitOptions, access: Access, rt: u8, disp: i32) -> Result<(), DispatchError> {
    let mem = Mem::new(ADDR, disp);
    match access {
        Access::Gpr { size, .. } => {
            load_gpr(em, Width::W64, Gpr::Rax, rt, Reg31::Zero)?;
            match size {
                1 => em.store8(mem, Gpr::Rax)?,
                2 => em.store16(mem, Gpr::Rax)?,
                4 => em.store(Width::W32, mem, Gpr::Rax)?,
                _ => em.store(Width::W64, mem, Gpr::Rax)?,
            }
        }
        Access::Fp { size } => {
            let x = options.vreg(rt)?;
            match size {
                1 => {
                    em.mov_from_xmm(Width::W32, Gpr::Rax, x)?;
                    em.store8(mem, Gpr::Rax)?;
                }
                2 => {
                    em.mov_from_xmm(Width::W32, Gpr::Rax, x)?;
                    em.store16(mem, Gpr::Rax)?;
                }
                4 => em.movd_store(mem, x)?,
                8 => em.movq_store(mem, x)?,
                _ => em.movdqu_store(mem, x)?,
            }
        }
    }
    Ok(())
}

/// 计算访存地址到 RSI，返回写回时相对 RSI 的偏移
fn emit_address(em: &mut Emitter, rn: u8, offset: i64, indexing: Indexing) -> Result<Option<i32>, DispatchError> {
    // 所有立即数形式的偏移都在 ±2^16 内
    let offset = offset as i32;
    load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
    Ok(match indexing {
        Indexing::Offset => {
            em.lea(ADDR, Mem::new(ADDR, offset))?;
            None
        }
        Indexing::PreIndex => {
            em.lea(ADDR, Mem::new(ADDR, offset))?;
            Some(0)
        }
        Indexing::PostIndex => Some(offset),
    })
}

fn emit_writeback(em: &mut Emitter, rn: u8, writeback: Option<i32>) -> Result<(), DispatchError> {
    if let Some(disp) = writeback {
        em.lea(ADDR, Mem::new(ADDR, disp))?;
        store_gpr(em, rn, Reg31::Sp, ADDR)?;
    }
    Ok(())
}

impl FamilyImpl for LoadStoreFamily {
    type Op = LoadStoreOp;

    const FAMILY: Family = Family::LoadStore;

    fn patterns() -> &'static [Pattern<LoadStoreOp>] {
        PATTERNS
    }

    fn control(_op: &LoadStoreOp, _pc: GuestAddr) -> Control {
        Control::Continue
    }

    fn interpret(
        op: &LoadStoreOp,
        pc: GuestAddr,
        ctx: &mut CpuContext,
        mem: &dyn GuestMemory,
    ) -> Result<Option<GuestAddr>, DispatchError> {
        match *op {
            LoadStoreOp::Prefetch => {}
            LoadStoreOp::Literal { access, rt, offset } => {
                let value = load_value(mem, access, pc_relative(pc, offset))?;
                write_back_register(ctx, access, rt, value);
            }
            LoadStoreOp::Single { load, access, rt, rn, offset, indexing } => {
                let (addr, updated) = address(ctx, rn, offset, indexing);
                if load {
                    let value = load_value(mem, access, addr)?;
                    write_back_register(ctx, access, rt, value);
                } else {
                    store_value(ctx, mem, access, rt, addr)?;
                }
                if indexing != Indexing::Offset {
                    ctx.set_reg(rn, updated, Reg31::Sp);
                }
            }
            LoadStoreOp::Pair { load, access, rt, rt2, rn, offset, indexing } => {
                let (addr, updated) = address(ctx, rn, offset, indexing);
                let second = addr.wrapping_add(u64::from(access.size()));
                if load {
                    let first_value = load_value(mem, access, addr)?;
                    let second_value = load_value(mem, access, second)?;
                    write_back_register(ctx, access, rt, first_value);
                    write_back_register(ctx, access, rt2, second_value);
                } else {
                    store_value(ctx, mem, access, rt, addr)?;
                    store_value(ctx, mem, access, rt2, second)?;
                }
                if indexing != Indexing::Offset {
                    ctx.set_reg(rn, updated, Reg31::Sp);
                }
            }
            LoadStoreOp::RegisterOffset { load, access, rt, rn, rm, extend, shift } => {
                let offset = extend.apply(ctx.x(rm)) << shift;
                let addr = ctx.reg(rn, Reg31::Sp).wrapping_add(offset);
                if load {
                    let value = load_value(mem, access, addr)?;
                    write_back_register(ctx, access, rt, value);
                } else {
                    store_value(ctx, mem, access, rt, addr)?;
                }
            }
            LoadStoreOp::Ordered { load, size, rt, rn } => {
                let addr = ctx.reg(rn, Reg31::Sp);
                if load {
                    let value = mem.read_sized(addr, usize::from(size))?;
                    ctx.set_x(rt, value);
                } else {
                    mem.write_sized(addr, ctx.x(rt), usize::from(size))?;
                }
            }
            LoadStoreOp::Exclusive { load: true, size, rt, rn, .. } => {
                let addr = ctx.reg(rn, Reg31::Sp);
                let value = mem.read_sized(addr, usize::from(size))?;
                ctx.monitor.arm(addr, u32::from(size), value);
                ctx.set_x(rt, value);
            }
            LoadStoreOp::Exclusive { load: false, size, rs, rt, rn } => {
                let addr = ctx.reg(rn, Reg31::Sp);
                let status = match ctx.monitor.take(addr, u32::from(size)) {
                    Some(expected) => {
                        let old = mem.compare_exchange(addr, usize::from(size), expected, ctx.x(rt))?;
                        u64::from(old != expected)
                    }
                    None => 1,
                };
                ctx.set_x(rs, status);
            }
            LoadStoreOp::CompareSwap { size, rs, rt, rn } => {
                let addr = ctx.reg(rn, Reg31::Sp);
                let expected = AtomicOp::Swap.apply(size, 0, ctx.x(rs));
                let old = mem.compare_exchange(addr, usize::from(size), expected, ctx.x(rt))?;
                ctx.set_x(rs, old);
            }
            LoadStoreOp::Atomic { op, size, rs, rt, rn } => {
                let addr = ctx.reg(rn, Reg31::Sp);
                let operand = ctx.x(rs);
                let old = mem.fetch_update(addr, usize::from(size), &|old| op.apply(size, old, operand))?;
                ctx.set_x(rt, old);
            }
            LoadStoreOp::Barrier(BarrierKind::ClearExclusive) => ctx.monitor.clear(),
            LoadStoreOp::Barrier(_) => {}
        }
        Ok(None)
    }

    fn emit(op: &LoadStoreOp, pc: GuestAddr, em: &mut Emitter, options: &EmitOptions) -> Result<(), DispatchError> {
        match *op {
            LoadStoreOp::Prefetch => {}
            LoadStoreOp::Literal { access, rt, offset } => {
                em.mov_imm64(ADDR, pc_relative(pc, offset))?;
                emit_load(em, options, access, rt, 0)?;
            }
            LoadStoreOp::Single { load, access, rt, rn, offset, indexing } => {
                let writeback = emit_address(em, rn, offset, indexing)?;
                if load {
                    emit_load(em, options, access, rt, 0)?;
                } else {
                    emit_store(em, options, access, rt, 0)?;
                }
                emit_writeback(em, rn, writeback)?;
            }
            LoadStoreOp::Pair { load, access, rt, rt2, rn, offset, indexing } => {
                let writeback = emit_address(em, rn, offset, indexing)?;
                let second = i32::from(access.size());
                if load {
                    // 先读完两个值再写回寄存器
                    if let Access::Gpr { .. } = access {
                        emit_load(em, options, access, rt, 0)?;
                        em.mov_rr(Width::W64, Gpr::R8, Gpr::Rax)?;
                        emit_load(em, options, access, rt2, second)?;
                        store_gpr(em, rt, Reg31::Zero, Gpr::R8)?;
                    } else {
                        emit_load(em, options, access, rt, 0)?;
                        emit_load(em, options, access, rt2, second)?;
                    }
                } else {
                    emit_store(em, options, access, rt, 0)?;
                    emit_store(em, options, access, rt2, second)?;
                }
                emit_writeback(em, rn, writeback)?;
            }
            LoadStoreOp::RegisterOffset { load, access, rt, rn, rm, extend, shift } => {
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                match extend {
                    Extend::Uxtw => load_gpr(em, Width::W32, Gpr::Rcx, rm, Reg31::Zero)?,
                    Extend::Sxtw => {
                        load_gpr(em, Width::W32, Gpr::Rcx, rm, Reg31::Zero)?;
                        em.movsxd(Gpr::Rcx, Gpr::Rcx)?;
                    }
                    Extend::X => load_gpr(em, Width::W64, Gpr::Rcx, rm, Reg31::Zero)?,
                }
                if shift != 0 {
                    em.shift_ri(Shift::Shl, Width::W64, Gpr::Rcx, shift)?;
                }
                em.alu_rr(Alu::Add, Width::W64, ADDR, Gpr::Rcx)?;
                if load {
                    emit_load(em, options, access, rt, 0)?;
                } else {
                    emit_store(em, options, access, rt, 0)?;
                }
            }
            LoadStoreOp::Ordered { load, size, rt, rn } => {
                let access = Access::Gpr { size, sign: None };
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                if load {
                    emit_load(em, options, access, rt, 0)?;
                } else {
                    emit_store(em, options, access, rt, 0)?;
                    em.mfence()?;
                }
            }
            LoadStoreOp::Exclusive { load: true, size, rt, rn, .. } => {
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                emit_load(em, options, Access::Gpr { size, sign: None }, rt, 0)?;
                em.store(Width::W64, monitor_slot(offsets::MONITOR_ADDR), ADDR)?;
                em.store(Width::W64, monitor_slot(offsets::MONITOR_VALUE), Gpr::Rax)?;
                em.store_imm32(Width::W32, monitor_slot(offsets::MONITOR_SIZE), i32::from(size))?;
            }
            LoadStoreOp::Exclusive { load: false, size, rs, rt, rn } => {
                let width = locked_width(size, "STXR")?;
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                em.load(Width::W32, Gpr::Rcx, monitor_slot(offsets::MONITOR_SIZE))?;
                em.alu_ri(Alu::Cmp, Width::W32, Gpr::Rcx, i32::from(size))?;
                let other_size = em.jcc_rel8(Cond::Ne)?;
                em.load(Width::W64, Gpr::Rcx, monitor_slot(offsets::MONITOR_ADDR))?;
                em.alu_rr(Alu::Cmp, Width::W64, Gpr::Rcx, ADDR)?;
                let other_addr = em.jcc_rel8(Cond::Ne)?;
                em.load(width, Gpr::Rax, monitor_slot(offsets::MONITOR_VALUE))?;
                load_gpr(em, width, Gpr::Rdx, rt, Reg31::Zero)?;
                em.lock_cmpxchg(width, Mem::new(ADDR, 0), Gpr::Rdx)?;
                let changed = em.jcc_rel8(Cond::Ne)?;
                em.mov_imm32(Gpr::Rax, 0)?;
                let done = em.jmp_rel8()?;
                for fixup in [other_size, other_addr, changed] {
                    em.bind(fixup)?;
                }
                em.mov_imm32(Gpr::Rax, 1)?;
                em.bind(done)?;
                store_gpr(em, rs, Reg31::Zero, Gpr::Rax)?;
                emit_clear_monitor(em)?;
            }
            LoadStoreOp::CompareSwap { size, rs, rt, rn } => {
                let width = locked_width(size, "CAS")?;
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                load_gpr(em, width, Gpr::Rax, rs, Reg31::Zero)?;
                load_gpr(em, width, Gpr::Rdx, rt, Reg31::Zero)?;
                // 失败时 RAX 得到内存值，成功时 RAX 本来就等于内存值
                em.lock_cmpxchg(width, Mem::new(ADDR, 0), Gpr::Rdx)?;
                store_gpr(em, rs, Reg31::Zero, Gpr::Rax)?;
            }
            LoadStoreOp::Atomic { op, size, rs, rt, rn } => {
                let width = locked_width(size, "atomic memory operation")?;
                let target = Mem::new(ADDR, 0);
                load_gpr(em, Width::W64, ADDR, rn, Reg31::Sp)?;
                load_gpr(em, width, Gpr::Rcx, rs, Reg31::Zero)?;
                match op {
                    AtomicOp::Add => {
                        em.lock_xadd(width, target, Gpr::Rcx)?;
                        store_gpr(em, rt, Reg31::Zero, Gpr::Rcx)?;
                    }
                    AtomicOp::Swap => {
                        em.xchg(width, target, Gpr::Rcx)?;
                        store_gpr(em, rt, Reg31::Zero, Gpr::Rcx)?;
                    }
                    _ => {
                        emit_update_loop(em, op, width, target)?;
                        store_gpr(em, rt, Reg31::Zero, Gpr::Rax)?;
                    }
                }
            }
            LoadStoreOp::Barrier(BarrierKind::Memory) => em.mfence()?,
            LoadStoreOp::Barrier(BarrierKind::ClearExclusive) => emit_clear_monitor(em)?,
            LoadStoreOp::Barrier(BarrierKind::Instruction | BarrierKind::Hint) => {}
        }
        Ok(())
    }
}

fn monitor_slot(offset: usize) -> Mem {
    Mem::area(offset as i32)
}

/// 与 [`dbt_core::ExclusiveMonitor::clear`] 一致，三个槽全部清零
fn emit_clear_monitor(em: &mut Emitter) -> Result<(), DispatchError> {
    em.store_imm32(Width::W64, monitor_slot(offsets::MONITOR_ADDR), 0)?;
    em.store_imm32(Width::W64, monitor_slot(offsets::MONITOR_VALUE), 0)?;
    em.store_imm32(Width::W32, monitor_slot(offsets::MONITOR_SIZE), 0)?;
    Ok(())
}

/// lock 前缀指令只发射 32/64 位形式
fn locked_width(size: u8, mnemonic: &'static str) -> Result<Width, DispatchError> {
    match size {
        4 => Ok(Width::W32),
        8 => Ok(Width::W64),
        _ => Err(unimplemented(mnemonic, "byte and halfword atomics are interpreted")),
    }
}

/// 比较交换循环：RCX 为操作数，结束时 RAX 为原值。会破坏 RDX。
fn emit_update_loop(em: &mut Emitter, op: AtomicOp, width: Width, target: Mem) -> Result<(), DispatchError> {
    if op == AtomicOp::Clear {
        em.not(width, Gpr::Rcx)?;
    }
    em.load(width, Gpr::Rax, target)?;
    let retry = em.len();
    em.mov_rr(width, Gpr::Rdx, Gpr::Rax)?;
    match op {
        AtomicOp::Clear => em.alu_rr(Alu::And, width, Gpr::Rdx, Gpr::Rcx)?,
        AtomicOp::Eor => em.alu_rr(Alu::Xor, width, Gpr::Rdx, Gpr::Rcx)?,
        AtomicOp::Set => em.alu_rr(Alu::Or, width, Gpr::Rdx, Gpr::Rcx)?,
        AtomicOp::SMax | AtomicOp::SMin | AtomicOp::UMax | AtomicOp::UMin => {
            // 原值不满足条件时换成操作数
            let replace = match op {
                AtomicOp::SMax => Cond::L,
                AtomicOp::SMin => Cond::G,
                AtomicOp::UMax => Cond::B,
                _ => Cond::A,
            };
            em.alu_rr(Alu::Cmp, width, Gpr::Rdx, Gpr::Rcx)?;
            em.cmov(replace, width, Gpr::Rdx, Gpr::Rcx)?;
        }
        AtomicOp::Add | AtomicOp::Swap => return Err(unimplemented("atomic memory operation", "not a loop form")),
    }
    em.lock_cmpxchg(width, target, Gpr::Rdx)?;
    em.jcc_back(Cond::Ne, retry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Dispatcher, ExecTarget};
    use crate::emit::HostFeatures;
    use dbt_core::{FlatMemory, VectorAliasPolicy};
    use proptest::prelude::*;

    const BASE: u64 = 0x1_0000;

    fn run(ctx: &mut CpuContext, mem: &FlatMemory, encoding: u32) {
        let handled = Dispatcher::new()
            .dispatch(encoding, 0x1000, &mut ExecTarget::Interpret { ctx, mem })
            .unwrap();
        assert_eq!(handled.family, Family::LoadStore);
    }

    fn setup() -> (CpuContext, FlatMemory) {
        let mem = FlatMemory::new(0, 0x2_0000);
        let mut ctx = CpuContext::new();
        ctx.set_x(1, BASE);
        (ctx, mem)
    }

    #[test]
    fn test_unsigned_offset_loads_and_stores() {
        let (mut ctx, mem) = setup();
        ctx.set_x(2, 0x8877_6655_4433_2211);
        // STR X2, [X1, #16]
        run(&mut ctx, &mem, 0xF900_0822);
        assert_eq!(mem.read_u64(BASE + 16).unwrap(), 0x8877_6655_4433_2211);
        // LDRB W3, [X1, #16]
        run(&mut ctx, &mem, 0x3940_4023);
        assert_eq!(ctx.x(3), 0x11);
        // LDRSB X4, [X1, #23]：0x88 符号扩展
        run(&mut ctx, &mem, 0x3980_5C24);
        assert_eq!(ctx.x(4), 0xFFFF_FFFF_FFFF_FF88);
        // LDRSH W5, [X1, #22]
        run(&mut ctx, &mem, 0x79C0_2C25);
        assert_eq!(ctx.x(5), 0xFFFF_8877);
    }

    #[test]
    fn test_indexed_forms_write_back() {
        let (mut ctx, mem) = setup();
        mem.write_sized(BASE, 0xAABB_CCDD, 4).unwrap();
        // LDR W2, [X1], #4
        run(&mut ctx, &mem, 0xB840_4422);
        assert_eq!(ctx.x(2), 0xAABB_CCDD);
        assert_eq!(ctx.x(1), BASE + 4);
        // STR X2, [X1, #-4]!
        run(&mut ctx, &mem, 0xF81F_CC22);
        assert_eq!(ctx.x(1), BASE);
        assert_eq!(mem.read_u64(BASE).unwrap(), 0xAABB_CCDD);
        // LDUR X3, [X1, #1]
        run(&mut ctx, &mem, 0xF840_1023);
        assert_eq!(ctx.x(3), 0xAA_BBCC);
        assert_eq!(ctx.x(1), BASE);
    }

    #[test]
    fn test_pairs_and_sp_base() {
        let (mut ctx, mem) = setup();
        ctx.gpr.sp = BASE + 0x100;
        ctx.set_x(2, 1);
        ctx.set_x(3, 2);
        // STP X2, X3, [SP, #-16]!
        run(&mut ctx, &mem, 0xA9BF_0FE2);
        assert_eq!(ctx.sp(), BASE + 0xF0);
        assert_eq!(mem.read_u64(BASE + 0xF0).unwrap(), 1);
        assert_eq!(mem.read_u64(BASE + 0xF8).unwrap(), 2);
        // LDP X4, X5, [SP], #16
        run(&mut ctx, &mem, 0xA8C1_17E4);
        assert_eq!((ctx.x(4), ctx.x(5)), (1, 2));
        assert_eq!(ctx.sp(), BASE + 0x100);
    }

    #[test]
    fn test_fp_and_literal() {
        let (mut ctx, mem) = setup();
        ctx.set_v(7, Vector128::new(0x1111, 0x2222));
        // STR Q7, [X1]
        run(&mut ctx, &mem, 0x3D80_0027);
        assert_eq!(mem.read_u128(BASE).unwrap(), Vector128::new(0x1111, 0x2222).to_u128());
        // LDR D8, [X1]：高位清零
        run(&mut ctx, &mem, 0xFD40_0028);
        assert_eq!(ctx.v(8), Vector128::new(0x1111, 0));
        // LDR X9, #8（字面量，相对 pc = 0x1000）
        mem.write_sized(0x1008, 0xDEAD, 8).unwrap();
        run(&mut ctx, &mem, 0x5800_0049);
        assert_eq!(ctx.x(9), 0xDEAD);
    }

    #[test]
    fn test_prefetch_and_unallocated() {
        let (mut ctx, mem) = setup();
        let before = ctx;
        // PRFM PLDL1KEEP, [X1]
        run(&mut ctx, &mem, 0xF980_0020);
        assert_eq!(ctx.gpr.x, before.gpr.x);
        // LDRSW 的 opc=11 未分配
        let err = Dispatcher::new()
            .dispatch(0xB9C0_0020, 0x1000, &mut ExecTarget::Interpret { ctx: &mut ctx, mem: &mem })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unallocated { .. }));
    }

    #[test]
    fn test_fault_is_surfaced() {
        let (mut ctx, mem) = setup();
        ctx.set_x(1, 0x10_0000);
        let err = Dispatcher::new()
            .dispatch(0xF940_0022, 0x1000, &mut ExecTarget::Interpret { ctx: &mut ctx, mem: &mem })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Memory(_)));
    }

    #[test]
    fn test_emit_load_store() {
        let options = EmitOptions::new(HostFeatures::all(), VectorAliasPolicy::Reject);
        let mut em = Emitter::new(128);
        // LDR X2, [X1, #16]
        Dispatcher::new().emit(0xF940_0822, 0x1000, &mut em, &options).unwrap();
        assert_eq!(
            em.bytes(),
            &[
                0x48, 0x8B, 0xB7, 0x18, 0x02, 0, 0, // mov rsi, [rdi+x1]
                0x48, 0x8D, 0xB6, 0x10, 0, 0, 0, // lea rsi, [rsi+16]
                0x48, 0x8B, 0x86, 0, 0, 0, 0, // mov rax, [rsi]
                0x48, 0x89, 0x87, 0x20, 0x02, 0, 0, // mov [rdi+x2], rax
            ]
        );

        // LDR Q20, [X1] 在拒绝别名策略下失败且不留下字节
        let mut em = Emitter::new(128);
        let err = Dispatcher::new().emit(0x3DC0_0034, 0x1000, &mut em, &options).unwrap_err();
        assert_eq!(err, DispatchError::AliasedVectorRegister { reg: 20, host: 4 });
        assert!(em.is_empty());
    }
    #[test]
    fn test_register_offset() {
        let (mut ctx, mem) = setup();
        mem.write_sized(BASE + 24, 0x1122_3344_5566_7788, 8).unwrap();
        ctx.set_x(3, 3);
        // LDR X2, [X1, X3, LSL #3]
        run(&mut ctx, &mem, 0xF863_7822);
        assert_eq!(ctx.x(2), 0x1122_3344_5566_7788);
        // STR W2, [X1, W3, SXTW #2]：W3 = -2
        ctx.set_x(3, 0xFFFF_FFFE);
        ctx.set_x(1, BASE + 0x10);
        run(&mut ctx, &mem, 0xB823_D822);
        assert_eq!(mem.read_sized(BASE + 8, 4).unwrap(), 0x5566_7788);
        // LDRSH X2, [X1, W3, UXTW]：高 32 位被忽略
        ctx.set_x(3, 0xFFFF_FFFF_0000_0008);
        mem.write_sized(BASE + 0x18, 0x8001, 2).unwrap();
        run(&mut ctx, &mem, 0x78A3_4822);
        assert_eq!(ctx.x(2), 0xFFFF_FFFF_FFFF_8001);

        let err = Dispatcher::new()
            .dispatch(0xF863_0822, 0x1000, &mut ExecTarget::Interpret { ctx: &mut ctx, mem: &mem })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unallocated { .. }));
    }

    #[test]
    fn test_exclusive_pair_succeeds_once() {
        let (mut ctx, mem) = setup();
        mem.write_sized(BASE, 41, 8).unwrap();
        // LDXR X2, [X1]
        run(&mut ctx, &mem, 0xC85F_7C22);
        assert_eq!(ctx.x(2), 41);
        assert!(!ctx.monitor.is_open());
        ctx.set_x(2, 42);
        // STXR W3, X2, [X1]
        run(&mut ctx, &mem, 0xC803_7C22);
        assert_eq!(ctx.x(3), 0);
        assert_eq!(mem.read_u64(BASE).unwrap(), 42);
        // 监视器已关闭，再次存储失败
        ctx.set_x(2, 43);
        run(&mut ctx, &mem, 0xC803_7C22);
        assert_eq!(ctx.x(3), 1);
        assert_eq!(mem.read_u64(BASE).unwrap(), 42);
    }

    #[test]
    fn test_exclusive_store_fails_after_interference() {
        let (mut ctx, mem) = setup();
        // LDAXR W2, [X1]
        run(&mut ctx, &mem, 0x885F_FC22);
        mem.write_sized(BASE, 7, 4).unwrap();
        // STLXR W3, W2, [X1]
        run(&mut ctx, &mem, 0x8803_FC22);
        assert_eq!(ctx.x(3), 1);
        assert_eq!(mem.read_sized(BASE, 4).unwrap(), 7);

        // LDXRB 之后 CLREX 清除监视器
        run(&mut ctx, &mem, 0x085F_7C22);
        run(&mut ctx, &mem, 0xD503_3F5F);
        assert!(ctx.monitor.is_open());
        run(&mut ctx, &mem, 0x0803_7C22);
        assert_eq!(ctx.x(3), 1);

        // 大小不同的记录不匹配
        run(&mut ctx, &mem, 0x085F_7C22);
        run(&mut ctx, &mem, 0x8803_7C22);
        assert_eq!(ctx.x(3), 1);
    }

    #[test]
    fn test_ordered_and_compare_swap() {
        let (mut ctx, mem) = setup();
        ctx.set_x(2, 0xAAAA_BBBB_CCCC_DDDD);
        // STLR W2, [X1]
        run(&mut ctx, &mem, 0x889F_FC22);
        assert_eq!(mem.read_u64(BASE).unwrap(), 0xCCCC_DDDD);
        // LDAR X2, [X1]
        run(&mut ctx, &mem, 0xC8DF_FC22);
        assert_eq!(ctx.x(2), 0xCCCC_DDDD);

        // CAS X3, X2, [X1]：比较失败，X3 得到内存值
        ctx.set_x(3, 5);
        ctx.set_x(2, 9);
        run(&mut ctx, &mem, 0xC8A3_7C22);
        assert_eq!(ctx.x(3), 0xCCCC_DDDD);
        assert_eq!(mem.read_u64(BASE).unwrap(), 0xCCCC_DDDD);
        // 再来一次就成功
        run(&mut ctx, &mem, 0xC8A3_7C22);
        assert_eq!(mem.read_u64(BASE).unwrap(), 9);
        // CASB 只比较低字节
        ctx.set_x(3, 0x109);
        ctx.set_x(2, 0x77);
        run(&mut ctx, &mem, 0x08A3_7C22);
        assert_eq!(ctx.x(3), 9);
        assert_eq!(mem.read_u64(BASE).unwrap(), 0x77);

        // LDXP 不支持
        let err = Dispatcher::new()
            .dispatch(0xC87F_1022, 0x1000, &mut ExecTarget::Interpret { ctx: &mut ctx, mem: &mem })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unimplemented { .. }));
    }

    #[test]
    fn test_atomic_read_modify_write() {
        let (mut ctx, mem) = setup();
        let cases: &[(u32, u64, u64, u64)] = &[
            // (编码, 内存原值, X3, 新值)
            (0xF823_0022, 10, 5, 15),                       // LDADD
            (0xF823_1022, 0xFF, 0x0F, 0xF0),                // LDCLR
            (0xF823_2022, 0xF0, 0xFF, 0x0F),                // LDEOR
            (0xB823_4022, 0xFFFF_FFFF, 3, 3),               // LDSMAX W：-1 < 3
            (0xF823_5022, 2, u64::MAX, u64::MAX),           // LDSMIN X
            (0xF823_6022, 2, u64::MAX, u64::MAX),           // LDUMAX X
            (0xB823_7022, 2, 0x1_0000_0001, 1),             // LDUMIN W
            (0xB823_8022, 0x1234, 0xDEAD_BEEF, 0xDEAD_BEEF), // SWP W
        ];
        for &(encoding, old, operand, new) in cases {
            mem.write_sized(BASE, old, 8).unwrap();
            ctx.set_x(3, operand);
            run(&mut ctx, &mem, encoding);
            assert_eq!(ctx.x(2), old, "{encoding:#x}");
            assert_eq!(mem.read_u64(BASE).unwrap(), new, "{encoding:#x}");
        }

        // LDSETB 只改低字节
        mem.write_sized(BASE, 0x1_0001, 8).unwrap();
        ctx.set_x(3, 0x180);
        run(&mut ctx, &mem, 0x3823_3022);
        assert_eq!(ctx.x(2), 1);
        assert_eq!(mem.read_u64(BASE).unwrap(), 0x1_0081);

        // STADD：目标为 XZR
        mem.write_sized(BASE, 1, 8).unwrap();
        ctx.set_x(3, 2);
        run(&mut ctx, &mem, 0xF823_003F);
        assert_eq!(mem.read_u64(BASE).unwrap(), 3);

        // LDAPR X2, [X1]
        run(&mut ctx, &mem, 0xF8BF_C022);
        assert_eq!(ctx.x(2), 3);
    }

    #[test]
    fn test_barriers_and_hints_are_no_ops() {
        let (mut ctx, mem) = setup();
        let before = ctx;
        // DMB ISH, DSB SY, ISB, NOP, YIELD
        for encoding in [0xD503_3BBF, 0xD503_3F9F, 0xD503_3FDF, 0xD503_201F, 0xD503_203F] {
            run(&mut ctx, &mem, encoding);
        }
        assert_eq!(ctx.gpr.x, before.gpr.x);
    }

    #[test]
    fn test_emit_exclusive_and_atomics() {
        let options = EmitOptions::new(HostFeatures::all(), VectorAliasPolicy::Reject);
        let dispatcher = Dispatcher::new();

        // LDXR X2, [X1]：加载后记录监视器
        let mut em = Emitter::new(128);
        dispatcher.emit(0xC85F_7C22, 0x1000, &mut em, &options).unwrap();
        let bytes = em.bytes();
        // mov [rdi+MONITOR_SIZE], 8
        assert_eq!(&bytes[bytes.len() - 10..], &[0xC7, 0x87, 0x30, 0x03, 0, 0, 8, 0, 0, 0]);

        // STXR 中的 lock cmpxchg [rsi], rdx
        let mut em = Emitter::new(256);
        dispatcher.emit(0xC803_7C22, 0x1000, &mut em, &options).unwrap();
        assert!(em.bytes().windows(4).any(|w| w == [0xF0, 0x48, 0x0F, 0xB1]));

        // LDADD X3, X2, [X1]：lock xadd [rsi], rcx
        let mut em = Emitter::new(128);
        dispatcher.emit(0xF823_0022, 0x1000, &mut em, &options).unwrap();
        assert!(em.bytes().windows(4).any(|w| w == [0xF0, 0x48, 0x0F, 0xC1]));

        // LDUMAX 循环以向后的 jne 结束
        let mut em = Emitter::new(256);
        dispatcher.emit(0xF823_6022, 0x1000, &mut em, &options).unwrap();
        let bytes = em.bytes();
        let jne = bytes.windows(2).rposition(|w| w[0] == 0x75).unwrap();
        assert!(bytes[jne + 1] >= 0x80);

        // LDXRB 的存储侧只在解释器中实现
        let mut em = Emitter::new(256);
        let err = dispatcher.emit(0x0803_7C22, 0x1000, &mut em, &options).unwrap_err();
        assert!(matches!(err, DispatchError::Unimplemented { .. }));

        // DMB 发射 mfence，ISB 不发射任何字节
        let mut em = Emitter::new(16);
        dispatcher.emit(0xD503_3BBF, 0x1000, &mut em, &options).unwrap();
        assert_eq!(em.bytes(), &[0x0F, 0xAE, 0xF0]);
        let mut em = Emitter::new(16);
        dispatcher.emit(0xD503_3FDF, 0x1000, &mut em, &options).unwrap();
        assert!(em.is_empty());
    }

    proptest! {
        #[test]
        fn prop_atomic_ops_stay_in_width(old: u64, operand: u64, size in prop::sample::select(vec![1u8, 2, 4, 8])) {
            let mask = if size == 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
            for op in [AtomicOp::Add, AtomicOp::Clear, AtomicOp::Eor, AtomicOp::Set, AtomicOp::SMax,
                       AtomicOp::SMin, AtomicOp::UMax, AtomicOp::UMin, AtomicOp::Swap] {
                let value = op.apply(size, old, operand);
                prop_assert_eq!(value & !mask, 0);
            }
            let (a, b) = (old & mask, operand & mask);
            prop_assert_eq!(AtomicOp::UMax.apply(size, old, operand), a.max(b));
            prop_assert_eq!(AtomicOp::Add.apply(size, old, operand), a.wrapping_add(b) & mask);
        }
    }
}
