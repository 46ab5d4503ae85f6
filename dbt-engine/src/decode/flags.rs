//! 条件标志
//!
//! 保存区的 NZCV 槽是唯一的标志来源：
//! - 设置标志的整数运算用 setcc 把结果写回槽位；
//! - FCMP 用 cmov 按比较结果选出常量写回；
//! - 读取标志的指令（B.cond、CSEL 系列）先用 popfq 把槽位还原成
//!   SF=N、ZF=Z、CF=!C、OF=V，再按 [`COND_TABLE`] 选择宿主条件码。
//!
//! 进位以取反形式进入 CF，所以 CS/CC 对应 JAE/JB，HI/LS 对应 JA/JBE。

use dbt_core::save_area::offsets;
use dbt_core::{Condition, Nzcv};

use crate::emit::x86::{Alu, Cond, Gpr, Mem, Shift, Width};
use crate::emit::{EmitError, Emitter};

/// 客户机条件在宿主上的对应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCond {
    /// 宿主条件码；Jcc 近跳转为 `0F 8x`，cmov 为 `0F 4x`
    Jcc(Cond),
    /// 无条件 (JMP 0xE9)
    Always,
}

impl HostCond {
    /// Jcc 第二操作码字节；`Always` 返回 JMP 的 0xE9
    pub const fn opcode(self) -> u8 {
        match self {
            HostCond::Jcc(cond) => cond.jcc_opcode(),
            HostCond::Always => 0xE9,
        }
    }
}

/// 客户机条件码 (按编码顺序 0..16) 到宿主条件的映射
pub const COND_TABLE: [HostCond; 16] = [
    HostCond::Jcc(Cond::E),  // EQ
    HostCond::Jcc(Cond::Ne), // NE
    HostCond::Jcc(Cond::Ae), // CS
    HostCond::Jcc(Cond::B),  // CC
    HostCond::Jcc(Cond::S),  // MI
    HostCond::Jcc(Cond::Ns), // PL
    HostCond::Jcc(Cond::O),  // VS
    HostCond::Jcc(Cond::No), // VC
    HostCond::Jcc(Cond::A),  // HI
    HostCond::Jcc(Cond::Be), // LS
    HostCond::Jcc(Cond::Ge), // GE
    HostCond::Jcc(Cond::L),  // LT
    HostCond::Jcc(Cond::G),  // GT
    HostCond::Jcc(Cond::Le), // LE
    HostCond::Always,        // AL
    HostCond::Always,        // NV
];

pub const fn host_cond(cond: Condition) -> HostCond {
    COND_TABLE[cond as usize]
}

/// 整数运算写回 C 标志的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryMode {
    /// 加法：C = CF
    Carry,
    /// 减法：C = !CF
    Borrow,
    /// 逻辑运算：C = V = 0
    Clear,
}

fn nzcv_slot() -> Mem {
    Mem::area(offsets::NZCV as i32)
}

/// 把宿主 EFLAGS 转成 NZCV 写回保存区。会破坏 RAX、RCX、RDX、R8。
pub fn emit_store_flags(em: &mut Emitter, carry: CarryMode) -> Result<(), EmitError> {
    em.setcc(Cond::S, Gpr::Rax)?;
    em.setcc(Cond::E, Gpr::Rcx)?;
    match carry {
        CarryMode::Carry => em.setcc(Cond::B, Gpr::Rdx)?,
        CarryMode::Borrow => em.setcc(Cond::Ae, Gpr::Rdx)?,
        CarryMode::Clear => {}
    }
    if carry != CarryMode::Clear {
        em.setcc(Cond::O, Gpr::R8)?;
    }

    em.movzx8(Gpr::Rax, Gpr::Rax)?;
    em.shift_ri(Shift::Shl, Width::W32, Gpr::Rax, 31)?;
    em.movzx8(Gpr::Rcx, Gpr::Rcx)?;
    em.shift_ri(Shift::Shl, Width::W32, Gpr::Rcx, 30)?;
    em.alu_rr(Alu::Or, Width::W32, Gpr::Rax, Gpr::Rcx)?;
    if carry != CarryMode::Clear {
        em.movzx8(Gpr::Rdx, Gpr::Rdx)?;
        em.shift_ri(Shift::Shl, Width::W32, Gpr::Rdx, 29)?;
        em.alu_rr(Alu::Or, Width::W32, Gpr::Rax, Gpr::Rdx)?;
        em.movzx8(Gpr::R8, Gpr::R8)?;
        em.shift_ri(Shift::Shl, Width::W32, Gpr::R8, 28)?;
        em.alu_rr(Alu::Or, Width::W32, Gpr::Rax, Gpr::R8)?;
    }
    em.store(Width::W64, nzcv_slot(), Gpr::Rax)
}

/// UCOMIS/COMIS 之后把比较结果写回 NZCV。会破坏 RAX、RCX，不改变 EFLAGS。
///
/// 无序时 ZF=PF=CF=1，所以 cmovp 必须最后执行。
pub fn emit_store_fcmp_flags(em: &mut Emitter) -> Result<(), EmitError> {
    em.mov_imm32(Gpr::Rax, Nzcv::from_nibble(0b0010).to_word() as u32)?;
    em.mov_imm32(Gpr::Rcx, Nzcv::from_nibble(0b1000).to_word() as u32)?;
    em.cmov(Cond::B, Width::W32, Gpr::Rax, Gpr::Rcx)?;
    em.mov_imm32(Gpr::Rcx, Nzcv::from_nibble(0b0110).to_word() as u32)?;
    em.cmov(Cond::E, Width::W32, Gpr::Rax, Gpr::Rcx)?;
    em.mov_imm32(Gpr::Rcx, Nzcv::from_nibble(0b0011).to_word() as u32)?;
    em.cmov(Cond::P, Width::W32, Gpr::Rax, Gpr::Rcx)?;
    em.store(Width::W64, nzcv_slot(), Gpr::Rax)
}

/// 从保存区还原 EFLAGS：SF=N、ZF=Z、CF=!C、OF=V。会破坏 RAX、RCX、RDX。
pub fn emit_load_flags(em: &mut Emitter) -> Result<(), EmitError> {
    em.load(Width::W32, Gpr::Rax, nzcv_slot())?;
    em.shift_ri(Shift::Shr, Width::W32, Gpr::Rax, 28)?;
    em.alu_ri(Alu::Xor, Width::W32, Gpr::Rax, 0b0010)?;
    // N、Z (位 3、2) -> SF、ZF (位 7、6)
    em.mov_rr(Width::W32, Gpr::Rcx, Gpr::Rax)?;
    em.alu_ri(Alu::And, Width::W32, Gpr::Rcx, 0b1100)?;
    em.shift_ri(Shift::Shl, Width::W32, Gpr::Rcx, 4)?;
    // !C (位 1) -> CF (位 0)
    em.mov_rr(Width::W32, Gpr::Rdx, Gpr::Rax)?;
    em.shift_ri(Shift::Shr, Width::W32, Gpr::Rdx, 1)?;
    em.alu_ri(Alu::And, Width::W32, Gpr::Rdx, 1)?;
    em.alu_rr(Alu::Or, Width::W32, Gpr::Rcx, Gpr::Rdx)?;
    // V (位 0) -> OF (位 11)
    em.alu_ri(Alu::And, Width::W32, Gpr::Rax, 1)?;
    em.shift_ri(Shift::Shl, Width::W32, Gpr::Rax, 11)?;
    em.alu_rr(Alu::Or, Width::W32, Gpr::Rcx, Gpr::Rax)?;
    em.push(Gpr::Rcx)?;
    em.popfq()
}

// ----------------------------------------------------------------------
// 解释执行使用的标志计算
// ----------------------------------------------------------------------

/// 带进位加法，返回截断到宽度的结果和 NZCV
pub fn add_with_carry(width: Width, a: u64, b: u64, carry_in: bool) -> (u64, Nzcv) {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let bits = width.bits();
    let unsigned = u128::from(a) + u128::from(b) + u128::from(carry_in);
    let result = (unsigned as u64) & mask;
    let sign_bit = 1u64 << (bits - 1);
    let flags = Nzcv {
        n: result & sign_bit != 0,
        z: result == 0,
        c: unsigned >> bits != 0,
        v: (a & sign_bit == b & sign_bit) && (result & sign_bit != a & sign_bit),
    };
    (result, flags)
}

/// 逻辑运算的标志：C = V = 0
pub fn logic_flags(width: Width, result: u64) -> Nzcv {
    let result = result & width.mask();
    Nzcv {
        n: result >> (width.bits() - 1) & 1 != 0,
        z: result == 0,
        c: false,
        v: false,
    }
}

/// 浮点比较的 NZCV
pub fn fcmp_flags<T: PartialOrd>(a: T, b: T) -> Nzcv {
    let nibble = match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => 0b1000,
        Some(std::cmp::Ordering::Equal) => 0b0110,
        Some(std::cmp::Ordering::Greater) => 0b0010,
        None => 0b0011,
    };
    Nzcv::from_nibble(nibble)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_table_shape() {
        assert_eq!(COND_TABLE.len(), 16);
        assert_eq!(COND_TABLE[14], HostCond::Always);
        assert_eq!(COND_TABLE[15], HostCond::Always);
        let opcodes: Vec<u8> = COND_TABLE.iter().map(|c| c.opcode()).collect();
        assert_eq!(
            opcodes,
            [
                0x84, 0x85, 0x83, 0x82, 0x88, 0x89, 0x80, 0x81, 0x87, 0x86, 0x8D, 0x8C, 0x8F, 0x8E,
                0xE9, 0xE9
            ]
        );
        // 成对的条件互为取反
        for pair in COND_TABLE[..14].chunks(2) {
            match (pair[0], pair[1]) {
                (HostCond::Jcc(a), HostCond::Jcc(b)) => assert_eq!(a.invert(), b),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    /// 用宿主语义模拟 popfq 之后的条件判断，与客户机语义比对
    #[test]
    fn test_table_agrees_with_guest_semantics() {
        for nibble in 0..16u8 {
            let flags = Nzcv::from_nibble(nibble);
            let (sf, zf, cf, of) = (flags.n, flags.z, !flags.c, flags.v);
            for cond in Condition::ALL {
                let host = match host_cond(cond) {
                    HostCond::Always => true,
                    HostCond::Jcc(c) => match c {
                        Cond::O => of,
                        Cond::No => !of,
                        Cond::B => cf,
                        Cond::Ae => !cf,
                        Cond::E => zf,
                        Cond::Ne => !zf,
                        Cond::Be => cf || zf,
                        Cond::A => !cf && !zf,
                        Cond::S => sf,
                        Cond::Ns => !sf,
                        Cond::L => sf != of,
                        Cond::Ge => sf == of,
                        Cond::Le => zf || sf != of,
                        Cond::G => !zf && sf == of,
                        Cond::P | Cond::Np => unreachable!(),
                    },
                };
                assert_eq!(host, cond.holds(flags), "{cond:?} with {nibble:04b}");
            }
        }
    }

    #[test]
    fn test_add_with_carry() {
        let (r, f) = add_with_carry(Width::W32, 0xFFFF_FFFF, 1, false);
        assert_eq!(r, 0);
        assert_eq!(f.nibble(), 0b0110);

        let (r, f) = add_with_carry(Width::W64, i64::MAX as u64, 1, false);
        assert_eq!(r, 1 << 63);
        assert_eq!(f.nibble(), 0b1001);

        // 5 - 3：5 + !3 + 1，无借位时 C=1
        let (r, f) = add_with_carry(Width::W64, 5, !3, true);
        assert_eq!(r, 2);
        assert_eq!(f.nibble(), 0b0010);

        // 3 - 5 借位：C=0，N=1
        let (_, f) = add_with_carry(Width::W64, 3, !5, true);
        assert_eq!(f.nibble(), 0b1000);
    }

    #[test]
    fn test_fcmp_flags() {
        assert_eq!(fcmp_flags(1.0, 2.0).nibble(), 0b1000);
        assert_eq!(fcmp_flags(2.0, 2.0).nibble(), 0b0110);
        assert_eq!(fcmp_flags(3.0, 2.0).nibble(), 0b0010);
        assert_eq!(fcmp_flags(f64::NAN, 2.0).nibble(), 0b0011);
        assert_eq!(fcmp_flags(0.0f32, -0.0f32).nibble(), 0b0110);
    }

    #[test]
    fn test_store_flags_sequence_shape() {
        let mut em = Emitter::new(256);
        emit_store_flags(&mut em, CarryMode::Borrow).unwrap();
        let bytes = em.bytes();
        // sets al; setz cl; setae dl; seto r8b
        assert_eq!(&bytes[..12], &[0x0F, 0x98, 0xC0, 0x0F, 0x94, 0xC1, 0x0F, 0x93, 0xC2, 0x41, 0x0F, 0x90]);
        // 以 mov [rdi+0x318], rax 结束
        assert_eq!(&bytes[bytes.len() - 7..], &[0x48, 0x89, 0x87, 0x18, 0x03, 0, 0]);
    }

    #[test]
    fn test_load_flags_ends_with_popfq() {
        let mut em = Emitter::new(256);
        emit_load_flags(&mut em).unwrap();
        assert_eq!(&em.bytes()[em.len() - 2..], &[0x51, 0x9D]);
    }
}
