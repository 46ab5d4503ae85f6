//! 解码表与条件表的结构测试
//!
//! 测试覆盖:
//! - 所有指令族的模式两两互斥
//! - 模式值不超出掩码，全零编码不匹配任何模式
//! - 位域、带进位、原子与屏障等编码落在各自的族里
//! - 条件表的形状与宿主标志语义

use dbt_core::{Condition, Nzcv};
use dbt_engine::decode::HostCond;
use dbt_engine::emit::x86::Cond;
use dbt_engine::{COND_TABLE, Dispatcher, Family};

#[test]
fn test_patterns_are_mutually_exclusive() {
    let patterns = Dispatcher::new().patterns();
    assert!(patterns.len() > 60);

    for (i, a) in patterns.iter().enumerate() {
        assert_eq!(a.value & !a.mask, 0, "{} value outside mask", a.mnemonic);
        assert_ne!(a.value, 0, "{} matches the zero word", a.mnemonic);
        for b in &patterns[i + 1..] {
            // 存在同时满足两者的编码当且仅当公共掩码位上的值一致
            let common = a.mask & b.mask;
            assert_ne!(
                a.value & common,
                b.value & common,
                "{:?} {} overlaps {:?} {}",
                a.family,
                a.mnemonic,
                b.family,
                b.mnemonic
            );
        }
    }
}

#[test]
fn test_every_family_has_patterns() {
    for family in Family::ALL {
        assert!(!family.patterns().is_empty(), "{family:?}");
        assert!(family.patterns().iter().all(|p| p.family == family));
    }
}

#[test]
fn test_encodings_route_to_family() {
    let patterns = Dispatcher::new().patterns();
    let cases: &[(u32, Family, &str)] = &[
        (0xD37C_EC20, Family::Arithmetic, "SBFM/BFM/UBFM"),
        (0x93C2_4020, Family::Arithmetic, "EXTR"),
        (0x9A02_0020, Family::Arithmetic, "ADC/SBC"),
        (0x9240_1C20, Family::Arithmetic, "logical (immediate)"),
        (0x9AC2_2020, Family::Arithmetic, "LSLV/LSRV/ASRV/RORV"),
        (0xD000_0001, Family::Arithmetic, "ADR/ADRP"),
        (0xF863_7822, Family::LoadStore, "LDR/STR (register offset)"),
        (0xC85F_7C22, Family::LoadStore, "load/store exclusive"),
        (0xC8A3_7C22, Family::LoadStore, "load/store exclusive"),
        (0xF823_6022, Family::LoadStore, "atomic memory operation"),
        (0xD503_3BBF, Family::LoadStore, "DMB/DSB/ISB/CLREX"),
        (0xD503_201F, Family::LoadStore, "HINT"),
    ];
    for &(encoding, family, mnemonic) in cases {
        let matched: Vec<_> = patterns.iter().filter(|p| encoding & p.mask == p.value).collect();
        assert_eq!(matched.len(), 1, "{encoding:#010x}");
        assert_eq!(matched[0].family, family, "{encoding:#010x}");
        assert_eq!(matched[0].mnemonic, mnemonic, "{encoding:#010x}");
    }
}

#[test]
fn test_cond_table_shape() {
    assert_eq!(COND_TABLE.len(), 16);
    assert_eq!(COND_TABLE[14], HostCond::Always);
    assert_eq!(COND_TABLE[15], HostCond::Always);
    assert_eq!(COND_TABLE[14].opcode(), 0xE9);

    // 客户机条件成对取反，宿主条件码也成对取反（最低位）
    for pair in COND_TABLE[..14].chunks(2) {
        match (pair[0], pair[1]) {
            (HostCond::Jcc(a), HostCond::Jcc(b)) => assert_eq!(a.code() ^ 1, b.code()),
            other => panic!("unexpected pair {other:?}"),
        }
    }
    for entry in &COND_TABLE[..14] {
        assert_eq!(entry.opcode() & 0xF0, 0x80);
    }
}

/// 在 x86 标志上求值条件码
fn host_holds(cond: Cond, sf: bool, zf: bool, cf: bool, of: bool) -> bool {
    match cond {
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
        Cond::P | Cond::Np => unreachable!("parity is never selected"),
    }
}

#[test]
fn test_cond_table_matches_guest_semantics() {
    // 载入标志时 C 取反进入 CF
    for nibble in 0..16u8 {
        let flags = Nzcv::from_nibble(nibble);
        for (index, cond) in Condition::ALL.iter().enumerate() {
            let host = match COND_TABLE[index] {
                HostCond::Always => true,
                HostCond::Jcc(c) => host_holds(c, flags.n, flags.z, !flags.c, flags.v),
            };
            assert_eq!(host, cond.holds(flags), "{cond:?} with nzcv {nibble:04b}");
        }
    }
}
