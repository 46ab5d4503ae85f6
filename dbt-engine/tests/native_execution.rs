//! 本地执行集成测试
//!
//! 生成的代码经入口桩真正在宿主上运行，结果与解释器逐位比较：
//! - 浮点算术、比较、转换（含 NaN 输入的侧出口与 FPSR 位）
//! - 整数算术、带进位运算、位域与条件比较
//! - 独占访问与原子读改写直接作用在宿主内存上
#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::{Arc, OnceLock};

use dbt_core::context::FPCR_DN;
use dbt_core::{CpuContext, EngineConfig, ExclusiveMonitor, FlatMemory, GuestAddressOracle, GuestMemory, Nzcv, Vector128};
use dbt_engine::Runtime;
use proptest::prelude::*;

const BASE: u64 = 0x1000;
const RET: u32 = 0xD65F_03C0;

/// 每条指令后面跟一条 RET，各自成块
const INSNS: &[u32] = &[
    0x1E62_2820, // FADD D0, D1, D2
    0x1E63_8820, // FNMUL D0, D1, D3
    0x1E21_C020, // FSQRT S0, S1
    0x1E38_0020, // FCVTZS W0, S1
    0x1E62_2020, // FCMP D1, D2
    0x1E62_0C20, // FCSEL D0, D1, D2, EQ
    0xFA42_1024, // CCMP X1, X2, #4, NE
    0x9100_0400, // ADD X0, X0, #1
    0x9A02_0020, // ADC X0, X1, X2
    0xDA02_0020, // SBC X0, X1, X2
    0x9AC2_2020, // LSL X0, X1, X2
    0x9AC2_2820, // ASR X0, X1, X2
    0xD37C_EC20, // LSL X0, X1, #4
    0x9340_7C20, // SXTW X0, W1
    0xB378_0C20, // BFI X0, X1, #8, #4
    0x93C2_4020, // EXTR X0, X1, X2, #16
    0x9240_1C20, // AND X0, X1, #0xFF
    0xF240_1C20, // ANDS X0, X1, #0xFF
    0xD000_0001, // ADRP X1, #0x2000
];

/// 既当作 D 也当作 S 的低位使用
const FP_INPUTS: &[u64] = &[
    0,
    0x8000_0000_0000_0000,
    0x3FF8_0000_0000_0000, // 1.5
    0xC002_0000_0000_0000, // -2.25
    0x7E37_E43C_8800_759C, // 1e300
    0x7FF0_0000_0000_0000, // +inf
    0xFFF0_0000_0000_0000, // -inf
    0x7FF8_0000_0000_0001, // qNaN
    0x7FF0_0000_0000_0001, // sNaN
    0x4F00_0000,           // S: 2^31
    0xCF00_0000,           // S: -2^31
    0x3FC0_0000,           // S: 1.5
    0xBF80_0001,           // S: 略小于 -1
    0x7F80_0001,           // S: sNaN
    0xFFC0_0000,           // S: 负的 qNaN
];

struct Fixture {
    runtime: Runtime,
    memory: Arc<FlatMemory>,
}

fn program() -> Vec<u32> {
    INSNS.iter().flat_map(|&insn| [insn, RET]).collect()
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        dbt_core::logging::init_for_tests();
        let memory = Arc::new(FlatMemory::from_words(BASE, &program(), 0x1000));
        let runtime = Runtime::new(EngineConfig::default(), memory.clone()).unwrap();
        Fixture { runtime, memory }
    })
}

fn interpret(fixture: &Fixture, ctx: &mut CpuContext) {
    while fixture.memory.is_valid(ctx.pc(), 4) {
        fixture.runtime.step(ctx).unwrap();
    }
}

fn context(index: usize, x1: u64, x2: u64, fp: [u64; 3], nzcv: u8, default_nan: bool) -> CpuContext {
    let mut ctx = CpuContext::new();
    ctx.set_pc(BASE + 8 * index as u64);
    ctx.gpr.lr = 0;
    ctx.set_x(0, 0x5555_AAAA_5555_AAAA);
    ctx.set_x(1, x1);
    ctx.set_x(2, x2);
    for (i, bits) in fp.into_iter().enumerate() {
        ctx.set_v(i as u8 + 1, Vector128::new(bits, !bits));
    }
    ctx.set_v(0, Vector128::new(0x1234, 0x5678));
    ctx.set_nzcv(Nzcv::from_nibble(nzcv));
    if default_nan {
        ctx.fp.fpcr = FPCR_DN;
    }
    ctx
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_native_matches_interpreter(
        index in 0..INSNS.len(),
        x1: u64,
        x2 in prop_oneof![any::<u64>(), 0u64..130],
        fp in prop::array::uniform3(prop::sample::select(FP_INPUTS)),
        nzcv in 0u8..16,
        default_nan: bool,
    ) {
        let fixture = fixture();
        let mut expected = context(index, x1, x2, fp, nzcv, default_nan);
        let mut actual = expected;
        interpret(fixture, &mut expected);

        let before = fixture.runtime.stats().native_blocks;
        // SAFETY: 这些指令都不访问内存
        let steps = unsafe { fixture.runtime.run(&mut actual, 16) }.unwrap();
        prop_assert!(steps < 16);
        prop_assert!(fixture.runtime.stats().native_blocks > before);
        prop_assert_eq!(actual, expected, "insn {:#010x}", INSNS[index]);
    }
}

#[test]
fn test_nan_input_takes_side_exit() {
    let fixture = fixture();
    // FADD D0, D1, D2，D2 为信号 NaN
    let mut ctx = context(0, 0, 0, [0x3FF8_0000_0000_0000, 0x7FF0_0000_0000_0001, 0], 0, false);
    let interpreted = fixture.runtime.stats().interpreted_instructions;
    // SAFETY: 不访问内存
    unsafe { fixture.runtime.run(&mut ctx, 16) }.unwrap();
    assert_eq!(ctx.v(0), Vector128::new(0x7FF8_0000_0000_0001, 0));
    assert_ne!(ctx.fp.fpsr & dbt_core::context::FPSR_IOC, 0);
    assert!(fixture.runtime.stats().interpreted_instructions > interpreted);
    assert_eq!(ctx.pc(), 0);
}

#[test]
fn test_atomics_on_host_memory() {
    dbt_core::logging::init_for_tests();
    let words = [
        0xC85F_7C22, // LDXR X2, [X1]
        0x9100_0442, // ADD X2, X2, #1
        0xC803_7C22, // STXR W3, X2, [X1]
        0xF824_0025, // LDADD X4, X5, [X1]
        0xC8A6_7C27, // CAS X6, X7, [X1]
        RET,
    ];
    let memory = Arc::new(FlatMemory::from_words(BASE, &words, 0x1000));
    let runtime = Runtime::new(EngineConfig::default(), memory).unwrap();

    let mut cell = Box::new([41u64, 0]);
    let mut ctx = CpuContext::new();
    ctx.set_pc(BASE);
    ctx.set_x(1, cell.as_mut_ptr() as u64);
    ctx.set_x(4, 10);
    ctx.set_x(6, 52);
    ctx.set_x(7, 99);
    // SAFETY: X1 指向活着的 cell，块内只访问这一个字
    unsafe { runtime.run(&mut ctx, 16) }.unwrap();

    assert_eq!(ctx.x(2), 42);
    assert_eq!(ctx.x(3), 0);
    assert_eq!(ctx.x(5), 42);
    assert_eq!(ctx.x(6), 52);
    assert_eq!(cell[0], 99);
    assert_eq!(cell[1], 0);
    assert_eq!(ctx.monitor, ExclusiveMonitor::default());
    let stats = runtime.stats();
    assert!(stats.native_blocks > 0);
    assert_eq!(stats.interpreted_instructions, 0);
}
