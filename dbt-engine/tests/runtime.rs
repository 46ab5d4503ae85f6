//! 翻译驱动集成测试
//!
//! 测试覆盖:
//! - FADD + RET 端到端翻译：块长度、登记、引用计数
//! - 无法翻译的指令：块提前结束、首条指令交给解释器
//! - 代码缓存满时重置两个缓存并重试
//! - 块链接与区域失效
//! - 向量寄存器别名策略
//! - 并发翻译与缓存重置：登记的地址总是指向自己的代码

use std::sync::Arc;

use dbt_core::config::CODE_CACHE_MIN_SIZE;
use dbt_core::{
    CodeCacheConfig, CpuContext, EngineConfig, FlatMemory, HostAddr, ICacheService, MemoryFault, Protection,
    ProtectionError, ProtectionService, VectorAliasPolicy, WxPolicy,
};
use dbt_engine::{DispatchError, Dispatcher, EmitOptions, Emitter, EngineError, HostFeatures, Runtime};
use dbt_mem::CodeCache;

const BASE: u64 = 0x1000;

const FADD_D0_D1_D2: u32 = 0x1E62_2820;
const FMAX_D0_D1_D2: u32 = 0x1E62_4820;
const FADD_D16_D17_D18: u32 = 0x1E72_2A30;
const ADD_X0_X0_1: u32 = 0x9100_0400;
const B_PLUS_8: u32 = 0x1400_0002;
const RET: u32 = 0xD65F_03C0;
const MOVZ_W_LSL32: u32 = 0x52C0_0021;

struct NoopProtection;

impl ProtectionService for NoopProtection {
    fn set_protection(&self, _: HostAddr, _: usize, _: Protection) -> Result<(), ProtectionError> {
        Ok(())
    }
}

struct NoopICache;

impl ICacheService for NoopICache {
    fn flush(&self, _: HostAddr, _: usize) {}
}

fn runtime_with(config: EngineConfig, words: &[u32]) -> Runtime {
    dbt_core::logging::init_for_tests();
    let cache_config = CodeCacheConfig {
        size: CODE_CACHE_MIN_SIZE,
        alignment: 4096,
        wx_policy: WxPolicy::Permissive,
    };
    let code_cache =
        CodeCache::with_services(&cache_config, Arc::new(NoopProtection), Arc::new(NoopICache)).unwrap();
    let memory = Arc::new(FlatMemory::from_words(BASE, words, 0x2000));
    Runtime::with_code_cache(config, code_cache, memory, HostFeatures::all()).unwrap()
}

fn runtime(words: &[u32]) -> Runtime {
    runtime_with(EngineConfig::default(), words)
}

/// 单独发射一条指令
fn emit_one(encoding: u32, pc: u64) -> Vec<u8> {
    let options = EmitOptions::new(HostFeatures::all(), VectorAliasPolicy::Reject);
    let mut em = Emitter::new(1024);
    Dispatcher::new().emit(encoding, pc, &mut em, &options).unwrap();
    em.into_bytes()
}

#[test]
fn test_fadd_ret_end_to_end() {
    let rt = runtime(&[FADD_D0_D1_D2, RET]);
    let host = rt.lookup_or_translate(BASE).unwrap();

    let fadd = emit_one(FADD_D0_D1_D2, BASE);
    let ret = emit_one(RET, BASE + 4);
    let block = rt.block(BASE).expect("block registered");
    assert_eq!(block.host_pc, host);
    assert_eq!(block.size, fadd.len() + ret.len());
    assert!(block.is_valid());
    assert!(rt.code_cache().is_executable(host, block.size));

    let code = rt.code_cache().read(host, block.size).unwrap();
    assert_eq!(code, [fadd, ret].concat());

    let tcache = rt.translation_cache();
    assert_eq!(tcache.peek(BASE).unwrap().refcount, 0);
    assert_eq!(tcache.lookup(BASE), Some(host));
    assert_eq!(tcache.peek(BASE).unwrap().refcount, 1);

    // 第二次查找命中，不再翻译
    assert_eq!(rt.lookup_or_translate(BASE).unwrap(), host);
    let stats = rt.stats();
    assert_eq!(stats.blocks_translated, 1);
    assert_eq!(stats.guest_instructions, 2);
    assert_eq!(stats.translation_cache.live_entries, 1);
    assert_eq!(stats.code_cache.block_count, 1);
}

#[test]
fn test_untranslatable_instruction_ends_block() {
    let rt = runtime(&[FADD_D0_D1_D2, FMAX_D0_D1_D2, RET]);
    let host = rt.lookup_or_translate(BASE).unwrap();

    // FADD 之后是写回 BASE+4 的退出桩
    let fadd = emit_one(FADD_D0_D1_D2, BASE);
    let mut stub = Emitter::new(64);
    dbt_engine::emit_exit(&mut stub, BASE + 4).unwrap();
    let block = rt.block(BASE).unwrap();
    assert_eq!(rt.code_cache().read(host, block.size).unwrap(), [fadd, stub.into_bytes()].concat());
    assert_eq!(rt.stats().fallbacks, 1);

    // 以 FMAX 开头的块无法翻译，交给解释器
    let err = rt.lookup_or_translate(BASE + 4).unwrap_err();
    assert!(err.is_fallback());
    assert!(matches!(
        err,
        EngineError::Untranslatable {
            pc: 0x1004,
            source: DispatchError::Unimplemented { mnemonic: "FMAX", .. }
        }
    ));

    let mut ctx = CpuContext::new();
    ctx.set_pc(BASE + 4);
    ctx.set_d(1, 1.5);
    ctx.set_d(2, -3.0);
    rt.step(&mut ctx).unwrap();
    assert_eq!(ctx.d(0), 1.5);
    assert_eq!(ctx.pc(), BASE + 8);
    assert_eq!(rt.stats().interpreted_instructions, 1);

    // 解释之后的指令可以继续翻译
    assert!(rt.lookup_or_translate(BASE + 8).is_ok());
}

#[test]
fn test_errors_surface_to_caller() {
    let rt = runtime(&[MOVZ_W_LSL32]);
    let err = rt.lookup_or_translate(BASE).unwrap_err();
    assert!(matches!(err, EngineError::Dispatch(DispatchError::Unallocated { .. })));
    assert!(!err.is_fallback());

    let err = rt.lookup_or_translate(0x9000).unwrap_err();
    assert!(matches!(err, EngineError::Memory(MemoryFault::Unmapped { addr: 0x9000, .. })));

    let _claim = rt.translation_cache().try_claim(BASE + 4).unwrap();
    assert!(matches!(rt.lookup_or_translate(BASE + 4), Err(EngineError::Busy { pc: 0x1004 })));
}

#[test]
fn test_block_limit_appends_exit() {
    let config = EngineConfig::default().with_max_block_insns(2);
    let rt = runtime_with(config, &[ADD_X0_X0_1, ADD_X0_X0_1, ADD_X0_X0_1, RET]);
    rt.lookup_or_translate(BASE).unwrap();
    assert_eq!(rt.stats().guest_instructions, 2);
    assert_eq!(rt.stats().fallbacks, 0);
    // 下一块从第三条指令开始，两块互相独立
    rt.lookup_or_translate(BASE + 8).unwrap();
    assert_eq!(rt.stats().blocks_translated, 2);
    assert!(rt.block(BASE).unwrap().successor(0).is_some());
}

#[test]
fn test_cache_full_resets_and_retries() {
    // 1MB 缓存、4KB 粒度：最多 256 个块
    let words = vec![RET; 300];
    let rt = runtime(&words);
    for i in 0..256 {
        rt.lookup_or_translate(BASE + i * 4).unwrap();
    }
    assert_eq!(rt.stats().cache_resets, 0);
    assert_eq!(rt.code_cache().info().free, 0);

    let host = rt.lookup_or_translate(BASE + 256 * 4).unwrap();
    let stats = rt.stats();
    assert_eq!(stats.cache_resets, 1);
    assert_eq!(stats.translation_cache.live_entries, 1);
    assert_eq!(stats.code_cache.block_count, 1);
    assert_eq!(host, rt.code_cache().base());
    assert!(rt.translation_cache().peek(BASE).is_none());
    assert!(rt.block(BASE).is_none());
}

#[test]
fn test_reset_never_leaves_stale_entries() {
    // 每条指令单独成块，块内容随 PC 不同
    const BLOCKS: u64 = 300;
    let words: Vec<u32> = (0..BLOCKS as u32).map(|i| 0xD280_0000 | (i << 5)).collect();
    let config = EngineConfig::default().with_max_block_insns(1);
    let rt = runtime_with(config, &words);

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let rt = &rt;
            s.spawn(move || {
                for round in 0..3 {
                    for i in 0..BLOCKS {
                        let pc = BASE + ((i + t * 71 + round) % BLOCKS) * 4;
                        match rt.lookup_or_translate(pc) {
                            Ok(_) | Err(EngineError::Busy { .. }) => {}
                            Err(err) => panic!("translate {pc:#x}: {err}"),
                        }
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..20 {
                rt.reset_caches().unwrap();
                std::thread::yield_now();
            }
        });
    });

    let mut live = 0;
    for i in 0..BLOCKS {
        let pc = BASE + i * 4;
        let Some(entry) = rt.translation_cache().peek(pc) else {
            continue;
        };
        let mut expected = emit_one(words[i as usize], pc);
        let mut stub = Emitter::new(64);
        dbt_engine::emit_exit(&mut stub, pc + 4).unwrap();
        expected.extend_from_slice(stub.bytes());
        assert_eq!(rt.code_cache().read(entry.host, expected.len()).unwrap(), expected, "block {pc:#x}");
        assert_eq!(rt.block(pc).map(|b| b.host_pc), Some(entry.host));
        live += 1;
    }
    assert!(live > 0);
    assert!(rt.stats().cache_resets >= 20);
}

#[test]
fn test_chaining_and_region_invalidation() {
    // 0x1000: B 0x1008；0x1004: RET；0x1008: RET
    let rt = runtime(&[B_PLUS_8, RET, RET]);

    // 先翻译前驱，后继翻译时回填链接
    rt.lookup_or_translate(BASE).unwrap();
    assert!(!rt.block(BASE).unwrap().is_linked());
    let target = rt.lookup_or_translate(BASE + 8).unwrap();
    let pred = rt.block(BASE).unwrap();
    assert!(pred.is_linked());
    assert_eq!(pred.successor(0), Some(target));
    assert_eq!(rt.stats().blocks_chained, 1);

    // 改写后继所在的客户机代码
    assert_eq!(rt.invalidate_region(BASE + 8, 4), 1);
    assert!(!rt.block(BASE + 8).unwrap().is_valid());
    assert!(!rt.block(BASE).unwrap().is_linked());
    assert!(rt.translation_cache().peek(BASE + 8).is_none());
    assert!(rt.translation_cache().peek(BASE).is_some());

    // 重新翻译后重新链接
    let target = rt.lookup_or_translate(BASE + 8).unwrap();
    assert_eq!(rt.block(BASE).unwrap().successor(0), Some(target));
}

#[test]
fn test_vector_alias_policy() {
    let rt = runtime(&[FADD_D16_D17_D18, RET]);
    let err = rt.lookup_or_translate(BASE).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Untranslatable {
            source: DispatchError::AliasedVectorRegister { reg: 16, host: 0 },
            ..
        }
    ));

    let config = EngineConfig::default().with_vector_alias_policy(VectorAliasPolicy::Alias);
    let rt = runtime_with(config, &[FADD_D16_D17_D18, RET]);
    rt.lookup_or_translate(BASE).unwrap();
    assert_eq!(rt.stats().vector_alias_hits, 3);
}

#[test]
fn test_run_interpreted() {
    let rt = runtime(&[ADD_X0_X0_1, ADD_X0_X0_1, ADD_X0_X0_1]);
    let mut ctx = CpuContext::new();
    ctx.set_pc(BASE);
    assert_eq!(rt.run_interpreted(&mut ctx, 3).unwrap(), 3);
    assert_eq!(ctx.x(0), 3);
    assert_eq!(ctx.pc(), BASE + 12);
    assert_eq!(rt.stats().interpreted_instructions, 3);
}
