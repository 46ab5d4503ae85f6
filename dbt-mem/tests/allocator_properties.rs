//! 代码缓存分配器属性测试
//!
//! 测试覆盖:
//! - 成功分配的范围互不重叠
//! - 所有地址满足对齐
//! - reset 后可以一次分配整个容量
//! - 并发分配

use std::sync::Arc;

use dbt_core::config::CODE_CACHE_MIN_SIZE;
use dbt_core::{CodeCacheConfig, HostAddr, ICacheService, Protection, ProtectionError, ProtectionService, WxPolicy};
use dbt_mem::{CodeCache, CodeCacheError};
use proptest::prelude::*;

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

fn new_cache(alignment: usize) -> CodeCache {
    let config = CodeCacheConfig {
        size: CODE_CACHE_MIN_SIZE,
        alignment,
        wx_policy: WxPolicy::Permissive,
    };
    CodeCache::with_services(&config, Arc::new(NoopProtection), Arc::new(NoopICache)).unwrap()
}

#[derive(Debug, Clone)]
enum Request {
    Alloc(usize),
    Aligned(usize, u32),
}

fn request() -> impl Strategy<Value = Request> {
    prop_oneof![
        (1usize..20_000).prop_map(Request::Alloc),
        (1usize..20_000, 4u32..13).prop_map(|(s, a)| Request::Aligned(s, a)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_allocations_disjoint_and_aligned(
        alignment_log in 4u32..13,
        requests in prop::collection::vec(request(), 1..200),
    ) {
        let alignment = 1usize << alignment_log;
        let cache = new_cache(alignment);
        let mut ranges: Vec<(u64, u64)> = Vec::new();

        for req in requests {
            let (result, size, align) = match req {
                Request::Alloc(size) => (cache.alloc(size), size, alignment),
                Request::Aligned(size, a) => {
                    let align = 1usize << a;
                    (cache.alloc_aligned(size, align), size, align.max(alignment))
                }
            };
            match result {
                Ok(addr) => {
                    prop_assert_eq!(addr % align as u64, 0);
                    prop_assert_eq!(addr % alignment as u64, 0);
                    let end = addr + size as u64;
                    for &(s, e) in &ranges {
                        prop_assert!(end <= s || addr >= e, "overlap {:#x}..{:#x} with {:#x}..{:#x}", addr, end, s, e);
                    }
                    ranges.push((addr, end));
                }
                Err(CodeCacheError::Full { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
            let info = cache.info();
            prop_assert_eq!(info.used + info.free, info.size);
        }
    }

    #[test]
    fn prop_reset_allows_full_allocation(sizes in prop::collection::vec(1usize..100_000, 1..40)) {
        let cache = new_cache(64);
        for size in sizes {
            let _ = cache.alloc(size);
        }
        cache.reset().unwrap();
        prop_assert_eq!(cache.used(), 0);
        prop_assert_eq!(cache.alloc(cache.size()).unwrap(), cache.base());
        prop_assert_eq!(cache.free(), 0);
    }
}

#[test]
fn test_concurrent_allocations_do_not_overlap() {
    let cache = new_cache(64);
    let mut all: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| (0..500).filter_map(|_| cache.alloc(100).ok()).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    let count = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), count);
    for pair in all.windows(2) {
        assert!(pair[1] - pair[0] >= 128);
    }
    assert_eq!(cache.info().block_count, count);
}
