//! 客户机地址到宿主机代码的翻译缓存
//!
//! 直接映射：槽位数 N 是 2 的幂，地址经乘法哈希后取低位定位槽位。后插入的
//! 条目覆盖同槽位的旧条目，冲突只会造成一次多余的未命中，调用方重新翻译即可。
//!
//! 每个槽位一把 `parking_lot::Mutex`，计数器用原子变量，所有方法只需 `&self`。
//! [`TranslationCache::try_claim`] 保证同一客户机地址同时只有一个线程在翻译。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use dbt_core::{GuestAddr, HostAddr};

/// 翻译缓存错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslationCacheError {
    #[error("translation cache size {0} is not a power of two")]
    InvalidSize(usize),

    #[error("refusing to cache a null host address for guest {guest:#x}")]
    NullHostAddress { guest: GuestAddr },

    #[error("refusing to cache an empty translation for guest {guest:#x}")]
    EmptyTranslation { guest: GuestAddr },
}

/// 翻译缓存槽位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranslationCacheEntry {
    pub guest: GuestAddr,
    /// 0 表示空槽位
    pub host: HostAddr,
    pub size: usize,
    pub hash: u32,
    pub refcount: u32,
}

impl TranslationCacheEntry {
    pub const EMPTY: Self = Self {
        guest: 0,
        host: 0,
        size: 0,
        hash: 0,
        refcount: 0,
    };

    pub const fn is_empty(&self) -> bool {
        self.host == 0
    }

    /// 条目覆盖的客户机范围是否与 `[start, end)` 相交
    fn overlaps(&self, start: GuestAddr, end: GuestAddr) -> bool {
        let len = (self.size as u64).max(4);
        !self.is_empty() && self.guest < end && self.guest.saturating_add(len) > start
    }
}

/// 翻译缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranslationCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub live_entries: u64,
    pub inserts: u64,
    /// 插入时覆盖了其他客户机地址的次数
    pub evictions: u64,
}

impl TranslationCacheStats {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// 客户机地址哈希（Knuth 乘法哈希）
pub const fn guest_hash(guest: GuestAddr) -> u32 {
    (guest.wrapping_mul(2_654_435_761) >> 32) as u32
}

pub struct TranslationCache {
    slots: Vec<Mutex<TranslationCacheEntry>>,
    mask: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    live: AtomicU64,
    claims: Mutex<HashSet<GuestAddr>>,
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("entries", &self.slots.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl TranslationCache {
    /// 创建 `entries` 个槽位的缓存
    pub fn new(entries: usize) -> Result<Self, TranslationCacheError> {
        if !entries.is_power_of_two() {
            return Err(TranslationCacheError::InvalidSize(entries));
        }
        Ok(Self {
            slots: (0..entries).map(|_| Mutex::new(TranslationCacheEntry::EMPTY)).collect(),
            mask: entries - 1,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            live: AtomicU64::new(0),
            claims: Mutex::new(HashSet::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, guest: GuestAddr) -> &Mutex<TranslationCacheEntry> {
        &self.slots[guest_hash(guest) as usize & self.mask]
    }

    /// 查找翻译结果；命中时引用计数加一
    pub fn lookup(&self, guest: GuestAddr) -> Option<HostAddr> {
        let mut entry = self.slot(guest).lock();
        if !entry.is_empty() && entry.guest == guest {
            entry.refcount = entry.refcount.saturating_add(1);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.host)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// 读取条目但不计入统计
    pub fn peek(&self, guest: GuestAddr) -> Option<TranslationCacheEntry> {
        let entry = self.slot(guest).lock();
        (!entry.is_empty() && entry.guest == guest).then_some(*entry)
    }

    /// 插入翻译结果，返回被覆盖的其他客户机地址的条目
    pub fn insert(
        &self,
        guest: GuestAddr,
        host: HostAddr,
        size: usize,
    ) -> Result<Option<TranslationCacheEntry>, TranslationCacheError> {
        if host == 0 {
            return Err(TranslationCacheError::NullHostAddress { guest });
        }
        if size == 0 {
            return Err(TranslationCacheError::EmptyTranslation { guest });
        }

        let new = TranslationCacheEntry {
            guest,
            host,
            size,
            hash: guest_hash(guest),
            refcount: 0,
        };
        let old = std::mem::replace(&mut *self.slot(guest).lock(), new);
        self.inserts.fetch_add(1, Ordering::Relaxed);

        if old.is_empty() {
            self.live.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if old.guest == guest {
            return Ok(None);
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        log::trace!("tcache slot collision: {:#x} evicted by {guest:#x}", old.guest);
        Ok(Some(old))
    }

    /// 删除 `guest` 的条目，返回是否存在
    pub fn invalidate(&self, guest: GuestAddr) -> bool {
        let mut entry = self.slot(guest).lock();
        if entry.is_empty() || entry.guest != guest {
            return false;
        }
        *entry = TranslationCacheEntry::EMPTY;
        self.live.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// 清空全部槽位
    pub fn invalidate_all(&self) {
        for slot in &self.slots {
            *slot.lock() = TranslationCacheEntry::EMPTY;
        }
        self.live.store(0, Ordering::Relaxed);
    }

    /// 删除与客户机范围 `[guest, guest + size)` 相交的条目，返回被删除的条目
    pub fn invalidate_region(&self, guest: GuestAddr, size: u64) -> Vec<TranslationCacheEntry> {
        let end = guest.saturating_add(size);
        let mut removed = Vec::new();
        for slot in &self.slots {
            let mut entry = slot.lock();
            if entry.overlaps(guest, end) {
                removed.push(*entry);
                *entry = TranslationCacheEntry::EMPTY;
            }
        }
        self.live.fetch_sub(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> TranslationCacheStats {
        TranslationCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            live_entries: self.live.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// 声明正在翻译 `guest`；已有其他线程在翻译时返回 `None`
    pub fn try_claim(&self, guest: GuestAddr) -> Option<ClaimGuard<'_>> {
        self.claims.lock().insert(guest).then_some(ClaimGuard { cache: self, guest })
    }

    pub fn is_claimed(&self, guest: GuestAddr) -> bool {
        self.claims.lock().contains(&guest)
    }
}

/// 翻译声明，drop 时释放
#[derive(Debug)]
#[must_use]
pub struct ClaimGuard<'a> {
    cache: &'a TranslationCache,
    guest: GuestAddr,
}

impl ClaimGuard<'_> {
    pub fn guest(&self) -> GuestAddr {
        self.guest
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.cache.claims.lock().remove(&self.guest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 找一个与 `guest` 同槽位的不同地址
    fn colliding(cache: &TranslationCache, guest: GuestAddr) -> GuestAddr {
        let slot = guest_hash(guest) as usize & cache.mask;
        (1..)
            .map(|i| guest + i * 4)
            .find(|&g| guest_hash(g) as usize & cache.mask == slot)
            .unwrap()
    }

    #[test]
    fn test_insert_lookup_refcount() {
        let cache = TranslationCache::new(64).unwrap();
        assert_eq!(cache.lookup(0x1000), None);
        assert_eq!(cache.insert(0x1000, 0xAA00, 32), Ok(None));
        assert_eq!(cache.peek(0x1000).unwrap().refcount, 0);
        assert_eq!(cache.lookup(0x1000), Some(0xAA00));
        assert_eq!(cache.lookup(0x1000), Some(0xAA00));
        assert_eq!(cache.peek(0x1000).unwrap().refcount, 2);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.live_entries, stats.inserts), (2, 1, 1, 1));
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_invalid_inserts() {
        assert_eq!(TranslationCache::new(100).unwrap_err(), TranslationCacheError::InvalidSize(100));
        let cache = TranslationCache::new(16).unwrap();
        assert_eq!(
            cache.insert(0x1000, 0, 8),
            Err(TranslationCacheError::NullHostAddress { guest: 0x1000 })
        );
        assert_eq!(
            cache.insert(0x1000, 0x10, 0),
            Err(TranslationCacheError::EmptyTranslation { guest: 0x1000 })
        );
        assert_eq!(cache.stats().live_entries, 0);
    }

    #[test]
    fn test_collision_evicts() {
        let cache = TranslationCache::new(16).unwrap();
        let other = colliding(&cache, 0x4000);
        cache.insert(0x4000, 0x100, 8).unwrap();
        let evicted = cache.insert(other, 0x200, 8).unwrap().unwrap();
        assert_eq!(evicted.guest, 0x4000);
        assert_eq!(cache.lookup(0x4000), None);
        assert_eq!(cache.lookup(other), Some(0x200));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.live_entries, 1);
    }

    #[test]
    fn test_reinsert_same_guest_is_not_eviction() {
        let cache = TranslationCache::new(16).unwrap();
        cache.insert(0x4000, 0x100, 8).unwrap();
        assert_eq!(cache.insert(0x4000, 0x300, 8), Ok(None));
        assert_eq!(cache.lookup(0x4000), Some(0x300));
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().live_entries, 1);
    }

    #[test]
    fn test_invalidate_variants() {
        let cache = TranslationCache::new(1024).unwrap();
        for i in 0..8u64 {
            cache.insert(0x1000 + i * 0x10, 0x8000 + i, 16).unwrap();
        }
        assert!(cache.invalidate(0x1000));
        assert!(!cache.invalidate(0x1000));

        // [0x1038, 0x1048) 与 0x1030 和 0x1040 两个块相交
        let removed = cache.invalidate_region(0x1038, 0x10);
        let mut guests: Vec<_> = removed.iter().map(|e| e.guest).collect();
        guests.sort_unstable();
        assert_eq!(guests, [0x1030, 0x1040]);
        assert_eq!(cache.stats().live_entries, 5);

        cache.invalidate_all();
        assert_eq!(cache.stats().live_entries, 0);
        assert_eq!(cache.lookup(0x1070), None);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let cache = TranslationCache::new(16).unwrap();
        let guard = cache.try_claim(0x2000).unwrap();
        assert_eq!(guard.guest(), 0x2000);
        assert!(cache.try_claim(0x2000).is_none());
        assert!(cache.try_claim(0x2004).is_some());
        drop(guard);
        assert!(!cache.is_claimed(0x2000));
        assert!(cache.try_claim(0x2000).is_some());
    }
}
