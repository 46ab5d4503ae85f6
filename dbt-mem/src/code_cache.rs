//! 代码缓存分配器
//!
//! 在一段宿主机内存上做 bump 分配。每个页面维护保护状态：
//!
//! ```text
//! 可写(干净) --write--> 可写(脏) --flush_icache--> 可写(干净) --protect(RX)--> 可执行
//! ```
//!
//! 可执行是单向的，直到 [`CodeCache::reset`] 把所有页面恢复为可写。
//! 强制 W^X 时分配粒度至少为一页，保证不同块不会共享页面。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use dbt_core::config::{CODE_CACHE_DEFAULT_SIZE, CODE_CACHE_MAX_SIZE, CODE_CACHE_MIN_SIZE};
use dbt_core::{
    CodeCacheConfig, GuestAddr, HostAddr, ICacheService, Protection, ProtectionService, WxPolicy,
};

use crate::block::{CHAIN_SLOTS, CodeBlock};
use crate::host::{HostICache, HostProtection, HostRegion, page_size};
use crate::CodeCacheError;

/// 代码缓存状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeCacheInfo {
    pub base: HostAddr,
    pub size: usize,
    pub used: usize,
    pub free: usize,
    pub alignment: usize,
    pub block_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PageState {
    executable: bool,
    dirty: bool,
}

/// 把请求的容量钳制到 [MIN, MAX]，0 表示默认值
pub fn clamp_size(requested: usize) -> usize {
    if requested == 0 {
        return CODE_CACHE_DEFAULT_SIZE;
    }
    requested.clamp(CODE_CACHE_MIN_SIZE, CODE_CACHE_MAX_SIZE)
}

fn round_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

pub struct CodeCache {
    region: HostRegion,
    size: usize,
    alignment: usize,
    /// 实际分配粒度：W^X 下至少为一页
    granule: usize,
    page_size: usize,
    wx_policy: WxPolicy,
    used: AtomicUsize,
    block_count: AtomicUsize,
    pages: Mutex<Vec<PageState>>,
    protection: Arc<dyn ProtectionService>,
    icache: Arc<dyn ICacheService>,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("info", &self.info())
            .field("wx_policy", &self.wx_policy)
            .finish()
    }
}

impl CodeCache {
    /// 使用宿主机 mprotect 与指令缓存刷新创建代码缓存
    pub fn init(config: &CodeCacheConfig) -> Result<Self, CodeCacheError> {
        Self::with_services(config, Arc::new(HostProtection), Arc::new(HostICache))
    }

    /// 注入保护与刷新服务创建代码缓存
    pub fn with_services(
        config: &CodeCacheConfig,
        protection: Arc<dyn ProtectionService>,
        icache: Arc<dyn ICacheService>,
    ) -> Result<Self, CodeCacheError> {
        let alignment = config.alignment;
        if !alignment.is_power_of_two() {
            return Err(CodeCacheError::InvalidAlignment(alignment));
        }

        let page_size = page_size();
        let granule = match config.wx_policy {
            WxPolicy::Enforce => alignment.max(page_size),
            WxPolicy::Permissive => alignment,
        };
        let size = round_up(clamp_size(config.size), granule.max(page_size))
            .ok_or(CodeCacheError::InvalidSize(config.size))?
            .min(CODE_CACHE_MAX_SIZE);

        let region = HostRegion::map(size, config.wx_policy == WxPolicy::Permissive)?;
        let pages = vec![PageState::default(); size.div_ceil(page_size)];

        log::info!(
            "code cache initialised: {} KB at {:#x}, alignment {}, W^X {:?}",
            size / 1024,
            region.base(),
            alignment,
            config.wx_policy
        );

        Ok(Self {
            region,
            size,
            alignment,
            granule,
            page_size,
            wx_policy: config.wx_policy,
            used: AtomicUsize::new(0),
            block_count: AtomicUsize::new(0),
            pages: Mutex::new(pages),
            protection,
            icache,
        })
    }

    pub fn base(&self) -> HostAddr {
        self.region.base()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn wx_policy(&self) -> WxPolicy {
        self.wx_policy
    }

    pub fn used(&self) -> usize {
        let used = self.used.load(Ordering::Acquire);
        self.check_bookkeeping(used);
        used
    }

    pub fn free(&self) -> usize {
        self.size - self.used()
    }

    /// 地址是否落在已分配的范围内
    pub fn contains(&self, addr: HostAddr, len: usize) -> bool {
        let base = self.base();
        addr >= base && addr.saturating_add(len as u64) <= base + self.used() as u64
    }

    pub fn info(&self) -> CodeCacheInfo {
        let used = self.used();
        CodeCacheInfo {
            base: self.base(),
            size: self.size,
            used,
            free: self.size - used,
            alignment: self.alignment,
            block_count: self.block_count.load(Ordering::Relaxed),
        }
    }

    fn check_bookkeeping(&self, used: usize) {
        assert!(
            used <= self.size,
            "code cache bookkeeping corrupted: used {used} > size {}",
            self.size
        );
    }

    /// 按配置对齐分配
    pub fn alloc(&self, size: usize) -> Result<HostAddr, CodeCacheError> {
        self.alloc_aligned(size, self.alignment)
    }

    /// 分配 `size` 字节，地址按 `alignment` 对齐，长度向上取整到对齐值
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> Result<HostAddr, CodeCacheError> {
        if size == 0 {
            return Err(CodeCacheError::InvalidSize(size));
        }
        if !alignment.is_power_of_two() {
            return Err(CodeCacheError::InvalidAlignment(alignment));
        }
        let align = alignment.max(self.granule);
        let rounded = round_up(size, align).ok_or(CodeCacheError::InvalidSize(size))?;
        let base = self.base() as usize;

        let mut current = self.used.load(Ordering::Acquire);
        loop {
            self.check_bookkeeping(current);
            let full = CodeCacheError::Full {
                requested: rounded,
                free: self.size - current,
            };
            let start = round_up(base + current, align).ok_or_else(|| full.clone())? - base;
            let end = match start.checked_add(rounded) {
                Some(end) if end <= self.size => end,
                _ => return Err(full),
            };
            match self
                .used
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.block_count.fetch_add(1, Ordering::Relaxed);
                    log::trace!("code cache alloc {rounded} bytes at +{start:#x}");
                    return Ok((base + start) as HostAddr);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 回绕 bump 指针，所有页面恢复为可写
    ///
    /// 之前返回的地址在逻辑上全部失效，调用方必须同时清空翻译缓存。
    pub fn reset(&self) -> Result<(), CodeCacheError> {
        let mut pages = self.pages.lock();
        let had_exec = pages.iter().any(|p| p.executable);
        if had_exec && self.wx_policy == WxPolicy::Enforce {
            self.protection
                .set_protection(self.base(), self.size, Protection::ReadWrite)?;
        }
        pages.fill(PageState::default());
        self.used.store(0, Ordering::Release);
        self.block_count.store(0, Ordering::Relaxed);
        log::info!("code cache reset ({} KB)", self.size / 1024);
        Ok(())
    }

    fn page_range(&self, addr: HostAddr, len: usize) -> std::ops::Range<usize> {
        let offset = (addr - self.base()) as usize;
        let first = offset / self.page_size;
        let last = (offset + len.max(1) - 1) / self.page_size;
        first..last + 1
    }

    fn check_range(&self, addr: HostAddr, len: usize) -> Result<(), CodeCacheError> {
        if len == 0 || !self.contains(addr, len) {
            return Err(CodeCacheError::OutOfRange { addr, len });
        }
        Ok(())
    }

    /// 把生成的代码写入已分配的范围
    pub fn write(&self, addr: HostAddr, bytes: &[u8]) -> Result<(), CodeCacheError> {
        self.check_range(addr, bytes.len())?;
        let mut pages = self.pages.lock();
        let range = self.page_range(addr, bytes.len());
        if self.wx_policy == WxPolicy::Enforce && pages[range.clone()].iter().any(|p| p.executable)
        {
            return Err(CodeCacheError::NotWritable { addr });
        }

        let offset = (addr - self.base()) as usize;
        // SAFETY: 范围已检查位于映射区域内，且页面处于可写状态；页锁保证
        // 写入与保护切换不会交错
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.region.as_ptr().add(offset),
                bytes.len(),
            );
        }
        for page in &mut pages[range] {
            page.dirty = true;
        }
        Ok(())
    }

    /// 读取已分配范围内的字节
    pub fn read(&self, addr: HostAddr, len: usize) -> Result<Vec<u8>, CodeCacheError> {
        self.check_range(addr, len)?;
        let _pages = self.pages.lock();
        let offset = (addr - self.base()) as usize;
        let mut out = vec![0u8; len];
        // SAFETY: 范围已检查，所有状态下页面都可读
        unsafe {
            std::ptr::copy_nonoverlapping(self.region.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// 切换一段已分配范围的保护模式
    ///
    /// - `ReadExecute` 要求范围内页面已刷新（不脏）
    /// - 可执行页面不能再回到 `ReadWrite`，直到 `reset`
    /// - 强制 W^X 时拒绝 `ReadWriteExecute`
    pub fn protect(&self, addr: HostAddr, size: usize, mode: Protection) -> Result<(), CodeCacheError> {
        self.check_range(addr, size)?;
        let mut pages = self.pages.lock();
        let range = self.page_range(addr, size);
        let states = &mut pages[range.clone()];

        match mode {
            Protection::ReadExecute => {
                if states.iter().any(|p| p.dirty) {
                    return Err(CodeCacheError::DirtyPages { addr });
                }
                if states.iter().all(|p| p.executable) {
                    return Ok(());
                }
                if self.wx_policy == WxPolicy::Enforce {
                    let start = self.base() + (range.start * self.page_size) as u64;
                    let len = range.len() * self.page_size;
                    self.protection
                        .set_protection(start, len, Protection::ReadExecute)?;
                }
                for page in states.iter_mut() {
                    page.executable = true;
                }
            }
            Protection::ReadWrite => {
                if states.iter().any(|p| p.executable) {
                    return Err(CodeCacheError::OneWayProtection { addr });
                }
            }
            Protection::ReadWriteExecute => {
                if self.wx_policy == WxPolicy::Enforce {
                    return Err(CodeCacheError::WxViolation { addr });
                }
            }
        }
        Ok(())
    }

    /// 刷新指令缓存，`None` 表示整个已用范围
    pub fn flush_icache(&self, range: Option<(HostAddr, usize)>) -> Result<(), CodeCacheError> {
        let (addr, len) = match range {
            Some((addr, len)) => {
                self.check_range(addr, len)?;
                (addr, len)
            }
            None => {
                let used = self.used();
                if used == 0 {
                    return Ok(());
                }
                (self.base(), used)
            }
        };
        let mut pages = self.pages.lock();
        self.icache.flush(addr, len);
        let range = self.page_range(addr, len);
        for page in &mut pages[range] {
            page.dirty = false;
        }
        Ok(())
    }

    /// 是否整个范围都已可执行
    pub fn is_executable(&self, addr: HostAddr, len: usize) -> bool {
        if self.check_range(addr, len).is_err() {
            return false;
        }
        let pages = self.pages.lock();
        pages[self.page_range(addr, len)].iter().all(|p| p.executable)
    }

    /// 为新翻译的代码创建描述符
    pub fn init_block(
        &self,
        guest_pc: GuestAddr,
        host_pc: HostAddr,
        size: usize,
    ) -> Result<CodeBlock, CodeCacheError> {
        self.check_range(host_pc, size)?;
        Ok(CodeBlock::new(guest_pc, host_pc, size))
    }

    /// 记录 `from` 的第 `slot` 个后继为 `to`
    pub fn chain(&self, from: &mut CodeBlock, to: &CodeBlock, slot: usize) -> Result<(), CodeCacheError> {
        if slot >= CHAIN_SLOTS {
            return Err(CodeCacheError::InvalidChainSlot(slot));
        }
        if !to.is_valid() {
            return Err(CodeCacheError::OutOfRange {
                addr: to.host_pc,
                len: to.size,
            });
        }
        from.link(slot, to.host_pc);
        Ok(())
    }

    /// 清除块的全部后继链接
    pub fn unchain(&self, block: &mut CodeBlock) {
        block.unchain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProtection {
        calls: Mutex<Vec<(HostAddr, usize, Protection)>>,
    }

    impl ProtectionService for RecordingProtection {
        fn set_protection(
            &self,
            addr: HostAddr,
            size: usize,
            mode: Protection,
        ) -> Result<(), dbt_core::ProtectionError> {
            self.calls.lock().push((addr, size, mode));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingICache {
        flushes: AtomicUsize,
    }

    impl ICacheService for CountingICache {
        fn flush(&self, _addr: HostAddr, _size: usize) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cache(policy: WxPolicy, alignment: usize) -> (CodeCache, Arc<RecordingProtection>, Arc<CountingICache>) {
        let prot = Arc::new(RecordingProtection::default());
        let icache = Arc::new(CountingICache::default());
        let config = CodeCacheConfig {
            size: CODE_CACHE_MIN_SIZE,
            alignment,
            wx_policy: policy,
        };
        let cache = CodeCache::with_services(&config, prot.clone(), icache.clone()).unwrap();
        (cache, prot, icache)
    }

    #[test]
    fn test_clamp_size() {
        assert_eq!(clamp_size(0), CODE_CACHE_DEFAULT_SIZE);
        assert_eq!(clamp_size(10), CODE_CACHE_MIN_SIZE);
        assert_eq!(clamp_size(usize::MAX), CODE_CACHE_MAX_SIZE);
        assert_eq!(clamp_size(3 * 1024 * 1024), 3 * 1024 * 1024);
    }

    #[test]
    fn test_alloc_rounds_and_accounts() {
        let (cache, _, _) = cache(WxPolicy::Permissive, 64);
        let a = cache.alloc(10).unwrap();
        let b = cache.alloc(70).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(b, a + 64);
        let info = cache.info();
        assert_eq!(info.used, 64 + 128);
        assert_eq!(info.used + info.free, info.size);
        assert_eq!(info.block_count, 2);
    }

    #[test]
    fn test_alloc_full_is_explicit() {
        let (cache, _, _) = cache(WxPolicy::Permissive, 64);
        let size = cache.size();
        cache.alloc(size - 64).unwrap();
        let err = cache.alloc(128).unwrap_err();
        assert_eq!(err, CodeCacheError::Full { requested: 128, free: 64 });
        cache.reset().unwrap();
        assert_eq!(cache.alloc(size).unwrap(), cache.base());
    }

    #[test]
    fn test_enforce_uses_page_granule() {
        let (cache, _, _) = cache(WxPolicy::Enforce, 64);
        let a = cache.alloc(10).unwrap();
        let b = cache.alloc(10).unwrap();
        assert_eq!((b - a) as usize, page_size());
    }

    #[test]
    fn test_protection_state_machine() {
        let (cache, prot, icache) = cache(WxPolicy::Enforce, 64);
        let addr = cache.alloc(32).unwrap();
        cache.write(addr, &[0xC3; 32]).unwrap();

        // 写入后必须先刷新
        assert_eq!(
            cache.protect(addr, 32, Protection::ReadExecute),
            Err(CodeCacheError::DirtyPages { addr })
        );
        cache.flush_icache(Some((addr, 32))).unwrap();
        assert_eq!(icache.flushes.load(Ordering::Relaxed), 1);
        cache.protect(addr, 32, Protection::ReadExecute).unwrap();
        assert!(cache.is_executable(addr, 32));
        assert_eq!(prot.calls.lock().len(), 1);

        // 单向：不能再写，也不能切回可写
        assert_eq!(cache.write(addr, &[0x90]), Err(CodeCacheError::NotWritable { addr }));
        assert_eq!(
            cache.protect(addr, 32, Protection::ReadWrite),
            Err(CodeCacheError::OneWayProtection { addr })
        );
        assert_eq!(
            cache.protect(addr, 32, Protection::ReadWriteExecute),
            Err(CodeCacheError::WxViolation { addr })
        );
        assert_eq!(cache.read(addr, 4).unwrap(), vec![0xC3; 4]);

        cache.reset().unwrap();
        assert_eq!(prot.calls.lock().last().map(|c| c.2), Some(Protection::ReadWrite));
        let again = cache.alloc(32).unwrap();
        assert_eq!(again, addr);
        cache.write(again, &[0x90]).unwrap();
    }

    #[test]
    fn test_write_outside_allocation_rejected() {
        let (cache, _, _) = cache(WxPolicy::Permissive, 64);
        let base = cache.base();
        assert!(matches!(cache.write(base, &[1]), Err(CodeCacheError::OutOfRange { .. })));
        let addr = cache.alloc(16).unwrap();
        assert!(cache.write(addr + 60, &[0; 8]).is_err());
    }

    #[test]
    fn test_block_descriptors() {
        let (cache, _, _) = cache(WxPolicy::Permissive, 64);
        let h1 = cache.alloc(16).unwrap();
        let h2 = cache.alloc(16).unwrap();
        let mut a = cache.init_block(0x1000, h1, 16).unwrap();
        let b = cache.init_block(0x2000, h2, 16).unwrap();
        assert!(cache.init_block(0x3000, h2 + 4096, 16).is_err());

        cache.chain(&mut a, &b, 0).unwrap();
        assert_eq!(a.successor(0), Some(h2));
        assert_eq!(cache.chain(&mut a, &b, 2), Err(CodeCacheError::InvalidChainSlot(2)));
        cache.unchain(&mut a);
        assert!(!a.is_linked());
    }
}
