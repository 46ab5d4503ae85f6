//! 宿主机可执行内存与保护/缓存刷新服务
//!
//! [`HostRegion`] 通过 mmap 映射一段匿名内存作为代码缓存的后备存储；
//! [`HostProtection`] 与 [`HostICache`] 分别实现 `dbt-core` 中的
//! `ProtectionService` 和 `ICacheService`。

use dbt_core::{HostAddr, ICacheService, Protection, ProtectionError, ProtectionService};

use crate::CodeCacheError;

/// 宿主机页大小
pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            // SAFETY: sysconf 没有前置条件
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        } else {
            4096
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// 一段匿名映射的宿主机内存
        pub struct HostRegion {
            ptr: *mut u8,
            size: usize,
        }

        impl std::fmt::Debug for HostRegion {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("HostRegion")
                    .field("ptr", &self.ptr)
                    .field("size", &self.size)
                    .finish()
            }
        }

        impl HostRegion {
            /// 映射 `size` 字节。`executable` 为真时直接映射为 RWX。
            pub fn map(size: usize, executable: bool) -> Result<Self, CodeCacheError> {
                if size == 0 {
                    return Err(CodeCacheError::InvalidSize(0));
                }

                let mut prot = libc::PROT_READ | libc::PROT_WRITE;
                if executable {
                    prot |= libc::PROT_EXEC;
                }

                #[cfg(target_os = "macos")]
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
                #[cfg(not(target_os = "macos"))]
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

                // SAFETY: 匿名映射，不涉及已有内存
                let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
                if ptr == libc::MAP_FAILED {
                    return Err(CodeCacheError::Map { size, errno: last_errno() });
                }

                Ok(HostRegion { ptr: ptr as *mut u8, size })
            }

            pub fn base(&self) -> HostAddr {
                self.ptr as HostAddr
            }

            pub fn size(&self) -> usize {
                self.size
            }

            pub(crate) fn as_ptr(&self) -> *mut u8 {
                self.ptr
            }
        }

        impl Drop for HostRegion {
            fn drop(&mut self) {
                // SAFETY: ptr/size 来自成功的 mmap
                unsafe {
                    libc::munmap(self.ptr as *mut libc::c_void, self.size);
                }
            }
        }

        // SAFETY: 区域的并发访问由 CodeCache 的页状态锁串行化
        unsafe impl Send for HostRegion {}
        unsafe impl Sync for HostRegion {}

        /// 基于 mprotect 的保护服务
        #[derive(Debug, Default, Clone, Copy)]
        pub struct HostProtection;

        impl ProtectionService for HostProtection {
            fn set_protection(
                &self,
                addr: HostAddr,
                size: usize,
                mode: Protection,
            ) -> Result<(), ProtectionError> {
                let prot = match mode {
                    Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
                    Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
                    Protection::ReadWriteExecute => {
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
                    }
                };
                let page = page_size() as HostAddr;
                let start = addr & !(page - 1);
                let end = (addr + size as HostAddr + page - 1) & !(page - 1);

                // SAFETY: 调用方保证范围位于自己映射的区域内
                let rc = unsafe {
                    libc::mprotect(start as *mut libc::c_void, (end - start) as usize, prot)
                };
                if rc != 0 {
                    return Err(ProtectionError::Failed { addr, size, mode, errno: last_errno() });
                }
                Ok(())
            }
        }
    } else {
        #[derive(Debug)]
        pub struct HostRegion {
            size: usize,
        }

        impl HostRegion {
            pub fn map(size: usize, _executable: bool) -> Result<Self, CodeCacheError> {
                Err(CodeCacheError::Map { size, errno: 0 })
            }

            pub fn base(&self) -> HostAddr {
                0
            }

            pub fn size(&self) -> usize {
                self.size
            }

            pub(crate) fn as_ptr(&self) -> *mut u8 {
                std::ptr::null_mut()
            }
        }

        #[derive(Debug, Default, Clone, Copy)]
        pub struct HostProtection;

        impl ProtectionService for HostProtection {
            fn set_protection(
                &self,
                addr: HostAddr,
                size: usize,
                mode: Protection,
            ) -> Result<(), ProtectionError> {
                Err(ProtectionError::Failed { addr, size, mode, errno: 0 })
            }
        }
    }
}

/// 指令缓存刷新
///
/// x86-64 的指令缓存与数据缓存保持一致，无需显式刷新；AArch64 需要
/// 按缓存行清理数据缓存并使指令缓存失效。
#[derive(Debug, Default, Clone, Copy)]
pub struct HostICache;

impl ICacheService for HostICache {
    fn flush(&self, addr: HostAddr, size: usize) {
        if size == 0 {
            return;
        }
        #[cfg(target_arch = "aarch64")]
        {
            use std::arch::asm;
            let line = 64usize;
            let start = (addr as usize) & !(line - 1);
            let end = addr as usize + size;
            // SAFETY: 缓存维护指令只作用于给定地址所在的缓存行
            unsafe {
                let mut at = start;
                while at < end {
                    asm!("dc cvau, {0}", in(reg) at, options(nostack));
                    at += line;
                }
                asm!("dsb ish", options(nostack));
                let mut at = start;
                while at < end {
                    asm!("ic ivau, {0}", in(reg) at, options(nostack));
                    at += line;
                }
                asm!("dsb ish", options(nostack));
                asm!("isb", options(nostack));
            }
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = addr;
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_protect() {
        let page = page_size();
        let region = HostRegion::map(page * 2, false).unwrap();
        assert_eq!(region.base() % page as u64, 0);
        HostProtection
            .set_protection(region.base(), page, Protection::ReadExecute)
            .unwrap();
        HostProtection
            .set_protection(region.base(), page, Protection::ReadWrite)
            .unwrap();
        HostICache.flush(region.base(), page);
    }
}
