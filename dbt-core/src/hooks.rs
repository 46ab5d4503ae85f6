//! 翻译引擎依赖的外部协作者接口
//!
//! 翻译核心不直接调用 mmap/mprotect，也不解析客户机地址空间，而是通过
//! 这里的 trait 请求服务。宿主机实现在 `dbt-mem::host` 中，客户机内存的
//! 简单实现为 [`crate::FlatMemory`]。

use thiserror::Error;

use crate::error::MemoryFault;
use crate::{GuestAddr, HostAddr};

/// 代码页保护模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
    /// 仅在不强制 W^X 的平台上使用
    ReadWriteExecute,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("failed to change protection of {addr:#x}+{size:#x} to {mode:?}: errno {errno}")]
    Failed {
        addr: HostAddr,
        size: usize,
        mode: Protection,
        errno: i32,
    },
}

/// 内存保护服务
pub trait ProtectionService: Send + Sync {
    fn set_protection(
        &self,
        addr: HostAddr,
        size: usize,
        mode: Protection,
    ) -> Result<(), ProtectionError>;
}

/// 指令缓存刷新服务
pub trait ICacheService: Send + Sync {
    fn flush(&self, addr: HostAddr, size: usize);
}

/// 客户机地址有效性判断，用于决定是否继续解码
pub trait GuestAddressOracle: Send + Sync {
    fn is_valid(&self, addr: GuestAddr, len: u64) -> bool;
}

/// 客户机内存
///
/// 解释执行时所有读写都经过该接口；实现自行负责同步。
pub trait GuestMemory: GuestAddressOracle {
    fn read(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemoryFault>;

    fn write(&self, addr: GuestAddr, data: &[u8]) -> Result<(), MemoryFault>;

    fn read_u8(&self, addr: GuestAddr) -> Result<u8, MemoryFault> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, addr: GuestAddr) -> Result<u16, MemoryFault> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: GuestAddr) -> Result<u32, MemoryFault> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, addr: GuestAddr) -> Result<u64, MemoryFault> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_u128(&self, addr: GuestAddr) -> Result<u128, MemoryFault> {
        let mut b = [0u8; 16];
        self.read(addr, &mut b)?;
        Ok(u128::from_le_bytes(b))
    }

    /// 按 `size` 字节（1/2/4/8）读取并零扩展
    fn read_sized(&self, addr: GuestAddr, size: usize) -> Result<u64, MemoryFault> {
        match size {
            1 => self.read_u8(addr).map(u64::from),
            2 => self.read_u16(addr).map(u64::from),
            4 => self.read_u32(addr).map(u64::from),
            _ => self.read_u64(addr),
        }
    }

    /// 写入 `value` 的低 `size` 字节
    fn write_sized(&self, addr: GuestAddr, value: u64, size: usize) -> Result<(), MemoryFault> {
        self.write(addr, &value.to_le_bytes()[..size.min(8)])
    }

    fn write_u128(&self, addr: GuestAddr, value: u128) -> Result<(), MemoryFault> {
        self.write(addr, &value.to_le_bytes())
    }

    /// 内存中 `size` 字节的值等于 `expected` 时写入 `new`，返回原值
    ///
    /// 默认实现分两次访问；被多个执行线程共享的实现应在同一把锁下完成。
    fn compare_exchange(&self, addr: GuestAddr, size: usize, expected: u64, new: u64) -> Result<u64, MemoryFault> {
        let old = self.read_sized(addr, size)?;
        if old == expected {
            self.write_sized(addr, new, size)?;
        }
        Ok(old)
    }

    /// 读-改-写 `size` 字节，返回原值；原子性要求同 [`GuestMemory::compare_exchange`]
    fn fetch_update(&self, addr: GuestAddr, size: usize, update: &dyn Fn(u64) -> u64) -> Result<u64, MemoryFault> {
        let old = self.read_sized(addr, size)?;
        self.write_sized(addr, update(old), size)?;
        Ok(old)
    }

    /// 取指：指令必须 4 字节对齐
    fn fetch(&self, pc: GuestAddr) -> Result<u32, MemoryFault> {
        if pc & 3 != 0 {
            return Err(MemoryFault::Misaligned {
                addr: pc,
                alignment: 4,
            });
        }
        self.read_u32(pc)
    }
}
