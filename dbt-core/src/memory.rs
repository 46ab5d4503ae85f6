//! 平坦客户机内存
//!
//! 一段从 `base` 开始的连续字节，越界访问返回 [`MemoryFault::Unmapped`]。
//! 用于解释执行、测试以及把已加载的代码段交给翻译器。

use parking_lot::RwLock;

use crate::error::MemoryFault;
use crate::hooks::{GuestAddressOracle, GuestMemory};
use crate::GuestAddr;

pub struct FlatMemory {
    base: GuestAddr,
    data: RwLock<Vec<u8>>,
}

impl FlatMemory {
    /// 创建 `size` 字节的清零内存
    pub fn new(base: GuestAddr, size: usize) -> Self {
        Self {
            base,
            data: RwLock::new(vec![0; size]),
        }
    }

    /// 以指令字序列初始化，常用于构造测试程序
    pub fn from_words(base: GuestAddr, words: &[u32], size: usize) -> Self {
        let mem = Self::new(base, size.max(words.len() * 4));
        {
            let mut data = mem.data.write();
            for (i, w) in words.iter().enumerate() {
                data[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
            }
        }
        mem
    }

    pub fn base(&self) -> GuestAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    /// 把 `bytes` 装载到 `addr`
    pub fn load(&self, addr: GuestAddr, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.write(addr, bytes)
    }

    /// 在写锁内读出 `size` 字节、计算新值并写回，返回原值
    fn locked_update(
        &self,
        addr: GuestAddr,
        size: usize,
        update: impl FnOnce(u64) -> Option<u64>,
    ) -> Result<u64, MemoryFault> {
        let size = size.min(8);
        let mut data = self.data.write();
        let total = data.len();
        let range = self.range(addr, size, total)?;
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&data[range.clone()]);
        let old = u64::from_le_bytes(raw);
        if let Some(new) = update(old) {
            data[range].copy_from_slice(&new.to_le_bytes()[..size]);
        }
        Ok(old)
    }

    fn range(&self, addr: GuestAddr, len: usize, total: usize) -> Result<std::ops::Range<usize>, MemoryFault> {
        let fault = MemoryFault::Unmapped { addr, len };
        let start = addr.checked_sub(self.base).ok_or_else(|| fault.clone())?;
        let start = usize::try_from(start).map_err(|_| fault.clone())?;
        let end = start.checked_add(len).ok_or_else(|| fault.clone())?;
        if end > total {
            return Err(fault);
        }
        Ok(start..end)
    }
}

impl GuestAddressOracle for FlatMemory {
    fn is_valid(&self, addr: GuestAddr, len: u64) -> bool {
        let Ok(len) = usize::try_from(len) else {
            return false;
        };
        self.range(addr, len, self.size()).is_ok()
    }
}

impl GuestMemory for FlatMemory {
    fn read(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemoryFault> {
        let data = self.data.read();
        let range = self.range(addr, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write(&self, addr: GuestAddr, bytes: &[u8]) -> Result<(), MemoryFault> {
        let mut data = self.data.write();
        let total = data.len();
        let range = self.range(addr, bytes.len(), total)?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn compare_exchange(&self, addr: GuestAddr, size: usize, expected: u64, new: u64) -> Result<u64, MemoryFault> {
        self.locked_update(addr, size, |old| (old == expected).then_some(new))
    }

    fn fetch_update(&self, addr: GuestAddr, size: usize, update: &dyn Fn(u64) -> u64) -> Result<u64, MemoryFault> {
        self.locked_update(addr, size, |old| Some(update(old)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let mem = FlatMemory::new(0x1000, 0x100);
        assert!(mem.is_valid(0x1000, 4));
        assert!(mem.is_valid(0x10FC, 4));
        assert!(!mem.is_valid(0x10FD, 4));
        assert!(!mem.is_valid(0x0FFF, 1));
        assert!(mem.read_u32(0x1100).is_err());
    }

    #[test]
    fn test_sized_access() {
        let mem = FlatMemory::new(0, 64);
        mem.write_sized(8, 0x1122_3344_5566_7788, 4).unwrap();
        assert_eq!(mem.read_u64(8).unwrap(), 0x5566_7788);
        assert_eq!(mem.read_sized(8, 2).unwrap(), 0x7788);
        mem.write_u128(16, u128::MAX).unwrap();
        assert_eq!(mem.read_u128(16).unwrap(), u128::MAX);
    }

    #[test]
    fn test_atomic_updates() {
        let mem = FlatMemory::new(0, 64);
        mem.write_sized(8, 5, 4).unwrap();
        assert_eq!(mem.compare_exchange(8, 4, 4, 9).unwrap(), 5);
        assert_eq!(mem.read_u32(8).unwrap(), 5);
        assert_eq!(mem.compare_exchange(8, 4, 5, 9).unwrap(), 5);
        assert_eq!(mem.read_u32(8).unwrap(), 9);
        assert_eq!(mem.fetch_update(8, 2, &|v| v + 0xFFFF).unwrap(), 9);
        // 只写回低 2 字节
        assert_eq!(mem.read_u32(8).unwrap(), 8);
        assert!(mem.compare_exchange(62, 4, 0, 1).is_err());
    }

    #[test]
    fn test_fetch_alignment() {
        let mem = FlatMemory::from_words(0x400, &[0xD65F_03C0], 16);
        assert_eq!(mem.fetch(0x400).unwrap(), 0xD65F_03C0);
        assert_eq!(
            mem.fetch(0x402),
            Err(MemoryFault::Misaligned { addr: 0x402, alignment: 4 })
        );
    }
}
