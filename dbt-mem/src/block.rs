//! 翻译块描述符

use bitflags::bitflags;
use serde::Serialize;

use dbt_core::{GuestAddr, HostAddr};

bitflags! {
    /// 块状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct BlockFlags: u32 {
        const VALID  = 1 << 0;
        const HOT    = 1 << 1;
        const LINKED = 1 << 2;
        const DIRTY  = 1 << 3;
    }
}

/// 后继链接槽位数（条件分支的两个去向）
pub const CHAIN_SLOTS: usize = 2;

/// 块哈希：客户机地址高低 32 位异或
pub const fn block_hash(guest_pc: GuestAddr) -> u32 {
    (guest_pc ^ (guest_pc >> 32)) as u32
}

/// 一个已翻译的代码单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeBlock {
    pub guest_pc: GuestAddr,
    pub host_pc: HostAddr,
    pub size: usize,
    pub flags: BlockFlags,
    pub hash: u32,
    pub refcount: u32,
    /// 后继块的宿主地址，0 表示未链接
    pub chain: [HostAddr; CHAIN_SLOTS],
}

impl CodeBlock {
    pub fn new(guest_pc: GuestAddr, host_pc: HostAddr, size: usize) -> Self {
        Self {
            guest_pc,
            host_pc,
            size,
            flags: BlockFlags::VALID,
            hash: block_hash(guest_pc),
            refcount: 1,
            chain: [0; CHAIN_SLOTS],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(BlockFlags::VALID) && !self.flags.contains(BlockFlags::DIRTY)
    }

    pub fn is_linked(&self) -> bool {
        self.flags.contains(BlockFlags::LINKED)
    }

    pub fn mark_hot(&mut self) {
        self.flags.insert(BlockFlags::HOT);
    }

    /// 客户机代码被改写：块不再可用
    pub fn invalidate(&mut self) {
        self.flags.remove(BlockFlags::VALID);
        self.flags.insert(BlockFlags::DIRTY);
        self.unchain();
    }

    pub fn successor(&self, slot: usize) -> Option<HostAddr> {
        self.chain.get(slot).copied().filter(|&h| h != 0)
    }

    /// 记录后继；返回 false 表示槽位越界
    pub fn link(&mut self, slot: usize, target: HostAddr) -> bool {
        match self.chain.get_mut(slot) {
            Some(entry) => {
                *entry = target;
                self.flags.insert(BlockFlags::LINKED);
                true
            }
            None => false,
        }
    }

    pub fn unchain(&mut self) {
        self.chain = [0; CHAIN_SLOTS];
        self.flags.remove(BlockFlags::LINKED);
    }

    /// 是否链接到给定宿主地址
    pub fn links_to(&self, host_pc: HostAddr) -> bool {
        host_pc != 0 && self.chain.contains(&host_pc)
    }

    /// 删除指向 `host_pc` 的链接
    pub fn unlink_target(&mut self, host_pc: HostAddr) {
        for entry in self.chain.iter_mut() {
            if *entry == host_pc {
                *entry = 0;
            }
        }
        if self.chain.iter().all(|&h| h == 0) {
            self.flags.remove(BlockFlags::LINKED);
        }
    }
}
