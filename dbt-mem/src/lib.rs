//! dbt-mem - 可执行代码缓存
//!
//! - [`CodeCache`]：单一宿主机内存区域上的 bump 分配器，带页级保护状态
//! - [`CodeBlock`]：已翻译块的描述符，支持两个后继链接槽
//! - [`host`]：mmap 区域、mprotect 保护服务与指令缓存刷新

use thiserror::Error;

use dbt_core::{HostAddr, ProtectionError};

pub mod block;
pub mod code_cache;
pub mod host;

pub use block::{BlockFlags, CHAIN_SLOTS, CodeBlock, block_hash};
pub use code_cache::{CodeCache, CodeCacheInfo, clamp_size};
pub use host::{HostICache, HostProtection, HostRegion, page_size};

/// 代码缓存错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeCacheError {
    /// 空间不足，调用方应当 reset 或回退到解释执行
    #[error("code cache full: requested {requested} bytes, {free} bytes free")]
    Full { requested: usize, free: usize },

    #[error("invalid allocation size {0}")]
    InvalidSize(usize),

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("range {addr:#x}+{len} is outside the allocated code cache")]
    OutOfRange { addr: HostAddr, len: usize },

    #[error("code at {addr:#x} is executable and can no longer be written")]
    NotWritable { addr: HostAddr },

    #[error("code at {addr:#x} was written but the instruction cache was not flushed")]
    DirtyPages { addr: HostAddr },

    #[error("executable code at {addr:#x} cannot return to writable before reset")]
    OneWayProtection { addr: HostAddr },

    #[error("writable and executable mapping requested at {addr:#x} while W^X is enforced")]
    WxViolation { addr: HostAddr },

    #[error("invalid chain slot {0}")]
    InvalidChainSlot(usize),

    #[error("failed to map {size} bytes for the code cache: errno {errno}")]
    Map { size: usize, errno: i32 },

    #[error(transparent)]
    Protection(#[from] ProtectionError),
}
