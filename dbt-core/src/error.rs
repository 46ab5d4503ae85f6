//! 核心错误类型

use thiserror::Error;

use crate::GuestAddr;

/// 上下文保存/恢复错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("save area version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("save area buffer too small: {len} bytes, need {required}")]
    BufferTooSmall { len: usize, required: usize },

    #[error("unknown block exit code {0}")]
    UnknownExit(u32),
}

/// 客户机内存访问错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryFault {
    #[error("guest access outside mapped memory at {addr:#x} ({len} bytes)")]
    Unmapped { addr: GuestAddr, len: usize },

    #[error("guest address {addr:#x} is not aligned to {alignment}")]
    Misaligned { addr: GuestAddr, alignment: usize },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
