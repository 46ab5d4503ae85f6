//! 引擎顶层错误

use thiserror::Error;

use dbt_core::{ConfigError, ContextError, GuestAddr, MemoryFault};
use dbt_mem::CodeCacheError;

use crate::decode::DispatchError;
use crate::emit::EmitError;
use crate::tcache::TranslationCacheError;

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    TranslationCache(#[from] TranslationCacheError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Memory(#[from] MemoryFault),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 保存区版本或退出原因无效
    #[error(transparent)]
    Context(#[from] ContextError),

    /// 块的第一条指令就无法翻译，调用方应解释执行该指令
    #[error("guest instruction at {pc:#x} cannot be translated: {source}")]
    Untranslatable {
        pc: GuestAddr,
        #[source]
        source: DispatchError,
    },

    /// 另一个线程正在翻译同一地址
    #[error("guest block at {pc:#x} is being translated by another thread")]
    Busy { pc: GuestAddr },
}

impl EngineError {
    /// 调用方是否可以改用解释器继续执行
    pub fn is_fallback(&self) -> bool {
        matches!(self, EngineError::Untranslatable { .. } | EngineError::Busy { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
