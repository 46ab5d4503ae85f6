//! dbt-engine - 指令翻译引擎
//!
//! - [`emit`]：只追加的代码缓冲区与 x86-64 指令编码
//! - [`decode`]：按指令族组织的位模式解码表，同一个操作既可以解释执行，
//!   也可以发射为宿主机代码
//! - [`tcache`]：客户机地址到宿主机代码的直接映射缓存
//! - [`runtime`]：查找或翻译基本块、缓存满时的重置、块链接与解释执行
//!
//! 生成的代码遵循一个简单的调用约定：`rdi` 指向 [`dbt_core::SaveArea`]，
//! 块结束时把下一条客户机 PC 写回保存区并 `ret`。

pub mod decode;
pub mod emit;
pub mod error;
pub mod runtime;
pub mod tcache;

pub use decode::{
    COND_TABLE, Control, DispatchError, Dispatcher, EmitOptions, ExecTarget, Family, Handled, PatternInfo,
    emit_exit,
};
pub use emit::{EmitError, Emitter, HostFeatures};
pub use error::{EngineError, EngineResult};
pub use runtime::{Runtime, RuntimeStats};
pub use tcache::{
    ClaimGuard, TranslationCache, TranslationCacheEntry, TranslationCacheError, TranslationCacheStats, guest_hash,
};
