//! dbt-core - 二进制翻译器的核心数据模型
//!
//! 提供解码器与生成代码共同依赖的类型：
//! - [`CpuContext`]：客户机通用寄存器、向量寄存器和浮点控制/状态寄存器
//! - [`SaveArea`]：固定布局的上下文字节镜像，也是生成代码的调用约定
//! - 协作者接口：内存保护、指令缓存刷新、客户机地址有效性判断、客户机内存
//! - [`EngineConfig`] 与日志初始化

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod host_fp;
pub mod logging;
pub mod memory;
pub mod save_area;

pub use config::{
    CodeCacheConfig, Config, EngineConfig, LogLevel, LoggingConfig, TranslationCacheConfig,
    TranslationConfig, VectorAliasPolicy, WxPolicy,
};
pub use context::{
    Condition, CpuContext, ExclusiveMonitor, FpRegisters, GeneralRegisters, Nzcv, Reg31,
    RoundingMode, VectorRegisters,
};
pub use error::{ConfigError, ContextError, MemoryFault};
pub use hooks::{
    GuestAddressOracle, GuestMemory, ICacheService, Protection, ProtectionError,
    ProtectionService,
};
pub use host_fp::HostFpAccess;
pub use memory::FlatMemory;
pub use save_area::{BlockExit, SAVE_AREA_SIZE, SAVE_AREA_VERSION, SaveArea, restore, save};

pub use dbt_simd::Vector128;

/// 客户机虚拟地址
pub type GuestAddr = u64;

/// 宿主机地址（代码缓存中的地址）
pub type HostAddr = u64;
