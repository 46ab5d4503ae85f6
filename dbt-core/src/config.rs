//! 翻译引擎配置
//!
//! 所有配置节都支持 serde，可以从 TOML 加载，缺省字段取默认值：
//!
//! ```toml
//! [code_cache]
//! size = 33554432
//! wx_policy = "enforce"
//!
//! [translation]
//! max_block_insns = 32
//! vector_alias_policy = "alias"
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 代码缓存最小容量
pub const CODE_CACHE_MIN_SIZE: usize = 1024 * 1024;
/// 代码缓存最大容量
pub const CODE_CACHE_MAX_SIZE: usize = 256 * 1024 * 1024;
/// 代码缓存默认容量
pub const CODE_CACHE_DEFAULT_SIZE: usize = 16 * 1024 * 1024;
/// 默认分配对齐
pub const CODE_CACHE_DEFAULT_ALIGNMENT: usize = 4096;
/// 翻译缓存默认槽位数
pub const TRANSLATION_CACHE_DEFAULT_ENTRIES: usize = 4096;

/// 配置特征
pub trait Config: Clone + Default + Send + Sync {
    /// 验证配置
    fn validate(&self) -> Result<(), ConfigError>;

    /// 获取配置摘要
    fn summary(&self) -> String;
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// W^X 策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WxPolicy {
    /// 代码页在可写和可执行之间单向切换
    #[default]
    Enforce,
    /// 整个区域一直映射为 RWX，保护切换只做记录
    Permissive,
}

/// 客户机向量寄存器 16–31 的处理策略
///
/// 宿主机只有 16 个 XMM 寄存器，映射时取编号低 4 位，V16–V31 会与
/// V0–V15 共用同一个宿主寄存器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorAliasPolicy {
    /// 拒绝翻译，返回错误，由解释器执行
    #[default]
    Reject,
    /// 按别名翻译并记录警告
    Alias,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCacheConfig {
    /// 请求的容量，0 表示默认值，会被钳制到 [1MB, 256MB]
    pub size: usize,
    /// 分配对齐，必须是 2 的幂
    pub alignment: usize,
    pub wx_policy: WxPolicy,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            size: CODE_CACHE_DEFAULT_SIZE,
            alignment: CODE_CACHE_DEFAULT_ALIGNMENT,
            wx_policy: WxPolicy::Enforce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationCacheConfig {
    /// 槽位数，必须是 2 的幂
    pub entries: usize,
}

impl Default for TranslationCacheConfig {
    fn default() -> Self {
        Self {
            entries: TRANSLATION_CACHE_DEFAULT_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// 单个翻译块的最大客户机指令数
    pub max_block_insns: usize,
    /// 单个翻译块的发射缓冲区容量
    pub max_block_bytes: usize,
    pub vector_alias_policy: VectorAliasPolicy,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            max_block_insns: 64,
            max_block_bytes: 16 * 1024,
            vector_alias_policy: VectorAliasPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// 日志行是否带时间戳
    pub timestamps: bool,
}

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub code_cache: CodeCacheConfig,
    pub translation_cache: TranslationCacheConfig,
    pub translation: TranslationConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本解析并验证
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 设置代码缓存容量
    pub fn with_code_cache_size(mut self, size: usize) -> Self {
        self.code_cache.size = size;
        self
    }

    /// 设置代码缓存对齐
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.code_cache.alignment = alignment;
        self
    }

    pub fn with_wx_policy(mut self, policy: WxPolicy) -> Self {
        self.code_cache.wx_policy = policy;
        self
    }

    /// 设置翻译缓存槽位数
    pub fn with_translation_cache_entries(mut self, entries: usize) -> Self {
        self.translation_cache.entries = entries;
        self
    }

    pub fn with_max_block_insns(mut self, insns: usize) -> Self {
        self.translation.max_block_insns = insns;
        self
    }

    pub fn with_max_block_bytes(mut self, bytes: usize) -> Self {
        self.translation.max_block_bytes = bytes;
        self
    }

    pub fn with_vector_alias_policy(mut self, policy: VectorAliasPolicy) -> Self {
        self.translation.vector_alias_policy = policy;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.logging.level = level;
        self
    }
}

impl Config for EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let align = self.code_cache.alignment;
        if !align.is_power_of_two() || align < 16 {
            return Err(ConfigError::invalid(
                "code_cache.alignment",
                format!("{align} is not a power of two >= 16"),
            ));
        }
        if align > CODE_CACHE_MIN_SIZE {
            return Err(ConfigError::invalid(
                "code_cache.alignment",
                format!("{align} exceeds the minimum cache size"),
            ));
        }

        let entries = self.translation_cache.entries;
        if !entries.is_power_of_two() || entries < 16 {
            return Err(ConfigError::invalid(
                "translation_cache.entries",
                format!("{entries} is not a power of two >= 16"),
            ));
        }

        if self.translation.max_block_insns == 0 || self.translation.max_block_insns > 4096 {
            return Err(ConfigError::invalid(
                "translation.max_block_insns",
                "must be in 1..=4096",
            ));
        }
        if self.translation.max_block_bytes < 256 {
            return Err(ConfigError::invalid(
                "translation.max_block_bytes",
                "must be at least 256",
            ));
        }
        Ok(())
    }

    fn summary(&self) -> String {
        format!(
            "代码缓存={}MB (对齐 {}, W^X {:?}), 翻译缓存={} 槽, 块上限={} 条/{} 字节, 向量别名={:?}, 日志={}",
            self.code_cache.size / (1024 * 1024),
            self.code_cache.alignment,
            self.code_cache.wx_policy,
            self.translation_cache.entries,
            self.translation.max_block_insns,
            self.translation.max_block_bytes,
            self.translation.vector_alias_policy,
            self.logging.level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.code_cache.size, CODE_CACHE_DEFAULT_SIZE);
        assert_eq!(config.translation_cache.entries, 4096);
    }

    #[test]
    fn test_builder_and_validation() {
        let bad = EngineConfig::new().with_alignment(3000);
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::Invalid { field: "code_cache.alignment", .. })
        ));

        let bad = EngineConfig::new().with_translation_cache_entries(1000);
        assert!(bad.validate().is_err());

        let bad = EngineConfig::new().with_max_block_insns(0);
        assert!(bad.validate().is_err());

        let good = EngineConfig::new()
            .with_alignment(64)
            .with_translation_cache_entries(256)
            .with_vector_alias_policy(VectorAliasPolicy::Alias);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [code_cache]
            size = 2097152
            wx_policy = "permissive"

            [translation]
            max_block_insns = 8
            vector_alias_policy = "alias"

            [logging]
            level = "debug"
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.code_cache.size, 2 * 1024 * 1024);
        assert_eq!(config.code_cache.alignment, CODE_CACHE_DEFAULT_ALIGNMENT);
        assert_eq!(config.code_cache.wx_policy, WxPolicy::Permissive);
        assert_eq!(config.translation.max_block_insns, 8);
        assert_eq!(config.translation.vector_alias_policy, VectorAliasPolicy::Alias);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.translation_cache.entries, TRANSLATION_CACHE_DEFAULT_ENTRIES);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let err = EngineConfig::from_toml_str("[translation_cache]\nentries = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = EngineConfig::from_toml_str("[code_cache\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_summary_mentions_sizes() {
        let summary = EngineConfig::default().summary();
        assert!(summary.contains("16MB"));
        assert!(summary.contains("4096"));
    }
}
