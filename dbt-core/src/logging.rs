//! 日志初始化
//!
//! 全部代码通过 `log` 门面输出；宿主程序调用 [`init`] 安装 `env_logger`。
//! `RUST_LOG` 环境变量优先于配置中的级别。

use env_logger::{Builder, Env};

use crate::config::LoggingConfig;

/// 安装全局日志器。已安装时返回 `false`，可以重复调用。
pub fn init(config: &LoggingConfig) -> bool {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.level.as_str()));
    if config.timestamps {
        builder.format_timestamp_millis();
    } else {
        builder.format_timestamp(None);
    }
    builder.try_init().is_ok()
}

/// 测试用日志器：输出由测试框架捕获
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
