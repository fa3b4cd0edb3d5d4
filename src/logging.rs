//! 日志模块 - tracing 初始化辅助
//!
//! 库本身只通过 tracing 宏发事件；这里给嵌入方提供一个可选的
//! 初始化入口，按配置挂上文件日志和控制台输出。

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 初始化日志系统
///
/// 传入目录时日志按天滚动写到 `<dir>/syncwatch.log.<date>`，返回的
/// guard 需要由调用方持有到进程结束，否则缓冲中的日志会丢。不传
/// 目录时只输出到控制台。全局 subscriber 只能设置一次，重复调用
/// 是无害的空操作。
pub fn init_logging(log_dir: Option<&Path>, config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let level = config.tracing_level();
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into());

    match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::daily(dir, "syncwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            // debug 构建同时输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer().with_target(false);
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false));
            let _ = tracing::subscriber::set_global_default(subscriber);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing_defaults_to_info() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);

        config.level = "DEBUG".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);

        config.level = "nonsense".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }
}
