//! 日志初始化
//!
//! 进程级、一次性的 tracing subscriber 安装。librdkafka 通过 `log` 输出的日志
//! 由 tracing-subscriber 的 `tracing-log` 桥接。

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `RUST_LOG` 未设置时使用的过滤规则
    #[serde(default = "default_level")]
    pub level: String,
    /// 输出 JSON 格式
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            with_target: default_with_target(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

/// 安装全局 subscriber
///
/// 只有第一次调用生效，之后的调用返回第一次的结果。
/// 宿主进程已经安装了其他 subscriber 时返回 `false`。
pub fn init_tracing(config: &LoggingConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target);

        let result = if config.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        result.is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default().with_level("debug");
        let first = init_tracing(&config);
        let second = init_tracing(&config.clone().with_json(true));
        assert_eq!(first, second);
    }

    #[test]
    fn config_defaults_from_empty_toml() {
        let config: LoggingConfig = toml::from_str("").unwrap();
        assert_eq!(config, LoggingConfig::default());
    }
}
