//! 生产者配置模块

use crate::error::ConfigError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Broker 地址（host:port）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrokerAddress {
    host: String,
    port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::Invalid("broker host 不能为空".to_string()));
        }
        if port == 0 {
            return Err(ConfigError::Invalid(format!("broker {} 的端口不能为 0", host)));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 解析逗号分隔的 bootstrap 列表，例如 `"a:9092,b:9092"`
    pub fn parse_list(list: &str) -> Result<Vec<Self>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("broker 地址缺少端口: {}", s)))?;

        // IPv6 地址使用 [::1]:9092 形式
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = port
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid(format!("broker 地址 {} 端口非法: {}", s, e)))?;

        Self::new(host, port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl TryFrom<String> for BrokerAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BrokerAddress> for String {
    fn from(address: BrokerAddress) -> Self {
        address.to_string()
    }
}

/// 重试退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 指数退避
    #[default]
    Exponential,
    /// 固定间隔
    Fixed,
}

/// 生产者客户端配置
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// bootstrap broker 列表（去重，保持顺序）
    pub addresses: Vec<BrokerAddress>,
    /// 是否使用 TLS
    pub use_secure_transport: bool,
    /// 元数据最大年龄（默认 15 秒）
    pub metadata_max_age: Duration,
    /// 单次元数据刷新的截止时间（默认 5 秒）
    pub metadata_timeout: Duration,
    /// 建立连接 + 初始元数据的超时时间（默认 10 秒）
    pub connect_timeout: Duration,
    /// 单次 produce 请求超时（默认 30 秒）
    pub request_timeout: Duration,
    /// 未完成记录的上限（默认 10000）
    pub send_queue_capacity: usize,
    /// 失败后的最大重试次数（默认 3）
    pub send_retry_limit: usize,
    /// 初始重试间隔（默认 100ms）
    pub retry_backoff: Duration,
    /// 最大重试间隔（默认 5 秒）
    pub retry_backoff_max: Duration,
    /// 退避策略
    pub retry_strategy: RetryStrategy,
    /// 单个批次的最大记录数（默认 100）
    pub max_batch_records: usize,
    /// 关闭超时时间（默认 5 秒）
    pub close_timeout: Duration,
    /// 客户端标识
    pub client_id: String,
    /// 透传给传输层的额外配置
    pub properties: HashMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            use_secure_transport: false,
            metadata_max_age: Duration::from_secs(15),
            metadata_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            send_queue_capacity: 10_000,
            send_retry_limit: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
            retry_strategy: RetryStrategy::Exponential,
            max_batch_records: 100,
            close_timeout: Duration::from_secs(5),
            client_id: default_client_id(),
            properties: HashMap::new(),
        }
    }
}

impl ProducerConfig {
    /// 创建配置
    ///
    /// # 参数
    /// * `addresses` - bootstrap broker 地址
    /// * `use_secure_transport` - 是否启用 TLS
    pub fn new(addresses: impl IntoIterator<Item = BrokerAddress>, use_secure_transport: bool) -> Self {
        let mut config = Self {
            use_secure_transport,
            ..Self::default()
        };
        for address in addresses {
            if !config.addresses.contains(&address) {
                config.addresses.push(address);
            }
        }
        config
    }

    /// 从 `bootstrap.servers` 形式的字符串创建配置
    pub fn from_bootstrap(bootstrap: &str, use_secure_transport: bool) -> Result<Self, ConfigError> {
        Ok(Self::new(BrokerAddress::parse_list(bootstrap)?, use_secure_transport))
    }

    /// 设置元数据最大年龄
    pub fn with_metadata_max_age(mut self, max_age: Duration) -> Self {
        self.metadata_max_age = max_age;
        self
    }

    /// 设置元数据刷新截止时间
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// 设置连接超时时间
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置 produce 请求超时
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 设置发送队列容量
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// 设置最大重试次数
    pub fn with_send_retry_limit(mut self, limit: usize) -> Self {
        self.send_retry_limit = limit;
        self
    }

    /// 设置重试退避
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.retry_backoff_max = max;
        self
    }

    /// 设置退避策略
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// 设置批次大小
    pub fn with_max_batch_records(mut self, max: usize) -> Self {
        self.max_batch_records = max;
        self
    }

    /// 设置关闭超时时间
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// 设置客户端标识
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// 添加透传给传输层的配置项
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::Invalid("至少需要一个 broker 地址".to_string()));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid("send_queue_capacity 必须大于 0".to_string()));
        }
        if self.max_batch_records == 0 {
            return Err(ConfigError::Invalid("max_batch_records 必须大于 0".to_string()));
        }
        if self.retry_backoff > self.retry_backoff_max {
            return Err(ConfigError::Invalid(
                "retry_backoff 不能大于 retry_backoff_max".to_string(),
            ));
        }
        Ok(())
    }

    /// `bootstrap.servers` 形式的地址串
    pub fn bootstrap_servers(&self) -> String {
        self.addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ProducerFileConfig = toml::from_str(content)?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载配置
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))
            .with_context(|| format!("failed to read producer config {}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid producer config {}", path))
    }
}

/// 配置文件格式（时间字段以毫秒表示）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerFileConfig {
    pub addresses: Vec<BrokerAddress>,
    #[serde(default)]
    pub use_secure_transport: bool,
    #[serde(default = "default_metadata_max_age_ms")]
    pub metadata_max_age_ms: u64,
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_send_retry_limit")]
    pub send_retry_limit: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl From<ProducerFileConfig> for ProducerConfig {
    fn from(file: ProducerFileConfig) -> Self {
        let mut config = ProducerConfig::new(file.addresses, file.use_secure_transport);
        config.metadata_max_age = Duration::from_millis(file.metadata_max_age_ms);
        config.metadata_timeout = Duration::from_millis(file.metadata_timeout_ms);
        config.connect_timeout = Duration::from_millis(file.connect_timeout_ms);
        config.request_timeout = Duration::from_millis(file.request_timeout_ms);
        config.send_queue_capacity = file.send_queue_capacity;
        config.send_retry_limit = file.send_retry_limit;
        config.retry_backoff = Duration::from_millis(file.retry_backoff_ms);
        config.retry_backoff_max = Duration::from_millis(file.retry_backoff_max_ms);
        config.retry_strategy = file.retry_strategy;
        config.max_batch_records = file.max_batch_records;
        config.close_timeout = Duration::from_millis(file.close_timeout_ms);
        config.client_id = file.client_id;
        config.properties = file.properties;
        config
    }
}

fn default_metadata_max_age_ms() -> u64 {
    15_000
}

fn default_metadata_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_send_queue_capacity() -> usize {
    10_000
}

fn default_send_retry_limit() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_max_batch_records() -> usize {
    100
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_client_id() -> String {
    format!("flare-producer-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_pairs() {
        let address: BrokerAddress = "kafka-0.brokers.svc:9092".parse().unwrap();
        assert_eq!(address.host(), "kafka-0.brokers.svc");
        assert_eq!(address.port(), 9092);
        assert_eq!(address.to_string(), "kafka-0.brokers.svc:9092");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let address: BrokerAddress = "[::1]:9093".parse().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:9093");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("localhost".parse::<BrokerAddress>().is_err());
        assert!("localhost:notaport".parse::<BrokerAddress>().is_err());
        assert!(":9092".parse::<BrokerAddress>().is_err());
        assert!("localhost:0".parse::<BrokerAddress>().is_err());
    }

    #[test]
    fn bootstrap_list_is_deduplicated_in_order() {
        let config =
            tokio_test::assert_ok!(ProducerConfig::from_bootstrap("b:9092, a:9092,b:9092", false));
        assert_eq!(config.bootstrap_servers(), "b:9092,a:9092");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ProducerConfig::default();
        assert_eq!(config.metadata_max_age, Duration::from_secs(15));
        assert_eq!(config.send_retry_limit, 3);
        assert_eq!(config.retry_strategy, RetryStrategy::Exponential);
        assert!(config.client_id.starts_with("flare-producer-"));
    }

    #[test]
    fn validate_rejects_empty_addresses_and_zero_capacity() {
        assert!(ProducerConfig::default().validate().is_err());

        let config = ProducerConfig::from_bootstrap("localhost:9092", false)
            .unwrap()
            .with_send_queue_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_toml_with_defaults() {
        let config = tokio_test::assert_ok!(ProducerConfig::from_toml_str(
            r#"
            addresses = ["localhost:9092", "localhost:9093"]
            use_secure_transport = true
            metadata_max_age_ms = 20000
            retry_strategy = "fixed"

            [properties]
            "compression.type" = "lz4"
            "#,
        ));

        assert_eq!(config.addresses.len(), 2);
        assert!(config.use_secure_transport);
        assert_eq!(config.metadata_max_age, Duration::from_secs(20));
        assert_eq!(config.metadata_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_strategy, RetryStrategy::Fixed);
        assert_eq!(config.properties.get("compression.type").map(String::as_str), Some("lz4"));
    }

    #[test]
    fn toml_with_bad_address_is_rejected() {
        let error = tokio_test::assert_err!(ProducerConfig::from_toml_str(r#"addresses = ["no-port"]"#));
        assert!(matches!(error, ConfigError::Parse(_)));
    }
}
