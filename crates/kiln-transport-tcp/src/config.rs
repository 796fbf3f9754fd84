use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NetError;

/// 默认的工作线程周期 tick（毫秒）。
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// 网络子系统配置。
///
/// # 教案式说明
/// - **意图（Why）**：宿主通常以 TOML 片段描述监听地址与线程数，
///   同一结构也承载连接级的缓冲上限，避免在代码里散落魔法数；
/// - **契约（What）**：
///   - `bind_addr`/`port`：监听地址，`bind_addr` 可以是主机名；
///   - `thread_count`：工作线程数，必须大于 0；
///   - `tick_interval_ms`：工作线程周期 tick，默认 10ms，必须大于 0；
///   - `read_buffer_capacity`：每个连接读缓冲的初始容量，默认 1024；
///   - `no_delay`：是否对新连接开启 `TCP_NODELAY`，默认开启；
///   - `max_read_buffer`/`max_write_queue`：可选上限，超出时断开该连接；
/// - **逻辑（How）**：缺省字段按上述默认值补齐，未知字段直接报错，防止拼写错误被静默忽略。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub bind_addr: String,
    pub port: u16,
    pub thread_count: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_read_buffer_capacity")]
    pub read_buffer_capacity: usize,
    #[serde(default = "default_no_delay")]
    pub no_delay: bool,
    #[serde(default)]
    pub max_read_buffer: Option<usize>,
    #[serde(default)]
    pub max_write_queue: Option<usize>,
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_read_buffer_capacity() -> usize {
    kiln_buffer::DEFAULT_RAW_CAPACITY
}

fn default_no_delay() -> bool {
    true
}

impl NetworkConfig {
    pub fn new(bind_addr: impl Into<String>, port: u16, thread_count: usize) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            thread_count,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            read_buffer_capacity: kiln_buffer::DEFAULT_RAW_CAPACITY,
            no_delay: true,
            max_read_buffer: None,
            max_write_queue: None,
        }
    }

    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, NetError> {
        let config: Self = toml::from_str(text).map_err(|err| NetError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.thread_count == 0 {
            return Err(NetError::InvalidThreadCount);
        }
        if self.tick_interval_ms == 0 {
            return Err(NetError::Config {
                detail: "tick_interval_ms must be greater than zero".into(),
            });
        }
        if self.read_buffer_capacity == 0 {
            return Err(NetError::Config {
                detail: "read_buffer_capacity must be greater than zero".into(),
            });
        }
        if let Some(limit) = self.max_read_buffer
            && limit < self.read_buffer_capacity
        {
            return Err(NetError::Config {
                detail: format!(
                    "max_read_buffer ({limit}) is smaller than read_buffer_capacity ({})",
                    self.read_buffer_capacity
                ),
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            read_buffer_capacity: self.read_buffer_capacity,
            no_delay: self.no_delay,
            limits: ConnectionLimits {
                max_read_buffer: self.max_read_buffer,
                max_write_queue: self.max_write_queue,
            },
        }
    }
}

/// 单个连接的资源上限，`None` 表示不设限。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_read_buffer: Option<usize>,
    pub max_write_queue: Option<usize>,
}

/// 工作线程接纳连接时使用的参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub read_buffer_capacity: usize,
    pub no_delay: bool,
    pub limits: ConnectionLimits,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_buffer_capacity: kiln_buffer::DEFAULT_RAW_CAPACITY,
            no_delay: true,
            limits: ConnectionLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = NetworkConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1"
            port = 8085
            thread_count = 2
            "#,
        )
        .expect("最小配置应当合法");
        assert_eq!(config, NetworkConfig::new("127.0.0.1", 8085, 2));
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
    }

    #[test]
    fn limits_are_parsed() {
        let config = NetworkConfig::from_toml_str(
            r#"
            bind_addr = "0.0.0.0"
            port = 0
            thread_count = 1
            no_delay = false
            max_read_buffer = 65536
            max_write_queue = 1048576
            "#,
        )
        .expect("合法配置");
        let settings = config.connection_settings();
        assert!(!settings.no_delay);
        assert_eq!(settings.limits.max_read_buffer, Some(65536));
        assert_eq!(settings.limits.max_write_queue, Some(1048576));
    }

    #[test]
    fn zero_threads_are_rejected() {
        let err = NetworkConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1"
            port = 1
            thread_count = 0
            "#,
        )
        .expect_err("线程数为 0");
        assert!(matches!(err, NetError::InvalidThreadCount));
    }

    #[test]
    fn unknown_fields_and_bad_values_are_config_errors() {
        let err = NetworkConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1"
            port = 1
            thread_count = 1
            threads = 4
            "#,
        )
        .expect_err("未知字段");
        assert_eq!(err.code(), "kiln.network.invalid_config");

        let mut config = NetworkConfig::new("127.0.0.1", 1, 1);
        config.tick_interval_ms = 0;
        assert!(matches!(config.validate(), Err(NetError::Config { .. })));
        config.tick_interval_ms = 10;
        config.max_read_buffer = Some(16);
        assert!(matches!(config.validate(), Err(NetError::Config { .. })));
    }
}
