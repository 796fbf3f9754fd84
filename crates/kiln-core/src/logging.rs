use core::fmt;
use std::sync::Arc;

/// 网络内核默认使用的日志器名称。
pub const NETWORK_LOGGER: &str = "network";

/// `tracing` 事件统一使用的 target，具名日志器名称以结构化字段 `logger` 附带。
const TRACING_TARGET: &str = "kiln";

/// 日志级别。
///
/// # 契约说明（What）
/// - 级别按严重程度递增排序，`Critical` 表示进程级不可恢复事件；
/// - 与 `tracing::Level` 的映射中 `Critical` 折叠为 `ERROR` 并附带 `critical = true` 字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogSeverity {
    /// 返回级别的小写名称，便于在文本输出中展示。
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Trace => "trace",
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条日志记录。
///
/// # 设计背景（Why）
/// - 以借用形式携带日志器名称与格式化参数，调用路径上不产生任何分配；
/// - 只有真正需要落地的实现（例如 [`MemoryLogger`]）才会把消息物化为 `String`。
///
/// # 契约说明（What）
/// - `logger`：具名日志器，例如 [`NETWORK_LOGGER`]；
/// - `severity`：日志级别；
/// - `message`：延迟格式化的消息体，生命周期覆盖 [`Logger::log`] 调用过程。
#[derive(Clone, Copy, Debug)]
pub struct LogRecord<'a> {
    pub logger: &'a str,
    pub severity: LogSeverity,
    pub message: fmt::Arguments<'a>,
}

impl<'a> LogRecord<'a> {
    pub fn new(logger: &'a str, severity: LogSeverity, message: fmt::Arguments<'a>) -> Self {
        Self {
            logger,
            severity,
            message,
        }
    }
}

/// 具名日志器能力契约。
///
/// # 设计背景（Why）
/// - 网络内核只“消费”日志能力：在绑定失败、接受失败、关闭失败等路径输出诊断，
///   并在输出昂贵的缓冲转储前通过 [`Logger::should_log`] 快速判定是否值得格式化；
/// - 日志器以 `Arc<dyn Logger>` 形式在构造时注入，初始化与关闭由宿主进程负责。
///
/// # 逻辑解析（How）
/// - `log` 与 `should_log` 为必需方法；
/// - `trace`/`debug`/`info`/`warn`/`error`/`critical` 为便捷方法，统一构造 [`LogRecord`] 后调用 `log`。
///
/// # 契约说明（What）
/// - **前置条件**：实现必须线程安全，多个工作线程会并发调用；
/// - **后置条件**：`log` 不得阻塞调用线程过久，工作线程的事件循环依赖其快速返回。
pub trait Logger: Send + Sync + 'static {
    /// 提交一条日志记录。
    fn log(&self, record: &LogRecord<'_>);

    /// 判断指定日志器在给定级别下是否会输出。
    fn should_log(&self, logger: &str, severity: LogSeverity) -> bool;

    fn trace(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Trace, message));
    }

    fn debug(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Debug, message));
    }

    fn info(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Info, message));
    }

    fn warn(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Warn, message));
    }

    fn error(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Error, message));
    }

    fn critical(&self, logger: &str, message: fmt::Arguments<'_>) {
        self.log(&LogRecord::new(logger, LogSeverity::Critical, message));
    }
}

/// 将日志记录桥接到 `tracing` 的默认实现。
///
/// # 教案式说明
/// - **意图（Why）**：宿主通常已经通过 `tracing-subscriber` 安装了全局 Subscriber，
///   内核日志直接进入同一条管线即可复用过滤、格式化与导出配置；
/// - **逻辑（How）**：所有事件使用固定 target `kiln`，具名日志器名称写入 `logger` 字段；
///   `should_log` 借助 `tracing::enabled!` 询问当前 Subscriber；
/// - **契约（What）**：未安装 Subscriber 时 `should_log` 恒为 `false`，`log` 静默丢弃。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    /// 以 `Arc<dyn Logger>` 形式返回默认日志器，便于直接注入组件。
    pub fn shared() -> Arc<dyn Logger> {
        Arc::new(TracingLogger)
    }
}

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let logger = record.logger;
        let message = record.message;
        match record.severity {
            LogSeverity::Trace => {
                tracing::trace!(target: TRACING_TARGET, logger, "{}", message)
            }
            LogSeverity::Debug => {
                tracing::debug!(target: TRACING_TARGET, logger, "{}", message)
            }
            LogSeverity::Info => {
                tracing::info!(target: TRACING_TARGET, logger, "{}", message)
            }
            LogSeverity::Warn => {
                tracing::warn!(target: TRACING_TARGET, logger, "{}", message)
            }
            LogSeverity::Error => {
                tracing::error!(target: TRACING_TARGET, logger, "{}", message)
            }
            LogSeverity::Critical => {
                tracing::error!(target: TRACING_TARGET, logger, critical = true, "{}", message)
            }
        }
    }

    fn should_log(&self, _logger: &str, severity: LogSeverity) -> bool {
        match severity {
            LogSeverity::Trace => tracing::enabled!(target: TRACING_TARGET, tracing::Level::TRACE),
            LogSeverity::Debug => tracing::enabled!(target: TRACING_TARGET, tracing::Level::DEBUG),
            LogSeverity::Info => tracing::enabled!(target: TRACING_TARGET, tracing::Level::INFO),
            LogSeverity::Warn => tracing::enabled!(target: TRACING_TARGET, tracing::Level::WARN),
            LogSeverity::Error | LogSeverity::Critical => {
                tracing::enabled!(target: TRACING_TARGET, tracing::Level::ERROR)
            }
        }
    }
}

/// 丢弃全部日志的实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _record: &LogRecord<'_>) {}

    fn should_log(&self, _logger: &str, _severity: LogSeverity) -> bool {
        false
    }
}

/// 测试用内存日志器：记录每条日志的日志器名称、级别与物化后的消息。
///
/// - `threshold` 以下的级别既不记录也不会让 `should_log` 返回 `true`；
/// - `entries` 返回快照，`take` 清空并返回全部记录。
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct MemoryLogger {
    threshold: LogSeverity,
    entries: parking_lot::Mutex<Vec<(String, LogSeverity, String)>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryLogger {
    pub fn new(threshold: LogSeverity) -> Self {
        Self {
            threshold,
            entries: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<(String, LogSeverity, String)> {
        self.entries.lock().clone()
    }

    pub fn take(&self) -> Vec<(String, LogSeverity, String)> {
        core::mem::take(&mut *self.entries.lock())
    }

    /// 判断是否存在指定级别且包含给定片段的记录。
    pub fn contains(&self, severity: LogSeverity, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(_, level, message)| *level == severity && message.contains(needle))
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for MemoryLogger {
    fn default() -> Self {
        Self::new(LogSeverity::Trace)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Logger for MemoryLogger {
    fn log(&self, record: &LogRecord<'_>) {
        if record.severity < self.threshold {
            return;
        }
        self.entries.lock().push((
            record.logger.to_owned(),
            record.severity,
            record.message.to_string(),
        ));
    }

    fn should_log(&self, _logger: &str, severity: LogSeverity) -> bool {
        severity >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn severity_orders_by_importance() {
        assert!(LogSeverity::Trace < LogSeverity::Debug);
        assert!(LogSeverity::Warn < LogSeverity::Error);
        assert!(LogSeverity::Error < LogSeverity::Critical);
        assert_eq!(LogSeverity::Warn.to_string(), "warn");
    }

    #[test]
    fn memory_logger_respects_threshold() {
        let logger = MemoryLogger::new(LogSeverity::Info);
        logger.debug(NETWORK_LOGGER, format_args!("dropped {}", 1));
        logger.warn(NETWORK_LOGGER, format_args!("kept {}", 2));

        assert!(!logger.should_log(NETWORK_LOGGER, LogSeverity::Debug));
        assert!(logger.should_log(NETWORK_LOGGER, LogSeverity::Error));
        let entries = logger.take();
        assert_eq!(
            entries,
            vec![(
                NETWORK_LOGGER.to_owned(),
                LogSeverity::Warn,
                "kept 2".to_owned()
            )]
        );
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn noop_logger_never_logs() {
        let logger = NoopLogger;
        logger.error(NETWORK_LOGGER, format_args!("ignored"));
        assert!(!logger.should_log(NETWORK_LOGGER, LogSeverity::Critical));
    }

    #[traced_test]
    #[test]
    fn tracing_logger_forwards_records() {
        let logger = TracingLogger::shared();
        assert!(logger.should_log(NETWORK_LOGGER, LogSeverity::Trace));
        logger.info(NETWORK_LOGGER, format_args!("worker {} started", 3));
        logger.critical(NETWORK_LOGGER, format_args!("acceptor lost"));

        assert!(logs_contain("worker 3 started"));
        assert!(logs_contain("acceptor lost"));
        assert!(logs_contain("critical=true"));
    }
}
