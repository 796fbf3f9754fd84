#![deny(unsafe_code)]

//! `kiln-core` 汇集网络内核各组件共享的基础契约。
//!
//! # 模块定位（Why）
//! - 网络内核（监听器、工作线程、连接、缓冲诊断）需要一个统一的“具名日志器”能力，
//!   但日志系统的初始化、落盘与刷新属于宿主进程职责，不应由内核持有全局状态。
//! - 通过在独立 crate 中定义 [`Logger`] 契约，各组件以构造参数注入日志能力，
//!   宿主可以替换为 `tracing`、内存探针或完全静默的实现。
//!
//! # 设计概要（How）
//! - [`logging`] 模块提供 [`LogSeverity`]、[`LogRecord`] 与 [`Logger`]；
//! - [`TracingLogger`] 是默认实现，将记录桥接到 `tracing` 事件；
//! - [`NoopLogger`] 用于基准与不关心日志的测试场景。

pub mod logging;

pub use logging::{LogRecord, LogSeverity, Logger, NETWORK_LOGGER, NoopLogger, TracingLogger};

#[cfg(any(test, feature = "test-util"))]
pub use logging::MemoryLogger;
