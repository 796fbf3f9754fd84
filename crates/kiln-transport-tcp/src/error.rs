//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总监听、工作线程、连接读写与配置加载的失败语义；
//! - 传输错误只影响单个连接或单次 `start` 调用，从不终止进程，
//!   因此需要稳定错误码与分类，供日志检索与运维告警使用。
//!
//! ## 设计要求（What）
//! - 每个底层操作对应一个 [`OperationKind`]，携带稳定错误码与默认文案；
//! - [`NetError::category`] 区分传输、生命周期与配置三类问题。

use std::{io, net::SocketAddr};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "kiln.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "kiln.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "kiln.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "kiln.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "kiln.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "kiln.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 错误大类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 绑定、接受、读写、半关闭与套接字选项失败。
    Transport,
    /// 线程、运行时与启动/停止顺序相关的失败。
    Lifecycle,
    /// 配置内容或地址解析失败。
    Configuration,
}

/// 网络子系统错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：为 `start` 调用方提供可区分的失败原因，同时为连接内部的
///   读写失败提供统一的日志文本；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`；携带 `io::Error` 的变体通过
///   `source()` 暴露底层原因；`code()` 返回稳定错误码；
/// - **执行逻辑 (How)**：`Bind` 额外携带目标地址，便于定位端口冲突。
#[derive(Debug, Error)]
pub enum NetError {
    /// 监听地址绑定失败，仅中止本次 `start`。
    #[error("{}: {addr}: {source}", BIND.message)]
    Bind { addr: SocketAddr, source: io::Error },

    /// 接受新连接失败；接受循环会退避后继续。
    #[error("{}: {source}", ACCEPT.message)]
    Accept { source: io::Error },

    /// 连接读取失败，该连接随即关闭。
    #[error("{}: {source}", READ.message)]
    Read { source: io::Error },

    /// 连接写入失败，该连接随即关闭。
    #[error("{}: {source}", WRITE.message)]
    Write { source: io::Error },

    /// 写方向半关闭失败，仅记录日志。
    #[error("{}: {source}", SHUTDOWN.message)]
    Shutdown { source: io::Error },

    /// 套接字选项设置失败，仅记录日志。
    #[error("{}: {source}", CONFIGURE.message)]
    Configure { source: io::Error },

    /// 工作线程数量为 0。
    #[error("thread count must be greater than zero")]
    InvalidThreadCount,

    /// 重复启动。
    #[error("network is already started")]
    AlreadyStarted,

    /// 在未启动的网络上查询运行期信息。
    #[error("network is not started")]
    NotStarted,

    /// 创建系统线程失败。
    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn { name: String, source: io::Error },

    /// 构建事件循环运行时失败。
    #[error("failed to build event loop runtime: {source}")]
    Runtime { source: io::Error },

    /// 配置内容非法。
    #[error("invalid network configuration: {detail}")]
    Config { detail: String },

    /// 主机名与端口无法解析为可绑定地址。
    #[error("failed to resolve endpoint `{target}`")]
    Resolve { target: String },
}

impl NetError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            NetError::Bind { .. } => BIND.code,
            NetError::Accept { .. } => ACCEPT.code,
            NetError::Read { .. } => READ.code,
            NetError::Write { .. } => WRITE.code,
            NetError::Shutdown { .. } => SHUTDOWN.code,
            NetError::Configure { .. } => CONFIGURE.code,
            NetError::InvalidThreadCount => "kiln.network.invalid_thread_count",
            NetError::AlreadyStarted => "kiln.network.already_started",
            NetError::NotStarted => "kiln.network.not_started",
            NetError::ThreadSpawn { .. } => "kiln.network.thread_spawn_failed",
            NetError::Runtime { .. } => "kiln.network.runtime_failed",
            NetError::Config { .. } => "kiln.network.invalid_config",
            NetError::Resolve { .. } => "kiln.network.resolve_failed",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::Bind { .. }
            | NetError::Accept { .. }
            | NetError::Read { .. }
            | NetError::Write { .. }
            | NetError::Shutdown { .. }
            | NetError::Configure { .. } => ErrorCategory::Transport,
            NetError::InvalidThreadCount | NetError::Config { .. } | NetError::Resolve { .. } => {
                ErrorCategory::Configuration
            }
            NetError::AlreadyStarted
            | NetError::NotStarted
            | NetError::ThreadSpawn { .. }
            | NetError::Runtime { .. } => ErrorCategory::Lifecycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn bind_error_keeps_address_and_source() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().expect("合法地址");
        let err = NetError::Bind {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.code(), "kiln.transport.tcp.bind_failed");
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(err.to_string().starts_with("tcp bind: 127.0.0.1:7000"));
        assert!(err.source().is_some());
    }

    #[test]
    fn lifecycle_and_config_categories() {
        assert_eq!(NetError::AlreadyStarted.category(), ErrorCategory::Lifecycle);
        assert_eq!(
            NetError::InvalidThreadCount.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            NetError::Resolve {
                target: "nowhere:1".into()
            }
            .code(),
            "kiln.network.resolve_failed"
        );
    }
}
