#![deny(unsafe_code)]
#![doc = r#"
# kiln-transport-tcp

## 设计动机（Why）
- **定位**：网络内核的 TCP 部分，负责监听、把连接分片到工作线程、
  以及每个连接的读泵、写队列与关闭状态机。
- **架构角色**：协议层只实现 [`ConnectionHandler`]，其余线程编排由
  [`ConnectionManager`] 完成；缓冲与线格式来自 `kiln-buffer`，日志能力来自 `kiln-core`。

## 核心契约（What）
- 每个工作线程运行一个单线程事件循环，连接接纳后只在该线程上被访问；
- 跨线程交互只有两条通道：接受线程投递新连接，以及 [`ConnectionHandle`]
  投递发送/关闭命令，二者共用工作线程的命令队列；
- 新连接放置到当前连接数最少的工作线程，并列时取下标最小者；
- 读写错误只关闭受影响的连接，接受错误不会终止接受循环，绑定错误只中止本次 `start`。

## 实现策略（How）
- 工作线程与接受线程各自持有一个 Tokio current-thread 运行时；
  工作线程通过 `LocalSet` 以本地任务驱动每个连接，事件循环同时等待命令唤醒与周期 tick；
- 监听套接字经 `socket2` 创建以设置 `SO_REUSEADDR` 与 backlog；
- 连接状态机依赖 [`StreamIo`] 抽象，可脱离真实套接字测试。

## 风险与考量（Trade-offs）
- 写队列默认无上限，需要背压时通过 [`NetworkConfig::max_write_queue`] 设置断开阈值；
- 周期 tick 固定间隔运行，连接数很大时 `update` 遍历成本随连接数线性增长。
"#]

mod acceptor;
mod config;
mod connection;
mod error;
mod handle;
mod manager;
mod stream;
mod worker;

pub use acceptor::{Acceptor, FixedSlot, PendingConnection, PlacementPolicy};
pub use config::{ConnectionLimits, ConnectionSettings, DEFAULT_TICK_INTERVAL_MS, NetworkConfig};
pub use connection::{
    Connection, ConnectionHandler, ConnectionId, ConnectionInfo, ConnectionState, ConnectionStats,
    EnqueueOutcome, OutboundPacket,
};
pub use error::{ErrorCategory, NetError};
pub use handle::{CloseMode, ConnectionHandle};
pub use manager::{ConnectionManager, LeastLoaded, StopHandle, select_least_loaded};
pub use stream::{StreamIo, resolve_endpoint};
pub use worker::{HandlerFactory, WorkerLoop, WorkerMonitor};
