//! `kiln-examples`：在网络内核之上搭建的最小协议示例。
//!
//! - [`frame`]：`u16` 长度前缀帧，帧体用 `WireBuffer` 编解码；
//! - [`EchoHandler`]：回显协议的 [`ConnectionHandler`](kiln_transport_tcp::ConnectionHandler) 实现；
//! - `echo_server` 二进制负责加载 TOML 配置、安装 tracing Subscriber 并运行服务。

pub mod echo;
pub mod frame;

pub use echo::EchoHandler;
pub use frame::{Frame, decode_frame, encode_frame};
