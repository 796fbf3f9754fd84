use std::{
    io,
    net::{Shutdown, SocketAddr, ToSocketAddrs},
};

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::NetError;

/// 连接状态机依赖的非阻塞字节流原语。
///
/// # 教案式说明
/// - **意图（Why）**：连接的读泵与写队列只需要“尝试读/尝试写/半关闭/设置选项”四个动作，
///   抽成 trait 后状态机可以脱离真实套接字做确定性测试；
/// - **契约（What）**：
///   - `try_read`/`try_write` 不阻塞，暂无数据或缓冲区满时返回 `WouldBlock`；
///   - `try_read` 返回 `Ok(0)` 表示对端已关闭写方向；
///   - `shutdown_write` 发送 FIN，允许对端读完已发送的数据；
/// - **前置条件**：实现只在所属工作线程上调用，无需 `Send`。
pub trait StreamIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown_write(&self) -> io::Result<()>;

    fn set_no_delay(&self, enabled: bool) -> io::Result<()>;
}

impl StreamIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        SockRef::from(self).shutdown(Shutdown::Write)
    }

    fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.set_nodelay(enabled)
    }
}

/// 将主机名与端口解析为第一个可用的套接字地址。
pub fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let target = || format!("{host}:{port}");
    (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve { target: target() })?
        .next()
        .ok_or_else(|| NetError::Resolve { target: target() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_addresses() {
        let addr = resolve_endpoint("127.0.0.1", 9000).expect("字面量地址可解析");
        assert_eq!(addr, "127.0.0.1:9000".parse().expect("合法地址"));
    }

    #[test]
    fn invalid_host_is_a_resolve_error() {
        let err = resolve_endpoint("not a host name", 1).expect_err("非法主机名");
        assert!(matches!(err, NetError::Resolve { ref target } if target == "not a host name:1"));
    }
}
