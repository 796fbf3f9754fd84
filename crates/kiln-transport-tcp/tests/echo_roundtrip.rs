//! 端到端回显测试：连接读泵、写队列、延迟关闭与跨线程句柄。
//!
//! # 测试总览（Why）
//! - 处理器只消费完整行，半行必须留在读缓冲中等待下一次读取；
//! - 延迟关闭必须先把已入队的回复发完再发送 FIN；
//! - 业务线程经 [`ConnectionHandle`] 投递的负载由所属工作线程写出。

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use kiln_core::NoopLogger;
use kiln_transport_tcp::{
    Connection, ConnectionHandle, ConnectionHandler, ConnectionInfo, ConnectionManager,
    HandlerFactory,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const DEADLINE: Duration = Duration::from_secs(5);

/// 按行回显；收到 `bye` 时回复后延迟关闭。
struct LineEcho {
    handles: mpsc::Sender<ConnectionHandle>,
}

impl ConnectionHandler for LineEcho {
    fn start(&mut self, conn: &mut Connection) {
        let _ = self.handles.send(conn.handle());
        conn.begin_read();
    }

    fn on_data_received(&mut self, conn: &mut Connection) -> bool {
        let mut consumed_any = false;
        loop {
            let pending = conn.read_buffer().read_slice();
            let Some(end) = pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = pending[..=end].to_vec();
            conn.read_buffer_mut()
                .commit_read(end + 1)
                .expect("行在未读区内");
            consumed_any = true;
            if line.as_slice() == b"bye\n" {
                conn.enqueue_write(b"see you\n".to_vec());
                conn.close_deferred();
                return true;
            }
            conn.enqueue_write(line);
        }
        conn.begin_read();
        consumed_any
    }

    fn on_close(&mut self, _conn: &mut Connection) {}
}

fn start_echo(threads: usize) -> (ConnectionManager, mpsc::Receiver<ConnectionHandle>) {
    let (tx, rx) = mpsc::channel();
    let factory: HandlerFactory = Arc::new(move |_: &ConnectionInfo| {
        Box::new(LineEcho {
            handles: tx.clone(),
        }) as Box<dyn ConnectionHandler>
    });
    let manager = ConnectionManager::with_logger(Arc::new(NoopLogger));
    manager
        .start("127.0.0.1", 0, threads, factory)
        .expect("启动网络");
    (manager, rx)
}

async fn read_exact_within(client: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut reply = vec![0; len];
    timeout(DEADLINE, client.read_exact(&mut reply))
        .await
        .expect("回复应在期限内到达")
        .expect("读取回复");
    reply
}

#[tokio::test(flavor = "multi_thread")]
async fn split_lines_are_reassembled_and_echoed() {
    let (manager, _handles) = start_echo(2);
    let addr = manager.local_addr().expect("本地地址");
    let mut client = TcpStream::connect(addr).await.expect("连接监听地址");

    client.write_all(b"hel").await.expect("发送半行");
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"lo\nwor").await.expect("发送余下部分");
    client.write_all(b"ld\n").await.expect("补齐第二行");

    assert_eq!(read_exact_within(&mut client, 12).await, b"hello\nworld\n");

    tokio::task::spawn_blocking(move || manager.stop())
        .await
        .expect("停机任务完成");
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_close_flushes_reply_before_eof() {
    let (manager, _handles) = start_echo(1);
    let addr = manager.local_addr().expect("本地地址");
    let mut client = TcpStream::connect(addr).await.expect("连接监听地址");

    client.write_all(b"ping\nbye\n").await.expect("发送请求");
    let mut reply = Vec::new();
    timeout(DEADLINE, client.read_to_end(&mut reply))
        .await
        .expect("对端应在期限内关闭")
        .expect("读到 EOF");
    assert_eq!(reply, b"ping\nsee you\n");

    tokio::task::spawn_blocking(move || manager.stop())
        .await
        .expect("停机任务完成");
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_sends_from_another_thread() {
    let (manager, handles) = start_echo(2);
    let addr = manager.local_addr().expect("本地地址");
    let mut client = TcpStream::connect(addr).await.expect("连接监听地址");

    let handle = tokio::task::spawn_blocking(move || handles.recv_timeout(DEADLINE))
        .await
        .expect("等待任务完成")
        .expect("处理器应上报句柄");
    assert!(handle.is_open());

    assert!(handle.send(b"pushed\n".to_vec()));
    assert_eq!(read_exact_within(&mut client, 7).await, b"pushed\n");

    handle.close_deferred();
    let mut rest = Vec::new();
    timeout(DEADLINE, client.read_to_end(&mut rest))
        .await
        .expect("对端应在期限内关闭")
        .expect("读到 EOF");
    assert!(rest.is_empty());
    assert!(handle.is_closed());
    assert!(!handle.send(b"late\n".to_vec()));

    tokio::task::spawn_blocking(move || manager.stop())
        .await
        .expect("停机任务完成");
}
