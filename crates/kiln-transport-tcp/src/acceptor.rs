use std::{
    fmt, io,
    net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use kiln_core::{Logger, NETWORK_LOGGER};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, runtime::Builder, sync::Notify};

use crate::NetError;

/// 接受失败后重新等待前的退避时间，避免在文件描述符耗尽等持续错误上空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// 已接受、尚未交给工作线程的连接。
///
/// 套接字保持非阻塞模式，由接纳它的工作线程注册到自己的事件循环。
#[derive(Debug)]
pub struct PendingConnection {
    pub(crate) stream: StdTcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
}

impl PendingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// 决定新连接交给哪个工作线程的放置策略。
///
/// # 契约说明（What）
/// - `place` 在接受线程上调用，返回目标工作线程下标；
/// - 越界下标由调用方回退到 0 号工作线程。
pub trait PlacementPolicy: Send + Sync {
    fn place(&self) -> usize;
}

/// 固定放置到同一个工作线程，`Acceptor` 的默认策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedSlot(pub usize);

impl PlacementPolicy for FixedSlot {
    fn place(&self) -> usize {
        self.0
    }
}

struct AcceptorShared {
    closed: AtomicBool,
    wakeup: Notify,
}

/// 监听套接字与接受循环。
///
/// # 教案式说明
/// - **意图（Why）**：接受线程只负责“接受并交接”，从不在交接后触碰连接；
///   负载均衡决策抽成 [`PlacementPolicy`]，由上层注入；
/// - **逻辑（How）**：
///   - `bind` 通过 `socket2` 创建套接字，Unix 下开启 `SO_REUSEADDR`，
///     以平台允许的最大 backlog 监听；
///   - `start` 在独立线程上运行单线程运行时，循环等待新连接或关闭通知；
///     接受成功时询问放置策略并调用分发闭包，失败时记录日志、短暂退避后继续；
/// - **契约（What）**：
///   - 绑定失败以 [`NetError::Bind`] 返回，进程不受影响；
///   - 接受错误不会终止循环，只有 `close` 会；
///   - `close` 幂等，`Drop` 会关闭并等待接受线程退出。
pub struct Acceptor {
    listener: Option<StdTcpListener>,
    local_addr: SocketAddr,
    placement: Arc<dyn PlacementPolicy>,
    shared: Arc<AcceptorShared>,
    logger: Arc<dyn Logger>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// 绑定并开始监听，但尚未接受连接。
    pub fn bind(addr: SocketAddr, logger: Arc<dyn Logger>) -> Result<Self, NetError> {
        let bind_error = |source| NetError::Bind { addr, source };
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        #[cfg(unix)]
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&addr.into()).map_err(bind_error)?;
        // 内核会把超出上限的 backlog 截断为平台最大值。
        socket.listen(i32::MAX).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let listener: StdTcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(bind_error)?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
            placement: Arc::new(FixedSlot::default()),
            shared: Arc::new(AcceptorShared {
                closed: AtomicBool::new(false),
                wakeup: Notify::new(),
            }),
            logger,
            thread: None,
        })
    }

    /// 实际绑定的地址；以端口 0 绑定时用于获取系统分配的端口。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_placement(&mut self, placement: Arc<dyn PlacementPolicy>) {
        self.placement = placement;
    }

    /// 启动接受线程，`dispatch` 接收放置下标与待交接连接。
    pub fn start<F>(&mut self, dispatch: F) -> Result<(), NetError>
    where
        F: Fn(usize, PendingConnection) + Send + 'static,
    {
        let Some(listener) = self.listener.take() else {
            return Err(NetError::AlreadyStarted);
        };
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|source| NetError::Runtime { source })?;

        let shared = Arc::clone(&self.shared);
        let placement = Arc::clone(&self.placement);
        let logger = Arc::clone(&self.logger);
        let name = "kiln-acceptor".to_owned();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(accept_loop(listener, shared, placement, logger, dispatch));
            })
            .map_err(|source| NetError::ThreadSpawn { name, source })?;
        self.thread = Some(handle);
        Ok(())
    }

    /// 停止接受新连接；重复调用无副作用。
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.wakeup.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// 等待接受线程退出。
    pub fn wait(&mut self) {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            self.logger
                .error(NETWORK_LOGGER, format_args!("acceptor thread panicked"));
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
        self.wait();
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("started", &self.thread.is_some())
            .finish()
    }
}

/// 接受循环的连接来源；测试可以替换为脚本化的来源以注入错误。
trait IncomingStreams {
    async fn next_pending(&mut self) -> io::Result<PendingConnection>;
}

impl IncomingStreams for TcpListener {
    async fn next_pending(&mut self) -> io::Result<PendingConnection> {
        let (stream, peer_addr) = self.accept().await?;
        let local_addr = stream.local_addr()?;
        Ok(PendingConnection {
            stream: stream.into_std()?,
            peer_addr,
            local_addr,
        })
    }
}

async fn accept_loop<F>(
    listener: StdTcpListener,
    shared: Arc<AcceptorShared>,
    placement: Arc<dyn PlacementPolicy>,
    logger: Arc<dyn Logger>,
    dispatch: F,
) where
    F: Fn(usize, PendingConnection),
{
    match TcpListener::from_std(listener) {
        Ok(listener) => serve(listener, &shared, &*placement, &*logger, &dispatch).await,
        Err(source) => report_accept_error(&*logger, NetError::Accept { source }),
    }
}

async fn serve<S, F>(
    mut incoming: S,
    shared: &AcceptorShared,
    placement: &dyn PlacementPolicy,
    logger: &dyn Logger,
    dispatch: &F,
) where
    S: IncomingStreams,
    F: Fn(usize, PendingConnection),
{
    while !shared.closed.load(Ordering::Acquire) {
        tokio::select! {
            _ = shared.wakeup.notified() => {}
            accepted = incoming.next_pending() => match accepted {
                Ok(pending) => {
                    if shared.closed.load(Ordering::Acquire) {
                        break;
                    }
                    dispatch(placement.place(), pending);
                }
                Err(source) => {
                    report_accept_error(logger, NetError::Accept { source });
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

fn report_accept_error(logger: &dyn Logger, err: NetError) {
    logger.warn(
        NETWORK_LOGGER,
        format_args!("[{}] {err}", err.code()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{LogSeverity, MemoryLogger, NoopLogger};
    use std::{
        cell::RefCell,
        collections::VecDeque,
        net::Ipv4Addr,
        sync::mpsc,
        time::Instant,
    };

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    /// 先依次返回预置的错误，之后委托给真实监听器。
    struct Flaky {
        failures: VecDeque<io::ErrorKind>,
        listener: TcpListener,
    }

    impl IncomingStreams for Flaky {
        async fn next_pending(&mut self) -> io::Result<PendingConnection> {
            if let Some(kind) = self.failures.pop_front() {
                return Err(kind.into());
            }
            self.listener.next_pending().await
        }
    }

    #[test]
    fn accepted_streams_are_dispatched_to_placement_slot() {
        let mut acceptor = Acceptor::bind(loopback(), Arc::new(NoopLogger)).expect("绑定回环地址");
        acceptor.set_placement(Arc::new(FixedSlot(2)));
        let (tx, rx) = mpsc::channel();
        acceptor
            .start(move |slot, pending: PendingConnection| {
                let _ = tx.send((slot, pending.peer_addr()));
            })
            .expect("启动接受线程");

        let client = StdTcpStream::connect(acceptor.local_addr()).expect("连接监听地址");
        let (slot, peer) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("应收到交接的连接");
        assert_eq!(slot, 2);
        assert_eq!(peer, client.local_addr().expect("客户端地址"));

        acceptor.close();
        acceptor.close();
        acceptor.wait();
        assert!(acceptor.is_closed());
    }

    #[test]
    fn second_start_is_rejected() {
        let mut acceptor = Acceptor::bind(loopback(), Arc::new(NoopLogger)).expect("绑定回环地址");
        acceptor.start(|_, _| {}).expect("首次启动");
        assert!(matches!(
            acceptor.start(|_, _| {}),
            Err(NetError::AlreadyStarted)
        ));
    }

    #[test]
    fn bind_conflict_reports_bind_error() {
        let first = Acceptor::bind(loopback(), Arc::new(NoopLogger)).expect("绑定回环地址");
        let taken = first.local_addr();
        let err = Acceptor::bind(taken, Arc::new(NoopLogger)).expect_err("端口已被占用");
        assert!(matches!(err, NetError::Bind { addr, .. } if addr == taken));
    }

    #[test]
    fn accept_errors_are_logged_as_warnings() {
        let logger = MemoryLogger::default();
        report_accept_error(
            &logger,
            NetError::Accept {
                source: std::io::Error::from(std::io::ErrorKind::ConnectionAborted),
            },
        );
        assert!(logger.contains(LogSeverity::Warn, "kiln.transport.tcp.accept_failed"));
    }

    #[test]
    fn accept_loop_rearms_after_errors() {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .expect("构建运行时");
        let listener = StdTcpListener::bind(loopback()).expect("绑定回环地址");
        listener.set_nonblocking(true).expect("切换为非阻塞");
        let addr = listener.local_addr().expect("监听地址");
        let _client = StdTcpStream::connect(addr).expect("连接监听地址");

        let shared = Arc::new(AcceptorShared {
            closed: AtomicBool::new(false),
            wakeup: Notify::new(),
        });
        let logger = MemoryLogger::default();
        let slots = RefCell::new(Vec::new());
        let dispatch = |slot: usize, _pending: PendingConnection| {
            slots.borrow_mut().push(slot);
            shared.closed.store(true, Ordering::Release);
        };

        runtime.block_on(async {
            let incoming = Flaky {
                failures: VecDeque::from([
                    io::ErrorKind::ConnectionAborted,
                    io::ErrorKind::Interrupted,
                ]),
                listener: TcpListener::from_std(listener).expect("注册监听器"),
            };
            serve(incoming, &shared, &FixedSlot(1), &logger, &dispatch).await;
        });

        assert_eq!(slots.into_inner(), vec![1]);
        let warnings = logger
            .entries()
            .into_iter()
            .filter(|(_, severity, _)| *severity == LogSeverity::Warn)
            .count();
        assert_eq!(warnings, 2);
    }

    #[test]
    fn close_interrupts_pending_accept() {
        let mut acceptor = Acceptor::bind(loopback(), Arc::new(NoopLogger)).expect("绑定回环地址");
        let addr = acceptor.local_addr();
        let (tx, rx) = mpsc::channel();
        acceptor
            .start(move |_, pending: PendingConnection| {
                let _ = tx.send(pending.peer_addr());
            })
            .expect("启动接受线程");
        thread::sleep(Duration::from_millis(20));

        let begun = Instant::now();
        acceptor.close();
        acceptor.wait();
        assert!(begun.elapsed() < Duration::from_secs(1));

        // 线程退出后分发闭包与监听套接字一并释放。
        assert!(rx.recv().is_err());
        assert!(StdTcpStream::connect(addr).is_err());
    }
}
