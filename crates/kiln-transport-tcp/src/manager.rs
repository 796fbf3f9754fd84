use std::{
    fmt, mem,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use kiln_core::{Logger, NETWORK_LOGGER, TracingLogger};
use parking_lot::Mutex;

use crate::{
    NetError,
    acceptor::{Acceptor, PendingConnection, PlacementPolicy},
    config::NetworkConfig,
    stream::resolve_endpoint,
    worker::{HandlerFactory, WorkerLoop, WorkerMonitor},
};

/// 线性扫描连接数，返回最少者的下标；并列时取下标最小者，空序列返回 0。
pub fn select_least_loaded<I>(counts: I) -> usize
where
    I: IntoIterator<Item = usize>,
{
    let mut best = 0;
    let mut best_count = usize::MAX;
    for (index, count) in counts.into_iter().enumerate() {
        if count < best_count {
            best = index;
            best_count = count;
        }
    }
    best
}

/// 按各工作线程当前连接数选择目标的放置策略。
#[derive(Clone, Debug)]
pub struct LeastLoaded {
    workers: Vec<WorkerMonitor>,
}

impl LeastLoaded {
    pub fn new(workers: Vec<WorkerMonitor>) -> Self {
        Self { workers }
    }
}

impl PlacementPolicy for LeastLoaded {
    fn place(&self) -> usize {
        select_least_loaded(self.workers.iter().map(WorkerMonitor::connection_count))
    }
}

/// 网络子系统的组装入口：一个接受线程加若干工作线程。
///
/// # 教案式说明
/// - **意图（Why）**：宿主只需给出监听地址、线程数与处理器工厂，
///   其余的线程编排、负载均衡与有序停机由管理器负责；
/// - **逻辑（How）**：
///   - `start` 先校验参数并绑定监听地址，绑定失败直接返回且不创建任何线程；
///   - 随后启动全部工作线程，再以 [`LeastLoaded`] 策略启动接受线程；
///   - `stop` 先关闭接受线程，再逐个停止并等待工作线程；
/// - **契约（What）**：
///   - 同一时刻只能运行一次，重复 `start` 返回 [`NetError::AlreadyStarted`]；
///   - `stop` 之后可以再次 `start`；
///   - `Drop` 等价于 `stop`。
pub struct ConnectionManager {
    inner: Arc<Mutex<Running>>,
    logger: Arc<dyn Logger>,
}

#[derive(Default)]
struct Running {
    acceptor: Option<Acceptor>,
    workers: Vec<WorkerLoop>,
}

impl Running {
    fn is_running(&self) -> bool {
        self.acceptor.is_some()
    }

    /// 取出运行中的线程，交给调用方在锁外停止。
    fn take(&mut self) -> Option<Stopping> {
        let acceptor = self.acceptor.take()?;
        Some(Stopping {
            acceptor,
            workers: mem::take(&mut self.workers),
        })
    }
}

/// 已从管理器摘下、等待停机的线程组。
struct Stopping {
    acceptor: Acceptor,
    workers: Vec<WorkerLoop>,
}

impl Stopping {
    fn finish(mut self) {
        self.acceptor.close();
        self.acceptor.wait();
        stop_workers(&mut self.workers);
    }
}

/// join 期间不持有管理器的锁，处理器内部的停机请求因此不会与外部 `stop` 互相等待。
fn shut_down(inner: &Mutex<Running>, logger: &dyn Logger) {
    let stopping = inner.lock().take();
    if let Some(stopping) = stopping {
        stopping.finish();
        logger.info(NETWORK_LOGGER, format_args!("network stopped"));
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_logger(TracingLogger::shared())
    }

    pub fn with_logger(logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Running::default())),
            logger,
        }
    }

    /// 以默认连接参数启动。
    pub fn start(
        &self,
        bind_addr: &str,
        port: u16,
        thread_count: usize,
        factory: HandlerFactory,
    ) -> Result<(), NetError> {
        self.start_with_config(&NetworkConfig::new(bind_addr, port, thread_count), factory)
    }

    pub fn start_with_config(
        &self,
        config: &NetworkConfig,
        factory: HandlerFactory,
    ) -> Result<(), NetError> {
        config.validate()?;
        let mut running = self.inner.lock();
        if running.is_running() {
            return Err(NetError::AlreadyStarted);
        }

        let addr = resolve_endpoint(&config.bind_addr, config.port)?;
        let mut acceptor = match Acceptor::bind(addr, Arc::clone(&self.logger)) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                self.logger.error(
                    NETWORK_LOGGER,
                    format_args!("[{}] {err}", err.code()),
                );
                return Err(err);
            }
        };

        let settings = config.connection_settings();
        let mut workers = Vec::with_capacity(config.thread_count);
        for index in 0..config.thread_count {
            let mut worker = WorkerLoop::new(
                index,
                Arc::clone(&factory),
                settings,
                Arc::clone(&self.logger),
            )
            .with_tick_interval(config.tick_interval());
            if let Err(err) = worker.start() {
                stop_workers(&mut workers);
                return Err(err);
            }
            workers.push(worker);
        }

        let monitors: Vec<WorkerMonitor> = workers.iter().map(WorkerLoop::monitor).collect();
        acceptor.set_placement(Arc::new(LeastLoaded::new(monitors.clone())));
        let dispatch = move |index: usize, pending: PendingConnection| {
            if let Some(worker) = monitors.get(index).or_else(|| monitors.first()) {
                worker.add_socket(pending);
            }
        };
        if let Err(err) = acceptor.start(dispatch) {
            stop_workers(&mut workers);
            return Err(err);
        }

        self.logger.info(
            NETWORK_LOGGER,
            format_args!(
                "network started on {} with {} worker threads",
                acceptor.local_addr(),
                workers.len()
            ),
        );
        running.acceptor = Some(acceptor);
        running.workers = workers;
        Ok(())
    }

    /// 停止接受新连接，关闭全部连接并等待所有线程退出。
    ///
    /// 并发的多次调用中只有一次执行停机，其余立即返回。
    pub fn stop(&self) {
        shut_down(&self.inner, &*self.logger);
    }

    /// 阻塞直到网络被停止（例如通过 [`StopHandle`]）。
    ///
    /// 调用线程不持有锁，其他线程可以随时 `stop`。
    pub fn wait(&self) {
        let monitors = self.monitors();
        while self.is_running() && monitors.iter().any(WorkerMonitor::is_running) {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// 各工作线程当前的连接数，按线程下标排列。
    pub fn connection_counts(&self) -> Vec<usize> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(WorkerLoop::connection_count)
            .collect()
    }

    /// 下一条连接将被放置到的工作线程下标。
    pub fn least_loaded_thread(&self) -> usize {
        select_least_loaded(self.connection_counts())
    }

    /// 可在 `stop` 之后继续持有的工作线程观测视图。
    pub fn monitors(&self) -> Vec<WorkerMonitor> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(WorkerLoop::monitor)
            .collect()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner
            .lock()
            .acceptor
            .as_ref()
            .map(Acceptor::local_addr)
            .ok_or(NetError::NotStarted)
    }

    /// 返回可跨线程使用的停止句柄。
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            inner: Arc::downgrade(&self.inner),
            logger: Arc::clone(&self.logger),
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("running", &self.is_running())
            .field("connection_counts", &self.connection_counts())
            .finish()
    }
}

/// 从任意线程停止 [`ConnectionManager`] 的句柄，例如信号处理线程。
///
/// 管理器已销毁时 `stop` 不做任何事。也可以在处理器回调里调用：
/// 当前工作线程不会被 join，回调返回后它随其余线程一起退出。
#[derive(Clone)]
pub struct StopHandle {
    inner: Weak<Mutex<Running>>,
    logger: Arc<dyn Logger>,
}

impl StopHandle {
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            shut_down(&inner, &*self.logger);
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

fn stop_workers(workers: &mut Vec<WorkerLoop>) {
    for worker in workers.iter() {
        worker.stop();
    }
    for worker in workers.iter_mut() {
        worker.wait();
    }
    workers.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionHandler, ConnectionInfo};
    use kiln_core::NoopLogger;
    use std::{
        net::TcpStream,
        thread,
        time::{Duration, Instant},
    };
    use tracing_test::traced_test;

    struct Idle;

    impl ConnectionHandler for Idle {
        fn start(&mut self, conn: &mut Connection) {
            conn.begin_read();
        }

        fn on_data_received(&mut self, _conn: &mut Connection) -> bool {
            false
        }

        fn on_close(&mut self, _conn: &mut Connection) {}
    }

    /// 接纳连接时经停止句柄停掉整个网络。
    struct StopOnAdmit {
        handle: Arc<Mutex<Option<StopHandle>>>,
    }

    impl ConnectionHandler for StopOnAdmit {
        fn start(&mut self, conn: &mut Connection) {
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                handle.stop();
            }
            conn.begin_read();
        }

        fn on_data_received(&mut self, _conn: &mut Connection) -> bool {
            false
        }

        fn on_close(&mut self, _conn: &mut Connection) {}
    }

    fn idle_factory() -> HandlerFactory {
        Arc::new(|_: &ConnectionInfo| Box::new(Idle) as Box<dyn ConnectionHandler>)
    }

    #[test]
    fn least_loaded_picks_smallest_count() {
        assert_eq!(select_least_loaded([3, 1, 2]), 1);
    }

    #[test]
    fn least_loaded_breaks_ties_by_lowest_index() {
        assert_eq!(select_least_loaded([2, 0, 0, 1]), 1);
        assert_eq!(select_least_loaded([4, 4, 4]), 0);
        assert_eq!(select_least_loaded(Vec::new()), 0);
    }

    #[test]
    fn zero_threads_is_rejected_before_binding() {
        let manager = ConnectionManager::with_logger(Arc::new(NoopLogger));
        let err = manager
            .start("127.0.0.1", 0, 0, idle_factory())
            .expect_err("线程数为 0 必须失败");
        assert!(matches!(err, NetError::InvalidThreadCount));
        assert!(!manager.is_running());
        assert!(matches!(manager.local_addr(), Err(NetError::NotStarted)));
    }

    #[test]
    fn restart_after_stop_and_double_start() {
        let manager = ConnectionManager::with_logger(Arc::new(NoopLogger));
        manager
            .start("127.0.0.1", 0, 2, idle_factory())
            .expect("首次启动");
        assert_eq!(manager.thread_count(), 2);
        assert!(matches!(
            manager.start("127.0.0.1", 0, 2, idle_factory()),
            Err(NetError::AlreadyStarted)
        ));

        manager.stop();
        manager.stop();
        assert_eq!(manager.thread_count(), 0);

        manager
            .start("127.0.0.1", 0, 1, idle_factory())
            .expect("停止后可再次启动");
        assert_eq!(manager.connection_counts(), vec![0]);
    }

    #[test]
    fn stop_handle_outlives_manager() {
        let manager = ConnectionManager::with_logger(Arc::new(NoopLogger));
        manager
            .start("127.0.0.1", 0, 1, idle_factory())
            .expect("启动");
        let handle = manager.stop_handle();
        handle.stop();
        assert!(!manager.is_running());
        drop(manager);
        handle.stop();
    }

    #[test]
    fn stop_from_handler_does_not_join_own_worker() {
        let slot: Arc<Mutex<Option<StopHandle>>> = Arc::new(Mutex::new(None));
        let factory_slot = Arc::clone(&slot);
        let factory: HandlerFactory = Arc::new(move |_: &ConnectionInfo| {
            Box::new(StopOnAdmit {
                handle: Arc::clone(&factory_slot),
            }) as Box<dyn ConnectionHandler>
        });
        let manager = ConnectionManager::with_logger(Arc::new(NoopLogger));
        manager.start("127.0.0.1", 0, 2, factory).expect("启动");
        let monitors = manager.monitors();
        *slot.lock() = Some(manager.stop_handle());

        let addr = manager.local_addr().expect("本地地址");
        let _client = TcpStream::connect(addr).expect("连接监听地址");

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.is_running() || monitors.iter().any(WorkerMonitor::is_running) {
            assert!(Instant::now() < deadline, "处理器内停机后全部线程应退出");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.thread_count(), 0);
    }

    #[traced_test]
    #[test]
    fn default_logger_reports_lifecycle_through_tracing() {
        let manager = ConnectionManager::new();
        manager
            .start("127.0.0.1", 0, 2, idle_factory())
            .expect("启动");
        assert!(logs_contain("with 2 worker threads"));

        manager.stop();
        assert!(logs_contain("network stopped"));
    }
}
