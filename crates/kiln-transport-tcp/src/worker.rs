use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use kiln_core::{Logger, NETWORK_LOGGER};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    runtime::{Builder, Runtime},
    sync::Notify,
    task::LocalSet,
    time::{self, MissedTickBehavior},
};

use crate::{
    NetError,
    acceptor::PendingConnection,
    config::{ConnectionSettings, DEFAULT_TICK_INTERVAL_MS},
    connection::{Connection, ConnectionHandler, ConnectionId, ConnectionInfo, ConnectionSlot},
    handle::{CloseMode, WorkerCommand},
    stream::StreamIo,
};

/// 在工作线程上为新连接创建协议处理器的工厂。
pub type HandlerFactory = Arc<dyn Fn(&ConnectionInfo) -> Box<dyn ConnectionHandler> + Send + Sync>;

/// 工作线程与其他线程共享的状态。
///
/// # 契约说明（What）
/// - `commands` 是唯一的跨线程交接点，由互斥锁保护；
/// - `connections` 由接受线程读取做负载均衡、由工作线程写入，必须原子更新；
/// - `wakeup` 在投递命令或请求停止时通知事件循环。
pub(crate) struct WorkerShared {
    index: usize,
    connections: AtomicUsize,
    commands: Mutex<Vec<WorkerCommand>>,
    stopped: AtomicBool,
    running: AtomicBool,
    wakeup: Notify,
}

impl WorkerShared {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    pub(crate) fn post(&self, command: WorkerCommand) {
        self.commands.lock().push(command);
        self.wakeup.notify_one();
    }

    /// 投递新连接并立即计入连接数，使随后的负载均衡决策能看到它。
    pub(crate) fn add_socket(&self, pending: PendingConnection) {
        self.connections.fetch_add(1, Ordering::AcqRel);
        self.post(WorkerCommand::Admit(pending));
    }

    pub(crate) fn take_commands(&self) -> Vec<WorkerCommand> {
        core::mem::take(&mut *self.commands.lock())
    }

    pub(crate) fn release_connection(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 丢弃尚未执行的命令，撤销其中未接纳连接的计数。
    fn discard_pending(&self) {
        for command in self.take_commands() {
            if let WorkerCommand::Admit(pending) = command {
                drop(pending);
                self.release_connection();
            }
        }
    }
}

impl fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerShared")
            .field("index", &self.index)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

/// 只读的工作线程观测视图，可跨线程持有。
#[derive(Clone, Debug)]
pub struct WorkerMonitor {
    shared: Arc<WorkerShared>,
}

impl WorkerMonitor {
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub(crate) fn add_socket(&self, pending: PendingConnection) {
        self.shared.add_socket(pending);
    }
}

/// `WorkerLoop` 在一个系统线程上运行单线程事件循环，持有一组连接。
///
/// # 设计背景（Why）
/// - 连接一旦接纳只在一个线程上被访问，连接内部字段因此无需任何同步；
/// - 接受线程与工作线程之间只通过命令队列交接套接字所有权，
///   工作线程在本地表中以槽位号管理连接，从不跨线程共享连接本身。
///
/// # 逻辑解析（How）
/// - 事件循环同时等待周期 tick（默认 10ms）与命令唤醒：
///   - 唤醒时执行命令：接纳新连接、跨线程发送与关闭；
///   - tick 时先执行命令，再对每个连接调用 `update`，移除返回 `false` 的连接；
/// - 每个连接由一个本地任务驱动：等待可读/可写/状态变化，再把事件交给连接状态机；
/// - 停止时关闭全部连接并逐一触发 `on_removed`，随后线程退出。
///
/// # 契约说明（What）
/// - `add_socket` 可在任意线程调用；连接数在投递时即加一，移除时减一；
/// - 到达时已关闭的连接直接触发移除回调并减少计数；
/// - `stop` 是协作式的：事件循环在下一次唤醒时退出，`Drop` 会等待线程结束。
pub struct WorkerLoop {
    shared: Arc<WorkerShared>,
    factory: HandlerFactory,
    settings: ConnectionSettings,
    tick_interval: Duration,
    logger: Arc<dyn Logger>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerLoop {
    pub fn new(
        index: usize,
        factory: HandlerFactory,
        settings: ConnectionSettings,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared::new(index)),
            factory,
            settings,
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            logger,
            thread: None,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn monitor(&self) -> WorkerMonitor {
        WorkerMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 启动事件循环线程。
    pub fn start(&mut self) -> Result<(), NetError> {
        if self.thread.is_some() {
            return Err(NetError::AlreadyStarted);
        }
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|source| NetError::Runtime { source })?;

        self.shared.stopped.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        let name = format!("kiln-worker-{}", self.shared.index);
        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let settings = self.settings;
        let logger = Arc::clone(&self.logger);
        let tick_interval = self.tick_interval;
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // 连接表只在工作线程上创建与访问。
                let state = WorkerState {
                    shared,
                    factory,
                    settings,
                    logger,
                    slots: BTreeMap::new(),
                    next_slot: 0,
                };
                run(runtime, state, tick_interval);
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.running.store(false, Ordering::Release);
                Err(NetError::ThreadSpawn { name, source })
            }
        }
    }

    /// 投递新连接，可在任意线程调用。
    pub fn add_socket(&self, pending: PendingConnection) {
        self.shared.add_socket(pending);
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    /// 等待事件循环线程退出。
    ///
    /// 在事件循环线程自身上调用时（例如处理器内部停机）不做 join：
    /// 停止标志已置位，处理器返回后循环自行退出。
    pub fn wait(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                self.logger.error(
                    NETWORK_LOGGER,
                    format_args!("worker {} panicked", self.shared.index),
                );
            }
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.discard_pending();
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
            self.wait();
        }
    }
}

impl fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("shared", &self.shared)
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

fn run(runtime: Runtime, mut state: WorkerState, tick_interval: Duration) {
    let index = state.shared.index;
    let logger = Arc::clone(&state.logger);
    logger.info(NETWORK_LOGGER, format_args!("worker {index} started"));

    let local = LocalSet::new();
    local.block_on(&runtime, async {
        let mut ticker = time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shared = Arc::clone(&state.shared);
        loop {
            tokio::select! {
                _ = shared.wakeup.notified() => state.process_commands(),
                _ = ticker.tick() => state.tick(),
            }
            if shared.is_stopped() {
                break;
            }
        }
        state.shutdown();
    });
    drop(local);

    state.shared.running.store(false, Ordering::Release);
    logger.info(NETWORK_LOGGER, format_args!("worker {index} stopped"));
}

type SharedSlot = Rc<RefCell<ConnectionSlot>>;

/// 仅在工作线程上存在的状态：活跃连接表与接纳参数。
struct WorkerState {
    shared: Arc<WorkerShared>,
    factory: HandlerFactory,
    settings: ConnectionSettings,
    logger: Arc<dyn Logger>,
    slots: BTreeMap<u64, SharedSlot>,
    next_slot: u64,
}

impl WorkerState {
    fn tick(&mut self) {
        self.process_commands();

        let mut finished = Vec::new();
        for (slot, entry) in &self.slots {
            if !entry.borrow_mut().update() {
                finished.push(*slot);
            }
        }
        for slot in finished {
            if let Some(entry) = self.slots.remove(&slot) {
                entry.borrow_mut().remove();
                self.shared.release_connection();
            }
        }
    }

    fn process_commands(&mut self) {
        for command in self.shared.take_commands() {
            match command {
                WorkerCommand::Admit(pending) => self.admit(pending),
                WorkerCommand::Send { slot, payload } => {
                    if let Some(entry) = self.slots.get(&slot) {
                        entry.borrow_mut().enqueue(payload);
                    }
                }
                WorkerCommand::Close { slot, mode } => {
                    if let Some(entry) = self.slots.get(&slot) {
                        let mut entry = entry.borrow_mut();
                        match mode {
                            CloseMode::Immediate => entry.close(),
                            CloseMode::Deferred => entry.close_deferred(),
                        }
                    }
                }
            }
        }
    }

    fn admit(&mut self, pending: PendingConnection) {
        let PendingConnection {
            stream,
            peer_addr,
            local_addr,
        } = pending;
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => Rc::new(stream),
            Err(err) => {
                self.logger.warn(
                    NETWORK_LOGGER,
                    format_args!(
                        "worker {} failed to register connection from {peer_addr}: {err}",
                        self.shared.index
                    ),
                );
                self.shared.release_connection();
                return;
            }
        };

        let id = ConnectionId {
            worker: self.shared.index,
            slot: self.next_slot,
        };
        self.next_slot += 1;
        let info = ConnectionInfo {
            id,
            peer_addr,
            local_addr,
        };
        let wake = Rc::new(Notify::new());
        let mut conn = Connection::new(
            info,
            Rc::clone(&stream) as Rc<dyn StreamIo>,
            &self.settings,
            Rc::clone(&wake),
            Arc::clone(&self.shared),
            Arc::clone(&self.logger),
        );
        conn.set_no_delay(self.settings.no_delay);

        let handler = (self.factory)(&info);
        let mut slot = ConnectionSlot::new(conn, handler);
        slot.start();
        if slot.conn.is_closed() {
            slot.remove();
            self.shared.release_connection();
            return;
        }

        let slot = Rc::new(RefCell::new(slot));
        self.slots.insert(id.slot, Rc::clone(&slot));
        tokio::task::spawn_local(drive_connection(slot, stream, wake));
    }

    fn shutdown(&mut self) {
        for (_, entry) in core::mem::take(&mut self.slots) {
            entry.borrow_mut().remove();
            self.shared.release_connection();
        }
        self.shared.discard_pending();
    }
}

/// 单个连接的驱动任务：等待就绪事件并交给状态机，连接关闭后退出。
async fn drive_connection(slot: SharedSlot, stream: Rc<TcpStream>, wake: Rc<Notify>) {
    loop {
        let interest = {
            let mut entry = slot.borrow_mut();
            entry.flush();
            if entry.conn.is_closed() {
                return;
            }
            entry.conn.interest()
        };

        tokio::select! {
            ready = stream.readable(), if interest.read => {
                let mut entry = slot.borrow_mut();
                match ready {
                    Ok(()) => entry.on_readable(),
                    Err(_) => entry.close(),
                }
            }
            ready = stream.writable(), if interest.write => {
                let mut entry = slot.borrow_mut();
                match ready {
                    Ok(()) => entry.on_writable(),
                    Err(_) => entry.close(),
                }
            }
            _ = wake.notified() => {}
        }
    }
}
