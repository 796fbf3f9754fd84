use std::{
    collections::VecDeque,
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use kiln_buffer::{RawBuffer, WireBuffer};
use kiln_core::{Logger, NETWORK_LOGGER};
use tokio::sync::Notify;

use crate::{
    ConnectionHandle, NetError,
    config::{ConnectionLimits, ConnectionSettings},
    stream::StreamIo,
    worker::WorkerShared,
};

/// 连接在整个网络子系统中的唯一标识：所属工作线程下标与线程内槽位号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub worker: usize,
    pub slot: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.worker, self.slot)
    }
}

/// 接纳时捕获的连接元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// 连接生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// 已请求延迟关闭，写队列排空后进入 `Closed`。
    Closing,
    Closed,
}

/// 连接状态标志，由连接与其跨线程句柄共享。
///
/// `closed` 以 `swap` 守卫关闭流程，保证关闭只执行一次。
#[derive(Debug, Default)]
pub(crate) struct ConnectionStatus {
    closed: AtomicBool,
    closing: AtomicBool,
}

impl ConnectionStatus {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.is_closed() && !self.is_closing()
    }
}

/// 连接级累计统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// `on_data_received` 报告消费了完整消息的次数。
    pub messages_received: u64,
}

/// 写队列中的一项：待发送负载与已发送偏移。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPacket {
    payload: Bytes,
    offset: usize,
}

impl OutboundPacket {
    pub fn new(payload: Bytes) -> Self {
        Self { payload, offset: 0 }
    }

    /// 尚未发送的部分。
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.offset..]
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for OutboundPacket {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

impl From<Vec<u8>> for OutboundPacket {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(Bytes::from(payload))
    }
}

impl From<&'static [u8]> for OutboundPacket {
    fn from(payload: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(payload))
    }
}

impl From<WireBuffer> for OutboundPacket {
    fn from(buffer: WireBuffer) -> Self {
        Self::new(buffer.finish())
    }
}

/// [`Connection::enqueue_write`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// 连接已关闭，负载被丢弃。
    Closed,
    /// 写队列超过上限，连接已被关闭。
    Rejected,
    /// 空负载不入队。
    Empty,
}

/// 驱动任务需要等待的就绪事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

/// `Connection` 是单个已接受字节流的状态机。
///
/// # 设计背景（Why）
/// - 每个连接被接纳后只归属一个工作线程，读泵、写队列与周期 tick 都在该线程上串行执行，
///   因此内部字段无需同步；
/// - 关闭可能与 I/O 完成在同一线程交错发生，而跨线程句柄也需要观察状态，
///   所以 `closed`/`closing` 使用原子标志。
///
/// # 逻辑解析（How）
/// - 读泵：[`begin_read`](Self::begin_read) 登记一次读取；流可读时先压缩读缓冲、
///   确保有空位，再读取并提交字节，随后回调协议层的 `on_data_received`；
///   读取是一次性的，协议层在消费后再次调用 `begin_read` 继续接收；
/// - 写队列：[`enqueue_write`](Self::enqueue_write) 入队后唤醒驱动任务；排空时部分写入保留队首并等待
///   可写通知，完整写入出队；处于 `Closing` 且队列排空时执行关闭；
/// - 关闭：[`close`](Self::close) 幂等，半关闭写方向并登记一次 `on_close` 回调，
///   由持有协议处理器的槽位在当前回调返回后派发。
///
/// # 契约说明（What）
/// - 状态迁移：`Open → Closing → Closed`，或任意读写错误/立即关闭时 `Open → Closed`；
/// - 读写错误只关闭当前连接，不会向上传播；
/// - `enqueue_write` 只能在所属工作线程调用，跨线程发送请使用 [`ConnectionHandle`]。
pub struct Connection {
    info: ConnectionInfo,
    stream: Rc<dyn StreamIo>,
    read_buffer: RawBuffer,
    write_queue: VecDeque<OutboundPacket>,
    queued_bytes: usize,
    is_writing: bool,
    read_armed: bool,
    close_pending: bool,
    status: Arc<ConnectionStatus>,
    limits: ConnectionLimits,
    stats: ConnectionStats,
    wake: Rc<Notify>,
    mailbox: Arc<WorkerShared>,
    logger: Arc<dyn Logger>,
}

impl Connection {
    pub(crate) fn new(
        info: ConnectionInfo,
        stream: Rc<dyn StreamIo>,
        settings: &ConnectionSettings,
        wake: Rc<Notify>,
        mailbox: Arc<WorkerShared>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            info,
            stream,
            read_buffer: RawBuffer::with_capacity(settings.read_buffer_capacity),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            is_writing: false,
            read_armed: false,
            close_pending: false,
            status: Arc::new(ConnectionStatus::default()),
            limits: settings.limits,
            stats: ConnectionStats::default(),
            wake,
            mailbox,
            logger,
        }
    }

    /// 构造不隶属任何工作线程的连接，供协议处理器的单元测试或自定义驱动使用。
    ///
    /// 地址均为 `0.0.0.0:0`；通过 [`handle`](Self::handle) 发出的命令不会被任何线程处理。
    pub fn detached(
        stream: Rc<dyn StreamIo>,
        settings: &ConnectionSettings,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let info = ConnectionInfo {
            id: ConnectionId { worker: 0, slot: 0 },
            peer_addr: unspecified,
            local_addr: unspecified,
        };
        Self::new(
            info,
            stream,
            settings,
            Rc::new(Notify::new()),
            Arc::new(WorkerShared::new(0)),
            logger,
        )
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// 可以跨线程持有的句柄。
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(
            self.info.id,
            Arc::clone(&self.status),
            Arc::clone(&self.mailbox),
        )
    }

    pub fn read_buffer(&self) -> &RawBuffer {
        &self.read_buffer
    }

    /// 协议层通过 `commit_read` 标记已消费的字节，未消费部分留待下一次读取。
    pub fn read_buffer_mut(&mut self) -> &mut RawBuffer {
        &mut self.read_buffer
    }

    pub fn state(&self) -> ConnectionState {
        if self.status.is_closed() {
            ConnectionState::Closed
        } else if self.status.is_closing() {
            ConnectionState::Closing
        } else {
            ConnectionState::Open
        }
    }

    /// 仅在 `Open` 状态为真。
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// 当前写队列中尚未发送的字节数。
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// 逐项查看写队列中尚未发送的部分。
    pub fn pending_writes(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.write_queue.iter().map(OutboundPacket::remaining)
    }

    /// 设置 `TCP_NODELAY`，失败只记录日志。
    pub fn set_no_delay(&mut self, enabled: bool) {
        if let Err(source) = self.stream.set_no_delay(enabled) {
            let err = NetError::Configure { source };
            self.logger.debug(
                NETWORK_LOGGER,
                format_args!(
                    "[{}] connection {} ({}) set_no_delay({enabled}): {err}",
                    err.code(),
                    self.info.id,
                    self.info.peer_addr
                ),
            );
        }
    }

    /// 登记一次异步读取。
    ///
    /// 连接不处于 `Open` 时忽略。
    pub fn begin_read(&mut self) {
        if !self.is_open() {
            return;
        }
        self.read_armed = true;
        self.wake.notify_one();
    }

    /// 追加一项待发送负载。
    pub fn enqueue_write(&mut self, packet: impl Into<OutboundPacket>) -> EnqueueOutcome {
        let packet = packet.into();
        if self.is_closed() {
            return EnqueueOutcome::Closed;
        }
        if packet.is_empty() {
            return EnqueueOutcome::Empty;
        }
        if let Some(limit) = self.limits.max_write_queue
            && self.queued_bytes + packet.len() > limit
        {
            self.logger.warn(
                NETWORK_LOGGER,
                format_args!(
                    "connection {} ({}) write queue would reach {} bytes (limit {limit}), disconnecting",
                    self.info.id,
                    self.info.peer_addr,
                    self.queued_bytes + packet.len()
                ),
            );
            self.close();
            return EnqueueOutcome::Rejected;
        }
        self.queued_bytes += packet.len();
        self.write_queue.push_back(packet);
        self.wake.notify_one();
        EnqueueOutcome::Queued
    }

    /// 立即关闭：半关闭写方向并登记 `on_close` 回调。
    ///
    /// 只有首次调用返回 `true`。
    pub fn close(&mut self) -> bool {
        if self.status.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.read_armed = false;
        if let Err(source) = self.stream.shutdown_write() {
            let err = NetError::Shutdown { source };
            self.logger.debug(
                NETWORK_LOGGER,
                format_args!(
                    "[{}] connection {} ({}) close: {err}",
                    err.code(),
                    self.info.id,
                    self.info.peer_addr
                ),
            );
        }
        self.close_pending = true;
        self.wake.notify_one();
        true
    }

    /// 延迟关闭：写队列排空后再关闭。
    pub fn close_deferred(&mut self) {
        if self.is_closed() {
            return;
        }
        self.status.closing.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub(crate) fn interest(&self) -> Interest {
        Interest {
            read: self.read_armed && self.is_open(),
            write: self.is_writing && !self.is_closed(),
        }
    }

    pub(crate) fn take_close_pending(&mut self) -> bool {
        core::mem::take(&mut self.close_pending)
    }

    /// 流可读时执行一次读取；返回是否有新字节提交到读缓冲。
    pub(crate) fn pump_read(&mut self) -> bool {
        if !self.read_armed || !self.is_open() {
            return false;
        }
        self.read_buffer.compact();
        if let Err(err) = self.grow_read_buffer() {
            self.logger.warn(
                NETWORK_LOGGER,
                format_args!(
                    "connection {} ({}) read buffer limit reached, disconnecting: {err}",
                    self.info.id, self.info.peer_addr
                ),
            );
            self.close();
            return false;
        }
        match self.stream.try_read(self.read_buffer.write_slice()) {
            Ok(0) => {
                self.logger.debug(
                    NETWORK_LOGGER,
                    format_args!(
                        "connection {} ({}) closed by peer",
                        self.info.id, self.info.peer_addr
                    ),
                );
                self.close();
                false
            }
            Ok(n) => {
                if self.read_buffer.commit_write(n).is_err() {
                    self.close();
                    return false;
                }
                self.read_armed = false;
                self.stats.bytes_read += n as u64;
                true
            }
            Err(err) if is_transient(&err) => false,
            Err(source) => {
                self.report_io_failure(NetError::Read { source });
                self.close();
                false
            }
        }
    }

    fn grow_read_buffer(&mut self) -> kiln_buffer::Result<()> {
        match self.limits.max_read_buffer {
            Some(limit) => self.read_buffer.ensure_free_space_within(limit),
            None => {
                self.read_buffer.ensure_free_space();
                Ok(())
            }
        }
    }

    /// 排空写队列，直到出现部分写入或队列为空。
    pub(crate) fn drain_writes(&mut self) {
        if self.is_writing || self.is_closed() {
            return;
        }
        while let Some(front) = self.write_queue.front_mut() {
            let remaining = front.payload.len() - front.offset;
            match self.stream.try_write(&front.payload[front.offset..]) {
                Ok(0) => {
                    let source = io::Error::from(io::ErrorKind::WriteZero);
                    self.report_io_failure(NetError::Write { source });
                    self.close();
                    return;
                }
                Ok(n) => {
                    self.stats.bytes_written += n as u64;
                    self.queued_bytes -= n;
                    if n < remaining {
                        front.offset += n;
                        self.is_writing = true;
                        return;
                    }
                    self.write_queue.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.is_writing = true;
                    return;
                }
                Err(source) => {
                    self.report_io_failure(NetError::Write { source });
                    self.close();
                    return;
                }
            }
        }
        if self.status.is_closing() {
            self.close();
        }
    }

    /// 流重新可写：清除写入中标志并继续排空。
    pub(crate) fn on_writable(&mut self) {
        self.is_writing = false;
        self.drain_writes();
    }

    /// 周期 tick 的基础检查：已关闭返回 `false`，否则在需要时推进写队列。
    pub(crate) fn base_update(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.is_writing || (self.write_queue.is_empty() && !self.status.is_closing()) {
            return true;
        }
        self.drain_writes();
        true
    }

    fn report_io_failure(&self, err: NetError) {
        self.logger.debug(
            NETWORK_LOGGER,
            format_args!(
                "[{}] connection {} ({}): {err}",
                err.code(),
                self.info.id,
                self.info.peer_addr
            ),
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("state", &self.state())
            .field("queued_bytes", &self.queued_bytes)
            .field("is_writing", &self.is_writing)
            .field("stats", &self.stats)
            .finish()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// 协议层接入点。
///
/// # 教案式说明
/// - **意图（Why）**：具体协议（握手、心跳、业务消息）通过实现该 trait 挂接到连接状态机，
///   工作线程只持有 `Box<dyn ConnectionHandler>`，无需为每种协议特化容器；
/// - **契约（What）**：
///   - `start`：接纳后调用一次，通常在此调用 [`Connection::begin_read`] 或发送问候；
///   - `on_data_received`：读缓冲中有新提交的字节时调用，返回是否消费了一条完整消息；
///     未消费的字节必须留在读缓冲中；
///   - `on_close`：连接关闭后恰好调用一次；
///   - `update`：每个周期 tick 调用，返回 `false` 表示该连接可以移除；
///   - `on_removed`：连接从工作线程移除时调用；
/// - **前置条件**：所有回调都在所属工作线程上执行，处理器本身无需 `Send`。
pub trait ConnectionHandler: 'static {
    fn start(&mut self, conn: &mut Connection);

    fn on_data_received(&mut self, conn: &mut Connection) -> bool;

    fn on_close(&mut self, conn: &mut Connection);

    fn update(&mut self, conn: &mut Connection) -> bool {
        let _ = conn;
        true
    }

    fn on_removed(&mut self, conn: &Connection) {
        let _ = conn;
    }
}

/// 连接与其协议处理器的组合，工作线程以此为单位调度。
///
/// 每个入口在返回前派发待处理的 `on_close`，保证回调不会在处理器自身的回调中重入。
pub(crate) struct ConnectionSlot {
    pub(crate) conn: Connection,
    pub(crate) handler: Box<dyn ConnectionHandler>,
}

impl ConnectionSlot {
    pub(crate) fn new(conn: Connection, handler: Box<dyn ConnectionHandler>) -> Self {
        Self { conn, handler }
    }

    pub(crate) fn start(&mut self) {
        self.handler.start(&mut self.conn);
        self.dispatch_close();
    }

    pub(crate) fn on_readable(&mut self) {
        if self.conn.pump_read() && self.handler.on_data_received(&mut self.conn) {
            self.conn.stats.messages_received += 1;
        }
        self.dispatch_close();
    }

    pub(crate) fn on_writable(&mut self) {
        self.conn.on_writable();
        self.dispatch_close();
    }

    /// 驱动任务每轮等待前调用：未处于写入中时推进写队列。
    pub(crate) fn flush(&mut self) {
        self.conn.drain_writes();
        self.dispatch_close();
    }

    pub(crate) fn update(&mut self) -> bool {
        let keep = self.conn.base_update() && self.handler.update(&mut self.conn);
        self.dispatch_close();
        keep
    }

    pub(crate) fn enqueue(&mut self, payload: Bytes) {
        self.conn.enqueue_write(payload);
        self.dispatch_close();
    }

    pub(crate) fn close(&mut self) {
        self.conn.close();
        self.dispatch_close();
    }

    pub(crate) fn close_deferred(&mut self) {
        self.conn.close_deferred();
        self.dispatch_close();
    }

    /// 移除前的收尾：仍未关闭则关闭，然后通知处理器。
    pub(crate) fn remove(&mut self) {
        if !self.conn.is_closed() {
            self.conn.close();
        }
        self.dispatch_close();
        self.handler.on_removed(&self.conn);
    }

    fn dispatch_close(&mut self) {
        if self.conn.take_close_pending() {
            self.handler.on_close(&mut self.conn);
        }
    }
}
