use std::sync::Arc;

use bytes::Bytes;

use crate::{
    acceptor::PendingConnection,
    connection::{ConnectionId, ConnectionStatus},
    worker::WorkerShared,
};

/// 关闭方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    Immediate,
    /// 写队列排空后关闭。
    Deferred,
}

/// 投递给工作线程的命令，在线程的下一次唤醒或 tick 时按投递顺序执行。
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Admit(PendingConnection),
    Send { slot: u64, payload: Bytes },
    Close { slot: u64, mode: CloseMode },
}

/// 连接的跨线程句柄。
///
/// # 教案式说明
/// - **意图（Why）**：连接的写队列只允许所属工作线程操作；其他线程（业务线程、
///   另一条连接的处理器）需要发送或关闭时，把请求作为命令投递到所属工作线程的队列，
///   与新连接接纳走同一条通道；
/// - **契约（What）**：
///   - 句柄可 `Clone`、可跨线程传递；
///   - `send`/`close`/`close_deferred` 只负责投递，连接在命令执行前已关闭时命令被忽略；
///   - `is_open` 反映连接当前状态，可能在返回后立即变化；
/// - **逻辑（How）**：命令按投递顺序执行，因此先 `send` 后 `close_deferred` 能保证负载先入队。
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    status: Arc<ConnectionStatus>,
    mailbox: Arc<WorkerShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        status: Arc<ConnectionStatus>,
        mailbox: Arc<WorkerShared>,
    ) -> Self {
        Self {
            id,
            status,
            mailbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// 投递一项待发送负载；连接已关闭或负载为空时返回 `false`。
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        let payload = payload.into();
        if payload.is_empty() || self.status.is_closed() {
            return false;
        }
        self.mailbox.post(WorkerCommand::Send {
            slot: self.id.slot,
            payload,
        });
        true
    }

    pub fn close(&self) {
        self.post_close(CloseMode::Immediate);
    }

    pub fn close_deferred(&self) {
        self.post_close(CloseMode::Deferred);
    }

    fn post_close(&self, mode: CloseMode) {
        if self.status.is_closed() {
            return;
        }
        self.mailbox.post(WorkerCommand::Close {
            slot: self.id.slot,
            mode,
        });
    }
}
