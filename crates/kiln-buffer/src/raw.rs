use crate::{BufferError, Result};

/// 新连接读缓冲的默认容量。
pub const DEFAULT_RAW_CAPACITY: usize = 1024;

/// `RawBuffer` 是单个连接的入站字节暂存区。
///
/// # 设计背景（Why）
/// - 套接字读取需要一块“保证有空位”的连续内存；协议层按消息粒度消费，
///   未消费完的半包必须原地保留到下一次读取；
/// - 以读游标 `r` 与写游标 `w` 描述有效区间 `[r, w)`，避免每次消费都搬移数据。
///
/// # 逻辑解析（How）
/// - 读泵每轮先调用 [`compact`](Self::compact) 把未读数据挪回开头，
///   再调用 [`ensure_free_space`](Self::ensure_free_space) 确保尾部至少有一个字节空位；
/// - 扩容按 1.5 倍进行，只增不减。
///
/// # 契约说明（What）
/// - 不变式：`0 <= r <= w <= capacity`；
/// - 推进游标时越界会返回 [`BufferError::OutOfRange`]，游标保持不变。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawBuffer {
    storage: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl RawBuffer {
    /// 以默认容量创建缓冲。
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RAW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            rpos: 0,
            wpos: 0,
        }
    }

    /// 下一段入站数据可以落入的空闲区域。
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.wpos..]
    }

    /// 写游标之后剩余的字节数。
    pub fn remaining_space(&self) -> usize {
        self.storage.len() - self.wpos
    }

    /// 提交 `n` 个已写入 [`write_slice`](Self::write_slice) 的字节。
    pub fn commit_write(&mut self, n: usize) -> Result<()> {
        if n > self.remaining_space() {
            return Err(BufferError::out_of_range(self.wpos, n, self.storage.len()));
        }
        self.wpos += n;
        Ok(())
    }

    /// 尚未消费的字节。
    pub fn read_slice(&self) -> &[u8] {
        &self.storage[self.rpos..self.wpos]
    }

    pub fn active_size(&self) -> usize {
        self.wpos - self.rpos
    }

    pub fn is_empty(&self) -> bool {
        self.rpos == self.wpos
    }

    /// 标记 `n` 个字节已被协议层消费。
    pub fn commit_read(&mut self, n: usize) -> Result<()> {
        if n > self.active_size() {
            return Err(BufferError::out_of_range(self.rpos, n, self.wpos));
        }
        self.rpos += n;
        Ok(())
    }

    /// 将 `[r, w)` 挪到开头，随后 `r == 0`。
    pub fn compact(&mut self) {
        if self.rpos == 0 {
            return;
        }
        if self.rpos != self.wpos {
            self.storage.copy_within(self.rpos..self.wpos, 0);
        }
        self.wpos -= self.rpos;
        self.rpos = 0;
    }

    /// 若尾部已无空位则按 1.5 倍扩容。
    ///
    /// 容量过小（0 或 1）时 1.5 倍取整不会增长，此时至少增加一个字节。
    pub fn ensure_free_space(&mut self) {
        if self.remaining_space() == 0 {
            let target = grown_capacity(self.storage.len());
            self.storage.resize(target, 0);
        }
    }

    /// 带上限的 [`ensure_free_space`](Self::ensure_free_space)。
    ///
    /// # 契约说明（What）
    /// - 扩容目标超过 `limit` 时先截到 `limit`；若当前容量已达到 `limit`，
    ///   返回 [`BufferError::CapacityExceeded`]，缓冲保持原状；
    /// - 调用方（连接读泵）据此关闭跟不上节奏或发送畸形数据的对端。
    pub fn ensure_free_space_within(&mut self, limit: usize) -> Result<()> {
        if self.remaining_space() > 0 {
            return Ok(());
        }
        let current = self.storage.len();
        let target = grown_capacity(current).min(limit);
        if target <= current {
            return Err(BufferError::CapacityExceeded {
                size: grown_capacity(current),
                limit,
            });
        }
        self.storage.resize(target, 0);
        Ok(())
    }

    /// 清空游标，保留容量。
    pub fn reset(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    /// 调整容量；游标会被截断到新容量以内。
    pub fn resize(&mut self, capacity: usize) {
        self.storage.resize(capacity, 0);
        self.wpos = self.wpos.min(capacity);
        self.rpos = self.rpos.min(self.wpos);
    }

    /// 复制一段数据到写游标处，空间不足时扩容。
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let required = self.wpos + data.len();
        if required > self.storage.len() {
            let target = grown_capacity(self.storage.len()).max(required);
            self.storage.resize(target, 0);
        }
        self.storage[self.wpos..required].copy_from_slice(data);
        self.wpos = required;
    }

    /// 取走未读区域的所有权。
    pub fn into_vec(mut self) -> Vec<u8> {
        self.storage.truncate(self.wpos);
        self.storage.drain(..self.rpos);
        self.storage
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn read_pos(&self) -> usize {
        self.rpos
    }

    pub fn write_pos(&self) -> usize {
        self.wpos
    }
}

impl Default for RawBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn grown_capacity(current: usize) -> usize {
    (current.saturating_mul(3) / 2).max(current + 1)
}
