//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓冲层的错误语义：越界、解码无效与调用契约违例；
//! - 协议代码逐字段决定遇错时关闭连接还是重试分帧，因此错误必须显式返回。
//!
//! ## 设计要求（What）
//! - 每个变体提供稳定错误码（[`BufferError::code`]），便于日志检索与告警聚合；
//! - 原本以断言终止进程的契约违例（空追加、位数为 0 等）在此统一降级为可报告的错误。

use thiserror::Error;

/// 缓冲层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“数据不够/越界”“解码出的值不合法”“调用方违背契约”三类问题；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨线程传播；
///   读取类操作失败时读游标保持不变；
/// - **执行逻辑 (How)**：变体携带定位上下文（位置、请求长度、当前大小），`code()` 返回稳定错误码。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// 读取、跳过、索引或原位覆写超出缓冲逻辑边界。
    ///
    /// - `pos`：操作起始位置；`requested`：所需字节数；`size`：当前缓冲有效大小。
    #[error("attempted to access {requested} byte(s) at position {pos} in buffer of size {size}")]
    OutOfRange {
        pos: usize,
        requested: usize,
        size: usize,
    },

    /// 解码得到的浮点数为 NaN 或无穷。
    #[error("decoded floating point value is not finite")]
    NonFinite,

    /// 追加了零长度数据。
    #[error("attempted to append an empty byte sequence")]
    EmptyAppend,

    /// 位操作的位数为 0。
    #[error("bit count must be greater than zero")]
    ZeroBitCount,

    /// 位操作的位数超过 64。
    #[error("bit count {bits} exceeds 64")]
    BitCountTooLarge { bits: u32 },

    /// 追加后缓冲将超过配置的最大容量。
    ///
    /// - **风险 (Trade-offs)**：通常意味着对端发送了畸形长度或协议层未及时消费。
    #[error("buffer size {size} would exceed limit {limit}")]
    CapacityExceeded { size: usize, limit: usize },

    /// 压缩时间解码出不存在的日历日期。
    #[error("packed time {raw:#010x} does not describe a valid calendar date")]
    InvalidPackedTime { raw: u32 },

    /// 时间戳年份超出 5 位年份字段（2000..=2031）的表示范围。
    #[error("year {year} cannot be represented in packed time")]
    PackedTimeOutOfRange { year: i32 },

    /// 字符串内容不是合法 UTF-8。
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

impl BufferError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::OutOfRange { .. } => "kiln.buffer.out_of_range",
            BufferError::NonFinite => "kiln.buffer.non_finite",
            BufferError::EmptyAppend => "kiln.buffer.empty_append",
            BufferError::ZeroBitCount => "kiln.buffer.zero_bit_count",
            BufferError::BitCountTooLarge { .. } => "kiln.buffer.bit_count_too_large",
            BufferError::CapacityExceeded { .. } => "kiln.buffer.capacity_exceeded",
            BufferError::InvalidPackedTime { .. } => "kiln.buffer.invalid_packed_time",
            BufferError::PackedTimeOutOfRange { .. } => "kiln.buffer.packed_time_out_of_range",
            BufferError::InvalidUtf8 => "kiln.buffer.invalid_utf8",
        }
    }

    pub(crate) fn out_of_range(pos: usize, requested: usize, size: usize) -> Self {
        BufferError::OutOfRange {
            pos,
            requested,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BufferError::out_of_range(4, 8, 6).code(),
            "kiln.buffer.out_of_range"
        );
        assert_eq!(
            BufferError::BitCountTooLarge { bits: 65 }.to_string(),
            "bit count 65 exceeds 64"
        );
        assert_eq!(
            BufferError::InvalidPackedTime { raw: 0xFFFF_FFFF }.to_string(),
            "packed time 0xffffffff does not describe a valid calendar date"
        );
    }
}
