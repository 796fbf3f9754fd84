//! 示例协议的帧格式。
//!
//! ```text
//! +-----------+--------+-------------------+-----------+
//! | len: u16  | op: u8 | seq: packed u64   | payload   |
//! +-----------+--------+-------------------+-----------+
//! ```
//! - `len` 为小端序，不含自身两个字节；
//! - `seq` 使用压缩 GUID 编码，零字节不上线。

use kiln_buffer::{BufferError, WireBuffer};

/// 请求回显。
pub const OP_ECHO: u8 = 0x01;
/// 请求服务端在回复后关闭连接。
pub const OP_QUIT: u8 = 0x02;
/// 回显应答。
pub const OP_ECHO_REPLY: u8 = 0x81;
/// 关闭前的告别应答。
pub const OP_BYE: u8 = 0x82;

const LENGTH_PREFIX: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, sequence: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            sequence,
            payload: payload.into(),
        }
    }
}

/// 编码为带长度前缀的完整帧。
pub fn encode_frame(frame: &Frame) -> Result<WireBuffer, BufferError> {
    let mut wire = WireBuffer::new();
    wire.append(0u16)?;
    wire.append(frame.opcode)?;
    wire.append_packed_u64(frame.sequence)?;
    if !frame.payload.is_empty() {
        wire.append_bytes(&frame.payload)?;
    }

    let body = wire.size() - LENGTH_PREFIX;
    let len = u16::try_from(body).map_err(|_| BufferError::CapacityExceeded {
        size: body,
        limit: usize::from(u16::MAX),
    })?;
    wire.put(0, len)?;
    Ok(wire)
}

/// 尝试从字节流前缀解出一帧。
///
/// 返回 `Ok(None)` 表示数据不足一帧；成功时同时返回该帧占用的字节数。
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Frame, usize)>, BufferError> {
    if bytes.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let total = LENGTH_PREFIX + len;
    if bytes.len() < total {
        return Ok(None);
    }

    let mut body = WireBuffer::from(bytes[LENGTH_PREFIX..total].to_vec());
    let opcode = body.read::<u8>()?;
    let sequence = body.read_packed_u64()?;
    let payload = body.read_bytes(body.size() - body.rpos())?;
    Ok(Some((
        Frame {
            opcode,
            sequence,
            payload,
        },
        total,
    )))
}
