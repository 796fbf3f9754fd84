use kiln_buffer::WireBuffer;
use kiln_core::{LogSeverity, NETWORK_LOGGER};
use kiln_transport_tcp::{Connection, ConnectionHandler};

use crate::frame::{Frame, OP_BYE, OP_ECHO, OP_ECHO_REPLY, OP_QUIT, decode_frame, encode_frame};

/// 长度前缀回显协议的连接处理器。
///
/// # 教案式说明
/// - **意图（Why）**：演示协议层如何只依赖 [`ConnectionHandler`] 与读缓冲完成分帧，
///   不完整的帧留在读缓冲中等待下一次读取；
/// - **逻辑（How）**：每次有新数据时循环解帧，`ECHO` 原样回复负载，
///   `QUIT` 回复告别帧后延迟关闭；解帧失败或未知操作码立即断开；
/// - **契约（What）**：应答帧的序号沿用请求序号；每个入站帧在 trace 级别输出十六进制转储。
#[derive(Debug, Default)]
pub struct EchoHandler {
    replies: u64,
}

impl EchoHandler {
    pub fn replies(&self) -> u64 {
        self.replies
    }

    fn reply(&mut self, conn: &mut Connection, frame: &Frame) -> bool {
        match encode_frame(frame) {
            Ok(wire) => {
                conn.enqueue_write(wire);
                self.replies += 1;
                true
            }
            Err(err) => {
                conn.logger().warn(
                    NETWORK_LOGGER,
                    format_args!("connection {} reply dropped: {err}", conn.id()),
                );
                conn.close();
                false
            }
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn start(&mut self, conn: &mut Connection) {
        conn.logger().debug(
            NETWORK_LOGGER,
            format_args!("connection {} from {} admitted", conn.id(), conn.peer_addr()),
        );
        conn.begin_read();
    }

    fn on_data_received(&mut self, conn: &mut Connection) -> bool {
        let mut complete = false;
        loop {
            let (frame, used) = match decode_frame(conn.read_buffer().read_slice()) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(err) => {
                    conn.logger().warn(
                        NETWORK_LOGGER,
                        format_args!("connection {} sent a malformed frame: {err}", conn.id()),
                    );
                    conn.close();
                    return complete;
                }
            };
            if conn.logger().should_log(NETWORK_LOGGER, LogSeverity::Trace) {
                let raw = WireBuffer::from(conn.read_buffer().read_slice()[..used].to_vec());
                raw.hexlike(conn.logger().as_ref());
            }
            if conn.read_buffer_mut().commit_read(used).is_err() {
                conn.close();
                return complete;
            }
            complete = true;

            match frame.opcode {
                OP_ECHO => {
                    let reply = Frame::new(OP_ECHO_REPLY, frame.sequence, frame.payload);
                    if !self.reply(conn, &reply) {
                        return complete;
                    }
                }
                OP_QUIT => {
                    if self.reply(conn, &Frame::new(OP_BYE, frame.sequence, Vec::new())) {
                        conn.close_deferred();
                    }
                    return complete;
                }
                other => {
                    conn.logger().warn(
                        NETWORK_LOGGER,
                        format_args!("connection {} sent unknown opcode {other:#04x}", conn.id()),
                    );
                    conn.close();
                    return complete;
                }
            }
        }
        conn.begin_read();
        complete
    }

    fn on_close(&mut self, conn: &mut Connection) {
        let stats = conn.stats();
        conn.logger().debug(
            NETWORK_LOGGER,
            format_args!(
                "connection {} closed after {} frames ({} bytes in, {} bytes out)",
                conn.id(),
                stats.messages_received,
                stats.bytes_read,
                stats.bytes_written
            ),
        );
    }
}
