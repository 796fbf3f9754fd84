//! 缓冲内容的诊断转储。
//!
//! # 教案式说明
//! - **意图（Why）**：排查协议分帧问题时需要看到缓冲的原始内容，但格式化整段缓冲代价高，
//!   只能在 trace 级别开启时执行；
//! - **逻辑（How）**：`print_storage`/`textlike`/`hexlike` 先询问
//!   [`Logger::should_log`]，未开启则立即返回；格式化本身由纯函数完成，便于单独测试；
//! - **契约（What）**：转储统一输出到 [`NETWORK_LOGGER`]，首行为 `STORAGE_SIZE: <n>`。

use core::fmt::Write as _;

use kiln_core::{LogSeverity, Logger, NETWORK_LOGGER};

use crate::WireBuffer;

impl WireBuffer {
    /// 以十进制逐字节转储。
    pub fn print_storage(&self, logger: &dyn Logger) {
        if !logger.should_log(NETWORK_LOGGER, LogSeverity::Trace) {
            return;
        }
        logger.trace(NETWORK_LOGGER, format_args!("{}", format_decimal(self.contents())));
    }

    /// 以字符形式转储，不可打印字节显示为 `.`。
    pub fn textlike(&self, logger: &dyn Logger) {
        if !logger.should_log(NETWORK_LOGGER, LogSeverity::Trace) {
            return;
        }
        logger.trace(NETWORK_LOGGER, format_args!("{}", format_text(self.contents())));
    }

    /// 以十六进制转储，每 8 字节以 `| ` 分组，每 16 字节换行。
    pub fn hexlike(&self, logger: &dyn Logger) {
        if !logger.should_log(NETWORK_LOGGER, LogSeverity::Trace) {
            return;
        }
        logger.trace(NETWORK_LOGGER, format_args!("{}", format_hex(self.contents())));
    }
}

pub fn format_decimal(bytes: &[u8]) -> String {
    let mut out = header(bytes);
    for byte in bytes {
        let _ = write!(out, "{byte} - ");
    }
    out
}

pub fn format_text(bytes: &[u8]) -> String {
    let mut out = header(bytes);
    out.extend(bytes.iter().map(|byte| {
        let ch = char::from(*byte);
        if ch.is_ascii_graphic() || ch == ' ' { ch } else { '.' }
    }));
    out
}

pub fn format_hex(bytes: &[u8]) -> String {
    let mut out = header(bytes);
    let (mut group, mut line) = (1usize, 1usize);
    for (index, byte) in bytes.iter().enumerate() {
        if index == group * 8 && index != line * 16 {
            out.push_str("| ");
            group += 1;
        } else if index == line * 16 {
            out.push('\n');
            line += 1;
            group += 1;
        }
        let _ = write!(out, "{byte:02X} ");
    }
    out
}

fn header(bytes: &[u8]) -> String {
    format!("STORAGE_SIZE: {} ", bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{MemoryLogger, NoopLogger};

    #[test]
    fn hex_groups_and_wraps() {
        let bytes: Vec<u8> = (0u8..18).collect();
        let dump = format_hex(&bytes);
        assert_eq!(
            dump,
            "STORAGE_SIZE: 18 00 01 02 03 04 05 06 07 | 08 09 0A 0B 0C 0D 0E 0F \n10 11 "
        );
    }

    #[test]
    fn text_masks_control_bytes() {
        assert_eq!(format_text(b"ok\x00\n!"), "STORAGE_SIZE: 5 ok..!");
        assert_eq!(format_decimal(&[1, 255]), "STORAGE_SIZE: 2 1 - 255 - ");
    }

    #[test]
    fn dumps_are_gated_by_trace_level() {
        let buffer = WireBuffer::from(vec![0xAB]);

        let quiet = MemoryLogger::new(LogSeverity::Debug);
        buffer.hexlike(&quiet);
        buffer.textlike(&quiet);
        assert!(quiet.entries().is_empty());

        let verbose = MemoryLogger::new(LogSeverity::Trace);
        buffer.hexlike(&verbose);
        buffer.print_storage(&verbose);
        assert!(verbose.contains(LogSeverity::Trace, "AB"));
        assert!(verbose.contains(LogSeverity::Trace, "171 - "));

        buffer.hexlike(&NoopLogger);
    }
}
