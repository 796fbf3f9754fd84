//! `WireBuffer` 线格式性质验证。
//!
//! # 测试总览（Why）
//! - 对定长标量、位打包、压缩 GUID 与压缩时间做随机化验证，确保任意取值都满足对称性；
//! - 越界读取必须报错且不移动读游标，协议层依赖该性质实现“数据不足则等待下一次读取”。
//!
//! # 合同与边界（What）
//! - 压缩 GUID 的编码长度恒为 `1 + 非零字节数`；
//! - 写入 1..=7 位后 flush，剩余位以 0 填充。

use chrono::{NaiveDate, NaiveDateTime};
use kiln_buffer::{BufferError, WireBuffer, pack_time};
use proptest::prelude::*;

fn packable_time() -> impl Strategy<Value = NaiveDateTime> {
    (2000i32..=2031, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60).prop_map(|(y, mo, d, h, mi)| {
        NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, 0))
            .expect("生成的日期合法")
    })
}

proptest! {
    #[test]
    fn prop_mixed_scalars_round_trip(
        a in any::<u8>(),
        b in any::<i16>(),
        c in any::<u32>(),
        d in any::<i64>(),
        e in any::<u64>(),
        f in any::<f32>().prop_filter("有限值", |v| v.is_finite()),
        g in any::<f64>().prop_filter("有限值", |v| v.is_finite()),
    ) {
        let mut buffer = WireBuffer::new();
        buffer.append(a).expect("追加 u8");
        buffer.append(b).expect("追加 i16");
        buffer.append(c).expect("追加 u32");
        buffer.append(d).expect("追加 i64");
        buffer.append(e).expect("追加 u64");
        buffer.append(f).expect("追加 f32");
        buffer.append(g).expect("追加 f64");
        prop_assert_eq!(buffer.size(), 1 + 2 + 4 + 8 + 8 + 4 + 8);

        prop_assert_eq!(buffer.read::<u8>(), Ok(a));
        prop_assert_eq!(buffer.read::<i16>(), Ok(b));
        prop_assert_eq!(buffer.read::<u32>(), Ok(c));
        prop_assert_eq!(buffer.read::<i64>(), Ok(d));
        prop_assert_eq!(buffer.read::<u64>(), Ok(e));
        prop_assert_eq!(buffer.read::<f32>().map(f32::to_bits), Ok(f.to_bits()));
        prop_assert_eq!(buffer.read::<f64>().map(f64::to_bits), Ok(g.to_bits()));
        prop_assert_eq!(buffer.rpos(), buffer.size());
    }

    #[test]
    fn prop_bits_round_trip(value in any::<u64>(), bits in 1u32..=64) {
        let masked = if bits == 64 { value } else { value & ((1u64 << bits) - 1) };
        let mut buffer = WireBuffer::new();
        buffer.write_bits(value, bits).expect("写位");
        buffer.flush_bits().expect("flush");
        prop_assert_eq!(buffer.size(), (bits as usize).div_ceil(8));
        prop_assert_eq!(buffer.read_bits(bits), Ok(masked));
    }

    #[test]
    fn prop_partial_byte_is_zero_padded(value in any::<u8>(), bits in 1u32..=7) {
        let mut buffer = WireBuffer::new();
        buffer.write_bits(u64::from(value), bits).expect("写位");
        buffer.flush_bits().expect("flush");
        let byte = buffer.byte_at(0).expect("已落地一个字节");
        prop_assert_eq!(buffer.size(), 1);
        prop_assert_eq!(byte & ((1u8 << (8 - bits)) - 1), 0);
        prop_assert_eq!(u64::from(byte >> (8 - bits)), u64::from(value) & ((1 << bits) - 1));
    }

    #[test]
    fn prop_packed_guid_round_trip(value in prop_oneof![Just(0u64), Just(u64::MAX), any::<u64>()]) {
        let mut buffer = WireBuffer::new();
        buffer.append_packed_u64(value).expect("追加压缩 GUID");
        let nonzero = value.to_le_bytes().iter().filter(|b| **b != 0).count();
        prop_assert_eq!(buffer.size(), 1 + nonzero);
        prop_assert_eq!(buffer.read_packed_u64(), Ok(value));
    }

    #[test]
    fn prop_short_reads_leave_cursor(len in 0usize..8, skip in 0usize..8) {
        let mut buffer = WireBuffer::from(vec![0xEE; len]);
        let skip = skip.min(len);
        buffer.read_skip(skip).expect("跳过已有数据");
        let result = buffer.read::<u64>();
        let out_of_range = matches!(result, Err(BufferError::OutOfRange { requested: 8, .. }));
        prop_assert!(out_of_range, "短读必须返回 OutOfRange");
        prop_assert_eq!(buffer.rpos(), skip);
    }

    #[test]
    fn prop_packed_time_round_trip(time in packable_time()) {
        let mut buffer = WireBuffer::new();
        buffer.append_packed_time(&time).expect("追加压缩时间");
        prop_assert_eq!(buffer.read_at::<u32>(0), Ok(pack_time(&time).expect("可压缩")));
        prop_assert_eq!(buffer.read_packed_time(), Ok(time));
    }
}

/// 位写入跨越字节对齐的字节写入后仍可按顺序读回。
#[test]
fn bits_then_bytes_then_bits() {
    let mut buffer = WireBuffer::new();
    buffer.write_bits(0b101, 3).expect("写 3 位");
    buffer.append::<u16>(0xBEEF).expect("字节写入自动 flush");
    buffer.write_bit(true).expect("写位");
    buffer.flush_bits().expect("flush");
    assert_eq!(buffer.contents(), &[0b1010_0000, 0xEF, 0xBE, 0b1000_0000]);

    assert_eq!(buffer.read_bits(3), Ok(0b101));
    assert_eq!(buffer.read::<u16>(), Ok(0xBEEF));
    assert_eq!(buffer.read_bit(), Ok(true));
}

/// 事后回填的掩码位不影响相邻位。
#[test]
fn put_bits_patches_reserved_flags() {
    let mut buffer = WireBuffer::new();
    let flags_pos = buffer.bitwpos();
    buffer.write_bits(0, 4).expect("预留 4 位");
    buffer.write_bits(0b1111, 4).expect("紧随其后的 4 位");
    buffer.put_bits(flags_pos, 0b1001, 4).expect("回填");
    assert_eq!(buffer.contents(), &[0b1001_1111]);
}
