//! 压缩时间与压缩坐标的位域编解码。
//!
//! # 压缩时间布局（What）
//! 32 位字由低到高依次为：
//!
//! | 位     | 宽度 | 字段                |
//! |--------|------|---------------------|
//! | 0..6   | 6    | 分钟                |
//! | 6..11  | 5    | 小时                |
//! | 11..14 | 3    | 星期（周日为 0）    |
//! | 14..20 | 6    | 日 - 1              |
//! | 20..24 | 4    | 月 - 1              |
//! | 24..29 | 5    | 年 - 2000           |
//!
//! 解码时忽略星期字段，由日期本身推导；秒恒为 0。

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::{BufferError, Result};

const PACKED_YEAR_BASE: i32 = 2000;
const PACKED_YEAR_MAX: i32 = PACKED_YEAR_BASE + 0x1F;

/// 将日历时间压缩为 32 位字。
///
/// 年份超出 2000..=2031 时返回 [`BufferError::PackedTimeOutOfRange`]。
pub fn pack_time<T: Datelike + Timelike>(time: &T) -> Result<u32> {
    let year = time.year();
    if !(PACKED_YEAR_BASE..=PACKED_YEAR_MAX).contains(&year) {
        return Err(BufferError::PackedTimeOutOfRange { year });
    }
    let year = (year - PACKED_YEAR_BASE) as u32;
    Ok(year << 24
        | time.month0() << 20
        | time.day0() << 14
        | time.weekday().num_days_from_sunday() << 11
        | time.hour() << 6
        | time.minute())
}

/// 将 32 位字还原为日历时间。
pub fn unpack_time(raw: u32) -> Result<NaiveDateTime> {
    let minute = raw & 0x3F;
    let hour = (raw >> 6) & 0x1F;
    let day = ((raw >> 14) & 0x3F) + 1;
    let month = ((raw >> 20) & 0xF) + 1;
    let year = ((raw >> 24) & 0x1F) as i32 + PACKED_YEAR_BASE;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or(BufferError::InvalidPackedTime { raw })
}

/// 三维坐标按 0.25 量化后压入 11/11/10 位，向零截断，负值按补码取低位。
pub fn pack_xyz(x: f32, y: f32, z: f32) -> u32 {
    let quantise = |value: f32| (value / 0.25) as i32 as u32;
    (quantise(x) & 0x7FF) | (quantise(y) & 0x7FF) << 11 | (quantise(z) & 0x3FF) << 22
}
