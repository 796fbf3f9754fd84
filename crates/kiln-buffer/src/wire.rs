use bytes::Bytes;
use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::{BufferError, RawBuffer, Result, packed};

/// 新建编解码缓冲时预留的容量。
pub const DEFAULT_WIRE_CAPACITY: usize = 0x1000;

/// 单个编解码缓冲允许的最大字节数。
pub const MAX_WIRE_SIZE: usize = 10_000_000;

/// 位游标处于字节对齐状态时的取值。
const BYTE_ALIGNED: u8 = 8;

/// 可按固定宽度落在线上的标量类型。
///
/// # 契约说明（What）
/// - `SIZE` 为线上字节数；`write_le` 以小端序写入恰好 `SIZE` 字节的切片；
/// - `read_le` 从恰好 `SIZE` 字节的切片解码；
/// - `validate` 在读取后校验取值，浮点类型在此拒绝 NaN 与无穷。
///
/// 小端主机上 `to_le_bytes`/`from_le_bytes` 不做任何交换，大端主机上交换字节序。
pub trait WireScalar: Copy {
    const SIZE: usize;

    fn write_le(self, out: &mut [u8]);

    fn read_le(src: &[u8]) -> Self;

    fn validate(self) -> Result<Self> {
        Ok(self)
    }
}

macro_rules! impl_wire_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireScalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(src: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_scalar!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! impl_wire_float {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireScalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(src: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    <$ty>::from_le_bytes(raw)
                }

                fn validate(self) -> Result<Self> {
                    if self.is_finite() {
                        Ok(self)
                    } else {
                        Err(BufferError::NonFinite)
                    }
                }
            }
        )*
    };
}

impl_wire_float!(f32, f64);

/// `WireBuffer` 是协议字段的结构化编解码缓冲。
///
/// # 设计背景（Why）
/// - 协议层需要逐字段写入/读取定长数值、字符串、位打包标志与变长编码，
///   并在事后回填长度或掩码字段；
/// - 读写共享一段连续存储，读游标与写游标相互独立，位游标由读写两侧共享。
///
/// # 逻辑解析（How）
/// - 字节级写入总是插入在写游标处，插入前先落地未完成的位累加字节；
/// - 位写入按最高有效位优先填充 `curbitval`，满 8 位即追加一个字节；
///   位读取每 8 次拉取一个新字节；
/// - 任何字节级读取都会丢弃残留的读位状态（`reset_bitpos`）。
///
/// # 契约说明（What）
/// - **不变式**：`rpos <= size`、`wpos <= size`，`bitpos` 取值 0..=8，8 表示字节对齐；
/// - **前置条件**：位写入与字节读取不可在未 flush 的情况下交错，否则残留位会被丢弃；
/// - **前置条件**：位读取之后、任何写入之前必须调用 [`reset_bitpos`](Self::reset_bitpos)。
///   读位状态与写位状态共用 `bitpos`/`curbitval`，未重置时写入会把已读出的字节
///   当作未落地的写位再插入一次（`read_bit` ×2 后 `append::<u8>(1)` 得到 `[AB, AB, 01]`）；
/// - **后置条件**：读取失败（越界、非有限浮点、非法 UTF-8）时读游标保持不变。
///
/// # 风险提示（Trade-offs）
/// - 在写游标之前插入会搬移其后的全部数据，顺序编码时写游标总在末尾，不受影响。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireBuffer {
    storage: Vec<u8>,
    rpos: usize,
    wpos: usize,
    bitpos: u8,
    curbitval: u8,
    max_size: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WIRE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_storage(Vec::with_capacity(capacity), 0)
    }

    /// 调整最大字节数，默认 [`MAX_WIRE_SIZE`]。
    pub fn with_max_size(mut self, limit: usize) -> Self {
        self.max_size = limit;
        self
    }

    fn from_storage(storage: Vec<u8>, wpos: usize) -> Self {
        Self {
            storage,
            rpos: 0,
            wpos,
            bitpos: BYTE_ALIGNED,
            curbitval: 0,
            max_size: MAX_WIRE_SIZE,
        }
    }

    /// 清空内容与全部游标。
    pub fn clear(&mut self) {
        self.storage.clear();
        self.rpos = 0;
        self.wpos = 0;
        self.bitpos = BYTE_ALIGNED;
        self.curbitval = 0;
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn contents(&self) -> &[u8] {
        &self.storage
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// 调整大小（新增部分补零），读游标归零，写游标移到末尾。
    pub fn resize(&mut self, size: usize) {
        self.storage.resize(size, 0);
        self.rpos = 0;
        self.wpos = self.storage.len();
    }

    /// 预留至少 `capacity` 字节的存储。
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.storage.len() {
            self.storage.reserve(capacity - self.storage.len());
        }
    }

    pub fn into_storage(self) -> Vec<u8> {
        self.storage
    }

    /// 落地未完成的位并冻结为 `Bytes`，交给写队列发送。
    pub fn finish(mut self) -> Bytes {
        if self.bitpos != BYTE_ALIGNED && self.bitpos != 0 {
            self.storage.insert(self.wpos, self.curbitval);
        }
        Bytes::from(self.storage)
    }

    // ---- 字节级写入 ----

    /// 以小端序追加一个标量。
    pub fn append<T: WireScalar>(&mut self, value: T) -> Result<()> {
        let mut scratch = [0u8; 8];
        let encoded = &mut scratch[..T::SIZE];
        value.write_le(encoded);
        self.append_bytes(encoded)
    }

    /// 在写游标处插入一段字节。
    ///
    /// 空切片返回 [`BufferError::EmptyAppend`]；插入前先落地未完成的位。
    pub fn append_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Err(BufferError::EmptyAppend);
        }
        self.ensure_room(src.len() + usize::from(self.has_pending_write_bits()))?;
        self.flush_bits()?;
        self.insert_raw(src)
    }

    /// 追加另一个缓冲的全部内容，空缓冲不产生任何写入。
    pub fn append_buffer(&mut self, other: &WireBuffer) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        self.append_bytes(other.contents())
    }

    /// 追加 UTF-8 字节并以单个 NUL 结尾。
    pub fn append_str(&mut self, value: &str) -> Result<()> {
        self.ensure_room(value.len() + 1 + usize::from(self.has_pending_write_bits()))?;
        if !value.is_empty() {
            self.append_bytes(value.as_bytes())?;
        }
        self.append::<u8>(0)
    }

    /// 写入长度另行发送的字符串，不带结尾 NUL。
    pub fn write_string_raw(&mut self, value: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        self.append_bytes(value.as_bytes())
    }

    /// 原位覆写 `pos` 处的标量。
    pub fn put<T: WireScalar>(&mut self, pos: usize, value: T) -> Result<()> {
        let mut scratch = [0u8; 8];
        let encoded = &mut scratch[..T::SIZE];
        value.write_le(encoded);
        self.put_bytes(pos, encoded)
    }

    /// 原位覆写 `pos` 处的一段字节，不移动任何游标。
    pub fn put_bytes(&mut self, pos: usize, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Err(BufferError::EmptyAppend);
        }
        let end = pos
            .checked_add(src.len())
            .filter(|end| *end <= self.storage.len())
            .ok_or_else(|| BufferError::out_of_range(pos, src.len(), self.storage.len()))?;
        self.storage[pos..end].copy_from_slice(src);
        Ok(())
    }

    fn ensure_room(&self, additional: usize) -> Result<()> {
        let size = self.storage.len().saturating_add(additional);
        if size > self.max_size {
            return Err(BufferError::CapacityExceeded {
                size,
                limit: self.max_size,
            });
        }
        Ok(())
    }

    fn insert_raw(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_room(src.len())?;
        if self.wpos == self.storage.len() {
            self.storage.extend_from_slice(src);
        } else {
            self.storage
                .splice(self.wpos..self.wpos, src.iter().copied());
        }
        self.wpos += src.len();
        Ok(())
    }

    // ---- 位打包 ----

    /// 是否存在尚未落地（写）或尚未耗尽（读）的位状态。
    pub fn has_unfinished_bitpack(&self) -> bool {
        self.bitpos != BYTE_ALIGNED
    }

    fn has_pending_write_bits(&self) -> bool {
        self.bitpos != BYTE_ALIGNED && self.bitpos != 0
    }

    /// 将未满 8 位的累加字节补零后追加。
    pub fn flush_bits(&mut self) -> Result<()> {
        if self.bitpos == BYTE_ALIGNED {
            return Ok(());
        }
        if self.bitpos != 0 {
            let pending = self.curbitval;
            self.insert_raw(&[pending])?;
        }
        self.bitpos = BYTE_ALIGNED;
        self.curbitval = 0;
        Ok(())
    }

    /// 丢弃位状态，回到字节对齐。
    pub fn reset_bitpos(&mut self) {
        if self.bitpos == BYTE_ALIGNED {
            return;
        }
        self.bitpos = BYTE_ALIGNED;
        self.curbitval = 0;
    }

    /// 写入一个位（最高有效位优先）。
    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        if self.bitpos == 0 {
            // 读位残留，视为新的累加字节
            self.reset_bitpos();
        }
        let pos = self.bitpos - 1;
        let mut value = self.curbitval;
        if bit {
            value |= 1 << pos;
        }
        if pos == 0 {
            self.insert_raw(&[value])?;
            self.bitpos = BYTE_ALIGNED;
            self.curbitval = 0;
        } else {
            self.bitpos = pos;
            self.curbitval = value;
        }
        Ok(())
    }

    /// 读取一个位，每 8 次从读游标拉取一个新字节。
    pub fn read_bit(&mut self) -> Result<bool> {
        if self.bitpos >= 7 {
            let byte = self.take_byte()?;
            self.curbitval = byte;
            self.bitpos = 0;
        } else {
            self.bitpos += 1;
        }
        Ok((self.curbitval >> (7 - self.bitpos)) & 1 == 1)
    }

    /// 写入 `value` 的低 `bits` 位，最高位优先。
    pub fn write_bits(&mut self, value: u64, bits: u32) -> Result<()> {
        check_bit_count(bits)?;
        let pending = if self.has_pending_write_bits() {
            usize::from(BYTE_ALIGNED - self.bitpos)
        } else {
            0
        };
        self.ensure_room((pending + bits as usize) / 8)?;
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 == 1)?;
        }
        Ok(())
    }

    /// 读取 `bits` 位并按最高位优先拼装；失败时读状态回滚。
    pub fn read_bits(&mut self, bits: u32) -> Result<u64> {
        check_bit_count(bits)?;
        let snapshot = (self.rpos, self.bitpos, self.curbitval);
        let mut value = 0u64;
        for shift in (0..bits).rev() {
            match self.read_bit() {
                Ok(true) => value |= 1 << shift,
                Ok(false) => {}
                Err(err) => {
                    (self.rpos, self.bitpos, self.curbitval) = snapshot;
                    return Err(err);
                }
            }
        }
        Ok(value)
    }

    /// 在位位置 `pos` 原位覆写 `bits` 位，不影响其余位。
    ///
    /// 位置通常取自 [`bitwpos`](Self::bitwpos)，调用前应已 flush。
    pub fn put_bits(&mut self, pos: usize, value: u64, bits: u32) -> Result<()> {
        check_bit_count(bits)?;
        let size_bits = self.storage.len() * 8;
        pos.checked_add(bits as usize)
            .filter(|end| *end <= size_bits)
            .ok_or_else(|| BufferError::out_of_range(pos, bits as usize, size_bits))?;
        for i in 0..bits as usize {
            let byte = (pos + i) / 8;
            let mask = 1u8 << (7 - (pos + i) % 8);
            if (value >> (bits as usize - i - 1)) & 1 == 1 {
                self.storage[byte] |= mask;
            } else {
                self.storage[byte] &= !mask;
            }
        }
        Ok(())
    }

    // ---- 游标 ----

    pub fn rpos(&self) -> usize {
        self.rpos
    }

    pub fn set_rpos(&mut self, pos: usize) -> Result<()> {
        if pos > self.storage.len() {
            return Err(BufferError::out_of_range(pos, 0, self.storage.len()));
        }
        self.rpos = pos;
        Ok(())
    }

    pub fn wpos(&self) -> usize {
        self.wpos
    }

    pub fn set_wpos(&mut self, pos: usize) -> Result<()> {
        if pos > self.storage.len() {
            return Err(BufferError::out_of_range(pos, 0, self.storage.len()));
        }
        self.wpos = pos;
        Ok(())
    }

    /// 最后写入位之后的位置，单位为位。
    pub fn bitwpos(&self) -> usize {
        self.wpos * 8 + usize::from(BYTE_ALIGNED) - usize::from(self.bitpos)
    }

    /// 以位为单位设置写位置，返回生效后的 [`bitwpos`](Self::bitwpos)。
    pub fn set_bitwpos(&mut self, pos: usize) -> Result<usize> {
        let wpos = pos / 8;
        if wpos > self.storage.len() {
            return Err(BufferError::out_of_range(wpos, 0, self.storage.len()));
        }
        self.wpos = wpos;
        self.bitpos = BYTE_ALIGNED - (pos % 8) as u8;
        Ok(self.bitwpos())
    }

    /// 读游标直接跳到写游标。
    pub fn rfinish(&mut self) {
        self.rpos = self.wpos;
    }

    pub fn read_skip(&mut self, count: usize) -> Result<()> {
        self.check_readable(self.rpos, count)?;
        self.reset_bitpos();
        self.rpos += count;
        Ok(())
    }

    fn check_readable(&self, pos: usize, count: usize) -> Result<usize> {
        pos.checked_add(count)
            .filter(|end| *end <= self.storage.len())
            .ok_or_else(|| BufferError::out_of_range(pos, count, self.storage.len()))
    }

    // ---- 字节级读取 ----

    /// 在读游标处读取一个标量。
    pub fn read<T: WireScalar>(&mut self) -> Result<T> {
        let value = self.read_at::<T>(self.rpos)?;
        self.reset_bitpos();
        self.rpos += T::SIZE;
        Ok(value)
    }

    /// 读取任意位置的标量，不移动游标。
    pub fn read_at<T: WireScalar>(&self, pos: usize) -> Result<T> {
        let end = self.check_readable(pos, T::SIZE)?;
        T::read_le(&self.storage[pos..end]).validate()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read::<u8>()? != 0)
    }

    pub fn read_into(&mut self, dest: &mut [u8]) -> Result<()> {
        let end = self.check_readable(self.rpos, dest.len())?;
        self.reset_bitpos();
        dest.copy_from_slice(&self.storage[self.rpos..end]);
        self.rpos = end;
        Ok(())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; count];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// 读取以 NUL 结尾的字符串；缺少 NUL 时读到缓冲末尾。
    pub fn read_cstring(&mut self) -> Result<String> {
        let start = self.rpos.min(self.storage.len());
        let tail = &self.storage[start..];
        let (len, consumed) = match tail.iter().position(|byte| *byte == 0) {
            Some(idx) => (idx, idx + 1),
            None => (tail.len(), tail.len()),
        };
        let value = core::str::from_utf8(&tail[..len])
            .map_err(|_| BufferError::InvalidUtf8)?
            .to_owned();
        self.reset_bitpos();
        self.rpos = start + consumed;
        Ok(value)
    }

    /// 读取定长字符串，不要求 NUL 结尾。
    pub fn read_string_exact(&mut self, len: usize) -> Result<String> {
        let end = self.check_readable(self.rpos, len)?;
        let value = core::str::from_utf8(&self.storage[self.rpos..end])
            .map_err(|_| BufferError::InvalidUtf8)?
            .to_owned();
        self.reset_bitpos();
        self.rpos = end;
        Ok(value)
    }

    pub fn byte_at(&self, index: usize) -> Result<u8> {
        self.storage
            .get(index)
            .copied()
            .ok_or_else(|| BufferError::out_of_range(index, 1, self.storage.len()))
    }

    pub fn byte_at_mut(&mut self, index: usize) -> Result<&mut u8> {
        let size = self.storage.len();
        self.storage
            .get_mut(index)
            .ok_or_else(|| BufferError::out_of_range(index, 1, size))
    }

    fn take_byte(&mut self) -> Result<u8> {
        let byte = self.read_at::<u8>(self.rpos)?;
        self.rpos += 1;
        Ok(byte)
    }

    // ---- 变长与压缩编码 ----

    /// 将 64 位值拆成存在掩码与非零字节（低位字节在前）。
    ///
    /// 返回 `(mask, bytes, len)`，`bytes[..len]` 为需要落在线上的字节。
    pub fn pack_u64(value: u64) -> (u8, [u8; 8], usize) {
        let mut mask = 0u8;
        let mut packed = [0u8; 8];
        let mut len = 0;
        for (index, byte) in value.to_le_bytes().into_iter().enumerate() {
            if byte != 0 {
                mask |= 1 << index;
                packed[len] = byte;
                len += 1;
            }
        }
        (mask, packed, len)
    }

    /// 追加压缩 GUID：先写掩码占位，再写非零字节，最后回填掩码。
    pub fn append_packed_u64(&mut self, value: u64) -> Result<()> {
        let (mask, packed, len) = Self::pack_u64(value);
        self.ensure_room(1 + len + usize::from(self.has_pending_write_bits()))?;
        self.flush_bits()?;
        let mask_pos = self.wpos;
        self.append::<u8>(0)?;
        if len > 0 {
            self.append_bytes(&packed[..len])?;
        }
        self.put::<u8>(mask_pos, mask)
    }

    /// 读取压缩 GUID；失败时读游标不变。
    pub fn read_packed_u64(&mut self) -> Result<u64> {
        let mask = self.read_at::<u8>(self.rpos)?;
        self.check_readable(self.rpos + 1, mask.count_ones() as usize)?;
        self.rpos += 1;
        self.read_packed_u64_with_mask(mask)
    }

    /// 按外部给定的掩码读取压缩 GUID 的字节部分。
    pub fn read_packed_u64_with_mask(&mut self, mask: u8) -> Result<u64> {
        self.check_readable(self.rpos, mask.count_ones() as usize)?;
        self.reset_bitpos();
        let mut value = 0u64;
        for index in 0..8 {
            if mask & (1 << index) != 0 {
                value |= u64::from(self.take_byte()?) << (index * 8);
            }
        }
        Ok(value)
    }

    /// 追加压缩时间（32 位日历位域）。
    pub fn append_packed_time<T: Datelike + Timelike>(&mut self, time: &T) -> Result<()> {
        self.append::<u32>(packed::pack_time(time)?)
    }

    /// 读取压缩时间；日期非法时读游标不变。
    pub fn read_packed_time(&mut self) -> Result<NaiveDateTime> {
        let raw = self.read_at::<u32>(self.rpos)?;
        let time = packed::unpack_time(raw)?;
        self.reset_bitpos();
        self.rpos += 4;
        Ok(time)
    }

    /// 追加按 0.25 量化的三维坐标（11/11/10 位）。
    pub fn append_packed_xyz(&mut self, x: f32, y: f32, z: f32) -> Result<()> {
        self.append::<u32>(packed::pack_xyz(x, y, z))
    }
}

fn check_bit_count(bits: u32) -> Result<()> {
    match bits {
        0 => Err(BufferError::ZeroBitCount),
        1..=64 => Ok(()),
        _ => Err(BufferError::BitCountTooLarge { bits }),
    }
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 直接接管字节序列，读游标为 0，写游标位于末尾。
impl From<Vec<u8>> for WireBuffer {
    fn from(storage: Vec<u8>) -> Self {
        let wpos = storage.len();
        Self::from_storage(storage, wpos)
    }
}

/// 接管读缓冲中尚未消费的字节。
impl From<RawBuffer> for WireBuffer {
    fn from(raw: RawBuffer) -> Self {
        Self::from(raw.into_vec())
    }
}
