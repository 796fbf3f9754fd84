#![deny(unsafe_code)]

//! `kiln-buffer` 提供网络内核使用的两类缓冲。
//!
//! # 模块定位（Why）
//! - [`RawBuffer`]：每个连接独占的套接字读暂存区，维护读写游标，支持压缩与按 1.5 倍扩容；
//! - [`WireBuffer`]：面向协议字段的结构化编解码缓冲，覆盖定长整数/浮点、子字节位打包、
//!   压缩 GUID、压缩时间与压缩坐标等线格式；
//! - [`dump`]：在 trace 级别输出缓冲内容的诊断转储。
//!
//! # 线格式约定（What）
//! - 多字节数值一律以小端序落在线上，大端主机在编解码时交换字节序；
//! - 位打包以最高有效位优先填充累加字节，字节级写入前自动补齐并落地未完成的位；
//! - 所有越界访问都以 [`BufferError`] 返回，从不静默截断。

pub mod dump;
pub mod error;
pub mod packed;
pub mod raw;
pub mod wire;

pub use error::BufferError;
pub use packed::{pack_time, pack_xyz, unpack_time};
pub use raw::{DEFAULT_RAW_CAPACITY, RawBuffer};
pub use wire::{DEFAULT_WIRE_CAPACITY, MAX_WIRE_SIZE, WireBuffer, WireScalar};

/// 缓冲操作的统一返回类型。
pub type Result<T, E = BufferError> = core::result::Result<T, E>;
