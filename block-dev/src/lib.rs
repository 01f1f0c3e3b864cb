//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 与直接终止进程不同，驱动的读写失败以 [`DeviceError`] 的形式交还给调用者。

mod ram_disk;

use core::any::Any;

pub use self::ram_disk::RamDisk;

/// 块大小（字节）
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("block {block_id} is out of range")]
    OutOfRange { block_id: usize },
    #[error("incomplete transfer of block {block_id}: {len} bytes")]
    ShortTransfer { block_id: usize, len: usize },
    #[error("write budget exhausted at block {block_id}")]
    WriteBudgetExhausted { block_id: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
