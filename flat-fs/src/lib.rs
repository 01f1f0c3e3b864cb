#[cfg(not(target_endian = "little"))]
compile_error!("flat-fs maps its little-endian disk layout directly onto memory");

/* flat-fs 的整体架构，自上而下 */

// 文件系统层：打开、关闭、读写、定位、删除、格式化、同步
mod fs;

// 打开文件表：读写者准入状态机
mod file_table;

// 单层目录：inode 编号到文件名的映射
mod directory;

// 超级块与空闲块链表
mod free_map;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
mod layout;

// 块缓存层：内存上的磁盘块数据缓存
mod block_cache;

mod error;

pub use block_dev::{BLOCK_SIZE, BlockDevice, DeviceError};

pub use self::{
    directory::Directory,
    error::{Error, Result, Violation},
    file_table::{Access, FileHandle, OpenMode},
    fs::{FileStat, FileSystem},
    layout::{DiskInode, InodeId, InodeState, SuperBlock},
};

pub const MAGIC: u32 = 0x7468_7273;

/// 直接索引个数
pub const DIRECT_COUNT: usize = 11;
/// 间接索引块内的块编号个数
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 2;
/// 单个文件最多占用的数据块
pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT + INDIRECT_COUNT;
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// 文件名的最大字节数
pub const NAME_MAX_LEN: usize = 30;
pub const DEFAULT_INODES: u32 = 64;
pub const MAX_INODES: u32 = i16::MAX as u32;
/// 块编号在磁盘上是有符号16位数
pub const MAX_BLOCKS: u32 = i16::MAX as u32 + 1;

pub const ROOT_NAME: &str = "/";

type DataBlock = [u8; BLOCK_SIZE];
