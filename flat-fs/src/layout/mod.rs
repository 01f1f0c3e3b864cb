//! # 磁盘数据结构层
//!
//! flat-fs 的磁盘布局：
//! 超级块 | 索引节点区域 | 数据块区域（空闲块链表穿插其中）

mod super_block;
pub use super_block::{FREE_LIST_END, SuperBlock, is_list_end};

mod inode;
pub use inode::{DiskInode, InodeId, InodeState, block_id};
