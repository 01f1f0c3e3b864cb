use crate::{Error, INODES_PER_BLOCK, MAGIC, MAX_BLOCKS, MAX_INODES, Result};

/// 空闲块链表的结尾
pub const FREE_LIST_END: u32 = u32::MAX;

/// 超级块：
/// - 记录磁盘的大小与索引节点区域的大小；
/// - 持有空闲块链表的表头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SuperBlock {
    /// 文件系统占据块数
    pub total_blocks: u32,
    /// 索引节点区域占据块数
    pub inode_blocks: u32,
    /// 空闲块链表表头
    pub free_list: u32,
    pub total_inodes: u32,
    /// 魔数：用于校验文件系统合法性
    magic: u32,
}

impl SuperBlock {
    pub fn new(total_blocks: u32, total_inodes: u32) -> Self {
        let inode_blocks = total_inodes.div_ceil(INODES_PER_BLOCK as u32);
        Self {
            total_blocks,
            inode_blocks,
            free_list: FREE_LIST_END,
            total_inodes,
            magic: MAGIC,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    /// 数据区域的首个块
    #[inline]
    pub fn data_start(&self) -> u32 {
        1 + self.inode_blocks
    }

    /// 块是否位于数据区域
    #[inline]
    pub fn is_data_block(&self, block_id: u32) -> bool {
        (self.data_start()..self.total_blocks).contains(&block_id)
    }

    /// 检查从磁盘读出的布局是否自洽
    pub fn check(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Unformatted);
        }
        if self.total_blocks > MAX_BLOCKS || self.data_start() >= self.total_blocks {
            return Err(Error::Corrupted("disk geometry"));
        }
        if self.total_inodes == 0 || self.total_inodes > MAX_INODES {
            return Err(Error::Corrupted("inode count"));
        }
        if self.inode_blocks != self.total_inodes.div_ceil(INODES_PER_BLOCK as u32) {
            return Err(Error::Corrupted("inode area size"));
        }
        if !(is_list_end(self.free_list) || self.is_data_block(self.free_list)) {
            return Err(Error::Corrupted("free list head"));
        }
        Ok(())
    }
}

/// 链表以 -1 结尾，旧磁盘上的 0 同样视作结尾
#[inline]
pub fn is_list_end(block_id: u32) -> bool {
    block_id == FREE_LIST_END || block_id == 0
}
