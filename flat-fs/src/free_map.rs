//! # 空闲空间管理
//!
//! 超级块之后是索引节点区域，其余的块都是数据块。
//! 空闲的数据块串成单链表：每个空闲块的头 4 字节存放下一个空闲块的编号，
//! 表头记录在超级块中。

use std::sync::Arc;

use crate::block_cache::BlockCacheManager;
use crate::directory::Directory;
use crate::layout::{DiskInode, FREE_LIST_END, SuperBlock, is_list_end};
use crate::{BLOCK_SIZE, DIRECT_COUNT, MAX_FILE_SIZE};
use crate::{Error, INODES_PER_BLOCK, MAX_BLOCKS, MAX_INODES, Result, Violation};

pub struct FreeSpaceMap {
    cache: Arc<BlockCacheManager>,
    super_block: SuperBlock,
}

impl FreeSpaceMap {
    /// 在 `total_blocks` 块的磁盘上建立布局
    pub fn create(cache: Arc<BlockCacheManager>, total_blocks: u32, inodes: u32) -> Result<Self> {
        let mut free_map = Self {
            cache,
            super_block: SuperBlock::new(total_blocks, inodes),
        };
        free_map.format(inodes)?;
        Ok(free_map)
    }

    /// 读取并校验超级块
    pub fn load(cache: Arc<BlockCacheManager>) -> Result<Self> {
        let super_block = cache
            .get(0)?
            .lock()
            .map(0, |super_block: &SuperBlock| *super_block);
        super_block.check()?;

        Ok(Self { cache, super_block })
    }

    #[inline]
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    /// 重新划分索引节点区域，清空所有 inode，并把其余块全部串入空闲链表
    pub fn format(&mut self, inodes: u32) -> Result<()> {
        let total_blocks = self.super_block.total_blocks;
        let mut super_block = checked_layout(total_blocks, inodes)?;

        for block_id in 1..super_block.data_start() {
            self.cache.get(block_id as usize)?.lock().map_mut(
                0,
                |disk_inodes: &mut [DiskInode; INODES_PER_BLOCK]| {
                    disk_inodes.fill(DiskInode::default())
                },
            );
        }

        for block_id in super_block.data_start()..total_blocks {
            let next = if block_id + 1 < total_blocks {
                block_id + 1
            } else {
                FREE_LIST_END
            };
            self.cache
                .get(block_id as usize)?
                .lock()
                .map_mut(0, |next_free: &mut u32| *next_free = next);
        }

        super_block.free_list = super_block.data_start();
        self.super_block = super_block;
        log::debug!(
            "format: {total_blocks} blocks, {inodes} inodes in {} blocks",
            self.super_block.inode_blocks
        );

        self.sync()
    }

    /// 从空闲链表头部取出一个块，并把它清零
    pub fn get_free_block(&mut self) -> Result<u32> {
        let head = self.super_block.free_list;
        if is_list_end(head) {
            return Err(Error::NoFreeBlock);
        }
        if !self.super_block.is_data_block(head) {
            return Err(Error::Corrupted("free list entry"));
        }

        let block = self.cache.get(head as usize)?;
        let next = block.lock().map(0, |next_free: &u32| *next_free);

        // 离开链表之后才能清零
        self.set_free_list(next)?;
        block.lock().zeroize();
        log::trace!("alloc block {head}");

        Ok(head)
    }

    /// 把块放回空闲链表头部。
    ///
    /// 重复归还同一个块会让链表成环，调用者必须保证这一点。
    pub fn return_block(&mut self, block_id: u32) -> Result<()> {
        if !self.super_block.is_data_block(block_id) {
            log::error!("refuse to free block {block_id} outside the data area");
            return Err(Violation::ForeignBlock.into());
        }
        debug_assert_ne!(block_id, self.super_block.free_list, "double free");

        let head = self.super_block.free_list;
        self.cache
            .get(block_id as usize)?
            .lock()
            .map_mut(0, |next_free: &mut u32| *next_free = head);

        self.set_free_list(block_id)?;
        log::trace!("free block {block_id}");

        Ok(())
    }

    /// 沿链表统计空闲块个数
    pub fn free_blocks(&self) -> Result<usize> {
        let limit = self.super_block.total_blocks as usize;
        let mut count = 0;
        let mut block_id = self.super_block.free_list;

        while !is_list_end(block_id) {
            if !self.super_block.is_data_block(block_id) {
                return Err(Error::Corrupted("free list entry"));
            }
            count += 1;
            if count > limit {
                return Err(Error::Corrupted("free list cycle"));
            }
            block_id = self
                .cache
                .get(block_id as usize)?
                .lock()
                .map(0, |next_free: &u32| *next_free);
        }

        Ok(count)
    }

    /// 把超级块写回磁盘
    pub fn sync(&self) -> Result<()> {
        self.store_super_block()?;
        self.cache.sync_all()
    }

    fn store_super_block(&self) -> Result<()> {
        Self::store(&self.cache, &self.super_block)
    }

    /// 新的表头写进超级块所在的缓存之后，内存中的表头才随之改变
    fn set_free_list(&mut self, head: u32) -> Result<()> {
        let mut super_block = self.super_block;
        super_block.free_list = head;
        Self::store(&self.cache, &super_block)?;
        self.super_block = super_block;
        Ok(())
    }

    fn store(cache: &BlockCacheManager, super_block: &SuperBlock) -> Result<()> {
        cache
            .get(0)?
            .lock()
            .map_mut(0, |on_disk: &mut SuperBlock| *on_disk = *super_block);
        Ok(())
    }
}

/// 校验磁盘大小与 inode 个数，返回对应的布局。
///
/// 目录保存在根文件中，所以它的大小受单个文件的上限约束，
/// 数据区域也至少要放得下根文件。
fn checked_layout(total_blocks: u32, inodes: u32) -> Result<SuperBlock> {
    if total_blocks > MAX_BLOCKS || inodes == 0 || inodes > MAX_INODES {
        return Err(Error::InvalidArgument);
    }

    let super_block = SuperBlock::new(total_blocks, inodes);
    if super_block.data_start() >= total_blocks {
        return Err(Error::InvalidArgument);
    }

    let root_len = Directory::disk_len(inodes as usize);
    let root_data = root_len.div_ceil(BLOCK_SIZE);
    let root_blocks = root_data + usize::from(root_data > DIRECT_COUNT);
    let data_blocks = (total_blocks - super_block.data_start()) as usize;
    if root_len > MAX_FILE_SIZE || root_blocks > data_blocks {
        log::warn!("{inodes} inodes need a {root_len}-byte directory, which does not fit");
        return Err(Error::InvalidArgument);
    }

    Ok(super_block)
}
