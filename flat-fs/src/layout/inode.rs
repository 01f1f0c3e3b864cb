//! 索引节点
//!
//! 每个 inode 描述一个文件，固定 32 字节，每块存放 16 个。
//! - 直接索引：11 个块编号，必须从 0 号开始连续填充；
//! - 一级间接索引：一个索引块，整块连续存放 256 个 2 字节的块编号。
//!
//! 未使用的块编号记作 -1。
//!
//! ## 块索引编码
//!
//! 偏移量除以块大小得到逻辑块号 `slot`：
//! `slot < 11` 时直接查 `direct`，否则查索引块的第 `slot - 11` 项。

use core::fmt;

use derive_more::{Display, From, Into};

use crate::block_cache::BlockCacheManager;
use crate::{BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, INODE_SIZE, INODES_PER_BLOCK};
use crate::{Error, Result, Violation};

/// 间接索引块
pub type IndirectBlock = [i16; INDIRECT_COUNT];

/// 未使用的块编号
const UNSET: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
pub struct InodeId(u16);

impl InodeId {
    /// 根文件 `/` 固定占据 0 号 inode，其内容是目录
    pub const ROOT: Self = Self(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// 通过ID获取 inode 在磁盘上的位置：**块ID**以及**块内偏移**
    #[inline]
    pub fn disk_pos(self) -> (usize, usize) {
        let id = self.index();
        (1 + id / INODES_PER_BLOCK, id % INODES_PER_BLOCK * INODE_SIZE)
    }
}

/// 读写者准入状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum InodeState {
    #[default]
    Unused = 0,
    ReadLocked = 1,
    WriteLocked = 2,
    /// 写者刚离开，且有写者在等待
    UnusedPendingWriters = 3,
    ReadLockedPendingWriters = 4,
    WriteLockedPendingWriters = 5,
}

impl InodeState {
    /// 有写者排队时的对应状态
    pub fn with_pending_writers(self) -> Self {
        match self {
            Self::Unused => Self::UnusedPendingWriters,
            Self::ReadLocked => Self::ReadLockedPendingWriters,
            Self::WriteLocked => Self::WriteLockedPendingWriters,
            pending => pending,
        }
    }

    /// 撤去排队标记后的状态
    pub fn without_pending_writers(self) -> Self {
        match self {
            Self::UnusedPendingWriters => Self::Unused,
            Self::ReadLockedPendingWriters => Self::ReadLocked,
            Self::WriteLockedPendingWriters => Self::WriteLocked,
            plain => plain,
        }
    }

    #[inline]
    pub fn has_pending_writers(self) -> bool {
        self != self.without_pending_writers()
    }
}

impl TryFrom<u16> for InodeState {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => Self::Unused,
            1 => Self::ReadLocked,
            2 => Self::WriteLocked,
            3 => Self::UnusedPendingWriters,
            4 => Self::ReadLockedPendingWriters,
            5 => Self::WriteLockedPendingWriters,
            _ => return Err(Error::Corrupted("inode state")),
        })
    }
}

impl fmt::Display for InodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unused => "unused",
            Self::ReadLocked => "read-locked",
            Self::WriteLocked => "write-locked",
            Self::UnusedPendingWriters => "unused, writers pending",
            Self::ReadLockedPendingWriters => "read-locked, writers pending",
            Self::WriteLockedPendingWriters => "write-locked, writers pending",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DiskInode {
    /// 文件字节数
    pub length: u32,
    /// 引用此 inode 的打开句柄数
    pub count: u16,
    /// 准入状态，见 [`InodeState`]
    state: u16,
    /// 直接索引块，包含 DIRECT_COUNT 个块编号
    direct: [i16; DIRECT_COUNT],
    /// 指向一个一级索引块
    indirect: i16,
}

impl Default for DiskInode {
    fn default() -> Self {
        Self {
            length: 0,
            count: 0,
            state: InodeState::Unused as u16,
            direct: [UNSET; DIRECT_COUNT],
            indirect: UNSET,
        }
    }
}

impl DiskInode {
    /// 读取对磁盘的映射并处理
    pub fn on_disk<V>(
        cache: &BlockCacheManager,
        id: InodeId,
        f: impl FnOnce(&DiskInode) -> V,
    ) -> Result<V> {
        let (block_id, offset) = id.disk_pos();
        Ok(cache.get(block_id)?.lock().map(offset, f))
    }

    /// 以某种方式修改对磁盘的映射，整个过程持有所在块的锁
    pub fn on_disk_mut<V>(
        cache: &BlockCacheManager,
        id: InodeId,
        f: impl FnOnce(&mut DiskInode) -> V,
    ) -> Result<V> {
        let (block_id, offset) = id.disk_pos();
        Ok(cache.get(block_id)?.lock().map_mut(offset, f))
    }

    #[inline]
    pub fn load(cache: &BlockCacheManager, id: InodeId) -> Result<Self> {
        Self::on_disk(cache, id, |disk_inode| *disk_inode)
    }

    /// 整条记录写回磁盘
    #[inline]
    pub fn to_disk(&self, cache: &BlockCacheManager, id: InodeId) -> Result<()> {
        Self::on_disk_mut(cache, id, |disk_inode| *disk_inode = *self)
    }

    /// 只写回长度与块索引；引用计数与准入状态归打开文件表管理
    pub fn layout_to_disk(&self, cache: &BlockCacheManager, id: InodeId) -> Result<()> {
        Self::on_disk_mut(cache, id, |disk_inode| {
            disk_inode.length = self.length;
            disk_inode.direct = self.direct;
            disk_inode.indirect = self.indirect;
        })
    }

    #[inline]
    pub fn state(&self) -> Result<InodeState> {
        InodeState::try_from(self.state)
    }

    #[inline]
    pub fn set_state(&mut self, state: InodeState) {
        self.state = state as u16;
    }

    #[inline]
    pub fn direct(&self) -> &[i16; DIRECT_COUNT] {
        &self.direct
    }

    /// 索引块编号
    #[inline]
    pub fn indirect(&self) -> Option<u32> {
        block_id(self.indirect)
    }

    /// 文件占用的块数（数据块与索引块）
    pub fn occupied_blocks(&self) -> u32 {
        let data_blocks = self.length.div_ceil(BLOCK_SIZE as u32);
        data_blocks + u32::from(self.indirect().is_some())
    }

    /// 逻辑上 inode 指向一系列数据块，此处传入文件内的字节偏移，
    /// 返回给**块缓存层**使用的ID；未分配则为空
    pub fn find_target_block(&self, offset: u32, cache: &BlockCacheManager) -> Result<Option<u32>> {
        let slot = offset as usize / BLOCK_SIZE;

        if slot < DIRECT_COUNT {
            return Ok(block_id(self.direct[slot]));
        }

        let index = slot - DIRECT_COUNT;
        let Some(indirect) = self.indirect() else {
            return Ok(None);
        };
        if index >= INDIRECT_COUNT {
            return Ok(None);
        }

        let entry = cache
            .get(indirect as usize)?
            .lock()
            .map(0, |indirect_block: &IndirectBlock| indirect_block[index]);
        Ok(block_id(entry))
    }

    /// 把 `block` 登记为 `offset` 所在的逻辑块。
    ///
    /// 直接索引必须按顺序填充；超出直接索引时须先用
    /// [`DiskInode::register_index_block`] 登记索引块。
    pub fn register_target_block(
        &mut self,
        offset: u32,
        block: u32,
        cache: &BlockCacheManager,
    ) -> Result<()> {
        let slot = offset as usize / BLOCK_SIZE;
        let raw = raw_block_id(block)?;

        if slot < DIRECT_COUNT {
            if self.direct[slot] != UNSET {
                return Err(Violation::SlotRegistered.into());
            }
            if slot > 0 && self.direct[slot - 1] == UNSET {
                return Err(Violation::PriorSlotEmpty.into());
            }

            self.direct[slot] = raw;
            return Ok(());
        }

        let index = slot - DIRECT_COUNT;
        if index >= INDIRECT_COUNT {
            return Err(Error::FileTooLarge);
        }
        let Some(indirect) = self.indirect() else {
            return Err(Violation::IndirectMissing.into());
        };

        cache
            .get(indirect as usize)?
            .lock()
            .map_mut(0, |indirect_block: &mut IndirectBlock| {
                let existing = indirect_block[index];
                if existing >= 0 {
                    log::error!(
                        "index block {indirect}: slot {index} already holds block {existing}"
                    );
                    return Err(Error::Protocol(Violation::SlotRegistered));
                }
                if index > 0 && indirect_block[index - 1] == UNSET {
                    return Err(Error::Protocol(Violation::PriorSlotEmpty));
                }

                indirect_block[index] = raw;
                Ok(())
            })
    }

    /// 登记索引块，并把其中所有编号初始化为 -1。
    ///
    /// 直接索引未填满时返回假；已有索引块时视为成功。
    pub fn register_index_block(&mut self, block: u32, cache: &BlockCacheManager) -> Result<bool> {
        if self.direct.contains(&UNSET) {
            return Ok(false);
        }
        if self.indirect().is_some() {
            return Ok(true);
        }

        let raw = raw_block_id(block)?;
        cache
            .get(block as usize)?
            .lock()
            .map_mut(0, |indirect_block: &mut IndirectBlock| {
                indirect_block.fill(UNSET)
            });
        self.indirect = raw;

        Ok(true)
    }

    /// 撤销索引块，返回其内容供调用者回收其中的块
    pub fn unregister_index_block(
        &mut self,
        cache: &BlockCacheManager,
    ) -> Result<Option<IndirectBlock>> {
        let Some(indirect) = self.indirect() else {
            return Ok(None);
        };

        let indirect_block = cache
            .get(indirect as usize)?
            .lock()
            .map(0, |indirect_block: &IndirectBlock| *indirect_block);
        self.indirect = UNSET;

        Ok(Some(indirect_block))
    }

    /// 清空直接索引，返回原先登记的块
    pub fn take_direct_blocks(&mut self) -> Vec<u32> {
        let blocks = self.direct.iter().filter_map(|&raw| block_id(raw)).collect();
        self.direct.fill(UNSET);
        blocks
    }
}

/// 磁盘上的块编号转为块ID，负数表示未分配
#[inline]
pub fn block_id(raw: i16) -> Option<u32> {
    u32::try_from(raw).ok()
}

#[inline]
fn raw_block_id(block: u32) -> Result<i16> {
    i16::try_from(block).map_err(|_| Violation::ForeignBlock.into())
}
