//! # 文件系统层
//!
//! 对外的门面：格式化、挂载、打开、关闭、读写、定位、删除与同步。
//!
//! 锁的获取顺序：句柄 → 打开文件表 → 空闲空间 → 块缓存管理器 → 块缓存。

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use block_dev::BlockDevice;
use spin::Mutex;

use crate::block_cache::BlockCacheManager;
use crate::directory::{Directory, truncate_name};
use crate::file_table::{Access, FileHandle, FileTable, OpenMode};
use crate::free_map::FreeSpaceMap;
use crate::layout::{DiskInode, InodeId, InodeState, SuperBlock, block_id};
use crate::{BLOCK_SIZE, DataBlock, Error, MAX_FILE_SIZE, ROOT_NAME, Result, Violation};

pub struct FileSystem {
    cache: Arc<BlockCacheManager>,
    free_map: Mutex<FreeSpaceMap>,
    table: Arc<FileTable>,
}

/// 文件的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub inode: InodeId,
    /// 文件字节数
    pub size: u32,
    /// 占用的块数，含索引块
    pub blocks: u32,
    pub state: InodeState,
    pub open_count: u16,
}

impl FileSystem {
    /// 在设备上建立空的文件系统，设备原有内容全部作废
    pub fn mkfs(
        block_device: Arc<dyn BlockDevice>,
        total_blocks: u32,
        inodes: u32,
    ) -> Result<Self> {
        let cache = Arc::new(BlockCacheManager::new(block_device));
        let free_map = FreeSpaceMap::create(cache.clone(), total_blocks, inodes)?;
        let fs = Self::assemble(cache, free_map, Directory::new(inodes as usize));

        fs.sync()?;
        log::info!("mkfs: {total_blocks} blocks, {inodes} inodes");
        Ok(fs)
    }

    /// 挂载已有的文件系统
    pub fn mount(block_device: Arc<dyn BlockDevice>) -> Result<Self> {
        let cache = Arc::new(BlockCacheManager::new(block_device));
        let free_map = FreeSpaceMap::load(cache.clone())?;
        let inodes = free_map.super_block().total_inodes;

        // 上次没有正常关闭的句柄留下的计数与状态
        for id in 0..inodes {
            let inode_id = InodeId::from(id as u16);
            DiskInode::on_disk_mut(&cache, inode_id, |disk_inode| {
                let state = disk_inode.state();
                if disk_inode.count != 0 || !matches!(state, Ok(InodeState::Unused)) {
                    log::warn!(
                        "inode {inode_id}: reset stale count {} and state {state:?}",
                        disk_inode.count
                    );
                    disk_inode.count = 0;
                    disk_inode.set_state(InodeState::Unused);
                }
            })?;
        }

        let fs = Self::assemble(cache, free_map, Directory::new(inodes as usize));
        let directory = fs.read_root()?;
        if directory.is_empty() {
            log::warn!("mount: root file is empty, starting with an empty directory");
        } else {
            fs.table.load_directory(&directory)?;
        }
        fs.cache.sync_all()?;

        log::info!("mount: {} blocks, {inodes} inodes", fs.super_block().total_blocks);
        Ok(fs)
    }

    fn assemble(
        cache: Arc<BlockCacheManager>,
        free_map: FreeSpaceMap,
        directory: Directory,
    ) -> Self {
        Self {
            table: Arc::new(FileTable::new(cache.clone(), directory)),
            free_map: Mutex::new(free_map),
            cache,
        }
    }

    /// 重新格式化；等所有句柄关闭之后才会开始
    pub fn format(&self, inodes: u32) -> Result<()> {
        self.table.when_idle(|directory| {
            self.free_map.lock().format(inodes)?;
            *directory = Directory::new(inodes as usize);
            Ok(())
        })?;
        log::info!("format: {inodes} inodes");

        self.sync()
    }

    #[inline]
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<FileHandle> {
        self.open_until(name, mode, None)
    }

    /// 同 [`FileSystem::open`]，但最多等待 `timeout`
    #[inline]
    pub fn open_timeout(&self, name: &str, mode: OpenMode, timeout: Duration) -> Result<FileHandle> {
        self.open_until(name, mode, Some(Instant::now() + timeout))
    }

    fn open_until(&self, name: &str, mode: OpenMode, deadline: Option<Instant>) -> Result<FileHandle> {
        let handle = self.table.falloc(name, mode, deadline)?;

        if let Err(e) = self.prepare(&handle) {
            if let Err(close_err) = self.close(&handle) {
                log::error!("failed to close inode {}: {close_err}", handle.inode_id());
            }
            return Err(e);
        }
        self.cache.sync_all()?;

        Ok(handle)
    }

    /// 按打开方式调整新句柄：写入前清空文件，追加时定位到末尾
    fn prepare(&self, handle: &FileHandle) -> Result<()> {
        let mut state = handle.state();
        match handle.mode() {
            OpenMode::Read => {}
            OpenMode::Write => {
                // 只有唯一的句柄才能清空文件
                if state.inode.count != 1 {
                    log::warn!(
                        "refuse to truncate inode {}: {} handles",
                        handle.inode_id(),
                        state.inode.count
                    );
                    return Err(Error::Busy);
                }
                self.truncate(&mut state.inode, handle.inode_id())?;
            }
            OpenMode::Append => state.seek = state.inode.length,
        }
        Ok(())
    }

    /// 归还文件的全部数据块与索引块。
    ///
    /// inode 先放手并写回，块才回到空闲链表；写回失败时快照保持原样。
    fn truncate(&self, inode: &mut DiskInode, inode_id: InodeId) -> Result<()> {
        let previous = *inode;

        let index_block = inode.indirect();
        let mut released: Vec<u32> = match inode.unregister_index_block(&self.cache)? {
            Some(indirect_block) => indirect_block
                .iter()
                .filter_map(|&raw| block_id(raw))
                .collect(),
            None => Vec::new(),
        };
        released.extend(index_block);
        released.extend(inode.take_direct_blocks());
        inode.length = 0;

        if let Err(e) = inode.layout_to_disk(&self.cache, inode_id) {
            *inode = previous;
            return Err(e);
        }

        let mut free_map = self.free_map.lock();
        for (returned, &block) in released.iter().enumerate() {
            if let Err(e) = free_map.return_block(block) {
                log::error!(
                    "inode {inode_id}: {} blocks lost while truncating: {e}",
                    released.len() - returned
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// 关闭句柄；重复关闭返回假
    pub fn close(&self, handle: &FileHandle) -> Result<bool> {
        let mut state = handle.state();
        if state.closed {
            return Ok(false);
        }

        // 写回失败时句柄保持打开，可以再次关闭
        state.flush(&self.cache, handle.inode_id())?;
        let released = self.table.ffree(handle)?;
        state.closed = true;
        drop(state);

        self.cache.sync_all()?;
        Ok(released)
    }

    /// 从读写指针处读入 `buf`，返回读到的字节数；到达文件末尾时为 0
    pub fn read(&self, handle: &FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = handle.open_state()?;
        handle.check_access(Access::Read)?;

        let state = &mut *state;
        let length = state.inode.length;
        let mut read = 0;

        while read < buf.len() && state.seek < length {
            let block_offset = state.seek as usize % BLOCK_SIZE;
            let len = (BLOCK_SIZE - block_offset)
                .min(buf.len() - read)
                .min((length - state.seek) as usize);
            let block = state
                .inode
                .find_target_block(state.seek, &self.cache)?
                .ok_or(Error::Corrupted("hole inside file"))?;

            let dst = &mut buf[read..read + len];
            self.cache
                .get(block as usize)?
                .lock()
                .map(0, |data_block: &DataBlock| {
                    dst.copy_from_slice(&data_block[block_offset..block_offset + len])
                });

            read += len;
            state.seek += len as u32;
        }

        Ok(read)
    }

    /// 从读写指针处写入 `buf`，按需分配块。
    ///
    /// 中途失败时已写入的块保留，错误中带有已写入的字节数。
    pub fn write(&self, handle: &FileHandle, buf: &[u8]) -> Result<usize> {
        let mut state = handle.open_state()?;
        handle.check_access(Access::Write)?;

        let state = &mut *state;
        let before = state.inode;
        let mut written = 0;
        let outcome = self.write_blocks(&mut state.inode, &mut state.seek, buf, &mut written);
        if state.inode != before {
            state.dirty = true;
        }

        // 整个调用只写回一次 inode；失败时留给下一次写入或关闭
        let flushed = state.flush(&self.cache, handle.inode_id());
        if let Err(e) = &flushed {
            log::warn!("inode {}: layout update deferred: {e}", handle.inode_id());
        }
        let outcome = outcome
            .and(flushed)
            .and_then(|()| self.cache.sync_all());

        match outcome {
            Ok(()) => Ok(written),
            Err(source) if written > 0 => {
                log::warn!("write on inode {} aborted: {source}", handle.inode_id());
                Err(Error::PartialWrite {
                    written,
                    source: Box::new(source),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn write_blocks(
        &self,
        inode: &mut DiskInode,
        seek: &mut u32,
        buf: &[u8],
        written: &mut usize,
    ) -> Result<()> {
        while *written < buf.len() {
            if *seek as usize >= MAX_FILE_SIZE {
                return Err(Error::FileTooLarge);
            }

            let block_offset = *seek as usize % BLOCK_SIZE;
            let len = (BLOCK_SIZE - block_offset).min(buf.len() - *written);
            let block = match inode.find_target_block(*seek, &self.cache)? {
                Some(block) => block,
                None => self.allocate_block(inode, *seek)?,
            };

            let src = &buf[*written..*written + len];
            self.cache
                .get(block as usize)?
                .lock()
                .map_mut(0, |data_block: &mut DataBlock| {
                    data_block[block_offset..block_offset + len].copy_from_slice(src)
                });

            *written += len;
            *seek += len as u32;
            inode.length = inode.length.max(*seek);
        }

        Ok(())
    }

    /// 为 `offset` 所在的逻辑块分配数据块，需要时先分配索引块
    fn allocate_block(&self, inode: &mut DiskInode, offset: u32) -> Result<u32> {
        let mut free_map = self.free_map.lock();
        let block = free_map.get_free_block()?;

        match inode.register_target_block(offset, block, &self.cache) {
            Ok(()) => Ok(block),
            Err(Error::Protocol(Violation::IndirectMissing)) => {
                // 刚取到的块作为索引块
                match inode.register_index_block(block, &self.cache) {
                    Ok(true) => log::debug!("block {block} becomes an index block"),
                    Ok(false) => {
                        log::error!("index block requested before direct slots are full");
                        give_back(&mut free_map, block);
                        return Err(Violation::DirectsNotFull.into());
                    }
                    Err(e) => {
                        give_back(&mut free_map, block);
                        return Err(e);
                    }
                }

                let data_block = free_map.get_free_block()?;
                if let Err(e) = inode.register_target_block(offset, data_block, &self.cache) {
                    give_back(&mut free_map, data_block);
                    return Err(e);
                }
                Ok(data_block)
            }
            Err(e) => {
                if let Error::Protocol(violation) = &e {
                    log::error!("register block {block} at offset {offset}: {violation}");
                }
                give_back(&mut free_map, block);
                Err(e)
            }
        }
    }

    /// 移动读写指针，目标必须落在 `[0, 文件长度]` 之内
    pub fn seek(&self, handle: &FileHandle, pos: SeekFrom) -> Result<u32> {
        let mut state = handle.open_state()?;
        let length = i64::from(state.inode.length);

        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).ok(),
            SeekFrom::Current(delta) => i64::from(state.seek).checked_add(delta),
            SeekFrom::End(delta) => length.checked_add(delta),
        };
        match target {
            Some(target) if (0..=length).contains(&target) => {
                state.seek = target as u32;
                Ok(state.seek)
            }
            _ => Err(Error::InvalidSeek),
        }
    }

    /// 文件字节数
    pub fn fsize(&self, handle: &FileHandle) -> Result<u32> {
        Ok(handle.open_state()?.inode.length)
    }

    /// 删除文件：先以写方式打开以清空，再释放目录表项
    pub fn delete(&self, name: &str) -> Result<()> {
        let name = truncate_name(name);
        if name == ROOT_NAME {
            return Err(Error::PermissionDenied);
        }
        if self.table.lookup(name).is_none() {
            return Err(Error::NotFound);
        }

        let handle = self.open(name, OpenMode::Write)?;
        self.close(&handle)?;
        if !self.table.ifree(handle.inode_id())? {
            return Err(Error::NotFound);
        }
        log::debug!("deleted {name:?}");

        self.sync()
    }

    /// 把目录写入根文件，并把超级块与所有脏块写回设备
    pub fn sync(&self) -> Result<()> {
        let directory = self.table.directory_bytes();

        let root = self.open(ROOT_NAME, OpenMode::Write)?;
        let written = self.write(&root, &directory);
        self.close(&root)?;
        written?;

        self.free_map.lock().sync()
    }

    pub fn stat(&self, name: &str) -> Result<FileStat> {
        let inode_id = self.table.lookup(name).ok_or(Error::NotFound)?;
        let disk_inode = DiskInode::load(&self.cache, inode_id)?;

        Ok(FileStat {
            inode: inode_id,
            size: disk_inode.length,
            blocks: disk_inode.occupied_blocks(),
            state: disk_inode.state()?,
            open_count: disk_inode.count,
        })
    }

    /// 目录中的所有文件，含根 `/`
    #[inline]
    pub fn list(&self) -> Vec<(InodeId, String)> {
        self.table.entries()
    }

    #[inline]
    pub fn free_blocks(&self) -> Result<usize> {
        self.free_map.lock().free_blocks()
    }

    #[inline]
    pub fn super_block(&self) -> SuperBlock {
        *self.free_map.lock().super_block()
    }

    /// 打开的句柄数
    #[inline]
    pub fn open_handles(&self) -> usize {
        self.table.open_handles()
    }

    fn read_root(&self) -> Result<Vec<u8>> {
        let root = self.open(ROOT_NAME, OpenMode::Read)?;
        let mut bytes = vec![0; self.fsize(&root)? as usize];
        let read = self.read(&root, &mut bytes);
        self.close(&root)?;

        bytes.truncate(read?);
        Ok(bytes)
    }
}

/// 把没能登记的块放回空闲链表
fn give_back(free_map: &mut FreeSpaceMap, block: u32) {
    if let Err(e) = free_map.return_block(block) {
        log::error!("block {block} lost: {e}");
    }
}
