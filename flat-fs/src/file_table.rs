//! # 打开文件表
//!
//! 登记所有打开的句柄，并按 inode 上的准入状态决定读者与写者能否进入：
//! - 读者只在 `Unused`/`ReadLocked` 时进入；
//! - 写者只在 `Unused`/`UnusedPendingWriters` 时进入，
//!   否则把状态标记为“有写者等待”，让后来的读者排在它后面。
//!
//! 状态的检查与修改都在表锁之下，并直接改写磁盘上的记录，
//! 所以同一文件的多个句柄看到的引用计数与状态总是一致的。

use core::str::FromStr;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use enumflags2::{BitFlags, bitflags};
use spin::Mutex as SpinMutex;
use spin::MutexGuard as SpinMutexGuard;

use crate::block_cache::BlockCacheManager;
use crate::directory::{Directory, truncate_name};
use crate::{DiskInode, Error, InodeId, InodeState, ROOT_NAME, Result, Violation};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read = 0b01,
    Write = 0b10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// 打开时清空文件
    Write,
    /// 打开时定位到文件末尾
    Append,
}

impl OpenMode {
    #[inline]
    pub fn access(self) -> BitFlags<Access> {
        match self {
            Self::Read => Access::Read.into(),
            Self::Write | Self::Append => Access::Write.into(),
        }
    }

    #[inline]
    fn is_writer(self) -> bool {
        self.access().contains(Access::Write)
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "a" => Ok(Self::Append),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// 打开的文件。
///
/// 句柄持有 inode 的快照与读写指针；没有关闭就被丢弃时会自动释放。
pub struct FileHandle {
    id: u64,
    inode_id: InodeId,
    mode: OpenMode,
    state: SpinMutex<HandleState>,
    table: Arc<FileTable>,
}

pub(crate) struct HandleState {
    pub inode: DiskInode,
    pub seek: u32,
    /// 快照中的长度与块索引尚未写回
    pub dirty: bool,
    pub closed: bool,
}

impl HandleState {
    /// 把快照中的长度与块索引写回磁盘
    pub fn flush(&mut self, cache: &BlockCacheManager, inode_id: InodeId) -> Result<()> {
        if self.dirty {
            self.inode.layout_to_disk(cache, inode_id)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl FileHandle {
    #[inline]
    pub fn inode_id(&self) -> InodeId {
        self.inode_id
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// 句柄状态，不论是否已关闭
    #[inline]
    pub(crate) fn state(&self) -> SpinMutexGuard<'_, HandleState> {
        self.state.lock()
    }

    /// 仍然打开的句柄状态
    pub(crate) fn open_state(&self) -> Result<SpinMutexGuard<'_, HandleState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Violation::HandleClosed.into());
        }
        Ok(state)
    }

    /// 检查打开方式是否允许 `access`
    pub(crate) fn check_access(&self, access: Access) -> Result<()> {
        if self.mode.access().contains(access) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.state.get_mut().closed {
            return;
        }

        log::warn!("handle {} on inode {} dropped while open", self.id, self.inode_id);
        let inode_id = self.inode_id;
        if let Err(e) = self.state.get_mut().flush(&self.table.cache, inode_id) {
            log::error!("inode {inode_id}: lost layout update: {e}");
        }

        let released = self
            .table
            .ffree(self)
            .and_then(|_| self.table.cache.sync_all());
        if let Err(e) = released {
            log::error!("failed to release handle {}: {e}", self.id);
        }
    }
}

pub struct FileTable {
    cache: Arc<BlockCacheManager>,
    inner: Mutex<TableInner>,
    /// 有句柄释放或写者放弃等待时唤醒所有等待者
    released: Condvar,
}

struct TableInner {
    directory: Directory,
    /// 句柄ID -> inode
    open: BTreeMap<u64, InodeId>,
    /// 各 inode 上正在等待的写者数
    waiting_writers: BTreeMap<InodeId, usize>,
    next_id: u64,
}

/// 一次准入检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admit(InodeState),
    Wait(InodeState),
}

impl FileTable {
    pub fn new(cache: Arc<BlockCacheManager>, directory: Directory) -> Self {
        Self {
            cache,
            inner: Mutex::new(TableInner {
                directory,
                open: BTreeMap::new(),
                waiting_writers: BTreeMap::new(),
                next_id: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// 打开文件，必要时阻塞直到准入或超过 `deadline`
    pub fn falloc(
        self: &Arc<Self>,
        name: &str,
        mode: OpenMode,
        deadline: Option<Instant>,
    ) -> Result<FileHandle> {
        let name = truncate_name(name);
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.lock();
        // 写者登记在哪个 inode 上等待
        let mut queued: Option<InodeId> = None;

        let (inode_id, inode) = loop {
            let resolved = Self::resolve(&mut inner, &self.cache, name, mode);
            let inode_id = match resolved {
                Ok(inode_id) => inode_id,
                Err(e) => {
                    if let Some(stale) = queued {
                        self.withdraw(&mut inner, stale)?;
                    }
                    return Err(e);
                }
            };
            // 等待期间文件被删除并换了编号
            if let Some(stale) = queued.filter(|&stale| stale != inode_id) {
                self.withdraw(&mut inner, stale)?;
                queued = None;
            }

            if let Some(id) = queued {
                inner.leave_queue(id);
            }
            let writers_behind = inner.waiting_writers.contains_key(&inode_id);

            let decision = DiskInode::on_disk_mut(&self.cache, inode_id, |disk_inode| {
                let decision = admit(disk_inode.state()?, mode, writers_behind);
                match decision {
                    Admission::Admit(state) => {
                        disk_inode.count += 1;
                        disk_inode.set_state(state);
                    }
                    Admission::Wait(state) => disk_inode.set_state(state),
                }
                Ok::<_, Error>((decision, *disk_inode))
            })?;
            let (decision, inode) = match decision {
                Ok(decided) => decided,
                Err(e) => {
                    if let Some(id) = queued {
                        inner.join_queue(id);
                        self.withdraw(&mut inner, id)?;
                    }
                    return Err(e);
                }
            };

            match decision {
                Admission::Admit(state) => {
                    log::debug!("{mode:?} on inode {inode_id} admitted, now {state}");
                    break (inode_id, inode);
                }
                Admission::Wait(state) => {
                    log::debug!("{mode:?} on inode {inode_id} waits, inode is {state}");
                    if mode.is_writer() {
                        inner.join_queue(inode_id);
                        queued = Some(inode_id);
                    }
                }
            }

            inner = match deadline {
                None => self
                    .released
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some(id) = queued {
                            self.withdraw(&mut inner, id)?;
                        }
                        log::debug!("{mode:?} on inode {inode_id} timed out");
                        return Err(Error::TimedOut);
                    }
                    self.released
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };

        let id = inner.next_id;
        inner.next_id += 1;
        inner.open.insert(id, inode_id);

        Ok(FileHandle {
            id,
            inode_id,
            mode,
            state: SpinMutex::new(HandleState {
                inode,
                seek: 0,
                dirty: false,
                closed: false,
            }),
            table: Arc::clone(self),
        })
    }

    /// 注销句柄；句柄不在表中时返回假
    pub fn ffree(&self, handle: &FileHandle) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.open.contains_key(&handle.id) {
            return Ok(false);
        }

        let inode_id = handle.inode_id;
        let state = DiskInode::on_disk_mut(&self.cache, inode_id, |disk_inode| {
            disk_inode.count = disk_inode.count.saturating_sub(1);
            if disk_inode.count == 0 {
                // 状态可能已损坏，照样把它放回空闲
                let state = match disk_inode.state() {
                    Ok(state) if state.has_pending_writers() => InodeState::UnusedPendingWriters,
                    _ => InodeState::Unused,
                };
                disk_inode.set_state(state);
            }
            disk_inode.state()
        })?;
        // 计数写不进去时句柄仍留在表中，可以再次释放
        inner.open.remove(&handle.id);
        drop(inner);
        self.released.notify_all();

        let state = state?;
        log::debug!("handle {} released inode {inode_id}, now {state}", handle.id);
        Ok(true)
    }

    /// 等到没有任何打开的句柄，再在表锁之下改写目录
    pub fn when_idle<V>(&self, f: impl FnOnce(&mut Directory) -> Result<V>) -> Result<V> {
        let mut inner = self.lock();
        while !inner.open.is_empty() {
            inner = self
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        f(&mut inner.directory)
    }

    /// 释放目录表项并清空 inode 记录；文件仍被打开时拒绝
    pub fn ifree(&self, inode_id: InodeId) -> Result<bool> {
        let mut inner = self.lock();
        if inner.open.values().any(|&id| id == inode_id)
            || inner.waiting_writers.contains_key(&inode_id)
        {
            return Err(Error::Busy);
        }
        if !inner.directory.free(inode_id) {
            return Ok(false);
        }

        DiskInode::default().to_disk(&self.cache, inode_id)?;
        log::debug!("inode {inode_id} freed");
        Ok(true)
    }

    pub fn lookup(&self, name: &str) -> Option<InodeId> {
        self.lock().directory.lookup(truncate_name(name))
    }

    pub fn entries(&self) -> Vec<(InodeId, String)> {
        self.lock()
            .directory
            .entries()
            .map(|(id, name)| (id, Cow::into_owned(name)))
            .collect()
    }

    pub fn directory_bytes(&self) -> Vec<u8> {
        self.lock().directory.serialize()
    }

    pub fn load_directory(&self, bytes: &[u8]) -> Result<()> {
        self.lock().directory.deserialize(bytes)
    }

    /// 打开的句柄数
    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 把名字解析为 inode；写者遇到不存在的名字时新建文件
    fn resolve(
        inner: &mut TableInner,
        cache: &BlockCacheManager,
        name: &str,
        mode: OpenMode,
    ) -> Result<InodeId> {
        if name == ROOT_NAME {
            return Ok(InodeId::ROOT);
        }
        if let Some(inode_id) = inner.directory.lookup(name) {
            return Ok(inode_id);
        }
        if !mode.is_writer() {
            return Err(Error::NotFound);
        }

        let inode_id = inner.directory.allocate(name)?;
        if let Err(e) = DiskInode::default().to_disk(cache, inode_id) {
            inner.directory.free(inode_id);
            return Err(e);
        }
        log::debug!("created {name:?} as inode {inode_id}");

        Ok(inode_id)
    }

    /// 写者放弃等待；若再没有写者等待，撤去 inode 上的排队标记
    fn withdraw(&self, inner: &mut TableInner, inode_id: InodeId) -> Result<()> {
        if inner.leave_queue(inode_id) {
            DiskInode::on_disk_mut(&self.cache, inode_id, |disk_inode| {
                let state = disk_inode.state()?;
                disk_inode.set_state(state.without_pending_writers());
                Ok::<_, Error>(())
            })??;
            log::debug!("no writer waits on inode {inode_id} any more");
        }

        self.released.notify_all();
        Ok(())
    }
}

impl TableInner {
    fn join_queue(&mut self, inode_id: InodeId) {
        *self.waiting_writers.entry(inode_id).or_default() += 1;
    }

    /// 离开等待队列，返回该 inode 上是否已无写者等待
    fn leave_queue(&mut self, inode_id: InodeId) -> bool {
        let Some(waiting) = self.waiting_writers.get_mut(&inode_id) else {
            return true;
        };
        *waiting -= 1;
        if *waiting == 0 {
            self.waiting_writers.remove(&inode_id);
            true
        } else {
            false
        }
    }
}

/// 准入状态机：`writers_behind` 表示除自己之外还有写者在等待
fn admit(state: InodeState, mode: OpenMode, writers_behind: bool) -> Admission {
    use InodeState::*;

    if !mode.is_writer() {
        return match state {
            Unused | ReadLocked => Admission::Admit(ReadLocked),
            _ => Admission::Wait(state),
        };
    }

    match state {
        Unused | UnusedPendingWriters if writers_behind => {
            Admission::Admit(WriteLockedPendingWriters)
        }
        Unused | UnusedPendingWriters => Admission::Admit(WriteLocked),
        _ => Admission::Wait(state.with_pending_writers()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use block_dev::RamDisk;

    use super::*;
    use crate::free_map::FreeSpaceMap;

    fn table(inodes: usize) -> Arc<FileTable> {
        let cache = Arc::new(BlockCacheManager::new(Arc::new(RamDisk::new(64))));
        FreeSpaceMap::create(cache.clone(), 64, inodes as u32).unwrap();
        Arc::new(FileTable::new(cache, Directory::new(inodes)))
    }

    fn on_disk(table: &FileTable, inode_id: InodeId) -> (u16, InodeState) {
        let inode = DiskInode::load(&table.cache, inode_id).unwrap();
        (inode.count, inode.state().unwrap())
    }

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(20))
    }

    #[test]
    fn parses_modes() {
        assert_eq!(OpenMode::Read, "r".parse::<OpenMode>().unwrap());
        assert_eq!(OpenMode::Append, "a".parse::<OpenMode>().unwrap());
        assert!(matches!("rw".parse::<OpenMode>(), Err(Error::InvalidArgument)));
        assert_eq!(BitFlags::from(Access::Write), OpenMode::Append.access());
    }

    #[test]
    fn admission_table() {
        use InodeState::*;

        for state in [Unused, ReadLocked] {
            assert_eq!(Admission::Admit(ReadLocked), admit(state, OpenMode::Read, false));
        }
        for state in [WriteLocked, UnusedPendingWriters, ReadLockedPendingWriters] {
            assert_eq!(Admission::Wait(state), admit(state, OpenMode::Read, false));
        }

        assert_eq!(Admission::Admit(WriteLocked), admit(Unused, OpenMode::Write, false));
        assert_eq!(
            Admission::Admit(WriteLocked),
            admit(UnusedPendingWriters, OpenMode::Append, false)
        );
        assert_eq!(
            Admission::Admit(WriteLockedPendingWriters),
            admit(UnusedPendingWriters, OpenMode::Write, true)
        );
        assert_eq!(
            Admission::Wait(ReadLockedPendingWriters),
            admit(ReadLocked, OpenMode::Write, false)
        );
        assert_eq!(
            Admission::Wait(WriteLockedPendingWriters),
            admit(WriteLockedPendingWriters, OpenMode::Write, true)
        );
    }

    #[test]
    fn readers_share_and_release() {
        let table = table(4);
        let writer = table.falloc("f", OpenMode::Write, None).unwrap();
        let inode_id = writer.inode_id();
        assert_eq!((1, InodeState::WriteLocked), on_disk(&table, inode_id));
        assert!(table.ffree(&writer).unwrap());
        assert!(!table.ffree(&writer).unwrap());
        writer.state().closed = true;

        let first = table.falloc("f", OpenMode::Read, None).unwrap();
        let second = table.falloc("f", OpenMode::Read, None).unwrap();
        assert_eq!((2, InodeState::ReadLocked), on_disk(&table, inode_id));

        table.ffree(&first).unwrap();
        assert_eq!((1, InodeState::ReadLocked), on_disk(&table, inode_id));
        table.ffree(&second).unwrap();
        assert_eq!((0, InodeState::Unused), on_disk(&table, inode_id));

        first.state().closed = true;
        second.state().closed = true;
    }

    #[test]
    fn reading_missing_file() {
        let table = table(4);
        assert!(matches!(
            table.falloc("ghost", OpenMode::Read, None),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            table.falloc("", OpenMode::Write, None),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(None, table.lookup("ghost"));
    }

    #[test]
    fn timed_out_writer_withdraws() {
        let table = table(4);
        let reader = {
            let writer = table.falloc("f", OpenMode::Write, None).unwrap();
            drop(writer);
            table.falloc("f", OpenMode::Read, None).unwrap()
        };
        let inode_id = reader.inode_id();

        assert!(matches!(
            table.falloc("f", OpenMode::Write, soon()),
            Err(Error::TimedOut)
        ));
        // 没有写者再等，读者又可以进入
        assert_eq!((1, InodeState::ReadLocked), on_disk(&table, inode_id));
        let another = table.falloc("f", OpenMode::Read, soon()).unwrap();
        assert_eq!(2, on_disk(&table, inode_id).0);

        drop(another);
        drop(reader);
        assert_eq!((0, InodeState::Unused), on_disk(&table, inode_id));
    }

    #[test]
    fn second_writer_times_out() {
        let table = table(4);
        let writer = table.falloc("f", OpenMode::Append, None).unwrap();
        assert!(matches!(
            table.falloc("f", OpenMode::Write, soon()),
            Err(Error::TimedOut)
        ));
        assert!(matches!(
            table.falloc("f", OpenMode::Read, soon()),
            Err(Error::TimedOut)
        ));
        assert_eq!(
            (1, InodeState::WriteLocked),
            on_disk(&table, writer.inode_id())
        );
    }

    #[test]
    fn ifree_refuses_open_files() {
        let table = table(4);
        let handle = table.falloc("f", OpenMode::Write, None).unwrap();
        let inode_id = handle.inode_id();
        assert!(matches!(table.ifree(inode_id), Err(Error::Busy)));

        drop(handle);
        assert_eq!(0, table.open_handles());
        assert!(table.ifree(inode_id).unwrap());
        assert!(!table.ifree(inode_id).unwrap());
        assert_eq!(None, table.lookup("f"));
    }

    #[test]
    fn directory_fills_up() {
        let table = table(2);
        let handle = table.falloc("a", OpenMode::Write, None).unwrap();
        assert!(matches!(
            table.falloc("b", OpenMode::Write, None),
            Err(Error::NoFreeInode)
        ));
        drop(handle);
        assert_eq!(2, table.entries().len());
    }
}
