//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟缓冲区，
//! 把即将操作的块复制到内存中，提高对块设备的操作效率。
//! 同时，块缓存层也会尝试返回已缓存的块。
//!
//! 块缓存层对使用者来说是透明的，使用者对块设备的操作都经过块缓存层，
//! 且**操作块时一定在缓冲区当中**。
//!
//! 缓存由文件系统实例持有，而不是全局变量；写回失败以错误的形式返回。

use core::mem;
use std::sync::Arc;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::{BLOCK_SIZE, Result};

/// 块缓存管理器，缓存、调度块缓存
pub struct BlockCacheManager {
    block_device: Arc<dyn BlockDevice>,
    queue: Mutex<Vec<(usize, Arc<Mutex<BlockCache>>)>>,
}

/// 按 8 字节对齐的块数据，使得磁盘结构可以直接映射
#[repr(C, align(8))]
struct AlignedBlock([u8; BLOCK_SIZE]);

/// 内存中的块缓存
pub struct BlockCache {
    /// 缓存的数据
    data: AlignedBlock,
    /// 对应的块ID
    block_id: usize,
    /// 底层块设备的引用
    block_device: Arc<dyn BlockDevice>,
    /// 是否为脏块
    modified: bool,
}

impl BlockCacheManager {
    /// 块缓存个数的上限
    const CAPACITY: usize = 16;

    pub fn new(block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            block_device,
            queue: Mutex::new(Vec::with_capacity(Self::CAPACITY)),
        }
    }

    // 块缓存调度策略：踢走闲置块
    pub fn get(&self, block_id: usize) -> Result<Arc<Mutex<BlockCache>>> {
        let mut queue = self.queue.lock();

        // 尝试从缓冲区中读取块
        if let Some(cache) = queue
            .iter()
            .find_map(|(id, cache)| (block_id == *id).then_some(cache))
        {
            return Ok(Arc::clone(cache));
        };

        // 触及上限，写回一个块
        if queue.len() >= Self::CAPACITY {
            // 没有其它引用的才能写回；全部被占用时暂时越过上限
            if let Some(index) = queue
                .iter()
                .position(|(_, cache)| Arc::strong_count(cache) == 1)
            {
                queue[index].1.lock().sync()?;
                let (evicted, _) = queue.remove(index);
                log::trace!("evict block {evicted}");
            }
        }

        // 缓存新块
        let block_cache = Arc::new(Mutex::new(BlockCache::new(
            block_id,
            self.block_device.clone(),
        )?));
        queue.push((block_id, block_cache.clone()));

        Ok(block_cache)
    }

    pub fn sync_all(&self) -> Result<()> {
        self.queue
            .lock()
            .iter()
            .try_for_each(|(_, cache)| cache.lock().sync())
    }
}

impl BlockCache {
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut data = AlignedBlock([0; BLOCK_SIZE]);
        block_device.read_block(block_id, &mut data.0)?;

        Ok(Self {
            data,
            block_id,
            block_device,
            modified: false,
        })
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.modified {
            self.block_device.write_block(self.block_id, &self.data.0)?;
            self.modified = false;
        }
        Ok(())
    }

    pub fn get<T: Sized>(&self, offset: usize) -> &T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        let addr = unsafe { self.data.0.as_ptr().add(offset) }.cast::<T>();
        unsafe { &*addr }
    }

    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        self.modified = true;
        let addr = unsafe { self.data.0.as_mut_ptr().add(offset) }.cast::<T>();
        unsafe { &mut *addr }
    }

    #[inline]
    pub fn map<T: Sized, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T: Sized, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    #[inline]
    pub fn zeroize(&mut self) {
        self.data.0.fill(0);
        self.modified = true;
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            log::error!("lost block {} on drop: {e}", self.block_id);
        }
    }
}
