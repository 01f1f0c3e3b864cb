//! # 目录
//!
//! 单层目录，按 inode 编号排列的 `(长度, 文件名)` 表；长度为 0 的表项空闲。
//! 0 号表项永远是根 `/`。
//!
//! 目录以根文件的内容保存在磁盘上：
//! 先是 `N` 个 4 字节的长度，再是 `N` 个 60 字节的文件名槽。

use std::borrow::Cow;

use crate::{Error, InodeId, NAME_MAX_LEN, ROOT_NAME, Result};

/// 每个文件名槽的字节数
const NAME_SLOT: usize = NAME_MAX_LEN * 2;
const SIZE_FIELD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// 各表项文件名的字节数
    sizes: Vec<u32>,
    names: Vec<[u8; NAME_MAX_LEN]>,
}

impl Directory {
    /// 空目录，只含根 `/`
    pub fn new(capacity: usize) -> Self {
        let mut directory = Self {
            sizes: vec![0; capacity],
            names: vec![[0; NAME_MAX_LEN]; capacity],
        };
        directory.set(InodeId::ROOT.index(), ROOT_NAME.as_bytes());
        directory
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.sizes.len()
    }

    /// 容量为 `capacity` 的目录在根文件中占据的字节数
    #[inline]
    pub fn disk_len(capacity: usize) -> usize {
        capacity * (SIZE_FIELD + NAME_SLOT)
    }

    /// 为文件名分配第一个空闲表项，过长的文件名会被截断
    pub fn allocate(&mut self, name: &str) -> Result<InodeId> {
        let name = truncate_name(name);
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let index = self
            .sizes
            .iter()
            .position(|&size| size == 0)
            .ok_or(Error::NoFreeInode)?;
        self.set(index, name.as_bytes());

        Ok(inode_id(index))
    }

    /// 释放表项；表项本就空闲或是根时返回假
    pub fn free(&mut self, id: InodeId) -> bool {
        let index = id.index();
        match self.sizes.get(index) {
            Some(&size) if size > 0 && id != InodeId::ROOT => {
                self.set(index, &[]);
                true
            }
            _ => false,
        }
    }

    /// 按名字精确查找
    pub fn lookup(&self, name: &str) -> Option<InodeId> {
        let name = name.as_bytes();
        if name.is_empty() {
            return None;
        }

        self.sizes
            .iter()
            .zip(&self.names)
            .position(|(&size, slot)| size as usize == name.len() && &slot[..name.len()] == name)
            .map(inode_id)
    }

    /// 文件名
    pub fn name(&self, id: InodeId) -> Option<Cow<'_, str>> {
        let size = *self.sizes.get(id.index())? as usize;
        (size > 0).then(|| String::from_utf8_lossy(&self.names[id.index()][..size]))
    }

    /// 所有已占用的表项
    pub fn entries(&self) -> impl Iterator<Item = (InodeId, Cow<'_, str>)> {
        (0..self.capacity())
            .map(inode_id)
            .filter_map(|id| self.name(id).map(|name| (id, name)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::disk_len(self.capacity()));

        for size in &self.sizes {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        for (&size, name) in self.sizes.iter().zip(&self.names) {
            let mut slot = [0; NAME_SLOT];
            slot[..size as usize].copy_from_slice(&name[..size as usize]);
            bytes.extend_from_slice(&slot);
        }

        bytes
    }

    /// 从根文件的内容恢复目录，长度必须与容量吻合
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
        let capacity = self.capacity();
        if bytes.len() != Self::disk_len(capacity) {
            return Err(Error::Corrupted("directory size"));
        }

        let (size_area, name_area) = bytes.split_at(capacity * SIZE_FIELD);
        let sizes: Vec<u32> = size_area
            .chunks_exact(SIZE_FIELD)
            .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();
        if sizes.iter().any(|&size| size as usize > NAME_MAX_LEN) {
            return Err(Error::Corrupted("directory entry"));
        }

        for (index, (slot, &size)) in name_area.chunks_exact(NAME_SLOT).zip(&sizes).enumerate() {
            self.names[index] = [0; NAME_MAX_LEN];
            self.names[index][..size as usize].copy_from_slice(&slot[..size as usize]);
        }
        self.sizes = sizes;

        Ok(())
    }

    fn set(&mut self, index: usize, name: &[u8]) {
        self.sizes[index] = name.len() as u32;
        self.names[index] = [0; NAME_MAX_LEN];
        self.names[index][..name.len()].copy_from_slice(name);
    }
}

/// 截断到最多 [`NAME_MAX_LEN`] 字节，不拆开字符
pub fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(NAME_MAX_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[inline]
fn inode_id(index: usize) -> InodeId {
    InodeId::from(index as u16)
}
