#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use block_dev::{BLOCK_SIZE, BlockDevice, DeviceError};
use flat_fs::{FileSystem, OpenMode};

/// 打包宿主机目录时的错误
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("cannot read {}: {source}", .path.display())]
    Host {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Fs(#[from] flat_fs::Error),
}

impl PackError {
    fn host(path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_owned();
        move |source| Self::Host { path, source }
    }
}

/// 以宿主机上的文件充当块设备
#[derive(Debug)]
pub struct BlockFile(pub Mutex<File>);

impl BlockFile {
    /// 新建或覆盖映像文件，大小为 `total_blocks` 块
    pub fn create(path: &Path, total_blocks: u32) -> io::Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        fd.set_len(total_blocks as u64 * BLOCK_SIZE as u64)?;

        Ok(Self(Mutex::new(fd)))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self(Mutex::new(fd)))
    }

    fn seek_to(file: &mut File, block_id: usize) -> io::Result<()> {
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .map(|_| ())
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        if buf.len() != BLOCK_SIZE {
            return Err(DeviceError::ShortTransfer {
                block_id,
                len: buf.len(),
            });
        }

        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Self::seek_to(&mut file, block_id)?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => DeviceError::OutOfRange { block_id },
            _ => e.into(),
        })
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        if buf.len() != BLOCK_SIZE {
            return Err(DeviceError::ShortTransfer {
                block_id,
                len: buf.len(),
            });
        }

        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Self::seek_to(&mut file, block_id)?;
        file.write_all(buf)?;
        Ok(())
    }
}

/// 新建映像并格式化
pub fn format_image(path: &Path, total_blocks: u32, inodes: u32) -> flat_fs::Result<FileSystem> {
    let block_file = BlockFile::create(path, total_blocks).map_err(DeviceError::from)?;
    FileSystem::mkfs(Arc::new(block_file), total_blocks, inodes)
}

pub fn mount_image(path: &Path) -> flat_fs::Result<FileSystem> {
    let block_file = BlockFile::open(path).map_err(DeviceError::from)?;
    FileSystem::mount(Arc::new(block_file))
}

/// 以 `data` 覆盖文件
pub fn write_file(fs: &FileSystem, name: &str, data: &[u8]) -> flat_fs::Result<()> {
    let handle = fs.open(name, OpenMode::Write)?;
    let written = fs.write(&handle, data);
    fs.close(&handle)?;
    written?;
    Ok(())
}

pub fn read_file(fs: &FileSystem, name: &str) -> flat_fs::Result<Vec<u8>> {
    let handle = fs.open(name, OpenMode::Read)?;
    let mut data = vec![0; fs.fsize(&handle)? as usize];
    let read = fs.read(&handle, &mut data);
    fs.close(&handle)?;

    data.truncate(read?);
    Ok(data)
}

/// 把目录下的所有普通文件写入文件系统，返回写入的文件名
pub fn pack(fs: &FileSystem, source: &Path) -> Result<Vec<String>, PackError> {
    let mut packed = Vec::new();

    let mut entries = fs::read_dir(source)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(PackError::host(source))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            log::warn!("skip {path:?}: name is not UTF-8");
            continue;
        };

        let data = fs::read(&path).map_err(PackError::host(&path))?;
        write_file(fs, &name, &data)?;
        log::info!("packed {name:?}, {} bytes", data.len());
        packed.push(name);
    }

    fs.sync()?;
    Ok(packed)
}
