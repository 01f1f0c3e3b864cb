use core::ops::Range;

use spin::Mutex;

use crate::{BLOCK_SIZE, BlockDevice, DeviceError};

/// 内存中的块设备
#[derive(Debug)]
pub struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    total_blocks: usize,
    /// 剩余可写次数，`None` 表示不限
    write_budget: Mutex<Option<usize>>,
}

impl RamDisk {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![0; total_blocks * BLOCK_SIZE]),
            total_blocks,
            write_budget: Mutex::new(None),
        }
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// 限制之后还能成功写入的块数，用尽后所有写入都会失败
    pub fn set_write_budget(&self, budget: Option<usize>) {
        *self.write_budget.lock() = budget;
    }

    fn range(&self, block_id: usize, len: usize) -> Result<Range<usize>, DeviceError> {
        if block_id >= self.total_blocks {
            return Err(DeviceError::OutOfRange { block_id });
        }
        if len != BLOCK_SIZE {
            return Err(DeviceError::ShortTransfer { block_id, len });
        }

        let start = block_id * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let range = self.range(block_id, buf.len())?;
        buf.copy_from_slice(&self.blocks.lock()[range]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let range = self.range(block_id, buf.len())?;

        if let Some(budget) = self.write_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(DeviceError::WriteBudgetExhausted { block_id });
            }
            *budget -= 1;
        }

        self.blocks.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back() {
        let disk = RamDisk::new(4);
        let block = [0xA5; BLOCK_SIZE];
        disk.write_block(3, &block).unwrap();

        let mut buf = [0; BLOCK_SIZE];
        disk.read_block(3, &mut buf).unwrap();
        assert_eq!(block, buf);

        disk.read_block(0, &mut buf).unwrap();
        assert_eq!([0; BLOCK_SIZE], buf);
    }

    #[test]
    fn rejects_bad_requests() {
        let disk = RamDisk::new(2);
        let mut buf = [0; BLOCK_SIZE];
        assert!(matches!(
            disk.read_block(2, &mut buf),
            Err(DeviceError::OutOfRange { block_id: 2 })
        ));
        assert!(matches!(
            disk.write_block(0, &buf[..100]),
            Err(DeviceError::ShortTransfer { len: 100, .. })
        ));
    }

    #[test]
    fn write_budget() {
        let disk = RamDisk::new(4);
        let block = [1; BLOCK_SIZE];
        disk.set_write_budget(Some(1));
        disk.write_block(0, &block).unwrap();
        assert!(matches!(
            disk.write_block(1, &block),
            Err(DeviceError::WriteBudgetExhausted { block_id: 1 })
        ));

        disk.set_write_budget(None);
        disk.write_block(1, &block).unwrap();
    }
}
