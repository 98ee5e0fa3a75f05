//! 交换区所用的块设备

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use defines::config::SECTOR_SIZE;
use klocks::SpinMutex;

/// 按扇区读写的块设备。返回值是实际传输的字节数
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> usize;
    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> usize;
}

pub type BlockHandle = Arc<dyn BlockDevice>;

/// 内存模拟的磁盘，记录读写的扇区数
pub struct RamDisk {
    sectors: SpinMutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: SpinMutex::new(vec![[0; SECTOR_SIZE]; sector_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 读过的扇区数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// 写过的扇区数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> usize {
        let sectors = self.sectors.lock();
        let Some(src) = sectors.get(sector) else {
            return 0;
        };
        buf.copy_from_slice(src);
        self.reads.fetch_add(1, Ordering::AcqRel);
        SECTOR_SIZE
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> usize {
        let mut sectors = self.sectors.lock();
        let Some(dst) = sectors.get_mut(sector) else {
            return 0;
        };
        dst.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::AcqRel);
        SECTOR_SIZE
    }
}
