use alloc::{sync::Arc as StdArc, vec::Vec};
use std::{thread, time::Duration};

use defines::config::{PAGE_SIZE, SECTORS_PER_PAGE};

use crate::{
    block::RamDisk,
    file::{File, FileHandle, FileId, MemFile},
    Vm, VmConfig,
};

/// `frames` 个页帧、`slots` 个交换槽的虚拟内存
pub fn vm_with(frames: usize, slots: usize) -> (Vm, StdArc<RamDisk>) {
    let config = VmConfig {
        user_frames: frames,
        ..VmConfig::default()
    };
    vm_with_config(config, slots)
}

pub fn vm_with_config(config: VmConfig, slots: usize) -> (Vm, StdArc<RamDisk>) {
    let disk = StdArc::new(RamDisk::new(slots * SECTORS_PER_PAGE));
    let vm = Vm::new(config, disk.clone());
    (vm, disk)
}

/// 由种子决定的伪随机字节
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.u8(..)).collect()
}

/// 内容为 `pattern(pages * PAGE_SIZE, seed)` 的文件
pub fn patterned_file(pages: usize, seed: u64) -> FileHandle {
    StdArc::new(MemFile::new(pattern(pages * PAGE_SIZE, seed)))
}

/// 每次读取前先睡眠 `delay` 的文件
pub struct SlowFile {
    inner: MemFile,
    delay: Duration,
}

impl File for SlowFile {
    fn identity(&self) -> FileId {
        self.inner.identity()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        thread::sleep(self.delay);
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.inner.write_at(offset, buf)
    }
}

/// 与 `patterned_file(pages, seed)` 内容相同，但读得很慢
pub fn slow_file(pages: usize, seed: u64, delay: Duration) -> FileHandle {
    StdArc::new(SlowFile {
        inner: MemFile::new(pattern(pages * PAGE_SIZE, seed)),
        delay,
    })
}
