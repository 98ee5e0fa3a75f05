//! 文件映射。映射的页按需从文件读入，撤销映射时把被写过的页写回文件

use alloc::vec::Vec;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use triomphe::Arc;

use crate::{
    address::{VirtAddr, VirtPageNum},
    file::FileHandle,
    page::{FileSegment, Page, PageData},
    process::Process,
    Vm, VmFatal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub usize);

pub(crate) struct MmapRegion {
    file: FileHandle,
    start: VirtPageNum,
    /// 映射时文件的长度
    len: usize,
}

impl MmapRegion {
    fn page_count(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE)
    }
}

impl Process {
    /// 把整个 `file` 映射到 `addr` 开始的连续页上。
    ///
    /// 以下情况返回 `EINVAL`：`addr` 为空或未对齐、文件为空、与已有的页重叠
    pub fn mmap(&self, vm: &Vm, file: FileHandle, addr: VirtAddr, writable: bool) -> KResult<MapId> {
        let len = file.len();
        if addr.0 == 0 || !addr.is_page_aligned() || len == 0 {
            return Err(errno::EINVAL);
        }
        let region = MmapRegion {
            file: FileHandle::clone(&file),
            start: addr.vpn_floor(),
            len,
        };
        let pages = region.page_count();
        if addr.0.checked_add(pages * PAGE_SIZE).is_none() {
            return Err(errno::EINVAL);
        }
        if (0..pages).any(|i| self.spt().locate(addr.add(i * PAGE_SIZE)).is_some()) {
            return Err(errno::EINVAL);
        }

        for i in 0..pages {
            let offset = i * PAGE_SIZE;
            let data = PageData::FileBacked(FileSegment {
                file: FileHandle::clone(&file),
                offset,
                read_bytes: (len - offset).min(PAGE_SIZE),
            });
            if self.spt().insert(addr.add(offset), data, writable).is_err() {
                // 与并发插入的页冲突，撤销已插入的部分
                for j in 0..i {
                    self.spt().remove(vm, addr.add(j * PAGE_SIZE));
                }
                return Err(errno::EINVAL);
            }
        }

        let id = self.lock_inner_with(|inner| {
            let id = MapId(inner.mapid_allocator.alloc());
            inner.mmaps.insert(id, region);
            id
        });
        debug!(
            "pid {} mmap {:?} at {addr:?}, {pages} page(s)",
            self.pid(),
            id
        );
        Ok(id)
    }

    /// 撤销映射，写回其中的脏页
    pub fn munmap(&self, vm: &Vm, id: MapId) -> KResult<()> {
        let region = self
            .lock_inner_with(|inner| {
                let region = inner.mmaps.remove(&id)?;
                inner.mapid_allocator.dealloc(id.0);
                Some(region)
            })
            .ok_or(errno::EINVAL)?;
        self.unmap_region(vm, &region);
        Ok(())
    }

    pub(crate) fn munmap_all(&self, vm: &Vm) {
        let regions: Vec<_> = self.lock_inner_with(|inner| {
            core::mem::take(&mut inner.mmaps).into_values().collect()
        });
        for region in &regions {
            self.unmap_region(vm, region);
        }
    }

    fn unmap_region(&self, vm: &Vm, region: &MmapRegion) {
        for i in 0..region.page_count() {
            let addr = (region.start + i).page_start();
            let Some(page) = self.spt().locate(addr) else {
                continue;
            };
            if page.is_writable() {
                match dirty_contents(vm, &page) {
                    Ok(Some(bytes)) => write_back(region, i * PAGE_SIZE, &bytes),
                    Ok(None) => {}
                    Err(fatal) => crate::fatal(fatal),
                }
            }
            self.spt().remove(vm, addr);
        }
    }
}

/// 取出被写过的页的内容。换出到交换区的脏页会先被换入
fn dirty_contents(vm: &Vm, page: &Arc<Page>) -> Result<Option<Vec<u8>>, VmFatal> {
    loop {
        {
            let _fault_guard = page.lock_fault();
            let _frames = vm.frames().lock();
            if page.is_removed() {
                return Ok(None);
            }
            match page.data() {
                PageData::Frame(frame) => {
                    if !page.is_dirty() {
                        return Ok(None);
                    }
                    return Ok(Some(vm.frames().with_bytes(frame, <[u8]>::to_vec)));
                }
                PageData::Swap(_) if page.is_dirty() => {}
                PageData::Swap(_) | PageData::FileBacked(_) | PageData::Zero => return Ok(None),
            }
        }
        vm.materialize(page)?;
    }
}

fn write_back(region: &MmapRegion, offset: usize, bytes: &[u8]) {
    // 文件在映射之后可能被截断，只写回仍在文件范围内的部分
    let end = region.len.min(region.file.len());
    let Some(len) = end.checked_sub(offset).filter(|&len| len > 0) else {
        return;
    };
    let len = len.min(PAGE_SIZE);
    let written = region.file.write_at(offset, &bytes[..len]);
    if written != len {
        warn!("short write back at offset {offset:#x}: {written} of {len} bytes");
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc as StdArc;

    use super::*;
    use crate::{file::MemFile, page::PageStatus, test_utils::*};

    const BASE: VirtAddr = VirtAddr(0x1000_0000);

    #[test]
    fn rejects_bad_arguments() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        let file = patterned_file(1, 1);
        let empty: FileHandle = StdArc::new(MemFile::new(Vec::new()));

        assert_eq!(process.mmap(&vm, file.clone(), VirtAddr(0), true), Err(errno::EINVAL));
        assert_eq!(process.mmap(&vm, file.clone(), BASE.add(1), true), Err(errno::EINVAL));
        assert_eq!(process.mmap(&vm, empty, BASE, true), Err(errno::EINVAL));

        process.spt().insert(BASE, PageData::Zero, true).unwrap();
        assert_eq!(process.mmap(&vm, file.clone(), BASE, true), Err(errno::EINVAL));
        assert_eq!(process.munmap(&vm, MapId(9)), Err(errno::EINVAL));

        let id = process.mmap(&vm, file, BASE.add(PAGE_SIZE), false).unwrap();
        process.munmap(&vm, id).unwrap();
        assert_eq!(process.munmap(&vm, id), Err(errno::EINVAL));
    }

    #[test]
    fn dirty_pages_are_written_back() {
        let (vm, _) = vm_with(4, 4);
        let process = vm.spawn();
        // 两页半长的文件
        let mut content = pattern(PAGE_SIZE * 5 / 2, 3);
        let file = StdArc::new(MemFile::new(content.clone()));
        let id = process.mmap(&vm, file.clone(), BASE, true).unwrap();
        assert_eq!(process.spt().len(), 3);

        let mut buf = [0; 16];
        vm.user_read(&process, BASE.add(PAGE_SIZE), &mut buf).unwrap();
        assert_eq!(&buf, &content[PAGE_SIZE..PAGE_SIZE + 16]);

        vm.user_write(&process, BASE.add(10), b"hello").unwrap();
        vm.user_write(&process, BASE.add(2 * PAGE_SIZE + 4), b"tail").unwrap();
        content[10..15].copy_from_slice(b"hello");
        content[2 * PAGE_SIZE + 4..2 * PAGE_SIZE + 8].copy_from_slice(b"tail");

        // 映射结束前文件不变
        assert_ne!(file.snapshot(), content);
        process.munmap(&vm, id).unwrap();
        assert_eq!(file.snapshot(), content);
        assert!(process.spt().is_empty());
        assert_eq!(vm.frames().free_count(), 4);
    }

    #[test]
    fn swapped_dirty_page_is_written_back() {
        let (vm, _) = vm_with(1, 4);
        let process = vm.spawn();
        let mut content = pattern(2 * PAGE_SIZE, 9);
        let file = StdArc::new(MemFile::new(content.clone()));
        let id = process.mmap(&vm, file.clone(), BASE, true).unwrap();

        vm.user_write(&process, BASE.add(100), &[0xAB; 4]).unwrap();
        content[100..104].fill(0xAB);
        // 访问第二页，把第一页挤到交换区
        let mut buf = [0; 1];
        vm.user_read(&process, BASE.add(PAGE_SIZE), &mut buf).unwrap();
        let first = process.spt().locate(BASE).unwrap();
        assert_eq!(first.status(), PageStatus::Swap);
        assert!(first.is_dirty());

        process.munmap(&vm, id).unwrap();
        assert_eq!(file.snapshot(), content);
        assert_eq!(vm.swap().free_count(), 4);
    }

    #[test]
    fn exit_unmaps_everything() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        let file = StdArc::new(MemFile::new(vec![0; PAGE_SIZE]));
        process.mmap(&vm, file.clone(), BASE, true).unwrap();
        vm.user_write(&process, BASE, &[5; 3]).unwrap();
        assert!(process.exit(&vm, 0));
        assert_eq!(&file.snapshot()[..4], &[5, 5, 5, 0]);
    }
}
