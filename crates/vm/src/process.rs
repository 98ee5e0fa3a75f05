use alloc::collections::BTreeMap;

use atomic::{Atomic, Ordering};
use defines::{
    config::{PAGE_SIZE, USER_STACK_TOP},
    error::{errno, KResult},
};
use idallocator::RecycleAllocator;
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    address::VirtAddr,
    file::FileHandle,
    mmap::{MapId, MmapRegion},
    page::{FileSegment, PageData},
    page_table::PageTable,
    spt::SupplementalPageTable,
    Vm,
};

static PID_ALLOCATOR: SpinMutex<RecycleAllocator> = SpinMutex::new(RecycleAllocator::begin_with(1));

pub struct Process {
    pid: usize,
    pub status: Atomic<ProcessStatus>,
    page_table: Arc<PageTable>,
    spt: SupplementalPageTable,
    inner: SpinMutex<ProcessInner>,
}

pub(crate) struct ProcessInner {
    /// 最近一次从用户态陷入时的栈指针，内核态缺页时用它判断栈增长
    pub user_sp: usize,
    pub mmaps: BTreeMap<MapId, MmapRegion>,
    pub mapid_allocator: RecycleAllocator,
}

impl Process {
    pub(crate) fn new() -> Self {
        let pid = PID_ALLOCATOR.lock().alloc();
        let page_table = Arc::new(PageTable::new());
        Self {
            pid,
            status: Atomic::new(ProcessStatus::normal()),
            spt: SupplementalPageTable::new(pid, Arc::clone(&page_table)),
            page_table,
            inner: SpinMutex::new(ProcessInner {
                user_sp: USER_STACK_TOP,
                mmaps: BTreeMap::new(),
                mapid_allocator: RecycleAllocator::new(),
            }),
        }
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn user_sp(&self) -> usize {
        self.inner.lock().user_sp
    }

    pub fn set_user_sp(&self, sp: usize) {
        self.inner.lock().user_sp = sp;
    }

    pub fn is_exited(&self) -> bool {
        self.status.load(Ordering::Acquire).is_exited()
    }

    pub fn exit_code(&self) -> Option<i8> {
        self.status.load(Ordering::Acquire).exit_code()
    }

    pub(crate) fn lock_inner_with<T>(&self, f: impl FnOnce(&mut ProcessInner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// 登记可执行文件的一个段，每页按需从文件读入，文件内容之后的部分填零。
    ///
    /// 要求 `upage` 页对齐，且 `read_bytes + zero_bytes` 是页大小的整数倍
    pub fn load_segment(
        &self,
        file: FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        if !upage.is_page_aligned() || (read_bytes + zero_bytes) % PAGE_SIZE != 0 {
            return Err(errno::EINVAL);
        }
        trace!(
            "pid {} load segment at {upage:?}, {read_bytes:#x} bytes from file",
            self.pid
        );
        let pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        let mut remaining = read_bytes;
        for i in 0..pages {
            let page_read = remaining.min(PAGE_SIZE);
            let data = if page_read > 0 {
                PageData::FileBacked(FileSegment {
                    file: FileHandle::clone(&file),
                    offset: offset + i * PAGE_SIZE,
                    read_bytes: page_read,
                })
            } else {
                PageData::Zero
            };
            self.spt
                .insert(upage.add(i * PAGE_SIZE), data, writable)?;
            remaining -= page_read;
        }
        Ok(())
    }

    /// 在栈顶之下登记第一个栈页，并把栈指针设到栈顶
    pub fn setup_stack(&self) -> KResult<()> {
        self.spt
            .insert(VirtAddr(USER_STACK_TOP - PAGE_SIZE), PageData::Zero, true)?;
        self.set_user_sp(USER_STACK_TOP);
        Ok(())
    }

    /// 退出进程：撤销所有 mmap（写回脏页）并释放所有页。
    ///
    /// 只有第一次调用生效，返回是否由本次调用完成退出
    pub fn exit(&self, vm: &Vm, exit_code: i8) -> bool {
        let exited = self
            .status
            .compare_exchange(
                ProcessStatus::normal(),
                ProcessStatus::exited(exit_code),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !exited {
            return false;
        }
        info!("Process {} exits with code {exit_code}", self.pid);
        self.munmap_all(vm);
        self.spt.destroy(vm);
        true
    }

    /// 非法访存时杀死进程
    pub fn terminate(&self, vm: &Vm) -> bool {
        self.exit(vm, -1)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        PID_ALLOCATOR.lock().dealloc(self.pid);
    }
}

/// 标记一个进程的状态，其中低 8 位记录 exit code
///
/// 高 8 位的可能有如下几种：
/// - 0: 进程处于正常状态下
/// - 1: 进程已退出，资源已回收
#[derive(bytemuck::NoUninit, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProcessStatus(u16);

impl ProcessStatus {
    pub fn normal() -> Self {
        Self(0)
    }

    pub fn exited(exit_code: i8) -> Self {
        Self((1 << 8) | (exit_code as u8 as u16))
    }

    pub fn is_exited(self) -> bool {
        self.0 >> 8 == 1
    }

    pub fn exit_code(self) -> Option<i8> {
        self.is_exited().then_some(self.0 as u8 as i8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{page::PageStatus, test_utils::*};

    #[test]
    fn status_encoding() {
        assert!(!ProcessStatus::normal().is_exited());
        assert_eq!(ProcessStatus::exited(-1).exit_code(), Some(-1));
        assert_eq!(ProcessStatus::exited(3).exit_code(), Some(3));
        assert_eq!(ProcessStatus::normal().exit_code(), None);
    }

    #[test]
    fn load_segment_layout() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        let file = patterned_file(3, 1);
        process
            .load_segment(file.clone(), PAGE_SIZE, VirtAddr(0x8000), PAGE_SIZE + 1, 2 * PAGE_SIZE - 1, true)
            .unwrap();
        let spt = process.spt();
        assert_eq!(spt.len(), 3);
        let PageData::FileBacked(first) = spt.locate(VirtAddr(0x8000)).unwrap().data() else {
            panic!("first page should be file backed");
        };
        assert_eq!((first.offset, first.read_bytes), (PAGE_SIZE, PAGE_SIZE));
        let PageData::FileBacked(second) = spt.locate(VirtAddr(0x9000)).unwrap().data() else {
            panic!("second page should be file backed");
        };
        assert_eq!((second.offset, second.read_bytes), (2 * PAGE_SIZE, 1));
        assert_eq!(spt.locate(VirtAddr(0xA000)).unwrap().status(), PageStatus::Zero);

        assert_eq!(
            process.load_segment(file, 0, VirtAddr(0x8001), 1, PAGE_SIZE - 1, false),
            Err(errno::EINVAL)
        );
    }

    #[test]
    fn exit_only_once() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        process.setup_stack().unwrap();
        vm.user_write(&process, VirtAddr(USER_STACK_TOP - 8), &[1; 8])
            .unwrap();
        assert_eq!(vm.frames().free_count(), 1);

        assert!(process.exit(&vm, 0));
        assert!(!process.terminate(&vm));
        assert_eq!(process.exit_code(), Some(0));
        assert!(process.spt().is_empty());
        assert_eq!(vm.frames().free_count(), 2);
        assert_eq!(
            vm.user_write(&process, VirtAddr(USER_STACK_TOP - 8), &[1]),
            Err(errno::ESRCH)
        );
    }

    #[test]
    fn pids_are_distinct() {
        let (vm, _) = vm_with(1, 1);
        let a = vm.spawn();
        let b = vm.spawn();
        assert_ne!(a.pid(), b.pid());
    }
}
