use core::fmt;

use defines::config::PAGE_SIZE;
use klocks::{SleepMutex, SleepMutexGuard, SpinMutex};
use triomphe::Arc;

use crate::{
    address::{VirtAddr, VirtPageNum},
    file::{FileHandle, FileId},
    frame_table::FrameId,
    page_table::{PTEFlags, PageTable},
    swap::SlotId,
    VmFatal,
};

/// 页内容的来源身份：哪个文件的哪一段。
///
/// 两个只读页身份相同时内容必然相同，可以共用一个页帧。注意这与虚拟地址无关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingId {
    pub file: FileId,
    pub offset: usize,
    pub len: usize,
}

/// 尚未读入的文件段，只在页第一次被换入时使用
#[derive(Clone)]
pub struct FileSegment {
    pub file: FileHandle,
    pub offset: usize,
    /// 从文件读取的字节数，页内剩余部分填零
    pub read_bytes: usize,
}

impl FileSegment {
    pub fn identity(&self) -> BackingId {
        BackingId {
            file: self.file.identity(),
            offset: self.offset,
            len: self.read_bytes,
        }
    }

    pub(crate) fn load_into(&self, bytes: &mut [u8]) -> Result<(), VmFatal> {
        debug_assert!(self.read_bytes <= PAGE_SIZE);
        let (head, tail) = bytes.split_at_mut(self.read_bytes);
        let n = self.file.read_at(self.offset, head);
        if n != self.read_bytes {
            return Err(VmFatal::ShortRead {
                expected: self.read_bytes,
                actual: n,
            });
        }
        tail.fill(0);
        Ok(())
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("file", &self.file.identity())
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish()
    }
}

/// 页的内容当前在哪里
#[derive(Clone, Debug)]
pub enum PageData {
    /// 驻留在页帧中，且已建立映射
    Frame(FrameId),
    /// 被换出到交换槽
    Swap(SlotId),
    /// 还未从文件读入
    FileBacked(FileSegment),
    /// 第一次访问时内容全零
    Zero,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    Frame,
    Swap,
    FileBacked,
    Zero,
}

impl PageData {
    pub fn status(&self) -> PageStatus {
        match self {
            PageData::Frame(_) => PageStatus::Frame,
            PageData::Swap(_) => PageStatus::Swap,
            PageData::FileBacked(_) => PageStatus::FileBacked,
            PageData::Zero => PageStatus::Zero,
        }
    }
}

/// 补充页表项，描述一个用户虚拟页应有的内容
pub struct Page {
    vpn: VirtPageNum,
    pid: usize,
    writable: bool,
    space: Arc<PageTable>,
    /// 串行化同一页上的缺页处理与移除，整个换入过程（包括慢速 I/O）都持有，
    /// 因此等待者要睡眠而不是自旋
    fault_lock: SleepMutex<()>,
    inner: SpinMutex<PageInner>,
}

struct PageInner {
    data: PageData,
    backing: Option<BackingId>,
    /// 换出时从页表 D 位折叠进来，换入后也不清除，munmap 据此写回
    dirty: bool,
    removed: bool,
}

impl Page {
    pub(crate) fn new(
        vpn: VirtPageNum,
        pid: usize,
        space: Arc<PageTable>,
        data: PageData,
        writable: bool,
    ) -> Self {
        Self {
            vpn,
            pid,
            writable,
            space,
            fault_lock: SleepMutex::new(()),
            inner: SpinMutex::new(PageInner {
                data,
                backing: None,
                dirty: false,
                removed: false,
            }),
        }
    }

    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    pub fn addr(&self) -> VirtAddr {
        self.vpn.page_start()
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn page_table(&self) -> &PageTable {
        &self.space
    }

    pub fn status(&self) -> PageStatus {
        self.inner.lock().data.status()
    }

    pub fn data(&self) -> PageData {
        self.inner.lock().data.clone()
    }

    pub fn backing(&self) -> Option<BackingId> {
        self.inner.lock().backing
    }

    /// 页曾经被写过，且可能尚未写回
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty || self.space.is_dirty(self.vpn)
    }

    pub(crate) fn lock_fault(&self) -> SleepMutexGuard<'_, ()> {
        self.fault_lock.lock()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub(crate) fn set_backing(&self, backing: Option<BackingId>) {
        self.inner.lock().backing = backing;
    }

    /// 建立映射并转为 `Frame`。需持有页帧表锁
    pub(crate) fn map_to(&self, frame: FrameId) {
        self.space.map(self.vpn, frame, self.writable);
        self.inner.lock().data = PageData::Frame(frame);
    }

    /// 撤销映射，并记下硬件 D 位。需持有页帧表锁
    pub(crate) fn unmap_frame(&self) {
        let pte = self.space.unmap(self.vpn);
        debug_assert!(pte.is_some(), "{:?} is resident but unmapped", self.vpn);
        if pte.is_some_and(|pte| pte.flags().contains(PTEFlags::D)) {
            self.inner.lock().dirty = true;
        }
    }

    /// 被换出到 `slot`。需持有页帧表锁
    pub(crate) fn swap_out(&self, slot: SlotId) {
        self.unmap_frame();
        self.inner.lock().data = PageData::Swap(slot);
    }

    /// 资源已释放，之后的缺页不应再处理该页
    pub(crate) fn mark_removed(&self) {
        let mut inner = self.inner.lock();
        inner.removed = true;
        inner.data = PageData::Zero;
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Page")
            .field("vpn", &self.vpn)
            .field("pid", &self.pid)
            .field("writable", &self.writable)
            .field("data", &inner.data)
            .field("dirty", &inner.dirty)
            .finish()
    }
}
