//! 交换表。
//!
//! 交换设备被划分为若干个连续 `SECTORS_PER_PAGE` 个扇区的槽，槽号即分配顺序，
//! 设备上不保存任何目录。每个槽带一扇就绪门：写出或读入的过程中门是关着的，
//! 其他想访问该槽的线程在门外等待，而不必持有表锁。

use alloc::{sync::Arc as StdArc, vec::Vec};
use core::mem;

use defines::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use idallocator::FixedPool;
use klocks::{Gate, SpinMutex};
use triomphe::Arc;

use crate::{block::BlockHandle, frame_table::PageList, page::Page, VmFatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// 已分配，内容正在写出
    Writing,
    /// 内容已完整写入设备
    Ready,
    /// 某个线程正在把内容读回页帧
    Reading,
}

pub struct SwapTable {
    device: BlockHandle,
    inner: SpinMutex<SwapInner>,
}

struct SwapInner {
    slots: Vec<SwapSlot>,
    free: FixedPool,
}

struct SwapSlot {
    /// 换出时共享该内容的所有页
    pages: PageList,
    ref_count: usize,
    state: SlotState,
    gate: StdArc<Gate>,
}

impl SwapSlot {
    fn free() -> Self {
        Self {
            pages: PageList::new(),
            ref_count: 0,
            state: SlotState::Free,
            gate: StdArc::new(Gate::new_open()),
        }
    }
}

/// 对一个换出槽发起换入的结果
pub(crate) enum Claim {
    /// 由当前线程负责读入
    Granted,
    /// 槽正在传输中，等门打开后重新检查页的状态
    Busy(StdArc<Gate>),
}

impl SwapInner {
    fn slot_mut(&mut self, slot: SlotId) -> &mut SwapSlot {
        &mut self.slots[slot.0]
    }

    fn release(&mut self, slot: SlotId) {
        let entry = self.slot_mut(slot);
        debug_assert_eq!(entry.ref_count, 0);
        entry.pages.clear();
        entry.state = SlotState::Free;
        self.free.release_front(slot.0);
        trace!("swap slot {} is free", slot.0);
    }
}

impl SwapTable {
    pub fn new(device: BlockHandle) -> Self {
        let capacity = device.sector_count() / SECTORS_PER_PAGE;
        info!("swap table with {capacity} slots");
        Self {
            device,
            inner: SpinMutex::new(SwapInner {
                slots: (0..capacity).map(|_| SwapSlot::free()).collect(),
                free: FixedPool::new(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().free.capacity()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.free_count()
    }

    pub fn ref_count(&self, slot: SlotId) -> usize {
        self.inner.lock().slots[slot.0].ref_count
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.inner.lock().slots[slot.0].state
    }

    /// 换出的前半部分：取一个空闲槽记下共享的页，关门等待写出
    pub(crate) fn reserve(&self, pages: &[Arc<Page>]) -> Result<SlotId, VmFatal> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.free.alloc() else {
            error!("no free swap slot for {} page(s)", pages.len());
            return Err(VmFatal::SwapFull);
        };
        let slot = &mut inner.slots[id];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.pages = pages.iter().cloned().collect();
        slot.ref_count = pages.len();
        slot.state = SlotState::Writing;
        slot.gate = StdArc::new(Gate::new_closed());
        Ok(SlotId(id))
    }

    /// 换出的后半部分：逐扇区写出页帧内容，然后开门
    pub(crate) fn write_out(&self, slot: SlotId, bytes: &[u8]) -> Result<(), VmFatal> {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, chunk) in bytes.chunks_exact(SECTOR_SIZE).enumerate() {
            buf.copy_from_slice(chunk);
            let written = self.device.write_sector(slot.first_sector() + i, &buf);
            if written != SECTOR_SIZE {
                error!("short write to swap slot {}", slot.0);
                return Err(VmFatal::ShortWrite {
                    expected: SECTOR_SIZE,
                    actual: written,
                });
            }
        }
        trace!("swap slot {} written", slot.0);

        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot);
        debug_assert_eq!(entry.state, SlotState::Writing);
        entry.state = SlotState::Ready;
        entry.gate.open();
        Ok(())
    }

    /// 尝试获得读入 `slot` 的权利。调用方需持有页帧表锁
    pub(crate) fn claim(&self, slot: SlotId) -> Claim {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot);
        match entry.state {
            SlotState::Ready => {
                entry.state = SlotState::Reading;
                entry.gate.close();
                Claim::Granted
            }
            SlotState::Writing | SlotState::Reading => Claim::Busy(StdArc::clone(&entry.gate)),
            SlotState::Free => panic!("swap slot {} is free but still referenced", slot.0),
        }
    }

    /// 放弃读入，让其他线程重试
    pub(crate) fn unclaim(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot);
        debug_assert_eq!(entry.state, SlotState::Reading);
        entry.state = SlotState::Ready;
        entry.gate.open();
    }

    /// 把 `slot` 的内容读入 `bytes`。不持有任何表锁
    pub(crate) fn read_in(&self, slot: SlotId, bytes: &mut [u8]) -> Result<(), VmFatal> {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, chunk) in bytes.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let read = self.device.read_sector(slot.first_sector() + i, &mut buf);
            if read != SECTOR_SIZE {
                error!("short read from swap slot {}", slot.0);
                return Err(VmFatal::ShortRead {
                    expected: SECTOR_SIZE,
                    actual: read,
                });
            }
            chunk.copy_from_slice(&buf);
        }
        trace!("swap slot {} read", slot.0);
        Ok(())
    }

    /// 读入完成后释放 `slot`，返回曾共享它的所有页与它的门。
    ///
    /// 调用方需持有页帧表锁，并在所有页都重新映射之后再开门
    pub(crate) fn finish_swap_in(&self, slot: SlotId) -> (PageList, StdArc<Gate>) {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot);
        debug_assert_eq!(entry.state, SlotState::Reading);
        let pages = mem::take(&mut entry.pages);
        let gate = StdArc::clone(&entry.gate);
        entry.ref_count = 0;
        inner.release(slot);
        (pages, gate)
    }

    /// 移除一个被换出的页。槽正在传输时返回它的门，调用方等待后重试
    pub(crate) fn drop_ref(&self, slot: SlotId, page: &Arc<Page>) -> Result<(), StdArc<Gate>> {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot);
        match entry.state {
            SlotState::Ready => {}
            SlotState::Writing | SlotState::Reading => return Err(StdArc::clone(&entry.gate)),
            SlotState::Free => panic!("swap slot {} is free but still referenced", slot.0),
        }
        let pos = entry
            .pages
            .iter()
            .position(|p| Arc::ptr_eq(p, page))
            .expect("page is not recorded in its swap slot");
        entry.pages.swap_remove(pos);
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            inner.release(slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc as StdArc;
    use std::thread;

    use defines::config::SECTORS_PER_PAGE;

    use super::*;
    use crate::{
        address::VirtPageNum,
        block::{BlockDevice, RamDisk},
        page::PageData,
        page_table::PageTable,
    };

    fn page(space: &Arc<PageTable>, vpn: usize) -> Arc<Page> {
        Arc::new(Page::new(
            VirtPageNum(vpn),
            1,
            Arc::clone(space),
            PageData::Zero,
            false,
        ))
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    /// 写入永远只完成一半的设备
    struct HalfDisk;

    impl BlockDevice for HalfDisk {
        fn sector_count(&self) -> usize {
            SECTORS_PER_PAGE
        }
        fn read_sector(&self, _sector: usize, _buf: &mut [u8; SECTOR_SIZE]) -> usize {
            SECTOR_SIZE / 2
        }
        fn write_sector(&self, _sector: usize, _buf: &[u8; SECTOR_SIZE]) -> usize {
            SECTOR_SIZE / 2
        }
    }

    #[test]
    fn slot_lifecycle() {
        let disk = StdArc::new(RamDisk::new(2 * SECTORS_PER_PAGE + 3));
        let swap = SwapTable::new(disk.clone());
        assert_eq!(swap.capacity(), 2);

        let space = Arc::new(PageTable::new());
        let (a, b) = (page(&space, 1), page(&space, 2));
        let slot = swap.reserve(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(slot.first_sector(), 0);
        assert_eq!(swap.ref_count(slot), 2);
        assert_eq!(swap.state(slot), SlotState::Writing);
        assert!(matches!(swap.claim(slot), Claim::Busy(_)));

        let content = pattern(3);
        swap.write_out(slot, &content).unwrap();
        assert_eq!(swap.state(slot), SlotState::Ready);
        assert_eq!(disk.writes(), SECTORS_PER_PAGE);

        assert!(matches!(swap.claim(slot), Claim::Granted));
        assert!(matches!(swap.claim(slot), Claim::Busy(_)));
        let mut back = vec![0; PAGE_SIZE];
        swap.read_in(slot, &mut back).unwrap();
        assert_eq!(back, content);

        let (pages, gate) = swap.finish_swap_in(slot);
        assert_eq!(pages.len(), 2);
        assert_eq!(swap.state(slot), SlotState::Free);
        assert_eq!(swap.free_count(), 2);
        assert!(!gate.is_open());
        gate.open();
    }

    #[test]
    fn drop_ref_waits_for_transfer() {
        let swap = StdArc::new(SwapTable::new(StdArc::new(RamDisk::new(SECTORS_PER_PAGE))));
        let space = Arc::new(PageTable::new());
        let (a, b) = (page(&space, 1), page(&space, 2));
        let slot = swap.reserve(&[a.clone(), b.clone()]).unwrap();

        let gate = swap.drop_ref(slot, &a).unwrap_err();
        let writer = {
            let swap = StdArc::clone(&swap);
            thread::spawn(move || swap.write_out(slot, &pattern(5)))
        };
        gate.wait();
        writer.join().unwrap().unwrap();

        swap.drop_ref(slot, &a).unwrap();
        assert_eq!(swap.ref_count(slot), 1);
        assert_eq!(swap.free_count(), 0);
        swap.drop_ref(slot, &b).unwrap();
        assert_eq!(swap.state(slot), SlotState::Free);
        assert_eq!(swap.free_count(), 1);
    }

    #[test]
    fn unclaim_reopens_slot() {
        let swap = SwapTable::new(StdArc::new(RamDisk::new(SECTORS_PER_PAGE)));
        let space = Arc::new(PageTable::new());
        let slot = swap.reserve(&[page(&space, 1)]).unwrap();
        swap.write_out(slot, &pattern(1)).unwrap();
        assert!(matches!(swap.claim(slot), Claim::Granted));
        swap.unclaim(slot);
        assert_eq!(swap.state(slot), SlotState::Ready);
        assert!(matches!(swap.claim(slot), Claim::Granted));
    }

    #[test]
    fn full_and_short_transfers_are_fatal() {
        let swap = SwapTable::new(StdArc::new(HalfDisk));
        let space = Arc::new(PageTable::new());
        let slot = swap.reserve(&[page(&space, 1)]).unwrap();
        assert_eq!(
            swap.reserve(&[page(&space, 2)]).unwrap_err(),
            VmFatal::SwapFull
        );
        assert_eq!(
            swap.write_out(slot, &pattern(1)).unwrap_err(),
            VmFatal::ShortWrite {
                expected: SECTOR_SIZE,
                actual: SECTOR_SIZE / 2
            }
        );
        let mut buf = vec![0; PAGE_SIZE];
        assert!(matches!(
            swap.read_in(slot, &mut buf),
            Err(VmFatal::ShortRead { .. })
        ));
    }
}
