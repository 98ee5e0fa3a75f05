//! 全局页帧表。
//!
//! 页帧数量固定，分配时优先共享内容相同的只读页帧，其次取空闲页帧，
//! 都没有时用时钟算法选出牺牲帧换出到交换区。
//!
//! 一个页帧上挂着所有映射了它的页，引用计数恒等于所挂页的数量。
//! 被钉住（`pinned`）的页帧内容正在传输，既不会被换出也不会被共享。
//! 所有页帧都被钉住时分配方要等到某个页帧解除钉住再重试。

use alloc::{boxed::Box, sync::Arc as StdArc, vec, vec::Vec};
use core::mem;

use defines::config::PAGE_SIZE;
use idallocator::FixedPool;
use klocks::{Gate, SpinMutex, SpinMutexGuard};
use smallvec::{smallvec, SmallVec};
use triomphe::Arc;

use crate::{
    page::{BackingId, Page},
    swap::{SlotId, SwapTable},
    ReleasePolicy, VmFatal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

pub(crate) type PageList = SmallVec<[Arc<Page>; 2]>;

pub struct FrameTable {
    bytes: Box<[SpinMutex<Box<[u8]>>]>,
    arena: SpinMutex<FrameArena>,
}

pub(crate) struct FrameArena {
    frames: Vec<FrameEntry>,
    free: FixedPool,
    /// 时钟指针
    hand: usize,
    policy: ReleasePolicy,
    /// 等待页帧解除钉住的分配方在这扇门外等待
    unpinned: Option<StdArc<Gate>>,
}

#[derive(Default)]
struct FrameEntry {
    pages: PageList,
    ref_count: usize,
    writable: bool,
    backing: Option<BackingId>,
    accessed: bool,
    pinned: bool,
}

pub(crate) enum Allocated {
    Frame(Allocation),
    /// 所有已占用的页帧都被钉住，等门打开后重试
    Busy(StdArc<Gate>),
}

/// 一次分配的结果
#[derive(Debug)]
pub(crate) struct Allocation {
    pub frame: FrameId,
    /// 与已驻留的只读页共用了页帧，无需填充
    pub shared: bool,
    /// 页帧是换出得来的，原内容还需写入该交换槽
    pub eviction: Option<SlotId>,
}

impl FrameTable {
    pub fn new(capacity: usize, policy: ReleasePolicy) -> Self {
        assert!(capacity > 0, "frame table must not be empty");
        let bytes = (0..capacity)
            .map(|_| SpinMutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        let frames = (0..capacity).map(|_| FrameEntry::default()).collect();
        Self {
            bytes,
            arena: SpinMutex::new(FrameArena {
                frames,
                free: FixedPool::new(capacity),
                hand: 0,
                policy,
                unpinned: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> SpinMutexGuard<'_, FrameArena> {
        self.arena.lock()
    }

    pub(crate) fn with_bytes<R>(&self, frame: FrameId, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes[frame.0].lock())
    }

    pub(crate) fn with_bytes_mut<R>(&self, frame: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes[frame.0].lock())
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn free_count(&self) -> usize {
        self.arena.lock().free.free_count()
    }

    pub fn ref_count(&self, frame: FrameId) -> usize {
        self.arena.lock().frames[frame.0].ref_count
    }

    pub fn pages_of(&self, frame: FrameId) -> Vec<Arc<Page>> {
        self.arena.lock().frames[frame.0].pages.to_vec()
    }
}

impl FrameArena {
    /// 为 `page` 分配页帧。`share_key` 非空时先尝试共享同身份的只读页帧。
    ///
    /// 非共享的页帧会被钉住，调用方填充完毕后需调用 [`Self::unpin`]。
    /// 若页帧来自换出，返回的 `eviction` 中的交换槽还未写入，调用方需在释放锁之后写出。
    /// 返回 [`Allocated::Busy`] 时调用方需释放锁，等门打开后重试
    pub fn allocate(
        &mut self,
        page: &Arc<Page>,
        share_key: Option<BackingId>,
        swap: &SwapTable,
    ) -> Result<Allocated, VmFatal> {
        if let Some(key) = share_key.filter(|_| !page.is_writable()) {
            if let Some(frame) = self.find_shared(key) {
                let entry = &mut self.frames[frame.0];
                entry.pages.push(Arc::clone(page));
                entry.ref_count += 1;
                entry.accessed = true;
                debug!(
                    "pid {} shares frame {} for {:?}, ref count {}",
                    page.pid(),
                    frame.0,
                    page.vpn(),
                    entry.ref_count
                );
                return Ok(Allocated::Frame(Allocation {
                    frame,
                    shared: true,
                    eviction: None,
                }));
            }
        }

        let (frame, eviction) = match self.free.alloc() {
            Some(id) => (FrameId(id), None),
            None => {
                let Some(victim) = self.find_victim()? else {
                    return Ok(Allocated::Busy(self.pin_waiters()));
                };
                let slot = self.evict(victim, swap)?;
                (victim, Some(slot))
            }
        };

        let entry = &mut self.frames[frame.0];
        debug_assert_eq!(entry.ref_count, 0);
        *entry = FrameEntry {
            pages: smallvec![Arc::clone(page)],
            ref_count: 1,
            writable: page.is_writable(),
            backing: share_key,
            accessed: true,
            pinned: true,
        };
        Ok(Allocated::Frame(Allocation {
            frame,
            shared: false,
            eviction,
        }))
    }

    fn find_shared(&self, key: BackingId) -> Option<FrameId> {
        self.frames
            .iter()
            .position(|entry| {
                entry.ref_count > 0
                    && !entry.pinned
                    && !entry.writable
                    && entry.backing == Some(key)
            })
            .map(FrameId)
    }

    /// 二次机会算法。挂在页帧上的任意一个页被访问过，都算该页帧被访问过。
    ///
    /// 所有已占用的页帧都被钉住时返回 `None`
    fn find_victim(&mut self) -> Result<Option<FrameId>, VmFatal> {
        let len = self.frames.len();
        if len == 0 {
            return Err(VmFatal::FramesExhausted);
        }
        let mut evictable = false;
        for _ in 0..2 * len {
            let id = self.hand;
            self.hand = (self.hand + 1) % len;

            let entry = &mut self.frames[id];
            if entry.pinned || entry.ref_count == 0 {
                continue;
            }
            evictable = true;
            let mut accessed = mem::take(&mut entry.accessed);
            for page in &entry.pages {
                let space = page.page_table();
                if space.is_accessed(page.vpn()) {
                    space.clear_accessed(page.vpn());
                    accessed = true;
                }
            }
            if !accessed {
                return Ok(Some(FrameId(id)));
            }
        }
        if !evictable {
            return Ok(None);
        }
        error!("all {len} frames keep being accessed");
        Err(VmFatal::FramesExhausted)
    }

    /// 把牺牲帧上的所有页转为换出状态。内容此时还在页帧里
    fn evict(&mut self, victim: FrameId, swap: &SwapTable) -> Result<SlotId, VmFatal> {
        let entry = &mut self.frames[victim.0];
        let slot = swap.reserve(&entry.pages)?;
        let pages = mem::take(&mut entry.pages);
        for page in &pages {
            page.swap_out(slot);
        }
        debug!(
            "evict frame {} with {} page(s) to slot {}",
            victim.0,
            pages.len(),
            slot.0
        );
        *entry = FrameEntry::default();
        Ok(slot)
    }

    /// 把换入时共享同一交换槽的其他页挂到页帧上
    pub fn attach(&mut self, frame: FrameId, page: &Arc<Page>) {
        let entry = &mut self.frames[frame.0];
        debug_assert!(entry.ref_count > 0 && !entry.writable);
        entry.pages.push(Arc::clone(page));
        entry.ref_count += 1;
    }

    pub fn set_backing(&mut self, frame: FrameId, backing: Option<BackingId>) {
        self.frames[frame.0].backing = backing;
    }

    pub fn unpin(&mut self, frame: FrameId) {
        let entry = &mut self.frames[frame.0];
        debug_assert!(entry.pinned);
        entry.pinned = false;
        self.wake_pin_waiters();
    }

    fn pin_waiters(&mut self) -> StdArc<Gate> {
        let gate = self
            .unpinned
            .get_or_insert_with(|| StdArc::new(Gate::new_closed()));
        StdArc::clone(gate)
    }

    fn wake_pin_waiters(&mut self) {
        if let Some(gate) = self.unpinned.take() {
            gate.open();
        }
    }

    /// 从页帧上摘下 `page`，引用计数归零时放回空闲池
    pub fn release(&mut self, frame: FrameId, page: &Arc<Page>) {
        let entry = &mut self.frames[frame.0];
        let pos = entry
            .pages
            .iter()
            .position(|p| Arc::ptr_eq(p, page))
            .expect("page is not attached to its frame");
        entry.pages.swap_remove(pos);
        entry.ref_count -= 1;
        debug_assert_eq!(entry.ref_count, entry.pages.len());
        if entry.ref_count > 0 {
            return;
        }
        debug_assert!(!entry.pinned);
        *entry = FrameEntry::default();
        match self.policy {
            ReleasePolicy::Front => self.free.release_front(frame.0),
            ReleasePolicy::Back => self.free.release_back(frame.0),
        }
        self.wake_pin_waiters();
        trace!("frame {} is free", frame.0);
    }
}
