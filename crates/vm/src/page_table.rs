//! Implementation of [`PageTableEntry`] and [`PageTable`].
//!
//! 这里的页表是软件模拟的 MMU：每次用户访存都经过 [`PageTable::access`]，
//! 由它检查有效位与写权限，并像硬件那样置上 A/D 位。

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use klocks::SpinMutex;

use crate::{address::VirtPageNum, frame_table::FrameId};

bitflags! {
    /// page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// page table entry structure
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    pub fn new(frame: FrameId, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: frame.0 << 10 | flags.bits() as usize,
        }
    }

    pub fn frame(&self) -> FrameId {
        FrameId(self.bits >> 10)
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    fn insert_flags(&mut self, flags: PTEFlags) {
        self.bits |= flags.bits() as usize;
    }

    fn remove_flags(&mut self, flags: PTEFlags) {
        self.bits &= !(flags.bits() as usize);
    }
}

/// 访存失败的原因，对应硬件产生的两类缺页异常
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessFault {
    /// 页表项无效
    NotPresent,
    /// 页表项有效，但不允许写
    Protection,
}

/// 一个进程的地址空间映射
pub struct PageTable {
    entries: SpinMutex<BTreeMap<VirtPageNum, PageTableEntry>>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: SpinMutex::new(BTreeMap::new()),
        }
    }

    pub fn map(&self, vpn: VirtPageNum, frame: FrameId, writable: bool) {
        let mut flags = PTEFlags::V | PTEFlags::R | PTEFlags::U;
        if writable {
            flags |= PTEFlags::W;
        }
        let old = self
            .entries
            .lock()
            .insert(vpn, PageTableEntry::new(frame, flags));
        assert!(
            old.map_or(true, |pte| !pte.is_valid()),
            "{vpn:?} is mapped before mapping"
        );
    }

    /// 清除映射，返回原先的页表项，调用方可以从中读出 D 位
    pub fn unmap(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.lock().remove(&vpn)
    }

    #[inline]
    pub fn translate(&self, vpn: VirtPageNum) -> Option<FrameId> {
        self.entries
            .lock()
            .get(&vpn)
            .filter(|pte| pte.is_valid())
            .map(PageTableEntry::frame)
    }

    pub fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.has_flags(vpn, PTEFlags::A)
    }

    pub fn clear_accessed(&self, vpn: VirtPageNum) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.remove_flags(PTEFlags::A);
        }
    }

    pub fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.has_flags(vpn, PTEFlags::D)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 模拟一次访存。成功时置 A 位，写访问还会置 D 位，然后在持有页表锁的情况下
    /// 以对应的页帧调用 `f`，期间该映射不会被撤销
    pub fn access<R>(
        &self,
        vpn: VirtPageNum,
        write: bool,
        f: impl FnOnce(FrameId) -> R,
    ) -> Result<R, AccessFault> {
        let mut entries = self.entries.lock();
        let pte = entries
            .get_mut(&vpn)
            .filter(|pte| pte.is_valid())
            .ok_or(AccessFault::NotPresent)?;
        if write && !pte.flags().contains(PTEFlags::W) {
            return Err(AccessFault::Protection);
        }
        pte.insert_flags(if write {
            PTEFlags::A | PTEFlags::D
        } else {
            PTEFlags::A
        });
        Ok(f(pte.frame()))
    }

    fn has_flags(&self, vpn: VirtPageNum, flags: PTEFlags) -> bool {
        self.entries
            .lock()
            .get(&vpn)
            .is_some_and(|pte| pte.flags().contains(flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_sets_accessed_and_dirty() {
        let pt = PageTable::new();
        let vpn = VirtPageNum(0x10);
        pt.map(vpn, FrameId(3), true);
        assert!(!pt.is_accessed(vpn));

        assert_eq!(pt.access(vpn, false, |frame| frame), Ok(FrameId(3)));
        assert!(pt.is_accessed(vpn));
        assert!(!pt.is_dirty(vpn));

        pt.clear_accessed(vpn);
        assert!(!pt.is_accessed(vpn));

        pt.access(vpn, true, |_| ()).unwrap();
        assert!(pt.is_accessed(vpn));
        assert!(pt.is_dirty(vpn));

        let old = pt.unmap(vpn).unwrap();
        assert!(old.flags().contains(PTEFlags::D));
        assert_eq!(pt.translate(vpn), None);
    }

    #[test]
    fn access_faults() {
        let pt = PageTable::new();
        let vpn = VirtPageNum(7);
        assert_eq!(pt.access(vpn, false, |_| ()), Err(AccessFault::NotPresent));
        pt.map(vpn, FrameId(0), false);
        assert_eq!(pt.access(vpn, true, |_| ()), Err(AccessFault::Protection));
        assert!(!pt.is_dirty(vpn));
        assert_eq!(pt.translate(vpn), Some(FrameId(0)));
    }

    #[test]
    #[should_panic]
    fn double_map() {
        let pt = PageTable::new();
        pt.map(VirtPageNum(1), FrameId(0), false);
        pt.map(VirtPageNum(1), FrameId(1), false);
    }
}
