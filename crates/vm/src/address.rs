use core::{fmt, ops::Add};

use defines::config::{PAGE_SIZE, PAGE_SIZE_BITS};

/// 用户虚拟地址
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
    /// 向下取整页号
    #[inline]
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }
    #[inline]
    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }
    #[inline]
    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#x}", self.0)
    }
}

/// 虚拟页号
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    #[inline]
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }
}

impl fmt::Debug for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VPN:{:#x}", self.0)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;
    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}
