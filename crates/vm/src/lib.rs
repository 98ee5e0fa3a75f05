//! 按需分页的虚拟内存管理。
//!
//! 每个进程一张补充页表（[`SupplementalPageTable`]），记录每个用户页的内容来源；
//! 全局的页帧表（[`FrameTable`]）和交换表（[`SwapTable`]）由 [`Vm`] 持有，
//! 缺页时由 [`Vm::handle_page_fault`] 协调三者。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate kernel_tracer;

mod address;
mod block;
mod fault;
mod file;
mod frame_table;
mod mmap;
mod page;
mod page_table;
mod process;
mod spt;
mod swap;
#[cfg(test)]
mod test_utils;
mod user_check;

use defines::config::{MAX_STACK_SIZE, STACK_FAULT_MARGIN, USER_FRAMES};
use triomphe::Arc;

pub use self::{
    address::{VirtAddr, VirtPageNum},
    block::{BlockDevice, BlockHandle, RamDisk},
    fault::{Access, FaultOrigin, FaultOutcome, PageFault},
    file::{File, FileHandle, FileId, MemFile},
    frame_table::{FrameId, FrameTable},
    mmap::MapId,
    page::{BackingId, FileSegment, Page, PageData, PageStatus},
    page_table::{AccessFault, PTEFlags, PageTable, PageTableEntry},
    process::{Process, ProcessStatus},
    spt::SupplementalPageTable,
    swap::{SlotId, SlotState, SwapTable},
};

/// 页帧引用计数归零后放回空闲链表的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// 放在队首，最先被重新分配
    #[default]
    Front,
    /// 放在队尾，尽量推迟重新分配
    Back,
}

#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    /// 用户页帧的数量
    pub user_frames: usize,
    pub release_policy: ReleasePolicy,
    pub max_stack_size: usize,
    /// 允许访问栈指针之下多少字节而不被视为越界
    pub stack_fault_margin: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_FRAMES,
            release_policy: ReleasePolicy::default(),
            max_stack_size: MAX_STACK_SIZE,
            stack_fault_margin: STACK_FAULT_MARGIN,
        }
    }
}

/// 无法恢复的错误，会导致内核 panic
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum VmFatal {
    #[display("every frame is pinned or keeps being accessed")]
    FramesExhausted,
    #[display("swap device is full")]
    SwapFull,
    #[display("short read: {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },
    #[display("short write: {actual} of {expected} bytes")]
    ShortWrite { expected: usize, actual: usize },
}

/// 在硬件线程的边界把 [`VmFatal`] 转为内核 panic
#[track_caller]
pub fn fatal(e: VmFatal) -> ! {
    error!("vm fatal error: {e}");
    panic!("kernel panic: {e}");
}

pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapTable,
}

impl Vm {
    pub fn new(config: VmConfig, swap_device: BlockHandle) -> Self {
        info!(
            "vm init: {} user frames, release policy {:?}",
            config.user_frames, config.release_policy
        );
        Self {
            frames: FrameTable::new(config.user_frames, config.release_policy),
            swap: SwapTable::new(swap_device),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// 创建一个地址空间为空的进程
    pub fn spawn(&self) -> Arc<Process> {
        let process = Arc::new(Process::new());
        debug!("spawn process {}", process.pid());
        process
    }
}
