#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{collections::VecDeque, vec::Vec};

/// 基于回收的分配器，用 vector 收集释放的 id，没有上限。
///
/// 用于 pid、mmap 映射号这类只需唯一、不需连续的编号
#[derive(Clone, Debug)]
pub struct RecycleAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配
    pub const fn new() -> Self {
        Self::begin_with(0)
    }

    /// 显式决定从哪个数开始分配
    pub const fn begin_with(begin: usize) -> Self {
        RecycleAllocator {
            current: begin,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(
            !self.recycled.contains(&id),
            "id {id} has been deallocated!",
        );
        self.recycled.push(id);
    }
}

/// 容量固定的编号池，初始时 `0..capacity` 全部空闲。
///
/// 页帧和交换槽都由它管理。`alloc` 总是从队首取，
/// 释放时可选择放回队首（立即复用）或队尾（尽量晚复用）
#[derive(Clone, Debug)]
pub struct FixedPool {
    free: VecDeque<usize>,
    capacity: usize,
}

impl FixedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).collect(),
            capacity,
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    /// 放回队首，下一次 `alloc` 就会拿到它
    pub fn release_front(&mut self, id: usize) {
        self.check_release(id);
        self.free.push_front(id);
    }

    /// 放回队尾，其他空闲编号都被用过后才会再拿到它
    pub fn release_back(&mut self, id: usize) {
        self.check_release(id);
        self.free.push_back(id);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_release(&self, id: usize) {
        assert!(id < self.capacity, "id {id} out of pool");
        debug_assert!(!self.free.contains(&id), "id {id} has been released!");
    }
}
