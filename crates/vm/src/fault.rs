//! 缺页处理。
//!
//! 同一页上的缺页处理与移除由页的 `fault_lock` 串行化；对页状态的检查、
//! 对交换槽的认领以及最终的状态转换都在页帧表锁下完成。慢速 I/O
//! 只在不持有任何表锁时进行，此时相关页帧被钉住、相关交换槽的门是关着的。
//! 所有页帧都被钉住时，缺页方等到有页帧解除钉住再重新开始。

use defines::config::USER_STACK_TOP;
use scopeguard::ScopeGuard;
use triomphe::Arc;

use crate::{
    address::VirtAddr,
    frame_table::Allocated,
    page::{FileSegment, Page, PageData},
    process::Process,
    swap::{Claim, SlotId},
    Vm, VmFatal,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// 触发缺页的执行流
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOrigin {
    /// 用户态访存，带着陷入时的栈指针
    User { sp: usize },
    /// 内核代为访问用户内存
    Kernel,
}

/// 陷入时捕获的缺页信息
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    pub addr: VirtAddr,
    pub access: Access,
    pub origin: FaultOrigin,
    /// 为假时表示页存在但权限不足
    pub not_present: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 页已填充并映射
    Resolved,
    /// 另一个执行流已经处理过该页
    AlreadyResident,
    /// 与内容相同的只读页共用了页帧
    Shared,
    /// 非法访问，进程已被杀死
    Terminated,
    /// 内核访问了非法的用户地址，调用方应报告错误
    ProbeFailed,
}

/// 换入前页内容的来源
enum Fill {
    Swap(SlotId),
    File(FileSegment),
    Zero,
}

pub(crate) enum Materialized {
    Done(FaultOutcome),
    /// 页在等待期间被移除了
    Gone,
}

impl Vm {
    pub fn handle_page_fault(
        &self,
        process: &Process,
        fault: PageFault,
    ) -> Result<FaultOutcome, VmFatal> {
        trace!(
            "pid {} page fault at {:?}, {:?} from {:?}",
            process.pid(),
            fault.addr,
            fault.access,
            fault.origin
        );
        if process.is_exited() {
            return Ok(FaultOutcome::Terminated);
        }
        let sp = match fault.origin {
            FaultOrigin::User { sp } => {
                process.set_user_sp(sp);
                sp
            }
            FaultOrigin::Kernel => process.user_sp(),
        };

        let spt = process.spt();
        if self.in_stack_envelope(fault.addr, sp) && spt.locate(fault.addr).is_none() {
            trace!("grow stack to {:?}", fault.addr.vpn_floor());
            // 另一个线程可能抢先插入了同一页，忽略即可
            let _ = spt.insert(fault.addr, PageData::Zero, true);
        }

        let Some(page) = spt.locate(fault.addr) else {
            return Ok(self.reject(process, &fault, "unmapped address"));
        };
        // 写只读页的进程无论从哪里陷入都会被杀死
        if !fault.not_present || (fault.access == Access::Write && !page.is_writable()) {
            return Ok(self.kill(process, &fault, "write to read-only page"));
        }
        match self.materialize(&page)? {
            Materialized::Done(outcome) => Ok(outcome),
            Materialized::Gone => Ok(self.reject(process, &fault, "page removed")),
        }
    }

    fn in_stack_envelope(&self, addr: VirtAddr, sp: usize) -> bool {
        addr.0 < USER_STACK_TOP
            && addr.0 + self.config().stack_fault_margin >= sp
            && USER_STACK_TOP - addr.vpn_floor().page_start().0 <= self.config().max_stack_size
    }

    fn kill(&self, process: &Process, fault: &PageFault, reason: &str) -> FaultOutcome {
        warn!(
            "pid {} killed: {reason} at {:?} ({:?} from {:?})",
            process.pid(),
            fault.addr,
            fault.access,
            fault.origin
        );
        process.terminate(self);
        FaultOutcome::Terminated
    }

    /// 访问不存在的页：用户态访问杀死进程，内核访问交给调用方报错
    fn reject(&self, process: &Process, fault: &PageFault, reason: &str) -> FaultOutcome {
        match fault.origin {
            FaultOrigin::User { .. } => self.kill(process, fault, reason),
            FaultOrigin::Kernel => {
                debug!("kernel access failed: {reason} at {:?}", fault.addr);
                FaultOutcome::ProbeFailed
            }
        }
    }

    /// 让 `page` 驻留在某个页帧中并建立映射
    pub(crate) fn materialize(&self, page: &Arc<Page>) -> Result<Materialized, VmFatal> {
        let _fault_guard = page.lock_fault();
        loop {
            let mut frames = self.frames().lock();
            if page.is_removed() {
                return Ok(Materialized::Gone);
            }
            let fill = match page.data() {
                PageData::Frame(_) => return Ok(Materialized::Done(FaultOutcome::AlreadyResident)),
                PageData::Swap(slot) => match self.swap().claim(slot) {
                    Claim::Granted => Fill::Swap(slot),
                    Claim::Busy(gate) => {
                        drop(frames);
                        trace!("wait for swap slot {}", slot.0);
                        gate.wait();
                        continue;
                    }
                },
                PageData::FileBacked(segment) => Fill::File(segment),
                PageData::Zero => Fill::Zero,
            };

            let claimed = match fill {
                Fill::Swap(slot) => Some(slot),
                Fill::File(_) | Fill::Zero => None,
            };
            // 分配失败或需要等待时让出对交换槽的认领
            let claim_guard = scopeguard::guard(claimed, |claimed| {
                if let Some(slot) = claimed {
                    self.swap().unclaim(slot);
                }
            });
            let share_key = match &fill {
                Fill::File(segment) if !page.is_writable() => Some(segment.identity()),
                _ => None,
            };
            let allocation = match frames.allocate(page, share_key, self.swap())? {
                Allocated::Frame(allocation) => allocation,
                Allocated::Busy(gate) => {
                    drop(claim_guard);
                    drop(frames);
                    trace!("pid {} waits for a frame to be unpinned", page.pid());
                    gate.wait();
                    continue;
                }
            };
            ScopeGuard::into_inner(claim_guard);
            let frame = allocation.frame;

            if allocation.shared {
                page.set_backing(share_key);
                page.map_to(frame);
                return Ok(Materialized::Done(FaultOutcome::Shared));
            }
            drop(frames);

            if let Some(slot) = allocation.eviction {
                self.frames()
                    .with_bytes(frame, |bytes| self.swap().write_out(slot, bytes))?;
            }
            match &fill {
                Fill::Swap(slot) => self
                    .frames()
                    .with_bytes_mut(frame, |bytes| self.swap().read_in(*slot, bytes))?,
                Fill::File(segment) => self
                    .frames()
                    .with_bytes_mut(frame, |bytes| segment.load_into(bytes))?,
                Fill::Zero => self.frames().with_bytes_mut(frame, |bytes| bytes.fill(0)),
            }

            let mut frames = self.frames().lock();
            match fill {
                Fill::Swap(slot) => {
                    let (sharers, gate) = self.swap().finish_swap_in(slot);
                    for sharer in &sharers {
                        if !Arc::ptr_eq(sharer, page) {
                            frames.attach(frame, sharer);
                        }
                        sharer.map_to(frame);
                    }
                    if !page.is_writable() {
                        frames.set_backing(frame, page.backing());
                    }
                    frames.unpin(frame);
                    drop(frames);
                    gate.open();
                    trace!(
                        "swap slot {} restored to frame {} for {} page(s)",
                        slot.0,
                        frame.0,
                        sharers.len()
                    );
                }
                Fill::File(segment) => {
                    page.set_backing(Some(segment.identity()));
                    page.map_to(frame);
                    frames.unpin(frame);
                }
                Fill::Zero => {
                    page.map_to(frame);
                    frames.unpin(frame);
                }
            }
            return Ok(Materialized::Done(FaultOutcome::Resolved));
        }
    }

    /// 释放页所占的资源。页已从补充页表中摘下
    pub(crate) fn release_page(&self, page: &Arc<Page>) {
        let _fault_guard = page.lock_fault();
        loop {
            let mut frames = self.frames().lock();
            match page.data() {
                PageData::Frame(frame) => {
                    page.unmap_frame();
                    frames.release(frame, page);
                }
                PageData::Swap(slot) => {
                    if let Err(gate) = self.swap().drop_ref(slot, page) {
                        drop(frames);
                        gate.wait();
                        continue;
                    }
                }
                PageData::FileBacked(_) | PageData::Zero => {}
            }
            page.mark_removed();
            return;
        }
    }
}
