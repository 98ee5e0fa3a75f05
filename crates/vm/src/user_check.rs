//! 模拟硬件线程对用户内存的访问。
//!
//! 访问按页切分，每页先查页表，缺页时交给 [`Vm::handle_page_fault`] 处理后重试。
//! 用户态访问未映射的地址会杀死进程，内核代为访问时只返回 `EFAULT`。
//! 写只读页不论由谁发起都会杀死进程

use core::ops::Range;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};

use crate::{
    address::VirtAddr,
    fault::{Access, FaultOrigin, FaultOutcome, PageFault},
    frame_table::FrameId,
    page_table::AccessFault,
    process::Process,
    Vm,
};

impl Vm {
    /// 用户态从 `addr` 读取 `buf.len()` 字节
    pub fn user_read(&self, process: &Process, addr: VirtAddr, buf: &mut [u8]) -> KResult<()> {
        let origin = FaultOrigin::User {
            sp: process.user_sp(),
        };
        self.access_user(process, addr, buf.len(), Access::Read, origin, |frame, page, range| {
            self.frames()
                .with_bytes(frame, |bytes| buf[range].copy_from_slice(&bytes[page]));
        })
    }

    /// 用户态向 `addr` 写入 `buf`
    pub fn user_write(&self, process: &Process, addr: VirtAddr, buf: &[u8]) -> KResult<()> {
        let origin = FaultOrigin::User {
            sp: process.user_sp(),
        };
        self.access_user(process, addr, buf.len(), Access::Write, origin, |frame, page, range| {
            self.frames()
                .with_bytes_mut(frame, |bytes| bytes[page].copy_from_slice(&buf[range]));
        })
    }

    pub fn copy_from_user(&self, process: &Process, addr: VirtAddr, buf: &mut [u8]) -> KResult<()> {
        self.access_user(
            process,
            addr,
            buf.len(),
            Access::Read,
            FaultOrigin::Kernel,
            |frame, page, range| {
                self.frames()
                    .with_bytes(frame, |bytes| buf[range].copy_from_slice(&bytes[page]));
            },
        )
    }

    pub fn copy_to_user(&self, process: &Process, addr: VirtAddr, buf: &[u8]) -> KResult<()> {
        self.access_user(
            process,
            addr,
            buf.len(),
            Access::Write,
            FaultOrigin::Kernel,
            |frame, page, range| {
                self.frames()
                    .with_bytes_mut(frame, |bytes| bytes[page].copy_from_slice(&buf[range]));
            },
        )
    }

    /// 逐页访问 `[addr, addr + len)`。`copy` 的参数依次是页帧、页内范围和缓冲区内范围
    fn access_user(
        &self,
        process: &Process,
        addr: VirtAddr,
        len: usize,
        access: Access,
        origin: FaultOrigin,
        mut copy: impl FnMut(FrameId, Range<usize>, Range<usize>),
    ) -> KResult<()> {
        if addr.0.checked_add(len).is_none() {
            return Err(errno::EFAULT);
        }
        let mut done = 0;
        while done < len {
            let va = addr.add(done);
            let offset = va.page_offset();
            let n = (PAGE_SIZE - offset).min(len - done);
            loop {
                if process.is_exited() {
                    return Err(errno::ESRCH);
                }
                let result = process
                    .page_table()
                    .access(va.vpn_floor(), access == Access::Write, |frame| {
                        copy(frame, offset..offset + n, done..done + n);
                    });
                let Err(fault) = result else {
                    break;
                };
                let fault = PageFault {
                    addr: va,
                    access,
                    origin,
                    not_present: fault == AccessFault::NotPresent,
                };
                self.resolve(process, fault)?;
            }
            done += n;
        }
        Ok(())
    }

    fn resolve(&self, process: &Process, fault: PageFault) -> KResult<()> {
        match self.handle_page_fault(process, fault) {
            Ok(FaultOutcome::Resolved | FaultOutcome::AlreadyResident | FaultOutcome::Shared) => {
                Ok(())
            }
            Ok(FaultOutcome::Terminated) => Err(errno::ESRCH),
            Ok(FaultOutcome::ProbeFailed) => Err(errno::EFAULT),
            Err(fatal) => crate::fatal(fatal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{page::PageData, test_utils::*};

    const BASE: VirtAddr = VirtAddr(0x20_0000);

    #[test]
    fn access_spans_pages() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        process.spt().insert(BASE, PageData::Zero, true).unwrap();
        process.spt().insert(BASE.add(PAGE_SIZE), PageData::Zero, true).unwrap();

        let data = pattern(64, 2);
        let addr = BASE.add(PAGE_SIZE - 32);
        vm.user_write(&process, addr, &data).unwrap();
        let mut buf = [0; 64];
        vm.copy_from_user(&process, addr, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[..]);
        assert!(process.page_table().is_dirty(BASE.vpn_floor()));
        assert!(process.page_table().is_dirty(BASE.add(PAGE_SIZE).vpn_floor()));
    }

    #[test]
    fn kernel_access_to_unmapped_reports_efault() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        let file = patterned_file(1, 4);
        process
            .load_segment(file, 0, BASE, PAGE_SIZE, 0, false)
            .unwrap();

        let mut buf = [0; 8];
        assert_eq!(
            vm.copy_from_user(&process, BASE.add(PAGE_SIZE), &mut buf),
            Err(errno::EFAULT)
        );
        assert_eq!(
            vm.copy_from_user(&process, VirtAddr(usize::MAX - 2), &mut buf),
            Err(errno::EFAULT)
        );
        assert!(!process.is_exited());

        // 读取照常进行
        vm.copy_from_user(&process, BASE, &mut buf).unwrap();
        assert_eq!(&buf[..], &pattern(PAGE_SIZE, 4)[..8]);
    }

    #[test]
    fn kernel_write_to_read_only_kills() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        process
            .load_segment(patterned_file(1, 6), 0, BASE, PAGE_SIZE, 0, false)
            .unwrap();

        let mut buf = [0; 8];
        vm.copy_from_user(&process, BASE, &mut buf).unwrap();
        assert_eq!(vm.copy_to_user(&process, BASE, &[7; 8]), Err(errno::ESRCH));
        assert_eq!(process.exit_code(), Some(-1));
        assert!(process.spt().is_empty());
        assert_eq!(vm.frames().free_count(), 2);
    }

    #[test]
    fn user_write_to_read_only_kills() {
        let (vm, _) = vm_with(2, 2);
        let process = vm.spawn();
        process.spt().insert(BASE, PageData::Zero, false).unwrap();

        let mut buf = [1; 4];
        vm.user_read(&process, BASE, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(vm.user_write(&process, BASE, &buf), Err(errno::ESRCH));
        assert_eq!(process.exit_code(), Some(-1));
        assert!(process.spt().is_empty());
        assert_eq!(vm.frames().free_count(), 2);
    }
}
