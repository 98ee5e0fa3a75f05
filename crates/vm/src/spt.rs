//! 补充页表：每个进程一张，记录每个用户页“应当”是什么内容

use alloc::vec::Vec;

use defines::error::{errno, KResult};
use hashbrown::{hash_map::Entry, HashMap};
use klocks::RwLock;
use triomphe::Arc;

use crate::{
    address::{VirtAddr, VirtPageNum},
    page::{Page, PageData},
    page_table::PageTable,
    Vm,
};

pub struct SupplementalPageTable {
    pid: usize,
    space: Arc<PageTable>,
    pages: RwLock<HashMap<VirtPageNum, Arc<Page>>>,
}

impl SupplementalPageTable {
    pub(crate) fn new(pid: usize, space: Arc<PageTable>) -> Self {
        Self {
            pid,
            space,
            pages: RwLock::new(HashMap::new()),
        }
    }

    /// 查找 `addr` 所在的页
    pub fn locate(&self, addr: VirtAddr) -> Option<Arc<Page>> {
        self.pages.read().get(&addr.vpn_floor()).cloned()
    }

    /// 在 `addr` 所在的页插入一项，该页已存在时返回 `EEXIST`
    pub fn insert(&self, addr: VirtAddr, data: PageData, writable: bool) -> KResult<Arc<Page>> {
        let vpn = addr.vpn_floor();
        match self.pages.write().entry(vpn) {
            Entry::Occupied(_) => Err(errno::EEXIST),
            Entry::Vacant(vacant) => {
                let page = Arc::new(Page::new(
                    vpn,
                    self.pid,
                    Arc::clone(&self.space),
                    data,
                    writable,
                ));
                vacant.insert(Arc::clone(&page));
                Ok(page)
            }
        }
    }

    /// 删除 `addr` 所在的页并释放其资源：页帧引用与映射、交换槽引用或尚未读入的文件段
    pub fn remove(&self, vm: &Vm, addr: VirtAddr) -> bool {
        let Some(page) = self.pages.write().remove(&addr.vpn_floor()) else {
            return false;
        };
        vm.release_page(&page);
        true
    }

    /// 释放所有页，进程退出时调用
    pub fn destroy(&self, vm: &Vm) {
        let pages: Vec<_> = self.pages.write().drain().map(|(_, page)| page).collect();
        for page in &pages {
            vm.release_page(page);
        }
        debug!("pid {} released {} page(s)", self.pid, pages.len());
    }

    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}
