//! 文件系统一侧提供给虚拟内存的接口

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use klocks::SpinMutex;

/// 文件的身份。同一文件的所有句柄身份相同，用于识别可共享的只读页
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub usize);

pub trait File: Send + Sync {
    fn identity(&self) -> FileId;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// 从 `offset` 处读取，返回实际读到的字节数
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
    /// 从 `offset` 处写入，返回实际写入的字节数。不会扩展文件
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;
}

pub type FileHandle = Arc<dyn File>;

static NEXT_FILE_ID: AtomicUsize = AtomicUsize::new(1);

/// 内存中的文件
pub struct MemFile {
    id: FileId,
    data: SpinMutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            id: FileId(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed)),
            data: SpinMutex::new(data),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn identity(&self) -> FileId {
        self.id
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let Some(src) = data.get(offset..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        let Some(dst) = data.get_mut(offset..) else {
            return 0;
        };
        let n = dst.len().min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_within_length() {
        let file = MemFile::new(vec![1, 2, 3, 4]);
        let mut buf = [0; 8];
        assert_eq!(file.read_at(2, &mut buf), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(file.read_at(9, &mut buf), 0);

        assert_eq!(file.write_at(3, &[9, 9]), 1);
        assert_eq!(file.snapshot(), vec![1, 2, 3, 9]);
        assert_ne!(file.identity(), MemFile::new(Vec::new()).identity());
    }
}
