//! 一次性开合的就绪门。关闭时等待者阻塞，打开时唤醒所有等待者。
//!
//! 用于表示某个异步 I/O 尚未完成，比如交换槽正在被写出或读入。
//! 等待时不能持有任何锁。

use core::sync::atomic::{AtomicBool, Ordering};

use event_listener::Event;

pub struct Gate {
    open: AtomicBool,
    event: Event,
}

impl Gate {
    pub const fn new_open() -> Self {
        Self {
            open: AtomicBool::new(true),
            event: Event::new(),
        }
    }

    pub const fn new_closed() -> Self {
        Self {
            open: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 打开门并唤醒所有等待者
    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// 阻塞直到门被打开。门本来就开着则立即返回
    pub fn wait(&self) {
        loop {
            if self.is_open() {
                return;
            }
            let listener = self.event.listen();
            // 注册监听之后再检查一次，避免错过 `open` 中的通知
            if self.is_open() {
                return;
            }
            #[cfg(feature = "std")]
            {
                use event_listener::Listener;
                listener.wait();
            }
            #[cfg(not(feature = "std"))]
            {
                drop(listener);
                while !self.is_open() {
                    core::hint::spin_loop();
                }
            }
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new_open()
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gate").field("open", &self.is_open()).finish()
    }
}
