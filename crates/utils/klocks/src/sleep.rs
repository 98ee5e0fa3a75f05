//! 基于 `event_listener` 和自旋锁的睡眠锁。
//!
//! 拿不到锁的线程阻塞在事件上，而不是一直自旋，适合持有期间会做慢速 I/O 的场合

use core::{
    fmt,
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use event_listener::Event;
use spin::mutex::SpinMutexGuard;

pub struct SleepMutex<T: ?Sized> {
    lock_ops: Event,
    base: spin::mutex::SpinMutex<T>,
}

pub struct SleepMutexGuard<'a, T: ?Sized> {
    spin_guard: ManuallyDrop<SpinMutexGuard<'a, T>>,
    mutex: &'a SleepMutex<T>,
    // 必须在加锁的线程上释放
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Send> Send for SleepMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SleepMutexGuard<'_, T> {}

impl<T> SleepMutex<T> {
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        SleepMutex {
            lock_ops: Event::new(),
            base: spin::mutex::SpinMutex::new(data),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }
}

impl<T: ?Sized> SleepMutex<T> {
    #[inline]
    pub fn lock(&self) -> SleepMutexGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }
        self.acquire_slow()
    }

    #[cold]
    fn acquire_slow(&self) -> SleepMutexGuard<'_, T> {
        loop {
            let listener = self.lock_ops.listen();
            // 建立监听之前锁可能已经被释放了，重新试一次
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            #[cfg(feature = "std")]
            {
                use event_listener::Listener;
                listener.wait();
            }
            #[cfg(not(feature = "std"))]
            {
                drop(listener);
                while self.is_locked() {
                    core::hint::spin_loop();
                }
            }
            if let Some(guard) = self.try_lock() {
                return guard;
            }
        }
    }

    /// 只是一个提示，返回时结果可能已经过时
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.base.is_locked()
    }

    #[inline(always)]
    pub fn try_lock(&self) -> Option<SleepMutexGuard<'_, T>> {
        self.base.try_lock().map(|spin_guard| SleepMutexGuard {
            spin_guard: ManuallyDrop::new(spin_guard),
            mutex: self,
            _not_send: PhantomData,
        })
    }

    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.base.get_mut()
    }
}

impl<T: ?Sized + Default> Default for SleepMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SleepMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "SleepMutex {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "SleepMutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized> Deref for SleepMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.spin_guard
    }
}

impl<T: ?Sized> DerefMut for SleepMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.spin_guard
    }
}

impl<T: ?Sized> Drop for SleepMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: 只会在这里 drop，之后再也不会被用到
        unsafe {
            ManuallyDrop::drop(&mut self.spin_guard);
        }
        self.mutex.lock_ops.notify(1);
    }
}
