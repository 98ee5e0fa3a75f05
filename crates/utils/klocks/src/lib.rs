#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod gate;
mod kspin;
mod sleep;

pub use gate::Gate;
pub use kspin::{SpinMutex, SpinMutexGuard};
pub use sleep::{SleepMutex, SleepMutexGuard};
pub use spin::{Lazy, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
