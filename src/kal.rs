//! Kernel abstraction layer
//!
//! The engine never parks a thread itself. Every blocking wait is a loop that
//! re-checks its condition and hands the CPU back through [`Kernel::yield_now`]
//! until the condition holds or the deadline passes, so the same code runs on
//! the kernel scheduler and on host threads in tests.

use spin::{Mutex, MutexGuard};

use crate::{Result, UsbError};

/// Timeout value meaning "wait forever"
pub const TIMEOUT_INFINITE: u32 = 0;

/// Scheduler services the engine needs from the kernel
pub trait Kernel: Send + Sync {
    /// Monotonic time in milliseconds
    fn now_ms(&self) -> u64;

    /// Give up the CPU while waiting on a condition
    fn yield_now(&self);
}

impl<K: Kernel + ?Sized> Kernel for alloc::sync::Arc<K> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}

/// Point in time after which a wait gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at_ms: Option<u64>,
}

impl Deadline {
    /// Deadline `timeout_ms` from now; [`TIMEOUT_INFINITE`] never expires
    pub fn after(kernel: &dyn Kernel, timeout_ms: u32) -> Self {
        let at_ms = match timeout_ms {
            TIMEOUT_INFINITE => None,
            ms => Some(kernel.now_ms().saturating_add(u64::from(ms))),
        };
        Self { at_ms }
    }

    pub fn expired(&self, kernel: &dyn Kernel) -> bool {
        match self.at_ms {
            Some(at) => kernel.now_ms() >= at,
            None => false,
        }
    }
}

/// Re-evaluate `poll` until it yields a value or the deadline passes.
///
/// `poll` returns `None` to keep waiting.
pub fn wait_until<T>(
    kernel: &dyn Kernel,
    deadline: Deadline,
    mut poll: impl FnMut() -> Option<Result<T>>,
) -> Result<T> {
    loop {
        if let Some(result) = poll() {
            return result;
        }
        if deadline.expired(kernel) {
            return Err(UsbError::Timeout);
        }
        kernel.yield_now();
    }
}

/// Counting semaphore
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
    }

    /// Take one unit, waiting at most `timeout_ms`
    pub fn pend(&self, kernel: &dyn Kernel, timeout_ms: u32) -> Result<()> {
        let deadline = Deadline::after(kernel, timeout_ms);
        wait_until(kernel, deadline, || {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                Some(Ok(()))
            } else {
                None
            }
        })
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}

/// Exclusive lock that can be held across blocking calls.
///
/// Waiters yield to the kernel between attempts instead of spinning.
#[derive(Debug, Default)]
pub struct Lock {
    inner: Mutex<()>,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn acquire(&self, kernel: &dyn Kernel, timeout_ms: u32) -> Result<LockGuard<'_>> {
        let deadline = Deadline::after(kernel, timeout_ms);
        wait_until(kernel, deadline, || {
            self.inner
                .try_lock()
                .map(|guard| Ok(LockGuard { _guard: guard }))
        })
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Releases the [`Lock`] on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}
