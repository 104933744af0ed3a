use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// A spinlock guarding a value of type `T`.
///
/// Acquiring disables interrupts on the current hart (via [`InterruptLock`])
/// so that the holder cannot be preempted or take a timer interrupt while
/// holding the lock, matching the push_off/pop_off discipline used
/// throughout the kernel.
// Locked when the cpu pointer is not null.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// # Safety
    /// Must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu() as *mut Cpu,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock: intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases a held lock without consuming an interrupt-lock-holding guard, for use only when
    /// a guard was handed to another context (e.g. `fork_ret`, which inherits a locked `Proc`
    /// from the scheduler without ever constructing a `SpinLockGuard` itself).
    ///
    /// # Safety
    /// The caller must be certain the lock is currently held by this hart and that no
    /// `SpinLockGuard` for it is still live.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "release {}", self.name);
        }
        self.cpu.store(ptr::null_mut(), Ordering::Release);
        pop_off_raw();
    }

    /// Releases `guard` early, returning the lock so it can be re-acquired later.
    ///
    /// Used by `proc::sleep` to atomically hand off a caller-supplied lock: the process lock is
    /// taken first, then the condition lock is released via this function before sleeping.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Returns a mutable reference to the guarded value without acquiring the lock.
    ///
    /// # Safety
    /// The caller must ensure no other hart can concurrently access the value, e.g. because
    /// interrupts are disabled and the caller is the only reader (debug dump paths).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        unsafe {
            assert!(self.lock.holding(), "release {}", self.lock.name);
        }
        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// Pops one layer of the current hart's interrupt-disable nesting without an `InterruptLock`
/// value to drop. Only used by [`SpinLock::force_unlock`].
pub(crate) fn pop_off_raw() {
    unsafe { current_cpu().unlock() }
}
