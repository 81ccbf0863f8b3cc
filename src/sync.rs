//! Lowest-level primitives the rest of the kernel is built on: raw port I/O
//! and an IRQ-save test-and-set spinlock. Every per-resource lock named in
//! the concurrency model (run queues, sleep queue, fd tables, ...) is one of
//! these, never a borrowed `spin::Mutex`.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A single x86 I/O port, typed by transfer width.
pub struct Port<T> {
    port: u16,
    _marker: core::marker::PhantomData<T>,
}

impl Port<u8> {
    pub const fn new(port: u16) -> Self {
        Port { port, _marker: core::marker::PhantomData }
    }

    #[inline]
    pub fn read(&self) -> u8 {
        let value: u8;
        unsafe { asm!("in al, dx", out("al") value, in("dx") self.port, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    pub fn write(&self, value: u8) {
        unsafe { asm!("out dx, al", in("dx") self.port, in("al") value, options(nomem, nostack, preserves_flags)) };
    }
}

impl Port<u16> {
    pub const fn new(port: u16) -> Self {
        Port { port, _marker: core::marker::PhantomData }
    }

    #[inline]
    pub fn read(&self) -> u16 {
        let value: u16;
        unsafe { asm!("in ax, dx", out("ax") value, in("dx") self.port, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    pub fn write(&self, value: u16) {
        unsafe { asm!("out dx, ax", in("dx") self.port, in("ax") value, options(nomem, nostack, preserves_flags)) };
    }
}

impl Port<u32> {
    pub const fn new(port: u16) -> Self {
        Port { port, _marker: core::marker::PhantomData }
    }

    #[inline]
    pub fn read(&self) -> u32 {
        let value: u32;
        unsafe { asm!("in eax, dx", out("eax") value, in("dx") self.port, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    pub fn write(&self, value: u32) {
        unsafe { asm!("out dx, eax", in("dx") self.port, in("eax") value, options(nomem, nostack, preserves_flags)) };
    }
}

/// Read the current EFLAGS and `cli`. The paired `restore_irq` undoes exactly
/// this, so nested callers each save their own snapshot rather than a single
/// global enable/disable flag — required for nested nested spinlocks (see
/// concurrency model: "nested spinlocks nest these saves").
#[inline]
pub fn save_irq_and_disable() -> u32 {
    let flags: u32;
    unsafe {
        asm!(
            "pushfd",
            "pop {0}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags
}

#[inline]
pub fn restore_irq(flags: u32) {
    unsafe {
        asm!("push {0}", "popfd", in(reg) flags, options(nomem));
    }
}

/// Test-and-set spinlock that saves/restores EFLAGS (and therefore the
/// interrupt flag) around the critical section. This is the one lock type
/// used for every shared kernel structure; see the concurrency model's
/// per-resource lock list and lock ordering rule.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u32,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        IrqSpinLock { locked: AtomicBool::new(false), data: UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_flags = save_irq_and_disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        IrqSpinLockGuard { lock: self, saved_flags }
    }

    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_irq_and_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard { lock: self, saved_flags })
        } else {
            restore_irq(saved_flags);
            None
        }
    }

    /// # Safety
    /// Caller must guarantee no other guard to this lock is alive.
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Consume the lock and take its contents. Statically impossible to race
    /// since it requires ownership of the lock itself.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<'a, T> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_irq(self.saved_flags);
    }
}

/// A cell that can be written exactly once, then read lock-free forever
/// after. Replaces the `g_*` raw-pointer singleton idiom for the syscall
/// table, the VFS root and other boot-time-constructed globals.
pub struct OnceInit<T> {
    state: AtomicU32,
    data: UnsafeCell<core::mem::MaybeUninit<T>>,
}

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const INIT: u32 = 2;

unsafe impl<T: Send + Sync> Sync for OnceInit<T> {}

impl<T> OnceInit<T> {
    pub const fn new() -> Self {
        OnceInit { state: AtomicU32::new(UNINIT), data: UnsafeCell::new(core::mem::MaybeUninit::uninit()) }
    }

    /// Set the value. Panics if called more than once.
    pub fn init(&self, value: T) {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            panic!("OnceInit::init called twice");
        }
        unsafe { (*self.data.get()).write(value) };
        self.state.store(INIT, Ordering::Release);
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == INIT {
            Some(unsafe { (*self.data.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_or_panic(&self) -> &T {
        self.get().expect("OnceInit read before init")
    }
}
