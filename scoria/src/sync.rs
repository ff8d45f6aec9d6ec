//! Synchronization primitives shared by the task system and the GPU layer.
//!
//! The upgradable mutex packs its whole state into one atomic byte:
//! bit 0 is the writer, bit 1 the upgrader, and the remaining bits count
//! readers in increments of 4. Blocking operations spin with exponential
//! backoff and fall back to yielding to the OS scheduler; there is no
//! queue, so the lock is best suited for short critical sections (which
//! is all the task scheduler needs).

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

const WRITER: u8 = 1;
const UPGRADED: u8 = 2;
const READER: u8 = 4;

/// Bounded spin that degrades to `yield_now` once the spin budget is spent.
#[derive(Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

/// The raw lock state, without any protected data attached.
pub struct RawUpgradableMutex {
    bits: AtomicU8,
}

impl Default for RawUpgradableMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawUpgradableMutex {
    pub const fn new() -> RawUpgradableMutex {
        RawUpgradableMutex { bits: AtomicU8::new(0) }
    }

    fn acquire_lock(&self, mut try_fn: impl FnMut(&Self) -> bool) {
        let mut backoff = Backoff::default();
        while !try_fn(self) {
            backoff.snooze();
        }
    }

    /// Attempt to acquire writer permission. Returns false if we didn't get it.
    pub fn try_lock(&self) -> bool {
        self.bits
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        self.acquire_lock(Self::try_lock);
    }

    /// The writer is responsible for clearing both the `UPGRADED` and
    /// `WRITER` bits.
    pub fn unlock(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) & WRITER != 0);
        self.bits.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }

    /// Try to get reader permission. This can fail if someone holds the
    /// lock as a writer or upgrader: the `UPGRADED` bit lets a
    /// writer-to-be block new readers while it waits for existing readers
    /// to drain, which keeps promoted upgraders from starving.
    pub fn try_lock_shared(&self) -> bool {
        let value = self.bits.fetch_add(READER, Ordering::Acquire);
        if value & (WRITER | UPGRADED) != 0 {
            self.bits.fetch_sub(READER, Ordering::Release);
            return false;
        }
        true
    }

    pub fn lock_shared(&self) {
        self.acquire_lock(Self::try_lock_shared);
    }

    pub fn unlock_shared(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) >= READER);
        self.bits.fetch_sub(READER, Ordering::Release);
    }

    /// Try to acquire an upgradable lock. Coexists with readers but not
    /// with a writer or another upgrader.
    pub fn try_lock_upgrade(&self) -> bool {
        let value = self.bits.fetch_or(UPGRADED, Ordering::Acquire);
        value & (WRITER | UPGRADED) == 0
    }

    pub fn lock_upgrade(&self) {
        self.acquire_lock(Self::try_lock_upgrade);
    }

    pub fn unlock_upgrade(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) & UPGRADED != 0);
        self.bits.fetch_sub(UPGRADED, Ordering::Release);
    }

    /// Atomically release the upgrade lock and acquire the write lock,
    /// waiting for the remaining readers to drain.
    pub fn unlock_upgrade_and_lock(&self) {
        let mut backoff = Backoff::default();
        loop {
            if self
                .bits
                .compare_exchange(UPGRADED, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Downgrade the lock from writer status to reader status.
    pub fn unlock_and_lock_shared(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) & WRITER != 0);
        self.bits.fetch_add(READER, Ordering::Acquire);
        self.bits.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }

    /// Downgrade from writer status to upgrader status.
    pub fn unlock_and_lock_upgrade(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) & WRITER != 0);
        self.bits.fetch_or(UPGRADED, Ordering::Acquire);
        self.bits.fetch_and(!WRITER, Ordering::Release);
    }

    /// Release the upgrade lock and take a read lock atomically.
    pub fn unlock_upgrade_and_lock_shared(&self) {
        debug_assert!(self.bits.load(Ordering::Relaxed) & UPGRADED != 0);
        self.bits.fetch_add(READER, Ordering::Acquire);
        self.bits.fetch_sub(UPGRADED, Ordering::Release);
    }
}

/// An upgradable reader-writer lock protecting a value.
///
/// `read` gives shared access, `write` exclusive access, and `upgrade`
/// an intent-to-write position that coexists with readers and can be
/// turned into a write lock without releasing it in between.
pub struct UpgradableSharedMutex<T: ?Sized> {
    raw: RawUpgradableMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for UpgradableSharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for UpgradableSharedMutex<T> {}

impl<T> UpgradableSharedMutex<T> {
    pub const fn new(value: T) -> UpgradableSharedMutex<T> {
        UpgradableSharedMutex {
            raw: RawUpgradableMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> UpgradableSharedMutex<T> {
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.lock_shared();
        ReadGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.lock();
        WriteGuard { lock: self }
    }

    pub fn upgrade(&self) -> UpgradeGuard<'_, T> {
        self.raw.lock_upgrade();
        UpgradeGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.raw.try_lock_shared().then(|| ReadGuard { lock: self })
    }

    /// Access to the raw lock state, for callers that manage guards by hand.
    pub fn raw(&self) -> &RawUpgradableMutex {
        &self.raw
    }
}

pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a UpgradableSharedMutex<T>,
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_shared();
    }
}

pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a UpgradableSharedMutex<T>,
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

impl<'a, T: ?Sized> WriteGuard<'a, T> {
    /// Downgrade to a shared lock without letting a writer slip in between.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.raw.unlock_and_lock_shared();
        ReadGuard { lock }
    }
}

pub struct UpgradeGuard<'a, T: ?Sized> {
    lock: &'a UpgradableSharedMutex<T>,
}

impl<T: ?Sized> Deref for UpgradeGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for UpgradeGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_upgrade();
    }
}

impl<'a, T: ?Sized> UpgradeGuard<'a, T> {
    /// Promote to a write lock, waiting for readers to drain.
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.raw.unlock_upgrade_and_lock();
        WriteGuard { lock }
    }

    /// Step down to an ordinary read lock.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.raw.unlock_upgrade_and_lock_shared();
        ReadGuard { lock }
    }
}

/// A counting semaphore with a configurable maximum.
pub struct Semaphore {
    count: Mutex<usize>,
    max: usize,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize, max: usize) -> Semaphore {
        assert!(initial <= max);
        Semaphore {
            count: Mutex::new(initial),
            max,
            condvar: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Returns `n` permits, saturating at the configured maximum.
    pub fn release(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count = (*count + n).min(self.max);
        drop(count);
        if n == 1 {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn writer_is_exclusive() {
        let lock = Arc::new(UpgradableSharedMutex::new(0u32));
        let in_critical = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let in_critical = in_critical.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = lock.write();
                        let n = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        *guard += 1;
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.read(), 4000);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readers_and_writer_never_coexist() {
        let lock = Arc::new(UpgradableSharedMutex::new(()));
        let readers = Arc::new(AtomicU32::new(0));
        let violation = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::new();
        for _ in 0..3 {
            let lock = lock.clone();
            let readers = readers.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = lock.read();
                    readers.fetch_add(1, Ordering::SeqCst);
                    std::hint::spin_loop();
                    readers.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        {
            let lock = lock.clone();
            let readers = readers.clone();
            let violation = violation.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = lock.write();
                    if readers.load(Ordering::SeqCst) != 0 {
                        violation.store(true, Ordering::SeqCst);
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(!violation.load(Ordering::SeqCst));
    }

    /// An upgrader blocks new readers (so it cannot be starved by them)
    /// while coexisting with the readers that got in first.
    #[test]
    fn upgrader_backs_off_new_readers() {
        let lock = UpgradableSharedMutex::new(());

        let reader = lock.read();
        let upgrader = lock.upgrade();

        // A late reader observes the upgraded bit and backs off.
        assert!(lock.try_read().is_none());

        drop(reader);
        let write = upgrader.upgrade();
        drop(write);

        // Fully released: readers come back.
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn semaphore_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0, 4));
        let woke = Arc::new(AtomicBool::new(false));

        let t = {
            let sem = sem.clone();
            let woke = woke.clone();
            thread::spawn(move || {
                sem.acquire();
                woke.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));
        sem.release(1);
        t.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn semaphore_release_saturates_at_max() {
        let sem = Semaphore::new(0, 2);
        sem.release(10);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }
}
