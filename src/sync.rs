//! Lock primitives for the acquisition order in spec.md §5.
//!
//! The teacher builds on `spin` (bare metal, no OS scheduler, so a spinning
//! mutex is the only option). BFS's concurrency model is explicitly native
//! OS threads that block, so these wrap `parking_lot` instead — the same
//! crate the teacher's own host-side build tool
//! (`build/Cargo.toml`) already depends on. `RecursiveLock` plays the role
//! of the original's `recursive_lock` (journal lock, allocator lock);
//! `RecursiveRwLock` plays the role of the per-inode read/write lock, whose
//! write side must support recursive reacquisition by the thread already
//! holding it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use parking_lot::ReentrantMutex;

/// A mutex the same thread may reacquire any number of times, matching the
/// journal lock and the block-allocator lock (§5, locks 2 and 4).
pub struct RecursiveLock<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

pub struct RecursiveLockGuard<'a, T> {
    guard: parking_lot::ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<T> RecursiveLock<T> {
    pub fn new(value: T) -> Self {
        RecursiveLock { inner: ReentrantMutex::new(RefCell::new(value)) }
    }

    pub fn lock(&self) -> RecursiveLockGuard<'_, T> {
        RecursiveLockGuard { guard: self.inner.lock() }
    }
}

impl<'a, T> RecursiveLockGuard<'a, T> {
    pub fn borrow(&self) -> std::cell::Ref<'_, T> {
        self.guard.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, T> {
        self.guard.borrow_mut()
    }
}

/// Multi-reader / single-writer lock whose write side nests: a thread that
/// already holds the write lock may call back into code that takes it
/// again without deadlocking (§5, lock 3). Reads never upgrade; writes
/// never downgrade.
pub struct RecursiveRwLock<T> {
    state: Mutex<State>,
    cond: Condvar,
    cell: RefCell<T>,
}

enum State {
    Unlocked,
    Read(u32),
    Write { owner: ThreadId, depth: u32, pending_readers: VecDeque<()> },
}

// SAFETY: `cell` is only ever touched while `state` proves this thread has
// exclusive (write) or shared (read, via `&T` only) access; `RefCell`'s
// runtime borrow checks catch any residual aliasing attempt instead of
// letting it become undefined behavior.
unsafe impl<T: Send> Send for RecursiveRwLock<T> {}
unsafe impl<T: Send> Sync for RecursiveRwLock<T> {}

impl<T> RecursiveRwLock<T> {
    pub fn new(value: T) -> Self {
        RecursiveRwLock { state: Mutex::new(State::Unlocked), cond: Condvar::new(), cell: RefCell::new(value) }
    }

    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &mut *state {
                State::Unlocked => {
                    *state = State::Read(1);
                    break;
                }
                State::Read(n) => {
                    *n += 1;
                    break;
                }
                State::Write { owner, .. } if *owner == std::thread::current().id() => {
                    // The writer reads its own data; no separate guard needed.
                    break;
                }
                State::Write { .. } => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
        RwReadGuard { lock: self }
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let this_thread = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match &mut *state {
                State::Unlocked => {
                    *state = State::Write { owner: this_thread, depth: 1, pending_readers: VecDeque::new() };
                    break;
                }
                State::Write { owner, depth, .. } if *owner == this_thread => {
                    *depth += 1;
                    break;
                }
                State::Read(_) | State::Write { .. } => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
        RwWriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Read(n) = &mut *state {
            *n -= 1;
            if *n == 0 {
                *state = State::Unlocked;
                self.cond.notify_all();
            }
        }
        // Read taken while the calling thread already held the write lock
        // is a no-op release (see `read()` above).
    }

    fn release_write(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Write { depth, .. } = &mut *state {
            *depth -= 1;
            if *depth == 0 {
                *state = State::Unlocked;
                self.cond.notify_all();
            }
        }
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a RecursiveRwLock<T>,
}

impl<'a, T> std::ops::Deref for RwReadGuard<'a, T> {
    type Target = RefCell<T>;
    fn deref(&self) -> &RefCell<T> {
        &self.lock.cell
    }
}

impl<'a, T> Drop for RwReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a RecursiveRwLock<T>,
}

impl<'a, T> std::ops::Deref for RwWriteGuard<'a, T> {
    type Target = RefCell<T>;
    fn deref(&self) -> &RefCell<T> {
        &self.lock.cell
    }
}

impl<'a, T> Drop for RwWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_lock_reenters_same_thread() {
        let lock = RecursiveLock::new(0);
        let g1 = lock.lock();
        *g1.borrow_mut() += 1;
        {
            let g2 = lock.lock();
            *g2.borrow_mut() += 1;
        }
        assert_eq!(*g1.borrow(), 2);
    }

    #[test]
    fn rwlock_write_recurses_on_same_thread() {
        let lock = RecursiveRwLock::new(vec![1, 2, 3]);
        let g1 = lock.write();
        g1.borrow_mut().push(4);
        {
            let g2 = lock.write();
            g2.borrow_mut().push(5);
        }
        assert_eq!(*g1.borrow(), vec![1, 2, 3, 4, 5]);
    }
}
