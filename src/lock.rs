//! Per-thread serialization of debug register updates
//!
//! Two read-modify-write cycles on the same thread that interleave can both
//! pick the same free slot, and the later write silently replaces the
//! earlier one. Breakpoint operations therefore take a [`ThreadToken`],
//! and only one token per thread exists at a time.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::defs::ThreadId;

#[derive(Debug, Default)]
pub struct ThreadLocks {
    held: Mutex<HashSet<ThreadId>>,
    released: Condvar,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<ThreadId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no other token for `tid` is alive
    pub fn lock(&self, tid: ThreadId) -> ThreadToken<'_> {
        let mut held = self.held();
        while held.contains(&tid) {
            debug!(%tid, "waiting for debug register lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(tid);
        ThreadToken { locks: self, tid }
    }

    /// Takes the token for `tid` if it is free
    pub fn try_lock(&self, tid: ThreadId) -> Option<ThreadToken<'_>> {
        let mut held = self.held();
        if held.insert(tid) {
            Some(ThreadToken { locks: self, tid })
        } else {
            None
        }
    }
}

/// Proof that the holder is the only one updating the debug registers of
/// `tid` through the same [`ThreadLocks`]
#[derive(Debug)]
pub struct ThreadToken<'a> {
    locks: &'a ThreadLocks,
    tid: ThreadId,
}

impl ThreadToken<'_> {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

impl Drop for ThreadToken<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.tid);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn one_token_per_thread() {
        let locks = ThreadLocks::new();
        let token = locks.lock(Pid::from_raw(10));
        assert!(locks.try_lock(Pid::from_raw(10)).is_none());
        assert!(locks.try_lock(Pid::from_raw(11)).is_some());
        drop(token);
        assert!(locks.try_lock(Pid::from_raw(10)).is_some());
    }

    #[test]
    fn lock_waits_for_release() {
        let locks = ThreadLocks::new();
        let released = AtomicBool::new(false);
        let token = locks.lock(Pid::from_raw(7));

        thread::scope(|s| {
            s.spawn(|| {
                let second = locks.lock(Pid::from_raw(7));
                assert!(released.load(Ordering::SeqCst));
                assert_eq!(second.tid(), Pid::from_raw(7));
            });
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(token);
        });
    }
}
