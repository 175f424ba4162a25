//! Suspend/resume window around debug register access

use std::mem::ManuallyDrop;

use tracing::{debug, warn};

use crate::defs::{Result, ThreadControl, ThreadId};
use crate::dr::DebugContext;
use crate::error::{Error, ThreadOp};

/// A thread held suspended.
///
/// Dropping the guard resumes the thread and closes the handle, so every
/// early return between `suspend` and `resume` leaves the thread running.
pub struct Suspended<'c, C: ThreadControl> {
    control: &'c C,
    tid: ThreadId,
    /// taken exactly once, by `release`
    handle: ManuallyDrop<C::Handle>,
}

impl<'c, C: ThreadControl> Suspended<'c, C> {
    /// Opens and suspends `tid`
    pub fn new(control: &'c C, tid: ThreadId) -> Result<Self> {
        let handle = control
            .open(tid)
            .map_err(Error::access(tid, ThreadOp::Open))?;

        if let Err(errno) = control.suspend(&handle) {
            control.close(handle);
            return Err(Error::access(tid, ThreadOp::Suspend)(errno));
        }
        debug!(%tid, "thread suspended");

        Ok(Self {
            control,
            tid,
            handle: ManuallyDrop::new(handle),
        })
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn context(&self) -> Result<DebugContext> {
        self.control
            .get_debug_context(&self.handle)
            .map_err(Error::access(self.tid, ThreadOp::GetContext))
    }

    pub fn write_context(&self, ctx: &DebugContext) -> Result<()> {
        self.control
            .set_debug_context(&self.handle, ctx)
            .map_err(Error::access(self.tid, ThreadOp::SetContext))
    }

    /// Resumes the thread and closes the handle, reporting a failed resume
    pub fn resume(self) -> Result<()> {
        let mut this = ManuallyDrop::new(self);
        let tid = this.tid;
        this.release().map_err(Error::access(tid, ThreadOp::Resume))
    }

    /// Resumes and closes. Called once, from `resume` or from `drop`.
    fn release(&mut self) -> nix::Result<()> {
        let resumed = self.control.resume(&self.handle);
        // SAFETY: `resume` wraps the guard in `ManuallyDrop` before calling
        // this, so `drop` never runs after it and the handle is taken once.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        self.control.close(handle);
        debug!(tid = %self.tid, "thread resumed");
        resumed
    }
}

impl<C: ThreadControl> Drop for Suspended<'_, C> {
    fn drop(&mut self) {
        if let Err(errno) = self.release() {
            warn!(tid = %self.tid, %errno, "could not resume thread after a failed operation");
        }
    }
}

/// Reads the debug registers of `tid` without changing them
#[tracing::instrument(skip(control))]
pub fn read_context<C: ThreadControl>(control: &C, tid: ThreadId) -> Result<DebugContext> {
    let suspended = Suspended::new(control, tid)?;
    let ctx = suspended.context()?;
    suspended.resume()?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    use super::*;
    use crate::dr::{Condition, Length, Slot};
    use crate::fake::FakeThreads;

    #[test]
    fn read_context_leaves_thread_running() {
        let threads = FakeThreads::new();
        let tid = Pid::from_raw(3);
        threads.spawn(tid);
        let mut ctx = DebugContext::default();
        ctx.encode_slot(Slot::Dr3, 0xbeef, Condition::Execute, Length::One);
        threads.set_context(tid, ctx);

        assert_eq!(read_context(&threads, tid).unwrap(), ctx);
        assert_eq!(threads.suspend_count(tid), 0);
        assert_eq!(threads.open_handles(), 0);
    }

    #[test]
    fn dropped_guard_resumes() {
        let threads = FakeThreads::new();
        let tid = Pid::from_raw(3);
        threads.spawn(tid);

        let suspended = Suspended::new(&threads, tid).unwrap();
        assert_eq!(suspended.tid(), tid);
        assert_eq!(threads.suspend_count(tid), 1);
        drop(suspended);

        assert_eq!(threads.suspend_count(tid), 0);
        assert_eq!(threads.open_handles(), 0);
    }

    #[test]
    fn failed_suspend_closes_handle() {
        let threads = FakeThreads::new();
        let tid = Pid::from_raw(3);
        threads.spawn(tid);
        threads.fail(ThreadOp::Suspend, Errno::EPERM);

        let err = read_context(&threads, tid).unwrap_err();
        assert!(matches!(err, Error::Access { op: ThreadOp::Suspend, source: Errno::EPERM, .. }));
        assert_eq!(threads.open_handles(), 0);
        assert_eq!(threads.calls(ThreadOp::Resume), 0);
    }

    #[test]
    fn failed_resume_still_closes_handle() {
        let threads = FakeThreads::new();
        let tid = Pid::from_raw(3);
        threads.spawn(tid);

        let suspended = Suspended::new(&threads, tid).unwrap();
        threads.fail(ThreadOp::Resume, Errno::ESRCH);
        let err = suspended.resume().unwrap_err();
        assert!(matches!(err, Error::Access { op: ThreadOp::Resume, .. }));
        assert_eq!(threads.calls(ThreadOp::Resume), 1);
        assert_eq!(threads.open_handles(), 0);
    }
}
