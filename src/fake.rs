//! In-memory threads for exercising the register protocol without ptrace

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;

use crate::defs::{ThreadControl, ThreadId};
use crate::dr::DebugContext;
use crate::error::ThreadOp;

#[derive(Debug, Default)]
struct FakeThread {
    ctx: DebugContext,
    suspend_count: u32,
    stale: Option<DebugContext>,
}

#[derive(Debug, Default)]
struct State {
    threads: HashMap<ThreadId, FakeThread>,
    failures: HashMap<ThreadOp, Errno>,
    calls: HashMap<ThreadOp, usize>,
    open_handles: usize,
}

#[derive(Debug, Default)]
pub struct FakeThreads {
    state: Mutex<State>,
}

#[derive(Debug)]
pub struct FakeHandle(ThreadId);

impl FakeThreads {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn spawn(&self, tid: ThreadId) {
        self.state().threads.insert(tid, FakeThread::default());
    }

    pub fn context(&self, tid: ThreadId) -> DebugContext {
        self.state().threads[&tid].ctx
    }

    pub fn set_context(&self, tid: ThreadId, ctx: DebugContext) {
        self.state().threads.get_mut(&tid).unwrap().ctx = ctx;
    }

    pub fn suspend_count(&self, tid: ThreadId) -> u32 {
        self.state().threads[&tid].suspend_count
    }

    pub fn set_suspend_count(&self, tid: ThreadId, count: u32) {
        self.state().threads.get_mut(&tid).unwrap().suspend_count = count;
    }

    /// The next context read of `tid` returns `ctx` instead of the live one
    pub fn serve_stale_context(&self, tid: ThreadId, ctx: DebugContext) {
        self.state().threads.get_mut(&tid).unwrap().stale = Some(ctx);
    }

    /// Makes every later `op` fail with `errno`
    pub fn fail(&self, op: ThreadOp, errno: Errno) {
        self.state().failures.insert(op, errno);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self, op: ThreadOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    fn call(&self, op: ThreadOp, tid: ThreadId) -> nix::Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(&errno) = state.failures.get(&op) {
            return Err(errno);
        }
        if !state.threads.contains_key(&tid) {
            return Err(Errno::ESRCH);
        }
        Ok(state)
    }
}

impl ThreadControl for FakeThreads {
    type Handle = FakeHandle;

    fn open(&self, tid: ThreadId) -> nix::Result<FakeHandle> {
        let mut state = self.call(ThreadOp::Open, tid)?;
        state.open_handles += 1;
        Ok(FakeHandle(tid))
    }

    fn suspend(&self, handle: &FakeHandle) -> nix::Result<()> {
        let mut state = self.call(ThreadOp::Suspend, handle.0)?;
        state.threads.get_mut(&handle.0).ok_or(Errno::ESRCH)?.suspend_count += 1;
        Ok(())
    }

    fn resume(&self, handle: &FakeHandle) -> nix::Result<()> {
        let mut state = self.call(ThreadOp::Resume, handle.0)?;
        let thread = state.threads.get_mut(&handle.0).ok_or(Errno::ESRCH)?;
        thread.suspend_count = thread.suspend_count.checked_sub(1).ok_or(Errno::EINVAL)?;
        Ok(())
    }

    fn get_debug_context(&self, handle: &FakeHandle) -> nix::Result<DebugContext> {
        let mut state = self.call(ThreadOp::GetContext, handle.0)?;
        let thread = state.threads.get_mut(&handle.0).ok_or(Errno::ESRCH)?;
        if thread.suspend_count == 0 {
            return Err(Errno::ESRCH);
        }
        Ok(thread.stale.take().unwrap_or(thread.ctx))
    }

    fn set_debug_context(&self, handle: &FakeHandle, ctx: &DebugContext) -> nix::Result<()> {
        let mut state = self.call(ThreadOp::SetContext, handle.0)?;
        let thread = state.threads.get_mut(&handle.0).ok_or(Errno::ESRCH)?;
        if thread.suspend_count == 0 {
            return Err(Errno::ESRCH);
        }
        thread.ctx.address = ctx.address;
        thread.ctx.control = ctx.control;
        Ok(())
    }

    fn close(&self, _handle: FakeHandle) {
        self.state().open_handles -= 1;
    }
}

