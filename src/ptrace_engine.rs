//! nix ptrace backend for [`ThreadControl`]
//!
//! Threads are seized on first use and stay attached until the engine is
//! dropped: the kernel discards ptrace-installed hardware breakpoints when
//! the tracer detaches.
//!
//! ptrace requests are only honoured from the thread that attached, so every
//! request runs on one tracer thread owned by the engine. Between requests
//! that thread reaps stops of tracees that are supposed to be running and
//! continues them with their signal, so a seized thread never sits in a
//! signal-delivery-stop.
//!
//! Refs:
//! - A debugger using ptrace: https://blog.tartanllama.xyz/writing-a-linux-debugger-setup/
//! - ptrace(2), "Attaching and detaching" and "PTRACE_INTERRUPT"

use std::collections::HashMap;
use std::mem;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, AddressType};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use tracing::{debug, warn};

use crate::defs::{ThreadControl, ThreadId};
use crate::dr::{DebugContext, Dr6, Dr7};

const DR6: usize = 6;
const DR7: usize = 7;

/// How long a running tracee may wait in a signal-delivery-stop
const REAP_INTERVAL: Duration = Duration::from_millis(5);

/// Byte offset of `u_debugreg[n]` in the tracee's `struct user`
fn debugreg_offset(n: usize) -> AddressType {
    (mem::offset_of!(libc::user, u_debugreg) + n * mem::size_of::<u64>()) as AddressType
}

type Job = Box<dyn FnOnce(&mut Tracer) + Send>;

#[derive(Debug, Default)]
struct Tracee {
    /// outstanding suspensions, the thread runs when this is zero
    suspend_count: u32,
}

/// State owned by the tracer thread
#[derive(Debug, Default)]
struct Tracer {
    tracees: HashMap<ThreadId, Tracee>,
}

impl Tracer {
    fn tracee(&mut self, tid: ThreadId) -> nix::Result<&mut Tracee> {
        self.tracees.get_mut(&tid).ok_or(Errno::ESRCH)
    }

    fn attach(&mut self, tid: ThreadId) -> nix::Result<()> {
        if !self.tracees.contains_key(&tid) {
            ptrace::seize(tid, ptrace::Options::empty())?;
            debug!(%tid, "seized thread");
            self.tracees.insert(tid, Tracee::default());
        }
        Ok(())
    }

    fn suspend(&mut self, tid: ThreadId) -> nix::Result<()> {
        if self.tracee(tid)?.suspend_count == 0 {
            if let Err(errno) = interrupt(tid) {
                if errno == Errno::ESRCH {
                    self.tracees.remove(&tid);
                }
                return Err(errno);
            }
        }
        self.tracee(tid)?.suspend_count += 1;
        Ok(())
    }

    fn resume(&mut self, tid: ThreadId) -> nix::Result<()> {
        let tracee = self.tracee(tid)?;
        tracee.suspend_count = tracee.suspend_count.checked_sub(1).ok_or(Errno::EINVAL)?;
        if tracee.suspend_count == 0 {
            ptrace::cont(tid, None)?;
        }
        Ok(())
    }

    /// Continues running tracees that stopped since the last look
    fn reap(&mut self) {
        let running: Vec<_> = self
            .tracees
            .iter()
            .filter(|(_, tracee)| tracee.suspend_count == 0)
            .map(|(&tid, _)| tid)
            .collect();

        for tid in running {
            let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
            let resumed = match wait::waitpid(tid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => Ok(()),
                Ok(WaitStatus::Stopped(_, signal)) => {
                    debug!(%tid, ?signal, "passing signal through");
                    ptrace::cont(tid, signal)
                }
                // group-stop of a seized tracee
                Ok(WaitStatus::PtraceEvent(..)) => ptrace::cont(tid, None),
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    debug!(%tid, "tracee gone");
                    self.tracees.remove(&tid);
                    Ok(())
                }
                Ok(status) => {
                    debug!(%tid, ?status, "ignoring wait status");
                    Ok(())
                }
                Err(errno) => Err(errno),
            };
            if let Err(errno) = resumed {
                warn!(%tid, %errno, "could not continue tracee");
            }
        }
    }

    fn detach_all(&mut self) {
        for (tid, tracee) in mem::take(&mut self.tracees) {
            if tracee.suspend_count == 0 {
                if let Err(errno) = interrupt(tid) {
                    debug!(%tid, %errno, "tracee gone before detach");
                    continue;
                }
            }
            if let Err(errno) = ptrace::detach(tid, None) {
                debug!(%tid, %errno, "detach failed");
            }
        }
    }

    fn run(jobs: Receiver<Job>) {
        let mut tracer = Tracer::default();
        loop {
            match jobs.recv_timeout(REAP_INTERVAL) {
                Ok(job) => job(&mut tracer),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            tracer.reap();
        }
        tracer.detach_all();
    }
}

/// Stops `tid` with `PTRACE_INTERRUPT`. Signals that arrive first are
/// delivered on the way, the interrupt still stops the thread after them.
fn interrupt(tid: ThreadId) -> nix::Result<()> {
    ptrace::interrupt(tid)?;
    loop {
        match wait::waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => return Ok(()),
            WaitStatus::Stopped(_, signal) => {
                debug!(%tid, ?signal, "passing signal through while stopping");
                ptrace::cont(tid, signal)?;
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Err(Errno::ESRCH),
            status => debug!(%tid, ?status, "ignoring wait status"),
        }
    }
}

fn read_debugreg(tid: ThreadId, n: usize) -> nix::Result<u64> {
    ptrace::read_user(tid, debugreg_offset(n)).map(|value| value as u64)
}

fn write_debugreg(tid: ThreadId, n: usize, value: u64) -> nix::Result<()> {
    ptrace::write_user(tid, debugreg_offset(n), value as libc::c_long)
}

#[derive(Debug)]
pub struct PtraceEngine {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

/// Handle to a thread the engine is attached to
#[derive(Debug)]
pub struct PtraceThread(pub ThreadId);

impl PtraceEngine {
    /// Starts the tracer thread
    pub fn new() -> std::io::Result<Self> {
        let (jobs, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("hwbp-tracer".into())
            .spawn(move || Tracer::run(rx))?;
        Ok(Self {
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Runs `f` on the tracer thread and waits for its result
    fn call<T, F>(&self, f: F) -> nix::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tracer) -> nix::Result<T> + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |tracer| {
            // the caller only goes away if it panicked
            let _ = reply.send(f(tracer));
        });
        self.jobs
            .as_ref()
            .ok_or(Errno::ESRCH)?
            .send(job)
            .map_err(|_| Errno::ESRCH)?;
        result.recv().map_err(|_| Errno::ESRCH)?
    }

    /// Seizes a running thread without stopping it
    pub fn attach(&self, tid: ThreadId) -> nix::Result<()> {
        self.call(move |tracer| tracer.attach(tid))
    }
}

impl ThreadControl for PtraceEngine {
    type Handle = PtraceThread;

    fn open(&self, tid: ThreadId) -> nix::Result<PtraceThread> {
        self.attach(tid)?;
        Ok(PtraceThread(tid))
    }

    fn suspend(&self, handle: &PtraceThread) -> nix::Result<()> {
        let tid = handle.0;
        self.call(move |tracer| tracer.suspend(tid))
    }

    fn resume(&self, handle: &PtraceThread) -> nix::Result<()> {
        let tid = handle.0;
        self.call(move |tracer| tracer.resume(tid))
    }

    fn get_debug_context(&self, handle: &PtraceThread) -> nix::Result<DebugContext> {
        let tid = handle.0;
        self.call(move |_| {
            let mut ctx = DebugContext::default();
            for (n, address) in ctx.address.iter_mut().enumerate() {
                *address = read_debugreg(tid, n)?;
            }
            ctx.status = Dr6(read_debugreg(tid, DR6)?);
            ctx.control = Dr7(read_debugreg(tid, DR7)?);
            Ok(ctx)
        })
    }

    fn set_debug_context(&self, handle: &PtraceThread, ctx: &DebugContext) -> nix::Result<()> {
        let tid = handle.0;
        let ctx = *ctx;
        self.call(move |_| {
            // disarm slots that are going away before their addresses change
            let live = read_debugreg(tid, DR7)?;
            write_debugreg(tid, DR7, live & ctx.control.0)?;
            for (n, &address) in ctx.address.iter().enumerate() {
                write_debugreg(tid, n, address)?;
            }
            write_debugreg(tid, DR7, ctx.control.0)
        })
    }

    fn close(&self, _handle: PtraceThread) {}
}

impl Drop for PtraceEngine {
    fn drop(&mut self) {
        // closing the channel makes the tracer detach and exit
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("tracer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debugreg_offsets_follow_user_layout() {
        let base = mem::offset_of!(libc::user, u_debugreg);
        assert_eq!(debugreg_offset(0) as usize, base);
        assert_eq!(debugreg_offset(DR7) as usize, base + 56);
    }

    #[test]
    fn unknown_thread_cannot_be_suspended() {
        let engine = PtraceEngine::new().unwrap();
        let handle = PtraceThread(ThreadId::from_raw(i32::MAX));
        assert_eq!(engine.suspend(&handle), Err(Errno::ESRCH));
        assert_eq!(engine.resume(&handle), Err(Errno::ESRCH));
    }
}
