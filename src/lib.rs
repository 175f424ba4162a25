//! Hardware breakpoints on a live thread
//!
//! A [`HwBreakpoint`] is bound to one thread. Enabling it stops the thread,
//! picks the lowest free debug register slot from the thread's live DR7,
//! writes the slot's address, condition and length back and lets the thread
//! run again. Disabling clears exactly that slot.
//!
//! Operations on one thread must not interleave, so `enable` and `disable`
//! take a [`ThreadToken`] from [`ThreadLocks`].

pub mod breakpoint;
pub mod defs;
pub mod dr;
pub mod error;
pub mod lock;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace_engine;
pub mod suspend;

#[cfg(test)]
mod fake;

pub use crate::breakpoint::HwBreakpoint;
pub use crate::defs::{Result, ThreadControl, ThreadId};
pub use crate::dr::{Condition, DebugContext, Dr6, Dr7, Length, Slot};
pub use crate::error::{Error, ThreadOp};
pub use crate::lock::{ThreadLocks, ThreadToken};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use crate::ptrace_engine::PtraceEngine;
pub use crate::suspend::read_context;
