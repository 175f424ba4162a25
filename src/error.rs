use std::fmt;

use nix::unistd::Pid;

use crate::dr::Slot;

/// Thread-context primitive that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadOp {
    Open,
    Suspend,
    GetContext,
    SetContext,
    Resume,
}

impl fmt::Display for ThreadOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Open => "open",
            Self::Suspend => "suspend",
            Self::GetContext => "read debug registers of",
            Self::SetContext => "write debug registers of",
            Self::Resume => "resume",
        };
        f.write_str(op)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to {op} thread {tid}")]
    Access {
        tid: Pid,
        op: ThreadOp,
        #[source]
        source: nix::Error,
    },

    #[error("no free hardware breakpoint slot on thread {0}")]
    NoFreeSlot(Pid),

    #[error("breakpoint is already enabled in {0}")]
    AlreadyEnabled(Slot),

    #[error("breakpoint is not enabled")]
    NotEnabled,

    #[error("token serializes thread {token}, breakpoint belongs to thread {target}")]
    WrongThread { token: Pid, target: Pid },

    #[error("I/O error")]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Whether the thread itself could not be accessed, as opposed to a
    /// rejected call or exhausted slots
    pub fn is_access(&self) -> bool {
        matches!(self, Self::Access { .. })
    }

    pub(crate) fn access(tid: Pid, op: ThreadOp) -> impl FnOnce(nix::Error) -> Self {
        move |source| Self::Access { tid, op, source }
    }
}
