use nix::unistd::Pid;

use crate::dr::DebugContext;
use crate::error;

/// Kernel thread id of the thread whose debug registers are programmed
pub type ThreadId = Pid;

pub type Result<T> = std::result::Result<T, error::Error>;

/// This is an abstraction over the thread-context primitives of the host OS.
///
/// A handle is opened per operation. Debug registers are only read or written
/// between a successful `suspend` and the matching `resume`.
pub trait ThreadControl {
    type Handle;

    /// Gets a handle with suspend and context access rights
    fn open(&self, tid: ThreadId) -> nix::Result<Self::Handle>;

    /// Stops the thread. Suspensions nest.
    fn suspend(&self, handle: &Self::Handle) -> nix::Result<()>;

    /// Undoes one `suspend`
    fn resume(&self, handle: &Self::Handle) -> nix::Result<()>;

    /// Reads DR0-DR3, DR6 and DR7
    fn get_debug_context(&self, handle: &Self::Handle) -> nix::Result<DebugContext>;

    /// Writes DR0-DR3 and DR7. DR6 is left alone.
    fn set_debug_context(&self, handle: &Self::Handle, ctx: &DebugContext) -> nix::Result<()>;

    fn close(&self, handle: Self::Handle);
}
