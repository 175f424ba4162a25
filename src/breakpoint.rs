use tracing::{debug, warn};

use crate::defs::{Result, ThreadControl, ThreadId};
use crate::dr::{Condition, Length, Slot};
use crate::error::Error;
use crate::lock::ThreadToken;
use crate::suspend::Suspended;

/// A hardware breakpoint bound to one thread
#[derive(Debug)]
pub struct HwBreakpoint {
    /// address written to the slot's address register
    target: u64,
    thread_id: ThreadId,
    condition: Condition,
    length: Length,
    /// slot holding the breakpoint, `None` while disabled
    slot: Option<Slot>,
}

impl HwBreakpoint {
    pub fn new(target: u64, thread_id: ThreadId, condition: Condition, length: Length) -> Self {
        Self {
            target,
            thread_id,
            condition,
            length,
            slot: None,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn length(&self) -> Length {
        self.length
    }

    pub fn slot(&self) -> Option<Slot> {
        self.slot
    }

    pub fn is_enabled(&self) -> bool {
        self.slot.is_some()
    }

    fn check_token(&self, token: &ThreadToken<'_>) -> Result<()> {
        if token.tid() != self.thread_id {
            return Err(Error::WrongThread {
                token: token.tid(),
                target: self.thread_id,
            });
        }
        Ok(())
    }

    /// Arms the breakpoint in the lowest free slot of the thread.
    ///
    /// On error the descriptor is unchanged and the thread is left in the
    /// suspension state it had before the call. Once the registers are
    /// written the breakpoint is armed: a failing final resume is logged and
    /// the call still succeeds.
    #[tracing::instrument(skip(self, control, token), fields(tid = %self.thread_id, target = self.target))]
    pub fn enable<C: ThreadControl>(&mut self, control: &C, token: &ThreadToken<'_>) -> Result<Slot> {
        self.check_token(token)?;
        if let Some(slot) = self.slot {
            return Err(Error::AlreadyEnabled(slot));
        }

        let suspended = Suspended::new(control, self.thread_id)?;
        let mut ctx = suspended.context()?;
        let slot = ctx
            .find_free_slot()
            .ok_or(Error::NoFreeSlot(self.thread_id))?;
        ctx.encode_slot(slot, self.target, self.condition, self.length);
        suspended.write_context(&ctx)?;

        self.slot = Some(slot);
        debug!(%slot, dr7 = ?ctx.control, "breakpoint armed");
        resume_after_write(suspended);
        Ok(slot)
    }

    /// Clears exactly the slot this breakpoint was armed in.
    ///
    /// A disabled breakpoint is rejected with [`Error::NotEnabled`] without
    /// touching the thread. As with `enable`, a failing resume after the
    /// write is only logged.
    #[tracing::instrument(skip(self, control, token), fields(tid = %self.thread_id, slot = ?self.slot))]
    pub fn disable<C: ThreadControl>(&mut self, control: &C, token: &ThreadToken<'_>) -> Result<()> {
        self.check_token(token)?;
        let slot = self.slot.ok_or(Error::NotEnabled)?;

        let suspended = Suspended::new(control, self.thread_id)?;
        let mut ctx = suspended.context()?;
        ctx.clear_slot(slot);
        suspended.write_context(&ctx)?;

        self.slot = None;
        debug!(%slot, dr7 = ?ctx.control, "breakpoint cleared");
        resume_after_write(suspended);
        Ok(())
    }

    /// Releases the descriptor. An enabled breakpoint stays armed on the
    /// thread; call [`HwBreakpoint::disable`] first to remove it.
    pub fn destroy(self) {}
}

/// The registers already hold the new state, so a failed resume does not
/// undo the operation
fn resume_after_write<C: ThreadControl>(suspended: Suspended<'_, C>) {
    let tid = suspended.tid();
    if let Err(err) = suspended.resume() {
        warn!(%tid, %err, "registers written but the thread could not be resumed");
    }
}

impl Drop for HwBreakpoint {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            warn!(
                tid = %self.thread_id,
                %slot,
                target = self.target,
                "breakpoint dropped while enabled, the watch stays armed"
            );
        }
    }
}
