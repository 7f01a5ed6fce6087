use aero_gpu_shm::{DisplayMode, FaultCode, ResourceHeap, RingCommand};

/// Interprets ring commands. Rendering itself lives behind this trait.
///
/// `execute` runs on the session task, in ring order; an `Err` is reported to the guest through
/// `error_code` and an `ERROR` interrupt, and draining continues with the next command.
pub trait CommandExecutor: Send {
    fn execute(&mut self, heap: &ResourceHeap, command: &RingCommand) -> Result<(), FaultCode>;

    /// The guest reset the channel; forget all per-channel state.
    fn reset(&mut self) {}

    /// A display mode change to publish after the current batch, if any.
    fn take_display_mode(&mut self) -> Option<DisplayMode> {
        None
    }
}

/// Accepts every command and does nothing with it.
#[derive(Debug, Default)]
pub struct NullExecutor {
    executed: u64,
}

impl NullExecutor {
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl CommandExecutor for NullExecutor {
    fn execute(&mut self, _heap: &ResourceHeap, command: &RingCommand) -> Result<(), FaultCode> {
        self.executed += 1;
        tracing::trace!(
            opcode = command.opcode,
            len = command.payload.len(),
            "discarding command"
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.executed = 0;
    }
}
