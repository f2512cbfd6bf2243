//! Pause and cancellation controls for running turns.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, orchestrator::TurnOutcome};

/// A cloneable pause flag, polled by turns between chunks.
///
/// One switch may be shared by any number of turns; pausing ends every turn
/// that observes it with `FinishStatus::Paused`.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch(Arc<AtomicBool>);

impl PauseSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a turn running on the tokio runtime.
pub struct TurnHandle {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<Result<TurnOutcome>>,
}

impl TurnHandle {
    /// Abort the turn. Network I/O and running tools stop; the turn still
    /// emits its terminal chunk. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this turn
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the turn has resolved
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the turn to resolve
    pub async fn wait(self) -> Result<TurnOutcome> {
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_switch_is_shared_and_idempotent() {
        let switch = PauseSwitch::new();
        let other = switch.clone();
        assert!(!other.is_paused());

        switch.pause();
        switch.pause();
        assert!(other.is_paused());

        other.resume();
        other.resume();
        assert!(!switch.is_paused());
    }
}
