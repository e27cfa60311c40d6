use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

// ---------------------------------------------------------------------------
// StopSignal
// ---------------------------------------------------------------------------

/// Broadcast-based stop coordination for the pipeline loop.
///
/// The coordinator polls `is_stopping()` between iterations; a dispatch in
/// flight is never interrupted. Anything holding a clone (the CLI's ctrl-c
/// handler, an operator command) can call `trigger()`.
#[derive(Debug, Clone)]
pub struct StopSignal {
    trigger: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe for a wakeup when stop is requested.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Non-blocking check, safe to poll every iteration.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("stop requested, pipeline will halt after the current iteration");
            let _ = self.trigger.send(());
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_is_not_stopping() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopping());
    }

    #[test]
    fn trigger_is_idempotent_and_shared() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        signal.trigger();
        signal.trigger();
        assert!(clone.is_stopping());
    }

    #[tokio::test]
    async fn subscriber_is_woken() {
        let signal = StopSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let woken =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(woken.is_ok());
    }
}
