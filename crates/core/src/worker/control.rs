//! Pause/resume/stop signalling between the orchestrator and a worker

use std::sync::Arc;
use tokio::sync::watch;

/// Control flags observed by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub paused: bool,
    pub stopped: bool,
}

/// Sending side of a worker's control channel.
///
/// Every change wakes the worker, so a paused worker blocks on a change
/// notification instead of polling.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Pause; ignored once stopped
    pub fn pause(&self) {
        self.tx.send_if_modified(|state| {
            if state.stopped || state.paused {
                return false;
            }
            state.paused = true;
            true
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|state| {
            if !state.paused {
                return false;
            }
            state.paused = false;
            true
        });
    }

    /// Stop; also clears the pause so a paused worker wakes up
    pub fn stop(&self) {
        self.tx.send_if_modified(|state| {
            if state.stopped {
                return false;
            }
            state.stopped = true;
            state.paused = false;
            true
        });
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_clears_pause_and_is_final() {
        let control = WorkerControl::new();
        control.pause();
        assert!(control.state().paused);

        control.stop();
        assert_eq!(
            control.state(),
            ControlState {
                paused: false,
                stopped: true
            }
        );

        control.pause();
        assert!(!control.state().paused);
    }

    #[tokio::test]
    async fn test_paused_receiver_wakes_on_stop() {
        let control = WorkerControl::new();
        let mut rx = control.subscribe();
        control.pause();

        let waiter = tokio::spawn(async move {
            rx.wait_for(|s| !s.paused || s.stopped).await.map(|s| *s).ok()
        });

        control.stop();
        let state = waiter.await.unwrap().expect("sender alive");
        assert!(state.stopped);
    }
}
