//! Progress reporting seam between the orchestrator and the external
//! splash/progress window.
//!
//! The splash window itself lives outside this crate; the orchestrator only
//! pushes coarse phase labels and a final "session live" event through a
//! [`ProgressSink`]. A channel-backed implementation is provided for GUI
//! consumers, plus a no-op sink for headless runs and tests.

use std::sync::Arc;

use tokio::sync::mpsc;

/// One progress update from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A new phase began; the payload is the label shown on the splash
    /// (e.g. `HIBERNATING...`, `STARTING VM...`).
    Phase(String),
    /// The readiness token arrived: the splash should close.
    SessionLive,
}

/// Consumer-facing capability: the orchestrator never talks to a window,
/// only to this.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that drops every event. Used headless and in tests.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Sink that forwards events over an unbounded channel to whatever process
/// or thread is driving the splash window.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        // The receiver may be gone if the splash was closed early; that must
        // never stall the session.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_progress_forwards_events() {
        let (sink, mut rx) = ChannelProgress::new();
        sink.report(ProgressEvent::Phase("STARTING VM...".into()));
        sink.report(ProgressEvent::SessionLive);

        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::Phase("STARTING VM...".into()));
        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::SessionLive);
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (sink, rx) = ChannelProgress::new();
        drop(rx);
        sink.report(ProgressEvent::SessionLive);
    }
}
