//! Pushes an invocation's events onto a bounded channel.
//!
//! The emitter owns the [`ProgressTracker`] for one invocation. It keeps the
//! stream well formed: progress never goes backwards (a regression is clamped
//! to the last emitted value and logged), and nothing is sent after the
//! terminal event. When the receiving side is dropped, every send fails with
//! [`ProgressError::StreamClosed`] so the capability can stop early.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::events::ProgressEvent;
use super::tracker::{ProgressError, ProgressTracker};

#[derive(Debug)]
pub struct ProgressEmitter {
    tracker: ProgressTracker,
    sender: mpsc::Sender<ProgressEvent>,
    last_progress: i32,
    emitted: u64,
    terminated: bool,
}

impl ProgressEmitter {
    pub fn new(tracker: ProgressTracker, sender: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tracker,
            sender,
            last_progress: 0,
            emitted: 0,
            terminated: false,
        }
    }

    /// Emitter plus the receiving end of a channel with `capacity` slots
    pub fn channel(
        tracker: ProgressTracker,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tracker, tx), rx)
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ProgressTracker {
        &mut self.tracker
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True once the receiver has been dropped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted
    }

    /// Start the clock and announce `initializing`
    pub async fn start(&mut self) -> Result<(), ProgressError> {
        self.tracker.start_tracking();
        self.emit_progress(false).await
    }

    /// Move to the next declared stage and announce it
    pub async fn advance(&mut self, total_substeps: u32) -> Result<(), ProgressError> {
        self.tracker.next_stage(total_substeps)?;
        self.emit_progress(false).await
    }

    /// Jump to a named stage and announce it
    pub async fn enter_stage(&mut self, id: &str, total_substeps: u32) -> Result<(), ProgressError> {
        self.tracker.set_stage(id, total_substeps)?;
        self.emit_progress(false).await
    }

    /// Complete one substep and announce the interpolated progress with ETA
    pub async fn substep(&mut self) -> Result<(), ProgressError> {
        self.tracker.increment_substep();
        self.emit_progress(true).await
    }

    pub async fn emit_progress(&mut self, include_eta: bool) -> Result<(), ProgressError> {
        let event = self.tracker.progress_event(include_eta);
        self.emit(event).await
    }

    /// Terminal success event
    pub async fn complete(&mut self, result: Option<Value>) -> Result<(), ProgressError> {
        let event = self.tracker.success_event(result);
        self.emit(event).await
    }

    /// Terminal error event attributed to the current stage
    pub async fn fail(
        &mut self,
        code: &str,
        message: &str,
        details: Option<String>,
        recoverable: bool,
    ) -> Result<(), ProgressError> {
        let event = self.tracker.error_event(code, message, details, recoverable);
        self.emit(event).await
    }

    /// Send one event, enforcing monotonic progress and a single terminal event
    pub async fn emit(&mut self, event: ProgressEvent) -> Result<(), ProgressError> {
        if self.terminated {
            return Err(ProgressError::AlreadyTerminated);
        }

        let event = self.clamp_regression(event);
        let terminal = event.is_terminal();

        self.sender
            .send(event)
            .await
            .map_err(|_| ProgressError::StreamClosed)?;

        self.emitted += 1;
        if terminal {
            self.terminated = true;
            debug!(events = self.emitted, "Progress stream terminated");
        }
        Ok(())
    }

    fn clamp_regression(&mut self, mut event: ProgressEvent) -> ProgressEvent {
        if let ProgressEvent::Progress {
            progress, stage, ..
        } = &mut event
        {
            if *progress < self.last_progress {
                warn!(
                    stage = %stage,
                    reported = *progress,
                    last = self.last_progress,
                    "Progress regression clamped"
                );
                *progress = self.last_progress;
            }
            self.last_progress = *progress;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::tracker::AdvanceMode;
    use crate::stages::{Stage, StageDefinition};

    fn tracker(mode: AdvanceMode) -> ProgressTracker {
        let definition = StageDefinition::validated(vec![
            Stage::new("decoding", 20).unwrap(),
            Stage::new("synthesizing", 70).unwrap(),
        ])
        .unwrap();
        ProgressTracker::new(definition, mode)
    }

    #[tokio::test]
    async fn test_sequential_stream() {
        let (mut emitter, mut rx) = ProgressEmitter::channel(tracker(AdvanceMode::Sequential), 8);
        emitter.start().await.unwrap();
        emitter.advance(2).await.unwrap();
        emitter.substep().await.unwrap();
        emitter.complete(None).await.unwrap();
        drop(emitter);

        let mut progress = Vec::new();
        while let Some(event) = rx.recv().await {
            progress.push((event.stage().to_string(), event.progress_value()));
        }
        assert_eq!(
            progress,
            vec![
                ("initializing".to_string(), 0),
                ("decoding".to_string(), 20),
                ("decoding".to_string(), 45),
                ("complete".to_string(), 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_regression_is_clamped() {
        let (mut emitter, mut rx) = ProgressEmitter::channel(tracker(AdvanceMode::Manual), 8);
        emitter.enter_stage("synthesizing", 0).await.unwrap();
        emitter.enter_stage("decoding", 0).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().progress_value(), 70);
        let clamped = rx.recv().await.unwrap();
        assert_eq!(clamped.stage(), "decoding");
        assert_eq!(clamped.progress_value(), 70);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let (mut emitter, _rx) = ProgressEmitter::channel(tracker(AdvanceMode::Sequential), 8);
        emitter
            .fail("INVALID_INPUT", "bad", None, false)
            .await
            .unwrap();
        assert!(emitter.is_terminated());
        assert_eq!(
            emitter.emit_progress(false).await,
            Err(ProgressError::AlreadyTerminated)
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_stream() {
        let (mut emitter, rx) = ProgressEmitter::channel(tracker(AdvanceMode::Sequential), 1);
        drop(rx);
        assert!(emitter.is_closed());
        assert_eq!(emitter.start().await, Err(ProgressError::StreamClosed));
        assert!(!emitter.is_terminated());
    }
}
