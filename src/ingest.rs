//! Accumulates one streamed reply into its message record.
//!
//! A [`StreamIngestor`] owns at most one [`StreamSession`]. Frames are
//! consumed in arrival order; the growing buffer is pushed to the display and
//! to storage on two independent time-based throttles, and the record is
//! finalized exactly once when the `[DONE]` sentinel arrives.
//!
//! ```text
//! Idle -> Streaming -> Finalized | Cancelled | Failed
//! ```
//!
//! Terminal states are absorbing; a new [`StreamIngestor::begin`] starts over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::display::DisplayTarget;
use crate::error::{StorageError, StreamError, TransportError};
use crate::markdown::normalize;
use crate::sse::Frame;
use crate::store::{Message, MessageId, MessageStatus, MessageStore};

pub const DISPLAY_THROTTLE: Duration = Duration::from_millis(100);
pub const PERSIST_THROTTLE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub display: Duration,
    pub persist: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            display: DISPLAY_THROTTLE,
            persist: PERSIST_THROTTLE,
        }
    }
}

/// Minimum spacing between two flushes of one kind.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    interval: Duration,
    last: Instant,
}

impl Throttle {
    fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) > self.interval
    }

    fn mark(&mut self, now: Instant) {
        self.last = self.last.max(now);
    }

    pub fn last(&self) -> Instant {
        self.last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Finalized,
    Cancelled,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamState::Streaming)
    }
}

#[derive(Debug)]
pub struct StreamSession {
    message_id: MessageId,
    buffer: String,
    display: Throttle,
    persist: Throttle,
    finish_reason: Option<String>,
    state: StreamState,
}

impl StreamSession {
    fn new(message_id: MessageId, throttle: ThrottleConfig, now: Instant) -> Self {
        Self {
            message_id,
            buffer: String::new(),
            display: Throttle::new(throttle.display, now),
            persist: Throttle::new(throttle.persist, now),
            finish_reason: None,
            state: StreamState::Streaming,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Raw accumulated text, before normalization.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn last_display_flush(&self) -> Instant {
        self.display.last()
    }

    pub fn last_persist_flush(&self) -> Instant {
        self.persist.last()
    }
}

pub struct StreamIngestor {
    store: Arc<dyn MessageStore>,
    display: Arc<dyn DisplayTarget>,
    throttle: ThrottleConfig,
    session: Option<StreamSession>,
}

impl StreamIngestor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        display: Arc<dyn DisplayTarget>,
        throttle: ThrottleConfig,
    ) -> Self {
        Self {
            store,
            display,
            throttle,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    /// `None` while idle.
    pub fn state(&self) -> Option<StreamState> {
        self.session.as_ref().map(StreamSession::state)
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == Some(StreamState::Streaming)
    }

    pub fn begin(&mut self, message_id: MessageId) -> Result<(), StreamError> {
        self.begin_at(message_id, Instant::now())
    }

    pub fn begin_at(&mut self, message_id: MessageId, now: Instant) -> Result<(), StreamError> {
        if let Some(active) = self.session.as_ref().filter(|s| !s.state.is_terminal()) {
            return Err(StreamError::AlreadyStreaming(active.message_id));
        }
        info!(message_id = %message_id, "Stream session started");
        self.session = Some(StreamSession::new(message_id, self.throttle, now));
        Ok(())
    }

    pub async fn consume(&mut self, line: &str) -> Result<StreamState, StreamError> {
        self.consume_at(line, Instant::now()).await
    }

    /// Processes one raw line as if it arrived at `now`.
    pub async fn consume_at(&mut self, line: &str, now: Instant) -> Result<StreamState, StreamError> {
        let session = self.session.as_mut().ok_or(StreamError::Idle)?;
        if session.state.is_terminal() {
            return Ok(session.state);
        }

        match Frame::parse(line) {
            Frame::Ignored => {}
            Frame::Malformed(e) => {
                debug!(message_id = %session.message_id, "Skipping malformed frame: {}", e);
            }
            Frame::Done => self.finalize().await,
            Frame::Delta { content, finish_reason } => {
                if let Some(reason) = finish_reason {
                    debug!(message_id = %session.message_id, reason = %reason, "Finish reason received");
                    session.finish_reason = Some(reason);
                }
                if !content.is_empty() {
                    session.buffer.push_str(&content);
                    self.flush(now).await;
                }
            }
        }

        self.state().ok_or(StreamError::Idle)
    }

    async fn flush(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let display_due = session.display.is_due(now);
        let persist_due = session.persist.is_due(now);
        if !display_due && !persist_due {
            return;
        }

        let snapshot = normalize(&session.buffer);
        let message_id = session.message_id;

        if display_due {
            self.display.show_snapshot(message_id, &snapshot);
            session.display.mark(now);
        }

        if persist_due {
            let result = update_record(self.store.as_ref(), message_id, |m| m.content = snapshot).await;
            match result {
                Ok(()) => session.persist.mark(now),
                // The next flush writes the full buffer again.
                Err(e) => warn!(message_id = %message_id, "Persist flush failed: {}", e),
            }
        }
    }

    /// Writes the complete buffer regardless of either throttle.
    async fn finalize(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state.is_terminal() {
            return;
        }
        session.state = StreamState::Finalized;

        let text = normalize(&session.buffer);
        let message_id = session.message_id;
        let final_text = text.clone();
        let result = update_record(self.store.as_ref(), message_id, move |m| {
            m.content = final_text;
            m.is_streaming = false;
            m.status = MessageStatus::Sent;
        })
        .await;
        if let Err(e) = result {
            error!(message_id = %message_id, "Failed to store final reply: {}", e);
        }

        self.display.complete(message_id, &text);
        info!(
            message_id = %message_id,
            chars = session.buffer.chars().count(),
            finish_reason = session.finish_reason.as_deref().unwrap_or("none"),
            "Stream finalized"
        );
    }

    /// Stops the session and marks its message as errored. Returns `false`
    /// when there was nothing to cancel (idle, or already terminal).
    pub async fn cancel(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state.is_terminal() {
            debug!(message_id = %session.message_id, state = ?session.state, "Cancel after terminal state ignored");
            return false;
        }
        session.state = StreamState::Cancelled;

        let message_id = session.message_id;
        let result = update_record(self.store.as_ref(), message_id, |m| {
            m.status = MessageStatus::Error;
            m.is_streaming = false;
        })
        .await;
        if let Err(e) = result {
            // Usually the message was deleted, which is what triggered the cancel.
            debug!(message_id = %message_id, "Cancelled message not updated: {}", e);
        }
        info!(message_id = %message_id, "Stream cancelled");
        true
    }

    /// Tears the session down after a broken transport. Reported once.
    pub async fn fail(&mut self, err: TransportError) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state.is_terminal() {
            return false;
        }
        session.state = StreamState::Failed;

        let message_id = session.message_id;
        let partial = normalize(&session.buffer);
        error!(message_id = %message_id, "Stream failed: {}", err);
        let result = update_record(self.store.as_ref(), message_id, move |m| {
            m.content = partial;
            m.status = MessageStatus::Error;
            m.is_streaming = false;
        })
        .await;
        if let Err(e) = result {
            warn!(message_id = %message_id, "Failed message not updated: {}", e);
        }

        self.display.error(message_id, &err.to_string());
        true
    }

    /// Feeds `lines` into the current session until it reaches a terminal
    /// state.
    ///
    /// A `[DONE]` that is ready together with the cancellation wins, so the
    /// reply still finalizes. Any other pending frame is dropped once the
    /// token fires.
    pub async fn run<S>(&mut self, mut lines: S, cancel: CancellationToken) -> Option<StreamState>
    where
        S: Stream<Item = Result<String, TransportError>> + Unpin,
    {
        while self.is_streaming() {
            if cancel.is_cancelled() {
                match lines.next().now_or_never() {
                    Some(Some(Ok(line))) if matches!(Frame::parse(&line), Frame::Done) => {
                        self.finalize().await;
                    }
                    _ => {
                        self.cancel().await;
                    }
                }
                break;
            }
            tokio::select! {
                biased;
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        if let Err(e) = self.consume(&line).await {
                            warn!("Stream consumption stopped: {}", e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        self.fail(e).await;
                    }
                    None => {
                        self.fail(TransportError::Closed).await;
                    }
                },
                _ = cancel.cancelled() => {
                    self.cancel().await;
                }
            }
        }
        self.state()
    }
}

async fn update_record<F>(store: &dyn MessageStore, id: MessageId, edit: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut Message) + Send,
{
    let mut message = store.get(id).await.ok_or(StorageError::MessageNotFound(id))?;
    edit(&mut message);
    store.update(message).await
}
