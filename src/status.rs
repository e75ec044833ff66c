//! Outbound status messages and the session's coarse state

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::protocol::{messages, progress_percent, Status, StatusFrame, MAX_CLOSE_REASON};

/// State shared between the request loop and the watchdog
#[derive(Debug)]
pub struct Activity {
    pub state: Status,
    pub last_activity: Instant,
}

/// Sends status frames over a (shared) WebSocket sink.
///
/// Every emission refreshes the activity timestamp before the send and records
/// the new coarse state after it.
pub struct StatusEmitter<Si> {
    sink: Arc<tokio::sync::Mutex<Si>>,
    activity: Arc<Mutex<Activity>>,
}

impl<Si> Clone for StatusEmitter<Si> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            activity: Arc::clone(&self.activity),
        }
    }
}

impl<Si> StatusEmitter<Si>
where
    Si: Sink<Message, Error = WsError> + Unpin + Send,
{
    pub fn new(sink: Si) -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            activity: Arc::new(Mutex::new(Activity {
                state: Status::Ready,
                last_activity: Instant::now(),
            })),
        }
    }

    pub fn state(&self) -> Status {
        self.activity.lock().state
    }

    /// Time since the last outbound status message
    pub fn idle_for(&self) -> Duration {
        self.activity.lock().last_activity.elapsed()
    }

    fn touch(&self) {
        self.activity.lock().last_activity = Instant::now();
    }

    async fn emit(&self, frame: StatusFrame) -> Result<()> {
        self.touch();
        let text = serde_json::to_string(&frame).context("serialize status frame")?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("send status frame")?;
        self.activity.lock().state = frame.status;
        Ok(())
    }

    pub async fn send_ready(&self) -> Result<()> {
        self.emit(StatusFrame::new(Status::Ready, messages::READY).with_progress(0))
            .await
    }

    /// Progress is omitted when no size budget is configured.
    pub async fn send_progress(&self, received: u64, budget: u64) -> Result<()> {
        let mut frame = StatusFrame::new(Status::Uploading, messages::UPLOADING);
        frame.progress = progress_percent(received, budget);
        self.emit(frame).await
    }

    pub async fn send_success_upload(&self, file_name: &str) -> Result<()> {
        self.emit(
            StatusFrame::new(Status::Success, messages::SUCCESS_UPLOAD)
                .with_file_name(file_name)
                .with_progress(100),
        )
        .await
    }

    pub async fn send_success_delete(&self, file_name: &str) -> Result<()> {
        self.emit(StatusFrame::new(Status::Success, messages::SUCCESS_DELETE).with_file_name(file_name))
            .await
    }

    pub async fn send_error(&self, reason: Option<&str>) -> Result<()> {
        self.emit(StatusFrame::new(Status::Error, reason.unwrap_or(messages::ERROR)))
            .await
    }

    pub async fn send_abort(&self, reason: Option<&str>) -> Result<()> {
        self.emit(StatusFrame::new(Status::Abort, reason.unwrap_or(messages::ABORT)))
            .await
    }

    pub async fn send_timeout(&self) -> Result<()> {
        self.emit(StatusFrame::new(Status::Timeout, messages::TIMEOUT))
            .await
    }

    /// Send a close frame; `reason` marks an internal error.
    pub async fn close(&self, reason: Option<&str>) -> Result<()> {
        let frame = match reason {
            Some(r) => CloseFrame {
                code: CloseCode::Error,
                reason: Cow::Owned(truncate_reason(r).to_string()),
            },
            None => CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            },
        };
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(frame))).await.context("send close frame")?;
        Ok(())
    }
}

/// Cut a close reason to the WebSocket limit on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn emissions_update_state_and_shape() {
        let (sink, mut rx) = channel_sink();
        let emitter = StatusEmitter::new(sink);
        assert_eq!(emitter.state(), Status::Ready);

        emitter.send_ready().await.unwrap();
        emitter.send_progress(50, 100).await.unwrap();
        assert_eq!(emitter.state(), Status::Uploading);
        emitter.send_progress(50, 0).await.unwrap();
        emitter.send_success_upload("0_ab.png").await.unwrap();
        emitter.send_abort(None).await.unwrap();
        assert_eq!(emitter.state(), Status::Abort);

        let frames = drain_status(&mut rx);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].progress, Some(0));
        assert_eq!(frames[1].progress, Some(50));
        assert_eq!(frames[2].progress, None);
        assert_eq!(frames[3].file_name.as_deref(), Some("0_ab.png"));
        assert_eq!(frames[3].progress, Some(100));
        assert_eq!(frames[4].message.as_deref(), Some(messages::ABORT));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (sink, rx) = channel_sink();
        let emitter = StatusEmitter::new(sink);
        drop(rx);
        assert!(emitter.send_error(Some("boom")).await.is_err());
        // state is only recorded for delivered frames
        assert_eq!(emitter.state(), Status::Ready);
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
