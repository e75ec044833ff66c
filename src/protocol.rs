//! Shared protocol constants and wire types for the filerecv WebSocket transport

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binary frame that terminates an upload.
pub const EOF_SENTINEL: &[u8] = b"EOF";

/// Number of leading bytes inspected by format sniffing.
pub const HEADER_LEN: usize = 12;

// Maximum WebSocket message/frame size (64MB) - bounds memory per chunk
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Close frame reasons are limited to 123 bytes by RFC 6455.
pub const MAX_CLOSE_REASON: usize = 123;

// Centralized timing defaults for the session watchdog and client
pub mod timeouts {
    // How often the watchdog wakes up (s)
    pub const WATCHDOG_POLL_SECS: u64 = 10;

    // Idle time after which the session is closed (s)
    pub const IDLE_TIMEOUT_SECS: u64 = 30;

    // Connection establishment timeout for the client (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Client wait for a single status reply (ms)
    pub const STATUS_REPLY_MS: u64 = 60_000;
}

/// Action requested by a control frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Upload,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Delete => "delete",
        }
    }
}

/// Inbound control frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub action: Action,
    pub file_idx: u64,
    pub file_name: String,
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Coarse session state, also the `status` field of outbound frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Uploading,
    Success,
    Timeout,
    Abort,
    Error,
}

/// Default human-readable messages carried by status frames
pub mod messages {
    pub const READY: &str = "Ready to upload";
    pub const UPLOADING: &str = "Uploading...";
    pub const SUCCESS_UPLOAD: &str = "Upload successful";
    pub const SUCCESS_DELETE: &str = "File deleted";
    pub const TIMEOUT: &str = "Connection timed out";
    pub const ERROR: &str = "Something went wrong";
    pub const ABORT: &str = "File upload aborted";
}

/// Outbound status frame. Absent fields are not serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl StatusFrame {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: None,
            message: Some(message.into()),
            file_name: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// Upload progress in percent; `None` when no size budget is configured.
///
/// Halves round to even, so 0.5% reports as 0 and 1.5% as 2.
pub fn progress_percent(received: u64, budget: u64) -> Option<u8> {
    if budget == 0 {
        return None;
    }
    let pct = (received as f64 / budget as f64 * 100.0).round_ties_even();
    Some(pct.min(100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_rounds_and_caps() {
        assert_eq!(progress_percent(0, 200), Some(0));
        assert_eq!(progress_percent(3, 200), Some(2));
        assert_eq!(progress_percent(1, 200), Some(0));
        assert_eq!(progress_percent(150, 200), Some(75));
        assert_eq!(progress_percent(500, 200), Some(100));
        assert_eq!(progress_percent(500, 0), None);
    }

    #[test]
    fn status_frame_omits_absent_fields() {
        let frame = StatusFrame::new(Status::Success, messages::SUCCESS_DELETE).with_file_name("0_ab.png");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "success", "message": "File deleted", "file_name": "0_ab.png"})
        );

        let ready = StatusFrame::new(Status::Ready, messages::READY).with_progress(0);
        let json = serde_json::to_string(&ready).unwrap();
        assert!(json.contains("\"progress\":0"));
        assert!(!json.contains("file_name"));
    }
}
