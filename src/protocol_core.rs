//! Shared protocol logic for the server and client sides
//!
//! Classifies raw WebSocket messages into the frames the transfer protocol
//! cares about and validates control frames.

use anyhow::anyhow;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::error::{TransferError, TransferResult};
use crate::protocol::{Action, TransferRequest};

/// Inbound frame as seen by the transfer manager
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame, expected to hold a control message
    Control(String),
    /// Binary frame: file data or the `EOF` sentinel
    Data(Vec<u8>),
    Disconnected,
}

/// Map a WebSocket message; `None` for frames the protocol ignores.
pub fn classify_message(msg: Message) -> Option<Inbound> {
    match msg {
        Message::Text(text) => Some(Inbound::Control(text)),
        Message::Binary(data) => Some(Inbound::Data(data)),
        Message::Close(_) => Some(Inbound::Disconnected),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

/// Transport errors that mean the peer went away rather than a server fault.
pub fn classify_error(err: WsError) -> TransferError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Protocol(_) => {
            TransferError::Disconnected
        }
        other => TransferError::Fatal(anyhow!(other).context("websocket receive")),
    }
}

/// Control frame as received; `action` is checked separately so an unknown
/// action is told apart from a malformed frame.
#[derive(Deserialize)]
struct RawRequest {
    action: String,
    file_idx: u64,
    file_name: String,
    user_id: Uuid,
    session_id: Uuid,
}

/// Parse and validate a control frame.
///
/// Shape errors (bad JSON, missing fields, wrong types, bad uuids) are
/// request errors the session recovers from; a well-formed frame naming an
/// action the server does not implement is fatal.
pub fn parse_request(text: &str) -> TransferResult<TransferRequest> {
    let raw: RawRequest =
        serde_json::from_str(text).map_err(|e| TransferError::request(e.to_string()))?;
    let action = match raw.action.as_str() {
        "upload" => Action::Upload,
        "delete" => Action::Delete,
        other => return Err(TransferError::Fatal(anyhow!("unsupported action: {:?}", other))),
    };
    Ok(TransferRequest {
        action,
        file_idx: raw.file_idx,
        file_name: raw.file_name,
        user_id: raw.user_id,
        session_id: raw.session_id,
    })
}
