//! filerecv library
//!
//! WebSocket file receiver: chunked uploads with format, size and count
//! checks, near-duplicate detection and self-cleaning per-session storage.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod logger;
pub mod net_async;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod session;
pub mod status;
pub mod storage;
pub mod tls;
pub mod transfer;
pub mod url;
pub mod validator;
