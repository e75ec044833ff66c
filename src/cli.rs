//! Shared CLI definitions for filerecvd and the filerecv client

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::ContentKind;

/// Daemon options. Unset values fall back to the config file, then defaults.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "filerecvd - WebSocket file receiver")]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long, env = "FILERECV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:8000]
    #[arg(long, env = "FILERECV_BIND")]
    pub bind: Option<String>,

    /// Base storage directory [default: /mnt/efs]
    #[arg(long, env = "FILERECV_BASE_DIR")]
    pub root: Option<PathBuf>,

    /// Kind of content accepted [default: image]
    #[arg(long, value_enum, env = "FILERECV_CONTENT")]
    pub content: Option<ContentKind>,

    /// Accepted formats, comma separated, or '*' for any content
    #[arg(long, env = "FILERECV_ALLOWED_FORMATS")]
    pub allowed_formats: Option<String>,

    /// Maximum file size in MB (0 = unlimited)
    #[arg(long, env = "FILERECV_MAX_FILE_SIZE_MB")]
    pub max_file_size_mb: Option<u64>,

    /// Maximum number of files per session directory (0 = unlimited)
    #[arg(long, env = "FILERECV_MAX_FILE_COUNT")]
    pub max_file_count: Option<usize>,

    /// Watchdog poll interval in seconds
    #[arg(long, env = "FILERECV_POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Idle time in seconds before a session is closed
    #[arg(long, env = "FILERECV_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Append transfer events to this file
    #[arg(long, env = "FILERECV_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Serve wss:// (self-signed certificate unless --tls-cert/--tls-key are given)
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate chain for TLS
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "filerecv - upload files to a filerecvd server")]
pub struct ClientOpts {
    /// Server URL (ws://host:port/path)
    #[arg(long, default_value = "ws://127.0.0.1:8000/image/upload")]
    pub url: String,

    /// PEM certificate to trust for wss:// (e.g. the server's self-signed cert)
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Owner of the session directory
    #[arg(long)]
    pub user_id: Uuid,

    /// Session directory
    #[arg(long)]
    pub session_id: Uuid,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Upload a file
    Upload {
        /// File to send
        path: PathBuf,

        /// Slot index of the file within the session
        #[arg(long, default_value_t = 0)]
        index: u64,

        /// Name to announce (defaults to the file name of PATH)
        #[arg(long)]
        name: Option<String>,

        /// Chunk size in KB
        #[arg(long, default_value_t = 64)]
        chunk_kb: usize,
    },
    /// Delete a stored file
    Delete {
        /// Stored (canonical) file name
        name: String,

        /// Slot index of the file within the session
        #[arg(long, default_value_t = 0)]
        index: u64,
    },
}
