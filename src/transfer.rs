//! Per-connection request loop: dispatches uploads and deletes, drives the
//! chunked save and post-hoc validation, and cleans up after failures.

use anyhow::{anyhow, Context, Result};
use futures_util::{Sink, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReceiverConfig;
use crate::error::{Rejection, TransferError, TransferResult};
use crate::logger::{Logger, NoopLogger, TextLogger};
use crate::protocol::{Action, TransferRequest, EOF_SENTINEL};
use crate::protocol_core::{classify_error, classify_message, parse_request, Inbound};
use crate::session::Session;
use crate::storage;
use crate::validator::{self, validator_for, ContentValidator, Limits};

/// Everything a connection needs that is shared across connections
pub struct ReceiverContext {
    pub config: ReceiverConfig,
    pub limits: Limits,
    pub validator: Arc<dyn ContentValidator>,
    pub logger: Arc<dyn Logger>,
    pub storage_root: PathBuf,
}

impl ReceiverContext {
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        let logger: Arc<dyn Logger> = match &config.audit_log {
            Some(path) => Arc::new(TextLogger::new(path)?),
            None => Arc::new(NoopLogger),
        };
        Ok(Self::with_logger(config, logger))
    }

    pub fn with_logger(config: ReceiverConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            limits: Limits::from_config(&config),
            validator: validator_for(config.content),
            storage_root: config.storage_root(),
            logger,
            config,
        }
    }
}

/// The request being served, with its resolved paths
#[derive(Debug, Clone)]
struct CurrentFile {
    action: Action,
    file_idx: u64,
    file_name: String,
    user_id: Uuid,
    session_id: Uuid,
    file_dir: PathBuf,
    file_path: PathBuf,
}

impl CurrentFile {
    fn resolve(request: TransferRequest, root: &Path) -> TransferResult<Self> {
        let file_dir = storage::session_dir(root, &request.user_id, &request.session_id);
        let name = storage::sanitize_file_name(&request.file_name)
            .map_err(|e| TransferError::request(e.to_string()))?;
        let file_path = file_dir.join(name);
        Ok(Self {
            action: request.action,
            file_idx: request.file_idx,
            file_name: request.file_name,
            user_id: request.user_id,
            session_id: request.session_id,
            file_dir,
            file_path,
        })
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionEnd {
    Disconnected,
    TimedOut,
    Failed(anyhow::Error),
}

impl From<TransferError> for SessionEnd {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Disconnected => SessionEnd::Disconnected,
            TransferError::Fatal(e) => SessionEnd::Failed(e),
            other => SessionEnd::Failed(anyhow!("{}", other)),
        }
    }
}

/// Map a failed status send: a peer that went away is a disconnect.
fn send_failure(err: anyhow::Error) -> TransferError {
    match err.downcast_ref::<WsError>() {
        Some(
            WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Protocol(_),
        ) => TransferError::Disconnected,
        _ => TransferError::Fatal(err),
    }
}

pub struct TransferManager<Si, St> {
    inbound: St,
    session: Session<Si>,
    ctx: Arc<ReceiverContext>,
    current: Option<CurrentFile>,
    /// File written by an upload that has not been validated yet
    pending: Option<PathBuf>,
}

impl<Si, St> TransferManager<Si, St>
where
    Si: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    /// Start the session (and its watchdog) for one connection.
    pub fn new(sink: Si, inbound: St, ctx: Arc<ReceiverContext>) -> Self {
        let session = Session::start(sink, ctx.config.poll_interval, ctx.config.idle_timeout);
        Self {
            inbound,
            session,
            ctx,
            current: None,
            pending: None,
        }
    }

    /// Serve requests until the peer leaves, the session idles out or a fatal
    /// error occurs.
    pub async fn run(mut self) -> SessionEnd {
        let fired = self.session.watchdog.token();
        let end = tokio::select! {
            end = self.request_loop() => end,
            _ = fired.cancelled() => SessionEnd::TimedOut,
        };

        self.session.watchdog.cancel();
        self.discard_pending();
        if let Some(cur) = &self.current {
            if let Err(e) = storage::remove_empty_dirs(&cur.file_dir) {
                warn!(dir = %cur.file_dir.display(), error = %e, "failed to prune session directories");
            }
        }

        let (action, file_name, path) = match &self.current {
            Some(cur) => (cur.action.as_str(), cur.file_name.as_str(), cur.file_path.as_path()),
            None => ("none", "", Path::new("")),
        };
        match &end {
            SessionEnd::Disconnected => debug!("peer disconnected"),
            SessionEnd::TimedOut => {
                info!(action, file_name, "session timed out");
                if let Some(cur) = &self.current {
                    self.ctx.logger.timeout(&cur.user_id, &cur.session_id);
                }
            }
            SessionEnd::Failed(err) => {
                let reason = format!("{:#}", err);
                error!(
                    action,
                    file_name,
                    user_id = ?self.current.as_ref().map(|c| c.user_id),
                    session_id = ?self.current.as_ref().map(|c| c.session_id),
                    error = %reason,
                    "transfer failed"
                );
                self.ctx.logger.error(action, path, &reason);
                if let Err(e) = self.session.emitter.send_error(Some(&reason)).await {
                    debug!(error = %e, "error status not delivered");
                }
                if let Err(e) = self.session.emitter.close(Some(&reason)).await {
                    debug!(error = %e, "close frame not delivered");
                }
            }
        }
        end
    }

    async fn request_loop(&mut self) -> SessionEnd {
        loop {
            let result = match self.next_inbound().await {
                Ok(Inbound::Control(text)) => self.handle_control(&text).await,
                Ok(Inbound::Data(data)) => {
                    debug!(bytes = data.len(), "discarding stray binary frame");
                    continue;
                }
                Ok(Inbound::Disconnected) => Err(TransferError::Disconnected),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    if let Err(e) = self.abort_transfer(&err.to_string()).await {
                        return e.into();
                    }
                }
                Err(err) => return err.into(),
            }
        }
    }

    /// Drop the in-flight file and tell the client why.
    async fn abort_transfer(&mut self, reason: &str) -> TransferResult<()> {
        debug!(reason, "transfer aborted");
        if let Some(path) = &self.pending {
            self.ctx.logger.rejected(path, reason);
        }
        self.discard_pending();
        self.session
            .emitter
            .send_abort(Some(reason))
            .await
            .map_err(send_failure)
    }

    fn discard_pending(&mut self) {
        let Some(path) = self.pending.take() else {
            return;
        };
        match storage::remove_file_and_dirs(&path) {
            Ok(_) => debug!(path = %path.display(), "removed unfinished upload"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove unfinished upload"),
        }
    }

    async fn next_inbound(&mut self) -> TransferResult<Inbound> {
        loop {
            match self.inbound.next().await {
                None => return Ok(Inbound::Disconnected),
                Some(Ok(msg)) => {
                    if let Some(frame) = classify_message(msg) {
                        return Ok(frame);
                    }
                }
                Some(Err(e)) => return Err(classify_error(e)),
            }
        }
    }

    async fn handle_control(&mut self, text: &str) -> TransferResult<()> {
        self.current = None;
        let request = parse_request(text)?;
        let current = CurrentFile::resolve(request, &self.ctx.storage_root)?;
        storage::ensure_dir_exists(&current.file_dir)?;
        self.current = Some(current.clone());

        match current.action {
            Action::Upload => self.perform_upload(&current).await,
            Action::Delete => self.perform_delete(&current).await,
        }
    }

    async fn perform_upload(&mut self, file: &CurrentFile) -> TransferResult<()> {
        // Owned from here on: any exit removes the file (if written) and the
        // directories created for it.
        self.pending = Some(file.file_path.clone());
        self.session.emitter.send_ready().await.map_err(send_failure)?;

        let received = self.save_file(&file.file_path).await?;
        if received == 0 {
            return Err(Rejection::EmptyFile.into());
        }

        let fingerprint = self.validate(file).await?;
        let final_name = storage::canonical_name(
            file.file_idx,
            fingerprint,
            &storage::extension_of(&file.file_name),
        );
        let final_path = file.file_dir.join(&final_name);
        tokio::fs::rename(&file.file_path, &final_path)
            .await
            .with_context(|| format!("rename {} -> {}", file.file_path.display(), final_path.display()))?;
        self.pending = None;

        info!(
            user_id = %file.user_id,
            session_id = %file.session_id,
            file = %final_name,
            bytes = received,
            "upload complete"
        );
        self.ctx.logger.upload_done(&final_path, received);
        self.session
            .emitter
            .send_success_upload(&final_name)
            .await
            .map_err(send_failure)
    }

    /// Receive data frames into `path` until the `EOF` sentinel.
    async fn save_file(&mut self, path: &Path) -> TransferResult<u64> {
        let mut out = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        let budget = self.ctx.limits.max_size_bytes;
        let mut received: u64 = 0;

        loop {
            let chunk = match self.next_inbound().await? {
                Inbound::Data(data) => data,
                Inbound::Control(_) => return Err(TransferError::request("Expected binary frame")),
                Inbound::Disconnected => return Err(TransferError::Disconnected),
            };
            if chunk.as_slice() == EOF_SENTINEL {
                break;
            }
            if received == 0 {
                self.ctx.limits.validate_header(&chunk)?;
            }
            received += chunk.len() as u64;
            self.ctx.limits.check_size(received)?;

            self.session
                .emitter
                .send_progress(received, budget)
                .await
                .map_err(send_failure)?;
            out.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", path.display()))?;
        }
        out.flush().await?;
        Ok(received)
    }

    /// Integrity, uniqueness and count checks on the complete file; returns
    /// the content fingerprint.
    async fn validate(&self, file: &CurrentFile) -> TransferResult<u64> {
        let ctx = Arc::clone(&self.ctx);
        let path = file.file_path.clone();
        let dir = file.file_dir.clone();
        let file_idx = file.file_idx;

        tokio::task::spawn_blocking(move || -> TransferResult<u64> {
            let fingerprint = ctx.validator.validate_and_fingerprint(&path)?;
            debug!(
                validator = ctx.validator.name(),
                path = %path.display(),
                fingerprint = %format!("{:016x}", fingerprint),
                "fingerprint computed"
            );
            validator::validate_unique(&path, file_idx, fingerprint)?;
            ctx.limits.check_count(&dir)?;
            Ok(fingerprint)
        })
        .await
        .map_err(|e| TransferError::Fatal(anyhow::Error::new(e).context("validation task")))?
    }

    async fn perform_delete(&mut self, file: &CurrentFile) -> TransferResult<()> {
        let target = resolve_delete_target(file)?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.file_name.clone());

        if storage::remove_file_and_dirs(&target)? {
            info!(
                user_id = %file.user_id,
                session_id = %file.session_id,
                file = %name,
                "file deleted"
            );
            self.ctx.logger.delete(&target);
        } else {
            debug!(path = %target.display(), "delete target already absent");
        }
        self.session
            .emitter
            .send_success_delete(&name)
            .await
            .map_err(send_failure)
    }
}

/// The named file, or the canonical file stored for the same index.
fn resolve_delete_target(file: &CurrentFile) -> Result<PathBuf> {
    if file.file_path.exists() {
        return Ok(file.file_path.clone());
    }
    let by_index = storage::canonical_siblings(&file.file_dir, None)?
        .into_iter()
        .find(|e| e.file_idx == file.file_idx);
    Ok(by_index.map(|e| e.path).unwrap_or_else(|| file.file_path.clone()))
}
