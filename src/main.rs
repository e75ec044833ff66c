//! filerecv - command-line client for filerecvd
//!
//! Uploads a file (or deletes a stored one) over the WebSocket protocol and
//! renders the server's progress reports.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;

use filerecv::cli::{ClientCommand, ClientOpts};
use filerecv::net_async::client::Client;
use filerecv::progress::UploadProgress;
use filerecv::protocol::{Action, Status, TransferRequest};

fn main() -> Result<()> {
    let opts = ClientOpts::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts))
}

async fn run(opts: ClientOpts) -> Result<()> {
    let mut client = Client::connect(&opts.url, opts.ca_cert.as_deref())
        .await
        .with_context(|| format!("connect {}", opts.url))?;

    match opts.command {
        ClientCommand::Upload {
            path,
            index,
            name,
            chunk_kb,
        } => {
            let file_name = match name {
                Some(n) => n,
                None => file_name_of(&path)?,
            };
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            let request = TransferRequest {
                action: Action::Upload,
                file_idx: index,
                file_name: file_name.clone(),
                user_id: opts.user_id,
                session_id: opts.session_id,
            };

            let mut progress = UploadProgress::new(&file_name);
            let result = client
                .upload(&request, &data, chunk_kb * 1024, |sent, status| {
                    progress.update(sent, status.progress)
                })
                .await;
            let status = match result {
                Ok(s) => s,
                Err(e) => {
                    progress.finish_error(&e.to_string());
                    return Err(e);
                }
            };
            client.close().await?;

            if status.status == Status::Success {
                progress.finish_success(status.file_name.as_deref().unwrap_or(&file_name));
                println!("{}", status.file_name.unwrap_or(file_name));
                Ok(())
            } else {
                let reason = status.message.unwrap_or_else(|| format!("{:?}", status.status));
                progress.finish_error(&reason);
                bail!("upload rejected: {}", reason)
            }
        }
        ClientCommand::Delete { name, index } => {
            let request = TransferRequest {
                action: Action::Delete,
                file_idx: index,
                file_name: name,
                user_id: opts.user_id,
                session_id: opts.session_id,
            };
            let status = client.delete(&request).await?;
            client.close().await?;
            if status.status != Status::Success {
                bail!(
                    "delete failed: {}",
                    status.message.unwrap_or_else(|| format!("{:?}", status.status))
                );
            }
            println!("deleted {}", status.file_name.unwrap_or_default());
            Ok(())
        }
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}
