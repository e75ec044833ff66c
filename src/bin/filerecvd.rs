use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use filerecv::cli::DaemonOpts;
use filerecv::config::ReceiverConfig;
use filerecv::{net_async, tls};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("filerecv=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ReceiverConfig::from_opts(&opts)?;

    let root = config.storage_root();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create storage root: {}", root.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Storage root is not a directory: {}", root.display());
    }

    info!(
        root = %root.display(),
        bind = %config.bind,
        content = ?config.content,
        max_file_size_mb = config.max_file_size_mb,
        max_file_count = config.max_file_count,
        "starting filerecvd"
    );
    if config.bind.starts_with("0.0.0.0") && !opts.tls {
        warn!("listening on all interfaces without TLS; uploads travel in plain text");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let server = async move {
            if opts.tls {
                if opts.tls_cert.is_none() {
                    info!(
                        cert = %tls::config_dir().join("server-cert.pem").display(),
                        "using self-signed certificate"
                    );
                }
                let tls_config = tls::load_or_generate_server_config(opts.tls_cert, opts.tls_key)
                    .context("Failed to set up TLS configuration")?;
                net_async::server::serve_with_tls(config, tls_config).await
            } else {
                net_async::server::serve(config).await
            }
        };
        tokio::select! {
            res = server => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                Ok(())
            }
        }
    })
}
