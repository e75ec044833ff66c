//! Async (Tokio) WebSocket transport: the receiving server and an upload client.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::protocol::MAX_FRAME_SIZE;

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

pub mod server {
    use super::*;
    use futures_util::StreamExt;
    use std::net::SocketAddr;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use tokio_tungstenite::accept_async_with_config;
    use tracing::{info, warn};

    use crate::config::ReceiverConfig;
    use crate::transfer::{ReceiverContext, SessionEnd, TransferManager};

    /// Serve plain ws:// connections until the listener fails.
    pub async fn serve(config: ReceiverConfig) -> Result<()> {
        serve_inner(config, None).await
    }

    /// Serve wss:// connections.
    pub async fn serve_with_tls(config: ReceiverConfig, tls: rustls::ServerConfig) -> Result<()> {
        serve_inner(config, Some(TlsAcceptor::from(Arc::new(tls)))).await
    }

    async fn serve_inner(config: ReceiverConfig, acceptor: Option<TlsAcceptor>) -> Result<()> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let ctx = Arc::new(ReceiverContext::new(config)?);
        info!(
            bind = %ctx.config.bind,
            root = %ctx.storage_root.display(),
            validator = ctx.validator.name(),
            formats = %ctx.limits.allowed,
            tls = acceptor.is_some(),
            "filerecvd listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let ctx = Arc::clone(&ctx);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = async move {
                    match acceptor {
                        Some(acc) => {
                            let tls = acc.accept(stream).await.context("tls handshake")?;
                            handle_connection(tls, peer, ctx).await
                        }
                        None => handle_connection(stream, peer, ctx).await,
                    }
                }
                .await
                {
                    warn!(%peer, error = %format!("{:#}", e), "connection error");
                }
            });
        }
    }

    /// Run one WebSocket session over an accepted stream.
    pub async fn handle_connection<S>(
        stream: S,
        peer: SocketAddr,
        ctx: Arc<ReceiverContext>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = accept_async_with_config(stream, Some(ws_config()))
            .await
            .context("websocket handshake")?;
        info!(%peer, "session opened");

        let (sink, inbound) = ws.split();
        let outcome = match TransferManager::new(sink, inbound, ctx).run().await {
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::TimedOut => "timed out",
            SessionEnd::Failed(_) => "failed",
        };
        info!(%peer, outcome, "session closed");
        Ok(())
    }
}

pub mod client {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::path::Path;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::TlsConnector;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{client_async_with_config, WebSocketStream};

    use crate::protocol::timeouts::{CONNECT_MS, STATUS_REPLY_MS};
    use crate::protocol::{Status, StatusFrame, TransferRequest, EOF_SENTINEL};
    use crate::tls;
    use crate::url::parse_server_url;

    /// Byte stream under the WebSocket: plain TCP or TLS
    pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}
    impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

    pub struct Client {
        ws: WebSocketStream<Box<dyn ClientIo>>,
    }

    impl Client {
        /// Connect to `ws://` or `wss://` URL. TLS connections trust only the
        /// certificates in `ca_cert`.
        pub async fn connect(url: &str, ca_cert: Option<&Path>) -> Result<Self> {
            let target = parse_server_url(url).ok_or_else(|| anyhow!("invalid server url: {}", url))?;
            let addr = target.authority();
            let tcp = timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(&addr))
                .await
                .map_err(|_| anyhow!("connect timeout ({} ms) to {}", CONNECT_MS, addr))?
                .with_context(|| format!("connect {}", addr))?;
            let _ = tcp.set_nodelay(true);

            let io: Box<dyn ClientIo> = if target.secure {
                let ca = ca_cert.ok_or_else(|| anyhow!("wss:// requires a trusted certificate (--ca-cert)"))?;
                let connector = TlsConnector::from(tls::client_config_with_ca(ca)?);
                let stream = connector
                    .connect(tls::server_name_for(&target.host)?, tcp)
                    .await
                    .context("tls handshake")?;
                Box::new(stream)
            } else {
                Box::new(tcp)
            };

            let (ws, _) = client_async_with_config(url, io, Some(ws_config()))
                .await
                .context("websocket handshake")?;
            Ok(Self { ws })
        }

        /// Stream `data` in `chunk_size` pieces, waiting for the server's reply
        /// to each one. `on_status` sees every reply with the bytes sent so far.
        ///
        /// Returns the final status: success, or the abort/error that stopped
        /// the transfer.
        pub async fn upload<F>(
            &mut self,
            request: &TransferRequest,
            data: &[u8],
            chunk_size: usize,
            mut on_status: F,
        ) -> Result<StatusFrame>
        where
            F: FnMut(u64, &StatusFrame),
        {
            let chunk_size = chunk_size.max(1);
            if data.chunks(chunk_size).any(|c| c == EOF_SENTINEL) {
                bail!("a chunk would equal the end-of-file marker; choose another chunk size");
            }

            self.send_request(request).await?;
            let ready = self.next_status().await?;
            on_status(0, &ready);
            if ready.status != Status::Ready {
                return Ok(ready);
            }

            let mut sent = 0u64;
            for chunk in data.chunks(chunk_size) {
                self.ws
                    .send(Message::Binary(chunk.to_vec()))
                    .await
                    .context("send chunk")?;
                sent += chunk.len() as u64;
                let status = self.next_status().await?;
                on_status(sent, &status);
                if status.status != Status::Uploading {
                    return Ok(status);
                }
            }

            self.ws
                .send(Message::Binary(EOF_SENTINEL.to_vec()))
                .await
                .context("send end-of-file marker")?;
            let done = self.next_status().await?;
            on_status(sent, &done);
            Ok(done)
        }

        pub async fn delete(&mut self, request: &TransferRequest) -> Result<StatusFrame> {
            self.send_request(request).await?;
            self.next_status().await
        }

        pub async fn send_request(&mut self, request: &TransferRequest) -> Result<()> {
            let text = serde_json::to_string(request).context("serialize request")?;
            self.send_text(text).await
        }

        /// Send a raw text frame.
        pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
            self.ws
                .send(Message::Text(text.into()))
                .await
                .context("send control frame")
        }

        /// Next status frame from the server. A close frame is an error
        /// carrying the server's reason.
        pub async fn next_status(&mut self) -> Result<StatusFrame> {
            loop {
                let msg = timeout(Duration::from_millis(STATUS_REPLY_MS), self.ws.next())
                    .await
                    .map_err(|_| anyhow!("no reply from server within {} ms", STATUS_REPLY_MS))?;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str(&text)
                            .with_context(|| format!("bad status frame: {}", text));
                    }
                    Some(Ok(Message::Close(frame))) => match frame {
                        Some(f) if !f.reason.is_empty() => {
                            bail!("server closed connection: {}", f.reason)
                        }
                        _ => bail!("server closed connection"),
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("receive status"),
                    None => bail!("server closed connection"),
                }
            }
        }

        pub async fn close(mut self) -> Result<()> {
            // The server may already have gone away.
            let _ = self.ws.close(None).await;
            Ok(())
        }
    }
}
