//! Per-connection session: status emitter plus the idle watchdog.

use futures_util::Sink;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::status::StatusEmitter;

/// Background task closing the connection after a period of inactivity.
///
/// The task is aborted when the guard is dropped, so every exit path of the
/// session cancels it. Cancelling more than once is harmless.
pub struct Watchdog {
    handle: JoinHandle<()>,
    fired: CancellationToken,
}

impl Watchdog {
    pub fn spawn<Si>(emitter: StatusEmitter<Si>, poll: Duration, idle: Duration) -> Self
    where
        Si: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let fired = CancellationToken::new();
        let token = fired.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + poll, poll);
            loop {
                ticker.tick().await;
                let idle_for = emitter.idle_for();
                if idle_for < idle {
                    continue;
                }
                warn!(idle_secs = idle_for.as_secs(), "closing idle session");
                // The peer may already be gone; nothing to do about it then.
                if let Err(e) = emitter.send_timeout().await {
                    debug!(error = %e, "timeout status not delivered");
                }
                if let Err(e) = emitter.close(None).await {
                    debug!(error = %e, "close frame not delivered");
                }
                token.cancel();
                break;
            }
        });
        Self { handle, fired }
    }

    /// Token cancelled when the watchdog fires
    pub fn token(&self) -> CancellationToken {
        self.fired.clone()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One connection's session state
pub struct Session<Si> {
    pub emitter: StatusEmitter<Si>,
    pub watchdog: Watchdog,
}

impl<Si> Session<Si>
where
    Si: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    pub fn start(sink: Si, poll: Duration, idle: Duration) -> Self {
        let emitter = StatusEmitter::new(sink);
        let watchdog = Watchdog::spawn(emitter.clone(), poll, idle);
        Self { emitter, watchdog }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use crate::status::test_support::*;

    #[tokio::test]
    async fn fires_once_after_idle() {
        let (sink, mut rx) = channel_sink();
        let session = Session::start(sink, Duration::from_millis(20), Duration::from_millis(60));

        tokio::time::timeout(Duration::from_secs(2), session.watchdog.token().cancelled())
            .await
            .expect("watchdog should fire");
        assert!(session.watchdog.token().is_cancelled());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut timeouts = 0;
        let mut closes = 0;
        while let Ok(Some(msg)) = rx.try_next() {
            match msg {
                Message::Text(t) if t.contains("\"timeout\"") => timeouts += 1,
                Message::Close(_) => closes += 1,
                _ => {}
            }
        }
        assert_eq!(timeouts, 1);
        assert_eq!(closes, 1);
        assert_eq!(session.emitter.state(), Status::Timeout);
    }

    #[tokio::test]
    async fn activity_keeps_session_alive() {
        let (sink, mut rx) = channel_sink();
        let session = Session::start(sink, Duration::from_millis(20), Duration::from_millis(150));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            session.emitter.send_progress(1, 10).await.unwrap();
        }
        assert!(!session.watchdog.token().is_cancelled());
        assert!(drain_status(&mut rx).iter().all(|f| f.status != Status::Timeout));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (sink, mut rx) = channel_sink();
        let session = Session::start(sink, Duration::from_millis(10), Duration::from_millis(30));
        session.watchdog.cancel();
        session.watchdog.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.watchdog.token().is_cancelled());
        assert!(drain_status(&mut rx).is_empty());
        drop(session);
    }
}
