use anyhow::Result;
use filerecv::config::{ContentKind, ReceiverConfig};
use filerecv::net_async::{self, client::Client};
use filerecv::protocol::{Action, Status, TransferRequest};
use filerecv::tls;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    let p = sock.local_addr()?.port();
    drop(sock);
    Ok(p)
}

async fn wait_for_server(port: u16) {
    for _ in 0..50u32 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn config(root: &Path, port: u16) -> ReceiverConfig {
    let mut cfg = ReceiverConfig::new(root, ContentKind::Image);
    cfg.bind = format!("127.0.0.1:{}", port);
    cfg
}

fn sample_png() -> Vec<u8> {
    let img = image::RgbImage::from_fn(64, 48, |x, y| image::Rgb([(x * 4) as u8, (y * 5) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn request(action: Action, idx: u64, name: &str, user: Uuid, session: Uuid) -> TransferRequest {
    TransferRequest {
        action,
        file_idx: idx,
        file_name: name.to_string(),
        user_id: user,
        session_id: session,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_then_delete_roundtrip() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let port = free_port()?;
    let cfg = config(srv_tmp.path(), port);
    let server_task = tokio::spawn(async move {
        let _ = net_async::server::serve(cfg).await;
    });
    wait_for_server(port).await;

    let user = Uuid::new_v4();
    let session = Uuid::new_v4();
    let png = sample_png();
    let mut client = Client::connect(&format!("ws://127.0.0.1:{}/image/upload", port), None).await?;

    let mut seen = Vec::new();
    let done = client
        .upload(&request(Action::Upload, 0, "cat.png", user, session), &png, 512, |_, s| {
            seen.push(s.status)
        })
        .await?;
    assert_eq!(done.status, Status::Success);
    assert_eq!(seen.first(), Some(&Status::Ready));
    assert!(seen.iter().filter(|s| **s == Status::Uploading).count() >= 1);

    let stored = done.file_name.clone().unwrap();
    let session_dir = srv_tmp
        .path()
        .join("images")
        .join(user.to_string())
        .join(session.to_string())
        .join("original");
    assert_eq!(std::fs::read(session_dir.join(&stored))?, png);

    // Rejected upload on the same connection; the session stays usable.
    let rejected = client
        .upload(&request(Action::Upload, 1, "notes.png", user, session), b"plain text, not an image", 512, |_, _| {})
        .await?;
    assert_eq!(rejected.status, Status::Abort);
    assert_eq!(rejected.message.as_deref(), Some("Invalid file format"));

    let deleted = client
        .delete(&request(Action::Delete, 0, &stored, user, session))
        .await?;
    assert_eq!(deleted.status, Status::Success);
    assert_eq!(deleted.file_name.as_deref(), Some(stored.as_str()));
    assert!(!srv_tmp.path().join("images").join(user.to_string()).exists());

    client.close().await?;
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_connection_gets_timeout_then_close() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let port = free_port()?;
    let mut cfg = config(srv_tmp.path(), port);
    cfg.poll_interval = Duration::from_millis(50);
    cfg.idle_timeout = Duration::from_millis(200);
    let server_task = tokio::spawn(async move {
        let _ = net_async::server::serve(cfg).await;
    });
    wait_for_server(port).await;

    let mut client = Client::connect(&format!("ws://127.0.0.1:{}/", port), None).await?;
    let status = tokio::time::timeout(Duration::from_secs(5), client.next_status()).await??;
    assert_eq!(status.status, Status::Timeout);
    assert_eq!(status.message.as_deref(), Some("Connection timed out"));

    let after = tokio::time::timeout(Duration::from_secs(5), client.next_status()).await?;
    assert!(after.is_err(), "connection should be closed after the timeout");

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_upload_with_self_signed_cert() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let cert_dir = tempfile::tempdir()?;
    let cert = cert_dir.path().join("server-cert.pem");
    let key = cert_dir.path().join("server-key.pem");
    let tls_config = tls::load_or_generate_server_config(Some(cert.clone()), Some(key))?;

    let port = free_port()?;
    let cfg = config(srv_tmp.path(), port);
    let server_task = tokio::spawn(async move {
        let _ = net_async::server::serve_with_tls(cfg, tls_config).await;
    });
    wait_for_server(port).await;

    let url = format!("wss://localhost:{}/image/upload", port);
    assert!(Client::connect(&url, None).await.is_err());

    let mut client = Client::connect(&url, Some(&cert)).await?;
    let done = client
        .upload(
            &request(Action::Upload, 3, "pic.png", Uuid::new_v4(), Uuid::new_v4()),
            &sample_png(),
            4096,
            |_, _| {},
        )
        .await?;
    assert_eq!(done.status, Status::Success);
    assert!(done.file_name.unwrap().starts_with("3_"));

    client.close().await?;
    server_task.abort();
    Ok(())
}
