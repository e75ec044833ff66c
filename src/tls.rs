use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

/// Host names the generated self-signed certificate is valid for
const SELF_SIGNED_NAMES: &[&str] = &["localhost", "filerecvd.local"];

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("filerecv");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("filerecv");
    }
    PathBuf::from(".filerecv")
}

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificate found in {}", path.display()));
    }
    Ok(out)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut rd)
        .context("read private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Server TLS configuration from the given PEM files, or from a self-signed
/// certificate generated (once) under [`config_dir`].
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => return Err(anyhow!("--tls-cert requires --tls-key")),
    };

    if !cert_path.exists() || !key_path.exists() {
        let dir = cert_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).ok();
        let names = SELF_SIGNED_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let cert = rcgen::generate_simple_self_signed(names).context("generate self-signed cert")?;
        fs::write(&cert_path, cert.serialize_pem().context("serialize cert")?)
            .context("write cert pem")?;
        fs::write(&key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    }

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(&cert_path)?, load_key(&key_path)?)
        .context("build server tls config")?;
    Ok(cfg)
}

/// Client configuration trusting the certificates in `ca_path` (typically the
/// server's self-signed certificate).
pub fn client_config_with_ca(ca_path: &Path) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).context("add trusted certificate")?;
    }
    let cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(cfg))
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {:?}: {}", host, e))
}
