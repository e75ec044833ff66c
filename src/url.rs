//! URL parsing for ws:// and wss:// server addresses

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ServerUrl {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_server_url(s: &str) -> Option<ServerUrl> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let scheme_end = lower.find("://")?;
    let secure = match &lower[..scheme_end] {
        "ws" => false,
        "wss" => true,
        _ => return None,
    };
    let rest = &s_trim[scheme_end + 3..];
    let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }
    let default_port = if secure { 443 } else { 80 };
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) if !h.is_empty() => (h.to_string(), pr.parse().ok()?),
        Some(_) => return None,
        None => (hp.to_string(), default_port),
    };
    Some(ServerUrl {
        secure,
        host,
        port,
        path: format!("/{}", p),
    })
}
