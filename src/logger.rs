//! Append-only audit log of transfer events

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

pub trait Logger: Send + Sync {
    fn upload_done(&self, _path: &Path, _bytes: u64) {}
    fn rejected(&self, _path: &Path, _reason: &str) {}
    fn delete(&self, _path: &Path) {}
    fn timeout(&self, _user_id: &Uuid, _session_id: &Uuid) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn upload_done(&self, path: &Path, bytes: u64) {
        self.line(&format!("UPLOAD path={} bytes={}", path.display(), bytes));
    }
    fn rejected(&self, path: &Path, reason: &str) {
        self.line(&format!("REJECT path={} reason={}", path.display(), reason));
    }
    fn delete(&self, path: &Path) {
        self.line(&format!("DELETE path={}", path.display()));
    }
    fn timeout(&self, user_id: &Uuid, session_id: &Uuid) {
        self.line(&format!("TIMEOUT user={} session={}", user_id, session_id));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/audit.log");
        {
            let log = TextLogger::new(&path).unwrap();
            log.upload_done(Path::new("/a/0_ff.png"), 12);
            log.rejected(Path::new("/a/x.png"), "Duplicate file detected");
        }
        let log = TextLogger::new(&path).unwrap();
        log.delete(Path::new("/a/0_ff.png"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("UPLOAD path=/a/0_ff.png bytes=12"));
        assert!(lines[1].contains("reason=Duplicate file detected"));
        assert!(lines[2].contains("DELETE"));
    }
}
