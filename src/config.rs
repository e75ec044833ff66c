//! Receiver configuration.
//!
//! Values are layered: built-in defaults (which depend on the content kind),
//! then an optional TOML file, then environment variables and CLI flags (both
//! handled by clap in [`crate::cli::DaemonOpts`]).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::DaemonOpts;
use crate::format::AllowList;
use crate::protocol::timeouts::{IDLE_TIMEOUT_SECS, WATCHDOG_POLL_SECS};
use crate::validator::{validator_for, BYTES_PER_MB};

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_BASE_DIR: &str = "/mnt/efs";

/// Kind of content a receiver accepts; selects the content validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Any,
}

impl ContentKind {
    /// Subdirectory of the base directory holding this kind of content
    pub fn subdir(&self) -> Option<&'static str> {
        match self {
            ContentKind::Image => Some("images"),
            ContentKind::Any => None,
        }
    }

    fn default_max_file_size_mb(&self) -> u64 {
        match self {
            ContentKind::Image => 5,
            ContentKind::Any => 0,
        }
    }

    fn default_max_file_count(&self) -> usize {
        match self {
            ContentKind::Image => 10,
            ContentKind::Any => 0,
        }
    }
}

/// Effective configuration of a running receiver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind: String,
    pub base_dir: PathBuf,
    pub content: ContentKind,
    pub allowed_formats: AllowList,
    /// 0 = unlimited
    pub max_file_size_mb: u64,
    /// 0 = unlimited
    pub max_file_count: usize,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub audit_log: Option<PathBuf>,
}

impl ReceiverConfig {
    pub fn new(base_dir: impl Into<PathBuf>, content: ContentKind) -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            base_dir: base_dir.into(),
            content,
            allowed_formats: validator_for(content).default_formats(),
            max_file_size_mb: content.default_max_file_size_mb(),
            max_file_count: content.default_max_file_count(),
            poll_interval: Duration::from_secs(WATCHDOG_POLL_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            audit_log: None,
        }
    }

    /// Directory under which `{user}/{session}/original` trees are created
    pub fn storage_root(&self) -> PathBuf {
        match self.content.subdir() {
            Some(sub) => self.base_dir.join(sub),
            None => self.base_dir.clone(),
        }
    }

    /// Build the effective configuration from CLI/env options and an optional file.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let file = match &opts.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let content = opts.content.or(file.content).unwrap_or(ContentKind::Image);
        let mut cfg = ReceiverConfig::new(DEFAULT_BASE_DIR, content);

        if let Some(v) = opts.bind.clone().or(file.bind) {
            cfg.bind = v;
        }
        if let Some(v) = opts.root.clone().or(file.base_dir) {
            cfg.base_dir = v;
        }
        if let Some(v) = opts.allowed_formats.clone().or(file.allowed_formats) {
            cfg.allowed_formats = v.parse().context("invalid allowed_formats")?;
        }
        if let Some(v) = opts.max_file_size_mb.or(file.max_file_size_mb) {
            cfg.max_file_size_mb = v;
        }
        if let Some(v) = opts.max_file_count.or(file.max_file_count) {
            cfg.max_file_count = v;
        }
        if let Some(v) = opts.poll_interval.or(file.poll_interval_secs) {
            cfg.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = opts.idle_timeout.or(file.idle_timeout_secs) {
            cfg.idle_timeout = Duration::from_secs(v);
        }
        cfg.audit_log = opts.audit_log.clone().or(file.audit_log);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.idle_timeout.is_zero() {
            bail!("idle timeout must be greater than zero");
        }
        if self.max_file_size_mb.checked_mul(BYTES_PER_MB).is_none() {
            bail!("max_file_size_mb is too large: {}", self.max_file_size_mb);
        }
        if self.content == ContentKind::Image {
            let missing = self.allowed_formats.undecodable();
            if !missing.is_empty() {
                let names: Vec<&str> = missing.iter().map(|f| f.name()).collect();
                bail!(
                    "allowed_formats lists {} but this build cannot decode it (enable the `heif` feature)",
                    names.join(",")
                );
            }
        }
        Ok(())
    }
}

/// On-disk TOML configuration; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub content: Option<ContentKind>,
    pub allowed_formats: Option<String>,
    pub max_file_size_mb: Option<u64>,
    pub max_file_count: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub audit_log: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: FileConfig =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }
}
