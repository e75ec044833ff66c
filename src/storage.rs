//! On-disk layout of received files.
//!
//! Files live under `{root}/{user_id}/{session_id}/original/`. A file is first
//! written under the client supplied name and renamed to its canonical
//! `{file_idx}_{hash}{ext}` form once validated. The three directory levels
//! exist only while at least one file lives below them.

use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::checksum;

/// Leaf directory holding the uploaded files of a session.
pub const ORIGINAL_DIR: &str = "original";

/// Number of directory levels owned by a session (user, session, original).
const OWNED_LEVELS: usize = 3;

/// Reject file names that are not a single plain path component.
pub fn sanitize_file_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        bail!("file_name must not be empty");
    }
    if name.contains('\0') {
        bail!("file_name contains NUL byte");
    }
    // Backslashes are separators on Windows; refuse them everywhere so the
    // layout is identical across platforms.
    if name.contains('\\') {
        bail!("file_name contains a path separator");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => {}
        _ => bail!("file_name must be a plain file name: {:?}", name),
    }
    #[cfg(windows)]
    if name.contains(':') {
        bail!("file_name contains colon (potential ADS attack)");
    }
    Ok(name)
}

/// `{root}/{user_id}/{session_id}/original`
pub fn session_dir(root: &Path, user_id: &Uuid, session_id: &Uuid) -> PathBuf {
    root.join(user_id.to_string())
        .join(session_id.to_string())
        .join(ORIGINAL_DIR)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

/// Extension of `name` including the leading dot, or an empty string
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

pub fn canonical_name(file_idx: u64, hash: u64, extension: &str) -> String {
    format!("{}_{}{}", file_idx, checksum::to_hex(hash), extension)
}

/// Split a canonical name into its index and hash token.
///
/// Matches `^(\d+)_([^.]+)`: the index is the leading run of digits and the
/// token runs up to the first dot.
pub fn parse_canonical_name(name: &str) -> Option<(u64, &str)> {
    let (idx, rest) = name.split_once('_')?;
    if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let token = rest.split('.').next().unwrap_or("");
    if token.is_empty() {
        return None;
    }
    Some((idx.parse().ok()?, token))
}

/// A validated sibling found in a session directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub path: PathBuf,
    pub file_idx: u64,
    pub token: String,
}

/// Canonically named files in `dir`, skipping `exclude`.
pub fn canonical_siblings(dir: &Path, exclude: Option<&Path>) -> Result<Vec<StoredEntry>> {
    let mut out = Vec::new();
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("read_dir {}", dir.display())),
    };
    for entry in rd.flatten() {
        let path = entry.path();
        if exclude.is_some_and(|x| x == path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((file_idx, token)) = parse_canonical_name(&name) {
            out.push(StoredEntry {
                file_idx,
                token: token.to_string(),
                path,
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Number of entries in `dir` (0 when it does not exist)
pub fn count_entries(dir: &Path) -> Result<usize> {
    match std::fs::read_dir(dir) {
        Ok(rd) => Ok(rd.flatten().count()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("read_dir {}", dir.display())),
    }
}

/// Remove `file_dir` and its session/user parents, bottom-up, while empty.
///
/// A directory that is repopulated (or removed) concurrently simply stops the
/// walk.
pub fn remove_empty_dirs(file_dir: &Path) -> Result<()> {
    let mut dir = Some(file_dir);
    for _ in 0..OWNED_LEVELS {
        let Some(d) = dir else { break };
        match std::fs::remove_dir(d) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if is_not_empty(&e) => break,
            Err(e) => return Err(e).with_context(|| format!("remove_dir {}", d.display())),
        }
        dir = d.parent();
    }
    Ok(())
}

fn is_not_empty(e: &std::io::Error) -> bool {
    // ENOTEMPTY / EEXIST on unix, ERROR_DIR_NOT_EMPTY on Windows
    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(39) | Some(66) | Some(17))
    }
    #[cfg(windows)]
    {
        matches!(e.raw_os_error(), Some(145))
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Remove a file (no-op if absent) and then any emptied ancestor directories.
/// Returns whether a file was removed.
pub fn remove_file_and_dirs(path: &Path) -> Result<bool> {
    let removed = match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
    };
    if let Some(dir) = path.parent() {
        remove_empty_dirs(dir)?;
    }
    Ok(removed)
}
