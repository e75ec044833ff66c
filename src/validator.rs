//! Upload validation rules.
//!
//! Header, size and count checks are content-agnostic and live on [`Limits`].
//! Integrity checking and fingerprinting depend on the kind of content being
//! received and sit behind the [`ContentValidator`] capability, selected from
//! configuration by [`validator_for`].

use anyhow::Result;
use image::DynamicImage;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::checksum::{self, DUPLICATE_DISTANCE};
use crate::config::{ContentKind, ReceiverConfig};
use crate::error::{Rejection, TransferError, TransferResult};
use crate::format::{self, AllowList, Format};
use crate::protocol::HEADER_LEN;
use crate::storage;

/// Size in bytes of one "MB" in configuration values
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Content-agnostic limits applied to every upload
#[derive(Debug, Clone)]
pub struct Limits {
    pub allowed: AllowList,
    /// 0 = unlimited
    pub max_size_bytes: u64,
    /// 0 = unlimited
    pub max_files: usize,
}

impl Limits {
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self {
            allowed: config.allowed_formats.clone(),
            max_size_bytes: config.max_file_size_mb.saturating_mul(BYTES_PER_MB),
            max_files: config.max_file_count,
        }
    }

    /// Check the first bytes of an upload against the allow-list.
    pub fn validate_header(&self, chunk: &[u8]) -> Result<(), Rejection> {
        let header = &chunk[..chunk.len().min(HEADER_LEN)];
        if self.allowed.accepts(header) {
            Ok(())
        } else {
            Err(Rejection::InvalidFormat)
        }
    }

    pub fn check_size(&self, received: u64) -> Result<(), Rejection> {
        if self.max_size_bytes != 0 && received > self.max_size_bytes {
            return Err(Rejection::SizeExceeded);
        }
        Ok(())
    }

    /// Count entries in the destination directory, the new file included.
    pub fn check_count(&self, file_dir: &Path) -> TransferResult<()> {
        if self.max_files == 0 {
            return Ok(());
        }
        if storage::count_entries(file_dir)? > self.max_files {
            return Err(Rejection::UploadLimitExceeded.into());
        }
        Ok(())
    }
}

/// Reject `fingerprint` if a sibling under a different index is within
/// [`DUPLICATE_DISTANCE`]. The file at `file_path` itself is never compared.
pub fn validate_unique(file_path: &Path, file_idx: u64, fingerprint: u64) -> TransferResult<()> {
    let Some(dir) = file_path.parent() else {
        return Ok(());
    };
    for sibling in storage::canonical_siblings(dir, Some(file_path))? {
        if sibling.file_idx == file_idx {
            continue;
        }
        let Some(other) = checksum::from_hex(&sibling.token) else {
            debug!(path = %sibling.path.display(), "skipping sibling with non-hex hash token");
            continue;
        };
        let distance = checksum::hamming_distance(fingerprint, other);
        if distance < DUPLICATE_DISTANCE {
            debug!(
                path = %sibling.path.display(),
                distance,
                "near-duplicate of existing file"
            );
            return Err(Rejection::Duplicate.into());
        }
    }
    Ok(())
}

/// Content-specific validation capability
pub trait ContentValidator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Formats accepted when no allow-list is configured explicitly
    fn default_formats(&self) -> AllowList;

    /// Verify the structure of the complete file; blocking.
    fn validate_integrity(&self, path: &Path) -> TransferResult<()>;

    /// 64-bit fingerprint used for near-duplicate detection; blocking.
    fn compute_fingerprint(&self, path: &Path) -> TransferResult<u64>;

    /// Integrity check followed by the fingerprint; blocking. Validators that
    /// parse the whole file for both override this to parse it once.
    fn validate_and_fingerprint(&self, path: &Path) -> TransferResult<u64> {
        self.validate_integrity(path)?;
        self.compute_fingerprint(path)
    }
}

/// Decodes uploads as images and fingerprints them with a difference hash
#[derive(Debug, Default)]
pub struct ImageValidator;

impl ImageValidator {
    /// Decode by sniffed signature: HEIC/HEIF go through libheif, the rest
    /// through the `image` codecs.
    fn decode(path: &Path) -> TransferResult<DynamicImage> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        std::fs::File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;
        match format::sniff(&header) {
            Some(Format::Heic | Format::Heif) => decode_heif(path),
            Some(_) => decode_raster(path),
            None => Err(Rejection::InvalidFormat.into()),
        }
    }
}

fn decode_raster(path: &Path) -> TransferResult<DynamicImage> {
    let reader = image::ImageReader::open(path)?
        .with_guessed_format()
        .map_err(|_| Rejection::InvalidFormat)?;
    reader.decode().map_err(|e| {
        debug!(path = %path.display(), error = %e, "image decode failed");
        TransferError::from(Rejection::InvalidFormat)
    })
}

#[cfg(feature = "heif")]
fn decode_heif(path: &Path) -> TransferResult<DynamicImage> {
    use libheif_rs::{ColorSpace, HeifContext, HeifError, LibHeif, RgbChroma};

    let invalid = |e: HeifError| {
        debug!(path = %path.display(), error = %e, "heif decode failed");
        TransferError::from(Rejection::InvalidFormat)
    };
    let path_str = path.to_str().ok_or(Rejection::InvalidFormat)?;
    let lib = LibHeif::new();
    let ctx = HeifContext::read_from_file(path_str).map_err(invalid)?;
    let handle = ctx.primary_image_handle().map_err(invalid)?;
    let decoded = lib
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(invalid)?;

    let planes = decoded.planes();
    let plane = planes.interleaved.ok_or(Rejection::InvalidFormat)?;
    let row = plane.width as usize * 3;
    let mut pixels = Vec::with_capacity(row * plane.height as usize);
    for y in 0..plane.height as usize {
        let start = y * plane.stride;
        let line = plane
            .data
            .get(start..start + row)
            .ok_or(Rejection::InvalidFormat)?;
        pixels.extend_from_slice(line);
    }
    let rgb = image::RgbImage::from_raw(plane.width, plane.height, pixels).ok_or(Rejection::InvalidFormat)?;
    Ok(DynamicImage::ImageRgb8(rgb))
}

#[cfg(not(feature = "heif"))]
fn decode_heif(path: &Path) -> TransferResult<DynamicImage> {
    debug!(path = %path.display(), "built without heif support");
    Err(Rejection::InvalidFormat.into())
}

impl ContentValidator for ImageValidator {
    fn name(&self) -> &'static str {
        "image"
    }

    fn default_formats(&self) -> AllowList {
        AllowList::images()
    }

    fn validate_integrity(&self, path: &Path) -> TransferResult<()> {
        Self::decode(path).map(|_| ())
    }

    fn compute_fingerprint(&self, path: &Path) -> TransferResult<u64> {
        let img = Self::decode(path)?;
        Ok(checksum::dhash(&img))
    }

    fn validate_and_fingerprint(&self, path: &Path) -> TransferResult<u64> {
        self.compute_fingerprint(path)
    }
}

/// Accepts any content; fingerprints are derived from the blake3 digest so only
/// (nearly) identical bytes are flagged as duplicates.
#[derive(Debug, Default)]
pub struct AnyValidator;

impl ContentValidator for AnyValidator {
    fn name(&self) -> &'static str {
        "any"
    }

    fn default_formats(&self) -> AllowList {
        AllowList::Any
    }

    fn validate_integrity(&self, _path: &Path) -> TransferResult<()> {
        Ok(())
    }

    fn compute_fingerprint(&self, path: &Path) -> TransferResult<u64> {
        Ok(checksum::file_fingerprint(path)?)
    }
}

pub fn validator_for(kind: ContentKind) -> Arc<dyn ContentValidator> {
    match kind {
        ContentKind::Image => Arc::new(ImageValidator),
        ContentKind::Any => Arc::new(AnyValidator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn limits(max_size_bytes: u64, max_files: usize) -> Limits {
        Limits {
            allowed: "png,jpeg".parse().unwrap(),
            max_size_bytes,
            max_files,
        }
    }

    #[test]
    fn test_header_and_size() {
        let l = limits(100, 0);
        assert!(l.validate_header(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRmore").is_ok());
        assert_eq!(l.validate_header(&[0u8; 12]), Err(Rejection::InvalidFormat));
        assert!(l.check_size(100).is_ok());
        assert_eq!(l.check_size(101), Err(Rejection::SizeExceeded));
        assert!(limits(0, 0).check_size(u64::MAX).is_ok());
    }

    #[test]
    fn test_count_limit() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), b"").unwrap();
        fs::write(tmp.path().join("b"), b"").unwrap();
        assert!(limits(0, 2).check_count(tmp.path()).is_ok());
        assert!(matches!(
            limits(0, 1).check_count(tmp.path()),
            Err(TransferError::Rejected(Rejection::UploadLimitExceeded))
        ));
        assert!(limits(0, 0).check_count(tmp.path()).is_ok());
    }

    #[test]
    fn test_unique_distance_threshold() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        // 9 bits away from 0 -> duplicate, 10 bits away -> distinct
        fs::write(dir.join(format!("0_{}.png", checksum::to_hex(0x1ff))), b"").unwrap();
        let upload = dir.join("new.png");
        fs::write(&upload, b"").unwrap();

        assert!(matches!(
            validate_unique(&upload, 1, 0),
            Err(TransferError::Rejected(Rejection::Duplicate))
        ));
        assert!(validate_unique(&upload, 1, 0x1ff ^ 0x3ff00).is_ok());
    }

    #[test]
    fn test_unique_ignores_same_index() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join(format!("4_{}.png", checksum::to_hex(0xabc))), b"").unwrap();
        let upload = dir.join("again.png");
        fs::write(&upload, b"").unwrap();

        assert!(validate_unique(&upload, 4, 0xabc).is_ok());
        assert!(validate_unique(&upload, 5, 0xabc).is_err());
    }

    #[test]
    fn test_unique_never_compares_file_with_itself() {
        let tmp = TempDir::new().unwrap();
        let upload = tmp.path().join(format!("7_{}.png", checksum::to_hex(0x42)));
        fs::write(&upload, b"").unwrap();
        assert!(validate_unique(&upload, 8, 0x42).is_ok());
    }

    #[test]
    fn test_image_validator_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fake.png");
        fs::write(&path, b"\x89PNG\r\n\x1a\nthis is not a png").unwrap();
        assert!(matches!(
            ImageValidator.validate_integrity(&path),
            Err(TransferError::Rejected(Rejection::InvalidFormat))
        ));
    }

    #[test]
    fn test_image_validator_fingerprints_png() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ok.png");
        let img = image::RgbImage::from_fn(32, 32, |x, y| image::Rgb([(x * 8) as u8, (y * 8) as u8, 0]));
        img.save(&path).unwrap();

        let v = validator_for(ContentKind::Image);
        assert!(v.validate_integrity(&path).is_ok());
        let a = v.compute_fingerprint(&path).unwrap();
        let b = v.compute_fingerprint(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(v.validate_and_fingerprint(&path).unwrap(), a);
    }

    #[test]
    fn test_single_pass_rejects_like_integrity() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cut.png");
        let mut img = Vec::new();
        image::RgbImage::from_fn(16, 16, |x, _| image::Rgb([x as u8 * 16, 0, 0]))
            .write_to(&mut std::io::Cursor::new(&mut img), image::ImageFormat::Png)
            .unwrap();
        fs::write(&path, &img[..img.len() / 2]).unwrap();

        assert!(matches!(
            ImageValidator.validate_and_fingerprint(&path),
            Err(TransferError::Rejected(Rejection::InvalidFormat))
        ));
        assert!(matches!(
            AnyValidator.validate_and_fingerprint(&path),
            Ok(fp) if fp == checksum::file_fingerprint(&path).unwrap()
        ));
    }

    #[cfg(not(feature = "heif"))]
    #[test]
    fn test_heic_without_decoder_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.heic");
        fs::write(&path, b"\0\0\0\x18ftypheic\0\0\0\0mif1heic").unwrap();
        assert!(matches!(
            ImageValidator.validate_integrity(&path),
            Err(TransferError::Rejected(Rejection::InvalidFormat))
        ));
        let limits = Limits::from_config(&ReceiverConfig::new("/data", ContentKind::Image));
        assert_eq!(
            limits.validate_header(b"\0\0\0\x18ftypheic\0\0\0\0"),
            Err(Rejection::InvalidFormat)
        );
    }

    #[cfg(feature = "heif")]
    #[test]
    fn test_heif_garbage_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.heic");
        fs::write(&path, b"\0\0\0\x18ftypheic\0\0\0\0not really a heic file").unwrap();
        assert!(matches!(
            ImageValidator.validate_and_fingerprint(&path),
            Err(TransferError::Rejected(Rejection::InvalidFormat))
        ));
    }

    #[test]
    fn test_any_validator() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob.bin");
        fs::write(&path, b"\0\0\0\0 anything").unwrap();
        let v = validator_for(ContentKind::Any);
        assert!(v.validate_integrity(&path).is_ok());
        assert_eq!(
            v.compute_fingerprint(&path).unwrap(),
            u64::from_be_bytes(blake3::hash(b"\0\0\0\0 anything").as_bytes()[..8].try_into().unwrap())
        );
        assert!(v.default_formats().is_any());
    }
}
