//! Fingerprinting and hashing utilities

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Read;
use std::path::Path;

/// Two fingerprints closer than this are treated as the same content.
pub const DUPLICATE_DISTANCE: u32 = 10;

/// Width of the dHash grid (one extra column for the horizontal gradient)
const DHASH_WIDTH: u32 = 9;
const DHASH_HEIGHT: u32 = 8;

/// 64-bit difference hash of an image.
///
/// The image is converted to grayscale, downsampled to 9x8 and each pixel is
/// compared with its right neighbour. Bits are packed row-major with the first
/// comparison in the most significant bit, so the hex form matches the common
/// `dhash` string representation.
pub fn dhash(img: &DynamicImage) -> u64 {
    let gray = img.to_luma8();
    let small = image::imageops::resize(&gray, DHASH_WIDTH, DHASH_HEIGHT, FilterType::Lanczos3);
    let mut hash = 0u64;
    for y in 0..DHASH_HEIGHT {
        for x in 0..DHASH_WIDTH - 1 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            hash = (hash << 1) | u64::from(right > left);
        }
    }
    hash
}

/// Leading 8 bytes of a blake3 digest, big-endian
fn digest_head(digest: &blake3::Hash) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(head)
}

/// 64-bit content fingerprint of a file, streamed through blake3
pub fn file_fingerprint(path: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(digest_head(&hasher.finalize()))
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

pub fn to_hex(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Parse a hash token from a canonical file name. Shorter tokens are
/// left-padded, anything that is not hex (or exceeds 64 bits) is rejected.
pub fn from_hex(token: &str) -> Option<u64> {
    if token.is_empty() || token.len() > 16 {
        return None;
    }
    u64::from_str_radix(token, 16).ok()
}
