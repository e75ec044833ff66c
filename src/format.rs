//! Magic-byte format sniffing and format allow-lists

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Formats recognised by header sniffing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Jpeg,
    Png,
    Webp,
    Heic,
    Heif,
}

const HEIC_BRANDS: [&[u8; 4]; 8] = [
    b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx", b"hevm", b"hevs",
];
const HEIF_BRANDS: [&[u8; 4]; 2] = [b"mif1", b"msf1"];

fn slice(header: &[u8], start: usize, end: usize) -> &[u8] {
    header.get(start..end).unwrap_or(&[])
}

fn is_ftyp_brand(header: &[u8], brands: &[&[u8; 4]]) -> bool {
    slice(header, 4, 8) == b"ftyp" && brands.iter().any(|b| slice(header, 8, 12) == &b[..])
}

impl Format {
    pub const ALL: [Format; 5] = [Format::Jpeg, Format::Png, Format::Webp, Format::Heic, Format::Heif];

    pub fn name(&self) -> &'static str {
        match self {
            Format::Jpeg => "jpeg",
            Format::Png => "png",
            Format::Webp => "webp",
            Format::Heic => "heic",
            Format::Heif => "heif",
        }
    }

    /// Whether this build can decode the format. HEIC/HEIF need libheif,
    /// enabled by the `heif` feature.
    pub fn has_decoder(&self) -> bool {
        match self {
            Format::Jpeg | Format::Png | Format::Webp => true,
            Format::Heic | Format::Heif => cfg!(feature = "heif"),
        }
    }

    /// Check the leading bytes of a file against this format's signature.
    pub fn matches(&self, header: &[u8]) -> bool {
        match self {
            Format::Jpeg => {
                header.starts_with(&[0xFF, 0xD8])
                    || matches!(slice(header, 6, 10), b"JFIF" | b"Exif")
            }
            Format::Png => header.starts_with(b"\x89PNG\r\n\x1a\n"),
            Format::Webp => header.starts_with(b"RIFF") && slice(header, 8, 12) == b"WEBP",
            Format::Heic => is_ftyp_brand(header, &HEIC_BRANDS),
            Format::Heif => is_ftyp_brand(header, &HEIF_BRANDS),
        }
    }
}

/// First format whose signature matches the header, if any
pub fn sniff(header: &[u8]) -> Option<Format> {
    Format::ALL.into_iter().find(|f| f.matches(header))
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Format::Jpeg),
            "png" => Ok(Format::Png),
            "webp" => Ok(Format::Webp),
            "heic" => Ok(Format::Heic),
            "heif" => Ok(Format::Heif),
            other => bail!("unknown format: {}", other),
        }
    }
}

/// Formats accepted by an upload: either any content or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowList {
    Any,
    Only(Vec<Format>),
}

impl AllowList {
    /// Every image format this build can decode
    pub fn images() -> Self {
        AllowList::Only(Format::ALL.into_iter().filter(Format::has_decoder).collect())
    }

    /// Listed formats this build cannot decode
    pub fn undecodable(&self) -> Vec<Format> {
        match self {
            AllowList::Any => Vec::new(),
            AllowList::Only(formats) => formats.iter().copied().filter(|f| !f.has_decoder()).collect(),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, AllowList::Any)
    }

    pub fn accepts(&self, header: &[u8]) -> bool {
        match self {
            AllowList::Any => true,
            AllowList::Only(formats) => formats.iter().any(|f| f.matches(header)),
        }
    }
}

impl FromStr for AllowList {
    type Err = anyhow::Error;

    /// `*` means any content, otherwise a comma separated list of format names
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(AllowList::Any);
        }
        let mut formats = Vec::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let f: Format = part.parse()?;
            if !formats.contains(&f) {
                formats.push(f);
            }
        }
        if formats.is_empty() {
            bail!("allow-list is empty (use '*' to accept any content)");
        }
        Ok(AllowList::Only(formats))
    }
}

impl TryFrom<String> for AllowList {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowList::Any => f.write_str("*"),
            AllowList::Only(formats) => {
                let names: Vec<&str> = formats.iter().map(|x| x.name()).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut h = vec![0, 0, 0, 0x18];
        h.extend_from_slice(b"ftyp");
        h.extend_from_slice(brand);
        h
    }

    #[test]
    fn test_signatures() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F', 0, 1]), Some(Format::Jpeg));
        assert_eq!(sniff(b"\0\0\0\0\0\0Exif\0\0"), Some(Format::Jpeg));
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"), Some(Format::Png));
        assert_eq!(sniff(b"RIFF\x24\0\0\0WEBPVP8 "), Some(Format::Webp));
        assert_eq!(sniff(b"RIFF\x24\0\0\0WAVEfmt "), None);
        assert_eq!(sniff(&ftyp(b"heic")), Some(Format::Heic));
        assert_eq!(sniff(&ftyp(b"hevs")), Some(Format::Heic));
        assert_eq!(sniff(&ftyp(b"mif1")), Some(Format::Heif));
        assert_eq!(sniff(&ftyp(b"avif")), None);
        assert_eq!(sniff(&[0u8; 12]), None);
    }

    #[test]
    fn test_short_headers_do_not_panic() {
        assert_eq!(sniff(b""), None);
        assert_eq!(sniff(b"\xFF"), None);
        assert_eq!(sniff(b"\xFF\xD8"), Some(Format::Jpeg));
        assert_eq!(sniff(b"RIFF"), None);
    }

    #[test]
    fn test_allow_list() {
        let only: AllowList = "png, jpeg".parse().unwrap();
        assert!(only.accepts(b"\x89PNG\r\n\x1a\n\0\0\0\0"));
        assert!(!only.accepts(&[0u8; 12]));
        assert!(!only.accepts(b"RIFF\0\0\0\0WEBP\0\0\0\0"));

        let any: AllowList = "*".parse().unwrap();
        assert!(any.is_any());
        assert!(any.accepts(&[0u8; 12]));

        assert!("".parse::<AllowList>().is_err());
        assert!("png,gif".parse::<AllowList>().is_err());
        assert!(AllowList::Any.undecodable().is_empty());
    }

    #[test]
    fn test_image_defaults_follow_decoders() {
        if cfg!(feature = "heif") {
            assert_eq!(AllowList::images().to_string(), "jpeg,png,webp,heic,heif");
            assert!(AllowList::images().accepts(&ftyp(b"heic")));
        } else {
            assert_eq!(AllowList::images().to_string(), "jpeg,png,webp");
            assert!(!AllowList::images().accepts(&ftyp(b"heic")));
            assert!(!AllowList::images().accepts(&ftyp(b"mif1")));
            let listed: AllowList = "png,heic".parse().unwrap();
            assert_eq!(listed.undecodable(), vec![Format::Heic]);
        }
        assert!(AllowList::images().undecodable().is_empty());
    }
}
