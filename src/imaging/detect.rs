//! Container signature sniffing.
//!
//! Only the first [`SIGNATURE_LEN`] bytes are inspected. HEIF-family files are
//! ISO-BMFF: a 4-byte box size, the `ftyp` tag, then the major brand. Known
//! rasters are recognised by their magic numbers so a misnamed JPEG can go
//! straight to the generic decode path.
//!
//! | Signature | Result |
//! |---|---|
//! | `????ftyp` + `heic heix hevc hevx heim heis hevm hevs` | expected, `image/heic` |
//! | `????ftyp` + `mif1 msf1` | expected, `image/heif` |
//! | `????ftyp` + `avif avis` | `image/avif` |
//! | `FF D8 FF` | `image/jpeg` |
//! | `89 50 4E 47 0D 0A 1A 0A` | `image/png` |
//! | `RIFF????WEBP` | `image/webp` |
//! | `GIF87a` / `GIF89a` | `image/gif` |
//! | `II*\0` / `MM\0*` | `image/tiff` |

/// Bytes the detector needs to classify a file.
pub const SIGNATURE_LEN: usize = 12;

const HEIC_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"hevm", b"hevs",
];
const HEIF_BRANDS: &[&[u8; 4]] = &[b"mif1", b"msf1"];
const AVIF_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis"];

/// Outcome of sniffing a file's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// The bytes look like HEIC/HEIF.
    pub is_expected_container: bool,
    /// Best guess at the real type, `None` when nothing matched.
    pub actual_mime: Option<&'static str>,
}

impl Detection {
    const UNKNOWN: Detection = Detection {
        is_expected_container: false,
        actual_mime: None,
    };

    fn heif(mime: &'static str) -> Self {
        Self {
            is_expected_container: true,
            actual_mime: Some(mime),
        }
    }

    fn raster(mime: &'static str) -> Self {
        Self {
            is_expected_container: false,
            actual_mime: Some(mime),
        }
    }

    /// A recognised non-HEIF format the generic decoder can take directly.
    pub fn is_known_raster(&self) -> bool {
        !self.is_expected_container && self.actual_mime.is_some()
    }
}

/// Classify a file from its first bytes. Never fails: short or unrecognised
/// input yields an "unknown" detection.
pub fn detect(prefix: &[u8]) -> Detection {
    let head = &prefix[..prefix.len().min(SIGNATURE_LEN)];

    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        let brand = &head[8..12];
        if HEIC_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Detection::heif("image/heic");
        }
        if HEIF_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Detection::heif("image/heif");
        }
        if AVIF_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Detection::raster("image/avif");
        }
        return Detection::UNKNOWN;
    }

    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Detection::raster("image/jpeg");
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Detection::raster("image/png");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP" {
        return Detection::raster("image/webp");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Detection::raster("image/gif");
    }
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        return Detection::raster("image/tiff");
    }

    Detection::UNKNOWN
}
