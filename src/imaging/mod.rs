//! Image decoding, encoding and container sniffing.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Detect** | signature table in [`detect`] |
//! | **Decode HEIF** | [`HeifDecoder`] → libheif (feature `heif`) |
//! | **Decode raster** | `image::ImageReader` |
//! | **Encode** | `image` (JPEG, PNG) + `webp` (lossy WEBP) |
//!
//! The module is split into:
//! - **Detect**: Pure signature matching (unit testable, never fails)
//! - **Parameters**: Quality and the fixed PNG quality
//! - **Backend**: [`HeifDecoder`] trait + [`NativeHeifDecoder`]
//! - **Encode**: Raster decode and per-format encoders

pub mod backend;
pub mod detect;
pub mod encode;
mod params;

pub use backend::{CodecError, HeifDecoder, NativeHeifDecoder};
pub use detect::{Detection, SIGNATURE_LEN, detect};
pub use encode::{decode_raster, encode};
pub use params::{InvalidQuality, PNG_QUALITY, Quality};
