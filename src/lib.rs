//! # heic-batch
//!
//! In-process batch conversion of HEIC/HEIF photos to JPEG, PNG or WEBP.
//! Callers hand over file bytes; the pipeline converts them in bounded
//! chunks, keeps one current artifact per file, and reconverts the whole
//! batch from the original bytes whenever the format or quality changes.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► Pipeline ──► BatchScheduler ──► StallPolicy ──► Transcode
//!               │  ▲            (chunks)        (deadline)      (detect → decode → encode)
//!               │  └── progress / events ◄──────────────────────────┘
//!               ▼
//!        ArtifactRegistry (one live preview handle per item)
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Controller: item list, target, notifications, run lifecycle |
//! | [`scheduler`] | Chunked concurrent runs, aggregate progress, stall retries |
//! | [`stall`] | Deadline + near-complete threshold for one attempt |
//! | [`transcode`] | One item to one artifact, with progress reporting |
//! | [`imaging`] | Signature detection, HEIF/raster decode, JPEG/PNG/WEBP encode |
//! | [`artifacts`] | Revocable preview handles |
//! | [`naming`] | Display names and rename sanitizing |
//! | [`preferences`] | Last-used format and qualities |
//! | [`config`] | `config.toml` loading, validation and merging |
//! | [`types`] | Shared types (`OutputFormat`, `ConversionTarget`, `SourceItem`, ...) |
//! | [`output`] | User-facing messages and CLI formatting |
//!
//! # Design Decisions
//!
//! ## Chunks Instead of a Worker Pool
//!
//! A decoded 12-megapixel photo is tens of megabytes. Items are converted a
//! couple at a time (`batch.chunk_size`) and the next chunk starts only when
//! the previous one has settled, so memory stays flat however large the
//! batch. Pixel work runs on tokio's blocking pool; the async side only
//! schedules and observes.
//!
//! ## Reconvert From Originals
//!
//! Every format or quality change goes back to the source bytes. Converting
//! a JPEG into a WEBP would stack two lossy passes.
//!
//! ## Stalls Are Values
//!
//! A stalled attempt is [`stall::AttemptOutcome::Stalled`], not an error
//! string. The scheduler retries it once with a fresh attempt; the old one is
//! detached and anything it reports later is ignored.
//!
//! ## Optional libheif
//!
//! Real HEIF decoding needs the system libheif, behind the `heif` feature.
//! Without it the crate still builds and handles inputs that are standard
//! rasters under a `.heic` name.

pub mod artifacts;
pub mod config;
pub mod imaging;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod preferences;
pub mod scheduler;
pub mod stall;
pub mod transcode;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
