//! Flash-streaming ICER still-image compressor.
//!
//! Compresses a single camera frame (YUV422 or baseline JPEG) into an
//! ICER-compatible bitstream on devices where the uncompressed frame does
//! not fit in RAM. Every intermediate representation lives in external
//! block storage; peak working-set memory is bounded by a few scanline- and
//! tile-sized buffers.
//!
//! # Pipeline
//!
//! ```text
//! camera buffer ─A─> Y/U/V plane files ─B─> wavelet domain (in place)
//!              ─C/D─> mean-normalized sign-magnitude planes
//!              ─E/F─> priority-ordered segment records ──> ICER file
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use icerstream::storage::HostFileSystem;
//! use icerstream::encoder::{EncodeParams, PlaneFiles, compress_yuv_files};
//! use icerstream::planes::{separate_yuv422, Yuv422Order};
//!
//! fn main() -> icerstream::Result<()> {
//!   let fs = HostFileSystem::new("/tmp/frame")?;
//!   let (w, h) = (320usize, 240usize);
//!   let frame = vec![0u8; w * h * 2];
//!   separate_yuv422(&fs, &frame, w, h, Yuv422Order::Yuyv, "y.raw", "u.raw", "v.raw")?;
//!   let params = EncodeParams::new(w, h);
//!   let planes = PlaneFiles { y: "y.raw", u: "u.raw", v: "v.raw" };
//!   let result = compress_yuv_files(&fs, &planes, "frame.icer", &params)?;
//!   println!("{} bytes", result.compressed_size);
//!   Ok(())
//! }
//! ```

use thiserror::Error;

pub mod encoder;
pub mod icer;
pub mod pumps;
pub mod storage;

pub use encoder::planes;
pub use encoder::{CompressedFrame, EncodeParams, PlaneFiles, compress_yuv_files};

/// Errors surfaced by the pipeline. Each variant is a distinct kind the
/// caller can discriminate; the pipeline never retries and never partially
/// succeeds.
#[derive(Error, Debug)]
pub enum IcerError {
  #[error("invalid input: {}", _0)]
  InvalidInput(&'static str),

  #[error("I/O error: {}", _0)]
  Io(#[from] std::io::Error),

  /// A scratch allocation failed.
  #[error("out of memory")]
  OutOfMemory,

  /// An arithmetic precondition on an index, offset or size failed.
  #[error("arithmetic overflow")]
  Overflow,

  #[error("JPEG decode failed: {}", _0)]
  DecodeFailed(String),

  /// The requested decomposition would reduce an LL subband below 3x3.
  #[error("image dimensions too small for {0} decomposition stages")]
  DimensionsTooSmall(u8),

  #[error("LL subband mean exceeds i16 range")]
  LlMeanOverflow,

  #[error("packet list exceeds library limit")]
  PacketLimitExceeded,

  /// The caller-supplied datastream buffer is smaller than the byte quota
  /// and compression ran past it.
  #[error("compressed data exceeds datastream buffer capacity")]
  QuotaExceeded,

  /// A numeric kernel returned a non-OK status.
  #[error("kernel error: {}", _0)]
  Kernel(#[from] icer::IcerStatus),

  /// Post-stage verification found an output size mismatch.
  #[error("output verification failed")]
  Corrupted,
}

pub type Result<T> = std::result::Result<T, IcerError>;

/// Install the env_logger backend once for unit tests.
#[cfg(test)]
pub(crate) fn init_test_logger() {
  use std::sync::Once;
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let _ = env_logger::builder().is_test(true).try_init();
  });
}
