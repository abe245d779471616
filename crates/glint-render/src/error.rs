//! Error types for bloom frame processing and scratch allocation.

use crate::backend::ImageId;
use crate::mip_plan::Extent;

/// Errors a [`RenderBackend`](crate::RenderBackend) can report when asked for a scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The scratch pool would exceed its memory budget.
    #[error("out of scratch memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// The requested extent is larger than the device supports.
    #[error("scratch extent {width}x{height} exceeds device limit {limit}")]
    ExtentTooLarge { width: u32, height: u32, limit: u32 },

    /// Width or height is zero.
    #[error("scratch dimensions must be non-zero, got {width}x{height}")]
    ZeroExtent { width: u32, height: u32 },

    /// No host image is registered under this id.
    #[error("unknown image {0:?}")]
    UnknownImage(ImageId),

    /// Uploaded pixel data does not match the image size.
    #[error("pixel data is {actual} bytes, expected {expected}")]
    DataSizeMismatch { expected: usize, actual: usize },

    /// The image format does not support the requested transfer.
    #[error("unsupported image format {0:?}")]
    UnsupportedFormat(wgpu::TextureFormat),

    /// Mapping a readback buffer failed.
    #[error("readback failed: {0}")]
    Readback(String),
}

/// Errors surfaced by [`BloomPyramid::process`](crate::BloomPyramid::process).
///
/// Every variant is reported only after all scratch buffers borrowed during
/// the frame have been returned to the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BloomError {
    /// The source image has a zero-sized axis. Raised before any allocation.
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidFrameDimensions { width: u32, height: u32 },

    /// The backend could not provide a scratch buffer for a pyramid level.
    #[error("failed to allocate bloom level {level} ({}x{}): {source}", extent.width, extent.height)]
    AllocationFailure {
        level: u32,
        extent: Extent,
        #[source]
        source: BackendError,
    },
}
