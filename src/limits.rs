//! Hard limits on downloaded frames, to refuse absurd buffers before they are
//! copied or written.

use crate::error::AcquisitionError;
use crate::hardware::ImageMetadata;

/// Maximum allowed frame payload in bytes (default: 100MB).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;
/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;
/// Bytes per sample of a 16-bit frame.
pub const BYTES_PER_PIXEL: usize = 2;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Samples in the frame
    pub pixels: usize,
    /// Payload size in bytes
    pub bytes: usize,
}

/// Checks a fetched buffer against the geometry the camera reported for it.
///
/// # Errors
///
/// - `DownloadYieldedNoData` for an empty buffer
/// - `FrameTooLarge` when the reported dimensions exceed the hard limits
/// - `FrameSizeMismatch` when the sample count disagrees with width x height
pub fn validate_frame_size(
    metadata: &ImageMetadata,
    samples: usize,
) -> Result<FrameSize, AcquisitionError> {
    if samples == 0 {
        return Err(AcquisitionError::DownloadYieldedNoData("the image buffer is empty"));
    }

    let mismatch = || AcquisitionError::FrameSizeMismatch {
        width: metadata.width,
        height: metadata.height,
        actual: samples,
    };

    let too_large = || AcquisitionError::FrameTooLarge {
        width: metadata.width,
        height: metadata.height,
        limit_bytes: MAX_FRAME_BYTES,
    };

    if metadata.width > MAX_FRAME_DIMENSION || metadata.height > MAX_FRAME_DIMENSION {
        return Err(too_large());
    }

    let pixels = (metadata.width as usize)
        .checked_mul(metadata.height as usize)
        .ok_or_else(too_large)?;
    let bytes = pixels.checked_mul(BYTES_PER_PIXEL).ok_or_else(too_large)?;

    if bytes > MAX_FRAME_BYTES {
        return Err(too_large());
    }
    if pixels != samples {
        return Err(mismatch());
    }

    Ok(FrameSize { pixels, bytes })
}
