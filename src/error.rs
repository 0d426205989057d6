//! Custom error types for the acquisition pipeline.
//!
//! This module defines `AcquisitionError`, the error type every exposure cycle
//! reports to its caller. Using the `thiserror` crate, it keeps the taxonomy of
//! failures explicit so the orchestrator can decide how to recover from each one.
//!
//! ## Error Hierarchy
//!
//! - **`CapabilityUnsupported`**: the request needs a feature the device does not
//!   have. Raised before any mutating hardware command is issued.
//! - **`HardwareCommandFailed`**: a configuration, start, status or download
//!   command reported an error. The hardware diagnostic is carried verbatim.
//! - **`DownloadYieldedNoData`**: the download reported success but the image
//!   fetch produced nothing. Recovery is a redownload, not a new exposure.
//! - **`FrameSizeMismatch`**: the fetched buffer disagrees with the reported
//!   image geometry. Treated like a failed download.
//! - **`FrameTooLarge`**: the reported geometry exceeds the hard frame limits.
//!   Downloading again cannot help, so nothing is retried.
//! - **`ReadinessTimedOut`** / **`ReadinessCancelled`**: the optional bound on the
//!   readiness wait fired.
//! - **`StorageWriteFailed`**: the FITS writer failed. Fatal to the process.
//! - **`MetadataFieldUnavailable`**: a single optional header field could not be
//!   read. Recovered locally by the writer.
//! - **`RetriesExhausted`**: the configured retry budget ran out. Fatal.

use crate::hardware::{Capability, HardwareError};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AppResult<T> = std::result::Result<T, AcquisitionError>;

/// How an operator (or the retry policy) should respond to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The detector still holds the frame: download it again.
    Redownload,
    /// Take the exposure again.
    Reexpose,
    /// Nothing to retry; the request or the system must change.
    None,
}

/// Failures of a single exposure cycle, plus the two fatal conditions.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// The request needs a feature the device lacks.
    #[error("Camera does not support {capability}: {hint}")]
    CapabilityUnsupported {
        /// Missing feature
        capability: Capability,
        /// How to change the request
        hint: &'static str,
    },

    /// A hardware command did not complete.
    #[error("Hardware command failed: {0}")]
    HardwareCommandFailed(#[from] HardwareError),

    /// The download completed without image data.
    #[error("Image download from sensor failed! (download completed but {0})")]
    DownloadYieldedNoData(&'static str),

    /// The buffer length disagrees with the reported geometry.
    #[error("Downloaded frame has {actual} samples, expected {width}x{height}")]
    FrameSizeMismatch {
        /// Reported width
        width: u32,
        /// Reported height
        height: u32,
        /// Samples actually fetched
        actual: usize,
    },

    /// The reported geometry is beyond the hard frame limits.
    #[error("Frame of {width}x{height} exceeds the {limit_bytes} byte limit")]
    FrameTooLarge {
        /// Reported width
        width: u32,
        /// Reported height
        height: u32,
        /// Payload limit in bytes
        limit_bytes: usize,
    },

    /// The sensor did not become ready within the bound.
    #[error("Sensor not ready for download after {0:?}")]
    ReadinessTimedOut(Duration),

    /// The readiness wait was cancelled.
    #[error("Readiness wait cancelled")]
    ReadinessCancelled,

    /// The request cannot be issued to this sensor.
    #[error("Invalid exposure request: {0}")]
    InvalidRequest(String),

    /// The frame could not be stored.
    #[error("Storage write failed: {0}")]
    StorageWriteFailed(#[from] crate::storage::StorageError),

    /// An optional header field could not be read.
    #[error("Header field '{0}' unavailable")]
    MetadataFieldUnavailable(&'static str),

    /// The retry budget ran out.
    #[error("Quitting after {attempts} failed attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, the first included
        attempts: u32,
        /// Failure of the last attempt
        last: Box<AcquisitionError>,
    },
}

impl AcquisitionError {
    /// Classifies the failure by the recovery path it calls for.
    pub fn recovery(&self) -> Recovery {
        match self {
            AcquisitionError::DownloadYieldedNoData(_)
            | AcquisitionError::FrameSizeMismatch { .. } => Recovery::Redownload,
            AcquisitionError::HardwareCommandFailed(_)
            | AcquisitionError::ReadinessTimedOut(_) => Recovery::Reexpose,
            _ => Recovery::None,
        }
    }

    /// Storage errors and an exhausted retry budget end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AcquisitionError::StorageWriteFailed(_) | AcquisitionError::RetriesExhausted { .. }
        )
    }
}

/// Runs a best-effort step and throws away its error.
///
/// Used where a failure is expected and harmless, e.g. aborting an exposure
/// when none is running or reading a gain the camera never recorded. The
/// discarded error is logged at debug level so it stays visible in traces.
pub fn attempt_and_discard<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(step = what, error = %err, "Discarding best-effort failure");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_keeps_hardware_diagnostic() {
        let err = AcquisitionError::from(HardwareError::new(
            "startExposure",
            "sensor busy (code 12)",
        ));
        assert_eq!(
            err.to_string(),
            "Hardware command failed: startExposure: sensor busy (code 12)"
        );
    }

    #[test]
    fn test_recovery_paths_are_distinct() {
        let no_data = AcquisitionError::DownloadYieldedNoData("no image was returned");
        let hw = AcquisitionError::from(HardwareError::new("startDownload", "usb reset"));
        assert_eq!(no_data.recovery(), Recovery::Redownload);
        assert_eq!(hw.recovery(), Recovery::Reexpose);
        assert_ne!(no_data.recovery(), hw.recovery());

        let unsupported = AcquisitionError::CapabilityUnsupported {
            capability: Capability::Overscan,
            hint: "use --disable-overscan",
        };
        assert_eq!(unsupported.recovery(), Recovery::None);
    }

    #[test]
    fn test_fatal_classification() {
        let exhausted = AcquisitionError::RetriesExhausted {
            attempts: 3,
            last: Box::new(AcquisitionError::DownloadYieldedNoData("empty buffer")),
        };
        assert!(exhausted.is_fatal());
        assert!(exhausted.to_string().contains("3 failed attempts"));
        assert!(!AcquisitionError::ReadinessCancelled.is_fatal());

        let too_large = AcquisitionError::FrameTooLarge {
            width: 10_000,
            height: 10_000,
            limit_bytes: 100,
        };
        assert_eq!(too_large.recovery(), Recovery::None);
        assert!(!too_large.is_fatal());
    }

    #[test]
    fn test_attempt_and_discard() {
        let ok: Result<u8, String> = Ok(7);
        assert_eq!(attempt_and_discard("ok step", ok), Some(7));

        let err: Result<u8, String> = Err("nothing to abort".into());
        assert_eq!(attempt_and_discard("abort", err), None);
    }
}
