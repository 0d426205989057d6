//! Frame storage.
//!
//! Writers persist one [`ExposureResult`] per file. The FITS backend sits
//! behind the `storage_fits` feature; without it the writer reports
//! `FeatureNotEnabled` instead of silently dropping frames.

pub mod fits;

use crate::acquisition::ExposureResult;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use fits::{FitsReader, FitsWriter};

/// Storage failures. All of them end the acquisition run.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// CFITSIO failure.
    #[error("FITS error on {path}: {diagnostic}")]
    Fits {
        /// File being written or read
        path: PathBuf,
        /// CFITSIO's description of the failure
        diagnostic: String,
    },

    /// The crate was built without the named feature.
    #[error("Feature '{0}' is not enabled")]
    FeatureNotEnabled(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Header values that come from the caller rather than the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFields {
    /// Camera serial number
    pub serial: String,
    /// Lens focus position; -1 when unknown
    pub focus_position: i64,
    /// Free-form string cards; each replaces any card of the same name
    pub extra: Vec<(String, String)>,
}

impl HeaderFields {
    /// Fields for `serial` with no focus position and no extra keys.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            focus_position: -1,
            extra: Vec::new(),
        }
    }
}

/// Persists one downloaded frame.
pub trait FrameWriter {
    /// Writes `frame` to `path`, replacing any file already there.
    fn write(
        &self,
        frame: &ExposureResult,
        header: &HeaderFields,
        path: &Path,
    ) -> Result<(), StorageError>;
}
