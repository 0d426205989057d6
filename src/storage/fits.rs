//! FITS frame writer and reader.
//!
//! One 16-bit unsigned 2-D image per file, in the primary HDU, with these
//! header keys:
//!
//! | Key | Type | Source |
//! |-----|------|--------|
//! | `DATE` | string | file creation time (UTC) |
//! | `DATE-OBS` | string | exposure start (UTC), when known |
//! | `EXPTIME` | float | camera-reported duration, 6 decimals |
//! | `EGAIN` | float | camera-reported gain, 6 decimals; omitted when unavailable |
//! | `XBINNING` / `YBINNING` | integer | camera-reported bin factors |
//! | `IMAGETYP` | string | `Light Frame` or `Dark Frame` |
//! | `CCD-TEMP` / `HSINKT` | float | cooler snapshot; omitted without one |
//! | `SERIALNO` | string | camera serial number |
//! | `FOCUSPOS` | integer | focus position, -1 when unknown |
//!
//! Every standard card carries a comment with its unit or sentinel. The
//! primary HDU has no `EXTNAME`. Caller-supplied keys follow as strings and
//! replace any card of the same name, standard ones included; when a key is
//! given twice the last value wins.

use super::{FrameWriter, HeaderFields, StorageError};
use crate::acquisition::ExposureResult;
use std::path::Path;

/// Header label for the shutter state. Flats and biases are light frames here.
pub fn image_type_label(is_light_frame: bool) -> &'static str {
    if is_light_frame {
        "Light Frame"
    } else {
        "Dark Frame"
    }
}

#[cfg(feature = "storage_fits")]
mod fits_enabled {
    use super::*;
    use crate::error::{attempt_and_discard, AcquisitionError};
    use chrono::Utc;
    use fitsio::hdu::{FitsHdu, HduInfo};
    use fitsio::images::{ImageDescription, ImageType};
    use fitsio::headers::HeaderValue;
    use fitsio::FitsFile;
    use std::ffi::CString;

    /// Rounds to the 6 decimal places the header float fields carry.
    fn six_decimals(value: f64) -> f64 {
        (value * 1e6).round() / 1e6
    }

    fn fits_error(path: &Path) -> impl Fn(fitsio::errors::Error) -> StorageError + '_ {
        move |err| StorageError::Fits {
            path: path.to_path_buf(),
            diagnostic: err.to_string(),
        }
    }

    /// Removes `key` from the current HDU. A missing key is not an error.
    #[allow(unsafe_code)]
    fn delete_key(fptr: &mut FitsFile, key: &str, path: &Path) -> Result<(), StorageError> {
        let fits_failure = |diagnostic: String| StorageError::Fits {
            path: path.to_path_buf(),
            diagnostic,
        };
        let name = CString::new(key).map_err(|e| fits_failure(e.to_string()))?;
        let mut status = 0;
        // SAFETY: `fptr` is an open file for the duration of the call and
        // `name` is a NUL-terminated string that outlives it.
        unsafe {
            fitsio::sys::ffdkey(fptr.as_raw(), name.as_ptr(), &mut status);
        }
        match status {
            0 => Ok(()),
            s if s == fitsio::sys::KEY_NO_EXIST as i32 => Ok(()),
            s => Err(fits_failure(format!(
                "deleting header key {key} failed with CFITSIO status {s}"
            ))),
        }
    }

    /// Writes frames as FITS files.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct FitsWriter;

    impl FitsWriter {
        /// A writer with no state.
        pub fn new() -> Self {
            Self
        }
    }

    impl FrameWriter for FitsWriter {
        fn write(
            &self,
            frame: &ExposureResult,
            header: &HeaderFields,
            path: &Path,
        ) -> Result<(), StorageError> {
            let err = fits_error(path);
            let meta = &frame.metadata;

            if path.exists() {
                std::fs::remove_file(path).map_err(|e| StorageError::io(path, e))?;
            }

            let dimensions = [meta.height as usize, meta.width as usize];
            let description = ImageDescription {
                data_type: ImageType::UnsignedShort,
                dimensions: &dimensions,
            };
            let mut fptr = FitsFile::create(path)
                .with_custom_primary(&description)
                .open()
                .map_err(&err)?;
            let hdu = fptr.primary_hdu().map_err(&err)?;

            // The primary created from a description carries EXTNAME = '_PRIMARY'.
            delete_key(&mut fptr, "EXTNAME", path)?;

            let now = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
            hdu.write_key(
                &mut fptr,
                "DATE",
                (now, "file creation date (YYYY-MM-DDThh:mm:ss UT)"),
            )
            .map_err(&err)?;
            if let Some(started) = frame.started_at {
                let date_obs = started.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
                hdu.write_key(&mut fptr, "DATE-OBS", (date_obs, "Exposure start time (UTC)"))
                    .map_err(&err)?;
            }
            hdu.write_key(
                &mut fptr,
                "EXPTIME",
                (
                    six_decimals(meta.exposure_duration),
                    "Total exposure time in seconds",
                ),
            )
            .map_err(&err)?;

            let gain = meta
                .e_gain
                .ok_or(AcquisitionError::MetadataFieldUnavailable("EGAIN"));
            if let Some(gain) = attempt_and_discard("EGAIN header", gain) {
                hdu.write_key(
                    &mut fptr,
                    "EGAIN",
                    (six_decimals(gain), "Electronic gain in e-/ADU"),
                )
                .map_err(&err)?;
            }

            hdu.write_key(
                &mut fptr,
                "XBINNING",
                (i64::from(meta.bin_x), "Binning factor in width"),
            )
            .map_err(&err)?;
            hdu.write_key(
                &mut fptr,
                "YBINNING",
                (i64::from(meta.bin_y), "Binning factor in height"),
            )
            .map_err(&err)?;
            hdu.write_key(
                &mut fptr,
                "IMAGETYP",
                (image_type_label(frame.is_light_frame), "Type of image"),
            )
            .map_err(&err)?;

            if let Some(cooler) = &frame.cooler {
                hdu.write_key(
                    &mut fptr,
                    "CCD-TEMP",
                    (
                        cooler.sensor_temp,
                        "Sensor temperature at end of exposure in degrees C",
                    ),
                )
                .map_err(&err)?;
                hdu.write_key(
                    &mut fptr,
                    "HSINKT",
                    (
                        cooler.heatsink_temp,
                        "Heatsink temperature at end of exposure in degrees C",
                    ),
                )
                .map_err(&err)?;
            }

            hdu.write_key(
                &mut fptr,
                "SERIALNO",
                (header.serial.as_str(), "Camera serial number"),
            )
            .map_err(&err)?;
            hdu.write_key(
                &mut fptr,
                "FOCUSPOS",
                (
                    header.focus_position,
                    "Lens focus position (-1 means position not available)",
                ),
            )
            .map_err(&err)?;

            // Caller keys replace any card of the same name, the last value wins.
            for (key, value) in &header.extra {
                delete_key(&mut fptr, key, path)?;
                hdu.write_key(&mut fptr, key, value.as_str()).map_err(&err)?;
            }

            hdu.write_image(&mut fptr, &frame.pixels[..]).map_err(&err)?;
            tracing::info!(path = %path.display(), "Saved frame");
            Ok(())
        }
    }

    /// Read access to a frame written by [`FitsWriter`].
    pub struct FitsReader {
        fptr: FitsFile,
        hdu: FitsHdu,
        path: std::path::PathBuf,
    }

    impl FitsReader {
        /// Opens the primary HDU of `path`.
        pub fn open(path: &Path) -> Result<Self, StorageError> {
            let err = fits_error(path);
            let mut fptr = FitsFile::open(path).map_err(&err)?;
            let hdu = fptr.primary_hdu().map_err(&err)?;
            Ok(Self {
                fptr,
                hdu,
                path: path.to_path_buf(),
            })
        }

        /// Image (width, height).
        pub fn dimensions(&self) -> Option<(usize, usize)> {
            match &self.hdu.info {
                HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => Some((shape[1], shape[0])),
                _ => None,
            }
        }

        /// All samples, row-major.
        pub fn pixels(&mut self) -> Result<Vec<u16>, StorageError> {
            let err = fits_error(&self.path);
            self.hdu.read_image(&mut self.fptr).map_err(err)
        }

        /// A floating-point header value.
        pub fn key_f64(&mut self, key: &str) -> Result<f64, StorageError> {
            let err = fits_error(&self.path);
            self.hdu.read_key(&mut self.fptr, key).map_err(err)
        }

        /// An integer header value.
        pub fn key_i64(&mut self, key: &str) -> Result<i64, StorageError> {
            let err = fits_error(&self.path);
            self.hdu.read_key(&mut self.fptr, key).map_err(err)
        }

        /// A header value as text.
        pub fn key_string(&mut self, key: &str) -> Result<String, StorageError> {
            let err = fits_error(&self.path);
            self.hdu.read_key(&mut self.fptr, key).map_err(err)
        }

        /// Comment of a header card, `None` when the card has none.
        pub fn key_comment(&mut self, key: &str) -> Result<Option<String>, StorageError> {
            let err = fits_error(&self.path);
            let card: HeaderValue<String> =
                self.hdu.read_key(&mut self.fptr, key).map_err(err)?;
            Ok(card.comment)
        }
    }
}

#[cfg(feature = "storage_fits")]
pub use fits_enabled::{FitsReader, FitsWriter};

#[cfg(not(feature = "storage_fits"))]
mod fits_disabled {
    use super::*;

    /// Refuses every write; built without `storage_fits`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct FitsWriter;

    impl FitsWriter {
        /// A writer with no state.
        pub fn new() -> Self {
            Self
        }
    }

    impl FrameWriter for FitsWriter {
        fn write(
            &self,
            _frame: &ExposureResult,
            _header: &HeaderFields,
            _path: &Path,
        ) -> Result<(), StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }
    }

    /// Refuses to open anything; built without `storage_fits`.
    pub struct FitsReader;

    impl FitsReader {
        /// Always `FeatureNotEnabled`.
        pub fn open(_path: &Path) -> Result<Self, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }

        /// Always `None`.
        pub fn dimensions(&self) -> Option<(usize, usize)> {
            None
        }

        /// Always `FeatureNotEnabled`.
        pub fn pixels(&mut self) -> Result<Vec<u16>, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }

        /// Always `FeatureNotEnabled`.
        pub fn key_f64(&mut self, _key: &str) -> Result<f64, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }

        /// Always `FeatureNotEnabled`.
        pub fn key_i64(&mut self, _key: &str) -> Result<i64, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }

        /// Always `FeatureNotEnabled`.
        pub fn key_string(&mut self, _key: &str) -> Result<String, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }

        /// Always `FeatureNotEnabled`.
        pub fn key_comment(&mut self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::FeatureNotEnabled("storage_fits".to_string()))
        }
    }
}

#[cfg(not(feature = "storage_fits"))]
pub use fits_disabled::{FitsReader, FitsWriter};
