//! Camera hardware command surface
//!
//! Hardware-agnostic interface to a cooled camera, its imaging sensor and its
//! thermoelectric cooler. Vendor SDKs complete most commands through a
//! wait-then-release promise; implementations of [`CameraDevice`] hide that
//! handshake and return a single typed result per command.
//!
//! A completion that reports anything other than "complete" must become a
//! [`HardwareError`] carrying the SDK's diagnostic text unchanged.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use mock::{MockCamera, MockCameraBuilder, MockCommand};

/// Result of a single hardware command.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// A hardware command that did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command}: {diagnostic}")]
pub struct HardwareError {
    /// SDK command that failed (e.g. `startExposure`)
    pub command: &'static str,
    /// Diagnostic text reported by the SDK, verbatim
    pub diagnostic: String,
}

impl HardwareError {
    /// Builds an error for `command` with the SDK's diagnostic text.
    pub fn new(command: &'static str, diagnostic: impl Into<String>) -> Self {
        Self {
            command,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Device features that must be confirmed before they are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Binning performed by the sensor readout electronics.
    OnChipBinning,
    /// Readout of the non-light-sensitive overscan region.
    Overscan,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::OnChipBinning => write!(f, "on-chip binning"),
            Capability::Overscan => write!(f, "overscan"),
        }
    }
}

/// Sensor settings that are switched on once their capability is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorSetting {
    /// Bin on the sensor instead of in software.
    UseOnChipBinning,
    /// Include the overscan columns in the readout.
    UseOverscan,
}

/// Static sensor description, queried once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorGeometry {
    /// Sensor width in pixels
    pub pixels_x: u32,
    /// Sensor height in pixels
    pub pixels_y: u32,
    /// Pixel pitch along x (microns)
    pub pixel_size_x: f32,
    /// Pixel pitch along y (microns)
    pub pixel_size_y: f32,
    /// Lowest cooler setpoint the sensor accepts (degrees C)
    pub cooler_setpoint_min: f32,
    /// Highest cooler setpoint the sensor accepts (degrees C)
    pub cooler_setpoint_max: f32,
    /// Largest supported binning factor along x
    pub bin_x_max: u32,
    /// Largest supported binning factor along y
    pub bin_y_max: u32,
    /// Shortest exposure the sensor can take (seconds)
    pub exposure_duration_min: f64,
    /// Exposure time resolution (seconds)
    pub exposure_precision: f64,
}

/// Rectangular readout region, in binned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subframe {
    /// First row of the region
    pub top: u32,
    /// First column of the region
    pub left: u32,
    /// Width in binned pixels
    pub width: u32,
    /// Height in binned pixels
    pub height: u32,
    /// Horizontal bin factor
    pub bin_x: u32,
    /// Vertical bin factor
    pub bin_y: u32,
}

/// Options passed to the start-exposure command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureOptions {
    /// Exposure duration in seconds
    pub duration: f64,
    /// Horizontal bin factor
    pub bin_x: u32,
    /// Vertical bin factor
    pub bin_y: u32,
    /// Vendor readout mode index
    pub readout_mode: u32,
    /// Shutter opens during the exposure
    pub is_light_frame: bool,
    /// Flood the sensor before exposing to suppress residual bulk image
    pub use_rbi_preflash: bool,
    /// Wait for the external trigger input
    pub use_ext_trigger: bool,
}

/// State of one physical sensor as reported by the camera status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    /// Nothing running.
    Idle,
    /// Integrating.
    Exposing,
    /// Transferring charge off the sensor.
    ReadingOut,
    /// A frame is held and can be downloaded.
    ReadyToDownload,
    /// A download is in progress.
    Downloading,
    /// The sensor reported a fault.
    Error,
}

/// Camera-wide status; the main and auxiliary (guider) sensors report separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Main imaging sensor
    pub main_sensor: SensorState,
    /// Auxiliary (guider) sensor
    pub ext_sensor: SensorState,
}

impl DeviceStatus {
    /// State of the sensor with the given id (0 = main, anything else = auxiliary).
    pub fn sensor_state(&self, sensor_id: u32) -> SensorState {
        if sensor_id != 0 {
            self.ext_sensor
        } else {
            self.main_sensor
        }
    }
}

/// Exposure metadata the camera attaches to a downloaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Actual exposure duration in seconds
    pub exposure_duration: f64,
    /// Horizontal bin factor used
    pub bin_x: u32,
    /// Vertical bin factor used
    pub bin_y: u32,
    /// Electronic gain in e-/ADU; not every camera records it
    pub e_gain: Option<f64>,
}

/// Image handle contents after a download.
#[derive(Debug, Clone)]
pub struct DownloadedImage {
    /// Row-major 16-bit samples
    pub buffer: Vec<u16>,
    /// Metadata reported with the image
    pub metadata: ImageMetadata,
}

/// Point-in-time read of the thermoelectric cooler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoolerSnapshot {
    /// Cooling is switched on
    pub enabled: bool,
    /// Cooler power draw in percent
    pub power: f64,
    /// Target sensor temperature in degrees C
    pub setpoint: f64,
    /// Heatsink temperature in degrees C
    pub heatsink_temp: f64,
    /// Sensor temperature in degrees C
    pub sensor_temp: f64,
}

impl fmt::Display for CoolerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cooler enabled: {}\nCooler power: {:.3}%\nSetpoint: {:.3} C\nHeatsink temperature: {:.3} C\nSensor temperature: {:.3} C",
            self.enabled, self.power, self.setpoint, self.heatsink_temp, self.sensor_temp
        )
    }
}

/// Camera command surface.
///
/// All commands are issued strictly sequentially; implementations never see
/// two commands in flight on the same device.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Human-readable camera model.
    fn model(&self) -> String;

    /// Id of the sensor this handle drives (0 = main imaging sensor).
    fn sensor_id(&self) -> u32;

    /// Camera serial number.
    async fn serial_number(&self) -> HardwareResult<String>;

    /// Static sensor description.
    async fn sensor_geometry(&self) -> HardwareResult<SensorGeometry>;

    /// Queries and returns one capability flag.
    async fn query_capability(&self, capability: Capability) -> HardwareResult<bool>;

    /// Writes a sensor setting.
    async fn set_sensor_setting(&self, setting: SensorSetting, value: u32) -> HardwareResult<()>;

    /// Applies the readout region.
    async fn set_subframe(&self, subframe: &Subframe) -> HardwareResult<()>;

    /// Starts integrating.
    async fn start_exposure(&self, options: &ExposureOptions) -> HardwareResult<()>;

    /// Aborts a running exposure. Fails when nothing is running on some devices.
    async fn abort_exposure(&self) -> HardwareResult<()>;

    /// Refreshes and returns the camera status.
    async fn query_status(&self) -> HardwareResult<DeviceStatus>;

    /// Moves the held frame from the sensor into the host buffer.
    async fn start_download(&self) -> HardwareResult<()>;

    /// Returns the downloaded image, or `None` when the download produced nothing.
    async fn fetch_image(&self) -> HardwareResult<Option<DownloadedImage>>;

    /// Reads the cooler telemetry.
    async fn cooler_snapshot(&self) -> HardwareResult<CoolerSnapshot>;

    /// Enables cooling towards `celsius`.
    async fn set_cooler_setpoint(&self, celsius: f64) -> HardwareResult<()>;

    /// Turns cooling off.
    async fn disable_cooler(&self) -> HardwareResult<()>;

    /// Re-acquires the camera, sensor and cooler handles.
    async fn reinitialize(&self) -> HardwareResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_state_selects_auxiliary_sensor() {
        let status = DeviceStatus {
            main_sensor: SensorState::Idle,
            ext_sensor: SensorState::ReadyToDownload,
        };
        assert_eq!(status.sensor_state(0), SensorState::Idle);
        assert_eq!(status.sensor_state(1), SensorState::ReadyToDownload);
    }

    #[test]
    fn hardware_error_display() {
        let err = HardwareError::new("setSubframe", "subframe out of range");
        assert_eq!(err.to_string(), "setSubframe: subframe out of range");
    }
}
