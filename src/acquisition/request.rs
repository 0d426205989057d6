//! Exposure configurator.
//!
//! Turns operator intent into the immutable [`ExposureRequest`] for one
//! exposure cycle, using the sensor geometry queried at session start.

use crate::error::AcquisitionError;
use crate::hardware::{Capability, ExposureOptions, SensorGeometry, Subframe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Calibration or science frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Science frame, shutter open.
    Light,
    /// Shutter closed for the full duration.
    Dark,
    /// Shortest exposure the sensor supports.
    Bias,
    /// Evenly illuminated calibration frame.
    Flat,
}

impl FrameKind {
    /// Shutter state for the hardware: only darks keep the shutter closed.
    pub fn is_light_frame(self) -> bool {
        !matches!(self, FrameKind::Dark)
    }

    /// Lowercase label used in generated file names.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Light => "light",
            FrameKind::Dark => "dark",
            FrameKind::Bias => "bias",
            FrameKind::Flat => "flat",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameKind {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(FrameKind::Light),
            "dark" => Ok(FrameKind::Dark),
            "bias" => Ok(FrameKind::Bias),
            "flat" => Ok(FrameKind::Flat),
            other => Err(AcquisitionError::InvalidRequest(format!(
                "unknown frame kind '{other}'"
            ))),
        }
    }
}

/// Binning factors; both are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinFactors {
    x: u32,
    y: u32,
}

impl BinFactors {
    /// No binning.
    pub const UNBINNED: BinFactors = BinFactors { x: 1, y: 1 };

    /// Validates and builds binning factors.
    pub fn new(x: u32, y: u32) -> Result<Self, AcquisitionError> {
        if x == 0 || y == 0 {
            return Err(AcquisitionError::InvalidRequest(format!(
                "binning factors must be positive, got {x}x{y}"
            )));
        }
        Ok(Self { x, y })
    }

    /// Horizontal factor.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Vertical factor.
    pub fn y(&self) -> u32 {
        self.y
    }

    /// True when either axis is binned.
    pub fn is_binned(&self) -> bool {
        self.x != 1 || self.y != 1
    }
}

impl Default for BinFactors {
    fn default() -> Self {
        Self::UNBINNED
    }
}

/// Vendor readout mode index (0 = normal readout).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutMode(pub u32);

/// What the operator asked for, before hardware limits are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureIntent {
    /// Requested duration in seconds
    pub duration: f64,
    /// Frame kind
    pub frame_kind: FrameKind,
    /// On-chip binning
    pub bin: BinFactors,
    /// Read out the overscan region
    pub overscan: bool,
    /// Vendor readout mode
    pub readout_mode: ReadoutMode,
}

impl ExposureIntent {
    /// A light frame of `duration` seconds, unbinned, without overscan.
    pub fn light(duration: f64) -> Self {
        Self {
            duration,
            frame_kind: FrameKind::Light,
            bin: BinFactors::UNBINNED,
            overscan: false,
            readout_mode: ReadoutMode::default(),
        }
    }

    /// Same intent with another frame kind.
    #[must_use]
    pub fn with_kind(mut self, frame_kind: FrameKind) -> Self {
        self.frame_kind = frame_kind;
        self
    }

    /// Same intent with binning.
    #[must_use]
    pub fn with_bin(mut self, bin: BinFactors) -> Self {
        self.bin = bin;
        self
    }

    /// Same intent with overscan toggled.
    #[must_use]
    pub fn with_overscan(mut self, overscan: bool) -> Self {
        self.overscan = overscan;
        self
    }
}

/// Immutable description of one exposure, ready for the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    duration: f64,
    frame_kind: FrameKind,
    bin: BinFactors,
    overscan: bool,
    readout_mode: ReadoutMode,
    subframe: Subframe,
}

impl ExposureRequest {
    /// Configured duration in seconds, after clamping.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Frame kind.
    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }

    /// Binning factors.
    pub fn bin(&self) -> BinFactors {
        self.bin
    }

    /// Whether overscan is read out.
    pub fn overscan(&self) -> bool {
        self.overscan
    }

    /// Vendor readout mode.
    pub fn readout_mode(&self) -> ReadoutMode {
        self.readout_mode
    }

    /// Readout region derived from the sensor geometry.
    pub fn subframe(&self) -> &Subframe {
        &self.subframe
    }

    /// Features that must be confirmed before this request can be issued.
    pub fn required_capabilities(&self) -> Vec<Capability> {
        let mut required = Vec::new();
        if self.bin.is_binned() {
            required.push(Capability::OnChipBinning);
        }
        if self.overscan {
            required.push(Capability::Overscan);
        }
        required
    }

    /// Options for the start-exposure command.
    pub fn exposure_options(&self) -> ExposureOptions {
        ExposureOptions {
            duration: self.duration,
            bin_x: self.bin.x,
            bin_y: self.bin.y,
            readout_mode: self.readout_mode.0,
            is_light_frame: self.frame_kind.is_light_frame(),
            use_rbi_preflash: false,
            use_ext_trigger: false,
        }
    }
}

/// Full-sensor readout region after binning. Integer division truncates,
/// matching how the hardware addresses binned pixels.
pub fn derive_subframe(geometry: &SensorGeometry, bin: BinFactors) -> Subframe {
    Subframe {
        top: 0,
        left: 0,
        width: geometry.pixels_x / bin.x,
        height: geometry.pixels_y / bin.y,
        bin_x: bin.x,
        bin_y: bin.y,
    }
}

/// Builds the request for one exposure cycle.
///
/// The duration is silently clamped to the sensor minimum. Bias frames always
/// use the sensor minimum, whatever duration was asked for.
pub fn build_request(geometry: &SensorGeometry, intent: &ExposureIntent) -> ExposureRequest {
    let requested = match intent.frame_kind {
        FrameKind::Bias => 0.0,
        _ => intent.duration,
    };
    let duration = requested.max(geometry.exposure_duration_min);
    if duration != intent.duration {
        tracing::debug!(
            requested = intent.duration,
            configured = duration,
            kind = %intent.frame_kind,
            "Exposure duration adjusted to sensor limits"
        );
    }

    ExposureRequest {
        duration,
        frame_kind: intent.frame_kind,
        bin: intent.bin,
        overscan: intent.overscan,
        readout_mode: intent.readout_mode,
        subframe: derive_subframe(geometry, intent.bin),
    }
}
