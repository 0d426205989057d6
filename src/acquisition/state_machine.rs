//! Exposure state machine.
//!
//! Drives one exposure cycle through the camera's asynchronous protocol:
//!
//! ```text
//! Idle -> Configuring -> Exposing -> AwaitingReady -> Downloading -> Complete
//!   \________\______________\____________\_______________\-> Failed(reason)
//! ```
//!
//! Fixed settle delays separate the hardware phases (see
//! [`SettleTiming`](crate::config::SettleTiming)). Nothing is retried here;
//! every failure ends the cycle and is handed to the caller with the hardware
//! diagnostic intact.
//!
//! The redownload variant skips configuration and exposure and reads the
//! frame the sensor still holds, with longer settle delays.

use super::capability::CapabilityGate;
use super::request::ExposureRequest;
use crate::config::SettleTiming;
use crate::error::{attempt_and_discard, AcquisitionError, AppResult};
use crate::hardware::{
    CameraDevice, CoolerSnapshot, ImageMetadata, SensorGeometry, SensorSetting, SensorState,
    Subframe,
};
use crate::limits::validate_frame_size;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Where a cycle currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposureState {
    /// No cycle running.
    Idle,
    /// Applying binning, overscan and subframe.
    Configuring,
    /// Exposure started on the sensor.
    Exposing,
    /// Polling status until the frame is held.
    AwaitingReady,
    /// Transferring the frame to the host.
    Downloading,
    /// The frame was downloaded and validated.
    Complete,
    /// The cycle ended with this error.
    Failed(String),
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureState::Idle => write!(f, "idle"),
            ExposureState::Configuring => write!(f, "configuring"),
            ExposureState::Exposing => write!(f, "exposing"),
            ExposureState::AwaitingReady => write!(f, "awaiting ready"),
            ExposureState::Downloading => write!(f, "downloading"),
            ExposureState::Complete => write!(f, "complete"),
            ExposureState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Bounds on the readiness wait.
///
/// The default waits forever, polling back to back.
#[derive(Debug, Clone)]
pub struct ReadyWait {
    /// Upper bound on the wait; `None` waits forever
    pub timeout: Option<Duration>,
    /// Pause between status queries; zero only yields to the runtime.
    pub poll_interval: Duration,
    /// Cancelling it ends the wait and keeps further cycles from starting
    pub cancel: CancellationToken,
}

impl Default for ReadyWait {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }
}

impl ReadyWait {
    /// Bounds from configuration, with a fresh cancellation token.
    pub fn from_config(config: &crate::config::ReadinessConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            cancel: CancellationToken::new(),
        }
    }
}

/// A downloaded frame plus everything known about how it was taken.
#[derive(Debug, Clone)]
pub struct ExposureResult {
    /// Row-major 16-bit samples
    pub pixels: Vec<u16>,
    /// Exposure metadata reported by the camera with the image
    pub metadata: ImageMetadata,
    /// Shutter was open during the exposure
    pub is_light_frame: bool,
    /// When the exposure was started; unknown for a redownloaded frame
    pub started_at: Option<DateTime<Utc>>,
    /// Cooler telemetry read at completion, merged in by the orchestrator
    pub cooler: Option<CoolerSnapshot>,
    /// SHA-256 of the little-endian pixel data, hex encoded
    pub checksum: String,
}

impl ExposureResult {
    /// Number of samples.
    pub fn buffer_len(&self) -> usize {
        self.pixels.len()
    }
}

fn checksum(pixels: &[u16]) -> String {
    let mut hasher = Sha256::new();
    for px in pixels {
        hasher.update(px.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

async fn settle(ms: u64) {
    if ms > 0 {
        sleep(Duration::from_millis(ms)).await;
    }
}

/// Queries status until the active sensor reports ready to download.
async fn poll_until_ready<D: CameraDevice + ?Sized>(
    device: &D,
    poll_interval: Duration,
) -> AppResult<()> {
    let sensor_id = device.sensor_id();
    loop {
        let status = device.query_status().await?;
        if status.sensor_state(sensor_id) == SensorState::ReadyToDownload {
            return Ok(());
        }
        if poll_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            sleep(poll_interval).await;
        }
    }
}

/// Checks a request built from cached geometry against what the sensor
/// reports now.
fn ensure_subframe_fits(geometry: &SensorGeometry, subframe: &Subframe) -> AppResult<()> {
    let right = u64::from(subframe.left) + u64::from(subframe.width) * u64::from(subframe.bin_x);
    let bottom = u64::from(subframe.top) + u64::from(subframe.height) * u64::from(subframe.bin_y);
    if right > u64::from(geometry.pixels_x) || bottom > u64::from(geometry.pixels_y) {
        return Err(AcquisitionError::InvalidRequest(format!(
            "subframe {}x{} at ({}, {}) binned {}x{} exceeds the {}x{} sensor",
            subframe.width,
            subframe.height,
            subframe.left,
            subframe.top,
            subframe.bin_x,
            subframe.bin_y,
            geometry.pixels_x,
            geometry.pixels_y
        )));
    }
    Ok(())
}

/// Runs exposure cycles against one device.
pub struct ExposureStateMachine<'a, D: CameraDevice + ?Sized> {
    device: &'a D,
    timing: &'a SettleTiming,
    wait: ReadyWait,
    state: ExposureState,
    started_at: Option<DateTime<Utc>>,
}

impl<'a, D: CameraDevice + ?Sized> ExposureStateMachine<'a, D> {
    /// A machine in `Idle` for `device`.
    pub fn new(device: &'a D, timing: &'a SettleTiming, wait: ReadyWait) -> Self {
        Self {
            device,
            timing,
            wait,
            state: ExposureState::Idle,
            started_at: None,
        }
    }

    /// State reached by the last cycle.
    pub fn state(&self) -> &ExposureState {
        &self.state
    }

    /// When the last exposure was started, even if its cycle then failed.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn transition(&mut self, next: ExposureState) {
        tracing::debug!(from = %self.state, to = %next, "Exposure state transition");
        self.state = next;
    }

    fn finish(&mut self, result: AppResult<ExposureResult>) -> AppResult<ExposureResult> {
        match &result {
            Ok(_) => self.transition(ExposureState::Complete),
            Err(err) => self.transition(ExposureState::Failed(err.to_string())),
        }
        result
    }

    /// Takes a fresh exposure and downloads it.
    ///
    /// # Errors
    ///
    /// - `CapabilityUnsupported` before any mutating command is sent
    /// - `HardwareCommandFailed` for any rejected command
    /// - `ReadinessTimedOut` / `ReadinessCancelled` when the wait is bounded
    /// - `DownloadYieldedNoData` / `FrameSizeMismatch` / `FrameTooLarge` for a bad download
    /// - `InvalidRequest` when the request no longer fits the reported sensor
    /// - `ReadinessCancelled` before any command once the wait is cancelled
    pub async fn expose(
        &mut self,
        gate: &mut CapabilityGate,
        request: &ExposureRequest,
    ) -> AppResult<ExposureResult> {
        self.state = ExposureState::Idle;
        self.started_at = None;
        let result = self.run_expose(gate, request).await;
        self.finish(result)
    }

    /// Downloads the frame the sensor still holds, without exposing again.
    pub async fn redownload(&mut self, request: &ExposureRequest) -> AppResult<ExposureResult> {
        self.state = ExposureState::Idle;
        let result = self.run_redownload(request).await;
        self.finish(result)
    }

    async fn run_expose(
        &mut self,
        gate: &mut CapabilityGate,
        request: &ExposureRequest,
    ) -> AppResult<ExposureResult> {
        let device = self.device;

        for capability in request.required_capabilities() {
            gate.require(device, capability).await?;
        }

        self.ensure_not_cancelled()?;
        self.transition(ExposureState::Configuring);
        attempt_and_discard("abort exposure", device.abort_exposure().await);
        let geometry = device.sensor_geometry().await?;
        ensure_subframe_fits(&geometry, request.subframe())?;
        settle(self.timing.after_geometry_ms).await;

        if request.bin().is_binned() {
            device
                .set_sensor_setting(SensorSetting::UseOnChipBinning, 1)
                .await?;
        }
        if request.overscan() {
            device.set_sensor_setting(SensorSetting::UseOverscan, 1).await?;
        }
        device.set_subframe(request.subframe()).await?;

        let options = request.exposure_options();
        let started_at = Utc::now();
        device.start_exposure(&options).await?;
        self.started_at = Some(started_at);
        self.transition(ExposureState::Exposing);
        tracing::info!(
            duration = options.duration,
            kind = %request.frame_kind(),
            bin_x = options.bin_x,
            bin_y = options.bin_y,
            "Exposure started"
        );

        self.transition(ExposureState::AwaitingReady);
        if let Err(err) = self.wait_ready().await {
            if matches!(err, AcquisitionError::ReadinessCancelled) {
                attempt_and_discard("abort exposure", device.abort_exposure().await);
            }
            return Err(err);
        }

        settle(self.timing.ready_to_download_ms).await;
        self.transition(ExposureState::Downloading);
        let mut result = self
            .download(self.timing.download_to_fetch_ms, request)
            .await?;
        result.started_at = Some(started_at);
        Ok(result)
    }

    async fn run_redownload(&mut self, request: &ExposureRequest) -> AppResult<ExposureResult> {
        let device = self.device;
        self.ensure_not_cancelled()?;
        self.transition(ExposureState::Downloading);
        tracing::info!("Downloading the frame held by the sensor");

        let geometry = device.sensor_geometry().await?;
        ensure_subframe_fits(&geometry, request.subframe())?;
        settle(self.timing.after_geometry_ms).await;
        device.set_subframe(request.subframe()).await?;
        settle(self.timing.redownload_before_download_ms).await;

        self.download(self.timing.redownload_download_to_fetch_ms, request)
            .await
    }

    fn ensure_not_cancelled(&self) -> AppResult<()> {
        if self.wait.cancel.is_cancelled() {
            return Err(AcquisitionError::ReadinessCancelled);
        }
        Ok(())
    }

    async fn wait_ready(&self) -> AppResult<()> {
        let poll = poll_until_ready(self.device, self.wait.poll_interval);
        let bounded = async {
            match self.wait.timeout {
                Some(limit) => match tokio::time::timeout(limit, poll).await {
                    Ok(result) => result,
                    Err(_) => Err(AcquisitionError::ReadinessTimedOut(limit)),
                },
                None => poll.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.wait.cancel.cancelled() => Err(AcquisitionError::ReadinessCancelled),
            result = bounded => result,
        }
    }

    async fn download(
        &self,
        fetch_delay_ms: u64,
        request: &ExposureRequest,
    ) -> AppResult<ExposureResult> {
        self.device.start_download().await?;
        settle(fetch_delay_ms).await;

        let image = self
            .device
            .fetch_image()
            .await?
            .ok_or(AcquisitionError::DownloadYieldedNoData("no image was returned"))?;
        let size = validate_frame_size(&image.metadata, image.buffer.len())?;

        let checksum = checksum(&image.buffer);
        tracing::debug!(
            width = image.metadata.width,
            height = image.metadata.height,
            bytes = size.bytes,
            sha256 = %checksum,
            "Image downloaded"
        );
        settle(self.timing.after_fetch_ms).await;

        Ok(ExposureResult {
            pixels: image.buffer,
            metadata: image.metadata,
            is_light_frame: request.frame_kind().is_light_frame(),
            started_at: None,
            cooler: None,
            checksum,
        })
    }
}
