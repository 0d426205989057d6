//! Mock Camera Implementation
//!
//! Simulated camera for testing without physical hardware, also used as the
//! built-in device of the command-line front end.
//!
//! # Behaviour
//!
//! - Every command is counted, so tests can assert e.g. that no exposure was
//!   started after a capability check failed.
//! - Readiness is reached after a configurable number of status queries
//!   (`polls_until_ready`). In realtime mode the exposure duration must also
//!   elapse first.
//! - Faults are scripted per command: a command can be told to fail the next
//!   N times with a given diagnostic, and image fetches can be told to come
//!   back empty or truncated.
//! - After a readout the frame stays held on the sensor, so it can be
//!   downloaded again.

use super::{
    Capability, CameraDevice, CoolerSnapshot, DeviceStatus, DownloadedImage, ExposureOptions,
    HardwareError, HardwareResult, ImageMetadata, SensorGeometry, SensorSetting, SensorState,
    Subframe,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Commands recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCommand {
    /// `CameraDevice::serial_number`
    SerialNumber,
    /// `CameraDevice::sensor_geometry`
    SensorGeometry,
    /// `CameraDevice::query_capability`
    QueryCapability,
    /// `CameraDevice::set_sensor_setting`
    SetSensorSetting,
    /// `CameraDevice::set_subframe`
    SetSubframe,
    /// `CameraDevice::start_exposure`
    StartExposure,
    /// `CameraDevice::abort_exposure`
    AbortExposure,
    /// `CameraDevice::query_status`
    QueryStatus,
    /// `CameraDevice::start_download`
    StartDownload,
    /// `CameraDevice::fetch_image`
    FetchImage,
    /// `CameraDevice::cooler_snapshot`
    CoolerSnapshot,
    /// `CameraDevice::set_cooler_setpoint`
    SetCoolerSetpoint,
    /// `CameraDevice::disable_cooler`
    DisableCooler,
    /// `CameraDevice::reinitialize`
    Reinitialize,
}

impl MockCommand {
    fn sdk_name(self) -> &'static str {
        match self {
            MockCommand::SerialNumber => "getSerial",
            MockCommand::SensorGeometry => "getInfo",
            MockCommand::QueryCapability => "queryCapability",
            MockCommand::SetSensorSetting => "setSetting",
            MockCommand::SetSubframe => "setSubframe",
            MockCommand::StartExposure => "startExposure",
            MockCommand::AbortExposure => "abortExposure",
            MockCommand::QueryStatus => "queryStatus",
            MockCommand::StartDownload => "startDownload",
            MockCommand::FetchImage => "getImage",
            MockCommand::CoolerSnapshot => "queryTEC",
            MockCommand::SetCoolerSetpoint => "setState",
            MockCommand::DisableCooler => "setState",
            MockCommand::Reinitialize => "initialize",
        }
    }
}

/// What a scripted image fetch returns instead of the real frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchFault {
    Missing,
    Empty,
    Truncated,
}

#[derive(Debug)]
struct Exposure {
    options: ExposureOptions,
    subframe: Subframe,
    polls: u32,
    started: Instant,
}

#[derive(Debug)]
struct MockCameraState {
    calls: HashMap<MockCommand, usize>,
    failures: HashMap<MockCommand, VecDeque<String>>,
    fetch_faults: VecDeque<FetchFault>,
    settings: HashMap<SensorSetting, u32>,
    subframe: Option<Subframe>,
    exposure: Option<Exposure>,
    /// Frame held on the sensor after readout: (options, subframe)
    held: Option<(ExposureOptions, Subframe)>,
    downloaded: bool,
    frame_counter: u32,
    cooler: CoolerSnapshot,
}

/// Builder for [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraBuilder {
    serial: String,
    model: String,
    sensor_id: u32,
    geometry: SensorGeometry,
    on_chip_binning: bool,
    overscan: bool,
    polls_until_ready: u32,
    never_ready: bool,
    realtime: bool,
    e_gain: Option<f64>,
    cooler: CoolerSnapshot,
}

impl Default for MockCameraBuilder {
    fn default() -> Self {
        Self {
            serial: "AL694M-21040501".to_string(),
            model: "Aluma CCD".to_string(),
            sensor_id: 0,
            geometry: SensorGeometry {
                pixels_x: 2750,
                pixels_y: 2200,
                pixel_size_x: 4.54,
                pixel_size_y: 4.54,
                cooler_setpoint_min: -50.0,
                cooler_setpoint_max: 25.0,
                bin_x_max: 4,
                bin_y_max: 4,
                exposure_duration_min: 0.1,
                exposure_precision: 0.001,
            },
            on_chip_binning: true,
            overscan: true,
            polls_until_ready: 3,
            never_ready: false,
            realtime: false,
            e_gain: Some(0.37),
            cooler: CoolerSnapshot {
                enabled: true,
                power: 42.0,
                setpoint: -20.0,
                heatsink_temp: 18.5,
                sensor_temp: -19.97,
            },
        }
    }
}

impl MockCameraBuilder {
    /// Camera serial number.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    /// Camera model name.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Drive the auxiliary (guider) sensor instead of the main one.
    pub fn sensor_id(mut self, sensor_id: u32) -> Self {
        self.sensor_id = sensor_id;
        self
    }

    /// Full sensor geometry.
    pub fn geometry(mut self, geometry: SensorGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Sensor size in pixels.
    pub fn sensor_size(mut self, width: u32, height: u32) -> Self {
        self.geometry.pixels_x = width;
        self.geometry.pixels_y = height;
        self
    }

    /// Shortest exposure the sensor accepts.
    pub fn min_exposure(mut self, seconds: f64) -> Self {
        self.geometry.exposure_duration_min = seconds;
        self
    }

    /// Whether the camera reports on-chip binning support.
    pub fn on_chip_binning(mut self, supported: bool) -> Self {
        self.on_chip_binning = supported;
        self
    }

    /// Whether the camera reports overscan support.
    pub fn overscan(mut self, supported: bool) -> Self {
        self.overscan = supported;
        self
    }

    /// Number of status queries that report "exposing" before the frame is ready.
    pub fn polls_until_ready(mut self, polls: u32) -> Self {
        self.polls_until_ready = polls;
        self
    }

    /// The sensor never becomes ready (a hung device).
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Readiness also waits for the exposure duration to elapse.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Gain reported in the image metadata; `None` for cameras that don't record it.
    pub fn e_gain(mut self, e_gain: Option<f64>) -> Self {
        self.e_gain = e_gain;
        self
    }

    /// Initial cooler telemetry.
    pub fn cooler(mut self, cooler: CoolerSnapshot) -> Self {
        self.cooler = cooler;
        self
    }

    /// Builds the mock camera.
    #[must_use]
    pub fn build(self) -> MockCamera {
        MockCamera {
            state: Mutex::new(MockCameraState {
                calls: HashMap::new(),
                failures: HashMap::new(),
                fetch_faults: VecDeque::new(),
                settings: HashMap::new(),
                subframe: None,
                exposure: None,
                held: None,
                downloaded: false,
                frame_counter: 0,
                cooler: self.cooler,
            }),
            config: self,
        }
    }
}

/// Simulated camera with scripted faults and command counting.
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::builder().sensor_size(100, 100).build();
/// camera.fail_next(MockCommand::StartDownload, "USB transfer stalled", 1);
/// ```
#[derive(Debug)]
pub struct MockCamera {
    config: MockCameraBuilder,
    state: Mutex<MockCameraState>,
}

impl Default for MockCamera {
    fn default() -> Self {
        MockCameraBuilder::default().build()
    }
}

impl MockCamera {
    /// Starts building a mock camera.
    pub fn builder() -> MockCameraBuilder {
        MockCameraBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, MockCameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` calls of `command` fail with `diagnostic`.
    pub fn fail_next(&self, command: MockCommand, diagnostic: &str, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(command).or_default();
        queue.extend(std::iter::repeat(diagnostic.to_string()).take(times));
    }

    /// Makes the next `times` image fetches return no image at all.
    pub fn fetch_nothing_next(&self, times: usize) {
        self.push_fetch_faults(FetchFault::Missing, times);
    }

    /// Makes the next `times` image fetches return an image with an empty buffer.
    pub fn fetch_empty_next(&self, times: usize) {
        self.push_fetch_faults(FetchFault::Empty, times);
    }

    /// Makes the next `times` image fetches return a truncated buffer.
    pub fn fetch_truncated_next(&self, times: usize) {
        self.push_fetch_faults(FetchFault::Truncated, times);
    }

    fn push_fetch_faults(&self, fault: FetchFault, times: usize) {
        self.state()
            .fetch_faults
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Number of times `command` was issued.
    pub fn calls(&self, command: MockCommand) -> usize {
        self.state().calls.get(&command).copied().unwrap_or(0)
    }

    /// Last value written for a sensor setting.
    pub fn setting(&self, setting: SensorSetting) -> Option<u32> {
        self.state().settings.get(&setting).copied()
    }

    /// Last subframe applied.
    pub fn last_subframe(&self) -> Option<Subframe> {
        self.state().subframe
    }

    /// Options of the last started exposure, if its frame is still held.
    pub fn held_exposure(&self) -> Option<ExposureOptions> {
        self.state().held.map(|(options, _)| options)
    }

    /// Records the call and pops a scripted failure, if any.
    fn enter(&self, state: &mut MockCameraState, command: MockCommand) -> HardwareResult<()> {
        *state.calls.entry(command).or_insert(0) += 1;
        if let Some(diagnostic) = state
            .failures
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
        {
            tracing::debug!(?command, %diagnostic, "Mock camera injecting failure");
            return Err(HardwareError::new(command.sdk_name(), diagnostic));
        }
        Ok(())
    }

    fn render(&self, options: &ExposureOptions, subframe: &Subframe, frame: u32) -> Vec<u16> {
        let mut data = Vec::with_capacity((subframe.width as usize) * (subframe.height as usize));
        let signal = if options.is_light_frame { 1000 } else { 100 };
        for y in 0..subframe.height {
            for x in 0..subframe.width {
                // Prevent overflow by using u32 arithmetic and clamping result
                let val = signal + ((x + y + frame) % 256) * 10;
                data.push(val.min(u16::MAX as u32) as u16);
            }
        }
        data
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    fn model(&self) -> String {
        self.config.model.clone()
    }

    fn sensor_id(&self) -> u32 {
        self.config.sensor_id
    }

    async fn serial_number(&self) -> HardwareResult<String> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::SerialNumber)?;
        Ok(self.config.serial.clone())
    }

    async fn sensor_geometry(&self) -> HardwareResult<SensorGeometry> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::SensorGeometry)?;
        Ok(self.config.geometry.clone())
    }

    async fn query_capability(&self, capability: Capability) -> HardwareResult<bool> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::QueryCapability)?;
        Ok(match capability {
            Capability::OnChipBinning => self.config.on_chip_binning,
            Capability::Overscan => self.config.overscan,
        })
    }

    async fn set_sensor_setting(&self, setting: SensorSetting, value: u32) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::SetSensorSetting)?;
        state.settings.insert(setting, value);
        Ok(())
    }

    async fn set_subframe(&self, subframe: &Subframe) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::SetSubframe)?;
        let geometry = &self.config.geometry;
        if subframe.left + subframe.width * subframe.bin_x > geometry.pixels_x
            || subframe.top + subframe.height * subframe.bin_y > geometry.pixels_y
        {
            return Err(HardwareError::new(
                "setSubframe",
                format!("Subframe {subframe:?} exceeds sensor bounds"),
            ));
        }
        state.subframe = Some(*subframe);
        Ok(())
    }

    async fn start_exposure(&self, options: &ExposureOptions) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::StartExposure)?;
        let subframe = state.subframe.ok_or_else(|| {
            HardwareError::new("startExposure", "No subframe configured")
        })?;
        if state.exposure.is_some() {
            return Err(HardwareError::new("startExposure", "Exposure already in progress"));
        }
        state.exposure = Some(Exposure {
            options: *options,
            subframe,
            polls: 0,
            started: Instant::now(),
        });
        state.held = None;
        state.downloaded = false;
        tracing::debug!(duration = options.duration, "Mock exposure started");
        Ok(())
    }

    async fn abort_exposure(&self) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::AbortExposure)?;
        if state.exposure.take().is_none() {
            return Err(HardwareError::new("abortExposure", "No exposure in progress"));
        }
        Ok(())
    }

    async fn query_status(&self) -> HardwareResult<DeviceStatus> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::QueryStatus)?;

        let sensor = if let Some(exposure) = state.exposure.as_mut() {
            exposure.polls += 1;
            let elapsed_ok = !self.config.realtime
                || exposure.started.elapsed().as_secs_f64() >= exposure.options.duration;
            if !self.config.never_ready
                && elapsed_ok
                && exposure.polls > self.config.polls_until_ready
            {
                let exposure = state.exposure.take();
                if let Some(exposure) = exposure {
                    state.held = Some((exposure.options, exposure.subframe));
                }
                SensorState::ReadyToDownload
            } else {
                SensorState::Exposing
            }
        } else if state.held.is_some() && !state.downloaded {
            SensorState::ReadyToDownload
        } else {
            SensorState::Idle
        };

        let status = if self.config.sensor_id != 0 {
            DeviceStatus {
                main_sensor: SensorState::Idle,
                ext_sensor: sensor,
            }
        } else {
            DeviceStatus {
                main_sensor: sensor,
                ext_sensor: SensorState::Idle,
            }
        };
        Ok(status)
    }

    async fn start_download(&self) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::StartDownload)?;
        if state.held.is_none() {
            return Err(HardwareError::new("startDownload", "No image available for download"));
        }
        state.downloaded = true;
        Ok(())
    }

    async fn fetch_image(&self) -> HardwareResult<Option<DownloadedImage>> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::FetchImage)?;
        let Some((options, held_subframe)) = state.held else {
            return Ok(None);
        };
        if !state.downloaded {
            return Ok(None);
        }
        // The readout uses whatever subframe is applied now (redownload re-applies it).
        let subframe = state.subframe.unwrap_or(held_subframe);
        state.frame_counter += 1;
        let mut buffer = self.render(&options, &subframe, state.frame_counter);

        match state.fetch_faults.pop_front() {
            Some(FetchFault::Missing) => return Ok(None),
            Some(FetchFault::Empty) => buffer.clear(),
            Some(FetchFault::Truncated) => buffer.truncate(buffer.len() / 2),
            None => {}
        }

        Ok(Some(DownloadedImage {
            buffer,
            metadata: ImageMetadata {
                width: subframe.width,
                height: subframe.height,
                exposure_duration: options.duration,
                bin_x: options.bin_x,
                bin_y: options.bin_y,
                e_gain: self.config.e_gain,
            },
        }))
    }

    async fn cooler_snapshot(&self) -> HardwareResult<CoolerSnapshot> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::CoolerSnapshot)?;
        Ok(state.cooler)
    }

    async fn set_cooler_setpoint(&self, celsius: f64) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::SetCoolerSetpoint)?;
        state.cooler.enabled = true;
        state.cooler.setpoint = celsius;
        Ok(())
    }

    async fn disable_cooler(&self) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::DisableCooler)?;
        state.cooler.enabled = false;
        state.cooler.power = 0.0;
        Ok(())
    }

    async fn reinitialize(&self) -> HardwareResult<()> {
        let mut state = self.state();
        self.enter(&mut state, MockCommand::Reinitialize)?;
        state.exposure = None;
        Ok(())
    }
}
