//! Acquisition orchestrator.
//!
//! Runs N exposure cycles back to back, merges a fresh cooler snapshot into
//! each frame, picks the output file name and hands the frame to the writer.
//!
//! Per-cycle failures are collected and the run continues with the next
//! exposure. Storage failures and exhausted retry budgets end the run, and so
//! does a cancelled readiness wait.

use super::request::{build_request, ExposureIntent, ExposureRequest, FrameKind};
use super::retry::{prepare_retry, RetryBudget, RetryDecision, RetryPolicy};
use super::state_machine::{ExposureResult, ExposureStateMachine, ReadyWait};
use crate::config::{AppConfig, SettleTiming};
use crate::error::{attempt_and_discard, AcquisitionError, AppResult, Recovery};
use crate::hardware::CameraDevice;
use crate::session::Session;
use crate::storage::{FrameWriter, HeaderFields, StorageError};
use std::path::{Path, PathBuf};

/// Whether each cycle exposes the detector or re-reads the held frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleMode {
    /// Expose, wait and download.
    #[default]
    Expose,
    /// Download the frame the sensor still holds. Never retried.
    Redownload,
}

/// How a run of exposures is carried out and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CyclePlan {
    /// Number of exposures, at least 1
    pub count: u32,
    /// Expose or re-read the held frame
    pub mode: CycleMode,
    /// Directory for generated and explicit file names
    pub output_dir: PathBuf,
    /// Extension of generated file names
    pub extension: String,
    /// Explicit file name; every exposure of the run writes to it
    pub filename: Option<String>,
    /// Written to `FOCUSPOS`; -1 when unknown
    pub focus_position: i64,
    /// Extra string cards, last value wins per key
    pub extra_headers: Vec<(String, String)>,
}

impl CyclePlan {
    /// One exposure into `output_dir` with generated names.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            count: 1,
            mode: CycleMode::Expose,
            output_dir: output_dir.into(),
            extension: "fits".to_string(),
            filename: None,
            focus_position: -1,
            extra_headers: Vec::new(),
        }
    }

    fn target_path(&self, serial: &str, kind: FrameKind) -> Result<PathBuf, StorageError> {
        if let Some(name) = &self.filename {
            return Ok(self.output_dir.join(name));
        }
        let n = next_sequence_number(&self.output_dir, serial)?;
        Ok(self
            .output_dir
            .join(format!("{serial}_{n}_{kind}.{}", self.extension)))
    }
}

/// Counts the entries of `dir` whose name starts with `serial`.
///
/// This is a scan, not a persisted counter: two processes writing into the
/// same directory can pick the same number.
pub fn next_sequence_number(dir: &Path, serial: &str) -> Result<usize, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        if entry.file_name().to_string_lossy().starts_with(serial) {
            count += 1;
        }
    }
    Ok(count)
}

/// A frame that reached disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrame {
    /// Position in the run, from 0
    pub index: u32,
    /// File the frame was written to
    pub path: PathBuf,
    /// SHA-256 of the pixel data
    pub checksum: String,
}

/// Result of one exposure of a run.
pub type CycleOutcome = Result<SavedFrame, AcquisitionError>;

/// Runs exposure cycles on a session and stores each frame with `W`.
pub struct Orchestrator<'s, D: CameraDevice, W: FrameWriter> {
    session: &'s mut Session<D>,
    writer: W,
    timing: SettleTiming,
    wait: ReadyWait,
    retry: RetryPolicy,
}

impl<'s, D: CameraDevice, W: FrameWriter> Orchestrator<'s, D, W> {
    /// Takes delays, readiness bounds and retry policy from `config`.
    pub fn new(session: &'s mut Session<D>, writer: W, config: &AppConfig) -> Self {
        Self {
            session,
            writer,
            timing: config.timing.clone(),
            wait: ReadyWait::from_config(&config.readiness),
            retry: config.retry.clone(),
        }
    }

    /// Replaces the readiness bounds, e.g. to share a cancellation token.
    #[must_use]
    pub fn with_ready_wait(mut self, wait: ReadyWait) -> Self {
        self.wait = wait;
        self
    }

    /// Runs `plan.count` exposures of `intent`.
    ///
    /// # Errors
    ///
    /// Only fatal errors (`StorageWriteFailed`, `RetriesExhausted`) are
    /// returned; the frames saved before them are on disk. A cancelled
    /// readiness wait is recorded as the last outcome and ends the run
    /// without starting further exposures.
    pub async fn run_cycle(
        &mut self,
        intent: &ExposureIntent,
        plan: &CyclePlan,
    ) -> AppResult<Vec<CycleOutcome>> {
        if plan.filename.is_some() && plan.count > 1 {
            tracing::warn!(
                count = plan.count,
                "Explicit file name given for several exposures; each one overwrites the last"
            );
        }
        std::fs::create_dir_all(&plan.output_dir)
            .map_err(|e| StorageError::io(&plan.output_dir, e))?;

        let mut outcomes = Vec::with_capacity(plan.count as usize);
        for index in 0..plan.count {
            let request = build_request(self.session.geometry(), intent);
            match self.acquire(&request, plan.mode).await {
                Ok(frame) => {
                    let saved = self.persist(index, frame, &request, plan).await?;
                    outcomes.push(Ok(saved));
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(AcquisitionError::ReadinessCancelled) => {
                    tracing::warn!(index, remaining = plan.count - index - 1, "Run cancelled");
                    outcomes.push(Err(AcquisitionError::ReadinessCancelled));
                    break;
                }
                Err(err) => {
                    tracing::error!(index, error = %err, recovery = ?err.recovery(), "Exposure failed");
                    outcomes.push(Err(err));
                }
            }
        }
        Ok(outcomes)
    }

    async fn acquire(
        &mut self,
        request: &ExposureRequest,
        mode: CycleMode,
    ) -> AppResult<ExposureResult> {
        let mut budget = RetryBudget::new(&self.retry);
        let mut path = match mode {
            CycleMode::Expose => Recovery::Reexpose,
            CycleMode::Redownload => Recovery::Redownload,
        };
        // A redownload after a failed expose attempt reads that exposure.
        let mut started_at = None;

        loop {
            let (device, gate) = self.session.parts();
            let mut machine = ExposureStateMachine::new(device, &self.timing, self.wait.clone());
            let attempt = match path {
                Recovery::Redownload => machine.redownload(request).await,
                _ => {
                    let attempt = machine.expose(gate, request).await;
                    started_at = machine.started_at().or(started_at);
                    attempt
                }
            };

            let err = match attempt {
                Ok(mut frame) => {
                    frame.started_at = frame.started_at.or(started_at);
                    return Ok(frame);
                }
                Err(err) if mode == CycleMode::Redownload => return Err(err),
                Err(err) => err,
            };
            match budget.decide(err) {
                RetryDecision::Retry(next) => {
                    prepare_retry(device, &self.retry).await;
                    path = next;
                }
                RetryDecision::GiveUp(err) => return Err(err),
            }
        }
    }

    async fn persist(
        &self,
        index: u32,
        mut frame: ExposureResult,
        request: &ExposureRequest,
        plan: &CyclePlan,
    ) -> AppResult<SavedFrame> {
        // Without a snapshot the temperature headers are left out.
        frame.cooler = attempt_and_discard(
            "cooler snapshot",
            self.session.device().cooler_snapshot().await,
        );

        let serial = self.session.serial();
        let path = plan.target_path(serial, request.frame_kind())?;
        let header = HeaderFields {
            serial: serial.to_string(),
            focus_position: plan.focus_position,
            extra: plan.extra_headers.clone(),
        };
        self.writer.write(&frame, &header, &path)?;

        Ok(SavedFrame {
            index,
            path,
            checksum: frame.checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockCamera, MockCommand};
    use std::sync::Mutex;

    /// Records frames and touches the target file so the directory scan sees it.
    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<(PathBuf, ExposureResult, HeaderFields)>>,
        fail: bool,
    }

    impl FrameWriter for &RecordingWriter {
        fn write(
            &self,
            frame: &ExposureResult,
            header: &HeaderFields,
            path: &Path,
        ) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Fits {
                    path: path.to_path_buf(),
                    diagnostic: "disk full".to_string(),
                });
            }
            std::fs::write(path, b"").map_err(|e| StorageError::io(path, e))?;
            self.written
                .lock()
                .unwrap()
                .push((path.to_path_buf(), frame.clone(), header.clone()));
            Ok(())
        }
    }

    fn quiet_config() -> AppConfig {
        AppConfig {
            timing: SettleTiming::none(),
            ..AppConfig::default()
        }
    }

    async fn session(camera: MockCamera) -> Session<MockCamera> {
        Session::open(camera).await.unwrap()
    }

    fn file_names(writer: &RecordingWriter) -> Vec<String> {
        writer
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn sequence_number_counts_same_serial_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["SN1_0_light.fits", "SN1_1_dark.fits", "SN2_0_light.fits", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(next_sequence_number(dir.path(), "SN1").unwrap(), 2);
        assert_eq!(next_sequence_number(dir.path(), "SN2").unwrap(), 1);
        assert_eq!(next_sequence_number(dir.path(), "SN3").unwrap(), 0);
    }

    #[tokio::test]
    async fn generated_names_continue_after_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SN1_0_bias.fits"), b"").unwrap();
        let mut session = session(MockCamera::builder().serial("SN1").sensor_size(8, 8).build()).await;
        let writer = RecordingWriter::default();
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 2;

        let intent = ExposureIntent::light(1.0).with_kind(FrameKind::Flat);
        let outcomes = Orchestrator::new(&mut session, &writer, &quiet_config())
            .run_cycle(&intent, &plan)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(file_names(&writer), vec!["SN1_1_flat.fits", "SN1_2_flat.fits"]);
    }

    #[tokio::test]
    async fn explicit_name_and_headers_are_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(MockCamera::builder().serial("SN1").sensor_size(8, 8).build()).await;
        let writer = RecordingWriter::default();
        let mut plan = CyclePlan::new(dir.path());
        plan.filename = Some("m31.fits".to_string());
        plan.focus_position = 812;
        plan.extra_headers = vec![("OBJECT".to_string(), "M31".to_string())];

        Orchestrator::new(&mut session, &writer, &quiet_config())
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        let written = writer.written.lock().unwrap();
        let (path, frame, header) = &written[0];
        assert_eq!(path, &dir.path().join("m31.fits"));
        assert_eq!(header.serial, "SN1");
        assert_eq!(header.focus_position, 812);
        assert_eq!(header.extra, vec![("OBJECT".to_string(), "M31".to_string())]);
        assert!(frame.cooler.is_some());
    }

    #[tokio::test]
    async fn cooler_snapshot_is_taken_per_exposure_and_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).build();
        camera.fail_next(MockCommand::CoolerSnapshot, "TEC not responding", 1);
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 2;

        let outcomes = Orchestrator::new(&mut session, &writer, &quiet_config())
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        assert!(outcomes.iter().all(Result::is_ok));
        let written = writer.written.lock().unwrap();
        assert!(written[0].1.cooler.is_none());
        assert!(written[1].1.cooler.is_some());
        assert_eq!(session.device().calls(MockCommand::CoolerSnapshot), 2);
    }

    #[tokio::test]
    async fn cycle_failures_are_collected_and_the_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().serial("SN1").sensor_size(8, 8).build();
        camera.fail_next(MockCommand::StartExposure, "shutter jammed", 1);
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 2;

        let outcomes = Orchestrator::new(&mut session, &writer, &quiet_config())
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        let err = outcomes[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("shutter jammed"));
        assert_eq!(outcomes[1].as_ref().unwrap().path, dir.path().join("SN1_0_light.fits"));
    }

    #[tokio::test]
    async fn storage_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(MockCamera::builder().sensor_size(8, 8).build()).await;
        let writer = RecordingWriter {
            fail: true,
            ..RecordingWriter::default()
        };
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 3;

        let err = Orchestrator::new(&mut session, &writer, &quiet_config())
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("disk full"));
        assert_eq!(session.device().calls(MockCommand::StartExposure), 1);
    }

    #[tokio::test]
    async fn empty_download_is_retried_by_redownloading() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).build();
        camera.fetch_nothing_next(1);
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut config = quiet_config();
        config.retry = RetryPolicy {
            download_retries: 2,
            backoff_ms: 0,
            ..RetryPolicy::default()
        };

        let outcomes = Orchestrator::new(&mut session, &writer, &config)
            .run_cycle(&ExposureIntent::light(1.0), &CyclePlan::new(dir.path()))
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        let camera = session.device();
        assert_eq!(camera.calls(MockCommand::StartExposure), 1);
        assert_eq!(camera.calls(MockCommand::StartDownload), 2);
        assert_eq!(camera.calls(MockCommand::Reinitialize), 1);
        // The redownloaded frame keeps the start time of its exposure.
        assert!(writer.written.lock().unwrap()[0].1.started_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_wait_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).never_ready().build();
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut config = quiet_config();
        config.retry.exposure_retries = 3;
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 5;

        let wait = ReadyWait {
            poll_interval: std::time::Duration::from_millis(5),
            ..ReadyWait::default()
        };
        let cancel = wait.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let outcomes = Orchestrator::new(&mut session, &writer, &config)
            .with_ready_wait(wait)
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Err(AcquisitionError::ReadinessCancelled)));
        let camera = session.device();
        assert_eq!(camera.calls(MockCommand::StartExposure), 1);
        assert!(file_names(&writer).is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_run_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(MockCamera::builder().sensor_size(8, 8).build()).await;
        let writer = RecordingWriter::default();
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 5;
        let wait = ReadyWait::default();
        wait.cancel.cancel();

        let outcomes = Orchestrator::new(&mut session, &writer, &quiet_config())
            .with_ready_wait(wait)
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(session.device().calls(MockCommand::StartExposure), 0);
    }

    #[tokio::test]
    async fn hardware_failure_is_retried_by_exposing_again() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).build();
        camera.fail_next(MockCommand::StartDownload, "USB transfer stalled", 1);
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut config = quiet_config();
        config.retry = RetryPolicy {
            exposure_retries: 1,
            backoff_ms: 0,
            reinitialize_handles: false,
            ..RetryPolicy::default()
        };

        let outcomes = Orchestrator::new(&mut session, &writer, &config)
            .run_cycle(&ExposureIntent::light(1.0), &CyclePlan::new(dir.path()))
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        assert_eq!(session.device().calls(MockCommand::StartExposure), 2);
        assert_eq!(session.device().calls(MockCommand::Reinitialize), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_end_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).build();
        camera.fetch_empty_next(5);
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut config = quiet_config();
        config.retry = RetryPolicy {
            download_retries: 2,
            backoff_ms: 0,
            ..RetryPolicy::default()
        };
        let mut plan = CyclePlan::new(dir.path());
        plan.count = 2;

        let err = Orchestrator::new(&mut session, &writer, &config)
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(session.device().calls(MockCommand::FetchImage), 3);
    }

    #[tokio::test]
    async fn redownload_mode_never_exposes_or_retries() {
        let dir = tempfile::tempdir().unwrap();
        let camera = MockCamera::builder().sensor_size(8, 8).build();
        let mut session = session(camera).await;
        let writer = RecordingWriter::default();
        let mut config = quiet_config();
        config.retry.download_retries = 3;
        let mut plan = CyclePlan::new(dir.path());
        plan.mode = CycleMode::Redownload;

        // Nothing is held on the sensor, so the download is refused.
        let outcomes = Orchestrator::new(&mut session, &writer, &config)
            .run_cycle(&ExposureIntent::light(1.0), &plan)
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0],
            Err(AcquisitionError::HardwareCommandFailed(_))
        ));
        let camera = session.device();
        assert_eq!(camera.calls(MockCommand::StartExposure), 0);
        assert_eq!(camera.calls(MockCommand::StartDownload), 1);
    }
}
