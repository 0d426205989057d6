//! End-to-end acquisition against the mock camera, writing real FITS files.
#![cfg(feature = "storage_fits")]

mod common;

use ccd_daq::acquisition::{BinFactors, CyclePlan, ExposureIntent, FrameKind, Orchestrator};
use ccd_daq::config::AppConfig;
use ccd_daq::error::AcquisitionError;
use ccd_daq::hardware::MockCommand;
use ccd_daq::storage::{FitsReader, FitsWriter};
use common::{fast_config, open, small_camera, SERIAL};

#[tokio::test]
async fn three_light_frames_are_numbered_and_labelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(small_camera()).await;
    let mut plan = CyclePlan::new(dir.path());
    plan.count = 3;

    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), &fast_config())
        .run_cycle(&ExposureIntent::light(5.0), &plan)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);

    for n in 0..3 {
        let path = dir.path().join(format!("{SERIAL}_{n}_light.fits"));
        assert_eq!(outcomes[n].as_ref().unwrap().path, path);

        let mut reader = FitsReader::open(&path).unwrap();
        assert_eq!(reader.dimensions(), Some((100, 100)));
        assert_eq!(reader.key_f64("EXPTIME").unwrap(), 5.0);
        assert_eq!(reader.key_string("IMAGETYP").unwrap(), "Light Frame");
        assert_eq!(reader.key_i64("XBINNING").unwrap(), 1);
        assert_eq!(reader.key_i64("YBINNING").unwrap(), 1);
        assert_eq!(reader.key_string("SERIALNO").unwrap(), SERIAL);
        assert_eq!(reader.key_i64("FOCUSPOS").unwrap(), -1);
        assert!(reader.key_f64("CCD-TEMP").is_ok());
        assert_eq!(reader.pixels().unwrap().len(), 100 * 100);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
}

#[tokio::test]
async fn bias_frame_records_sensor_minimum() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(small_camera()).await;
    let intent = ExposureIntent::light(10.0).with_kind(FrameKind::Bias);

    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), &fast_config())
        .run_cycle(&intent, &CyclePlan::new(dir.path()))
        .await
        .unwrap();

    let path = &outcomes[0].as_ref().unwrap().path;
    assert_eq!(path, &dir.path().join(format!("{SERIAL}_0_bias.fits")));
    let mut reader = FitsReader::open(path).unwrap();
    assert_eq!(reader.key_f64("EXPTIME").unwrap(), 0.1);
    assert_eq!(reader.key_string("IMAGETYP").unwrap(), "Light Frame");
}

#[tokio::test]
async fn unsupported_overscan_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(small_camera()).await;
    let intent = ExposureIntent::light(1.0).with_overscan(true);

    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), &fast_config())
        .run_cycle(&intent, &CyclePlan::new(dir.path()))
        .await
        .unwrap();

    assert!(matches!(
        outcomes[0],
        Err(AcquisitionError::CapabilityUnsupported { .. })
    ));
    assert_eq!(session.device().calls(MockCommand::StartExposure), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn dark_frames_with_binning_and_headers() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(small_camera()).await;
    let intent = ExposureIntent::light(30.0)
        .with_kind(FrameKind::Dark)
        .with_bin(BinFactors::new(3, 2).unwrap());
    let mut plan = CyclePlan::new(dir.path());
    plan.focus_position = 2048;
    plan.extra_headers = vec![("OBJECT".into(), "NGC 7000".into())];

    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), &fast_config())
        .run_cycle(&intent, &plan)
        .await
        .unwrap();

    let mut reader = FitsReader::open(&outcomes[0].as_ref().unwrap().path).unwrap();
    assert_eq!(reader.dimensions(), Some((33, 50)));
    assert_eq!(reader.key_string("IMAGETYP").unwrap(), "Dark Frame");
    assert_eq!(reader.key_i64("XBINNING").unwrap(), 3);
    assert_eq!(reader.key_i64("YBINNING").unwrap(), 2);
    assert_eq!(reader.key_i64("FOCUSPOS").unwrap(), 2048);
    assert_eq!(reader.key_string("OBJECT").unwrap(), "NGC 7000");
}

#[tokio::test(start_paused = true)]
async fn default_timing_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(small_camera()).await;

    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), &AppConfig::default())
        .run_cycle(&ExposureIntent::light(1.0), &CyclePlan::new(dir.path()))
        .await
        .unwrap();
    assert!(outcomes[0].is_ok());
}
