//! Shared helpers for integration tests.
#![allow(dead_code)]

use ccd_daq::config::{AppConfig, SettleTiming};
use ccd_daq::hardware::MockCamera;
use ccd_daq::session::Session;

pub const SERIAL: &str = "KL4040-0042";

/// 100x100 sensor with a 0.1 s minimum exposure.
pub fn small_camera() -> MockCamera {
    MockCamera::builder()
        .serial(SERIAL)
        .sensor_size(100, 100)
        .min_exposure(0.1)
        .overscan(false)
        .build()
}

pub async fn open(camera: MockCamera) -> Session<MockCamera> {
    Session::open(camera).await.expect("session opens")
}

/// Default config without settle delays.
pub fn fast_config() -> AppConfig {
    AppConfig {
        timing: SettleTiming::none(),
        ..AppConfig::default()
    }
}
