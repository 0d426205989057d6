//! Core library for the ccd_daq acquisition tool.
//!
//! Commands a cooled CCD/CMOS camera through the [`hardware::CameraDevice`]
//! trait, runs exposure cycles with [`acquisition::Orchestrator`] and stores
//! each frame as a FITS file through [`storage::FitsWriter`].

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod limits;
pub mod logging;
pub mod session;
pub mod storage;
