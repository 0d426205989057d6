//! Device session.
//!
//! Owns the camera handle for the life of the process together with what is
//! learnt from it once: serial number, sensor geometry and the capability
//! cache. Everything else borrows the session, and [`Session::close`] consumes
//! it, so no borrower can outlive teardown.

use crate::acquisition::CapabilityGate;
use crate::error::AppResult;
use crate::hardware::{CameraDevice, SensorGeometry};

/// An open camera with its cached serial number, geometry and capabilities.
pub struct Session<D: CameraDevice> {
    device: D,
    serial: String,
    geometry: SensorGeometry,
    gate: CapabilityGate,
}

impl<D: CameraDevice> Session<D> {
    /// Opens a session, reading the serial number and sensor geometry.
    pub async fn open(device: D) -> AppResult<Self> {
        let serial = device.serial_number().await?;
        let geometry = device.sensor_geometry().await?;
        tracing::info!(
            model = %device.model(),
            serial = %serial,
            width = geometry.pixels_x,
            height = geometry.pixels_y,
            "Camera session opened"
        );
        Ok(Self {
            device,
            serial,
            geometry,
            gate: CapabilityGate::new(),
        })
    }

    /// The camera handle.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Serial number read at open.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Sensor geometry read at open.
    pub fn geometry(&self) -> &SensorGeometry {
        &self.geometry
    }

    /// Device plus the capability cache, for one exposure cycle.
    pub fn parts(&mut self) -> (&D, &mut CapabilityGate) {
        (&self.device, &mut self.gate)
    }

    /// Ends the session and releases the device.
    pub fn close(self) {
        tracing::info!(serial = %self.serial, "Camera session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockCamera, MockCommand};

    #[tokio::test]
    async fn open_reads_identity_once() {
        let camera = MockCamera::builder().serial("SN42").sensor_size(64, 32).build();
        let session = Session::open(camera).await.unwrap();
        assert_eq!(session.serial(), "SN42");
        assert_eq!(session.geometry().pixels_x, 64);
        assert_eq!(session.device().calls(MockCommand::SerialNumber), 1);
        assert_eq!(session.device().calls(MockCommand::SensorGeometry), 1);
        session.close();
    }

    #[tokio::test]
    async fn open_fails_with_hardware_diagnostic() {
        let camera = MockCamera::default();
        camera.fail_next(MockCommand::SerialNumber, "no camera attached", 1);
        let err = Session::open(camera).await.err().unwrap();
        assert!(err.to_string().contains("no camera attached"));
    }
}
