//! Device capability gate.
//!
//! Capability flags are queried lazily, once per session, and cached. A
//! request that needs a missing feature is rejected before any mutating
//! command reaches the camera: the later commands assume the feature exists
//! and would misbehave silently otherwise.

use crate::error::AcquisitionError;
use crate::hardware::{CameraDevice, Capability};
use std::collections::HashMap;

fn operator_hint(capability: Capability) -> &'static str {
    match capability {
        Capability::OnChipBinning => {
            "binning requested; use --binx=1 and --biny=1 and bin the frames afterwards"
        }
        Capability::Overscan => "use --disable-overscan",
    }
}

/// Session-wide cache of capability flags.
#[derive(Debug, Default)]
pub struct CapabilityGate {
    cache: HashMap<Capability, bool>,
}

impl CapabilityGate {
    /// Empty cache; nothing has been queried yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached flag, if the capability was already queried.
    pub fn cached(&self, capability: Capability) -> Option<bool> {
        self.cache.get(&capability).copied()
    }

    /// Confirms `capability`, querying the device on first use.
    ///
    /// # Errors
    ///
    /// - `CapabilityUnsupported` when the device reports the flag as false
    /// - `HardwareCommandFailed` when the query itself fails (nothing is cached)
    pub async fn require<D: CameraDevice + ?Sized>(
        &mut self,
        device: &D,
        capability: Capability,
    ) -> Result<(), AcquisitionError> {
        let supported = match self.cached(capability) {
            Some(flag) => flag,
            None => {
                let flag = device.query_capability(capability).await?;
                tracing::debug!(%capability, supported = flag, "Capability queried");
                self.cache.insert(capability, flag);
                flag
            }
        };

        if supported {
            Ok(())
        } else {
            Err(AcquisitionError::CapabilityUnsupported {
                capability,
                hint: operator_hint(capability),
            })
        }
    }
}
