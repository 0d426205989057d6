//! Retry policy for failed exposure cycles.
//
// Downloads that complete without data are retried by downloading the held
// frame again; hardware command failures and readiness timeouts are retried
// by exposing again. Both budgets default to zero.

use crate::error::{attempt_and_discard, AcquisitionError, Recovery};
use crate::hardware::CameraDevice;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying a failed cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra exposures after a hardware failure.
    pub exposure_retries: u32,
    /// Extra downloads of the held frame after a download without data.
    pub download_retries: u32,
    /// The delay before each retry attempt.
    pub backoff_ms: u64,
    /// Re-acquire the camera handles before each retry.
    pub reinitialize_handles: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            exposure_retries: 0,
            download_retries: 0,
            backoff_ms: 500,
            reinitialize_handles: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before each retry.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Retry budget for a recovery path.
    pub fn limit(&self, recovery: Recovery) -> u32 {
        match recovery {
            Recovery::Redownload => self.download_retries,
            Recovery::Reexpose => self.exposure_retries,
            Recovery::None => 0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Try again along this path.
    Retry(Recovery),
    /// Give up and report this error.
    GiveUp(AcquisitionError),
}

/// Per-cycle bookkeeping of how much of each budget has been spent.
#[derive(Debug)]
pub struct RetryBudget<'a> {
    policy: &'a RetryPolicy,
    redownloads: u32,
    reexposures: u32,
}

impl<'a> RetryBudget<'a> {
    /// A fresh budget for one cycle.
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            redownloads: 0,
            reexposures: 0,
        }
    }

    /// Attempts made so far, the first one included.
    pub fn attempts(&self) -> u32 {
        1 + self.redownloads + self.reexposures
    }

    /// Decides whether `error` is retried.
    ///
    /// Errors on a path without a budget are handed back unchanged. A spent
    /// budget turns the error into the fatal `RetriesExhausted`.
    pub fn decide(&mut self, error: AcquisitionError) -> RetryDecision {
        let recovery = error.recovery();
        let limit = self.policy.limit(recovery);
        if limit == 0 {
            return RetryDecision::GiveUp(error);
        }

        let attempts = self.attempts();
        let used = match recovery {
            Recovery::Redownload => &mut self.redownloads,
            Recovery::Reexpose => &mut self.reexposures,
            Recovery::None => return RetryDecision::GiveUp(error),
        };
        if *used >= limit {
            return RetryDecision::GiveUp(AcquisitionError::RetriesExhausted {
                attempts,
                last: Box::new(error),
            });
        }
        *used += 1;
        tracing::warn!(
            error = %error,
            path = ?recovery,
            attempt = *used,
            limit,
            "Retrying failed exposure cycle"
        );
        RetryDecision::Retry(recovery)
    }
}

/// Waits out the backoff and optionally re-acquires the device handles.
///
/// A failed re-initialization is logged and ignored; the retried command
/// reports the problem if the device is really gone.
pub async fn prepare_retry<D: CameraDevice + ?Sized>(device: &D, policy: &RetryPolicy) {
    sleep(policy.backoff()).await;
    if policy.reinitialize_handles {
        attempt_and_discard("reinitialize", device.reinitialize().await);
    }
}
