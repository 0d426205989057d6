//! Exposure acquisition pipeline.
//!
//! Leaf first:
//!
//! - [`capability`]: confirms device features before they are used
//! - [`request`]: builds the immutable per-exposure request
//! - [`state_machine`]: drives one exposure through the camera protocol
//! - [`retry`]: retry budgets for failed cycles
//! - [`orchestrator`]: runs N cycles and stores the frames

pub mod capability;
pub mod orchestrator;
pub mod request;
pub mod retry;
pub mod state_machine;

pub use capability::CapabilityGate;
pub use orchestrator::{CycleMode, CycleOutcome, CyclePlan, Orchestrator, SavedFrame};
pub use request::{build_request, BinFactors, ExposureIntent, ExposureRequest, FrameKind, ReadoutMode};
pub use retry::RetryPolicy;
pub use state_machine::{ExposureResult, ExposureState, ExposureStateMachine, ReadyWait};
