//! The three-stage workflow: Select, Plan, Present.
//!
//! A run is a linear state machine driven by [`WorkflowCoordinator`]. Stages
//! communicate only through the shared [`WorkflowContext`]: before each stage
//! its instruction text is re-rendered from a fresh [`ContextSnapshot`], and
//! its validated [`StageOutput`] is merged back before the next stage starts.

pub mod context;
pub mod coordinator;
pub mod prompts;
pub mod stage;

pub use context::{keys, ContextSnapshot, SharedContext, WorkflowContext};
pub use coordinator::{
    Degradation, RunInputs, StageFailure, StageRun, Transition, WorkflowCoordinator, WorkflowReport,
};
pub use stage::{response_format, StageAgent, StageOutput, StageReply};
