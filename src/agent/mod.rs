//! Workflow engine: thread state, checkpoints and the node driver.

mod approval;
pub mod checkpoint;
pub mod engine;
pub mod thread;

pub use checkpoint::{CheckpointManager, ThreadLock};
pub use engine::{NOTIFY_ACTION, PendingThread, WorkflowEngine};
pub use thread::{
    ActionConfig, ActionRequest, Decision, DecisionType, Node, Outcome, ThreadStatus,
    WorkflowThread,
};
