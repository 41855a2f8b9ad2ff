mod job;
mod state;

pub use job::{Approval, AuditRecord, Decision, Job};
pub use state::{JobStatus, StateMachine, StateTransition, Transition};
