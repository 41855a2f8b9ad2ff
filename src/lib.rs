//! Supervised job orchestration.
//!
//! A request becomes a [`Job`](state_machine::Job), the [`matcher`] picks a
//! recipe from the [`registry`] and freezes it into a [`Plan`](plan::Plan),
//! an approval gate unlocks it, and the [`executor`] runs its steps in order
//! while recording every fact in the run's [`events`] log.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod intent;
pub mod matcher;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod state_machine;
pub mod store;

pub use config::ConciergeConfig;
pub use error::{ConciergeError, Result};
pub use orchestrator::{DecisionRequest, HaltOutcome, Orchestrator};
