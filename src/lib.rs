//! Overseer: a dispatch orchestration engine for automated implement-and-
//! verify workflows.
//!
//! An external trigger registers a dispatch for an assigned issue; the
//! [`pipeline::Orchestrator`] walks it through worker and audit runs against
//! a crash-safe, file-backed [`state::StateStore`], with compare-and-swap
//! transitions, an idempotency ledger for at-least-once completion events,
//! and bounded rework before escalating to a human.
//!
//! The pieces that talk to the outside world — executing a run, the issue
//! tracker, notification delivery — are collaborator traits ([`runner`],
//! [`tracker`], [`notify`]) implemented by the embedding application.

pub mod config;
pub mod errors;
pub mod notify;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod session;
pub mod state;
pub mod tracker;
pub mod transition;

pub use config::OverseerConfig;
pub use errors::{PipelineError, StoreError, TransitionError};
pub use pipeline::{DispatchResolution, Orchestrator, Verdict};
pub use state::{Dispatch, DispatchStatus, StateStore};
