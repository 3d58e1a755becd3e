//! The implement-and-verify pipeline: phase orchestration and verdict
//! parsing.

pub mod orchestrator;
pub mod verdict;

pub use orchestrator::{
    AuditPhase, DispatchResolution, Orchestrator, VerdictOutcome, WorkerPhase,
};
pub use verdict::{Verdict, extract_output_text, parse_verdict};
