//! Triage pipeline.
//!
//! Every run flows through:
//! 1. Mailbox search for unlabeled active threads
//! 2. `Classifier::classify()` in fixed-size batches, with fallback labels
//!    for anything the model gets wrong
//! 3. `Dispatcher` label commit and agent hooks
//!
//! Dry-run mode performs steps 1 and 2 for real and only simulates step 3.

pub mod classifier;
pub mod run;
pub mod types;

pub use classifier::Classifier;
pub use run::{RunReport, TriageRunner, spawn_periodic};
