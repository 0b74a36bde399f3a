//! Mail triage: batch classification of a mailbox plus per-label agents.

pub mod agent;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod mailbox;
pub mod notify;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;
