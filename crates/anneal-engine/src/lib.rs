//! The anneal engine: turns approved requests into generated changes,
//! published branches, and merged or committed code.
//!
//! The [`coordinator::ApprovalCoordinator`] is the entry point; it owns
//! the pending-request tables and drives the skill and fix pipelines
//! when the operator resolves a request.

pub mod coordinator;
pub mod generate;
pub mod llm;
mod messages;
pub mod publish;
