//! Core building blocks for the anneal self-modification pipeline.
//!
//! This crate holds the pieces that do not talk to the outside world:
//! the search/replace patch engine, path confinement, the approval
//! request model, and the traits the pipelines use to reach their
//! collaborators (chat transport, version control, skill registry,
//! code model).

pub mod patch;
pub mod paths;
pub mod ports;
pub mod request;
pub mod skills;
