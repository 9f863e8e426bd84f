//! Adapters that bind the anneal pipelines to the real world: the git
//! checkout, the on-disk pending-request store, environment-driven
//! configuration, and subprocess plumbing.

pub mod config;
pub mod git;
pub mod store;
pub mod util;
