//! Model access: the OpenRouter HTTP client and the proposal parser.

pub mod client;
pub mod parse;

pub use client::HttpModel;
pub use parse::{parse_proposal, ChangeProposal};
