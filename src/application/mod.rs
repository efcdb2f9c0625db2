//! Application layer: the content contract and error types.

pub mod content;
pub mod error;
