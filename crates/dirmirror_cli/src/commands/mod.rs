//! CLI command implementations.

pub mod mirror;
pub mod serve;
