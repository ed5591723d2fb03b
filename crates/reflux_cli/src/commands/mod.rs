//! CLI command implementations.

pub mod reentrance;
pub mod stress;
