//! Maintenance task implementations.

pub mod completions;
pub mod man;

/// Name of the binary the artifacts are generated for.
pub const BIN_NAME: &str = "librarian";
