//! Failure classes surfaced by the build.
//!
//! Everything travels as `anyhow::Error`; these variants are wrapped inside
//! so callers can tell a missing input from a broken tool or a corrupt image
//! with `err.downcast_ref::<BuildError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// A required upstream input is missing. Raised before any tool runs.
    #[error("missing prerequisite: {0}")]
    Precondition(String),

    /// An external program exited non-zero (or could not be started).
    #[error("`{command}` failed ({status}){}", detail_suffix(.detail))]
    ToolFailed {
        command: String,
        status: String,
        detail: String,
    },

    /// The produced artifact does not match what the build computed.
    #[error("integrity check failed: {0}")]
    Integrity(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}
