//! Error kinds shared across the workspace.
//!
//! Every module boundary converts its lower-level errors into one of these
//! five kinds before the error crosses a public API, per the propagation
//! policy: transient errors are retried below this layer and should rarely
//! surface here; the rest are user- or operator-facing classifications.

use thiserror::Error;

/// Classified error surfaced by a core component.
#[derive(Error, Debug)]
pub enum NanobotError {
    /// Retriable failure (network blip, lock contention). Should usually be
    /// retried by the caller before it ever reaches this variant.
    #[error("transient error: {0}")]
    Transient(String),

    /// Bad input: malformed tool args, invalid config. Never mutates
    /// persisted state.
    #[error("validation error: {0}")]
    Validation(String),

    /// A configured limit was hit (subagent cap, full queue, busy registry).
    #[error("resource limit: {0}")]
    Resource(String),

    /// An external dependency (LLM provider, tool executor) failed.
    #[error("external failure: {0}")]
    External(String),

    /// Unrecoverable: corrupt on-disk state the operator must address. The
    /// process keeps running in a degraded mode rather than crashing.
    #[error("fatal error: {0}")]
    Fatal(String),
}

pub type NanobotResult<T> = Result<T, NanobotError>;

impl NanobotError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_variants() {
        assert!(NanobotError::transient("x").to_string().starts_with("transient"));
        assert!(NanobotError::validation("x").to_string().starts_with("validation"));
        assert!(NanobotError::resource("x").to_string().starts_with("resource"));
        assert!(NanobotError::external("x").to_string().starts_with("external"));
        assert!(NanobotError::fatal("x").to_string().starts_with("fatal"));
    }
}
