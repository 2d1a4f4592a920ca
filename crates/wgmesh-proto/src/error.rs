//! Control-plane error taxonomy
//!
//! Shared across the coordinator, peer and directory crates so callers
//! can match on the class of a failure regardless of which layer raised
//! it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Signature verification failed or the stream was never authenticated
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Malformed role, key, or missing required payload field
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No session, peer entry, or allocation matches the given key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Directory returned empty, or every candidate failed
    #[error("No candidate: {0}")]
    NoCandidate(String),

    /// An awaited response did not arrive in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport dial or data-plane operation could not complete
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// IP pool has no free addresses
    #[error("Exhausted: {0}")]
    Exhausted(String),

    /// The target state already holds a conflicting entry
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl ControlError {
    /// Annotate the error with the step at which it occurred
    pub fn at_step(self, step: &str) -> ControlError {
        match self {
            ControlError::Unauthenticated(m) => {
                ControlError::Unauthenticated(format!("{}: {}", step, m))
            }
            ControlError::InvalidArgument(m) => {
                ControlError::InvalidArgument(format!("{}: {}", step, m))
            }
            ControlError::NotFound(m) => ControlError::NotFound(format!("{}: {}", step, m)),
            ControlError::NoCandidate(m) => ControlError::NoCandidate(format!("{}: {}", step, m)),
            ControlError::Timeout(m) => ControlError::Timeout(format!("{}: {}", step, m)),
            ControlError::Unavailable(m) => ControlError::Unavailable(format!("{}: {}", step, m)),
            ControlError::Exhausted(m) => ControlError::Exhausted(format!("{}: {}", step, m)),
            ControlError::Conflict(m) => ControlError::Conflict(format!("{}: {}", step, m)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_annotation_preserves_class() {
        let err = ControlError::Exhausted("relay pool".to_string()).at_step("relay provisioning");
        match err {
            ControlError::Exhausted(msg) => {
                assert!(msg.contains("relay provisioning"));
                assert!(msg.contains("relay pool"));
            }
            other => panic!("unexpected error class: {:?}", other),
        }
    }
}
