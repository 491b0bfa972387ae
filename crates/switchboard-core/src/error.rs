//! Error taxonomy for the routing engine
//!
//! Only these four kinds cross component boundaries. Downstream transport
//! failures are converted into [`EngineError::Execution`] at the capability
//! registry; multi-intent and unclear routing are outcomes, not errors.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Capability arguments were malformed or missing. Never retried;
    /// the message is safe to show to the user.
    #[error("invalid arguments: {0}")]
    Validation(String),

    /// Handler, capability, or tenant permission is absent. The router
    /// treats this as a fall-back to an unclear-routing clarification,
    /// never a hard failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// A downstream call failed or timed out. Carries a user-safe message;
    /// identifying detail goes to the log, not the caller.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The per-request wall-clock budget was exceeded. Surfaced distinctly
    /// from `Execution` so callers can tell slow from broken.
    #[error("request exceeded budget of {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Message suitable for direct display to the end user
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::NotFound(_) => {
                "I'm not sure what you're asking about. Can you please rephrase your question?"
                    .to_string()
            }
            Self::Execution(_) => {
                "That service is temporarily unavailable. Please try again shortly.".to_string()
            }
            Self::Timeout(_) => {
                "That took longer than expected. Please try again shortly.".to_string()
            }
        }
    }
}
