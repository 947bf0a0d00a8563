//! Error taxonomy for the host control port

use std::time::Duration;
use thiserror::Error;

/// Failures of the external control actions (wake, suspend, discovery).
///
/// Probe failures are deliberately absent: a probe that errors reports the
/// host as down (`false`) and is never surfaced as an error.
///
/// Clone because a stop result fans out to every caller that converged on
/// the same in-flight attempt.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// The wake packet could not be sent
    #[error("failed to send wake packet: {0}")]
    Wake(String),

    /// The remote suspend command failed or could not be launched
    #[error("suspend command failed: {0}")]
    Suspend(String),

    /// The remote suspend command did not finish within its execution timeout
    #[error("suspend command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Service discovery transport failure (the host may simply be off)
    #[error("service discovery failed: {0}")]
    Discovery(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_timeout_message() {
        let err = ControlError::CommandTimeout(Duration::from_millis(1500));
        assert!(err.to_string().contains("1.5s"));
    }

    #[test]
    fn test_suspend_message() {
        let err = ControlError::Suspend("exit status 255".to_string());
        assert_eq!(
            err.to_string(),
            "suspend command failed: exit status 255"
        );
    }
}
