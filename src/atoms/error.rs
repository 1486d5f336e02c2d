// ── Driftlab Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (Config, State, Gateway…).
//   • Configuration and state errors are surfaced synchronously at the
//     control surface as structured {code, message} pairs.
//   • Gateway errors are recovered locally (retry → fallback sentinel) and
//     only reach callers when the degradation itself must be reported.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Experiment configuration is invalid. Rejected at `start`; the
    /// experiment is never created.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A state-machine transition was requested from an incompatible state.
    /// No state change occurs.
    #[error("State error: cannot {action} an experiment in state {state}")]
    State { action: String, state: String },

    /// No experiment with the given uuid is known to the supervisor.
    #[error("Unknown experiment: {0}")]
    NotFound(String),

    /// The chat or embedding endpoint is unreachable or returned a
    /// non-retryable error after retries were exhausted.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// A gateway call exceeded its time budget.
    #[error("Model timeout after {0} ms")]
    ModelTimeout(u64),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or OS-level I/O failure (export paths).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure. Transitions the owning experiment to
    /// `failed` and preserves its state for inspection.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a state error from an attempted action and the current state.
    pub fn state(action: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::State {
            action: action.into(),
            state: state.to_string(),
        }
    }

    /// Stable machine-readable code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config_error",
            EngineError::State { .. } => "state_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::ModelUnavailable(_) => "model_unavailable",
            EngineError::ModelTimeout(_) => "model_timeout",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Io(_) => "io_error",
            EngineError::Internal(_) => "internal_error",
        }
    }

    /// CLI process exit code per the front-end contract:
    /// 1 configuration, 2 gateway unavailable, 3 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) | EngineError::State { .. } | EngineError::NotFound(_) => 1,
            EngineError::ModelUnavailable(_) | EngineError::ModelTimeout(_) => 2,
            _ => 3,
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_message() {
        let e = EngineError::state("pause", "completed");
        assert_eq!(
            e.to_string(),
            "State error: cannot pause an experiment in state completed"
        );
        assert_eq!(e.code(), "state_error");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::Config("bad".into()).exit_code(), 1);
        assert_eq!(EngineError::ModelUnavailable("down".into()).exit_code(), 2);
        assert_eq!(EngineError::Internal("boom".into()).exit_code(), 3);
    }
}
