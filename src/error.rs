//! Error types for script runtime operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during script operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed registration request from script code.
    #[error("invalid {kind} spec: {reason}")]
    InvalidSpec {
        /// Capability kind (command, listener, timer).
        kind: &'static str,
        /// What was wrong with the request.
        reason: String,
    },

    /// The host adapter refused or failed a registration.
    #[error("host failed to register {kind} '{key}': {reason}")]
    HostRegistrationFailed {
        /// Capability kind.
        kind: &'static str,
        /// Logical key the script asked for.
        key: String,
        /// Host-provided reason.
        reason: String,
    },

    /// Script source failed to parse or run.
    #[error("script {script} failed to evaluate: {message}")]
    Evaluation {
        /// Script name.
        script: String,
        /// Engine error message.
        message: String,
    },

    /// Script with the same name is already tracked.
    #[error("script already exists: {0}")]
    ScriptAlreadyExists(String),

    /// Operation not valid in the current state.
    #[error("invalid script state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// File extension is not in the configured allow-list.
    #[error("invalid script extension: {0}")]
    InvalidExtension(String),

    /// Backing file does not exist.
    #[error("script file does not exist: {}", .0.display())]
    ScriptFileMissing(PathBuf),

    /// Registration arrived after the registry was closed.
    #[error("{0} registry is closed")]
    RegistryClosed(&'static str),

    /// Execution context has been torn down.
    #[error("execution context is closed")]
    ContextClosed,

    /// A lifecycle hook raised.
    #[error("script {script} hook {hook} failed: {message}")]
    Hook {
        /// Script name.
        script: String,
        /// Hook name.
        hook: &'static str,
        /// Engine error message.
        message: String,
    },

    /// Host adapter error outside of registration.
    #[error("host error: {0}")]
    Host(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Create an invalid spec error.
    pub fn invalid_spec(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            kind,
            reason: reason.into(),
        }
    }

    /// Create a host registration failure.
    pub fn host_registration(
        kind: &'static str,
        key: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::HostRegistrationFailed {
            kind,
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an evaluation error.
    pub fn evaluation(script: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Evaluation {
            script: script.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a host error.
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Returns true if the error is confined to a single request and the
    /// script that caused it can keep running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpec { .. }
                | Self::HostRegistrationFailed { .. }
                | Self::ScriptAlreadyExists(_)
                | Self::RegistryClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ScriptAlreadyExists("foo.rhai".to_string());
        assert_eq!(err.to_string(), "script already exists: foo.rhai");

        let err = Error::host_registration("command", "x", "table locked");
        assert!(err.to_string().contains("'x'"));
        assert!(err.to_string().contains("table locked"));

        let err = Error::ScriptFileMissing(PathBuf::from("/scripts/gone.rhai"));
        assert!(err.to_string().contains("gone.rhai"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::invalid_spec("timer", "negative delay").is_recoverable());
        assert!(Error::RegistryClosed("command").is_recoverable());
        assert!(!Error::evaluation("a.rhai", "syntax").is_recoverable());
        assert!(!Error::ContextClosed.is_recoverable());
    }
}
