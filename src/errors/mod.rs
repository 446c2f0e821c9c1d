//! # Structured Error Codes
//!
//! Every error the daemon can report carries a stable code so operators,
//! CI jobs and dashboards can act on it without parsing messages.
//!
//! ## Categories
//!
//! | Range | Category      | Meaning                                         |
//! |-------|---------------|-------------------------------------------------|
//! | E1xxx | Configuration | Malformed config, definitions or validators     |
//! | E2xxx | Transport     | Response fetch or subprocess launch failed      |
//! | E3xxx | Validation    | A rule did not hold, or a validator misbehaved  |
//! | E4xxx | Lifecycle     | Daemon markers, already running, not running    |
//! | E5xxx | Internal      | Bugs, serialization and storage problems        |
//!
//! Configuration and lifecycle errors propagate to the caller. Transport and
//! validation errors never escape the pipeline: they are recorded as failed
//! results inside a Report.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// ERROR CODE
// ============================================================================

/// Four digit error code; the first digit is the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: configuration
    pub const CONFIG_READ: Self = Self(1001);
    pub const CONFIG_PARSE: Self = Self(1002);
    pub const EXTERNAL_VALIDATOR_PARSE: Self = Self(1003);
    pub const DEFINITION_READ: Self = Self(1004);
    pub const DEFINITION_PARSE: Self = Self(1005);
    pub const DEFINITION_INVALID: Self = Self(1006);

    // E2xxx: transport
    pub const FETCH_FAILED: Self = Self(2001);
    pub const FETCH_TIMEOUT: Self = Self(2002);
    pub const INVALID_REQUEST: Self = Self(2003);
    pub const VALIDATOR_LAUNCH: Self = Self(2004);

    // E3xxx: validation
    pub const VALIDATION_FAILED: Self = Self(3001);
    pub const VALIDATOR_UNEXPECTED_EXIT: Self = Self(3002);
    pub const VALIDATOR_TIMEOUT: Self = Self(3003);
    pub const FIELD_NOT_FOUND: Self = Self(3004);

    // E4xxx: lifecycle
    pub const DAEMON_ALREADY_RUNNING: Self = Self(4001);
    pub const DAEMON_NOT_RUNNING: Self = Self(4002);
    pub const DAEMON_MARKER_IO: Self = Self(4003);
    pub const DAEMON_SIGNAL: Self = Self(4004);
    pub const DAEMON_SPAWN: Self = Self(4005);

    // E5xxx: internal
    pub const INTERNAL_ERROR: Self = Self(5001);
    pub const SERIALIZATION_ERROR: Self = Self(5002);
    pub const STORE_IO: Self = Self(5003);

    /// Code with the `E` prefix, e.g. `E3002`.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Transport,
            3 => ErrorCategory::Validation,
            4 => ErrorCategory::Lifecycle,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Transport,
    Validation,
    Lifecycle,
    Internal,
    Unknown,
}

impl ErrorCategory {
    /// Process exit code used by the CLI for an error of this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::Lifecycle => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Validation => write!(f, "validation"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

/// Problems found in a single endpoint definition or validator definition.
///
/// Load-time validation collects all of them before giving up.
#[derive(Debug, Error, PartialEq)]
pub enum DefinitionError {
    #[error("endpoint definition #{index} has an empty name")]
    EmptyEndpointName { index: usize },

    #[error("endpoint '{name}' is defined more than once")]
    DuplicateEndpoint { name: String },

    #[error("endpoint '{endpoint}': invalid HTTP method '{method}'")]
    InvalidHttpMethod { endpoint: String, method: String },

    #[error("endpoint '{endpoint}': request url is empty")]
    EmptyUrl { endpoint: String },

    #[error("endpoint '{endpoint}', test case #{index}: {reason}")]
    InvalidTestCase {
        endpoint: String,
        index: usize,
        reason: String,
    },

    #[error("endpoint '{endpoint}', test case #{index}: unknown external validator '{validator}'")]
    UnknownValidator {
        endpoint: String,
        index: usize,
        validator: String,
    },

    #[error("endpoint '{endpoint}': response schema does not compile: {reason}")]
    InvalidSchema { endpoint: String, reason: String },

    #[error("external validator '{name}' is defined more than once")]
    DuplicateValidator { name: String },

    #[error("external validator '{name}' has an empty path")]
    EmptyValidatorPath { name: String },
}

/// Errors raised while loading configuration; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot parse external validators: {0}")]
    ExternalValidatorParse(String),

    #[error("cannot read definitions from {path:?}: {source}")]
    DefinitionRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse definition {path:?}: {source}")]
    DefinitionParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} invalid definition(s): {}", .0.len(), join_errors(.0))]
    InvalidDefinitions(Vec<DefinitionError>),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::CONFIG_READ,
            Self::Parse { .. } => ErrorCode::CONFIG_PARSE,
            Self::ExternalValidatorParse(_) => ErrorCode::EXTERNAL_VALIDATOR_PARSE,
            Self::DefinitionRead { .. } => ErrorCode::DEFINITION_READ,
            Self::DefinitionParse { .. } => ErrorCode::DEFINITION_PARSE,
            Self::InvalidDefinitions(_) => ErrorCode::DEFINITION_INVALID,
        }
    }
}

fn join_errors(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Failure to obtain a live response for an endpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::INVALID_REQUEST,
            Self::Timeout { .. } => ErrorCode::FETCH_TIMEOUT,
            Self::Transport { .. } => ErrorCode::FETCH_FAILED,
        }
    }
}

// ============================================================================
// VALIDATOR ERRORS
// ============================================================================

/// Verdict of a failing validator.
///
/// `Failed` is the normal "the rule did not hold" outcome. The other
/// variants mean the validator itself is broken, and their messages are
/// shaped so operators can tell the two apart.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validation failed: {0}")]
    Failed(String),

    #[error("validation failed: field '{0}' not found in response")]
    FieldNotFound(String),

    #[error("validation failed: unexpected exit code from external validator: {0}")]
    UnexpectedExitCode(i32),

    #[error("validation failed: external validator terminated without exit code")]
    Terminated,

    #[error("validation failed: external validator timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("cannot execute external validator {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize validation item: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ValidatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed(_) => ErrorCode::VALIDATION_FAILED,
            Self::FieldNotFound(_) => ErrorCode::FIELD_NOT_FOUND,
            Self::UnexpectedExitCode(_) | Self::Terminated => {
                ErrorCode::VALIDATOR_UNEXPECTED_EXIT
            }
            Self::Timeout(_) => ErrorCode::VALIDATOR_TIMEOUT,
            Self::Launch { .. } => ErrorCode::VALIDATOR_LAUNCH,
            Self::Serialize(_) => ErrorCode::SERIALIZATION_ERROR,
        }
    }
}

// ============================================================================
// LIFECYCLE / STORE ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("daemon is already running (pid {pid:?}); use --force to clear stale state")]
    AlreadyRunning { pid: Option<u32> },

    #[error("daemon is not running")]
    NotRunning,

    #[error("cannot access daemon marker {path:?}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot signal daemon process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("cannot start background daemon: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("background daemon exited during startup (exit code {code:?}), see {log:?}")]
    BackgroundExited { code: Option<i32>, log: PathBuf },
}

impl LifecycleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyRunning { .. } => ErrorCode::DAEMON_ALREADY_RUNNING,
            Self::NotRunning => ErrorCode::DAEMON_NOT_RUNNING,
            Self::Marker { .. } => ErrorCode::DAEMON_MARKER_IO,
            Self::Signal { .. } => ErrorCode::DAEMON_SIGNAL,
            Self::Spawn(_) | Self::BackgroundExited { .. } => ErrorCode::DAEMON_SPAWN,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access report store {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::STORE_IO,
            Self::Serialize(_) => ErrorCode::SERIALIZATION_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::CONFIG_READ.formatted(), "E1001");
        assert_eq!(ErrorCode::FETCH_FAILED.formatted(), "E2001");
        assert_eq!(ErrorCode::VALIDATOR_UNEXPECTED_EXIT.to_string(), "E3002");
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::EXTERNAL_VALIDATOR_PARSE.category(), ErrorCategory::Configuration);
        assert_eq!(ErrorCode::VALIDATOR_LAUNCH.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::VALIDATION_FAILED.category(), ErrorCategory::Validation);
        assert_eq!(ErrorCode::DAEMON_ALREADY_RUNNING.category(), ErrorCategory::Lifecycle);
        assert_eq!(ErrorCode::STORE_IO.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_validator_error_messages_distinguish_malfunction() {
        let failed = ValidatorError::Failed("field X missing".to_string());
        let broken = ValidatorError::UnexpectedExitCode(2);

        assert_eq!(failed.to_string(), "validation failed: field X missing");
        assert!(broken.to_string().contains("unexpected exit code"));
        assert!(broken.to_string().ends_with('2'));
        assert_ne!(failed.code(), broken.code());
    }

    #[test]
    fn test_invalid_definitions_lists_every_problem() {
        let err = ConfigError::InvalidDefinitions(vec![
            DefinitionError::EmptyUrl { endpoint: "a".to_string() },
            DefinitionError::DuplicateEndpoint { name: "b".to_string() },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 invalid definition(s)"));
        assert!(msg.contains("'a'"));
        assert!(msg.contains("'b'"));
        assert_eq!(err.code().category().exit_code(), 2);
    }
}
