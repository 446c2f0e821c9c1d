//! # External Validators
//!
//! Runs a configured executable once per response:
//!
//! - stdin receives the validation item as one JSON document, either the
//!   slim view (`{"response": ...}`) or the extended one (`{"response": ...,
//!   "definition": ...}`), then EOF
//! - exit code 0 passes, 1 fails with stderr as the message, anything else
//!   means the validator itself is broken
//! - stdout and stderr are logged at debug level
//!
//! With a timeout configured the child is killed when it overruns.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::ValidatorError;
use crate::protocol::{ValidationItem, ValidatorDefinition};

use super::Validator;

pub struct ExternalValidator {
    definition: ValidatorDefinition,
    fatal: bool,
    timeout: Option<Duration>,
}

impl ExternalValidator {
    pub fn new(definition: ValidatorDefinition) -> Self {
        let fatal = definition.fatal;
        Self {
            definition,
            fatal,
            timeout: None,
        }
    }

    /// Overrides the configured fatal flag, used when a test case references
    /// the validator.
    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(&self, item: &ValidationItem<'_>) -> Result<Vec<u8>, ValidatorError> {
        let bytes = if self.definition.slim {
            serde_json::to_vec(&item.slim())?
        } else {
            serde_json::to_vec(&item.extended())?
        };
        Ok(bytes)
    }
}

#[async_trait]
impl Validator for ExternalValidator {
    fn name(&self) -> String {
        format!("external.{}", self.definition.name)
    }

    async fn validate(&self, item: &ValidationItem<'_>) -> Result<(), ValidatorError> {
        let name = self.name();
        let payload = self.payload(item)?;

        let mut child = Command::new(&self.definition.path)
            .args(&self.definition.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ValidatorError::Launch {
                path: PathBuf::from(&self.definition.path),
                source,
            })?;

        // Feed stdin from its own task so a chatty child cannot deadlock
        // against a full stdout pipe.
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                // Dropping the child future kills the process.
                Err(_) => {
                    debug!(validator = %name, timeout_secs = limit.as_secs(), "validator timed out");
                    return Err(ValidatorError::Timeout(limit));
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| ValidatorError::Launch {
            path: PathBuf::from(&self.definition.path),
            source,
        })?;

        match writer.await {
            Ok(Err(e)) if e.kind() != ErrorKind::BrokenPipe => {
                debug!(validator = %name, error = %e, "cannot write validation item to stdin");
            }
            _ => {}
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(validator = %name, output = %stdout, "validator output");
        debug!(validator = %name, error = %stderr, "validator error");

        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => Err(ValidatorError::Failed(stderr.trim_end().to_string())),
            Some(code) => Err(ValidatorError::UnexpectedExitCode(code)),
            None => Err(ValidatorError::Terminated),
        }
    }

    fn is_fatal(&self) -> bool {
        self.fatal
    }

    fn is_slim(&self) -> bool {
        self.definition.slim
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{CapturedResponse, EndpointDefinition};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn shell(name: &str, script: &str, slim: bool) -> ExternalValidator {
        ExternalValidator::new(ValidatorDefinition {
            name: name.to_string(),
            path: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            fatal: true,
            slim,
            endpoints: vec![],
        })
    }

    fn fixtures() -> (CapturedResponse, EndpointDefinition) {
        let response = CapturedResponse {
            url: "http://localhost/users".to_string(),
            status: 200,
            headers: BTreeMap::new(),
            body: json!({ "users": ["ada"] }),
            elapsed_ms: 3,
        };
        let definition = serde_json::from_value(json!({
            "name": "users",
            "request": { "url": "http://localhost/users" }
        }))
        .unwrap();
        (response, definition)
    }

    async fn run(validator: &ExternalValidator) -> Result<(), ValidatorError> {
        let (response, definition) = fixtures();
        validator
            .validate(&ValidationItem::new(&response, &definition))
            .await
    }

    #[tokio::test]
    async fn test_exit_zero_passes() {
        let validator = shell("ok", "cat > /dev/null; exit 0", false);
        assert!(run(&validator).await.is_ok());
        assert_eq!(validator.name(), "external.ok");
        assert!(validator.is_fatal());
    }

    #[tokio::test]
    async fn test_exit_one_uses_stderr() {
        let validator = shell("lint", "cat > /dev/null; echo 'field X missing' >&2; exit 1", false);
        let err = run(&validator).await.unwrap_err();
        assert_eq!(err.to_string(), "validation failed: field X missing");
    }

    #[tokio::test]
    async fn test_other_exit_code_is_malfunction() {
        let validator = shell("broken", "exit 3", false);
        let err = run(&validator).await.unwrap_err();
        assert!(matches!(err, ValidatorError::UnexpectedExitCode(3)));
        assert!(err
            .to_string()
            .contains("unexpected exit code from external validator: 3"));
    }

    #[tokio::test]
    async fn test_slim_payload_has_no_definition() {
        // Fails unless stdin carries a response and no definition.
        let script = r#"input=$(cat); case "$input" in *'"definition"'*) exit 1;; *'"response"'*) exit 0;; *) exit 2;; esac"#;
        assert!(run(&shell("slim", script, true)).await.is_ok());

        let err = run(&shell("full", script, false)).await.unwrap_err();
        assert!(matches!(err, ValidatorError::Failed(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let validator = shell("slow", "sleep 5", false).with_timeout(Some(Duration::from_millis(200)));
        let err = run(&validator).await.unwrap_err();
        assert!(matches!(err, ValidatorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let validator = ExternalValidator::new(ValidatorDefinition {
            name: "ghost".to_string(),
            path: "/nonexistent/validator".to_string(),
            args: vec![],
            fatal: false,
            slim: false,
            endpoints: vec![],
        });
        let err = run(&validator).await.unwrap_err();
        assert!(matches!(err, ValidatorError::Launch { .. }));
        assert!(!validator.is_fatal());
    }
}
