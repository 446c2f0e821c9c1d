// Module: Protocol
// Data model shared by the loader, the pipeline, the store and external validators.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::comparer::{Operator, ValueKind};

// ============================================================================
// CONFIGURATION-SIDE TYPES
// ============================================================================

/// One probed endpoint: how to call it and what to expect back.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndpointDefinition {
    pub name: String,
    pub request: RequestTemplate,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A single expectation on a response.
///
/// Either `field` + `operator` + `expected` (built-in check) or `validator`
/// (reference to a configured external validator).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    #[serde(default)]
    pub fatal: bool,
}

impl TestCase {
    /// Display name used in results.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(validator) = &self.validator {
            return validator.clone();
        }
        let field = self.field.as_deref().unwrap_or("?");
        let operator = self
            .operator
            .map(|op| op.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!("{} {} {}", field, operator, self.expected)
    }
}

/// Configuration of one external validator executable.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ValidatorDefinition {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    /// A failure stops further validators for the endpoint.
    pub fatal: bool,
    /// Send only the response, not the endpoint definition.
    pub slim: bool,
    /// Endpoint names this validator applies to; empty means all.
    pub endpoints: Vec<String>,
}

impl ValidatorDefinition {
    pub fn applies_to(&self, endpoint: &str) -> bool {
        self.endpoints.is_empty() || self.endpoints.iter().any(|e| e == endpoint)
    }
}

// ============================================================================
// RUNTIME TYPES
// ============================================================================

/// A live HTTP response captured for validation.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CapturedResponse {
    pub url: String,
    pub status: u16,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when possible, otherwise the raw text as a string.
    pub body: Value,
    pub elapsed_ms: u64,
}

/// The unit handed to validators: a response and the definition it came from.
#[derive(Debug, Clone)]
pub struct ValidationItem<'a> {
    pub response: &'a CapturedResponse,
    pub definition: &'a EndpointDefinition,
}

impl<'a> ValidationItem<'a> {
    pub fn new(response: &'a CapturedResponse, definition: &'a EndpointDefinition) -> Self {
        Self { response, definition }
    }

    pub fn slim(&self) -> SlimValidationItem<'a> {
        SlimValidationItem { response: self.response }
    }

    pub fn extended(&self) -> ExtendedValidationItem<'a> {
        ExtendedValidationItem {
            response: self.response,
            definition: self.definition,
        }
    }
}

/// Serialized view sent to slim external validators.
#[derive(Debug, Serialize)]
pub struct SlimValidationItem<'a> {
    pub response: &'a CapturedResponse,
}

/// Serialized view sent to regular external validators.
#[derive(Debug, Serialize)]
pub struct ExtendedValidationItem<'a> {
    pub response: &'a CapturedResponse,
    pub definition: &'a EndpointDefinition,
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
}

impl Status {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Self::Passed
        } else {
            Self::Failed
        }
    }

    pub fn is_passed(&self) -> bool {
        *self == Self::Passed
    }
}

/// Outcome of one test case or validator against one response.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TestCaseResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub fatal: bool,
}

impl TestCaseResult {
    pub fn pass(name: impl Into<String>, fatal: bool) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
            fatal,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
            fatal,
        }
    }
}

/// One endpoint's outcome for one run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ValidatedEndpoint {
    pub endpoint_name: String,
    pub status: Status,
    pub time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub results: Vec<TestCaseResult>,
}

impl ValidatedEndpoint {
    /// Status is failed as soon as any result failed, fatal or not.
    pub fn new(
        endpoint_name: impl Into<String>,
        time: DateTime<Utc>,
        elapsed_ms: u64,
        results: Vec<TestCaseResult>,
    ) -> Self {
        let status = Status::from_passed(results.iter().all(|r| r.passed));
        Self {
            endpoint_name: endpoint_name.into(),
            status,
            time,
            elapsed_ms,
            results,
        }
    }
}

/// One complete pipeline run. Immutable once built.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Report {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub status: Status,
    pub endpoints: Vec<ValidatedEndpoint>,
}

impl Report {
    pub fn new(time: DateTime<Utc>, endpoints: Vec<ValidatedEndpoint>) -> Self {
        let status = Status::from_passed(endpoints.iter().all(|e| e.status.is_passed()));
        Self {
            id: Uuid::new_v4(),
            time,
            status,
            endpoints,
        }
    }
}
