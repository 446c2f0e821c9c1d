//! # Load-time Definition Validation
//!
//! Checks endpoint and validator definitions before anything runs, so a bad
//! definition stops startup instead of producing confusing failures in every
//! report.
//!
//! All problems are collected, not just the first one:
//!
//! 1. Endpoint names are present and unique
//! 2. HTTP methods are known, URLs are not empty
//! 3. Every test case is either a check (`field` + `operator`) or a
//!    `validator` reference, never both or neither
//! 4. Field selectors parse, `matches` patterns compile, timestamp
//!    expectations are RFC3339
//! 5. Referenced external validators exist
//! 6. Response schemas compile
//! 7. External validator names are unique and their paths non-empty

use std::collections::HashSet;

use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;

use crate::comparer::{parse_timestamp, Operator, ValueKind};
use crate::errors::DefinitionError;
use crate::protocol::{EndpointDefinition, TestCase, ValidatorDefinition};
use crate::selector::Selector;

/// Methods accepted in request templates.
const VALID_HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

pub type ValidationResult = Result<(), Vec<DefinitionError>>;

pub fn validate_definitions(
    definitions: &[EndpointDefinition],
    validators: &[ValidatorDefinition],
) -> ValidationResult {
    let mut errors = Vec::new();

    let mut validator_names = HashSet::new();
    for validator in validators {
        if !validator_names.insert(validator.name.as_str()) {
            errors.push(DefinitionError::DuplicateValidator {
                name: validator.name.clone(),
            });
        }
        if validator.path.trim().is_empty() {
            errors.push(DefinitionError::EmptyValidatorPath {
                name: validator.name.clone(),
            });
        }
    }

    let mut endpoint_names = HashSet::new();
    for (index, definition) in definitions.iter().enumerate() {
        if definition.name.trim().is_empty() {
            errors.push(DefinitionError::EmptyEndpointName { index });
        } else if !endpoint_names.insert(definition.name.as_str()) {
            errors.push(DefinitionError::DuplicateEndpoint {
                name: definition.name.clone(),
            });
        }
        errors.extend(validate_definition(definition, &validator_names));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_definition(
    definition: &EndpointDefinition,
    validator_names: &HashSet<&str>,
) -> Vec<DefinitionError> {
    let mut errors = Vec::new();
    let endpoint = definition.name.clone();

    let method = definition.request.method.to_uppercase();
    if !VALID_HTTP_METHODS.contains(&method.as_str()) {
        errors.push(DefinitionError::InvalidHttpMethod {
            endpoint: endpoint.clone(),
            method: definition.request.method.clone(),
        });
    }

    if definition.request.url.trim().is_empty() {
        errors.push(DefinitionError::EmptyUrl {
            endpoint: endpoint.clone(),
        });
    }

    if let Some(schema) = &definition.response_schema {
        if let Err(e) = JSONSchema::compile(schema) {
            errors.push(DefinitionError::InvalidSchema {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            });
        }
    }

    for (index, test_case) in definition.test_cases.iter().enumerate() {
        if let Some(validator) = &test_case.validator {
            if test_case.operator.is_some() || test_case.field.is_some() {
                errors.push(invalid(
                    &endpoint,
                    index,
                    "a test case cannot have both a validator and a field/operator",
                ));
            } else if !validator_names.contains(validator.as_str()) {
                errors.push(DefinitionError::UnknownValidator {
                    endpoint: endpoint.clone(),
                    index,
                    validator: validator.clone(),
                });
            }
            continue;
        }

        if let Err(reason) = validate_check(test_case) {
            errors.push(invalid(&endpoint, index, &reason));
        }
    }

    errors
}

/// Validates a built-in check test case.
fn validate_check(test_case: &TestCase) -> Result<(), String> {
    let (Some(field), Some(operator)) = (&test_case.field, test_case.operator) else {
        return Err("a test case needs either 'validator' or both 'field' and 'operator'".to_string());
    };

    Selector::parse(field)?;

    if operator == Operator::Matches {
        let pattern = test_case
            .expected
            .as_str()
            .ok_or_else(|| "'matches' expects a string pattern".to_string())?;
        Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
    }

    if test_case.kind == ValueKind::Timestamp && !is_timestamp_expectation(&test_case.expected) {
        return Err(format!(
            "expected value {} is not an RFC3339 timestamp",
            test_case.expected
        ));
    }

    Ok(())
}

fn is_timestamp_expectation(value: &Value) -> bool {
    match value {
        Value::String(s) => parse_timestamp(s).is_some(),
        _ => false,
    }
}

fn invalid(endpoint: &str, index: usize, reason: &str) -> DefinitionError {
    DefinitionError::InvalidTestCase {
        endpoint: endpoint.to_string(),
        index,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> EndpointDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn validator(name: &str, path: &str) -> ValidatorDefinition {
        ValidatorDefinition {
            name: name.to_string(),
            path: path.to_string(),
            args: vec![],
            fatal: false,
            slim: false,
            endpoints: vec![],
        }
    }

    #[test]
    fn test_valid_definition() {
        let def = definition(json!({
            "name": "users",
            "request": { "method": "post", "url": "http://localhost/users" },
            "response_schema": { "type": "object" },
            "test_cases": [
                { "field": "status", "operator": "eq", "expected": 200 },
                { "field": "$.items[*].name", "operator": "matches", "expected": "^[a-z]+$" },
                { "field": "$.updated", "operator": "gt", "expected": "2024-01-01T00:00:00Z",
                  "kind": "timestamp" },
                { "validator": "lint", "fatal": true }
            ]
        }));
        assert!(validate_definitions(&[def], &[validator("lint", "/bin/lint")]).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let defs = vec![
            definition(json!({
                "name": "users",
                "request": { "method": "FETCH", "url": "" },
                "test_cases": [
                    { "field": "status" },
                    { "field": "status", "operator": "eq", "validator": "lint" },
                    { "validator": "ghost" },
                    { "field": "$.name", "operator": "matches", "expected": "(" },
                    { "field": "$.ts", "operator": "lt", "expected": "yesterday", "kind": "timestamp" },
                    { "field": "$.items[x]", "operator": "eq", "expected": 1 }
                ]
            })),
            definition(json!({ "name": "users", "request": { "url": "http://x" } })),
            definition(json!({ "name": " ", "request": { "url": "http://x" } })),
        ];
        let validators = vec![validator("lint", "/bin/lint"), validator("lint", "")];

        let errors = validate_definitions(&defs, &validators).unwrap_err();

        assert!(errors.contains(&DefinitionError::DuplicateValidator { name: "lint".to_string() }));
        assert!(errors.contains(&DefinitionError::EmptyValidatorPath { name: "lint".to_string() }));
        assert!(errors.contains(&DefinitionError::DuplicateEndpoint { name: "users".to_string() }));
        assert!(errors.contains(&DefinitionError::EmptyEndpointName { index: 2 }));
        assert!(errors.contains(&DefinitionError::InvalidHttpMethod {
            endpoint: "users".to_string(),
            method: "FETCH".to_string()
        }));
        assert!(errors.contains(&DefinitionError::EmptyUrl { endpoint: "users".to_string() }));
        assert!(errors.contains(&DefinitionError::UnknownValidator {
            endpoint: "users".to_string(),
            index: 2,
            validator: "ghost".to_string()
        }));
        let invalid_cases: Vec<usize> = errors
            .iter()
            .filter_map(|e| match e {
                DefinitionError::InvalidTestCase { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(invalid_cases, vec![0, 1, 3, 4, 5]);
    }

    #[test]
    fn test_invalid_schema() {
        let def = definition(json!({
            "name": "users",
            "request": { "url": "http://x" },
            "response_schema": { "type": 12 }
        }));
        let errors = validate_definitions(&[def], &[]).unwrap_err();
        assert!(matches!(errors[0], DefinitionError::InvalidSchema { .. }));
    }
}
