// Module: Validators
// A validator renders a pass/fail verdict for one response. Built-in
// validators evaluate a test case with the comparer; external validators
// delegate the decision to an executable (see `external`).

pub mod builtin;
pub mod external;
pub mod schema;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ValidatorError;
use crate::protocol::{EndpointDefinition, ValidationItem, ValidatorDefinition};

pub use builtin::BuiltinValidator;
pub use external::ExternalValidator;
pub use schema::SchemaValidator;

/// Uniform interface over built-in and external validators.
///
/// `Ok(())` is a pass; any error is a failure whose message ends up in the
/// report.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> String;

    async fn validate(&self, item: &ValidationItem<'_>) -> Result<(), ValidatorError>;

    /// A failure stops the remaining validators for the endpoint.
    fn is_fatal(&self) -> bool;

    /// Only meaningful for external validators; built-ins see everything.
    fn is_slim(&self) -> bool {
        false
    }
}

/// Builds the ordered validator chain for one endpoint:
/// schema check, then the test cases in order, then the global external
/// validators in scope that no test case already references.
pub fn chain_for(
    definition: &EndpointDefinition,
    externals: &[ValidatorDefinition],
    timeout: Option<Duration>,
) -> Vec<Box<dyn Validator>> {
    let mut chain: Vec<Box<dyn Validator>> = Vec::new();

    if let Some(schema) = &definition.response_schema {
        chain.push(Box::new(SchemaValidator::new(schema.clone())));
    }

    let mut referenced = HashSet::new();
    for test_case in &definition.test_cases {
        if let Some(name) = &test_case.validator {
            // Unknown references are rejected at load time.
            if let Some(external) = externals.iter().find(|v| &v.name == name) {
                referenced.insert(name.as_str());
                chain.push(Box::new(
                    ExternalValidator::new(external.clone())
                        .with_fatal(test_case.fatal)
                        .with_timeout(timeout),
                ));
            }
        } else {
            chain.push(Box::new(BuiltinValidator::new(test_case.clone())));
        }
    }

    for external in externals {
        if external.applies_to(&definition.name) && !referenced.contains(external.name.as_str()) {
            chain.push(Box::new(
                ExternalValidator::new(external.clone()).with_timeout(timeout),
            ));
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn external(name: &str, endpoints: Vec<&str>) -> ValidatorDefinition {
        ValidatorDefinition {
            name: name.to_string(),
            path: "/bin/true".to_string(),
            args: vec![],
            fatal: false,
            slim: false,
            endpoints: endpoints.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_chain_order_and_scope() {
        let def: EndpointDefinition = serde_json::from_value(json!({
            "name": "users",
            "request": { "url": "http://localhost" },
            "response_schema": { "type": "object" },
            "test_cases": [
                { "name": "ok", "field": "status", "operator": "eq", "expected": 200 },
                { "validator": "lint", "fatal": true }
            ]
        }))
        .unwrap();
        let externals = vec![
            external("lint", vec![]),
            external("global", vec![]),
            external("orders-only", vec!["orders"]),
        ];

        let chain = chain_for(&def, &externals, None);
        let names: Vec<String> = chain.iter().map(|v| v.name()).collect();

        assert_eq!(
            names,
            vec!["schema", "ok", "external.lint", "external.global"]
        );
        // A referenced validator takes the test case's fatal flag.
        assert!(chain[2].is_fatal());
        assert!(!chain[3].is_fatal());
    }
}
