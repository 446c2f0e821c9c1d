use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::errors::ValidatorError;
use crate::protocol::ValidationItem;

use super::Validator;

/// Checks the response body against the definition's JSON Schema.
pub struct SchemaValidator {
    schema: Value,
}

impl SchemaValidator {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    fn name(&self) -> String {
        "schema".to_string()
    }

    async fn validate(&self, item: &ValidationItem<'_>) -> Result<(), ValidatorError> {
        let compiled = JSONSchema::compile(&self.schema)
            .map_err(|e| ValidatorError::Failed(format!("invalid response schema: {}", e)))?;

        let result = compiled.validate(&item.response.body);
        if let Err(violations) = result {
            let messages: Vec<String> = violations
                .map(|v| format!("{} at '{}'", v, v.instance_path))
                .collect();
            return Err(ValidatorError::Failed(messages.join("; ")));
        }
        Ok(())
    }

    fn is_fatal(&self) -> bool {
        false
    }
}
