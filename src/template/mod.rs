// Module: Template
// Resolves ${var} and ${ENV_NAME} placeholders in request templates.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::FetchError;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("valid placeholder regex")
});

/// Variables available while rendering one endpoint's request.
#[derive(Debug, Default)]
pub struct Template<'a> {
    variables: Option<&'a HashMap<String, Value>>,
}

impl<'a> Template<'a> {
    pub fn new(variables: &'a HashMap<String, Value>) -> Self {
        Self {
            variables: Some(variables),
        }
    }

    /// Replaces every placeholder in `input`.
    pub fn render_str(&self, input: &str) -> Result<String, FetchError> {
        let mut result = String::with_capacity(input.len());
        let mut last_index = 0;

        for capture in PLACEHOLDER_RE.captures_iter(input) {
            let (Some(matched), Some(token)) = (capture.get(0), capture.get(1)) else {
                continue;
            };
            result.push_str(&input[last_index..matched.start()]);
            result.push_str(&self.resolve(token.as_str())?);
            last_index = matched.end();
        }

        result.push_str(&input[last_index..]);
        Ok(result)
    }

    /// Recursively renders strings inside a JSON value.
    pub fn render_value(&self, value: &Value) -> Result<Value, FetchError> {
        match value {
            Value::String(s) => Ok(Value::String(self.render_str(s)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }

    fn resolve(&self, token: &str) -> Result<String, FetchError> {
        if let Some(name) = token.strip_prefix("ENV_") {
            return std::env::var(name).map_err(|_| {
                FetchError::InvalidRequest(format!("missing environment variable '{}'", name))
            });
        }

        match self.variables.and_then(|vars| vars.get(token)) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(FetchError::InvalidRequest(format!(
                "missing template variable '{}'",
                token
            ))),
        }
    }
}
