//! # Loading Configuration and Definitions
//!
//! Reads the JSON configuration file, the endpoint definition files and the
//! external validator list, then runs load-time validation. Any problem is a
//! [`ConfigError`]: the whole load fails, nothing runs.
//!
//! ## Definition files
//!
//! Every `*.json` file in the definitions directory is one
//! [`EndpointDefinition`]. Files starting with `.` are skipped, which is the
//! usual way to switch an endpoint off. Files are loaded in file name order
//! and that order is the order of endpoints in every report.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::ConfigError;
use crate::protocol::{EndpointDefinition, ValidatorDefinition};
use crate::validation::validate_definitions;

/// Everything the pipeline needs, validated.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: AppConfig,
    pub definitions: Vec<EndpointDefinition>,
    pub validators: Vec<ValidatorDefinition>,
}

/// Reads the config file, falling back to defaults when it does not exist.
/// Environment overrides are applied on top.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        debug!(path = ?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env();
    Ok(config)
}

/// Loads config, definitions and validators and validates them together.
pub fn load_all(config_path: &Path) -> Result<Loaded, ConfigError> {
    let config = load_config(config_path)?;
    let validators = parse_external_validators(&config.validation.external_validators)?;
    let definitions = load_definitions(&config.validation.definitions_dir)?;

    validate_definitions(&definitions, &validators).map_err(ConfigError::InvalidDefinitions)?;

    info!(
        endpoints = definitions.len(),
        external_validators = validators.len(),
        "configuration loaded"
    );

    Ok(Loaded {
        config,
        definitions,
        validators,
    })
}

/// Loads every definition file in `dir`, sorted by file name.
///
/// A missing directory yields no definitions.
pub fn load_definitions(dir: &Path) -> Result<Vec<EndpointDefinition>, ConfigError> {
    if !dir.exists() {
        debug!(dir = ?dir, "definitions directory not found");
        return Ok(Vec::new());
    }

    let read_err = |source| ConfigError::DefinitionRead {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if is_definition_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    paths.iter().map(|path| load_definition(path)).collect()
}

pub fn load_definition(path: &Path) -> Result<EndpointDefinition, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::DefinitionRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::DefinitionParse {
        path: path.to_path_buf(),
        source,
    })
}

fn is_definition_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    let json = path.extension().and_then(|e| e.to_str()) == Some("json");
    path.is_file() && json && !hidden
}

// ============================================================================
// EXTERNAL VALIDATORS
// ============================================================================

/// Parses `validation.external_validators`.
///
/// `null` means none. Otherwise it must be an array of objects, each with a
/// string `name`, a string `path`, an `args` array of strings and a boolean
/// `fatal`; `slim` (bool) and `endpoints` (array of strings) are optional.
/// The first mismatch fails the whole list.
pub fn parse_external_validators(raw: &Value) -> Result<Vec<ValidatorDefinition>, ConfigError> {
    let entries = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        other => {
            return Err(parse_error(format!(
                "expected an array, got {}",
                json_type(other)
            )))
        }
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let obj = entry.as_object().ok_or_else(|| {
                parse_error(format!(
                    "entry #{}: expected an object, got {}",
                    index,
                    json_type(entry)
                ))
            })?;

            Ok(ValidatorDefinition {
                name: required_str(obj, "name", index)?,
                path: required_str(obj, "path", index)?,
                args: string_array(obj, "args", index, true)?,
                fatal: bool_field(obj, "fatal", index, None)?,
                slim: bool_field(obj, "slim", index, Some(false))?,
                endpoints: string_array(obj, "endpoints", index, false)?,
            })
        })
        .collect()
}

fn required_str(obj: &Map<String, Value>, key: &str, index: usize) -> Result<String, ConfigError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(parse_error(format!(
            "entry #{}: '{}' must be a string, got {}",
            index,
            key,
            json_type(other)
        ))),
        None => Err(parse_error(format!("entry #{}: missing '{}'", index, key))),
    }
}

fn string_array(
    obj: &Map<String, Value>,
    key: &str,
    index: usize,
    required: bool,
) -> Result<Vec<String>, ConfigError> {
    let items = match obj.get(key) {
        Some(Value::Array(items)) => items,
        None if !required => return Ok(Vec::new()),
        None => return Err(parse_error(format!("entry #{}: missing '{}'", index, key))),
        Some(other) => {
            return Err(parse_error(format!(
                "entry #{}: '{}' must be an array of strings, got {}",
                index,
                key,
                json_type(other)
            )))
        }
    };

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                parse_error(format!(
                    "entry #{}: '{}' must be an array of strings, found {}",
                    index,
                    key,
                    json_type(item)
                ))
            })
        })
        .collect()
}

fn bool_field(
    obj: &Map<String, Value>,
    key: &str,
    index: usize,
    default: Option<bool>,
) -> Result<bool, ConfigError> {
    match (obj.get(key), default) {
        (Some(Value::Bool(b)), _) => Ok(*b),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(parse_error(format!("entry #{}: missing '{}'", index, key))),
        (Some(other), _) => Err(parse_error(format!(
            "entry #{}: '{}' must be a boolean, got {}",
            index,
            key,
            json_type(other)
        ))),
    }
}

fn parse_error(message: String) -> ConfigError {
    ConfigError::ExternalValidatorParse(message)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
