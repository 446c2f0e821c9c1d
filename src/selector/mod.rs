//! # Field Selectors
//!
//! A test case names the part of the response it checks with a selector:
//!
//! | Selector                     | Yields                                  |
//! |------------------------------|-----------------------------------------|
//! | `status`                     | status code (number)                    |
//! | `elapsed_ms`                 | response time in ms (number)            |
//! | `header.X` / `headers.X`     | header value, case-insensitive (string) |
//! | `body`                       | the whole body                          |
//! | `body.a.b`, `$.a.b`, `a.b`   | a path into the JSON body               |
//!
//! Paths understand `.key`, `[n]` and `[*]`. A wildcard projects the rest of
//! the path over every element and yields an array, which the comparer then
//! treats existentially:
//!
//! ```text
//! body: { "items": [ { "id": 1 }, { "id": 7 } ] }
//! $.items[*].id  ->  [1, 7]
//! $.items[1].id  ->  7
//! ```

use std::fmt;

use serde_json::Value;

use crate::protocol::CapturedResponse;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Status,
    Elapsed,
    Header(String),
    Body(Vec<Segment>),
}

impl Selector {
    /// Parses a selector, returning a human readable reason on failure.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty field selector".to_string());
        }

        match input {
            "status" | "status_code" => return Ok(Self::Status),
            "elapsed_ms" | "latency" => return Ok(Self::Elapsed),
            "body" | "$" => return Ok(Self::Body(Vec::new())),
            _ => {}
        }

        for prefix in ["header.", "headers."] {
            if let Some(name) = input.strip_prefix(prefix) {
                if name.is_empty() {
                    return Err("empty header name".to_string());
                }
                return Ok(Self::Header(name.to_ascii_lowercase()));
            }
        }

        let path = input
            .strip_prefix("body.")
            .or_else(|| input.strip_prefix("$."))
            .or_else(|| input.strip_prefix('$'))
            .unwrap_or(input);

        split_path(path).map(Self::Body)
    }

    /// Picks the selected value out of a response; `None` if it is absent.
    pub fn select(&self, response: &CapturedResponse) -> Option<Value> {
        match self {
            Self::Status => Some(Value::from(response.status)),
            Self::Elapsed => Some(Value::from(response.elapsed_ms)),
            Self::Header(name) => response
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| Value::String(v.clone())),
            Self::Body(segments) => walk(&response.body, segments),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Elapsed => write!(f, "elapsed_ms"),
            Self::Header(name) => write!(f, "header.{}", name),
            Self::Body(segments) => {
                write!(f, "body")?;
                for segment in segments {
                    match segment {
                        Segment::Key(k) => write!(f, ".{}", k)?,
                        Segment::Index(i) => write!(f, "[{}]", i)?,
                        Segment::Wildcard => write!(f, "[*]")?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// Splits `users[0].name` into `[Key(users), Index(0), Key(name)]`.
fn split_path(path: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    index.push(next);
                }
                if !closed {
                    return Err(format!("unclosed '[' in path '{}'", path));
                }
                segments.push(parse_index(index.trim(), path)?);
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }

    Ok(segments)
}

fn parse_index(index: &str, path: &str) -> Result<Segment, String> {
    if index == "*" {
        return Ok(Segment::Wildcard);
    }
    index
        .parse()
        .map(Segment::Index)
        .map_err(|_| format!("invalid array index '{}' in path '{}'", index, path))
}

fn walk(value: &Value, segments: &[Segment]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match first {
        Segment::Key(key) => value.as_object()?.get(key).and_then(|v| walk(v, rest)),
        Segment::Index(index) => value.as_array()?.get(*index).and_then(|v| walk(v, rest)),
        Segment::Wildcard => {
            let items = value.as_array()?;
            Some(Value::Array(
                items.iter().filter_map(|item| walk(item, rest)).collect(),
            ))
        }
    }
}
