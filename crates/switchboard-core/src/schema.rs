//! Structural validation of capability arguments
//!
//! Each stored capability carries an input-shape description (a JSON-schema
//! subset: properties with primitive types, required-ness, regex patterns,
//! string length bounds). The shape is compiled once when the executable is
//! built; invocation-time arguments are checked against the compiled form
//! and rejected before any outbound call is made.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::EngineError;

/// Primitive field types supported by input shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn parse(name: &str) -> Self {
        match name {
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => Self::String,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug)]
struct CompiledField {
    field_type: FieldType,
    required: bool,
    pattern: Option<Regex>,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

/// Validator derived from a stored input-shape description
#[derive(Debug)]
pub struct CompiledShape {
    fields: HashMap<String, CompiledField>,
}

impl CompiledShape {
    /// Compile an input-shape description.
    ///
    /// Fails on malformed shapes (e.g. an invalid regex) so bad
    /// configuration is caught at build time, not on every invocation.
    pub fn compile(shape: &Value) -> Result<Self, EngineError> {
        let properties = shape
            .get("properties")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();

        let required: Vec<String> = shape
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut fields = HashMap::new();
        for (name, spec) in properties {
            let field_type = spec
                .get("type")
                .and_then(|t| t.as_str())
                .map(FieldType::parse)
                .unwrap_or(FieldType::String);

            let pattern = match spec.get("pattern").and_then(|p| p.as_str()) {
                Some(raw) => {
                    let anchored = anchor(raw);
                    Some(Regex::new(&anchored).map_err(|e| {
                        EngineError::Execution(format!(
                            "capability input shape has invalid pattern for field '{name}': {e}"
                        ))
                    })?)
                }
                None => None,
            };

            fields.insert(
                name.clone(),
                CompiledField {
                    field_type,
                    required: required.contains(&name),
                    pattern,
                    min_length: spec
                        .get("min_length")
                        .or_else(|| spec.get("minLength"))
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize),
                    max_length: spec
                        .get("max_length")
                        .or_else(|| spec.get("maxLength"))
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize),
                },
            );
        }

        Ok(Self { fields })
    }

    /// Validate arguments against the compiled shape.
    ///
    /// All field problems are collected into one user-facing explanation.
    pub fn validate(&self, args: &Value) -> Result<(), EngineError> {
        let args = match args.as_object() {
            Some(map) => map,
            None => {
                return Err(EngineError::Validation(
                    "arguments must be an object".to_string(),
                ))
            }
        };

        let mut problems = Vec::new();

        for (name, field) in &self.fields {
            match args.get(name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("field '{name}' is required"));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        problems.push(format!(
                            "field '{name}' must be of type {}",
                            field.field_type.name()
                        ));
                        continue;
                    }
                    if let Some(s) = value.as_str() {
                        if let Some(min) = field.min_length {
                            if s.chars().count() < min {
                                problems
                                    .push(format!("field '{name}' must be at least {min} characters"));
                            }
                        }
                        if let Some(max) = field.max_length {
                            if s.chars().count() > max {
                                problems
                                    .push(format!("field '{name}' must be at most {max} characters"));
                            }
                        }
                        if let Some(pattern) = &field.pattern {
                            if !pattern.is_match(s) {
                                problems.push(format!(
                                    "field '{name}' does not match the expected format"
                                ));
                            }
                        }
                    }
                }
            }
        }

        for name in args.keys() {
            if !self.fields.contains_key(name) {
                problems.push(format!("unexpected field '{name}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(EngineError::Validation(problems.join("; ")))
        }
    }
}

/// Anchor a pattern so it must match the whole value.
///
/// The pattern is wrapped in a non-capturing group first; bare `^`/`$`
/// around a pattern with top-level alternation would anchor only the
/// first and last branch.
fn anchor(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}
