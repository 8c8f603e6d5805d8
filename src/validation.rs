//! Argument validation and content sanitization
//!
//! [`Validator`] checks call arguments against a capability's
//! [`ArgumentSchema`]. It never stops at the first problem: every violation
//! found in the argument tree is collected and returned together, so a
//! caller can fix all of them in one round trip.
//!
//! [`Sanitizer`] cleans string values according to a capability's
//! [`ContentPolicy`] after validation succeeds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CapwireError, Result};
use crate::types::{ArgumentSchema, Capability, ContentPolicy, PropertySchema, SchemaType};

/// The rule an argument broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A required field is absent.
    Missing,
    /// The value's JSON type is not one of the declared types.
    TypeMismatch,
    /// The value is not a member of the declared enum.
    NotInEnum,
    BelowMinimum,
    AboveMaximum,
    TooShort,
    TooLong,
    /// The string does not match the declared pattern.
    PatternMismatch,
    /// A field not declared in the schema while extra fields are disallowed.
    UnexpectedField,
    /// The schema itself is unusable (e.g. an invalid regex).
    InvalidSchema,
}

/// One failed check, addressed by a path into the argument tree
/// (`a`, `a.b`, `a[0]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Schema-driven argument checker.
///
/// Compiled `pattern` regexes are memoized, so a validator should be shared
/// for the life of a session.
#[derive(Debug, Default)]
pub struct Validator {
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `args` for `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Validation`] listing every violation found.
    pub fn check(&self, capability: &Capability, args: &Value) -> Result<()> {
        let violations = self.validate(&capability.schema, args);
        if violations.is_empty() {
            Ok(())
        } else {
            tracing::debug!(
                capability = %capability.name,
                count = violations.len(),
                "argument validation failed"
            );
            Err(CapwireError::Validation {
                capability: capability.name.clone(),
                violations,
            }
            .into())
        }
    }

    /// Collect all violations of `args` against `schema`.
    ///
    /// `null` arguments are treated as an empty object.
    pub fn validate(&self, schema: &ArgumentSchema, args: &Value) -> Vec<Violation> {
        let mut violations = Vec::new();
        let empty = serde_json::Map::new();
        let map = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                violations.push(Violation::new(
                    "$",
                    ViolationKind::TypeMismatch,
                    format!("expected object, got {}", type_name(other)),
                ));
                return violations;
            }
        };
        self.check_object(
            "",
            &schema.properties,
            &schema.required,
            schema.additional_properties == Some(false),
            map,
            &mut violations,
        );
        violations
    }

    fn check_object(
        &self,
        prefix: &str,
        properties: &std::collections::BTreeMap<String, PropertySchema>,
        required: &[String],
        closed: bool,
        map: &serde_json::Map<String, Value>,
        out: &mut Vec<Violation>,
    ) {
        for name in required {
            if !map.contains_key(name) {
                out.push(Violation::new(
                    join(prefix, name),
                    ViolationKind::Missing,
                    "required field is missing",
                ));
            }
        }
        for (name, prop) in properties {
            if let Some(value) = map.get(name) {
                self.check_value(&join(prefix, name), prop, value, out);
            }
        }
        if closed {
            for name in map.keys() {
                if !properties.contains_key(name) {
                    out.push(Violation::new(
                        join(prefix, name),
                        ViolationKind::UnexpectedField,
                        "field is not declared by the schema",
                    ));
                }
            }
        }
    }

    fn check_value(&self, path: &str, schema: &PropertySchema, value: &Value, out: &mut Vec<Violation>) {
        if let Some(spec) = &schema.schema_type {
            let allowed = spec.types();
            if !allowed.iter().any(|t| matches_type(*t, value)) {
                let names: Vec<String> = allowed.iter().map(|t| t.to_string()).collect();
                out.push(Violation::new(
                    path,
                    ViolationKind::TypeMismatch,
                    format!("expected {}, got {}", names.join(" | "), type_name(value)),
                ));
                // Range and length checks are meaningless on the wrong type.
                return;
            }
        }

        if let Some(options) = &schema.enum_values {
            if !options.contains(value) {
                out.push(Violation::new(
                    path,
                    ViolationKind::NotInEnum,
                    format!("{value} is not one of {}", Value::Array(options.clone())),
                ));
            }
        }

        match value {
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    if let Some(min) = schema.minimum {
                        if x < min {
                            out.push(Violation::new(
                                path,
                                ViolationKind::BelowMinimum,
                                format!("{x} is less than minimum {min}"),
                            ));
                        }
                    }
                    if let Some(max) = schema.maximum {
                        if x > max {
                            out.push(Violation::new(
                                path,
                                ViolationKind::AboveMaximum,
                                format!("{x} is greater than maximum {max}"),
                            ));
                        }
                    }
                }
            }
            Value::String(s) => {
                let len = s.chars().count();
                if let Some(min) = schema.min_length {
                    if len < min {
                        out.push(Violation::new(
                            path,
                            ViolationKind::TooShort,
                            format!("length {len} is shorter than {min}"),
                        ));
                    }
                }
                if let Some(max) = schema.max_length {
                    if len > max {
                        out.push(Violation::new(
                            path,
                            ViolationKind::TooLong,
                            format!("length {len} is longer than {max}"),
                        ));
                    }
                }
                if let Some(pattern) = &schema.pattern {
                    match self.compiled(pattern) {
                        Some(re) if !re.is_match(s) => out.push(Violation::new(
                            path,
                            ViolationKind::PatternMismatch,
                            format!("does not match pattern {pattern:?}"),
                        )),
                        Some(_) => {}
                        None => out.push(Violation::new(
                            path,
                            ViolationKind::InvalidSchema,
                            format!("schema pattern {pattern:?} is not a valid regex"),
                        )),
                    }
                }
            }
            Value::Array(items) => {
                if let Some(min) = schema.min_length {
                    if items.len() < min {
                        out.push(Violation::new(
                            path,
                            ViolationKind::TooShort,
                            format!("{} items, expected at least {min}", items.len()),
                        ));
                    }
                }
                if let Some(max) = schema.max_length {
                    if items.len() > max {
                        out.push(Violation::new(
                            path,
                            ViolationKind::TooLong,
                            format!("{} items, expected at most {max}", items.len()),
                        ));
                    }
                }
                if let Some(item_schema) = &schema.items {
                    for (i, item) in items.iter().enumerate() {
                        self.check_value(&format!("{path}[{i}]"), item_schema, item, out);
                    }
                }
            }
            Value::Object(map) => {
                if !schema.properties.is_empty() || !schema.required.is_empty() {
                    self.check_object(path, &schema.properties, &schema.required, false, map, out);
                }
            }
            Value::Bool(_) | Value::Null => {}
        }
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        let mut cache = self.patterns.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok())
            .clone()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn matches_type(expected: SchemaType, value: &Value) -> bool {
    match expected {
        SchemaType::String => value.is_string(),
        SchemaType::Number => value.is_number(),
        SchemaType::Integer => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        SchemaType::Boolean => value.is_boolean(),
        SchemaType::Object => value.is_object(),
        SchemaType::Array => value.is_array(),
        SchemaType::Null => value.is_null(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Strips disallowed characters from string values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Return a copy of `value` with every string (object keys excluded)
    /// cleaned according to `policy`.
    pub fn sanitize(&self, policy: &ContentPolicy, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.clean(policy, s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.sanitize(policy, v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize(policy, v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Clean one string.
    pub fn clean(&self, policy: &ContentPolicy, input: &str) -> String {
        input
            .chars()
            .filter(|c| {
                !(policy.strip_control && is_invisible(*c)
                    || policy.strip_markup && matches!(c, '<' | '>')
                    || policy.disallowed.contains(*c))
            })
            .collect()
    }
}

/// Control characters (except newline, carriage return and tab) plus
/// zero-width and bidirectional formatting characters.
fn is_invisible(c: char) -> bool {
    if matches!(c, '\n' | '\r' | '\t') {
        return false;
    }
    c.is_control()
        || matches!(
            c,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}'
                | '\u{2066}'..='\u{2069}' | '\u{FEFF}'
        )
}
