//! Structural payload validation.
//!
//! Payloads are dynamic JSON; their shape is policed at runtime against a
//! [`PayloadSchema`] - a JSON-schema-equivalent structural description
//! (property types, required fields, string patterns, enums, numeric bounds,
//! array bounds, `additionalProperties`).
//!
//! Schemas are compiled once into a [`CompiledSchema`] (regexes precompiled)
//! and the catalog memoizes compiled validators by `(event name, version)`.
//!
//! # Modes
//!
//! - [`ValidationMode::Strict`] rejects unknown schema keywords at compile
//!   time and rejects undeclared payload properties unless the schema says
//!   `additionalProperties: true`.
//! - [`ValidationMode::Loose`] accepts both.
//!
//! # Errors
//!
//! Each offending path yields exactly one [`FieldError`] with `path`,
//! `message`, and `expected`/`received` where they help.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Schema Model
// =============================================================================

/// Primitive type names a schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl SchemaType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::Null => value.is_null(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        }
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural description of a payload.
///
/// Deserializes from the JSON-schema-shaped documents stored in the catalog.
/// Unknown keywords are preserved in `extra` so strict compilation can reject
/// them while loose compilation shrugs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSchema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PayloadSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PayloadSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    /// Keywords this evaluator does not understand.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl PayloadSchema {
    /// A bare `{"type": "object"}` schema.
    pub fn object() -> Self {
        Self {
            schema_type: Some(SchemaType::Object),
            ..Default::default()
        }
    }

    /// Parse a schema from its JSON document.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        serde_json::from_value(value.clone()).map_err(|e| SchemaError::Malformed(e.to_string()))
    }
}

/// Validation strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Reject unknown keywords and undeclared payload properties.
    Strict,
    /// Accept both.
    #[default]
    Loose,
}

// =============================================================================
// Errors
// =============================================================================

/// A schema that cannot be compiled.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed schema: {0}")]
    Malformed(String),
    #[error("invalid pattern at {path}: {message}")]
    BadPattern { path: String, message: String },
    #[error("unknown schema keyword at {path}: {keyword}")]
    UnknownKeyword { path: String, keyword: String },
}

/// One validation failure at one payload path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
}

impl FieldError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
            expected: None,
            received: None,
        }
    }

    fn typed(path: &str, message: impl Into<String>, expected: &str, received: &str) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
            expected: Some(expected.to_string()),
            received: Some(received.to_string()),
        }
    }
}

/// The result of validating one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl ValidationOutcome {
    /// A passing outcome.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing outcome from accumulated field errors.
    pub fn failed(errors: Vec<FieldError>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Failure with a single error at the root path.
    pub fn single(message: impl Into<String>) -> Self {
        Self::failed(vec![FieldError::new("", message)])
    }
}

// =============================================================================
// Compiled Schema
// =============================================================================

#[derive(Debug)]
struct CompiledNode {
    schema_type: Option<SchemaType>,
    properties: BTreeMap<String, CompiledNode>,
    required: Vec<String>,
    pattern: Option<(String, Regex)>,
    enum_values: Option<Vec<Value>>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    items: Option<Box<CompiledNode>>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    additional_properties: Option<bool>,
}

/// A schema with its regexes precompiled, ready for repeated validation.
#[derive(Debug)]
pub struct CompiledSchema {
    root: CompiledNode,
    mode: ValidationMode,
}

impl CompiledSchema {
    /// Compile a schema under the given mode.
    ///
    /// Strict mode fails on keywords this evaluator does not implement; loose
    /// mode ignores them. Bad regex patterns fail either way.
    pub fn compile(schema: &PayloadSchema, mode: ValidationMode) -> Result<Self, SchemaError> {
        Ok(Self {
            root: compile_node(schema, mode, "")?,
            mode,
        })
    }

    /// Validate a payload, returning every field error found.
    pub fn validate(&self, payload: &Value) -> ValidationOutcome {
        let mut errors = Vec::new();
        validate_node(&self.root, payload, "", self.mode, &mut errors);
        if errors.is_empty() {
            ValidationOutcome::ok()
        } else {
            ValidationOutcome::failed(errors)
        }
    }
}

fn compile_node(
    schema: &PayloadSchema,
    mode: ValidationMode,
    path: &str,
) -> Result<CompiledNode, SchemaError> {
    if mode == ValidationMode::Strict {
        if let Some(keyword) = schema.extra.keys().next() {
            return Err(SchemaError::UnknownKeyword {
                path: path.to_string(),
                keyword: keyword.clone(),
            });
        }
    }

    let pattern = match &schema.pattern {
        Some(p) => Some((
            p.clone(),
            Regex::new(p).map_err(|e| SchemaError::BadPattern {
                path: path.to_string(),
                message: e.to_string(),
            })?,
        )),
        None => None,
    };

    let mut properties = BTreeMap::new();
    if let Some(props) = &schema.properties {
        for (name, sub) in props {
            let sub_path = join_path(path, name);
            properties.insert(name.clone(), compile_node(sub, mode, &sub_path)?);
        }
    }

    let items = match &schema.items {
        Some(sub) => Some(Box::new(compile_node(sub, mode, &format!("{path}[]"))?)),
        None => None,
    };

    Ok(CompiledNode {
        schema_type: schema.schema_type,
        properties,
        required: schema.required.clone().unwrap_or_default(),
        pattern,
        enum_values: schema.enum_values.clone(),
        minimum: schema.minimum,
        maximum: schema.maximum,
        min_length: schema.min_length,
        max_length: schema.max_length,
        items,
        min_items: schema.min_items,
        max_items: schema.max_items,
        additional_properties: schema.additional_properties,
    })
}

fn join_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}.{segment}")
    }
}

fn validate_node(
    node: &CompiledNode,
    value: &Value,
    path: &str,
    mode: ValidationMode,
    errors: &mut Vec<FieldError>,
) {
    let CompiledNode {
        schema_type,
        properties,
        required,
        pattern,
        enum_values,
        minimum,
        maximum,
        min_length,
        max_length,
        items,
        min_items,
        max_items,
        additional_properties,
    } = node;

    if let Some(expected) = schema_type {
        if !expected.matches(value) {
            errors.push(FieldError::typed(
                path,
                format!("expected {}, got {}", expected.name(), type_name_of(value)),
                expected.name(),
                type_name_of(value),
            ));
            // Wrong type makes every other keyword moot for this path.
            return;
        }
    }

    if let Some(allowed) = enum_values {
        if !allowed.contains(value) {
            errors.push(FieldError::typed(
                path,
                "value not in enum",
                &allowed
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" | "),
                &value.to_string(),
            ));
            return;
        }
    }

    match value {
        Value::String(s) => {
            if let Some(min) = min_length {
                if s.chars().count() < *min {
                    errors.push(FieldError::new(
                        path,
                        format!("string shorter than {min} characters"),
                    ));
                    return;
                }
            }
            if let Some(max) = max_length {
                if s.chars().count() > *max {
                    errors.push(FieldError::new(
                        path,
                        format!("string longer than {max} characters"),
                    ));
                    return;
                }
            }
            if let Some((source, regex)) = pattern {
                if !regex.is_match(s) {
                    errors.push(FieldError::typed(
                        path,
                        "string does not match pattern",
                        source,
                        s,
                    ));
                }
            }
        }
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = minimum {
                if f < *min {
                    errors.push(FieldError::new(path, format!("value below minimum {min}")));
                    return;
                }
            }
            if let Some(max) = maximum {
                if f > *max {
                    errors.push(FieldError::new(path, format!("value above maximum {max}")));
                }
            }
        }
        Value::Array(arr) => {
            if let Some(min) = min_items {
                if arr.len() < *min {
                    errors.push(FieldError::new(
                        path,
                        format!("array has fewer than {min} items"),
                    ));
                    return;
                }
            }
            if let Some(max) = max_items {
                if arr.len() > *max {
                    errors.push(FieldError::new(
                        path,
                        format!("array has more than {max} items"),
                    ));
                    return;
                }
            }
            if let Some(item_node) = items {
                for (i, item) in arr.iter().enumerate() {
                    validate_node(item_node, item, &format!("{path}[{i}]"), mode, errors);
                }
            }
        }
        Value::Object(map) => {
            for name in required {
                if !map.contains_key(name) {
                    errors.push(FieldError::new(
                        &join_path(path, name),
                        "required field missing",
                    ));
                }
            }
            for (name, sub_value) in map {
                match properties.get(name) {
                    Some(sub_node) => {
                        validate_node(sub_node, sub_value, &join_path(path, name), mode, errors);
                    }
                    None => {
                        let allowed = match additional_properties {
                            Some(allowed) => *allowed,
                            None => mode == ValidationMode::Loose,
                        };
                        if !allowed && !properties.is_empty() {
                            errors.push(FieldError::new(
                                &join_path(path, name),
                                "unexpected property",
                            ));
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(doc: Value) -> CompiledSchema {
        let schema = PayloadSchema::from_value(&doc).unwrap();
        CompiledSchema::compile(&schema, ValidationMode::Loose).unwrap()
    }

    fn compile_strict(doc: Value) -> Result<CompiledSchema, SchemaError> {
        let schema = PayloadSchema::from_value(&doc).unwrap();
        CompiledSchema::compile(&schema, ValidationMode::Strict)
    }

    #[test]
    fn test_required_field_missing_yields_one_error() {
        let schema = compile(json!({
            "type": "object",
            "properties": {
                "userId": {"type": "string"},
                "device": {
                    "type": "object",
                    "properties": {
                        "userAgent": {"type": "string"},
                        "ipAddress": {"type": "string"}
                    },
                    "required": ["userAgent", "ipAddress"]
                }
            },
            "required": ["userId", "device"]
        }));

        let outcome = schema.validate(&json!({"userId": "u1"}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "device");
        assert!(outcome.errors[0].message.contains("required"));
    }

    #[test]
    fn test_nested_required_paths() {
        let schema = compile(json!({
            "type": "object",
            "properties": {
                "device": {
                    "type": "object",
                    "properties": {
                        "userAgent": {"type": "string"},
                        "ipAddress": {"type": "string"}
                    },
                    "required": ["userAgent", "ipAddress"]
                }
            },
            "required": ["device"]
        }));

        let outcome = schema.validate(&json!({"device": {"userAgent": "curl"}}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "device.ipAddress");
    }

    #[test]
    fn test_wrong_type_reports_expected_and_received() {
        let schema = compile(json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        }));

        let outcome = schema.validate(&json!({"count": "three"}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
        let e = &outcome.errors[0];
        assert_eq!(e.path, "count");
        assert_eq!(e.expected.as_deref(), Some("integer"));
        assert_eq!(e.received.as_deref(), Some("string"));
    }

    #[test]
    fn test_integer_rejects_float() {
        let schema = compile(json!({"type": "integer"}));
        assert!(!schema.validate(&json!(1.5)).valid);
        assert!(schema.validate(&json!(3)).valid);
    }

    #[test]
    fn test_numeric_bounds() {
        let schema = compile(json!({
            "type": "object",
            "properties": {"qty": {"type": "number", "minimum": 1, "maximum": 10}}
        }));
        assert!(schema.validate(&json!({"qty": 5})).valid);
        assert!(!schema.validate(&json!({"qty": 0})).valid);
        assert!(!schema.validate(&json!({"qty": 11})).valid);
    }

    #[test]
    fn test_string_pattern_and_lengths() {
        let schema = compile(json!({
            "type": "object",
            "properties": {
                "email": {"type": "string", "pattern": "^[^@]+@[^@]+$"},
                "code": {"type": "string", "minLength": 4, "maxLength": 8}
            }
        }));
        assert!(schema.validate(&json!({"email": "u@x", "code": "abcd"})).valid);
        assert!(!schema.validate(&json!({"email": "nope"})).valid);
        assert!(!schema.validate(&json!({"code": "abc"})).valid);
        assert!(!schema.validate(&json!({"code": "abcdefghi"})).valid);
    }

    #[test]
    fn test_enum_constraint() {
        let schema = compile(json!({
            "type": "object",
            "properties": {"plan": {"type": "string", "enum": ["free", "pro"]}}
        }));
        assert!(schema.validate(&json!({"plan": "pro"})).valid);
        let outcome = schema.validate(&json!({"plan": "gold"}));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].expected.as_ref().unwrap().contains("free"));
    }

    #[test]
    fn test_array_bounds_and_items() {
        let schema = compile(json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 3,
                    "items": {"type": "object", "properties": {"sku": {"type": "string"}}, "required": ["sku"]}
                }
            }
        }));
        assert!(schema
            .validate(&json!({"items": [{"sku": "a"}, {"sku": "b"}]}))
            .valid);
        assert!(!schema.validate(&json!({"items": []})).valid);
        assert!(!schema.validate(&json!({"items": [1, 2, 3, 4]})).valid);

        let outcome = schema.validate(&json!({"items": [{"sku": "a"}, {}]}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].path, "items[1].sku");
    }

    #[test]
    fn test_loose_accepts_extras_strict_rejects() {
        let doc = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}}
        });
        let loose = compile(doc.clone());
        assert!(loose.validate(&json!({"a": "x", "b": 1})).valid);

        let strict = compile_strict(doc).unwrap();
        let outcome = strict.validate(&json!({"a": "x", "b": 1}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].path, "b");
    }

    #[test]
    fn test_additional_properties_declared_false_rejects_even_loose() {
        let schema = compile(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        }));
        assert!(!schema.validate(&json!({"a": "x", "b": 1})).valid);
    }

    #[test]
    fn test_additional_properties_true_allows_in_strict() {
        let strict = compile_strict(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": true
        }))
        .unwrap();
        assert!(strict.validate(&json!({"a": "x", "b": 1})).valid);
    }

    #[test]
    fn test_strict_rejects_unknown_keywords() {
        let err = compile_strict(json!({
            "type": "object",
            "allOf": [{"type": "object"}]
        }))
        .unwrap_err();
        match err {
            SchemaError::UnknownKeyword { keyword, .. } => assert_eq!(keyword, "allOf"),
            other => panic!("expected UnknownKeyword, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_pattern_fails_compile() {
        let schema = PayloadSchema::from_value(&json!({
            "type": "string",
            "pattern": "["
        }))
        .unwrap();
        assert!(matches!(
            CompiledSchema::compile(&schema, ValidationMode::Loose),
            Err(SchemaError::BadPattern { .. })
        ));
    }

    #[test]
    fn test_each_offending_path_yields_exactly_one_error() {
        let schema = compile(json!({
            "type": "object",
            "properties": {
                "a": {"type": "string", "minLength": 3, "pattern": "^x"},
                "b": {"type": "integer", "minimum": 0}
            },
            "required": ["a", "b"]
        }));

        // a fails minLength (pattern not also reported), b fails type
        let outcome = schema.validate(&json!({"a": "y", "b": "zero"}));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 2);
        let paths: Vec<_> = outcome.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"a"));
        assert!(paths.contains(&"b"));
    }

    #[test]
    fn test_schema_round_trips_through_json() {
        let doc = json!({
            "type": "object",
            "properties": {"email": {"type": "string", "pattern": "@"}},
            "required": ["email"],
            "additionalProperties": false
        });
        let schema = PayloadSchema::from_value(&doc).unwrap();
        let back = serde_json::to_value(&schema).unwrap();
        assert_eq!(back, doc);
    }
}
