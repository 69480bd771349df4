// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Data schemas and schema compatibility.
//!
//! A [`DataSchema`] is the record `{name, version, fields}` attached to every
//! service's input and output side. Two separate questions are answered here
//! and kept apart on purpose:
//!
//! - **Compatibility** ([`satisfies`]): does a producer's output schema
//!   satisfy a consumer's input schema? A pure function over two schemas,
//!   evaluated per edge at validation time.
//! - **Validation** ([`DataSchema::validate_payload`]): does a concrete JSON
//!   payload conform to a schema? Evaluated against live data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primitive type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// Double-precision float. Accepts integers (widening).
    Number,
    /// Boolean.
    Boolean,
    /// Nested JSON object.
    Object,
    /// JSON array.
    Array,
}

impl FieldType {
    /// Whether a producer emitting `self` can feed a consumer expecting
    /// `other`. Equal types always; `Integer` widens to `Number`.
    pub fn feeds(self, other: FieldType) -> bool {
        self == other || (self == FieldType::Integer && other == FieldType::Number)
    }

    fn matches_value(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Value constraints on a single field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Inclusive lower bound for numeric fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regex the full string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Closed set of allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
}

impl ValidationRules {
    /// Whether a producer constrained by `self` always emits values a
    /// consumer constrained by `other` accepts.
    ///
    /// Range containment is checked numerically. Regex subsumption is
    /// undecidable in general, so the check is conservative: the consumer
    /// having no pattern always passes, otherwise the patterns must be
    /// textually equal.
    pub fn within(&self, other: &ValidationRules) -> bool {
        if let Some(consumer_min) = other.min {
            match self.min {
                Some(producer_min) if producer_min >= consumer_min => {}
                _ => return false,
            }
        }
        if let Some(consumer_max) = other.max {
            match self.max {
                Some(producer_max) if producer_max <= consumer_max => {}
                _ => return false,
            }
        }
        if let Some(consumer_pattern) = &other.pattern {
            match &self.pattern {
                Some(producer_pattern) if producer_pattern == consumer_pattern => {}
                _ => return false,
            }
        }
        if let Some(consumer_allowed) = &other.allowed_values {
            match &self.allowed_values {
                Some(producer_allowed) => {
                    if !producer_allowed.iter().all(|v| consumer_allowed.contains(v)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn accepts(&self, value: &Value) -> bool {
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return false;
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return false;
                }
            }
        }
        if let (Some(pattern), Some(s)) = (&self.pattern, value.as_str()) {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return false;
                    }
                }
                // Unparseable pattern rejects the value rather than silently passing.
                Err(_) => return false,
            }
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                return false;
            }
        }
        true
    }
}

/// A single field of a schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name as it appears in payload objects.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Whether the field must be present.
    #[serde(default)]
    pub required: bool,
    /// Value constraints.
    #[serde(default)]
    pub rules: ValidationRules,
}

impl FieldSpec {
    /// A required field with no extra rules.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            rules: ValidationRules::default(),
        }
    }

    /// An optional field with no extra rules.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            rules: ValidationRules::default(),
        }
    }

    /// Attach value constraints.
    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }
}

/// A named, versioned record schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    /// Schema name; doubles as the `dataType` segment of memory addresses.
    pub name: String,
    /// Schema revision.
    pub version: u32,
    /// Field specifications.
    pub fields: Vec<FieldSpec>,
}

impl DataSchema {
    /// Build a schema from its parts.
    pub fn new(name: impl Into<String>, version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            version,
            fields,
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of all required fields.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Check a concrete JSON payload against this schema. Returns every
    /// violation rather than stopping at the first.
    pub fn validate_payload(&self, payload: &Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        let Some(object) = payload.as_object() else {
            violations.push(SchemaViolation {
                field: String::new(),
                reason: "payload is not a JSON object".to_string(),
            });
            return violations;
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        violations.push(SchemaViolation {
                            field: field.name.clone(),
                            reason: "required field is missing".to_string(),
                        });
                    }
                }
                Some(value) => {
                    if !field.field_type.matches_value(value) {
                        violations.push(SchemaViolation {
                            field: field.name.clone(),
                            reason: format!(
                                "expected {:?}, got {}",
                                field.field_type,
                                json_type_name(value)
                            ),
                        });
                    } else if !field.rules.accepts(value) {
                        violations.push(SchemaViolation {
                            field: field.name.clone(),
                            reason: "value violates field rules".to_string(),
                        });
                    }
                }
            }
        }
        violations
    }
}

/// A single payload-vs-schema violation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Offending field, empty for payload-level problems.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Why a producer schema does not satisfy a consumer schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incompatibility {
    /// The consumer field that cannot be fed.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Does `producer` satisfy `consumer`?
///
/// Every required consumer field must exist on the producer side with a
/// compatible type, must be guaranteed present (required on the producer
/// too), and the producer's value constraints must fit inside the
/// consumer's accepted range. Extra producer fields are always fine.
pub fn satisfies(producer: &DataSchema, consumer: &DataSchema) -> Vec<Incompatibility> {
    let mut problems = Vec::new();
    for wanted in consumer.required_fields() {
        match producer.field(&wanted.name) {
            None => problems.push(Incompatibility {
                field: wanted.name.clone(),
                reason: format!("producer schema '{}' has no such field", producer.name),
            }),
            Some(supplied) => {
                if !supplied.required {
                    problems.push(Incompatibility {
                        field: wanted.name.clone(),
                        reason: "producer does not guarantee the field is present".to_string(),
                    });
                }
                if !supplied.field_type.feeds(wanted.field_type) {
                    problems.push(Incompatibility {
                        field: wanted.name.clone(),
                        reason: format!(
                            "producer type {:?} cannot feed consumer type {:?}",
                            supplied.field_type, wanted.field_type
                        ),
                    });
                }
                if !supplied.rules.within(&wanted.rules) {
                    problems.push(Incompatibility {
                        field: wanted.name.clone(),
                        reason: "producer value constraints exceed the consumer's accepted range"
                            .to_string(),
                    });
                }
            }
        }
    }
    problems
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
