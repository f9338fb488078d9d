//! Tool argument validation against a tool's JSON schema.
//!
//! Only the subset of JSON Schema that tools here declare is understood:
//! an object with `properties` (each with a `type`) and `required`.
//! Scalar mismatches a model commonly makes are corrected in place; anything
//! else rejects the call.

use serde_json::{Map, Value};

/// A single problem found in a tool call's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgIssue {
    /// A string such as `"42"` was turned into the number it spells.
    CoercedToNumber { field: String },
    /// `"true"`/`"false"` was turned into a boolean.
    CoercedToBool { field: String },
    /// A number or boolean was rendered as a string.
    CoercedToString { field: String },
    /// A string holding a JSON array was parsed into that array.
    ParsedArray { field: String },
    /// The model passed an unexpanded template where an array was required.
    TemplateLiteral { field: String },
    MissingRequired { field: String },
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },
    NotAnObject { found: String },
}

impl ArgIssue {
    /// Whether the issue was repaired automatically.
    pub fn is_correction(&self) -> bool {
        matches!(
            self,
            Self::CoercedToNumber { .. }
                | Self::CoercedToBool { .. }
                | Self::CoercedToString { .. }
                | Self::ParsedArray { .. }
        )
    }
}

impl std::fmt::Display for ArgIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoercedToNumber { field } => write!(f, "'{}' coerced from string to number", field),
            Self::CoercedToBool { field } => write!(f, "'{}' coerced from string to boolean", field),
            Self::CoercedToString { field } => write!(f, "'{}' coerced to string", field),
            Self::ParsedArray { field } => write!(f, "'{}' parsed from a JSON string into an array", field),
            Self::TemplateLiteral { field } => {
                write!(f, "'{}' is an unexpanded template literal where an array is required", field)
            }
            Self::MissingRequired { field } => write!(f, "required argument '{}' is missing", field),
            Self::TypeMismatch {
                field,
                expected,
                found,
            } => write!(f, "'{}' expected {}, got {}", field, expected, found),
            Self::NotAnObject { found } => write!(f, "arguments must be an object, got {}", found),
        }
    }
}

/// Result of checking a tool call's arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid(Value),
    /// Arguments were repaired; `args` is what the tool should receive.
    Corrected { args: Value, issues: Vec<ArgIssue> },
    /// The call cannot be made.
    Rejected { issues: Vec<ArgIssue> },
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

fn is_template_literal(s: &str) -> bool {
    s.contains("${") || s.contains('`') || (s.contains("{{") && s.contains("}}"))
}

/// Check `input` against `schema`, coercing recoverable scalar mismatches.
pub fn validate_args(schema: &Value, input: &Value) -> ValidationOutcome {
    let args = match input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return ValidationOutcome::Rejected {
                issues: vec![ArgIssue::NotAnObject {
                    found: type_name(other).to_string(),
                }],
            }
        }
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut corrected = args.clone();
    let mut corrections = Vec::new();
    let mut failures = Vec::new();

    for field in required {
        if args.get(field).map_or(true, Value::is_null) {
            failures.push(ArgIssue::MissingRequired {
                field: field.to_string(),
            });
        }
    }

    for (field, value) in &args {
        let Some(expected) = properties
            .get(field)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        match coerce(field, expected, value) {
            Coercion::Unchanged => {}
            Coercion::Fixed(new_value, issue) => {
                corrected.insert(field.clone(), new_value);
                corrections.push(issue);
            }
            Coercion::Failed(issue) => failures.push(issue),
        }
    }

    if !failures.is_empty() {
        ValidationOutcome::Rejected { issues: failures }
    } else if !corrections.is_empty() {
        ValidationOutcome::Corrected {
            args: Value::Object(corrected),
            issues: corrections,
        }
    } else {
        ValidationOutcome::Valid(Value::Object(args))
    }
}

enum Coercion {
    Unchanged,
    Fixed(Value, ArgIssue),
    Failed(ArgIssue),
}

fn coerce(field: &str, expected: &str, value: &Value) -> Coercion {
    let field_s = field.to_string();
    let mismatch = || {
        Coercion::Failed(ArgIssue::TypeMismatch {
            field: field.to_string(),
            expected: expected.to_string(),
            found: type_name(value).to_string(),
        })
    };

    match (expected, value) {
        ("string", Value::String(_))
        | ("boolean", Value::Bool(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_))
        | ("number", Value::Number(_)) => Coercion::Unchanged,
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Coercion::Unchanged,

        ("number" | "integer", Value::String(s)) => {
            let parsed = if expected == "integer" {
                s.trim().parse::<i64>().ok().map(Value::from)
            } else {
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            };
            match parsed {
                Some(v) => Coercion::Fixed(v, ArgIssue::CoercedToNumber { field: field_s }),
                None => mismatch(),
            }
        }
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Coercion::Fixed(Value::Bool(true), ArgIssue::CoercedToBool { field: field_s }),
            "false" => Coercion::Fixed(Value::Bool(false), ArgIssue::CoercedToBool { field: field_s }),
            _ => mismatch(),
        },
        ("string", Value::Number(n)) => Coercion::Fixed(
            Value::String(n.to_string()),
            ArgIssue::CoercedToString { field: field_s },
        ),
        ("string", Value::Bool(b)) => Coercion::Fixed(
            Value::String(b.to_string()),
            ArgIssue::CoercedToString { field: field_s },
        ),
        ("array", Value::String(s)) => {
            if is_template_literal(s) {
                return Coercion::Failed(ArgIssue::TemplateLiteral { field: field_s });
            }
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(items)) => {
                    Coercion::Fixed(Value::Array(items), ArgIssue::ParsedArray { field: field_s })
                }
                _ => mismatch(),
            }
        }
        _ => mismatch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "values": { "type": "array" },
                "limit": { "type": "integer" },
                "scale": { "type": "number" },
                "verbose": { "type": "boolean" },
                "label": { "type": "string" }
            },
            "required": ["values"]
        })
    }

    #[test]
    fn test_valid_args_pass_through() {
        let input = json!({"values": [1, 2], "limit": 3, "label": "x"});
        assert_eq!(validate_args(&schema(), &input), ValidationOutcome::Valid(input));
    }

    #[test]
    fn test_scalar_coercions_are_recorded() {
        let input = json!({
            "values": "[1, 2, 3]",
            "limit": "5",
            "scale": "0.5",
            "verbose": "true",
            "label": 7
        });
        match validate_args(&schema(), &input) {
            ValidationOutcome::Corrected { args, issues } => {
                assert_eq!(args["values"], json!([1, 2, 3]));
                assert_eq!(args["limit"], json!(5));
                assert_eq!(args["scale"], json!(0.5));
                assert_eq!(args["verbose"], json!(true));
                assert_eq!(args["label"], json!("7"));
                assert_eq!(issues.len(), 5);
                assert!(issues.iter().all(ArgIssue::is_correction));
            }
            other => panic!("expected correction, got {:?}", other),
        }
    }

    #[test]
    fn test_template_literal_for_array_is_rejected() {
        let input = json!({"values": "${previous.values}"});
        match validate_args(&schema(), &input) {
            ValidationOutcome::Rejected { issues } => {
                assert_eq!(issues, vec![ArgIssue::TemplateLiteral { field: "values".into() }]);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_is_rejected() {
        let outcome = validate_args(&schema(), &json!({"limit": 1}));
        assert_eq!(
            outcome,
            ValidationOutcome::Rejected {
                issues: vec![ArgIssue::MissingRequired { field: "values".into() }]
            }
        );
    }

    #[test]
    fn test_other_mismatch_is_rejected() {
        let outcome = validate_args(&schema(), &json!({"values": [1], "verbose": "maybe"}));
        assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));

        let outcome = validate_args(&schema(), &json!({"values": {"a": 1}}));
        assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
    }

    #[test]
    fn test_non_object_arguments() {
        let outcome = validate_args(&schema(), &json!("values"));
        assert_eq!(
            outcome,
            ValidationOutcome::Rejected {
                issues: vec![ArgIssue::NotAnObject { found: "string".into() }]
            }
        );
    }

    #[test]
    fn test_unknown_fields_are_left_alone() {
        let input = json!({"values": [], "extra": "x"});
        assert!(matches!(validate_args(&schema(), &input), ValidationOutcome::Valid(_)));
    }
}
