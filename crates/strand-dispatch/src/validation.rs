//! Parameter constraints checked after binding.

use serde_json::Value;

use crate::exception::DispatchError;
use crate::resource::{ParamSpec, ParamType};

/// A rule a bound parameter must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// The value must be present and not null.
    Required,
    /// Strings must contain a non-whitespace character. Implies `Required`.
    NotBlank,
    /// Minimum length of a string or array.
    MinLength(usize),
    /// Maximum length of a string or array.
    MaxLength(usize),
    /// Minimum numeric value.
    Min(f64),
    /// Maximum numeric value.
    Max(f64),
}

impl ParamType {
    /// Whether `value` has this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

/// Check `value` against the declared type and every constraint of `spec`.
///
/// Missing and null values pass unless the parameter is required.
pub fn validate(spec: &ParamSpec, value: Option<&Value>) -> Result<(), DispatchError> {
    let value = value.filter(|v| !v.is_null());
    let Some(value) = value else {
        let required = spec
            .constraints
            .iter()
            .any(|c| matches!(c, Constraint::Required | Constraint::NotBlank));
        return if required {
            Err(violation(spec, "is required"))
        } else {
            Ok(())
        };
    };

    if !spec.ty.accepts(value) {
        return Err(violation(spec, &format!("expected {:?}", spec.ty)));
    }

    for constraint in &spec.constraints {
        check(spec, constraint, value)?;
    }
    Ok(())
}

fn check(spec: &ParamSpec, constraint: &Constraint, value: &Value) -> Result<(), DispatchError> {
    match constraint {
        Constraint::Required => Ok(()),
        Constraint::NotBlank => match value.as_str() {
            Some(s) if s.trim().is_empty() => Err(violation(spec, "must not be blank")),
            _ => Ok(()),
        },
        Constraint::MinLength(min) => match length(value) {
            Some(len) if len < *min => {
                Err(violation(spec, &format!("length must be at least {min}")))
            }
            _ => Ok(()),
        },
        Constraint::MaxLength(max) => match length(value) {
            Some(len) if len > *max => {
                Err(violation(spec, &format!("length must be at most {max}")))
            }
            _ => Ok(()),
        },
        Constraint::Min(min) => match value.as_f64() {
            Some(n) if n < *min => Err(violation(spec, &format!("must be at least {min}"))),
            _ => Ok(()),
        },
        Constraint::Max(max) => match value.as_f64() {
            Some(n) if n > *max => Err(violation(spec, &format!("must be at most {max}"))),
            _ => Ok(()),
        },
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

fn violation(spec: &ParamSpec, message: &str) -> DispatchError {
    DispatchError::ParamValidation {
        param: spec.name.clone(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param_of(err: DispatchError) -> String {
        match err {
            DispatchError::ParamValidation { param, .. } => param,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_optional_missing_passes() {
        let spec = ParamSpec::body("nick", ParamType::String).max_length(3);
        assert!(validate(&spec, None).is_ok());
        assert!(validate(&spec, Some(&Value::Null)).is_ok());
    }

    #[test]
    fn test_required_missing_fails() {
        let spec = ParamSpec::body("name", ParamType::String).required();
        assert_eq!(param_of(validate(&spec, None).unwrap_err()), "name");
    }

    #[test]
    fn test_not_blank() {
        let spec = ParamSpec::body("name", ParamType::String).not_blank();
        assert!(validate(&spec, Some(&json!("  "))).is_err());
        assert!(validate(&spec, None).is_err());
        assert!(validate(&spec, Some(&json!("joe"))).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let spec = ParamSpec::body("age", ParamType::Integer);
        assert!(validate(&spec, Some(&json!("ten"))).is_err());
        assert!(validate(&spec, Some(&json!(1.5))).is_err());
        assert!(validate(&spec, Some(&json!(10))).is_ok());
    }

    #[test]
    fn test_length_and_range() {
        let name = ParamSpec::body("name", ParamType::String)
            .min_length(2)
            .max_length(4);
        assert!(validate(&name, Some(&json!("a"))).is_err());
        assert!(validate(&name, Some(&json!("abcde"))).is_err());
        assert!(validate(&name, Some(&json!("abc"))).is_ok());

        let age = ParamSpec::body("age", ParamType::Number).min(0.0).max(150.0);
        assert!(validate(&age, Some(&json!(-1))).is_err());
        assert!(validate(&age, Some(&json!(151))).is_err());
        assert!(validate(&age, Some(&json!(30))).is_ok());
    }
}
