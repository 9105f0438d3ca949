//! Comparison evaluation for IF and LOOP blocks.

use hydrocore::{ConditionConfig, ConditionError, DataType, Operator, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How multiple conditions combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

/// Coerces `value` to `target`. Failing to read a number is an error.
pub fn coerce(value: &Value, target: DataType) -> Result<Value, ConditionError> {
    match target {
        DataType::Number => {
            let n = match value {
                Value::Number(n) => Some(*n),
                Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Text(s) => s.trim().parse::<f64>().ok(),
            };
            n.filter(|n| !n.is_nan())
                .map(Value::Number)
                .ok_or_else(|| ConditionError::Coercion {
                    value: value.to_string(),
                    target: target.to_string(),
                })
        }
        DataType::String => Ok(Value::Text(value.to_string())),
        DataType::Boolean => {
            let b = match value {
                Value::Boolean(b) => *b,
                Value::Number(n) => *n != 0.0,
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" | "" => false,
                    _ => true,
                },
            };
            Ok(Value::Boolean(b))
        }
    }
}

/// Compares `left` with `right` after coercing both to `data_type`.
///
/// A positive `tolerance` turns numeric comparisons into band checks:
/// equality means `left` lies in `[right - tol, right + tol]`, greater
/// comparisons use `right - tol` and less comparisons use `right + tol`.
pub fn evaluate(
    left: &Value,
    operator: Operator,
    right: &Value,
    data_type: DataType,
    tolerance: f64,
) -> Result<bool, ConditionError> {
    let left = coerce(left, data_type)?;
    let right = coerce(right, data_type)?;

    match (&left, &right) {
        (Value::Number(l), Value::Number(r)) => Ok(compare_numbers(*l, operator, *r, tolerance)),
        (Value::Text(l), Value::Text(r)) => Ok(compare_ordered(l.cmp(r), operator)),
        (Value::Boolean(l), Value::Boolean(r)) => Ok(match operator {
            Operator::Equals => l == r,
            Operator::NotEquals => l != r,
            _ => false,
        }),
        _ => Ok(false),
    }
}

fn compare_numbers(l: f64, operator: Operator, r: f64, tolerance: f64) -> bool {
    if tolerance > 0.0 {
        let within = l >= r - tolerance && l <= r + tolerance;
        return match operator {
            Operator::Equals => within,
            Operator::NotEquals => !within,
            Operator::GreaterThan => l > r - tolerance,
            Operator::GreaterEqual => l >= r - tolerance,
            Operator::LessThan => l < r + tolerance,
            Operator::LessEqual => l <= r + tolerance,
        };
    }

    match l.partial_cmp(&r) {
        Some(ordering) => compare_ordered(ordering, operator),
        None => operator == Operator::NotEquals,
    }
}

fn compare_ordered(ordering: Ordering, operator: Operator) -> bool {
    match operator {
        Operator::Equals => ordering == Ordering::Equal,
        Operator::NotEquals => ordering != Ordering::Equal,
        Operator::GreaterThan => ordering == Ordering::Greater,
        Operator::LessThan => ordering == Ordering::Less,
        Operator::GreaterEqual => ordering != Ordering::Less,
        Operator::LessEqual => ordering != Ordering::Greater,
    }
}

/// Evaluates a resolved condition against a variable map.
pub fn evaluate_config(
    condition: &ConditionConfig,
    variables: &BTreeMap<String, Value>,
    tolerance: f64,
) -> Result<bool, ConditionError> {
    let left = variables
        .get(&condition.left_variable)
        .ok_or_else(|| ConditionError::UnknownVariable(condition.left_variable.clone()))?;
    evaluate(
        left,
        condition.operator,
        &condition.right_value,
        condition.data_type,
        tolerance,
    )
}

/// Combines several conditions. An empty list is true.
pub fn evaluate_all(
    conditions: &[ConditionConfig],
    variables: &BTreeMap<String, Value>,
    logic: Logic,
) -> Result<bool, ConditionError> {
    let mut results = conditions
        .iter()
        .map(|c| evaluate_config(c, variables, 0.0));
    match logic {
        Logic::And => {
            for r in results.by_ref() {
                if !r? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Logic::Or => {
            if conditions.is_empty() {
                return Ok(true);
            }
            for r in results {
                if r? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Problems that would make a condition unusable.
pub fn validate_condition(condition: &ConditionConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if condition.left_variable.trim().is_empty() {
        errors.push("Left variable name is required".to_string());
    }
    if coerce(&condition.right_value, condition.data_type).is_err() {
        errors.push(format!(
            "Right value \"{}\" is not compatible with type {}",
            condition.right_value, condition.data_type
        ));
    }
    errors
}

pub fn describe(condition: &ConditionConfig) -> String {
    let verb = match condition.operator {
        Operator::Equals => "equals",
        Operator::NotEquals => "does not equal",
        Operator::GreaterThan => "is greater than",
        Operator::LessThan => "is less than",
        Operator::GreaterEqual => "is greater than or equal to",
        Operator::LessEqual => "is less than or equal to",
    };
    format!("{} {} {}", condition.left_variable, verb, condition.right_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn tolerance_band_is_symmetric() {
        let target = 6.0;
        let tol = 0.5;
        for i in 0..=40 {
            let x = 5.0 + i as f64 * 0.05;
            let inside = x >= target - tol && x <= target + tol;
            let eq = evaluate(&num(x), Operator::Equals, &num(target), DataType::Number, tol).unwrap();
            let ne = evaluate(&num(x), Operator::NotEquals, &num(target), DataType::Number, tol).unwrap();
            assert_eq!(eq, inside, "x = {x}");
            assert_eq!(ne, !eq, "x = {x}");
        }
    }

    #[test]
    fn tolerance_shifts_thresholds() {
        let t = DataType::Number;
        assert!(evaluate(&num(9.6), Operator::GreaterThan, &num(10.0), t, 0.5).unwrap());
        assert!(!evaluate(&num(9.4), Operator::GreaterEqual, &num(10.0), t, 0.5).unwrap());
        assert!(evaluate(&num(10.4), Operator::LessThan, &num(10.0), t, 0.5).unwrap());
        assert!(evaluate(&num(10.5), Operator::LessEqual, &num(10.0), t, 0.5).unwrap());
        assert!(!evaluate(&num(10.4), Operator::LessThan, &num(10.0), t, 0.0).unwrap());
    }

    #[test]
    fn number_coercion_failure_is_an_error() {
        let err = evaluate(&Value::from("abc"), Operator::Equals, &num(1.0), DataType::Number, 0.0);
        assert!(matches!(err, Err(ConditionError::Coercion { .. })));
        assert!(evaluate(&Value::from("15"), Operator::GreaterEqual, &num(10.0), DataType::Number, 0.0).unwrap());
    }

    #[test]
    fn strings_ignore_tolerance() {
        let t = DataType::String;
        assert!(evaluate(&Value::from("b"), Operator::GreaterThan, &Value::from("a"), t, 5.0).unwrap());
        assert!(!evaluate(&Value::from("a"), Operator::Equals, &Value::from("b"), t, 5.0).unwrap());
    }

    #[test]
    fn boolean_coercion() {
        let t = DataType::Boolean;
        assert!(evaluate(&Value::from("yes"), Operator::Equals, &Value::from(true), t, 0.0).unwrap());
        assert!(evaluate(&num(0.0), Operator::Equals, &Value::from("false"), t, 0.0).unwrap());
        assert!(!evaluate(&Value::from(true), Operator::GreaterThan, &Value::from(false), t, 0.0).unwrap());
    }

    #[test]
    fn combined_conditions() {
        let mut vars = BTreeMap::new();
        vars.insert("ph".to_string(), num(6.2));
        vars.insert("ec".to_string(), num(1.1));
        let ph_ok = ConditionConfig {
            left_variable: "ph".into(),
            operator: Operator::LessThan,
            right_value: num(6.5),
            data_type: DataType::Number,
        };
        let ec_high = ConditionConfig {
            left_variable: "ec".into(),
            operator: Operator::GreaterThan,
            right_value: num(2.0),
            data_type: DataType::Number,
        };
        let both = [ph_ok.clone(), ec_high.clone()];
        assert!(!evaluate_all(&both, &vars, Logic::And).unwrap());
        assert!(evaluate_all(&both, &vars, Logic::Or).unwrap());
        assert!(evaluate_all(&[], &vars, Logic::And).unwrap());
        assert_eq!(describe(&ph_ok), "ph is less than 6.5");
    }

    #[test]
    fn missing_variable_is_reported() {
        let cond = ConditionConfig {
            left_variable: "nope".into(),
            operator: Operator::Equals,
            right_value: num(1.0),
            data_type: DataType::Number,
        };
        assert_eq!(
            evaluate_config(&cond, &BTreeMap::new(), 0.0),
            Err(ConditionError::UnknownVariable("nope".into()))
        );
        let bad = ConditionConfig {
            left_variable: String::new(),
            right_value: Value::from("x"),
            ..cond
        };
        assert_eq!(validate_condition(&bad).len(), 2);
    }
}
