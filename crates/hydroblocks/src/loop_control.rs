use hydrocore::{ConditionConfig, ConditionError, LoopKind, LoopState};

/// Upper bound accepted for `maxIterations`.
pub const MAX_ITERATIONS_LIMIT: u32 = 10_000;
/// Longest accepted delay between iterations, in seconds.
pub const MAX_DELAY_SECS: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDecision {
    pub proceed: bool,
    pub reason: String,
}

impl LoopDecision {
    fn proceed(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            reason: reason.into(),
        }
    }

    fn exit(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: reason.into(),
        }
    }
}

pub fn create_loop_state(
    block_id: &str,
    kind: LoopKind,
    max_iterations: Option<u32>,
    condition: Option<ConditionConfig>,
    delay_secs: f64,
) -> LoopState {
    LoopState {
        block_id: block_id.to_string(),
        kind,
        current_iteration: 0,
        max_iterations,
        condition,
        delay_secs,
    }
}

/// Decides whether `state` runs another iteration.
///
/// `predicate` answers "should the loop keep going" for the loop's condition;
/// callers with exit-condition semantics pass the negated comparison.
pub fn should_continue<F>(state: &LoopState, predicate: F) -> Result<LoopDecision, ConditionError>
where
    F: FnOnce(&ConditionConfig) -> Result<bool, ConditionError>,
{
    let max = state.max_iterations.filter(|m| *m > 0);
    match state.kind {
        LoopKind::Repeat => {
            let Some(max) = max else {
                return Ok(LoopDecision::exit("REPEAT loop requires maxIterations"));
            };
            if state.current_iteration >= max {
                return Ok(LoopDecision::exit(format!("Reached maximum iterations ({})", max)));
            }
            Ok(LoopDecision::proceed(format!(
                "Iteration {} of {}",
                state.current_iteration + 1,
                max
            )))
        }
        LoopKind::While => {
            let Some(condition) = &state.condition else {
                return Ok(LoopDecision::exit("WHILE loop requires a condition"));
            };
            if predicate(condition)? {
                Ok(LoopDecision::proceed("Condition allows another iteration"))
            } else {
                Ok(LoopDecision::exit("Exit condition met"))
            }
        }
        LoopKind::WhileWithMax => {
            let Some(condition) = &state.condition else {
                return Ok(LoopDecision::exit("WHILE_MAX loop requires a condition"));
            };
            let Some(max) = max else {
                return Ok(LoopDecision::exit("WHILE_MAX loop requires maxIterations"));
            };
            if !predicate(condition)? {
                return Ok(LoopDecision::exit("Exit condition met"));
            }
            if state.current_iteration >= max {
                return Ok(LoopDecision::exit(format!("Reached maximum iterations ({})", max)));
            }
            Ok(LoopDecision::proceed(format!(
                "Condition allows another iteration ({}/{})",
                state.current_iteration + 1,
                max
            )))
        }
    }
}

pub fn validate_loop_config(
    kind: LoopKind,
    max_iterations: Option<u32>,
    condition: Option<&ConditionConfig>,
    delay_secs: f64,
) -> Vec<String> {
    let mut errors = Vec::new();
    let has_max = max_iterations.is_some_and(|m| m > 0);

    match kind {
        LoopKind::Repeat if !has_max => errors.push("REPEAT loop requires maxIterations > 0".to_string()),
        LoopKind::While if condition.is_none() => errors.push("WHILE loop requires a condition".to_string()),
        LoopKind::WhileWithMax => {
            if condition.is_none() {
                errors.push("WHILE_MAX loop requires a condition".to_string());
            }
            if !has_max {
                errors.push("WHILE_MAX loop requires maxIterations > 0".to_string());
            }
        }
        _ => {}
    }

    if max_iterations.is_some_and(|m| m > MAX_ITERATIONS_LIMIT) {
        errors.push(format!("maxIterations should not exceed {}", MAX_ITERATIONS_LIMIT));
    }
    if !(0.0..=MAX_DELAY_SECS).contains(&delay_secs) {
        errors.push(format!("delay should be between 0 and {} seconds", MAX_DELAY_SECS));
    }
    errors
}

pub fn describe(state: &LoopState) -> String {
    let mut description = match state.kind {
        LoopKind::Repeat => "REPEAT loop".to_string(),
        LoopKind::While => "WHILE loop".to_string(),
        LoopKind::WhileWithMax => "WHILE_MAX loop".to_string(),
    };
    if let Some(c) = &state.condition {
        description.push_str(&format!(" until not {} {} {}", c.left_variable, c.operator, c.right_value));
    }
    if let Some(max) = state.max_iterations {
        description.push_str(&format!(" ({}/{})", state.current_iteration, max));
    }
    if state.delay_secs > 0.0 {
        description.push_str(&format!(" with {}s delay", state.delay_secs));
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::{DataType, Operator, Value};

    fn condition() -> ConditionConfig {
        ConditionConfig {
            left_variable: "level".into(),
            operator: Operator::GreaterEqual,
            right_value: Value::Number(80.0),
            data_type: DataType::Number,
        }
    }

    #[test]
    fn repeat_counts_to_max() {
        let mut state = create_loop_state("l", LoopKind::Repeat, Some(2), None, 0.0);
        assert!(should_continue(&state, |_| Ok(true)).unwrap().proceed);
        state.current_iteration = 2;
        let decision = should_continue(&state, |_| Ok(true)).unwrap();
        assert!(!decision.proceed);
        assert_eq!(decision.reason, "Reached maximum iterations (2)");
    }

    #[test]
    fn repeat_without_max_exits() {
        let state = create_loop_state("l", LoopKind::Repeat, None, None, 0.0);
        assert!(!should_continue(&state, |_| Ok(true)).unwrap().proceed);
    }

    #[test]
    fn while_follows_predicate() {
        let state = create_loop_state("l", LoopKind::While, None, Some(condition()), 0.0);
        assert!(should_continue(&state, |_| Ok(true)).unwrap().proceed);
        assert!(!should_continue(&state, |_| Ok(false)).unwrap().proceed);
    }

    #[test]
    fn while_with_max_checks_condition_before_bound() {
        let mut state = create_loop_state("l", LoopKind::WhileWithMax, Some(3), Some(condition()), 0.0);
        state.current_iteration = 3;
        let decision = should_continue(&state, |_| Ok(false)).unwrap();
        assert_eq!(decision.reason, "Exit condition met");
        let decision = should_continue(&state, |_| Ok(true)).unwrap();
        assert_eq!(decision.reason, "Reached maximum iterations (3)");
    }

    #[test]
    fn predicate_errors_propagate() {
        let state = create_loop_state("l", LoopKind::While, None, Some(condition()), 0.0);
        let result = should_continue(&state, |c| Err(ConditionError::UnknownVariable(c.left_variable.clone())));
        assert!(result.is_err());
    }

    #[test]
    fn config_validation() {
        assert!(validate_loop_config(LoopKind::Repeat, Some(5), None, 1.0).is_empty());
        assert_eq!(validate_loop_config(LoopKind::WhileWithMax, None, None, 0.0).len(), 2);
        assert_eq!(validate_loop_config(LoopKind::Repeat, Some(20_000), None, -1.0).len(), 2);
    }
}
