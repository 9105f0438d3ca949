use hydrocore::params::{
    ErrorHandlerParams, ErrorLogLevel, ErrorStrategy, RecoveryAction, RetryFallback,
};
use hydrocore::{ports, BlockError, BlockNode, ExecutionContext, ExecutionResult, LogLevel};
use serde_json::json;

/// Error-handler block reached through the graph. Retries of the failed
/// block are driven by the interpreter; here a retry strategy only decides
/// where the flow goes once those retries are spent.
pub(crate) fn execute(block: &BlockNode, ctx: &mut ExecutionContext) -> Result<ExecutionResult, BlockError> {
    let params: ErrorHandlerParams = block.params()?;

    let Some(source) = ctx.last_error().cloned() else {
        ctx.add_log("ErrorHandler: no source error found", LogLevel::Warn, Some(&block.id));
        return Ok(ExecutionResult::success(ports::FLOW_OUT).with_data(json!({ "noError": true })));
    };

    ctx.add_log(
        format!("ErrorHandler: processing {} from block {}", source.kind, source.block_id),
        LogLevel::Info,
        Some(&block.id),
    );

    let critical = params.is_critical(source.kind.as_str());
    let log_it = match params.log_level {
        ErrorLogLevel::All => true,
        ErrorLogLevel::CriticalOnly => critical,
        ErrorLogLevel::Silent => false,
    };
    if log_it {
        let level = if critical { LogLevel::Error } else { LogLevel::Warn };
        ctx.add_log(format!("Error logged: {}", source.message), level, Some(&block.id));
    }

    if !params.user_message.trim().is_empty() {
        ctx.add_log(
            format!("User notification: {}", params.user_message),
            LogLevel::Info,
            Some(&block.id),
        );
    }

    if critical && params.recovery_actions != RecoveryAction::None {
        recover(params.recovery_actions, block, ctx);
        if params.recovery_actions == RecoveryAction::EmergencyStop {
            return Ok(ExecutionResult::success(ports::FLOW_OUT_STOP).with_data(json!({
                "critical": true,
                "recoveryAction": "emergency_stop",
                "sourceError": source.kind,
            })));
        }
    }

    let (port, strategy) = match params.error_strategy {
        ErrorStrategy::LogContinue => (ports::FLOW_OUT, "continue"),
        ErrorStrategy::LogStop => (ports::FLOW_OUT_STOP, "stop"),
        ErrorStrategy::Retry => match params.retry_fallback {
            RetryFallback::FallbackContinue => (ports::FLOW_OUT, "retry_fallback_continue"),
            RetryFallback::FallbackStop => (ports::FLOW_OUT_STOP, "retry_fallback_stop"),
            RetryFallback::FallbackEmergency => {
                recover(RecoveryAction::EmergencyStop, block, ctx);
                (ports::FLOW_OUT_STOP, "retry_fallback_emergency")
            }
        },
    };
    ctx.add_log(
        format!("ErrorHandler: applying strategy {}", strategy),
        LogLevel::Info,
        Some(&block.id),
    );

    Ok(ExecutionResult::success(port).with_data(json!({
        "strategy": strategy,
        "critical": critical,
        "sourceError": source.kind,
        "sourceBlockId": source.block_id,
    })))
}

fn recover(action: RecoveryAction, block: &BlockNode, ctx: &mut ExecutionContext) {
    match action {
        RecoveryAction::None => {}
        RecoveryAction::RestartModule => {
            ctx.add_log("Recovery: restart of the affected module requested", LogLevel::Info, Some(&block.id));
        }
        RecoveryAction::ClearContext => {
            ctx.add_log("Recovery: clearing user variables", LogLevel::Info, Some(&block.id));
            let user_variables: Vec<String> = ctx
                .variable_names()
                .into_iter()
                .filter(|k| !k.starts_with("system_") && !k.starts_with("global_"))
                .collect();
            for name in user_variables {
                ctx.clear_variable(&name);
            }
        }
        RecoveryAction::EmergencyStop => {
            ctx.add_log("Recovery: emergency stop", LogLevel::Error, Some(&block.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::{ErrorKind, ExecutionError, Severity, Value};

    fn handler(params: serde_json::Value) -> BlockNode {
        let mut node = BlockNode {
            id: "eh".into(),
            definition_id: "errorHandler".into(),
            kind: Some(hydrocore::BlockKind::ErrorHandler),
            parameters: Default::default(),
            input_ports: vec![],
            output_ports: vec![],
        };
        if let serde_json::Value::Object(map) = params {
            node.parameters = map;
        }
        node
    }

    fn failed_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("f");
        ctx.add_error(ExecutionError::new(
            ErrorKind::DeviceNotResponding,
            "pump offline",
            "a1",
            Severity::High,
        ));
        ctx
    }

    #[test]
    fn without_error_continues() {
        let mut ctx = ExecutionContext::new("f");
        let result = execute(&handler(json!({})), &mut ctx).unwrap();
        assert_eq!(result.output_port, ports::FLOW_OUT);
    }

    #[test]
    fn strategies_pick_ports() {
        let mut ctx = failed_context();
        let stop = execute(&handler(json!({"errorStrategy": "log_stop"})), &mut ctx).unwrap();
        assert_eq!(stop.output_port, ports::FLOW_OUT_STOP);

        let retry = execute(
            &handler(json!({"errorStrategy": "retry", "retryFallback": "fallback_continue"})),
            &mut ctx,
        )
        .unwrap();
        assert_eq!(retry.output_port, ports::FLOW_OUT);
    }

    #[test]
    fn clear_context_keeps_system_and_global_variables() {
        let mut ctx = failed_context();
        ctx.set_variable("system_mode", Value::from("auto"), None).unwrap();
        ctx.set_variable("global_target", Value::Number(6.0), None).unwrap();
        ctx.set_variable("ph", Value::Number(5.8), None).unwrap();
        ctx.declare_variable("dose_ml", None).unwrap();

        let block = handler(json!({
            "criticalErrors": "DEVICE_NOT_RESPONDING, sensor_timeout",
            "recoveryActions": "clear_context",
        }));
        let result = execute(&block, &mut ctx).unwrap();

        assert_eq!(result.output_port, ports::FLOW_OUT);
        assert!(ctx.has_variable("system_mode"));
        assert!(ctx.has_variable("global_target"));
        assert!(!ctx.has_variable("ph"));
        assert!(!ctx.has_variable("dose_ml"));
    }

    #[test]
    fn emergency_recovery_only_for_critical_errors() {
        let block = handler(json!({
            "criticalErrors": "hardware_failure",
            "recoveryActions": "emergency_stop",
        }));
        let mut ctx = failed_context();
        assert_eq!(execute(&block, &mut ctx).unwrap().output_port, ports::FLOW_OUT);

        let block = handler(json!({
            "criticalErrors": "device_not_responding",
            "recoveryActions": "emergency_stop",
        }));
        assert_eq!(execute(&block, &mut ctx).unwrap().output_port, ports::FLOW_OUT_STOP);
    }
}
