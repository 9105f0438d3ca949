use crate::condition::{self, evaluate, evaluate_config};
use crate::executor::BlockExecutor;
use crate::loop_control::{self, create_loop_state, should_continue};
use hydrocore::params::{IfParams, LoopParams, Operands};
use hydrocore::{
    ports, BlockError, BlockNode, ConditionError, ExecutionContext, ExecutionResult, LogLevel, Value,
};
use serde_json::json;

/// Right-hand operand: a global variable when selected, otherwise the literal
/// comparison value (0 when absent).
fn right_operand(operands: &Operands, ctx: &ExecutionContext) -> Result<Value, BlockError> {
    if operands.use_global_variable {
        if let Some(name) = operands.selected_global_variable.as_deref().filter(|n| !n.is_empty()) {
            return ctx
                .get_variable(name)
                .cloned()
                .ok_or_else(|| BlockError::VariableNotFound(name.to_string()));
        }
    }
    Ok(operands.comparison_value.clone().unwrap_or(Value::Number(0.0)))
}

pub(crate) fn branch(block: &BlockNode, ctx: &mut ExecutionContext) -> Result<ExecutionResult, BlockError> {
    let params: IfParams = block.params()?;
    let spec = params.conditions.first().ok_or(ConditionError::NoCondition)?;

    let variable = &params.operands.variable;
    let left = ctx
        .get_variable(variable)
        .cloned()
        .ok_or_else(|| ConditionError::UnknownVariable(variable.clone()))?;
    let right = right_operand(&params.operands, ctx)?;

    let result = evaluate(&left, spec.operator, &right, spec.data_type, params.operands.tolerance)?;
    let port = if result {
        ports::FLOW_OUT_TRUE
    } else {
        ports::FLOW_OUT_FALSE
    };

    ctx.add_log(
        format!(
            "IF {} ({}) {} {} -> {}",
            variable, left, spec.operator, right, result
        ),
        LogLevel::Info,
        Some(&block.id),
    );

    Ok(ExecutionResult::success(port).with_data(json!({
        "result": result,
        "leftValue": left,
        "rightValue": right,
        "operator": spec.operator,
        "tolerance": params.operands.tolerance,
    })))
}

/// Loop block. The configured condition is an exit condition: the loop
/// repeats until it holds or the iteration bound is reached. Iteration
/// state is kept per block id for the whole run, so revisiting the block
/// continues counting.
pub(crate) async fn repeat(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
) -> Result<ExecutionResult, BlockError> {
    let params: LoopParams = block.params()?;
    if params.conditions.is_empty() && params.max_iterations.is_none() {
        return Err(BlockError::InvalidParameters(
            "loop needs maxIterations or a condition".to_string(),
        ));
    }

    let state = ctx.block_state(&block.id);
    if state.completed {
        ctx.add_log("Loop already completed, continuing", LogLevel::Debug, Some(&block.id));
        return Ok(exit_result(state.iterations, "Loop already completed"));
    }

    let kind = params.kind();
    let condition = if params.conditions.is_empty() {
        None
    } else {
        params.condition(right_operand(&params.operands, ctx)?)
    };
    if let Some(c) = &condition {
        let problems = condition::validate_condition(c);
        if !problems.is_empty() {
            return Err(BlockError::InvalidParameters(problems.join("; ")));
        }
    }

    let mut loop_state = create_loop_state(
        &block.id,
        kind,
        params.max_iterations,
        condition,
        params.delay,
    );
    loop_state.current_iteration = state.iterations;

    if ctx.active_loop(&block.id).is_none() {
        ctx.add_log(loop_control::describe(&loop_state), LogLevel::Info, Some(&block.id));
        ctx.add_active_loop(loop_state.clone());
        ctx.enter_loop_context(&block.id);
    }

    let variables = ctx.variables();
    let tolerance = params.operands.tolerance;
    let decision = should_continue(&loop_state, |c| {
        evaluate_config(c, &variables, tolerance).map(|exit_met| !exit_met)
    })?;

    if !decision.proceed {
        ctx.block_state_mut(&block.id).completed = true;
        ctx.remove_active_loop(&block.id);
        ctx.exit_loop_context(&block.id);
        ctx.add_log(
            format!("Loop finished after {} iterations: {}", state.iterations, decision.reason),
            LogLevel::Info,
            Some(&block.id),
        );
        return Ok(exit_result(state.iterations, &decision.reason));
    }

    let iteration = state.iterations + 1;
    ctx.block_state_mut(&block.id).iterations = iteration;
    ctx.update_loop_iteration(&block.id, iteration);
    ctx.add_log(
        format!("Loop iteration {}: {}", iteration, decision.reason),
        LogLevel::Info,
        Some(&block.id),
    );

    if params.delay > 0.0 {
        exec.wait_secs(params.delay).await;
    }

    Ok(ExecutionResult::success(ports::LOOP_OUT).with_data(json!({
        "iteration": iteration,
        "maxIterations": params.max_iterations,
        "reason": decision.reason,
    })))
}

fn exit_result(iterations: u32, reason: &str) -> ExecutionResult {
    ExecutionResult::success(ports::FLOW_OUT).with_data(json!({
        "iterations": iterations,
        "reason": reason,
    }))
}
