use crate::executor::BlockExecutor;
use crate::wait::WaitOutcome;
use hydrocore::params::{require, GotoParams, WaitParams};
use hydrocore::{ports, BlockError, BlockNode, ExecutionContext, ExecutionResult, LogLevel};
use serde_json::json;

pub(crate) async fn wait(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
) -> Result<ExecutionResult, BlockError> {
    let params: WaitParams = block.params()?;
    let duration = params
        .duration
        .ok_or_else(|| BlockError::MissingParameter("duration".to_string()))?;
    if duration.is_nan() || duration <= 0.0 {
        return Err(BlockError::InvalidParameters(format!(
            "duration must be greater than 0, got {}",
            duration
        )));
    }

    ctx.add_log(format!("Waiting {}s", duration), LogLevel::Info, Some(&block.id));
    let waited = match exec.wait_secs(duration).await {
        WaitOutcome::Completed => duration,
        WaitOutcome::Shortened { elapsed } => {
            ctx.add_log(
                format!("Wait cancelled after {:.1}s of {}s", elapsed.as_secs_f64(), duration),
                LogLevel::Warn,
                Some(&block.id),
            );
            elapsed.as_secs_f64()
        }
    };

    Ok(ExecutionResult::success(ports::FLOW_OUT).with_data(json!({
        "duration": duration,
        "waited": waited,
    })))
}

pub(crate) fn goto(block: &BlockNode, ctx: &mut ExecutionContext) -> Result<ExecutionResult, BlockError> {
    let params: GotoParams = block.params()?;
    let target = require(&params.target_block_id, "targetBlockId")?;
    ctx.add_log(format!("GOTO: redirecting to {}", target), LogLevel::Info, Some(&block.id));
    Ok(ExecutionResult::redirect(target))
}

pub(crate) fn merge(block: &BlockNode, ctx: &mut ExecutionContext) -> ExecutionResult {
    ctx.add_log("Merge point reached", LogLevel::Debug, Some(&block.id));
    ExecutionResult::success(ports::FLOW_OUT)
}

pub(crate) fn start(block: &BlockNode, ctx: &mut ExecutionContext) -> ExecutionResult {
    ctx.add_log("Flow execution started", LogLevel::Info, Some(&block.id));
    ExecutionResult::success(ports::FLOW_OUT)
}

pub(crate) fn end(block: &BlockNode, ctx: &mut ExecutionContext) -> ExecutionResult {
    ctx.add_log("Flow execution completed", LogLevel::Info, Some(&block.id));
    ExecutionResult::success(ports::END)
}
