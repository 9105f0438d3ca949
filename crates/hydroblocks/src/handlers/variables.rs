use crate::condition::coerce;
use hydrocore::params::{require, SetVarDataParams, SetVarNameParams};
use hydrocore::{
    ports, BlockError, BlockNode, ExecutionContext, ExecutionResult, LogLevel, VariableHint,
};
use serde_json::json;

pub(crate) fn declare(block: &BlockNode, ctx: &mut ExecutionContext) -> Result<ExecutionResult, BlockError> {
    let params: SetVarNameParams = block.params()?;
    let name = require(&params.internal_var, "internalVar")?;
    let display_name = params
        .display_name
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(name)
        .to_string();
    let data_type = params.data_type.resolve();

    ctx.declare_variable(
        name,
        Some(
            VariableHint::from_block(&block.id)
                .display_name(display_name.clone())
                .data_type(data_type),
        ),
    )?;
    ctx.add_log(
        format!("Declared variable {} ({}) as {}", name, display_name, data_type),
        LogLevel::Info,
        Some(&block.id),
    );

    Ok(ExecutionResult::success(ports::SET_VAR_NAME_OUT).with_data(json!({
        "variableName": name,
        "displayName": display_name,
        "dataType": data_type,
    })))
}

/// Assigns a literal or another variable's value. A declared type is kept and
/// the new value is coerced to it.
pub(crate) fn assign(block: &BlockNode, ctx: &mut ExecutionContext) -> Result<ExecutionResult, BlockError> {
    let params: SetVarDataParams = block.params()?;
    let name = require(&params.variable_name, "variableName")?;

    let value = match params.source_variable.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(source) => ctx
            .get_variable(source)
            .cloned()
            .ok_or_else(|| BlockError::VariableNotFound(source.to_string()))?,
        None => params
            .value
            .clone()
            .ok_or_else(|| BlockError::MissingParameter("value".to_string()))?,
    };

    let mut hint = VariableHint::from_block(&block.id);
    let value = match ctx.variable_metadata(name) {
        Some(meta) => {
            hint = hint.display_name(meta.display_name.clone()).data_type(meta.data_type);
            hint.unit = meta.unit.clone();
            coerce(&value, meta.data_type)?
        }
        None => value,
    };

    ctx.set_variable(name, value.clone(), Some(hint))?;
    ctx.add_log(format!("Set {} = {}", name, value), LogLevel::Info, Some(&block.id));

    Ok(ExecutionResult::success(ports::FLOW_OUT).with_data(json!({
        "variableName": name,
        "value": value,
    })))
}
