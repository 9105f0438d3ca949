use crate::executor::{BlockExecutor, Deadline};
use crate::wait::{self, WaitOutcome};
use hydrocore::params::{require, ActuatorParams};
use hydrocore::{
    ports, BlockError, BlockNode, DeviceCommand, DeviceError, ExecutionContext, ExecutionResult,
    LogLevel,
};
use serde_json::json;

pub(crate) async fn execute(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
    deadline: &Deadline,
) -> Result<ExecutionResult, BlockError> {
    let params: ActuatorParams = block.params()?;

    let mut duration = params.duration;
    if params.use_global_variable {
        let global = ctx
            .get_variable(&params.selected_global_variable)
            .and_then(|v| v.as_f64());
        if let Some(global) = global {
            duration = global;
            ctx.add_log(
                format!(
                    "Using global variable {} for duration: {}s",
                    params.selected_global_variable, duration
                ),
                LogLevel::Info,
                Some(&block.id),
            );
        }
    }

    let device_id = require(&params.device_id, "deviceId")?;
    let action = params
        .action_type
        .ok_or_else(|| BlockError::MissingParameter("actionType".to_string()))?;

    let gateway = &exec.services().gateway;
    let device = gateway.resolve_device(device_id).await?;
    if !device.is_active {
        return Err(DeviceError::Inactive(device.id.clone()).into());
    }

    let mut hardware_state = None;
    if gateway.has_live_connection(&device.controller_id) {
        let reply = gateway
            .send_command(
                &device.controller_id,
                DeviceCommand::control(&device, action, duration, &params),
            )
            .await?;
        if !reply.ok {
            return Err(DeviceError::CommandRejected {
                device_id: device.id.clone(),
                message: reply.error.unwrap_or_else(|| "unknown device error".to_string()),
            }
            .into());
        }
        hardware_state = reply
            .data
            .as_ref()
            .and_then(|d| d.get("hardwareState"))
            .cloned();
        ctx.add_log(
            format!("{} -> {} ({}s)", device.name, action.as_str(), duration),
            LogLevel::Info,
            Some(&block.id),
        );

        if let Some(closing) = action.closing_action().filter(|_| duration > 0.0) {
            hold(exec, block, ctx, deadline, duration, &format!("{}_{}", action.as_str(), device.name)).await;

            let closing_command = DeviceCommand::control(&device, closing, 0.0, &params);
            match gateway.send_command(&device.controller_id, closing_command).await {
                Ok(reply) if reply.ok => ctx.add_log(
                    format!("{} -> {} (end of timed action)", device.name, closing.as_str()),
                    LogLevel::Info,
                    Some(&block.id),
                ),
                Ok(reply) => ctx.add_log(
                    format!(
                        "Closing command {} for {} failed: {}",
                        closing.as_str(),
                        device.name,
                        reply.error.unwrap_or_default()
                    ),
                    LogLevel::Warn,
                    Some(&block.id),
                ),
                Err(e) => ctx.add_log(
                    format!("Closing command {} for {} failed: {}", closing.as_str(), device.name, e),
                    LogLevel::Warn,
                    Some(&block.id),
                ),
            }
        }
    } else if gateway.has_fallback() {
        gateway.control_device(&device.id, action, duration).await?;
        ctx.add_log(
            format!("Fallback control: {} {} for {}s", device.id, action.as_str(), duration),
            LogLevel::Info,
            Some(&block.id),
        );
        if duration > 0.0 {
            hold(exec, block, ctx, deadline, duration, &format!("fallback_{}", device.name)).await;
        }
    } else {
        return Err(DeviceError::NotConnected {
            device_id: device.id.clone(),
            controller_id: device.controller_id.clone(),
        }
        .into());
    }

    Ok(ExecutionResult::success(ports::FLOW_OUT).with_data(json!({
        "deviceId": device.id,
        "deviceName": device.name,
        "actionType": action,
        "duration": duration,
        "powerLevel": params.power_level,
        "powerFrom": params.power_from,
        "powerTo": params.power_to,
        "hardwareState": hardware_state,
    })))
}

/// Holds the current device state for `secs`, honouring cancellation.
async fn hold(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
    deadline: &Deadline,
    secs: f64,
    label: &str,
) {
    if wait::secs(secs) > deadline.remaining() {
        ctx.add_log(
            format!(
                "{}: {}s hold exceeds the remaining block budget of {}s",
                label,
                secs,
                deadline.remaining().as_secs()
            ),
            LogLevel::Warn,
            Some(&block.id),
        );
    }

    if let WaitOutcome::Shortened { elapsed } = exec.wait_secs(secs).await {
        ctx.add_log(
            format!(
                "{}: cancelled, held {:.1}s of {}s",
                label,
                elapsed.as_secs_f64(),
                secs
            ),
            LogLevel::Warn,
            Some(&block.id),
        );
    }
}
