use crate::executor::BlockExecutor;
use hydrocore::params::{require, SensorParams};
use hydrocore::{
    ports, BlockError, BlockNode, DataType, DeviceCommand, DeviceError, ExecutionContext,
    ExecutionResult, LogLevel, MonitoringSample, Value, VariableHint,
};
use serde_json::json;
use tokio::time::Duration;

/// Unit a reading of the given sensor type is reported in.
pub fn sensor_unit(sensor_type: &str) -> Option<&'static str> {
    match sensor_type {
        "ph" => Some("pH"),
        "ec" => Some("mS/cm"),
        "temp" | "temperature" => Some("°C"),
        "humidity" | "moisture" | "water_level" => Some("%"),
        _ => None,
    }
}

pub(crate) async fn execute(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
) -> Result<ExecutionResult, BlockError> {
    let params: SensorParams = block.params()?;
    let device_id = require(&params.device_id, "deviceId")?;
    let gateway = &exec.services().gateway;

    let device = gateway.resolve_device(device_id).await?;
    if !device.is_active {
        return Err(DeviceError::Inactive(device.id.clone()).into());
    }
    let sensor_type = device.sensor_type().to_string();

    let value = if gateway.has_live_connection(&device.controller_id) {
        let command = gateway.send_command(&device.controller_id, DeviceCommand::read(&device));
        let reply = match params.timeout {
            Some(ms) if ms > 0 => tokio::time::timeout(Duration::from_millis(ms), command)
                .await
                .map_err(|_| DeviceError::Timeout {
                    device_id: device.id.clone(),
                    timeout_ms: ms,
                })??,
            _ => command.await?,
        };
        match (reply.ok, reply.value) {
            (true, Some(value)) => {
                ctx.add_log(
                    format!("Live connection: {} ({}) = {}", device.id, sensor_type, value),
                    LogLevel::Info,
                    Some(&block.id),
                );
                value
            }
            _ => {
                return Err(DeviceError::CommandRejected {
                    device_id: device.id.clone(),
                    message: reply.error.unwrap_or_else(|| "no value returned".to_string()),
                }
                .into())
            }
        }
    } else if gateway.has_fallback() {
        let value = gateway.read_sensor(&device.id).await?;
        ctx.add_log(
            format!("Fallback read: {} ({}) = {}", device.id, sensor_type, value),
            LogLevel::Info,
            Some(&block.id),
        );
        value
    } else {
        return Err(DeviceError::NotConnected {
            device_id: device.id.clone(),
            controller_id: device.controller_id.clone(),
        }
        .into());
    };

    let unit = device
        .unit
        .clone()
        .or_else(|| sensor_unit(&sensor_type).map(str::to_string));
    ctx.set_variable(
        &params.variable_name,
        value.clone(),
        Some(
            VariableHint::from_block(&block.id)
                .display_name(format!("{} Reading", device.name))
                .data_type(DataType::Number)
                .unit(unit.clone()),
        ),
    )?;

    let tag_id = params.monitoring_tag_id.as_deref().filter(|t| !t.is_empty());
    if let Some(tag_id) = tag_id {
        record_sample(exec, block, ctx, tag_id, &value).await;
    }

    Ok(ExecutionResult::success(ports::FLOW_OUT).with_data(json!({
        "deviceId": device.id,
        "deviceType": device.device_type,
        "sensorType": sensor_type,
        "value": value.to_json(),
        "unit": unit,
        "controller": device.controller_id,
        "ports": device.ports,
        "monitoringRecorded": tag_id.is_some(),
    })))
}

async fn record_sample(
    exec: &BlockExecutor,
    block: &BlockNode,
    ctx: &mut ExecutionContext,
    tag_id: &str,
    value: &Value,
) {
    let ids = ctx.run_identifiers();
    let sample = MonitoringSample {
        tag_id: tag_id.to_string(),
        value: value.clone(),
        flow_id: ctx.flow_id().to_string(),
        block_id: block.id.clone(),
        program_id: ids.program_id,
        cycle_id: ids.cycle_id,
        timestamp: chrono::Utc::now(),
    };
    match exec.services().monitoring.record_sample(sample).await {
        Ok(()) => ctx.add_log(
            format!("Monitoring data saved: tag={}, value={}", tag_id, value),
            LogLevel::Info,
            Some(&block.id),
        ),
        Err(e) => ctx.add_log(
            format!("Failed to save monitoring data: {}", e),
            LogLevel::Warn,
            Some(&block.id),
        ),
    }
}
