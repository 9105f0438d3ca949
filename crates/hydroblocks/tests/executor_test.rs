use hydroblocks::testing::{RecordingNotifier, RecordingRecorder, SimulatedGateway};
use hydroblocks::{BlockExecutor, ExecutorConfig, NotificationPolicy, NotificationRule};
use hydrocore::{
    ports, ActionType, BlockKind, BlockNode, CancellationToken, ErrorKind, ExecutionContext,
    Services, Severity, Value,
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

fn block(id: &str, definition_id: &str, params: serde_json::Value) -> BlockNode {
    let parameters = match params {
        serde_json::Value::Object(map) => map,
        _ => Default::default(),
    };
    BlockNode {
        id: id.to_string(),
        definition_id: definition_id.to_string(),
        kind: BlockKind::parse(definition_id),
        parameters,
        input_ports: vec![ports::FLOW_IN.to_string()],
        output_ports: vec![ports::FLOW_OUT.to_string()],
    }
}

fn executor(gateway: Arc<SimulatedGateway>, token: CancellationToken) -> BlockExecutor {
    BlockExecutor::new(Services::new(gateway), token, ExecutorConfig::default())
}

#[tokio::test(start_paused = true)]
async fn timed_actuator_sends_closing_command_after_cancellation() {
    let gateway = Arc::new(SimulatedGateway::new().with_device("pump", "relay"));
    let token = CancellationToken::new();
    let exec = executor(gateway.clone(), token.clone());
    let mut ctx = ExecutionContext::new("flow");

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel("operator stop");
    });

    let start = Instant::now();
    let result = exec
        .execute(
            &block(
                "a1",
                "actuator",
                json!({"deviceId": "pump", "actionType": "on_off_timed", "duration": 5}),
            ),
            &mut ctx,
            false,
        )
        .await;

    assert!(result.success);
    assert_eq!(start.elapsed(), Duration::from_secs(3));

    let commands = gateway.commands_for("pump");
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].command.action, Some(ActionType::OnOffTimed));
    assert_eq!(commands[1].command.action, Some(ActionType::Off));
    assert_eq!(commands[1].at - commands[0].at, Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn timed_actuator_holds_full_duration() {
    let gateway = Arc::new(SimulatedGateway::new().with_device("fan", "relay"));
    let exec = executor(gateway.clone(), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");

    let start = Instant::now();
    let result = exec
        .execute(
            &block(
                "a1",
                "actuator",
                json!({"deviceId": "fan", "actionType": "off_on_timed", "duration": "4"}),
            ),
            &mut ctx,
            false,
        )
        .await;

    assert!(result.success);
    assert_eq!(start.elapsed(), Duration::from_secs(4));
    let commands = gateway.commands_for("fan");
    assert_eq!(commands[1].command.action, Some(ActionType::On));
}

#[tokio::test(start_paused = true)]
async fn actuator_duration_from_global_variable() {
    let gateway = Arc::new(SimulatedGateway::new().with_device("valve", "relay"));
    let exec = executor(gateway.clone(), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");
    ctx.set_variable("globalVar1", Value::Number(7.0), None).unwrap();

    let start = Instant::now();
    let result = exec
        .execute(
            &block(
                "a1",
                "actuator",
                json!({
                    "deviceId": "valve",
                    "actionType": "on_off_timed",
                    "duration": 2,
                    "useGlobalVariable": true
                }),
            ),
            &mut ctx,
            false,
        )
        .await;

    assert!(result.success);
    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert_eq!(gateway.commands_for("valve")[0].command.duration_secs, 7.0);
}

#[tokio::test]
async fn sensor_reading_through_fallback() {
    let gateway = Arc::new(
        SimulatedGateway::new()
            .with_device("ph1", "ph_sensor")
            .offline()
            .with_fallback(true)
            .with_reading("ph1", 6.2),
    );
    let recorder = Arc::new(RecordingRecorder::new());
    let exec = BlockExecutor::new(
        Services::new(gateway.clone()).with_recorder(recorder.clone()),
        CancellationToken::new(),
        ExecutorConfig::default(),
    );
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(
            &block("s1", "sensor", json!({"deviceId": "ph1", "variableName": "ph"})),
            &mut ctx,
            false,
        )
        .await;

    assert!(result.success);
    assert_eq!(result.output_port, ports::FLOW_OUT);
    assert_eq!(ctx.get_variable("ph"), Some(&Value::Number(6.2)));
    assert_eq!(ctx.variable_metadata("ph").unwrap().unit.as_deref(), Some("pH"));
    assert!(gateway.sent_commands().is_empty());
    assert_eq!(recorder.blocks().len(), 1);
}

#[tokio::test]
async fn sensor_without_any_connection_fails_high() {
    let gateway = Arc::new(SimulatedGateway::new().with_device("ec1", "ec_sensor").offline());
    let exec = executor(gateway, CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(&block("s1", "sensor", json!({"deviceId": "ec1"})), &mut ctx, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.output_port, ports::ON_ERROR_OUT);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceNotResponding);
    assert_eq!(error.severity, Severity::High);
    assert_eq!(ctx.last_error().map(|e| e.block_id.as_str()), Some("s1"));
}

#[tokio::test(start_paused = true)]
async fn slow_sensor_times_out_medium() {
    let gateway = Arc::new(
        SimulatedGateway::new()
            .with_device("t1", "temp_sensor")
            .with_latency("t1", Duration::from_secs(10)),
    );
    let exec = executor(gateway, CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(
            &block("s1", "sensor", json!({"deviceId": "t1", "timeout": 500})),
            &mut ctx,
            false,
        )
        .await;

    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SensorTimeout);
    assert_eq!(error.severity, Severity::Medium);
}

#[tokio::test]
async fn unknown_kind_is_invalid_block_type() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(&block("x1", "teleporter", json!({})), &mut ctx, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.output_port, ports::ON_ERROR_OUT);
    assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidBlockType);
}

#[tokio::test(start_paused = true)]
async fn handler_exceeding_deadline_times_out() {
    let gateway = Arc::new(SimulatedGateway::new().with_device("pump", "relay"));
    let config = ExecutorConfig {
        block_timeout: Duration::from_secs(3),
        ..ExecutorConfig::default()
    };
    let exec = BlockExecutor::new(Services::new(gateway.clone()), CancellationToken::new(), config);
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(
            &block(
                "a1",
                "actuator",
                json!({"deviceId": "pump", "actionType": "on_off_timed", "duration": 10}),
            ),
            &mut ctx,
            false,
        )
        .await;

    assert_eq!(result.error.unwrap().kind, ErrorKind::ExecutionTimeout);
    // the opening command went out and is not retracted
    assert_eq!(gateway.commands_for("pump").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn error_notifications_are_rate_limited() {
    let mut policy = NotificationPolicy::default();
    policy.per_kind.insert(
        BlockKind::Actuator,
        NotificationRule {
            cooldown_secs: Some(60),
            ..Default::default()
        },
    );
    let notifier = Arc::new(RecordingNotifier::new());
    let exec = BlockExecutor::new(
        Services::new(Arc::new(SimulatedGateway::new())).with_notifier(notifier.clone()),
        CancellationToken::new(),
        ExecutorConfig {
            notification: policy,
            ..ExecutorConfig::default()
        },
    );
    let mut ctx = ExecutionContext::new("flow");
    let missing = block("a1", "actuator", json!({"deviceId": "ghost", "actionType": "on"}));

    exec.execute(&missing, &mut ctx, false).await;
    exec.execute(&missing, &mut ctx, false).await;
    assert_eq!(notifier.errors().len(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    exec.execute(&missing, &mut ctx, true).await;
    assert_eq!(notifier.errors().len(), 1);

    exec.execute(&missing, &mut ctx, false).await;
    assert_eq!(notifier.errors().len(), 2);
    assert_eq!(notifier.errors()[0].block_id, "a1");
}

#[tokio::test]
async fn loop_counter_survives_revisits() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");
    let repeat = block("l1", "loop", json!({"maxIterations": 3}));

    for expected in 1..=3 {
        let result = exec.execute(&repeat, &mut ctx, false).await;
        assert_eq!(result.output_port, ports::LOOP_OUT);
        assert_eq!(result.data.unwrap()["iteration"], json!(expected));
        assert_eq!(ctx.block_state("l1").iterations, expected);
    }

    let result = exec.execute(&repeat, &mut ctx, false).await;
    assert_eq!(result.output_port, ports::FLOW_OUT);
    assert!(ctx.block_state("l1").completed);
    assert!(ctx.active_loop("l1").is_none());
    assert!(!ctx.has_active_loop_context());
}

#[tokio::test]
async fn restored_loop_continues_its_count() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");
    let repeat = block("l1", "loop", json!({"maxIterations": 3}));

    exec.execute(&repeat, &mut ctx, false).await;
    exec.execute(&repeat, &mut ctx, false).await;

    let mut resumed = ExecutionContext::new("flow");
    resumed.restore(ctx.to_snapshot());

    let result = exec.execute(&repeat, &mut resumed, false).await;
    assert_eq!(result.output_port, ports::LOOP_OUT);
    assert_eq!(result.data.unwrap()["iteration"], json!(3));

    let result = exec.execute(&repeat, &mut resumed, false).await;
    assert_eq!(result.output_port, ports::FLOW_OUT);
    assert!(!resumed.has_active_loop_context());
}

#[tokio::test]
async fn loop_exits_when_condition_holds() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");
    let until_full = block(
        "l1",
        "loop",
        json!({
            "conditions": [{"operator": "greater_equal", "dataType": "number"}],
            "variable": "level",
            "comparisonValue": 80
        }),
    );

    ctx.set_variable("level", Value::Number(50.0), None).unwrap();
    let result = exec.execute(&until_full, &mut ctx, false).await;
    assert_eq!(result.output_port, ports::LOOP_OUT);
    assert_eq!(ctx.current_loop_context(), Some("l1"));

    ctx.set_variable("level", Value::Number(85.0), None).unwrap();
    let result = exec.execute(&until_full, &mut ctx, false).await;
    assert_eq!(result.output_port, ports::FLOW_OUT);
}

#[tokio::test]
async fn if_block_with_tolerance() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");
    ctx.set_variable("ph", Value::Number(6.1), None).unwrap();

    let equals = block(
        "i1",
        "if",
        json!({
            "conditions": [{"condition": "equals", "dataType": "number"}],
            "variable": "ph",
            "manualComparisonValue": "6.0",
            "tolerance": 0.2
        }),
    );
    let result = exec.execute(&equals, &mut ctx, false).await;
    assert_eq!(result.output_port, ports::FLOW_OUT_TRUE);

    let unset = block(
        "i2",
        "if",
        json!({"conditions": [{"operator": "equals"}], "variable": "missing"}),
    );
    let result = exec.execute(&unset, &mut ctx, false).await;
    assert_eq!(result.error.unwrap().kind, ErrorKind::ConditionError);
}

#[tokio::test]
async fn goto_and_variables() {
    let exec = executor(Arc::new(SimulatedGateway::new()), CancellationToken::new());
    let mut ctx = ExecutionContext::new("flow");

    let result = exec
        .execute(&block("g1", "goto", json!({"targetBlockId": "b7"})), &mut ctx, false)
        .await;
    assert!(result.is_redirect());
    assert_eq!(result.redirect_target(), Some("b7"));

    let declare = block(
        "v1",
        "setVarName",
        json!({"internalVar": "target", "displayName": "Target EC", "dataType": "number"}),
    );
    let result = exec.execute(&declare, &mut ctx, false).await;
    assert_eq!(result.output_port, ports::SET_VAR_NAME_OUT);
    assert!(ctx.has_variable("target"));
    assert_eq!(ctx.get_variable("target"), None);

    let assign = block("v2", "setVarData", json!({"variableName": "target", "value": "1.8"}));
    exec.execute(&assign, &mut ctx, false).await;
    assert_eq!(ctx.get_variable("target"), Some(&Value::Number(1.8)));
    assert_eq!(ctx.variable_metadata("target").unwrap().display_name, "Target EC");

    let copy = block("v3", "setVarData", json!({"variableName": "copy", "sourceVariable": "nope"}));
    let result = exec.execute(&copy, &mut ctx, false).await;
    assert_eq!(result.error.unwrap().kind, ErrorKind::MissingParameter);
}
