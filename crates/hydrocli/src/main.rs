use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hydroblocks::catalog;
use hydroblocks::testing::{RecordingNotifier, RecordingRecorder, SimulatedGateway};
use hydrocore::{ports, BlockDefinition, ExecutionEvent, FlowDefinition, Services, Value};
use hydroruntime::{FlowRuntime, RuntimeConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hydro")]
#[command(about = "Irrigation flow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file against simulated devices
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run variables as a JSON object, e.g. '{"programId": "p1"}'
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Per-block timeout in seconds, overriding the configuration
        #[arg(long)]
        block_timeout: Option<u64>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available block kinds
    Blocks,

    /// Create an example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            block_timeout,
            verbose,
        } => {
            init_tracing(verbose);
            let mut config = match config {
                Some(path) => RuntimeConfig::from_json_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => RuntimeConfig::default(),
            };
            if let Some(secs) = block_timeout {
                config.block_timeout_secs = secs;
            }
            run_flow(&file, input, config).await?;
        }

        Commands::Validate { file } => {
            init_tracing(false);
            validate_flow(&file)?;
        }

        Commands::Blocks => list_blocks(),

        Commands::Init { output } => create_example_flow(&output)?,
    }

    Ok(())
}

fn load_flow(file: &Path) -> Result<FlowDefinition> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let flow: FlowDefinition =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    Ok(flow)
}

/// Run variables from a JSON object of scalars.
fn parse_input(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(input) = input else {
        return Ok(BTreeMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&input).context("parsing --input")?;
    let serde_json::Value::Object(object) = json else {
        bail!("Input must be a JSON object");
    };

    object
        .into_iter()
        .map(|(name, raw)| match Value::from_json(&raw) {
            Some(value) => Ok((name, value)),
            None => bail!("Input variable {} must be a number, string or boolean", name),
        })
        .collect()
}

async fn run_flow(file: &Path, input: Option<String>, config: RuntimeConfig) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let flow = load_flow(file)?;
    let globals = parse_input(input)?;

    println!("📋 Flow: {}", if flow.name.is_empty() { &flow.id } else { &flow.name });
    println!("   Blocks: {}", flow.blocks.len());
    println!("   Connections: {}", flow.connections.len());
    println!();

    let gateway = Arc::new(SimulatedGateway::new().auto_provision(true).with_fallback(true));
    let recorder = Arc::new(RecordingRecorder::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let services = Services::new(gateway.clone())
        .with_recorder(recorder.clone())
        .with_notifier(notifier.clone());
    let runtime = FlowRuntime::new(config, services);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowStarted { resumed: false, .. } => println!("▶️  Flow started"),
                ExecutionEvent::FlowStarted { resumed: true, .. } => println!("▶️  Flow resumed"),
                ExecutionEvent::FlowPaused { .. } => println!("⏸️  Flow paused"),
                ExecutionEvent::FlowStopped { emergency, .. } => {
                    println!("⏹️  Flow stopped{}", if emergency { " (emergency)" } else { "" })
                }
                ExecutionEvent::BlockStarted(block) => {
                    println!("  ⚡ Starting block: {} ({})", block.block_name, block.block_kind)
                }
                ExecutionEvent::BlockCompleted(block) => {
                    let ms = block.timing.duration_ms.unwrap_or_default();
                    println!("  ✅ Block {} {:?} in {}ms", block.block_id, block.status, ms)
                }
                ExecutionEvent::ErrorOccurred { error, .. } => println!("  ❌ {}", error),
                ExecutionEvent::FlowCompleted {
                    success, duration_ms, ..
                } => {
                    if success {
                        println!("✨ Flow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Flow ended unsuccessfully after {}ms", duration_ms);
                    }
                }
                _ => {}
            }
        }
    });

    let control = runtime.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping flow");
            control.stop(false);
        }
    });

    let result = runtime.run(&flow, globals).await;

    interrupt.abort();
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let outcome = result?;
    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", outcome.run_id);
    println!("   Success: {}", outcome.success);
    println!("   Executed: {}", outcome.executed_blocks.join(" → "));
    if let Some(final_block) = &outcome.final_block {
        println!("   Final block: {}", final_block);
    }
    if let Some(reason) = &outcome.stopped_by {
        println!("   Stopped by: {}", reason);
    }
    println!("   Device commands: {}", gateway.sent_commands().len());
    println!("   Block records: {}", recorder.blocks().len());

    if !outcome.variables.is_empty() {
        println!();
        println!("📤 Variables:");
        for (name, value) in &outcome.variables {
            println!("   {}: {}", name, value);
        }
    }

    if !outcome.errors.is_empty() {
        println!();
        println!("⚠️  Errors:");
        for error in &outcome.errors {
            println!("   [{}] {}", error.block_id, error);
        }
    }

    let notifications = notifier.errors().len() + notifier.custom().len();
    if notifications > 0 {
        println!("   Notifications sent: {}", notifications);
    }

    Ok(())
}

fn validate_flow(file: &Path) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());
    let flow = load_flow(file)?;
    let report = hydroruntime::validate(&flow);

    for warning in &report.warnings {
        println!("   ⚠️  {}", warning);
    }
    if !report.is_valid() {
        for error in &report.errors {
            println!("   ❌ {}", error);
        }
        bail!("flow {} has {} error(s)", flow.id, report.errors.len());
    }

    println!("✅ Flow is valid:");
    println!("   Blocks: {}", flow.blocks.len());
    println!("   Connections: {}", flow.connections.len());
    Ok(())
}

fn list_blocks() {
    println!("📦 Available Block Kinds:");
    println!();

    for meta in catalog::all() {
        println!("  • {} ({})", meta.kind, meta.category);
        println!("    {}", meta.description);
        if !meta.required_params.is_empty() {
            println!("    requires: {}", meta.required_params.join(", "));
        }
        let outputs: Vec<_> = meta.outputs.iter().map(|p| p.name).collect();
        if !outputs.is_empty() {
            println!("    outputs: {}", outputs.join(", "));
        }
    }
}

fn create_example_flow(output: &Path) -> Result<()> {
    let mut flow = FlowDefinition::new("ph-correction").with_name("pH correction");

    flow.add_block(BlockDefinition::new("start", "system.start"));
    flow.add_block(
        BlockDefinition::new("read-ph", "sensor")
            .with_param("deviceId", "ph_sensor_1")
            .with_param("variableName", "ph"),
    );
    flow.add_block(
        BlockDefinition::new("ph-high", "if")
            .with_param("conditions", json!([{"condition": "greater_than", "dataType": "number"}]))
            .with_param("variable", "ph")
            .with_param("comparisonValue", 6.5)
            .with_param("tolerance", 0.1),
    );
    flow.add_block(
        BlockDefinition::new("dose-acid", "actuator")
            .with_param("deviceId", "acid_pump")
            .with_param("actionType", "on_off_timed")
            .with_param("duration", 5),
    );
    flow.add_block(
        BlockDefinition::new("pump-guard", "errorHandler")
            .with_param("enableRetry", true)
            .with_param("maxRetries", 2)
            .with_param("retryDelay", 1)
            .with_param("fallbackStrategy", "stop"),
    );
    flow.add_block(BlockDefinition::new("end", "system.end"));

    flow.connect("start", ports::FLOW_OUT, "read-ph", ports::FLOW_IN);
    flow.connect("read-ph", ports::FLOW_OUT, "ph-high", ports::FLOW_IN);
    flow.connect("ph-high", ports::FLOW_OUT_TRUE, "dose-acid", ports::FLOW_IN);
    flow.connect("ph-high", ports::FLOW_OUT_FALSE, "end", ports::FLOW_IN);
    flow.connect("dose-acid", ports::FLOW_OUT, "end", ports::FLOW_IN);
    flow.connect("pump-guard", ports::FLOW_OUT, "dose-acid", ports::ON_ERROR_IN);

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(output, json).with_context(|| format!("writing {}", output.display()))?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  hydro run --file {} --input '{{\"programId\": \"demo\"}}'", output.display());
    Ok(())
}
