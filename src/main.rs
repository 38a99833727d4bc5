use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobgate::config::{GateConfig, PolicyConfig, PollConfig, QueueConfig, RestartPolicy, SandboxConfig};
use jobgate::policy::{PolicyDecision, PolicyEngine};
use jobgate::poll::PollLoop;
use jobgate::queue::QueueClient;
use jobgate::shutdown::install_shutdown_handler;
use jobgate::worker::{EnvironmentBuilder, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "jobgate")]
#[command(version)]
#[command(about = "Admission gate and supervisor for untrusted robot programs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Poll the queue and run admitted jobs
    Run(RunArgs),

    /// Evaluate a local program against the admission policy
    Check {
        /// Path to the program source
        file: PathBuf,

        /// The single module programs may require
        #[arg(long, default_value = "johnny-five")]
        allowed_module: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the script that would be executed for a local program
    Compose {
        /// Path to the program source
        file: PathBuf,

        /// App instance base URL
        #[arg(long, default_value = "http://crowdbotblock.herokuapp.com")]
        base_url: String,

        /// Observer base URL (defaults to --base-url)
        #[arg(long)]
        observer_url: Option<String>,

        /// The single module programs may require
        #[arg(long, default_value = "johnny-five")]
        allowed_module: String,

        /// Execution timeout in seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// App instance base URL serving /latest, /cue and /speak
    #[arg(long, default_value = "http://crowdbotblock.herokuapp.com")]
    base_url: String,

    /// Observer base URL for log lines (defaults to --base-url)
    #[arg(long)]
    observer_url: Option<String>,

    /// Stop after this many poll cycles
    #[arg(long, default_value = "175")]
    max_iterations: u64,

    /// Stop after this many seconds
    #[arg(long, default_value = "7200")]
    max_duration_secs: u64,

    /// Wait after an idle, failed or rejected cycle (seconds)
    #[arg(long, default_value = "45")]
    short_wait_secs: u64,

    /// Minimum spacing between two job launches (seconds)
    #[arg(long, default_value = "60")]
    long_wait_secs: u64,

    /// Hard limit on one job's run time (seconds)
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Limit on each queue/observer HTTP call (seconds)
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,

    /// The single module programs may require
    #[arg(long, default_value = "johnny-five")]
    allowed_module: String,

    /// Interpreter used to run admitted programs
    #[arg(long, default_value = "node")]
    runtime: String,

    /// Where the composed program is written before launch
    #[arg(long, default_value = "submitted-job.js")]
    staging_path: PathBuf,

    /// What to do with the newest job on the first cycle
    #[arg(long, value_enum, default_value = "rerun-latest")]
    restart_policy: RestartPolicy,

    /// Post rejection/timeout notices to the observer
    #[arg(long)]
    announce: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CheckOutput<'a> {
    file: String,
    #[serde(flatten)]
    decision: &'a PolicyDecision,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn secs(value: u64) -> u64 {
    value.saturating_mul(1000)
}

fn build_config(args: RunArgs) -> GateConfig {
    GateConfig {
        queue: QueueConfig {
            base_url: args.base_url,
            observer_url: args.observer_url,
            request_timeout_ms: secs(args.request_timeout_secs),
            ..QueueConfig::default()
        },
        policy: PolicyConfig {
            allowed_module: args.allowed_module,
        },
        sandbox: SandboxConfig {
            runtime: args.runtime,
            staging_path: args.staging_path,
            execution_timeout_ms: secs(args.timeout_secs),
            ..SandboxConfig::default()
        },
        poll: PollConfig {
            max_iterations: args.max_iterations,
            max_duration_ms: secs(args.max_duration_secs),
            short_wait_ms: secs(args.short_wait_secs),
            long_wait_ms: secs(args.long_wait_secs),
            restart_policy: args.restart_policy,
            announce_outcomes: args.announce,
        },
    }
}

fn print_decision(file: &str, decision: &PolicyDecision) {
    if decision.allowed {
        println!("{}: ADMITTED", file);
        return;
    }
    println!("{}: REJECTED", file);
    println!("{:<30} {:<6} {:<12} DESCRIPTION", "REASON", "LINE", "PATTERN");
    println!("{}", "-".repeat(78));
    for v in &decision.violations {
        let line = v
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<30} {:<6} {:<12} {}",
            v.reason.to_string(),
            line,
            v.pattern,
            v.description
        );
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_gate(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args);
    config.validate()?;
    Supervisor::new(config.sandbox.clone())
        .probe_runtime()
        .await?;

    tracing::info!(
        base_url = %config.queue.base_url,
        observer = %config.queue.log_endpoint(),
        runtime = %config.sandbox.runtime,
        staging_path = %config.sandbox.staging_path.display(),
        timeout_ms = config.sandbox.execution_timeout_ms,
        allowed_module = %config.policy.allowed_module,
        "Starting jobgate"
    );

    let shutdown = install_shutdown_handler()?;
    let client = QueueClient::new(&config.queue)?;
    let mut poll_loop = PollLoop::new(&config, client);
    poll_loop.run(shutdown).await;
    Ok(())
}

async fn handle_check(
    file: PathBuf,
    allowed_module: String,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = tokio::fs::read_to_string(&file).await?;
    let engine = PolicyEngine::new(&PolicyConfig { allowed_module });
    let decision = engine.evaluate(&source);
    let name = file.display().to_string();

    match output {
        OutputFormat::Json => {
            let out = CheckOutput {
                file: name,
                decision: &decision,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => print_decision(&name, &decision),
    }

    if !decision.allowed {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_compose(
    file: PathBuf,
    base_url: String,
    observer_url: Option<String>,
    allowed_module: String,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GateConfig::new(base_url)
        .with_execution_timeout(Duration::from_secs(timeout_secs));
    config.queue.observer_url = observer_url;
    config.policy.allowed_module = allowed_module;
    // Only the parts compose uses are checked; waits do not apply here.
    config.poll.long_wait_ms = config.sandbox.execution_timeout_ms;
    config.validate()?;

    let source = tokio::fs::read_to_string(&file).await?;
    let decision = PolicyEngine::new(&config.policy).evaluate(&source);
    if !decision.allowed {
        print_decision(&file.display().to_string(), &decision);
        std::process::exit(1);
    }

    let request = EnvironmentBuilder::new(&config).compose(&source);
    print!("{}", request.composed_source);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_gate(run_args).await?;
        }
        Commands::Check {
            file,
            allowed_module,
            output,
        } => {
            handle_check(file, allowed_module, output).await?;
        }
        Commands::Compose {
            file,
            base_url,
            observer_url,
            allowed_module,
            timeout_secs,
        } => {
            handle_compose(file, base_url, observer_url, allowed_module, timeout_secs).await?;
        }
    }

    Ok(())
}
