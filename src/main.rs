use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use runner_agent::AgentConfig;
use runner_agent::runner::host_executor::HostExecutor;
use runner_agent::runner::lifecycle::LifecycleController;
use runner_agent::runner::shutdown::{ShutdownController, listen_for_signals};

/// Self-hosted runner agent
#[derive(Parser, Debug)]
#[command(name = "runner-agent", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Listen for jobs and run them (default)
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Exit after the first job
    #[arg(long, env = "RUNNER_ONCE")]
    once: bool,

    /// Log HTTP request and response bodies
    #[arg(long, env = "RUNNER_TRACE")]
    trace: bool,

    /// Directory holding settings.json, sessions.json and jobrun.json
    #[arg(long, env = "RUNNER_DIR")]
    dir: Option<PathBuf>,

    /// Workspace for job scripts (default: <dir>/_work)
    #[arg(long, env = "RUNNER_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Timeout for steps that do not set timeout-minutes (default: 360)
    #[arg(long, env = "RUNNER_STEP_TIMEOUT_MINUTES")]
    step_timeout_minutes: Option<u64>,
}

fn init_logging(trace: bool) {
    let default = if trace {
        "runner_agent=debug,reqwest=warn,hyper=warn"
    } else {
        "runner_agent=info,reqwest=warn,hyper=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let Commands::Run(run) = args.command.unwrap_or(Commands::Run(RunArgs::default()));

    let mut config = AgentConfig::from_env();
    if let Some(dir) = run.dir {
        config = config.with_dir(dir);
    }
    let (once, trace) = (config.once || run.once, config.trace || run.trace);
    config = config.with_once(once).with_trace(trace);
    init_logging(config.trace);

    let work_dir = run.work_dir.unwrap_or_else(|| config.dir.join("_work"));
    let mut executor = HostExecutor::new().with_work_dir(work_dir);
    if let Some(minutes) = run.step_timeout_minutes {
        executor = executor.with_timeout(Duration::from_secs(minutes * 60));
    }
    let executor = Arc::new(executor);

    let shutdown = ShutdownController::new(config.once);
    tokio::spawn(listen_for_signals(Arc::clone(&shutdown)));

    tracing::info!("Starting runner-agent {} in {}", env!("CARGO_PKG_VERSION"), config.dir.display());
    let code = LifecycleController::new(config, executor, Arc::clone(&shutdown)).run().await;
    shutdown.root().cancel();
    std::process::exit(code);
}
