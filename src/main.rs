//! embedlock - CLI
//!
//! Example driver programs for the thread-state layer.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use embedlock::runtime::{InProcessRuntime, Value};
use embedlock::util::config::DriverConfig;
use embedlock::util::logger::{self, LogLevel};
use embedlock::{run_on_bootstrap, run_workers, RuntimeEnvironment, WorkerPlan, NAME, VERSION};

/// Many native threads, one embedded runtime, one global lock
#[derive(Parser, Debug)]
#[command(name = "embedlock")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./embedlock.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

/// Overrides shared by the driver subcommands
#[derive(clap::Args, Debug, Default)]
struct RunOptions {
    /// Number of worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Cycles per worker
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Pause between cycles in milliseconds
    #[arg(long)]
    pause_ms: Option<u64>,
}

impl RunOptions {
    fn apply(
        &self,
        config: &mut DriverConfig,
    ) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(pause_ms) = self.pause_ms {
            config.pause_ms = pause_ms;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Workers call a runtime function on two large vectors
    Threads(RunOptions),

    /// Workers post status updates, pausing between cycles so others get the lock
    Paced(RunOptions),

    /// Every worker initializes and finalizes the runtime itself (broken on purpose)
    Naive(RunOptions),

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let base = match args.command {
        Commands::Paced(_) => DriverConfig::paced(),
        _ => DriverConfig::default(),
    };
    let mut config = base
        .discover_over(args.config.as_deref())
        .context("Failed to load config")?;
    config
        .apply_env()
        .context("Failed to read environment overrides")?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.log_level()
    };
    logger::init_with_level(level);

    match args.command {
        Commands::Threads(options) => {
            options.apply(&mut config);
            run_threads(&config)?;
        }
        Commands::Paced(options) => {
            options.apply(&mut config);
            run_paced(&config)?;
        }
        Commands::Naive(options) => {
            options.apply(&mut config);
            run_naive(&config)?;
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

/// Environment over the process-wide runtime, with the search path set up
/// from the main thread before any worker starts.
fn prepare_environment() -> Result<RuntimeEnvironment> {
    let env = RuntimeEnvironment::new(Arc::clone(InProcessRuntime::global()))
        .context("Failed to start the embedded runtime")?;

    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let setup = run_on_bootstrap(&env, |runtime| {
        runtime.call(
            "set_global",
            &[Value::str("search_path"), Value::str(cwd.display().to_string())],
        )
    });
    match setup {
        Some(result) => {
            result.context("Search path setup failed")?;
        }
        None => bail!("Embedded runtime is unavailable"),
    }
    Ok(env)
}

fn run_threads(config: &DriverConfig) -> Result<()> {
    let env = prepare_environment()?;
    let plan = WorkerPlan::from(config);

    let len = config.input_len().context("Bad vector length")?;
    let data1 = Value::list(0..len);
    let data2 = Value::list((0..len).map(|i| i * 2));

    let report = run_workers(&env, &plan, |runtime, call| {
        let result = runtime.call(&config.function, &[data1.clone(), data2.clone()])?;
        debug!(
            worker = call.worker,
            iteration = call.iteration,
            "runtime returned {}",
            result
        );
        Ok(result)
    })?;

    summarize(&env, &plan, report.completed_calls(), report.failed_workers())
}

fn run_paced(config: &DriverConfig) -> Result<()> {
    let env = prepare_environment()?;
    let plan = WorkerPlan::from(config);

    let report = run_workers(&env, &plan, |runtime, call| {
        runtime.call("update_status", &[Value::Int(call.worker as i64)])
    })?;

    if let Some(status) = env.runtime().global_value("status") {
        info!("Last status: {}", status);
    }
    summarize(&env, &plan, report.completed_calls(), report.failed_workers())
}

fn summarize(
    env: &RuntimeEnvironment,
    plan: &WorkerPlan,
    completed: usize,
    failed: usize,
) -> Result<()> {
    let peak = env.runtime().stats().peak_executing();
    info!(
        "{} of {} calls completed, {} workers failed, peak concurrent executions {}",
        completed,
        plan.threads * plan.iterations,
        failed,
        peak
    );
    if peak > 1 {
        bail!("Observed {} threads executing runtime code at once", peak);
    }
    Ok(())
}

/// Each worker tries to own the whole runtime lifecycle on its own thread:
/// initialize, call, finalize. Without an environment coordinating them,
/// workers race on initialization and tear the runtime down under each other.
fn run_naive(config: &DriverConfig) -> Result<()> {
    warn!("This driver is broken on purpose and shows why one environment must own the runtime.");

    let runtime = InProcessRuntime::new();
    let plan = WorkerPlan::from(config);
    let data = Value::list(0..config.input_len().context("Bad vector length")?);

    let report = embedlock::run_naive(&runtime, &plan, |runtime, call| {
        let result = runtime.call("total", &[data.clone()])?;
        debug!(worker = call.worker, "runtime returned {}", result);
        Ok(result)
    })?;

    info!(
        "{} of {} naive workers failed",
        report.failed_workers(),
        plan.threads
    );
    Ok(())
}
