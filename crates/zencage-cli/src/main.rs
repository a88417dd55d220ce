//! Zencage CLI
//!
//! A command-line tool for running native engine scripts behind an isolation
//! boundary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, debug, info, trace, warn};
use tracing_subscriber::EnvFilter;
use zencage::{
    CallError, CallRequest, CallResult, Config, EXAMPLE_CONFIG, Harness, IsolationPolicy, LogEntry,
    LogLevel, UnitRegistry,
};

#[derive(Parser)]
#[command(name = "zencage")]
#[command(about = "A tool for running native engine scripts in isolation")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: zencage.toml)
        #[arg(short, long, default_value = "zencage.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a script through the native unit
    Run {
        /// Script file to run
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// File holding the DATA input
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// File holding the KEYS input
        #[arg(short, long)]
        keys: Option<PathBuf>,

        /// Engine configuration string
        #[arg(long)]
        conf: Option<String>,

        /// File holding the EXTRA input
        #[arg(long)]
        extra: Option<PathBuf>,

        /// File holding the CONTEXT input
        #[arg(long)]
        context: Option<PathBuf>,

        /// Random seed, hex encoded
        #[arg(long)]
        seed: Option<String>,

        /// Engine debug verbosity (0-3)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
        verbosity: Option<u8>,

        /// Call the unit in this process instead of a worker
        #[arg(long)]
        in_process: bool,

        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Native unit to call (default: from config)
        #[arg(short, long)]
        unit: Option<String>,
    },

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Load configuration
    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            script,
            data,
            keys,
            conf,
            extra,
            context,
            seed,
            verbosity,
            in_process,
            timeout,
            unit,
        } => {
            let inputs = RunInputs {
                data,
                keys,
                conf,
                extra,
                context,
                seed,
                verbosity,
            };
            let request = build_request(&script, inputs).await?;

            let mut config = config;
            if let Some(unit) = unit {
                config.unit = unit;
            }
            if let Some(secs) = timeout {
                config.timeout = Some(secs);
            }
            config.validate().context("invalid run options")?;
            if in_process {
                config.policy = IsolationPolicy::InProcess;
            }

            run_script(config, request).await
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

struct RunInputs {
    data: Option<PathBuf>,
    keys: Option<PathBuf>,
    conf: Option<String>,
    extra: Option<PathBuf>,
    context: Option<PathBuf>,
    seed: Option<String>,
    verbosity: Option<u8>,
}

async fn build_request(script: &Path, inputs: RunInputs) -> Result<CallRequest> {
    let script = tokio::fs::read_to_string(script)
        .await
        .context("failed to read script file")?;
    let mut request = CallRequest::new(script);

    if let Some(text) = read_input(inputs.data.as_deref(), "data").await? {
        request = request.with_data(text);
    }
    if let Some(text) = read_input(inputs.keys.as_deref(), "keys").await? {
        request = request.with_keys(text);
    }
    if let Some(text) = read_input(inputs.extra.as_deref(), "extra").await? {
        request = request.with_extra(text);
    }
    if let Some(text) = read_input(inputs.context.as_deref(), "context").await? {
        request = request.with_context(text);
    }
    if let Some(conf) = inputs.conf {
        request = request.with_conf(conf);
    }
    if let Some(seed) = inputs.seed {
        let seed = hex::decode(seed.trim()).context("seed must be hex encoded")?;
        request = request.with_seed(seed);
    }
    if let Some(level) = inputs.verbosity {
        request = request.with_verbosity(level);
    }
    Ok(request)
}

async fn read_input(path: Option<&Path>, name: &str) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {name} file {}", path.display()))?;
    Ok(Some(text))
}

async fn run_script(config: Config, request: CallRequest) -> Result<()> {
    let policy = config.policy;
    let timeout = config.timeout();
    info!(unit = %config.unit, ?policy, "running script");

    let harness = Harness::new(config, UnitRegistry::with_probes());
    let result = match harness.execute(request, policy, timeout).await {
        Ok(result) => result,
        Err(e) => {
            if let Some(partial) = e.partial()
                && !partial.is_empty()
            {
                warn!("partial output before failure:");
                eprintln!("{}", partial.output_text());
                eprintln!("{}", partial.logs_text());
            }
            if policy == IsolationPolicy::InProcess && matches!(e, CallError::Timeout { .. }) {
                // The unit still runs on a blocking thread; the runtime would wait for it.
                eprintln!("Error: call failed: {e}");
                std::process::exit(1);
            }
            return Err(e).context("call failed");
        }
    };

    // Keep stdout clean for piping; everything else goes through tracing
    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    replay_logs(&result);

    if result.truncated.any() {
        warn!(
            output = result.truncated.output,
            logs = result.truncated.logs,
            "output was truncated at its capacity"
        );
    }
    info!(
        status = result.status,
        structured = result.result.is_some(),
        timeout = ?timeout.map(|t: Duration| t.as_secs_f64()),
        "call result"
    );

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(result.status);
    }
}

fn replay_logs(result: &CallResult) {
    for LogEntry { level, message } in result.buckets.entries() {
        match level {
            LogLevel::Error => tracing::error!(target: "unit", "{message}"),
            LogLevel::Warning => warn!(target: "unit", "{message}"),
            LogLevel::Info => info!(target: "unit", "{message}"),
            LogLevel::Debug => debug!(target: "unit", "{message}"),
            LogLevel::Trace => trace!(target: "unit", "{message}"),
        }
    }
    for line in &result.buckets.unclassified {
        info!(target: "unit", "{line}");
    }
}

fn show_config(config: &Config) {
    println!("Worker binary: {}", config.worker_binary().display());
    println!("Native unit: {}", config.unit);
    println!("Isolation policy: {:?}", config.policy);
    match config.timeout() {
        Some(timeout) => println!("Timeout: {:.3}s", timeout.as_secs_f64()),
        None => println!("Timeout: none"),
    }
    println!("On timeout: {:?}", config.on_timeout);
    println!("Overflow policy: {:?}", config.overflow);
    println!();
    println!("Capacities:");
    println!("  Output: {} bytes", config.capacities.output);
    println!("  Logs: {} bytes", config.capacities.logs);
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
