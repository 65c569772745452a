use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use coalescer_service::config::Config;
use coalescer_service::logging::ensure_log_error;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable backtraces.
    #[arg(long)]
    backtraces: bool,

    /// Enable sentry, reporting to a local sink.
    #[arg(long)]
    sentry: bool,

    /// Enable tracing, writing JSON logs into the void.
    #[arg(long)]
    tracing: bool,

    /// Enable statsd metrics, sent to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = execute() {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: the runtime is not started yet, so this is single-threaded.
    let logging_guard = unsafe {
        logging::init(
            logging::Config {
                backtraces: cli.backtraces,
                sentry: cli.sentry,
                tracing: cli.tracing,
                metrics: cli.metrics,
            },
            &config,
        )
    }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let logging::Guard {
            sentry: _sentry,
            http_sink,
            udp_sink,
        } = logging_guard;
        if let Some(http_sink) = http_sink {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = udp_sink {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(config, workloads, cli.duration).await
    })
}
