use std::{env, io::Write as _, path::Path, process::ExitCode};

use getopts::{Matches, Options};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tsrelay::{BuildError, DataPoint};
use tsrelay_collectors::{
    http_check::HttpCheck, self_stats::SelfStats, CollectorError, CollectorSet, Sink,
};

mod config;
mod diagnostics;

use self::config::{AgentConfig, ConfigError};

#[derive(Debug, Error)]
enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build pipeline: {0}")]
    Build(#[from] BuildError),

    #[error("failed to set up collector: {0}")]
    Collector(#[from] CollectorError),

    #[error("no TSDB host configured; set `host` in the configuration file or pass --host")]
    MissingHost,

    #[error("failed to start diagnostics endpoint: {0}")]
    Diagnostics(std::io::Error),
}

/// Writes points to stdout instead of sending them.
#[derive(Clone)]
struct PrintSink;

impl Sink for PrintSink {
    fn accept(&self, points: Vec<DataPoint>) {
        let mut stdout = std::io::stdout().lock();
        for point in points {
            if writeln!(stdout, "{point}").is_err() {
                return;
            }
        }
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {program} [options]");
    print!("{}", opts.usage(&brief));
}

fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("c", "config", "path to the TOML configuration file", "FILE");
    opts.optopt("H", "host", "TSDB host (host:port) or put endpoint URL, overriding the configuration", "HOST");
    opts.optflag("d", "debug", "enable debug logging");
    opts.optflag("p", "print", "print collected points to stdout instead of sending them");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("tsrelay-agent", String::as_str);
    let opts = opts();

    let matches = match opts.parse(args.get(1..).unwrap_or_default()) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{f}");
            print_usage(program, &opts);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return ExitCode::SUCCESS;
    }

    init_logging(matches.opt_present("debug"));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create runtime.");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&matches)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Agent failed.");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &Matches) -> Result<(), AgentError> {
    let mut config = match matches.opt_str("config") {
        Some(path) => AgentConfig::load(Path::new(&path))?,
        None => AgentConfig::default(),
    };
    if let Some(host) = matches.opt_str("host") {
        config.host = Some(host);
    }

    let mut collectors =
        CollectorSet::new().with_interval(config.interval()).with_default_tags(config.default_tags());
    register_collectors(&mut collectors, &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if matches.opt_present("print") {
        info!(collectors = collectors.len(), "Printing points instead of sending them.");
        let collecting = tokio::spawn(collectors.run(PrintSink, shutdown_rx));

        wait_for_shutdown_signal().await;
        shutdown_tx.send_replace(true);
        if let Err(e) = collecting.await {
            error!(error = %e, "Collector task failed.");
        }
        return Ok(());
    }

    let endpoint = config.endpoint_url().ok_or(AgentError::MissingHost)?;
    let (pipeline, future) = config.pipeline_builder(&endpoint)?.build()?;
    let relaying = tokio::spawn(future);

    collectors.register(SelfStats::new(pipeline.clone()));

    if let Some(address) = config.diagnostics_addr {
        let (address, serving) =
            diagnostics::serve(address, pipeline.clone()).map_err(AgentError::Diagnostics)?;
        tokio::spawn(serving);
        info!(%address, "Diagnostics endpoint listening.");
    }

    info!(%endpoint, collectors = collectors.len(), "Agent started.");
    let collecting = tokio::spawn(collectors.run(pipeline.submitter(), shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("Shutting down.");

    shutdown_tx.send_replace(true);
    if let Err(e) = collecting.await {
        error!(error = %e, "Collector task failed.");
    }

    pipeline.shutdown();
    if let Err(e) = relaying.await {
        error!(error = %e, "Pipeline task failed.");
    }

    let stats = pipeline.stats();
    info!(
        sent = stats.sent,
        dropped = stats.dropped,
        duplicate = stats.duplicate,
        expired = stats.expired,
        "Agent stopped."
    );
    Ok(())
}

fn register_collectors(collectors: &mut CollectorSet, config: &AgentConfig) -> Result<(), AgentError> {
    for check in &config.http_checks {
        collectors.register(HttpCheck::new(check.parse()?)?);
    }

    if !config.processes.is_empty() {
        register_processes(collectors, &config.processes)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn register_processes(collectors: &mut CollectorSet, watches: &[String]) -> Result<(), AgentError> {
    use tsrelay_collectors::processes::{LinuxProcesses, ProcessWatch};

    let watches =
        watches.iter().map(|w| w.parse::<ProcessWatch>()).collect::<Result<Vec<_>, _>>()?;
    collectors.register(LinuxProcesses::new(watches));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn register_processes(_: &mut CollectorSet, watches: &[String]) -> Result<(), AgentError> {
    warn!(watches = watches.len(), "Process watches are only supported on Linux. Ignoring.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C. Shutting down.");
    }
}
