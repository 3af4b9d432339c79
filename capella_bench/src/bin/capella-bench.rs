use std::{env, io::Write, num::NonZeroU32, path::PathBuf, process, time::Duration};

use capella_bench::{
    config::{self, Config, Telemetry},
    coordinator::{self, Coordinator},
    transport::Udp,
};
use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::runtime::Builder;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Environment variable holding a YAML configuration, preferred over
/// `--config-path` when set.
const CONFIG_ENV: &str = "CAPELLA_BENCH_CONFIG";

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration is invalid: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Coordinator(#[from] coordinator::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

// Parser for subcommand structure
#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct CliWithSubcommands {
    #[command(subcommand)]
    command: Commands,
}

// Parser for the flat structure, `capella-bench -c 4 -d 10s`
#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct CliFlat {
    #[command(flatten)]
    args: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark
    Run(RunArgs),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckArgs),
}

// Options left unset fall through to the configuration file, then defaults.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// path on disk to a YAML configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// the number of metrics to batch before sending
    #[clap(short = 'b', long)]
    batch_size: Option<NonZeroU32>,
    /// the number of concurrent senders
    #[clap(short = 'c', long)]
    concurrency: Option<NonZeroU32>,
    /// the address of the capella instance with the port
    #[clap(short = 'a', long)]
    addr: Option<String>,
    /// how long the benchmark will last, e.g. 30s or 1m
    #[clap(short = 'd', long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
    /// path of the newline-delimited sample metrics file
    #[clap(short = 'm', long)]
    metrics_path: Option<PathBuf>,
    /// seed for metric selection, for reproducible runs
    #[clap(long)]
    seed: Option<u64>,
    /// address to bind a prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<std::net::SocketAddr>,
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// path on disk to the configuration file
    #[clap(long)]
    config_path: PathBuf,
}

fn base_config(
    config_path: Option<&PathBuf>,
    env_config: Option<&str>,
) -> Result<Config, Error> {
    if let Some(contents) = env_config {
        debug!("Using config from env var '{CONFIG_ENV}'");
        return Ok(Config::from_yaml(contents)?);
    }
    match config_path {
        Some(path) => {
            debug!("Attempting to open configuration file at: {}", path.display());
            Ok(Config::load(path).inspect_err(|err| {
                error!("Could not load config file '{}': {err}", path.display());
            })?)
        }
        None => Ok(Config::default()),
    }
}

fn get_config(args: RunArgs, env_config: Option<&str>) -> Result<Config, Error> {
    let mut config = base_config(args.config_path.as_ref(), env_config)?;

    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(duration) = args.duration {
        config.duration = duration;
    }
    if let Some(metrics_path) = args.metrics_path {
        config.metrics_path = metrics_path;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(addr) = args.prometheus_addr {
        let global_labels = match config.telemetry.take() {
            Some(Telemetry::Prometheus { global_labels, .. }) => global_labels,
            None => Default::default(),
        };
        config.telemetry = Some(Telemetry::Prometheus {
            addr,
            global_labels,
        });
    }

    config.validate()?;
    Ok(config)
}

fn install_telemetry(telemetry: Option<Telemetry>) -> Result<(), Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus exporter listening on {addr}");
    }
    Ok(())
}

async fn inner_main(config: Config) -> Result<(), Error> {
    install_telemetry(config.telemetry.clone())?;

    let transport = Udp::new(config.addr.clone());
    let coordinator = Coordinator::from_config(&config, transport)?;
    let report = coordinator.run().await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{report}")?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting capella-bench {version} run.");

    // Fall back to the flat form when no subcommand is given.
    let args = match CliWithSubcommands::try_parse() {
        Ok(cli) => match cli.command {
            Commands::Run(args) => args,
            Commands::ConfigCheck(check) => match Config::load(&check.config_path)
                .and_then(|config| config.validate().map(|()| config))
            {
                Ok(_) => {
                    info!("Configuration file is valid");
                    process::exit(0)
                }
                Err(err) => {
                    error!("Configuration validation failed: {err}");
                    process::exit(1)
                }
            },
        },
        Err(_) => match CliFlat::try_parse() {
            Ok(flat) => flat.args,
            Err(err) => err.exit(),
        },
    };

    let env_config = env::var(CONFIG_ENV).ok();
    let config = get_config(args, env_config.as_deref()).inspect_err(|err| error!("{err}"))?;

    let runtime = Builder::new_multi_thread().enable_io().enable_time().build()?;
    let res = runtime.block_on(inner_main(config));
    if let Err(ref err) = res {
        error!("{err}");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    res
}
