//! PhotonDB Registry stress driver
//!
//! Hammers a registry with concurrent make / unmake / lookup traffic from a
//! pool of producer threads while an owner thread flushes, then prints the
//! final registry statistics.
//!
//! # Examples
//!
//! ```bash
//! # Eight producers, 50k operations each, over 512 keys
//! registry-stress run --producers 8 --operations 50000 --keys 512
//!
//! # Load sizing from a file and dump Prometheus metrics at the end
//! registry-stress --config registry.toml run --metrics
//!
//! # Show the effective configuration
//! registry-stress config
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use photon_registry::metrics::{export_metrics, init_metrics};
use photon_registry::{hash, Lifetime, Placeholders, Registry, RegistryConfig, RegistryStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB Registry - concurrent resource registry stress tool
#[derive(Parser, Debug)]
#[command(name = "registry-stress")]
#[command(version = photon_registry::VERSION)]
#[command(about = "Stress test for the PhotonDB resource registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry configuration file (TOML)
    #[arg(long, global = true, env = "PHOTON_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTON_REGISTRY_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stress workload
    Run(RunArgs),

    /// Print the effective registry configuration
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Producer threads
    #[arg(short, long, default_value = "4")]
    producers: usize,

    /// Operations per producer
    #[arg(short, long, default_value = "10000")]
    operations: usize,

    /// Distinct resource names
    #[arg(short, long, default_value = "256")]
    keys: usize,

    /// Share of makes that force a rebuild
    #[arg(long, default_value = "0.05")]
    force_rate: f64,

    /// Share of payloads that fail to build
    #[arg(long, default_value = "0.02")]
    fail_rate: f64,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

/// Stand-in "compiled" resource
#[derive(Debug)]
struct Compiled {
    checksum: u64,
    len: usize,
}

/// Builds `Compiled` resources and counts the traffic
#[derive(Default)]
struct Compiler {
    built: AtomicUsize,
    rejected: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Lifetime for Compiler {
    type Payload = String;
    type Resource = Compiled;
    type Error = String;

    fn create(&self, source: &String, name: &str) -> Result<Compiled, String> {
        if source.contains("#error") {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(format!("{}: source contains #error", name));
        }
        self.built.fetch_add(1, Ordering::Relaxed);
        Ok(Compiled {
            checksum: hash(source),
            len: source.len(),
        })
    }

    fn destroy(&self, resource: Arc<Compiled>) {
        debug!(checksum = resource.checksum, len = resource.len, "Destroying resource");
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    producers: usize,
    operations: usize,
    flush_passes: usize,
    built: usize,
    rejected: usize,
    destroyed: usize,
    registry: RegistryStats,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = RegistryConfig::load(cli.config.as_deref()).context("loading registry config")?;

    match cli.command {
        Commands::Run(args) => run_command(config, args),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Version => {
            println!("PhotonDB Registry {}", photon_registry::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "registry-stress.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Run command - drive the registry from many producers
fn run_command(config: RegistryConfig, args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.producers > 0, "at least one producer is required");
    anyhow::ensure!(args.keys > 0, "at least one key is required");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.force_rate) && (0.0..=1.0).contains(&args.fail_rate),
        "rates must be between 0 and 1"
    );

    init_metrics();
    info!(
        producers = args.producers,
        operations = args.operations,
        keys = args.keys,
        capacity = config.capacity,
        "Starting registry stress run"
    );

    let registry = Registry::new(
        &config,
        Compiler::default(),
        Placeholders::new(
            "// missing".to_string(),
            "// failed".to_string(),
            "// making".to_string(),
        ),
    )?;

    let names: Vec<String> = (0..args.keys)
        .map(|i| format!("shaders/{:04}.wgsl", i))
        .collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.producers)
        .build()
        .context("building producer pool")?;
    let stop = AtomicBool::new(false);
    let started = Instant::now();

    let flush_passes = std::thread::scope(|scope| {
        let flusher = scope.spawn(|| {
            let mut passes = 0;
            while !stop.load(Ordering::Acquire) {
                registry.flush(config.flush_budget);
                passes += 1;
                std::thread::yield_now();
            }
            passes
        });

        pool.install(|| {
            (0..args.producers).into_par_iter().for_each(|producer| {
                produce(&registry, &names, &args, producer as u64);
            });
        });

        stop.store(true, Ordering::Release);
        flusher
            .join()
            .map_err(|_| anyhow::anyhow!("flush thread panicked"))
    })?;

    // Producers are done; drain what is left
    let mut drain_passes = 0;
    while registry.flush(config.flush_budget) > 0 {
        drain_passes += 1;
    }
    debug!(drain_passes, "Drained registry");

    let lifetime = registry.lifetime();
    let report = Report {
        elapsed_ms: started.elapsed().as_millis(),
        producers: args.producers,
        operations: args.producers * args.operations,
        flush_passes: flush_passes + drain_passes,
        built: lifetime.built.load(Ordering::Relaxed),
        rejected: lifetime.rejected.load(Ordering::Relaxed),
        destroyed: lifetime.destroyed.load(Ordering::Relaxed),
        registry: registry.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        println!("{}", export_metrics());
    }

    let reclaimed = registry.deinitialize()?;
    info!(reclaimed_bytes = reclaimed, "Registry stress run complete");
    Ok(())
}

fn produce(registry: &Registry<Compiler>, names: &[String], args: &RunArgs, producer: u64) {
    let mut rng = StdRng::seed_from_u64(args.seed ^ producer.wrapping_mul(0x9E37_79B9_7F4A_7C15));

    for op in 0..args.operations {
        let name = &names[rng.gen_range(0..names.len())];
        let key = hash(name);

        match rng.gen_range(0..10) {
            0..=5 => {
                let source = if rng.gen_bool(args.fail_rate) {
                    format!("#error broken build {}", op)
                } else {
                    format!("fn main() {{ /* {} rev {} */ }}", name, op)
                };
                let force = rng.gen_bool(args.force_rate);
                registry.make(key, name, Some(source), name, force);
            }
            6 | 7 => {
                let entry = registry.get(key);
                if let Err(e) = registry.unmake(&entry) {
                    error!(name = %name, error = %e, "Unmake failed");
                }
            }
            _ => {
                let entry = registry.get(key);
                let resource = entry.guard();
                debug!(name = %name, status = ?registry.status(&entry), len = resource.len, "Lookup");
            }
        }
    }
}
