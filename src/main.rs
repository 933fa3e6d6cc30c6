// Copyright (c) Abstract Machines

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rapid_harness::monitoring::create_probe;
use rapid_harness::monitoring::log::MonitorLog;
use rapid_harness::monitoring::sampler::TelemetrySampler;
use rapid_harness::{probe, HarnessConfig, HostLauncher, Orchestrator};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Fleet launcher and telemetry scraper for Rapid membership experiments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a fleet and monitor it until interrupted
    Run {
        /// Number of workers in the fleet
        #[arg(short, long)]
        n_proc: Option<usize>,
        /// Port of the seed; workers use consecutive ports after it
        #[arg(short, long)]
        base_port: Option<u16>,
        /// Address workers listen on (resolved automatically when omitted)
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Seed address given to every worker instead of the first worker
        #[arg(long)]
        seed: Option<SocketAddr>,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long)]
        monitor_log: Option<PathBuf>,
        /// Interface to capture fleet traffic on (all when omitted)
        #[arg(short, long)]
        interface: Option<String>,
        /// Disable per-port traffic accounting
        #[arg(long)]
        no_capture: bool,
        /// Also sample every worker process
        #[arg(long)]
        monitor_workers: bool,
        /// Write monitoring records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Sample one process (or the host) into the monitoring log until interrupted
    Monitor {
        #[arg(short, long)]
        pid: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Send one test message to a destination
    Send {
        #[arg(long)]
        to: SocketAddr,
        /// Use TCP instead of UDP
        #[arg(long)]
        tcp: bool,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Wait for one UDP datagram and print it
    Listen {
        #[arg(long, default_value = "0.0.0.0:37389")]
        bind: SocketAddr,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Flips the returned receiver to true on ctrl-c.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping...");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HarnessConfig::load(cli.config.as_deref()).context("loading configuration")?;

    init_logging(&config.log_level)?;

    match cli.command {
        Commands::Run {
            n_proc,
            base_port,
            ip,
            seed,
            log_dir,
            monitor_log,
            interface,
            no_capture,
            monitor_workers,
            json,
        } => {
            if let Some(n) = n_proc {
                config.n_proc = n;
            }
            if let Some(port) = base_port {
                config.base_port = port;
            }
            if ip.is_some() {
                config.ip_address = ip;
            }
            if seed.is_some() {
                config.seed_address = seed;
            }
            if let Some(dir) = log_dir {
                config.log_dir = dir;
            }
            if let Some(path) = monitor_log {
                config.monitor_log = path;
            }
            if interface.is_some() {
                config.interface = interface;
            }
            if no_capture {
                config.capture_traffic = false;
            }
            if monitor_workers {
                config.monitor_workers = true;
            }
            if json {
                config.record_format = rapid_harness::types::RecordFormat::Json;
            }

            info!(
                "Starting fleet of {} workers from port {}",
                config.n_proc, config.base_port
            );
            info!("Worker command: {:?}", config.worker_command);
            info!("Log directory: {}", config.log_dir.display());

            let launcher = Arc::new(HostLauncher::from_config(&config));
            let orchestrator = Orchestrator::new(config, launcher);
            let report = orchestrator.run(shutdown_on_ctrl_c()).await?;

            info!(
                "Session {} finished: {} launched, {} failed, {} exited, {} terminated",
                report.session_id,
                report.launched,
                report.failed,
                report.exited,
                report.terminated
            );
        }
        Commands::Monitor { pid, interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.sample_interval());
            let log = MonitorLog::open(&config.monitor_log, config.record_format)
                .await?
                .shared();

            let sampler = match pid {
                Some(pid) => {
                    info!("Monitoring process {}", pid);
                    TelemetrySampler::process(create_probe(), pid, log, interval)
                }
                None => {
                    info!("Monitoring host");
                    TelemetrySampler::host(create_probe(), log, interval)
                }
            };
            sampler.run(shutdown_on_ctrl_c()).await?;
        }
        Commands::Send { to, tcp, message } => {
            let payload = message
                .map(String::into_bytes)
                .unwrap_or_else(|| probe::DEFAULT_MESSAGE.to_vec());
            if tcp {
                probe::send_tcp(to, &payload).await?;
            } else {
                probe::send_udp(to, &payload).await?;
            }
        }
        Commands::Listen { bind } => {
            let (data, peer) = probe::listen_once(bind, 4096).await?;
            println!("Received packet from {peer}");
            println!("Data: {}", String::from_utf8_lossy(&data));
        }
    }

    Ok(())
}
