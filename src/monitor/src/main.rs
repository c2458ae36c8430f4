//! Cluster autoscaler monitor entrypoint (§6 CLI surface).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleetctl_autoscaler::{Monitor, MonitorConfig, NullAutoscaler, NullNodeProvider};
use fleetctl_kv::{InMemoryKvStore, Namespace};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetctl-monitor")]
struct MonitorArgs {
    #[arg(long)]
    redis_address: String,

    /// Absent ⇒ read-only mode: the monitor mirrors telemetry but issues no
    /// node launches.
    #[arg(long)]
    autoscaling_config: Option<PathBuf>,

    #[arg(long)]
    redis_password: Option<String>,

    #[arg(long, default_value = "info")]
    logging_level: String,

    #[arg(long, default_value = "text")]
    logging_format: String,

    #[arg(long)]
    logging_filename: Option<String>,

    #[arg(long)]
    logs_dir: PathBuf,

    #[arg(long)]
    logging_rotate_bytes: Option<u64>,

    #[arg(long)]
    logging_rotate_backup_count: Option<u32>,

    #[arg(long)]
    monitor_ip: Option<String>,
}

fn init_logging(args: &MonitorArgs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&args.logging_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(filename) = &args.logging_filename {
        // tracing-appender rotates on a time basis, not a byte count;
        // --logging-rotate-bytes/--logging-rotate-backup-count are accepted
        // for CLI compatibility but only daily rotation is applied.
        let appender = tracing_appender::rolling::daily(&args.logs_dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking);
        if args.logging_format == "json" {
            subscriber.json().init();
        } else {
            subscriber.init();
        }
        Some(guard)
    } else {
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        if args.logging_format == "json" {
            subscriber.json().init();
        } else {
            subscriber.init();
        }
        None
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = MonitorArgs::parse();
    let _log_guard = init_logging(&args);

    tracing::info!(redis_address = %args.redis_address, "starting cluster autoscaler monitor");

    if std::env::var("RAY_FAKE_CLUSTER").is_ok() {
        tracing::info!("RAY_FAKE_CLUSTER set: using sentinel head-node addressing");
    }
    let fateshare_workers = std::env::var("RAY_AUTOSCALER_FATESHARE_WORKERS")
        .map(|v| v == "1")
        .unwrap_or(false);

    let read_only = args.autoscaling_config.is_none();
    if let Some(path) = &args.autoscaling_config {
        let raw = std::fs::read_to_string(path)?;
        let _: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    }

    let node_provider = Arc::new(NullNodeProvider);
    let autoscaler = if read_only {
        None
    } else {
        Some(Arc::new(NullAutoscaler::new(node_provider.clone())) as Arc<dyn fleetctl_autoscaler::Autoscaler>)
    };

    let telemetry = Arc::new(fleetctl_autoscaler::FakeTelemetryClient::new(vec![Default::default()]));
    let kv = Arc::new(InMemoryKvStore::new());
    let namespace = Namespace::new("monitor", "default");

    let mut monitor = Monitor::new(
        telemetry,
        kv,
        namespace,
        node_provider,
        autoscaler,
        MonitorConfig {
            update_interval: Duration::from_secs(5),
            telemetry_timeout: Duration::from_secs(60),
            max_demand_vector_len: 1000,
            use_node_id_as_ip: args.monitor_ip.is_none(),
            fateshare_workers,
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let pid = std::process::id();
    let run = tokio::spawn(async move { monitor.run(stop_rx, pid).await });

    tokio::select! {
        result = run => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "monitor loop terminated with a fatal error");
                std::process::exit(1);
            }
        }
        _ = sigint.recv() => {
            let _ = stop_tx.send(true);
            std::process::exit(128 + 2);
        }
        _ = sigterm.recv() => {
            let _ = stop_tx.send(true);
            std::process::exit(128 + 15);
        }
    }

    Ok(())
}
