//! Serve controller entrypoint: wires up the KV store, long-poll notifier,
//! and goal manager, then runs the control loop (§4.9) until a signal asks
//! it to stop.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleetctl_goals::GoalManager;
use fleetctl_kv::{InMemoryKvStore, Namespace};
use fleetctl_longpoll::LongPollHost;
use fleetctl_serve::{ControllerConfig, FakeReplicaActorFactory, HttpOptions, ServeController};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetctl-served")]
struct ServedArgs {
    #[arg(long, default_value = "serve")]
    controller_name: String,

    #[arg(long, default_value = "default")]
    controller_namespace: String,

    #[arg(long, default_value = "info")]
    logging_level: String,

    #[arg(long, default_value_t = 1.0)]
    control_loop_period_s: f64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = ServedArgs::parse();
    let filter = EnvFilter::try_new(&args.logging_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(controller_name = %args.controller_name, "starting serve controller");

    let kv = Arc::new(InMemoryKvStore::new());
    let namespace = Namespace::new(&args.controller_name, &args.controller_namespace);
    let goals = GoalManager::new();
    let longpoll = Arc::new(LongPollHost::new());
    let factory = Arc::new(FakeReplicaActorFactory { polls_until_ready: 1 });

    let controller = Arc::new(ServeController::new(
        kv,
        namespace,
        goals,
        longpoll,
        factory,
        HttpOptions::default(),
        ControllerConfig {
            control_loop_period: Duration::from_secs_f64(args.control_loop_period_s),
            ..ControllerConfig::default()
        },
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let loop_controller = controller.clone();
    let run = tokio::spawn(async move { loop_controller.run(stop_rx).await });

    tokio::select! {
        _ = run => {}
        _ = sigint.recv() => {
            let _ = stop_tx.send(true);
        }
        _ = sigterm.recv() => {
            let _ = stop_tx.send(true);
        }
    }

    Ok(())
}
