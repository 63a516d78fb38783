//! dummycd server binary.
//!
//! Boots the engine: resolves the workspace and the engine's namespace,
//! starts the control server and the tick scheduler, and shuts both down on
//! ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use dummycd::cluster::KubectlSecretStore;
use dummycd::scheduler::DEFAULT_TICK_INTERVAL;
use dummycd::{paths, ControlServer, EngineEnv, Registry, TickScheduler};

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Parser, Debug)]
#[command(
    name = "dummycd",
    version,
    about = "Continuous-delivery engine that keeps Kubernetes workloads in sync with Git repositories"
)]
struct Cli {
    /// Control server port.
    #[arg(long, default_value_t = 50031)]
    port: u16,

    /// Seconds between reconciliation ticks.
    #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL)]
    tick_interval: u64,

    /// Log filter: error, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let home = dirs::home_dir().context("cannot determine home directory")?;
    let workspace = paths::workspace_dir_at(&home);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("cannot create workspace at {}", workspace.display()))?;

    let namespace = current_namespace()?;

    let registry = Arc::new(Registry::new(EngineEnv {
        workspace,
        home,
        namespace: namespace.clone(),
        secrets: Arc::new(KubectlSecretStore::new(namespace)),
    }));

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler = TickScheduler::new(
        Arc::clone(&registry),
        Duration::from_secs(cli.tick_interval),
    );
    let server = ControlServer::new(Arc::clone(&registry), cli.port);

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
    let mut server_task = tokio::spawn(server.run(shutdown_tx.subscribe()));

    info!("server started");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutting down");

            let _ = shutdown_tx.send(());
            let _ = scheduler_task.await;
            let _ = server_task.await;
            Ok(())
        }
        result = &mut server_task => {
            let _ = shutdown_tx.send(());
            let _ = scheduler_task.await;

            match result {
                Ok(Ok(())) => bail!("control server exited unexpectedly"),
                Ok(Err(e)) => Err(e).context("control server failed"),
                Err(e) => Err(e).context("control server panicked"),
            }
        }
    }
}

/// The engine's own namespace: the serviceaccount namespace file in-cluster,
/// `DUMMYCD_NAMESPACE` otherwise. Failing both is fatal at bootstrap.
fn current_namespace() -> Result<String> {
    if let Ok(contents) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        let namespace = contents.trim();
        if !namespace.is_empty() {
            return Ok(namespace.to_string());
        }
    }

    if let Ok(namespace) = std::env::var("DUMMYCD_NAMESPACE") {
        if !namespace.is_empty() {
            return Ok(namespace);
        }
    }

    bail!(
        "error while define current namespace: no serviceaccount namespace file \
         and DUMMYCD_NAMESPACE is unset"
    )
}
