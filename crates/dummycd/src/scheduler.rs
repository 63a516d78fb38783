//! Periodic reconciliation driver.
//!
//! A single timer visits every application on each tick. Every lock on the
//! way down (registry, repository, application) is acquired with a
//! non-blocking try-lock; anything busy is skipped and retried on the next
//! tick. Reconciliation passes run concurrently across applications, each
//! task carrying its application's mutex guard until it exits.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::registry::Registry;

/// Default seconds between ticks.
pub const DEFAULT_TICK_INTERVAL: u64 = 60;

pub struct TickScheduler {
    registry: Arc<Registry>,
    interval: Duration,
}

impl TickScheduler {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Runs until the shutdown channel is signalled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("scheduler stopped");
                    return;
                }
            }

            self.tick().await;
        }
    }

    /// One pass over every application. Joins all dispatched passes before
    /// releasing the registry.
    async fn tick(&self) {
        let Ok(repos) = self.registry.repos.try_lock() else {
            debug!("busy");
            return;
        };

        debug!("check for updates started");

        let mut tasks = JoinSet::new();

        for repo in repos.iter() {
            let Ok(apps) = repo.apps.try_lock() else {
                debug!("{}: busy", repo.name());
                continue;
            };

            for app in apps.iter() {
                match Arc::clone(&app.state).try_lock_owned() {
                    Ok(mut state) => {
                        let app = Arc::clone(app);
                        tasks.spawn(async move {
                            if let Err(e) = app.run_lifecycle(&mut state).await {
                                error!("{}: {e}", app.name());
                            }
                            // state guard drops here, releasing the
                            // application mutex on task exit
                        });
                    }
                    Err(_) => debug!("{}: busy", app.name()),
                }
            }
            // repository mutex released once its applications are dispatched
        }

        while tasks.join_next().await.is_some() {}
        debug!("finished check for updates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use secrecy::SecretString;
    use tokio::time::timeout;

    use crate::cluster::secrets::{SecretError, SecretStore};
    use crate::registry::EngineEnv;

    struct NoSecrets;

    impl SecretStore for NoSecrets {
        fn ssh_private_key(&self, secret: &str) -> Result<SecretString, SecretError> {
            Err(SecretError::NotFound(secret.to_string()))
        }
    }

    fn empty_registry() -> Arc<Registry> {
        Arc::new(Registry::new(EngineEnv {
            workspace: PathBuf::from("/nonexistent"),
            home: PathBuf::from("/nonexistent"),
            namespace: "dummycd".to_string(),
            secrets: Arc::new(NoSecrets),
        }))
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_scheduler() {
        let scheduler = TickScheduler::new(empty_registry(), Duration::from_millis(10));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(scheduler.run(rx));

        // Let a few ticks happen against the empty registry, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop in time")
            .unwrap();
    }
}
