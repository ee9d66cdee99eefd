use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::LOCATION_LOCAL;
use crate::config::TasksConfig;
use crate::content::ContentManager;
use crate::entity::autoretrieve;
use crate::repo::AutoretrieveRepo;

/// Pushes fresh provider records to autoretrieve servers.
#[async_trait]
pub trait IndexRefresher: Send + Sync {
    async fn refresh_index(&self, servers: &[autoretrieve::Model]) -> anyhow::Result<()>;
}

/// Spawn the recurring background work:
///
/// 1. one-shot refresh of the local pin queue,
/// 2. a restart sweep of local legacy transfers after a settling delay,
/// 3. the replication watcher,
/// 4. the autoretrieve index updater.
///
/// All loops stop at the next tick after `shutdown` fires.
pub fn spawn_all(
    manager: Arc<ContentManager>,
    autoretrieves: Arc<dyn AutoretrieveRepo>,
    refresher: Arc<dyn IndexRefresher>,
    cfg: TasksConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            match manager.refresh_pin_queue(LOCATION_LOCAL).await {
                Ok(count) => debug!(count, "Startup pin queue refresh done"),
                Err(e) => error!(error = %e, "Startup pin queue refresh failed"),
            }
        }));
    }

    {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        let settle = Duration::from_secs(cfg.restart_settle_delay_secs);
        handles.push(tokio::spawn(async move {
            // Let networking settle before poking transfers.
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            if let Err(e) = manager.restart_all_transfers(LOCATION_LOCAL).await {
                warn!(error = %e, "Startup transfer restart sweep failed");
            }
        }));
    }

    {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(cfg.replication_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match manager.replication_pass().await {
                    Ok(created) if created > 0 => {
                        info!(created, "Replication pass created deals");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Replication pass failed"),
                }
            }
        }));
    }

    {
        let shutdown = shutdown.clone();
        let interval_minutes = cfg.autoretrieve_interval_minutes.max(1);
        let period = Duration::from_secs(interval_minutes * 60);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let cutoff = Utc::now() - chrono::Duration::minutes(interval_minutes as i64);
                match autoretrieves.online_since(cutoff).await {
                    Ok(servers) if servers.is_empty() => {
                        debug!("No autoretrieve servers online");
                    }
                    Ok(servers) => {
                        let count = servers.len();
                        if let Err(e) = refresher.refresh_index(&servers).await {
                            warn!(error = %e, "Autoretrieve index refresh failed");
                        } else {
                            info!(count, "Autoretrieve index refreshed");
                        }
                    }
                    Err(e) => warn!(error = %e, "Autoretrieve lookup failed"),
                }
            }
        }));
    }

    handles
}
