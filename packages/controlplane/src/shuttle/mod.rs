use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rpc::{Command, Heartbeat, Message};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::LOCATION_LOCAL;
use crate::config::ShuttleConfig;
use crate::repo::{RepoError, ShuttleRepo};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("shuttle {0} is not connected")]
    NotConnected(String),

    /// Connected but no heartbeat within the liveness window.
    #[error("shuttle {0} is offline")]
    Offline(String),

    #[error("outbound queue full for shuttle {0}")]
    QueueFull(String),

    #[error("local command failed: {0}")]
    Local(String),

    #[error("repository error: {0}")]
    Db(#[from] RepoError),
}

/// Narrow sending seam so components queue commands without seeing the
/// rest of the bus.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, location: &str, cmd: Command) -> Result<(), BusError>;
}

/// Executes commands addressed to the local node instead of a shuttle.
#[async_trait]
pub trait LocalCommandHandler: Send + Sync {
    async fn handle_command(&self, cmd: Command) -> Result<(), BusError>;
}

/// Consumer for non-heartbeat messages arriving from shuttles.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, source: &str, msg: Message) -> anyhow::Result<()>;
}

struct ShuttleConn {
    tx: mpsc::Sender<Command>,
    last_heartbeat: DateTime<Utc>,
}

/// Routes commands to shuttles and fans inbound shuttle messages out to a
/// handler pool.
///
/// Sends are queue-and-forget: a command is accepted once it sits in the
/// target shuttle's bounded outbound queue. Sends to shuttles that are not
/// connected, or whose last heartbeat is outside the liveness window, fail
/// fast instead of queueing into the void.
pub struct CommandBus {
    conns: DashMap<String, ShuttleConn>,
    shuttles: Arc<dyn ShuttleRepo>,
    local: OnceLock<Arc<dyn LocalCommandHandler>>,
    cfg: ShuttleConfig,
}

impl CommandBus {
    pub fn new(shuttles: Arc<dyn ShuttleRepo>, cfg: ShuttleConfig) -> Self {
        Self {
            conns: DashMap::new(),
            shuttles,
            local: OnceLock::new(),
            cfg,
        }
    }

    /// Register the in-process executor for commands addressed to
    /// [`LOCATION_LOCAL`]. May only be set once.
    pub fn set_local_handler(&self, handler: Arc<dyn LocalCommandHandler>) {
        if self.local.set(handler).is_err() {
            warn!("Local command handler already registered");
        }
    }

    /// Register a shuttle connection, returning the receiver the transport
    /// drains into the wire. Reconnecting replaces any previous queue.
    pub fn connect(&self, handle: &str) -> mpsc::Receiver<Command> {
        let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_size);
        info!(shuttle = handle, "Shuttle connected");
        self.conns.insert(
            handle.to_string(),
            ShuttleConn {
                tx,
                last_heartbeat: Utc::now(),
            },
        );
        rx
    }

    pub fn disconnect(&self, handle: &str) {
        if self.conns.remove(handle).is_some() {
            info!(shuttle = handle, "Shuttle disconnected");
        }
    }

    /// Whether a shuttle is connected with a heartbeat inside the liveness
    /// window.
    pub fn is_online(&self, handle: &str) -> bool {
        let window = Duration::seconds(self.cfg.liveness_window_secs as i64);
        self.conns
            .get(handle)
            .map(|c| Utc::now() - c.last_heartbeat <= window)
            .unwrap_or(false)
    }

    /// Record a heartbeat: refreshes in-memory liveness and persists the
    /// shuttle row.
    pub async fn heartbeat(&self, hb: &Heartbeat) -> Result<(), BusError> {
        if let Some(mut conn) = self.conns.get_mut(&hb.handle) {
            conn.last_heartbeat = Utc::now();
        }
        self.shuttles.record_heartbeat(hb).await?;
        debug!(shuttle = %hb.handle, "Heartbeat recorded");
        Ok(())
    }

    /// Spawn the inbound handler pool over a shared message stream.
    ///
    /// Heartbeats are intercepted here; everything else goes to `handler`.
    /// Multiple workers pull from the one receiver, so a slow message does
    /// not block the ones behind it.
    pub fn start_message_handlers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<(String, Message)>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        info!(
            workers = self.cfg.message_handlers,
            "Starting shuttle message handlers"
        );

        (0..self.cfg.message_handlers)
            .map(|_| {
                let bus = Arc::clone(self);
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let received = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                msg = rx.recv() => msg,
                            }
                        };
                        let Some((source, msg)) = received else {
                            return;
                        };

                        match msg {
                            Message::Heartbeat(hb) => {
                                if let Err(e) = bus.heartbeat(&hb).await {
                                    warn!(shuttle = %hb.handle, error = %e, "Heartbeat handling failed");
                                }
                            }
                            other => {
                                let op = other.op();
                                if let Err(e) = handler.handle_message(&source, other).await {
                                    warn!(shuttle = %source, op, error = %e, "Message handling failed");
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl CommandSender for CommandBus {
    async fn send_command(&self, location: &str, cmd: Command) -> Result<(), BusError> {
        if location == LOCATION_LOCAL {
            let handler = self
                .local
                .get()
                .ok_or_else(|| BusError::Local("no local command handler registered".into()))?;
            return handler.handle_command(cmd).await;
        }

        let conn = self
            .conns
            .get(location)
            .ok_or_else(|| BusError::NotConnected(location.to_string()))?;

        let window = Duration::seconds(self.cfg.liveness_window_secs as i64);
        if Utc::now() - conn.last_heartbeat > window {
            return Err(BusError::Offline(location.to_string()));
        }

        match conn.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(shuttle = location, op = cmd.op(), "Outbound queue full");
                Err(BusError::QueueFull(location.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(conn);
                self.conns.remove(location);
                Err(BusError::NotConnected(location.to_string()))
            }
        }
    }
}
