use std::sync::Arc;

use async_trait::async_trait;
use common::Cid;
use rpc::{Command, Message};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::LOCATION_LOCAL;
use crate::config::ContentConfig;
use crate::deal::{DealEngine, DealError};
use crate::entity::content;
use crate::gc::{GarbageCollector, GcError, GcStats};
use crate::pin::{PinError, PinJob, PinScheduler, PinStatusSink};
use crate::repo::{ContentRepo, NewContent, ObjectRepo, RepoError};
use crate::shuttle::{BusError, CommandSender, LocalCommandHandler, MessageHandler};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content adding is disabled")]
    AddingDisabled,

    #[error("content {0} not found")]
    NotFound(i64),

    #[error("repository error: {0}")]
    Db(#[from] RepoError),

    #[error(transparent)]
    Deal(#[from] DealError),
}

#[derive(Debug, Clone)]
pub struct AddContentRequest {
    pub cid: Cid,
    pub name: String,
    pub owner: i64,
    /// Replication target; defaults from config when absent.
    pub replication: Option<i32>,
    /// Where the content gets pinned; [`LOCATION_LOCAL`] or a shuttle
    /// handle.
    pub location: String,
}

/// Front door for the content lifecycle: creates records, routes pin work
/// to the local scheduler or a shuttle, applies shuttle reports, and runs
/// the periodic replication pass.
pub struct ContentManager {
    contents: Arc<dyn ContentRepo>,
    objects: Arc<dyn ObjectRepo>,
    scheduler: Arc<PinScheduler>,
    engine: Arc<DealEngine>,
    commands: Arc<dyn CommandSender>,
    gc: Arc<GarbageCollector>,
    cfg: ContentConfig,
}

impl ContentManager {
    pub fn new(
        contents: Arc<dyn ContentRepo>,
        objects: Arc<dyn ObjectRepo>,
        scheduler: Arc<PinScheduler>,
        engine: Arc<DealEngine>,
        commands: Arc<dyn CommandSender>,
        gc: Arc<GarbageCollector>,
        cfg: ContentConfig,
    ) -> Self {
        Self {
            contents,
            objects,
            scheduler,
            engine,
            commands,
            gc,
            cfg,
        }
    }

    /// Create a content record in `pinning` state and dispatch the pin.
    ///
    /// A failed dispatch to a shuttle does not fail the call; the record
    /// stays in `pinning` and the next pin queue refresh re-dispatches it.
    pub async fn add_content(
        &self,
        req: AddContentRequest,
    ) -> Result<content::Model, ContentError> {
        if self.cfg.disable_global_adding {
            return Err(ContentError::AddingDisabled);
        }
        if req.location == LOCATION_LOCAL && self.cfg.disable_local_adding {
            return Err(ContentError::AddingDisabled);
        }

        let replication = req.replication.unwrap_or(self.cfg.default_replication);
        let model = self
            .contents
            .create(NewContent {
                cid: req.cid,
                name: req.name,
                owner: req.owner,
                size: 0,
                replication,
                location: req.location,
            })
            .await?;

        info!(content_id = model.id, location = %model.location, "Content added");
        self.dispatch_pin(&model).await;
        Ok(model)
    }

    /// Soft-delete a content and drop its object references. Blocks are
    /// reclaimed later by the garbage collector. Repeated removal is a
    /// no-op.
    pub async fn remove_content(&self, id: i64) -> Result<(), ContentError> {
        let content = self
            .contents
            .get(id)
            .await?
            .ok_or(ContentError::NotFound(id))?;
        if content.deleted_at.is_some() {
            return Ok(());
        }

        self.contents.soft_delete(id).await?;
        self.objects.drop_refs_for_content(id).await?;
        info!(content_id = id, "Content removed");

        if content.location != LOCATION_LOCAL {
            if let Err(e) = self
                .commands
                .send_command(&content.location, Command::RemoveContent { content_id: id })
                .await
            {
                warn!(content_id = id, location = %content.location, error = %e,
                    "Unpin command not delivered");
            }
        }
        Ok(())
    }

    /// Re-dispatch every content still in `pinning` state at a location.
    /// Run at startup and whenever a shuttle reconnects, so pins lost to a
    /// crash or missed command get picked back up.
    pub async fn refresh_pin_queue(&self, location: &str) -> Result<usize, ContentError> {
        let pending = self.contents.pinning_at(location).await?;
        let count = pending.len();
        for model in &pending {
            self.dispatch_pin(model).await;
        }
        if count > 0 {
            info!(location, count, "Pin queue refreshed");
        }
        Ok(count)
    }

    /// One replication sweep over all deal-eligible content: pick up
    /// provider acknowledgements, then propose deals for any deficit. The
    /// deal engine serializes each content's deal work against concurrent
    /// status reports. Per-content failures are logged and do not stop the
    /// sweep. Returns the number of deals created.
    pub async fn replication_pass(&self) -> Result<usize, ContentError> {
        let candidates = self.contents.deal_candidates().await?;
        let mut created = 0;

        for model in candidates {
            if let Err(e) = self.engine.update_deal_acks(model.id).await {
                warn!(content_id = model.id, error = %e, "Deal ack check failed");
                continue;
            }
            match self.engine.evaluate_replication(model.id).await {
                Ok(n) => created += n,
                Err(e) => {
                    warn!(content_id = model.id, error = %e, "Replication evaluation failed");
                }
            }
        }

        Ok(created)
    }

    pub async fn restart_all_transfers(&self, location: &str) -> Result<usize, ContentError> {
        Ok(self.engine.restart_all_transfers(location).await?)
    }

    /// Sweep the local block store for unreferenced blocks.
    pub async fn garbage_collect(&self) -> Result<GcStats, GcError> {
        self.gc.run().await
    }

    async fn dispatch_pin(&self, model: &content::Model) {
        let cid = match Cid::from_hex(&model.cid) {
            Ok(c) => c,
            Err(e) => {
                warn!(content_id = model.id, error = %e, "Content has unparseable cid");
                return;
            }
        };

        if model.location == LOCATION_LOCAL {
            self.scheduler.submit(PinJob {
                content_id: model.id,
                owner: model.owner,
                cid,
            });
        } else if let Err(e) = self
            .commands
            .send_command(
                &model.location,
                Command::AddContent {
                    content_id: model.id,
                    cid,
                    owner: model.owner,
                },
            )
            .await
        {
            warn!(content_id = model.id, location = %model.location, error = %e,
                "Pin command not delivered, awaiting refresh");
        }
    }
}

#[async_trait]
impl MessageHandler for ContentManager {
    async fn handle_message(&self, source: &str, msg: Message) -> anyhow::Result<()> {
        match msg {
            // Intercepted by the bus; nothing to do here.
            Message::Heartbeat(_) => {}
            Message::PinComplete {
                content_id,
                size,
                objects,
            } => {
                let blocks: Vec<(Cid, i64)> = objects.iter().map(|o| (o.cid, o.size)).collect();
                self.objects.add_objects(content_id, &blocks).await?;
                self.contents.mark_active(content_id, size).await?;
                info!(content_id, shuttle = source, size, "Content pinned remotely");
            }
            Message::PinFailed { content_id, reason } => {
                warn!(content_id, shuttle = source, reason = %reason, "Remote pin failed");
                self.contents.mark_failed(content_id).await?;
            }
            Message::TransferStatus {
                deal_id, status, ..
            } => {
                self.engine.on_transfer_status(deal_id, &status).await?;
            }
            Message::CommandError { op, error } => {
                warn!(shuttle = source, op = %op, error = %error, "Shuttle rejected command");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LocalCommandHandler for ContentManager {
    async fn handle_command(&self, cmd: Command) -> Result<(), BusError> {
        match cmd {
            Command::AddContent {
                content_id,
                cid,
                owner,
            } => {
                self.scheduler.submit(PinJob {
                    content_id,
                    owner,
                    cid,
                });
                Ok(())
            }
            // References were dropped when the content was removed; the
            // blocks are left to the garbage collector.
            Command::RemoveContent { content_id } => {
                debug!(content_id, "Local unpin acknowledged");
                Ok(())
            }
            other => Err(BusError::Local(format!(
                "{} is not executable locally",
                other.op()
            ))),
        }
    }
}

/// Applies terminal pin outcomes from the local scheduler to content rows.
pub struct ContentPinSink {
    contents: Arc<dyn ContentRepo>,
}

impl ContentPinSink {
    pub fn new(contents: Arc<dyn ContentRepo>) -> Self {
        Self { contents }
    }
}

#[async_trait]
impl PinStatusSink for ContentPinSink {
    async fn pin_succeeded(&self, job: &PinJob, size: i64) {
        info!(content_id = job.content_id, size, "Content pinned");
        if let Err(e) = self.contents.mark_active(job.content_id, size).await {
            warn!(content_id = job.content_id, error = %e, "Failed to mark content active");
        }
    }

    async fn pin_failed(&self, job: &PinJob, error: &PinError) {
        warn!(content_id = job.content_id, error = %error, "Content pin failed");
        if let Err(e) = self.contents.mark_failed(job.content_id).await {
            warn!(content_id = job.content_id, error = %e, "Failed to mark content failed");
        }
    }
}
