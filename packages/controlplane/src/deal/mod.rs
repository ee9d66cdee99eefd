use std::sync::Arc;

use async_trait::async_trait;
use common::Cid;
use dashmap::DashMap;
use rpc::{ChannelId, Command, TransferStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DealConfig;
use crate::entity::{content, deal};
use crate::repo::{ContentRepo, DealRepo, NewDeal, RepoError};
use crate::shuttle::{BusError, CommandSender};
use crate::LOCATION_LOCAL;

#[derive(Debug, Error)]
pub enum DealError {
    #[error("content {0} not found")]
    ContentNotFound(i64),

    #[error("deal {0} not found")]
    DealNotFound(i64),

    /// The transport reports the transfer terminated while the deal row
    /// still shows it in progress. The deal is failed when this is raised.
    #[error("transfer state inconsistent for deal {0}: {1}")]
    TransferInconsistent(i64, String),

    /// The deal has no restartable push-style transfer (no channel, pull
    /// token, or already acknowledged).
    #[error("deal {0} has no restartable transfer")]
    NotRestartable(i64),

    #[error("deal client error: {0}")]
    Client(String),

    #[error("command bus error: {0}")]
    Bus(#[from] BusError),

    #[error("repository error: {0}")]
    Db(#[from] RepoError),
}

/// Piece commitment (commP) for a content, computed over its block graph.
#[derive(Debug, Clone)]
pub struct PieceCommitment {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub payload_size: u64,
}

/// Outcome of a deal proposal a provider accepted.
#[derive(Debug, Clone)]
pub struct ProposedDeal {
    pub proposal_cid: String,
    /// Channel token if a transfer was opened immediately; pull-style
    /// providers open the transfer later.
    pub transfer_channel: Option<String>,
}

/// Market-side operations against storage providers.
#[async_trait]
pub trait DealClient: Send + Sync {
    async fn propose_deal(
        &self,
        content: &content::Model,
        provider: &str,
        piece: &PieceCommitment,
    ) -> Result<ProposedDeal, DealError>;

    /// Transport-level status for a push channel, if the transport still
    /// knows about it.
    async fn transfer_status(
        &self,
        channel: &ChannelId,
    ) -> Result<Option<TransferStatus>, DealError>;

    async fn restart_transfer(&self, channel: &ChannelId) -> Result<(), DealError>;

    /// Chain-side acknowledgement check; returns the external deal id once
    /// the provider has published the deal.
    async fn check_deal_ack(&self, deal: &deal::Model) -> Result<Option<i64>, DealError>;
}

/// Picks storage providers for new deals.
#[async_trait]
pub trait ProviderSelector: Send + Sync {
    async fn select_providers(
        &self,
        content: &content::Model,
        count: usize,
        excluded: &[String],
    ) -> Result<Vec<String>, DealError>;
}

#[async_trait]
pub trait PieceCommitmentProvider: Send + Sync {
    async fn piece_commitment(&self, cid: &Cid) -> Result<PieceCommitment, DealError>;
}

/// Drives content toward its replication target and keeps deal rows
/// consistent with what providers and the transport report.
///
/// All deal-state mutations for one content are serialized through a
/// per-content lock: status reports arrive on a pool of bus workers, and two
/// reports for deals of the same content must not both see the same
/// replication deficit.
pub struct DealEngine {
    contents: Arc<dyn ContentRepo>,
    deals: Arc<dyn DealRepo>,
    client: Arc<dyn DealClient>,
    selector: Arc<dyn ProviderSelector>,
    commitments: Arc<dyn PieceCommitmentProvider>,
    commands: Arc<dyn CommandSender>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    cfg: DealConfig,
}

impl DealEngine {
    pub fn new(
        contents: Arc<dyn ContentRepo>,
        deals: Arc<dyn DealRepo>,
        client: Arc<dyn DealClient>,
        selector: Arc<dyn ProviderSelector>,
        commitments: Arc<dyn PieceCommitmentProvider>,
        commands: Arc<dyn CommandSender>,
        cfg: DealConfig,
    ) -> Self {
        Self {
            contents,
            deals,
            client,
            selector,
            commitments,
            commands,
            locks: DashMap::new(),
            cfg,
        }
    }

    fn content_lock(&self, content_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(content_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the map entry once no task holds the lock anymore, so the map
    /// tracks in-flight content only instead of every content ever touched.
    fn release_content_lock(&self, content_id: i64) {
        self.locks
            .remove_if(&content_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Compare the content's non-failed deal count against its replication
    /// target and propose deals for the deficit. One provider failing to
    /// accept does not abort the rest. Returns the number of deals created.
    pub async fn evaluate_replication(&self, content_id: i64) -> Result<usize, DealError> {
        let lock = self.content_lock(content_id);
        let result = {
            let _guard = lock.lock().await;
            self.evaluate_replication_locked(content_id).await
        };
        drop(lock);
        self.release_content_lock(content_id);
        result
    }

    async fn evaluate_replication_locked(&self, content_id: i64) -> Result<usize, DealError> {
        if self.cfg.disable_deal_making {
            debug!(content_id, "Deal making disabled, skipping replication");
            return Ok(0);
        }

        let content = self
            .contents
            .get(content_id)
            .await?
            .ok_or(DealError::ContentNotFound(content_id))?;

        if !content.deal_eligible() {
            return Ok(0);
        }

        let existing = self.deals.non_failed_for_content(content_id).await?;
        let deficit = (content.replication as usize).saturating_sub(existing.len());
        if deficit == 0 {
            return Ok(0);
        }

        let excluded: Vec<String> = existing.iter().map(|d| d.provider.clone()).collect();
        let providers = self
            .selector
            .select_providers(&content, deficit, &excluded)
            .await?;
        if providers.is_empty() {
            warn!(content_id, deficit, "No providers available for deficit");
            return Ok(0);
        }

        let cid = Cid::from_hex(&content.cid)
            .map_err(|e| DealError::Client(format!("content {content_id} has bad cid: {e}")))?;
        let piece = self.commitments.piece_commitment(&cid).await?;

        let mut created = 0;
        for provider in providers {
            if self.deals.has_in_flight(content_id, &provider).await? {
                continue;
            }

            match self.client.propose_deal(&content, &provider, &piece).await {
                Ok(proposed) => {
                    self.deals
                        .create(NewDeal {
                            content_id,
                            provider: provider.clone(),
                            proposal_cid: Some(proposed.proposal_cid),
                            transfer_channel: proposed.transfer_channel,
                        })
                        .await?;
                    created += 1;
                    info!(content_id, provider = %provider, "Deal proposed");
                }
                Err(e) => {
                    warn!(content_id, provider = %provider, error = %e, "Deal proposal failed");
                }
            }
        }

        Ok(created)
    }

    /// Apply a transfer status report to a deal. Terminal failure fails the
    /// deal and immediately re-evaluates replication for its content.
    /// Reports for already-failed deals are ignored, so replays are safe.
    pub async fn on_transfer_status(
        &self,
        deal_row_id: i64,
        status: &TransferStatus,
    ) -> Result<(), DealError> {
        let content_id = match self.deals.get(deal_row_id).await? {
            Some(d) => d.content_id,
            None => {
                warn!(deal = deal_row_id, "Transfer status for unknown deal");
                return Ok(());
            }
        };

        let lock = self.content_lock(content_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_transfer_status(deal_row_id, status).await
        };
        drop(lock);
        self.release_content_lock(content_id);
        result
    }

    async fn apply_transfer_status(
        &self,
        deal_row_id: i64,
        status: &TransferStatus,
    ) -> Result<(), DealError> {
        // Re-read under the lock: a concurrent report may have already
        // failed the deal.
        let deal = match self.deals.get(deal_row_id).await? {
            Some(d) => d,
            None => return Ok(()),
        };
        if deal.failed {
            return Ok(());
        }

        match status {
            TransferStatus::Failed { reason } => {
                warn!(deal = deal.id, content_id = deal.content_id, reason = %reason, "Transfer failed");
                self.deals.mark_failed(deal.id).await?;
                self.evaluate_replication_locked(deal.content_id).await?;
            }
            TransferStatus::Cancelled => {
                warn!(deal = deal.id, content_id = deal.content_id, "Transfer cancelled");
                self.deals.mark_failed(deal.id).await?;
                self.evaluate_replication_locked(deal.content_id).await?;
            }
            TransferStatus::Completed => {
                debug!(deal = deal.id, "Transfer completed, awaiting provider ack");
            }
            TransferStatus::Requested | TransferStatus::Ongoing => {}
        }

        Ok(())
    }

    /// Poll the chain for acknowledgements of a content's pending deals and
    /// record external deal ids as they land.
    pub async fn update_deal_acks(&self, content_id: i64) -> Result<(), DealError> {
        let lock = self.content_lock(content_id);
        let result = {
            let _guard = lock.lock().await;
            self.update_deal_acks_locked(content_id).await
        };
        drop(lock);
        self.release_content_lock(content_id);
        result
    }

    async fn update_deal_acks_locked(&self, content_id: i64) -> Result<(), DealError> {
        for deal in self.deals.non_failed_for_content(content_id).await? {
            if deal.deal_id != 0 {
                continue;
            }
            if let Some(external_id) = self.client.check_deal_ack(&deal).await? {
                info!(deal = deal.id, external_id, "Deal acknowledged by provider");
                self.deals.set_deal_id(deal.id, external_id).await?;
            }
        }
        Ok(())
    }

    /// Restart a single deal's push transfer after checking the transport
    /// agrees it is still live. If the transport says the transfer already
    /// terminated, the deal is failed and the mismatch reported.
    pub async fn restart_transfer(&self, deal_row_id: i64) -> Result<(), DealError> {
        let content_id = self
            .deals
            .get(deal_row_id)
            .await?
            .ok_or(DealError::DealNotFound(deal_row_id))?
            .content_id;

        let lock = self.content_lock(content_id);
        let result = {
            let _guard = lock.lock().await;
            self.restart_transfer_locked(deal_row_id).await
        };
        drop(lock);
        self.release_content_lock(content_id);
        result
    }

    async fn restart_transfer_locked(&self, deal_row_id: i64) -> Result<(), DealError> {
        let deal = self
            .deals
            .get(deal_row_id)
            .await?
            .ok_or(DealError::DealNotFound(deal_row_id))?;

        if !deal.in_flight() {
            return Err(DealError::NotRestartable(deal.id));
        }
        let channel = deal
            .legacy_channel()
            .ok_or(DealError::NotRestartable(deal.id))?;

        if let Some(status) = self.client.transfer_status(&channel).await? {
            if status.terminated() {
                self.deals.mark_failed(deal.id).await?;
                return Err(DealError::TransferInconsistent(
                    deal.id,
                    format!("transport reports terminal state {status:?}"),
                ));
            }
        }

        self.client.restart_transfer(&channel).await
    }

    /// Restart every in-flight push transfer whose content lives at the
    /// given location. Local transfers go through the deal client; remote
    /// ones are delegated to the owning shuttle. Per-deal failures are
    /// logged and do not stop the sweep. Returns the number attempted.
    pub async fn restart_all_transfers(&self, location: &str) -> Result<usize, DealError> {
        let candidates = self.deals.restart_candidates(location).await?;
        let mut attempted = 0;

        for deal in candidates {
            let Some(channel) = deal.legacy_channel() else {
                // Pull transfers are restarted provider-side.
                continue;
            };
            attempted += 1;

            let result = if location == LOCATION_LOCAL {
                self.restart_transfer(deal.id).await
            } else {
                self.commands
                    .send_command(location, Command::RestartTransfer { channel_id: channel })
                    .await
                    .map_err(DealError::from)
            };

            if let Err(e) = result {
                warn!(deal = deal.id, location, error = %e, "Transfer restart failed");
            }
        }

        info!(location, attempted, "Transfer restart sweep finished");
        Ok(attempted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::repo::memory::MemoryRepos;

    const PEER_A: &str = "12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA";
    const PEER_B: &str = "12D3KooWGRYbzvQu8sVxkBFTDQksGtXtMzCDGiQcEdyQ1WMAVmrp";

    fn push_channel(transfer_id: u64) -> String {
        format!("{PEER_A}-{PEER_B}-{transfer_id}")
    }

    fn in_flight_deal(content_id: i64, provider: &str, transfer_id: u64) -> deal::Model {
        deal::Model {
            id: 0,
            content_id,
            provider: provider.into(),
            deal_id: 0,
            transfer_channel: Some(push_channel(transfer_id)),
            proposal_cid: None,
            failed: false,
            failed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn eligible_content(id: i64, replication: i32) -> content::Model {
        let now = Utc::now();
        content::Model {
            id,
            cid: Cid::compute(&id.to_le_bytes()).to_hex(),
            name: format!("content-{id}"),
            owner: 1,
            size: 100,
            active: true,
            pinning: false,
            failed: false,
            offloaded: false,
            replication,
            location: LOCATION_LOCAL.to_string(),
            aggregated_in: None,
            aggregate: false,
            dag_split: false,
            split_from: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[derive(Default)]
    struct StubClient {
        proposals: Mutex<Vec<String>>,
        restarts: Mutex<Vec<ChannelId>>,
        statuses: Mutex<HashMap<String, TransferStatus>>,
        acks: Mutex<HashMap<i64, i64>>,
        /// Artificial proposal latency, to widen race windows in tests.
        propose_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl DealClient for StubClient {
        async fn propose_deal(
            &self,
            _content: &content::Model,
            provider: &str,
            _piece: &PieceCommitment,
        ) -> Result<ProposedDeal, DealError> {
            let delay = self.propose_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if provider == "f0bad" {
                return Err(DealError::Client("proposal rejected".into()));
            }
            self.proposals.lock().unwrap().push(provider.to_string());
            Ok(ProposedDeal {
                proposal_cid: format!("prop-{provider}"),
                transfer_channel: Some(push_channel(1)),
            })
        }

        async fn transfer_status(
            &self,
            channel: &ChannelId,
        ) -> Result<Option<TransferStatus>, DealError> {
            Ok(self.statuses.lock().unwrap().get(&channel.to_string()).cloned())
        }

        async fn restart_transfer(&self, channel: &ChannelId) -> Result<(), DealError> {
            self.restarts.lock().unwrap().push(channel.clone());
            Ok(())
        }

        async fn check_deal_ack(&self, deal: &deal::Model) -> Result<Option<i64>, DealError> {
            Ok(self.acks.lock().unwrap().get(&deal.id).copied())
        }
    }

    struct StubSelector {
        providers: Vec<String>,
    }

    #[async_trait]
    impl ProviderSelector for StubSelector {
        async fn select_providers(
            &self,
            _content: &content::Model,
            count: usize,
            excluded: &[String],
        ) -> Result<Vec<String>, DealError> {
            Ok(self
                .providers
                .iter()
                .filter(|p| !excluded.contains(p))
                .take(count)
                .cloned()
                .collect())
        }
    }

    struct StubCommitments;

    #[async_trait]
    impl PieceCommitmentProvider for StubCommitments {
        async fn piece_commitment(&self, cid: &Cid) -> Result<PieceCommitment, DealError> {
            Ok(PieceCommitment {
                piece_cid: *cid,
                piece_size: 256,
                payload_size: 100,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, Command)>>,
    }

    #[async_trait]
    impl CommandSender for RecordingSender {
        async fn send_command(&self, location: &str, cmd: Command) -> Result<(), BusError> {
            self.sent.lock().unwrap().push((location.to_string(), cmd));
            Ok(())
        }
    }

    struct Harness {
        repos: Arc<MemoryRepos>,
        client: Arc<StubClient>,
        sender: Arc<RecordingSender>,
        engine: Arc<DealEngine>,
    }

    fn harness(providers: &[&str], disable: bool) -> Harness {
        let repos = Arc::new(MemoryRepos::new());
        let client = Arc::new(StubClient::default());
        let sender = Arc::new(RecordingSender::default());
        let engine = Arc::new(DealEngine::new(
            repos.clone(),
            repos.clone(),
            client.clone(),
            Arc::new(StubSelector {
                providers: providers.iter().map(|s| s.to_string()).collect(),
            }),
            Arc::new(StubCommitments),
            sender.clone(),
            DealConfig {
                disable_deal_making: disable,
            },
        ));
        Harness {
            repos,
            client,
            sender,
            engine,
        }
    }

    #[tokio::test]
    async fn fills_replication_deficit() {
        let h = harness(&["f01", "f02", "f03", "f04"], false);
        let content = h.repos.insert_content(eligible_content(0, 3));

        let created = h.engine.evaluate_replication(content.id).await.unwrap();

        assert_eq!(created, 3);
        assert_eq!(h.repos.deal_count(), 3);
        let deals = h.repos.non_failed_for_content(content.id).await.unwrap();
        assert!(deals.iter().all(|d| d.deal_id == 0 && !d.failed));
    }

    #[tokio::test]
    async fn existing_providers_are_not_doubled_up() {
        let h = harness(&["f01", "f02", "f03"], false);
        let content = h.repos.insert_content(eligible_content(0, 3));

        assert_eq!(h.engine.evaluate_replication(content.id).await.unwrap(), 3);
        // Target met: a second pass must not create more.
        assert_eq!(h.engine.evaluate_replication(content.id).await.unwrap(), 0);
        assert_eq!(h.repos.deal_count(), 3);
    }

    #[tokio::test]
    async fn one_rejecting_provider_does_not_abort_the_rest() {
        let h = harness(&["f01", "f0bad", "f03"], false);
        let content = h.repos.insert_content(eligible_content(0, 3));

        let created = h.engine.evaluate_replication(content.id).await.unwrap();

        assert_eq!(created, 2);
        let proposed = h.client.proposals.lock().unwrap().clone();
        assert_eq!(proposed, vec!["f01".to_string(), "f03".to_string()]);
    }

    #[tokio::test]
    async fn disabled_deal_making_creates_nothing() {
        let h = harness(&["f01"], true);
        let content = h.repos.insert_content(eligible_content(0, 3));

        assert_eq!(h.engine.evaluate_replication(content.id).await.unwrap(), 0);
        assert_eq!(h.repos.deal_count(), 0);
    }

    #[tokio::test]
    async fn ineligible_content_is_skipped() {
        let h = harness(&["f01"], false);
        let mut model = eligible_content(0, 3);
        model.active = false;
        model.pinning = true;
        let content = h.repos.insert_content(model);

        assert_eq!(h.engine.evaluate_replication(content.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_transfer_fails_deal_and_replaces_it() {
        let h = harness(&["f01", "f02"], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        assert_eq!(h.engine.evaluate_replication(content.id).await.unwrap(), 1);
        let deal = h.repos.non_failed_for_content(content.id).await.unwrap()[0].clone();

        let status = TransferStatus::Failed {
            reason: "peer disconnected".into(),
        };
        h.engine.on_transfer_status(deal.id, &status).await.unwrap();

        let failed = DealRepo::get(h.repos.as_ref(), deal.id).await.unwrap().unwrap();
        assert!(failed.failed && failed.failed_at.is_some());
        // Replacement deal went to the next provider.
        let live = h.repos.non_failed_for_content(content.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].provider, "f02");

        // Replaying the same report is a no-op.
        h.engine.on_transfer_status(deal.id, &status).await.unwrap();
        assert_eq!(h.repos.deal_count(), 2);
    }

    #[tokio::test]
    async fn deal_acks_record_external_ids() {
        let h = harness(&["f01"], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        h.engine.evaluate_replication(content.id).await.unwrap();
        let deal = h.repos.non_failed_for_content(content.id).await.unwrap()[0].clone();

        h.client.acks.lock().unwrap().insert(deal.id, 777);
        h.engine.update_deal_acks(content.id).await.unwrap();

        let acked = DealRepo::get(h.repos.as_ref(), deal.id).await.unwrap().unwrap();
        assert_eq!(acked.deal_id, 777);
    }

    #[tokio::test]
    async fn restart_checks_transport_before_restarting() {
        let h = harness(&["f01"], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        h.engine.evaluate_replication(content.id).await.unwrap();
        let deal = h.repos.non_failed_for_content(content.id).await.unwrap()[0].clone();

        h.engine.restart_transfer(deal.id).await.unwrap();
        assert_eq!(h.client.restarts.lock().unwrap().len(), 1);

        // Restarting again is safe: no new deal rows, deal still in flight.
        h.engine.restart_transfer(deal.id).await.unwrap();
        assert_eq!(h.repos.deal_count(), 1);
        let row = DealRepo::get(h.repos.as_ref(), deal.id).await.unwrap().unwrap();
        assert!(row.in_flight());
    }

    #[tokio::test]
    async fn restart_of_terminated_transfer_fails_the_deal() {
        let h = harness(&["f01"], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        h.engine.evaluate_replication(content.id).await.unwrap();
        let deal = h.repos.non_failed_for_content(content.id).await.unwrap()[0].clone();
        let channel = deal.transfer_channel.clone().unwrap();

        h.client
            .statuses
            .lock()
            .unwrap()
            .insert(channel, TransferStatus::Completed);

        let err = h.engine.restart_transfer(deal.id).await.unwrap_err();
        assert!(matches!(err, DealError::TransferInconsistent(_, _)));

        let failed = DealRepo::get(h.repos.as_ref(), deal.id).await.unwrap().unwrap();
        assert!(failed.failed);
        assert!(h.client.restarts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pull_transfers_are_not_restartable() {
        let h = harness(&[], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        let deal = h.repos.insert_deal(deal::Model {
            id: 0,
            content_id: content.id,
            provider: "f09".into(),
            deal_id: 0,
            transfer_channel: Some("e2f7c3f0-13ce-4d07-9a43-0fd0c1f23c41".into()),
            proposal_cid: None,
            failed: false,
            failed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let err = h.engine.restart_transfer(deal.id).await.unwrap_err();
        assert!(matches!(err, DealError::NotRestartable(_)));
    }

    #[tokio::test]
    async fn remote_restart_sweep_goes_through_the_bus() {
        let h = harness(&[], false);
        let mut model = eligible_content(0, 1);
        model.location = "shuttle-1".into();
        let content = h.repos.insert_content(model);
        h.repos.insert_deal(in_flight_deal(content.id, "f07", 9));

        let attempted = h.engine.restart_all_transfers("shuttle-1").await.unwrap();

        assert_eq!(attempted, 1);
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "shuttle-1");
        assert!(matches!(sent[0].1, Command::RestartTransfer { .. }));
    }

    #[tokio::test]
    async fn local_restart_sweep_uses_the_deal_client() {
        let h = harness(&[], false);
        let content = h.repos.insert_content(eligible_content(0, 1));
        h.repos.insert_deal(in_flight_deal(content.id, "f07", 4));

        let attempted = h
            .engine
            .restart_all_transfers(LOCATION_LOCAL)
            .await
            .unwrap();

        assert_eq!(attempted, 1);
        assert_eq!(h.client.restarts.lock().unwrap().len(), 1);
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_failure_reports_do_not_over_replicate() {
        let h = harness(&["f03", "f04", "f05"], false);
        let content = h.repos.insert_content(eligible_content(0, 2));
        let d1 = h.repos.insert_deal(in_flight_deal(content.id, "f01", 1));
        let d2 = h.repos.insert_deal(in_flight_deal(content.id, "f02", 2));

        // Slow proposals keep the first report busy while the second lands.
        h.client.propose_delay_ms.store(20, Ordering::Relaxed);

        let status = TransferStatus::Failed {
            reason: "stalled".into(),
        };
        let (e1, s1) = (h.engine.clone(), status.clone());
        let (e2, s2) = (h.engine.clone(), status.clone());
        let t1 = tokio::spawn(async move { e1.on_transfer_status(d1.id, &s1).await });
        let t2 = tokio::spawn(async move { e2.on_transfer_status(d2.id, &s2).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        // Both reports saw a deficit, but in sequence: the replication
        // target is met exactly, never exceeded.
        let live = h.repos.non_failed_for_content(content.id).await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(h.engine.locks.is_empty());
    }

    #[tokio::test]
    async fn content_locks_are_released_after_use() {
        let h = harness(&["f01"], false);
        let content = h.repos.insert_content(eligible_content(0, 1));

        h.engine.evaluate_replication(content.id).await.unwrap();
        h.engine.update_deal_acks(content.id).await.unwrap();

        assert!(h.engine.locks.is_empty());
    }
}
