//! Periodic traffic sampling.
//!
//! One timer drives all groups. Each tick fans out over the groups stored
//! as running with bounded parallelism; a group whose counters cannot be
//! read is logged and skipped without affecting the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::downsample::reset_safe_delta;
use crate::error::{Error, Result};
use crate::model::Client;
use crate::store::{CounterUpdate, Store};
use crate::supervisor::InterfaceSupervisor;
use crate::wg::PeerStats;

/// Outcome of one sampling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `(group id, clients sampled)`
    pub sampled: Vec<(i64, usize)>,
    pub failed: Vec<(i64, String)>,
}

pub struct StatsSampler {
    store: Arc<Store>,
    supervisor: Arc<InterfaceSupervisor>,
    interval: Duration,
    max_parallel: usize,
}

/// Handle of a spawned sampling loop.
pub struct SamplerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Stop the loop after the tick in progress, if any, completes.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Stats sampler task ended abnormally");
        }
    }
}

impl StatsSampler {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<InterfaceSupervisor>,
        interval: Duration,
        max_parallel: usize,
    ) -> Self {
        Self {
            store,
            supervisor,
            interval,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run the sampling loop on its own task.
    pub fn spawn(self: Arc<Self>) -> SamplerHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(rx).await });
        SamplerHandle { shutdown, task }
    }

    /// Sample every `interval` until `shutdown` flips or its sender is
    /// dropped. The first sample is taken one interval after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Stats sampler started");

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sample_once().await;
                    debug!(
                        sampled = report.sampled.len(),
                        failed = report.failed.len(),
                        "Sampling tick complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stats sampler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Take one sample of every group persisted as running. The store is
    /// the source of truth: other processes start and stop interfaces too.
    pub async fn sample_once(&self) -> TickReport {
        let groups: Vec<i64> = match self.store.list_running_groups().await {
            Ok(groups) => groups.iter().map(|g| g.id).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list running groups, skipping tick");
                return TickReport::default();
            }
        };

        let results: Vec<(i64, Result<usize>)> = stream::iter(groups)
            .map(|group_id| async move { (group_id, self.sample_group(group_id).await) })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        let mut report = TickReport::default();
        for (group_id, result) in results {
            match result {
                Ok(count) => report.sampled.push((group_id, count)),
                Err(e) => {
                    warn!(group_id, error = %e, "Sampling failed, skipping group");
                    report.failed.push((group_id, e.to_string()));
                }
            }
        }
        report.sampled.sort_unstable();
        report.failed.sort();
        report
    }

    async fn sample_group(&self, group_id: i64) -> Result<usize> {
        let peers = self.supervisor.peer_counters(group_id).await?;
        let clients = self
            .store
            .list_clients(group_id)
            .await
            .map_err(|e| Error::Sampling {
                group_id,
                reason: e.to_string(),
            })?;

        let by_key: HashMap<&str, &PeerStats> =
            peers.iter().map(|p| (p.public_key.as_str(), p)).collect();
        let updates: Vec<CounterUpdate> = clients
            .iter()
            .filter_map(|client| {
                by_key
                    .get(client.public_key.as_str())
                    .map(|peer| advance(client, peer))
            })
            .collect();

        self.store
            .record_tick(group_id, &updates, Utc::now())
            .await
            .map_err(|e| Error::Sampling {
                group_id,
                reason: e.to_string(),
            })?;

        Ok(updates.len())
    }
}

/// Advance a client's cumulative totals by the reset-safe growth of the
/// peer's raw counters since the previous sample.
pub fn advance(client: &Client, peer: &PeerStats) -> CounterUpdate {
    let received = reset_safe_delta(client.last_rx, peer.rx_bytes);
    let sent = reset_safe_delta(client.last_tx, peer.tx_bytes);

    CounterUpdate {
        client_id: client.id,
        last_rx: peer.rx_bytes,
        last_tx: peer.tx_bytes,
        total_received: client.total_received.saturating_add(received),
        total_sent: client.total_sent.saturating_add(sent),
        last_handshake: peer.latest_handshake,
    }
}
