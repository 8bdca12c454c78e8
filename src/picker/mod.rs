//! Placement Selector
//!
//! Maintains a per-datacenter, utilization-filtered, capacity-sorted view of
//! the storage fleet and answers placement queries for new objects. A
//! background task refreshes the view from the node directory; readers swap
//! in whole snapshots and never see a partial rebuild. `choose` is pure
//! in-memory work and never touches the network.

pub mod directory;
pub mod snapshot;

pub use directory::{HttpNodeDirectory, NodeDirectory, StaticNodeDirectory};
pub use snapshot::{PlacementTuple, Snapshot, StorageNode};

use crate::config::PlacementConfig;
use crate::error::MuskieResult;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Page size used when draining the node directory
const POLL_PAGE_LIMIT: usize = 500;

/// The placement selector
pub struct Picker {
    config: PlacementConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    ready_tx: watch::Sender<bool>,
}

impl Picker {
    pub fn new(config: PlacementConfig) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            ready_tx,
        })
    }

    /// True once at least one refresh has succeeded
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Readiness signal for the HTTP layer (`/ping` gates on it)
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// The current snapshot (cheap pointer clone)
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Choose three candidate tuples for an object of `size` bytes at the
    /// requested durability. See [`Snapshot::choose`] for the guarantees.
    pub fn choose(
        &self,
        size: u64,
        replicas: usize,
        operator: bool,
    ) -> MuskieResult<Vec<PlacementTuple>> {
        self.current()
            .choose(size, replicas, operator, self.config.multi_dc)
    }

    /// Swap in a freshly built snapshot and fire the ready signal
    fn install(&self, snapshot: Snapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
        self.ready_tx.send_replace(true);
    }

    /// One refresh: drain the directory and swap the view. Errors and empty
    /// results leave the previous snapshot in place; an empty fleet is far
    /// more likely a directory fault than a truly empty deployment.
    pub async fn refresh(&self, directory: &dyn NodeDirectory) {
        let mut nodes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match directory.page(cursor.as_deref(), POLL_PAGE_LIMIT).await {
                Ok(page) => {
                    nodes.extend(page.nodes);
                    match page.next {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "node directory poll failed; keeping previous view");
                    return;
                }
            }
        }

        if nodes.is_empty() {
            tracing::warn!("node directory returned no nodes; keeping previous view");
            return;
        }

        let snapshot = Snapshot::build(nodes, &self.config, Utc::now());
        tracing::debug!(
            nodes = snapshot.node_count(),
            datacenters = snapshot.datacenter_count(),
            "installed placement snapshot"
        );
        self.install(snapshot);
    }

    /// Spawn the periodic refresh loop
    pub fn spawn_refresh(
        self: &Arc<Self>,
        directory: Arc<dyn NodeDirectory>,
    ) -> tokio::task::JoinHandle<()> {
        let picker = Arc::clone(self);
        let period = self.config.refresh_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                picker.refresh(directory.as_ref()).await;
            }
        })
    }
}
