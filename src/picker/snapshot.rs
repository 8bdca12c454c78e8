//! Placement View
//!
//! An immutable snapshot of the eligible storage fleet, split into a normal
//! and an operator view (the operator view admits nodes up to a higher
//! utilization ceiling). Within each datacenter nodes are sorted ascending
//! by `available_bytes`, so eligibility for a given object size is a single
//! binary search.

use crate::config::PlacementConfig;
use crate::error::{MuskieError, MuskieResult};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One storage node as reported by the node directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageNode {
    pub storage_id: String,
    pub datacenter: String,
    pub available_bytes: u64,
    pub percent_used: u32,
    pub last_heartbeat: DateTime<Utc>,
}

/// A set of `replicas` distinct nodes chosen together for one write
pub type PlacementTuple = Vec<Arc<StorageNode>>;

/// Immutable dual view of the fleet. Built whole, swapped whole.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Nodes under the normal utilization ceiling, per datacenter,
    /// ascending by available_bytes
    normal: HashMap<String, Vec<Arc<StorageNode>>>,
    /// Nodes under the operator ceiling, same ordering
    operator: HashMap<String, Vec<Arc<StorageNode>>>,
}

impl Snapshot {
    /// Build a snapshot from a directory poll. Nodes over the operator
    /// ceiling or with stale heartbeats are dropped here even if the
    /// directory already filtered them.
    pub fn build(nodes: Vec<StorageNode>, config: &PlacementConfig, now: DateTime<Utc>) -> Self {
        let staleness =
            chrono::Duration::milliseconds(config.staleness_window().as_millis() as i64);
        let mut normal: HashMap<String, Vec<Arc<StorageNode>>> = HashMap::new();
        let mut operator: HashMap<String, Vec<Arc<StorageNode>>> = HashMap::new();

        for node in nodes {
            if node.percent_used > config.operator_utilization_pct {
                continue;
            }
            if now.signed_duration_since(node.last_heartbeat) > staleness {
                continue;
            }
            let node = Arc::new(node);
            operator
                .entry(node.datacenter.clone())
                .or_default()
                .push(Arc::clone(&node));
            if node.percent_used <= config.utilization_pct {
                normal
                    .entry(node.datacenter.clone())
                    .or_default()
                    .push(node);
            }
        }

        for view in [&mut normal, &mut operator] {
            for nodes in view.values_mut() {
                nodes.sort_by_key(|n| n.available_bytes);
            }
        }

        Self { normal, operator }
    }

    fn view(&self, operator: bool) -> &HashMap<String, Vec<Arc<StorageNode>>> {
        if operator {
            &self.operator
        } else {
            &self.normal
        }
    }

    /// Total nodes in the operator view
    pub fn node_count(&self) -> usize {
        self.operator.values().map(Vec::len).sum()
    }

    /// Datacenters present in the operator view
    pub fn datacenter_count(&self) -> usize {
        self.operator.len()
    }

    /// Choose three candidate tuples of `replicas` distinct nodes each,
    /// every node fitting `size` bytes, each tuple spanning at least two
    /// datacenters when the deployment is multi-DC and `replicas >= 2`.
    /// The first tuple is primary; the rest are fallbacks.
    pub fn choose(
        &self,
        size: u64,
        replicas: usize,
        operator: bool,
        multi_dc: bool,
    ) -> MuskieResult<Vec<PlacementTuple>> {
        self.choose_with_rng(size, replicas, operator, multi_dc, &mut rand::thread_rng())
    }

    /// Deterministic variant for tests
    pub fn choose_with_rng<R: Rng>(
        &self,
        size: u64,
        replicas: usize,
        operator: bool,
        multi_dc: bool,
        rng: &mut R,
    ) -> MuskieResult<Vec<PlacementTuple>> {
        const TUPLES: usize = 3;

        if replicas == 0 {
            return Err(MuskieError::InvalidParameter("zero replicas".into()));
        }

        // Per-DC slice of the nodes that fit the requested size.
        let mut eligible: Vec<&[Arc<StorageNode>]> = Vec::new();
        for nodes in self.view(operator).values() {
            let offset = nodes.partition_point(|n| n.available_bytes < size);
            if offset < nodes.len() {
                eligible.push(&nodes[offset..]);
            }
        }

        let spread_required = multi_dc && replicas >= 2;
        if eligible.is_empty() {
            return Err(MuskieError::NotEnoughSpace(format!(
                "{} copies requested, but no DC has sufficient space",
                replicas
            )));
        }
        if spread_required && eligible.len() < 2 {
            return Err(MuskieError::NotEnoughSpace(format!(
                "{} copies requested, but only 1 DC has sufficient space",
                replicas
            )));
        }
        let fleet: usize = eligible.iter().map(|nodes| nodes.len()).sum();
        if fleet < replicas {
            return Err(MuskieError::NotEnoughSpace(format!(
                "{} copies requested, but only {} nodes have sufficient space",
                replicas, fleet
            )));
        }

        // Nodes used by earlier tuples; reused only when the eligible set
        // is too small to avoid it.
        let mut used_anywhere: HashSet<String> = HashSet::new();
        let mut tuples: Vec<PlacementTuple> = Vec::with_capacity(TUPLES);

        for _ in 0..TUPLES {
            let tuple = fill_tuple(&eligible, replicas, &mut used_anywhere, rng)?;
            if spread_required {
                let dcs: HashSet<&str> = tuple.iter().map(|n| n.datacenter.as_str()).collect();
                if dcs.len() < 2 {
                    return Err(MuskieError::NotEnoughSpace(format!(
                        "{} copies requested, but only 1 DC has sufficient space",
                        replicas
                    )));
                }
            }
            tuples.push(tuple);
        }

        tuples.shuffle(rng);
        Ok(tuples)
    }
}

/// Round-robin the shuffled datacenters, picking a uniformly random unseen
/// node from each until the tuple is full. A datacenter with nothing left
/// to offer is skipped; when every one is exhausted the tuple is
/// incompletable.
fn fill_tuple<R: Rng>(
    eligible: &[&[Arc<StorageNode>]],
    replicas: usize,
    used_anywhere: &mut HashSet<String>,
    rng: &mut R,
) -> MuskieResult<PlacementTuple> {
    let mut order: Vec<usize> = (0..eligible.len()).collect();
    order.shuffle(rng);

    let mut tuple: PlacementTuple = Vec::with_capacity(replicas);
    let mut in_tuple: HashSet<String> = HashSet::new();
    let mut exhausted = vec![false; eligible.len()];
    let mut cursor = 0usize;

    while tuple.len() < replicas {
        if exhausted.iter().all(|&e| e) {
            return Err(MuskieError::NotEnoughSpace(format!(
                "{} copies requested, but only {} nodes have sufficient space",
                replicas,
                tuple.len()
            )));
        }
        let slot = order[cursor % order.len()];
        cursor += 1;
        if exhausted[slot] {
            continue;
        }
        let nodes = eligible[slot];

        // Prefer nodes no tuple has used; fall back to cross-tuple reuse
        // when the fleet is too small for three disjoint tuples.
        let fresh: Vec<&Arc<StorageNode>> = nodes
            .iter()
            .filter(|n| !in_tuple.contains(&n.storage_id) && !used_anywhere.contains(&n.storage_id))
            .collect();
        let pool: Vec<&Arc<StorageNode>> = if fresh.is_empty() {
            nodes
                .iter()
                .filter(|n| !in_tuple.contains(&n.storage_id))
                .collect()
        } else {
            fresh
        };

        if pool.is_empty() {
            exhausted[slot] = true;
            continue;
        }
        let pick = Arc::clone(pool[rng.gen_range(0..pool.len())]);
        in_tuple.insert(pick.storage_id.clone());
        used_anywhere.insert(pick.storage_id.clone());
        tuple.push(pick);
    }
    Ok(tuple)
}
