//! Canned metadata records and wiring for tests

use crate::config::Config;
use crate::context::ProcessContext;
use crate::meta::envelope::Envelope;
use crate::meta::snaplink::SnaplinkGate;
use crate::meta::{EntryKind, MemoryIndex, ObjectMetadata, SharkRef, StaticRoleResolver};
use crate::ops::{OrphanRecord, OrphanSink};
use crate::picker::{Picker, StaticNodeDirectory, StorageNode};
use crate::shark::{SharkClient, SharkRegistry};
use crate::throttle::Throttle;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A plain stored object with two replicas
pub fn object(key: &str, owner: &str) -> ObjectMetadata {
    let parent = key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    ObjectMetadata {
        key: key.to_string(),
        parent: if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        },
        owner: owner.to_string(),
        creator: String::new(),
        kind: EntryKind::Object,
        object_id: uuid::Uuid::new_v4().to_string(),
        content_length: 3,
        content_md5: "rL0Y20zC+Fzt72VPzMSk2A==".to_string(),
        content_type: "application/octet-stream".to_string(),
        content_disposition: None,
        sharks: vec![
            SharkRef {
                datacenter: "east".to_string(),
                storage_id: "1.stor.example.com".to_string(),
            },
            SharkRef {
                datacenter: "west".to_string(),
                storage_id: "2.stor.example.com".to_string(),
            },
        ],
        mtime: 1_700_000_000_000,
        headers: BTreeMap::new(),
        roles: Vec::new(),
        single_path: true,
    }
}

/// A full process context wired to in-memory collaborators and the given
/// mock storage nodes (`storage_id`, `datacenter`, address).
pub async fn process_context(
    nodes: &[(&str, &str, SocketAddr)],
) -> (ProcessContext, mpsc::UnboundedReceiver<OrphanRecord>) {
    let mut config = Config::default();
    config.shark.connect_timeout_ms = 500;
    config.shark.retry.retries = 0;
    config.data_timeout_ms = 2_000;
    config.placement.multi_dc = nodes
        .iter()
        .map(|(_, dc, _)| *dc)
        .collect::<std::collections::HashSet<_>>()
        .len()
        > 1;

    let registry = SharkRegistry::new(config.shark.clone());
    let mut fleet = Vec::new();
    for (storage_id, datacenter, addr) in nodes {
        registry.insert(SharkClient::with_authority(
            *storage_id,
            *datacenter,
            addr.to_string(),
            config.shark.clone(),
        ));
        fleet.push(StorageNode {
            storage_id: storage_id.to_string(),
            datacenter: datacenter.to_string(),
            available_bytes: 1 << 40,
            percent_used: 20,
            last_heartbeat: Utc::now(),
        });
    }

    let picker = Picker::new(config.placement.clone());
    picker.refresh(&StaticNodeDirectory::new(fleet)).await;

    let (orphans, orphan_rx) = OrphanSink::new();
    let context = ProcessContext {
        throttle: Throttle::new(config.throttle.clone()),
        envelope: Envelope::new(Arc::new(MemoryIndex::new())),
        picker,
        sharks: registry,
        roles: Arc::new(StaticRoleResolver::new()),
        snaplinks: SnaplinkGate::new(
            config.snaplink_cleanup_required,
            &config.accounts_snaplinks_disabled,
        ),
        orphans,
        config,
    };
    (context, orphan_rx)
}

/// A directory record
pub fn directory(key: &str, owner: &str) -> ObjectMetadata {
    let mut record = object(key, owner);
    record.kind = EntryKind::Directory;
    record.content_length = 0;
    record.content_md5 = String::new();
    record.content_type = "application/x-json-stream; type=directory".to_string();
    record.sharks = Vec::new();
    record.single_path = false;
    record
}
