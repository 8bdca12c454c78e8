//! Object Data Plane
//!
//! The read/write/delete/list operations behind the HTTP surface. These
//! functions assume the server layer has already normalized the key, loaded
//! the entry/parent pair, and run the namespace guards.

pub mod delete;
pub mod get;
pub mod list;
pub mod put;

pub use put::PutOutcome;

use crate::error::MuskieError;
use crate::meta::envelope::LoadedPair;
use crate::meta::{Precondition, SharkRef};
use crate::shark::SharkError;
use tokio::sync::mpsc;

/// Durability bounds and defaults for the Durability-Level header
pub const DEFAULT_DURABILITY: u32 = 2;

/// A failed PUT may leave bytes on nodes that no metadata references.
/// Recording them is the data plane's entire obligation; reclamation is an
/// offline system.
#[derive(Debug, Clone)]
pub struct OrphanRecord {
    pub object_id: String,
    pub owner: String,
    pub sharks: Vec<SharkRef>,
}

/// Fire-and-forget orphan queue. Never blocks a failure path.
#[derive(Clone)]
pub struct OrphanSink {
    tx: mpsc::UnboundedSender<OrphanRecord>,
}

impl OrphanSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrphanRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, record: OrphanRecord) {
        tracing::info!(
            object_id = %record.object_id,
            owner = %record.owner,
            sharks = record.sharks.len(),
            "recording orphaned backend data"
        );
        if self.tx.send(record).is_err() {
            tracing::warn!("orphan queue receiver is gone; record only logged");
        }
    }
}

/// The write precondition implied by the conditional state of a request:
/// conditional requests pin the loaded generation (or its absence), plain
/// requests commit unconditionally.
pub fn write_precondition(pair: &LoadedPair, conditional: bool) -> Precondition {
    if !conditional {
        return Precondition::None;
    }
    match &pair.entry.etag {
        Some(etag) => Precondition::IfEtag(etag.clone()),
        None => Precondition::IfAbsent,
    }
}

/// Map a storage-node failure on the upload path into the public taxonomy
pub fn map_upload_error(err: SharkError, client_sent_md5: bool) -> MuskieError {
    tracing::warn!(storage_id = %err.storage_id(), %err, "shark upload failure");
    match err {
        SharkError::ChecksumRejected { .. } => MuskieError::Checksum,
        SharkError::BackendStatus { status, .. } if (400..500).contains(&status) => {
            if client_sent_md5 {
                MuskieError::BadRequest("storage node rejected the request".to_string())
            } else {
                MuskieError::Internal(format!("storage node returned {status}"))
            }
        }
        SharkError::IdleTimeout { .. } => MuskieError::UploadTimeout,
        other => MuskieError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::LoadedEntry;

    #[test]
    fn test_write_precondition() {
        let pair = LoadedPair {
            entry: LoadedEntry {
                key: "/alice/stor/x".to_string(),
                metadata: None,
                etag: Some("etag-1".to_string()),
            },
            parent: None,
        };
        assert_eq!(
            write_precondition(&pair, true),
            Precondition::IfEtag("etag-1".to_string())
        );
        assert_eq!(write_precondition(&pair, false), Precondition::None);

        let pair = LoadedPair {
            entry: LoadedEntry::missing("/alice/stor/x"),
            parent: None,
        };
        assert_eq!(write_precondition(&pair, true), Precondition::IfAbsent);
    }

    #[test]
    fn test_upload_error_mapping() {
        let checksum = SharkError::ChecksumRejected {
            storage_id: "1.stor".to_string(),
        };
        assert!(matches!(
            map_upload_error(checksum, true),
            MuskieError::Checksum
        ));

        let status_4xx = |status| SharkError::BackendStatus {
            storage_id: "1.stor".to_string(),
            status,
            headers: http::HeaderMap::new(),
            body: String::new(),
        };
        assert!(matches!(
            map_upload_error(status_4xx(400), true),
            MuskieError::BadRequest(_)
        ));
        assert!(matches!(
            map_upload_error(status_4xx(400), false),
            MuskieError::Internal(_)
        ));
        assert!(matches!(
            map_upload_error(status_4xx(503), true),
            MuskieError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_orphan_sink_delivers() {
        let (sink, mut rx) = OrphanSink::new();
        sink.record(OrphanRecord {
            object_id: "oid".to_string(),
            owner: "alice".to_string(),
            sharks: Vec::new(),
        });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.object_id, "oid");
    }
}
