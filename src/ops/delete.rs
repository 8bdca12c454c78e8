//! DELETE Pipeline
//!
//! Deletion is metadata-only: the record goes away and the bytes on the
//! storage nodes become garbage for the offline reclamation system. The
//! deletion counters feed capacity accounting, including whether the
//! accelerated (reference-free) path may reclaim the bytes.

use super::write_precondition;
use crate::context::{ProcessContext, ReqCtx};
use crate::error::{MuskieError, MuskieResult};
use crate::meta::envelope::LoadedPair;
use crate::meta::EntryKind;
use crate::metrics;

/// Delete the loaded entry. The root guard has already run.
pub async fn delete_entry(
    process: &ProcessContext,
    _req: &ReqCtx,
    pair: &LoadedPair,
    conditional: bool,
) -> MuskieResult<()> {
    let Some(metadata) = &pair.entry.metadata else {
        return Err(MuskieError::ResourceNotFound(pair.entry.key.clone()));
    };

    let precondition = write_precondition(pair, conditional);

    match metadata.kind {
        EntryKind::Directory => {
            process.envelope.ensure_directory_empty(&metadata.key).await?;
            process.envelope.remove(&metadata.key, precondition).await?;
            metrics::DELETED_DIRECTORIES.inc();
        }
        EntryKind::Object | EntryKind::Link => {
            process.envelope.remove(&metadata.key, precondition).await?;

            // Accelerated reclamation may only trust bytes that cannot
            // have a second reference: the owner cannot create snaplinks
            // and the object never was a link source.
            let accelerated = metadata.kind == EntryKind::Object
                && metadata.single_path
                && process.snaplinks.account_disabled(&metadata.owner);
            let logical_bytes = metadata.content_length * metadata.sharks.len() as u64;
            metrics::DELETED_BYTES
                .with_label_values(&[if accelerated { "true" } else { "false" }])
                .inc_by(logical_bytes);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReqCtx;
    use crate::meta::{MetadataStore, Precondition};
    use crate::testutil::fixtures;

    async fn loaded(process: &ProcessContext, key: &str) -> LoadedPair {
        process.envelope.load(key, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_delete_object() {
        let (process, _) = fixtures::process_context(&[]).await;
        let req = ReqCtx::new("req-1", "alice");
        process
            .envelope
            .commit(fixtures::object("/alice/stor/x", "alice"), Precondition::None)
            .await
            .unwrap();

        let pair = loaded(&process, "/alice/stor/x").await;
        delete_entry(&process, &req, &pair, false).await.unwrap();
        assert!(process
            .envelope
            .store()
            .get("/alice/stor/x")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let (process, _) = fixtures::process_context(&[]).await;
        let req = ReqCtx::new("req-1", "alice");
        let pair = loaded(&process, "/alice/stor/ghost").await;
        let err = delete_entry(&process, &req, &pair, false).await.unwrap_err();
        assert!(matches!(err, MuskieError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_nonempty_directory() {
        let (process, _) = fixtures::process_context(&[]).await;
        let req = ReqCtx::new("req-1", "alice");
        process
            .envelope
            .commit(
                fixtures::directory("/alice/stor/dir", "alice"),
                Precondition::None,
            )
            .await
            .unwrap();
        process
            .envelope
            .commit(
                fixtures::object("/alice/stor/dir/child", "alice"),
                Precondition::None,
            )
            .await
            .unwrap();

        let pair = loaded(&process, "/alice/stor/dir").await;
        let err = delete_entry(&process, &req, &pair, false).await.unwrap_err();
        assert!(matches!(err, MuskieError::DirectoryNotEmpty(_)));
        // directory survives
        assert!(process
            .envelope
            .store()
            .get("/alice/stor/dir")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_delete_empty_directory() {
        let (process, _) = fixtures::process_context(&[]).await;
        let req = ReqCtx::new("req-1", "alice");
        process
            .envelope
            .commit(
                fixtures::directory("/alice/stor/dir", "alice"),
                Precondition::None,
            )
            .await
            .unwrap();

        let pair = loaded(&process, "/alice/stor/dir").await;
        delete_entry(&process, &req, &pair, false).await.unwrap();
        assert!(process
            .envelope
            .store()
            .get("/alice/stor/dir")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_conditional_delete_requires_current_generation() {
        let (process, _) = fixtures::process_context(&[]).await;
        let req = ReqCtx::new("req-1", "alice");
        let record = fixtures::object("/alice/stor/x", "alice");
        process
            .envelope
            .commit(record.clone(), Precondition::None)
            .await
            .unwrap();

        let pair = loaded(&process, "/alice/stor/x").await;
        // someone else rewrites the record between load and delete
        process
            .envelope
            .commit(record, Precondition::None)
            .await
            .unwrap();

        let err = delete_entry(&process, &req, &pair, true).await.unwrap_err();
        assert!(matches!(err, MuskieError::ConcurrentRequest));
    }
}
