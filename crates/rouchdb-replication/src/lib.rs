//! The CouchDB-style replication protocol: one call, `replicate`, that pulls
//! every change a source knows about into a target and leaves a checkpoint
//! behind so the next run can resume where this one left off.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use rouchdb_core::adapter::{Adapter, ReadRequest, RevsDiffRequest};
use rouchdb_core::document::{BulkDocsOptions, ChangesOptions, Document, GetOptions, ReadRevs, Seq};
use rouchdb_core::error::{Result, RouchError};

const REPLICATION_ID_VERSION: u32 = 1;
const MAX_HISTORY_ENTRIES: usize = 5;

/// `replicate`'s two boolean knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicationOptions {
    /// Create the target database if it does not already exist.
    pub create_target: bool,
    /// Keep replicating as new changes arrive instead of stopping once the
    /// current change feed is drained.
    pub continuous: bool,
}

/// One entry of a checkpoint document's `history` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub start_time: String,
    pub end_time: String,
    pub start_last_seq: Seq,
    pub end_last_seq: Seq,
    pub recorded_seq: Seq,
    pub docs_read: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
}

/// The `_local/<replication_id>` checkpoint document shape, shared by both
/// peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    replication_id_version: u32,
    session_id: String,
    source_last_seq: Seq,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

/// The result of one `replicate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationResult {
    pub ok: bool,
    pub history: Vec<HistoryEntry>,
    pub replication_id_version: u32,
    pub session_id: String,
    pub source_last_seq: Seq,
}

/// `md5(source_id || target_id || create_target || continuous)`, lowercase
/// hex. Both peers derive the same checkpoint document id from this, so it
/// must be computed identically everywhere — order and exact boolean
/// rendering (`"true"`/`"false"`) matter.
fn replication_id(source_id: &str, target_id: &str, create_target: bool, continuous: bool) -> String {
    let mut hasher = Md5::new();
    hasher.update(source_id.as_bytes());
    hasher.update(target_id.as_bytes());
    hasher.update(create_target.to_string().as_bytes());
    hasher.update(continuous.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn read_checkpoint(adapter: &dyn Adapter, local_id: &str) -> Option<Checkpoint> {
    let results = adapter
        .read(vec![ReadRequest {
            id: local_id.to_string(),
            opts: GetOptions::default(),
        }])
        .await;
    let docs = results.into_iter().next()?.ok()?;
    let doc = docs.into_iter().next()?;
    serde_json::from_value(doc.data).ok()
}

async fn write_checkpoint(adapter: &dyn Adapter, local_id: &str, checkpoint: &Checkpoint) -> Result<()> {
    let data = serde_json::to_value(checkpoint)?;
    let doc = Document {
        id: local_id.to_string(),
        rev: None,
        deleted: false,
        data,
        revisions: None,
    };
    let results = adapter.write(vec![doc], BulkDocsOptions::new()).await;
    if !results[0].ok {
        return Err(RouchError::ReplicationFailed(format!(
            "failed to write checkpoint: {}",
            results[0].reason.clone().unwrap_or_default()
        )));
    }
    Ok(())
}

/// Walk the source's history for the newest session id the target also
/// recognizes and return that entry's recorded sequence.
fn find_common_checkpoint(source: &Option<Checkpoint>, target: &Option<Checkpoint>) -> Option<Seq> {
    let (source, target) = match (source, target) {
        (Some(s), Some(t)) => (s, t),
        _ => return None,
    };
    if source.replication_id_version != REPLICATION_ID_VERSION
        || target.replication_id_version != REPLICATION_ID_VERSION
    {
        return None;
    }
    if source.session_id == target.session_id {
        return Some(source.source_last_seq);
    }
    let target_sessions: HashSet<&str> = target.history.iter().map(|h| h.session_id.as_str()).collect();
    source
        .history
        .iter()
        .find(|h| target_sessions.contains(h.session_id.as_str()))
        .map(|h| h.recorded_seq)
}

fn prepend_history(existing: &Option<Checkpoint>, entry: HistoryEntry) -> Vec<HistoryEntry> {
    let mut history = vec![entry];
    if let Some(ckpt) = existing {
        history.extend(ckpt.history.iter().cloned());
    }
    history.truncate(MAX_HISTORY_ENTRIES);
    history
}

/// Replicate every change `source` knows about into `target`.
///
/// When `opts.continuous` is true this call only returns once `cancel` is
/// triggered; no checkpoint is written in that case; the next run resumes
/// from the same `startup_checkpoint` this one used. When `false`, this
/// drains the current change feed, commits the target, writes a checkpoint
/// on both peers, and returns.
#[instrument(skip(source, target, cancel), fields(source_id, target_id, replication_id))]
pub async fn replicate(
    source: Arc<dyn Adapter>,
    target: Arc<dyn Adapter>,
    opts: ReplicationOptions,
    cancel: CancellationToken,
) -> Result<ReplicationResult> {
    // P1: verify peers.
    source
        .update_seq()
        .await
        .map_err(|e| RouchError::PeerNotFound(format!("source: {e}")))?;

    if target.update_seq().await.is_err() {
        if opts.create_target {
            target.create().await?;
            target
                .update_seq()
                .await
                .map_err(|e| RouchError::PeerNotFound(format!("target: {e}")))?;
        } else {
            return Err(RouchError::PeerNotFound("target database does not exist".into()));
        }
    }

    // P2: replication id.
    let source_id = source.id().await?;
    let target_id = target.id().await?;
    let replication_id = replication_id(&source_id, &target_id, opts.create_target, opts.continuous);
    let local_id = format!("_local/{replication_id}");

    tracing::Span::current().record("source_id", &source_id.as_str());
    tracing::Span::current().record("target_id", &target_id.as_str());
    tracing::Span::current().record("replication_id", &replication_id.as_str());
    info!("starting replication");

    // P3: find common checkpoint.
    let source_checkpoint = read_checkpoint(source.as_ref(), &local_id).await;
    let target_checkpoint = read_checkpoint(target.as_ref(), &local_id).await;
    let startup_checkpoint =
        find_common_checkpoint(&source_checkpoint, &target_checkpoint).unwrap_or(Seq::zero());
    debug!(since = startup_checkpoint.0, "resolved startup checkpoint");

    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let start_time = Local::now().to_rfc2822();

    let mut last_seq = startup_checkpoint;
    let mut docs_read = 0u64;
    let mut docs_written = 0u64;
    let mut doc_write_failures = 0u64;
    let mut cancelled = false;

    // P4: streaming pipeline.
    'outer: loop {
        let changes = source
            .changes(ChangesOptions {
                since: last_seq,
                limit: None,
                include_docs: false,
                doc_ids: None,
            })
            .await?;

        if changes.results.is_empty() {
            if !opts.continuous {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                _ = cancel.cancelled() => { cancelled = true; break; }
            }
        }

        for change in changes.results {
            if cancel.is_cancelled() {
                cancelled = true;
                break 'outer;
            }

            last_seq = change.seq;
            let revs: Vec<String> = change.changes.iter().map(|c| c.rev.clone()).collect();
            let mut diff = target
                .revs_diff(vec![RevsDiffRequest {
                    id: change.id.clone(),
                    revs,
                }])
                .await?;
            let missing = std::mem::take(&mut diff[0].missing);
            if missing.is_empty() {
                continue;
            }

            let mut read_results = source
                .read(vec![ReadRequest {
                    id: change.id.clone(),
                    opts: GetOptions {
                        revs: ReadRevs::Specific(missing),
                        conflicts: false,
                        include_path: true,
                    },
                }])
                .await;
            let docs = match std::mem::replace(&mut read_results[0], Ok(Vec::new())) {
                Ok(docs) => docs,
                Err(_) => continue,
            };
            if docs.is_empty() {
                continue;
            }

            docs_read += docs.len() as u64;
            let write_results = target.write(docs, BulkDocsOptions::replication()).await;
            for r in &write_results {
                if r.ok {
                    docs_written += 1;
                } else {
                    doc_write_failures += 1;
                }
            }
        }

        if !opts.continuous {
            break;
        }
    }

    if cancelled {
        info!(docs_read, docs_written, doc_write_failures, "replication cancelled");
        let entry = HistoryEntry {
            session_id: session_id.clone(),
            start_time,
            end_time: Local::now().to_rfc2822(),
            start_last_seq: startup_checkpoint,
            end_last_seq: last_seq,
            recorded_seq: last_seq,
            docs_read,
            docs_written,
            doc_write_failures,
        };
        // No checkpoint is written on cancellation (see module docs); the
        // stats reported here are visibility only, not a persisted record.
        return Ok(ReplicationResult {
            ok: true,
            history: vec![entry],
            replication_id_version: REPLICATION_ID_VERSION,
            session_id,
            source_last_seq: startup_checkpoint,
        });
    }

    // P5: commit barrier.
    target.ensure_full_commit().await?;

    // P6: record checkpoint.
    let recorded_seq = last_seq;
    if recorded_seq != startup_checkpoint {
        let entry = HistoryEntry {
            session_id: session_id.clone(),
            start_time,
            end_time: Local::now().to_rfc2822(),
            start_last_seq: startup_checkpoint,
            end_last_seq: recorded_seq,
            recorded_seq,
            docs_read,
            docs_written,
            doc_write_failures,
        };

        let source_history = prepend_history(&source_checkpoint, entry.clone());
        let target_history = prepend_history(&target_checkpoint, entry);

        let checkpoint_for_source = Checkpoint {
            replication_id_version: REPLICATION_ID_VERSION,
            session_id: session_id.clone(),
            source_last_seq: recorded_seq,
            history: source_history,
        };
        let checkpoint_for_target = Checkpoint {
            replication_id_version: REPLICATION_ID_VERSION,
            session_id: session_id.clone(),
            source_last_seq: recorded_seq,
            history: target_history,
        };

        write_checkpoint(source.as_ref(), &local_id, &checkpoint_for_source).await?;
        write_checkpoint(target.as_ref(), &local_id, &checkpoint_for_target).await?;
    }

    info!(docs_read, docs_written, doc_write_failures, "replication complete");

    // P7: return stats.
    Ok(ReplicationResult {
        ok: true,
        history: vec![HistoryEntry {
            session_id: session_id.clone(),
            start_time: Local::now().to_rfc2822(),
            end_time: Local::now().to_rfc2822(),
            start_last_seq: startup_checkpoint,
            end_last_seq: recorded_seq,
            recorded_seq,
            docs_read,
            docs_written,
            doc_write_failures,
        }],
        replication_id_version: REPLICATION_ID_VERSION,
        session_id,
        source_last_seq: recorded_seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouchdb_adapter_memory::MemoryAdapter;
    use rouchdb_core::document::Document;

    async fn put(adapter: &dyn Adapter, id: &str, rev: Option<&str>, body: serde_json::Value) -> String {
        let doc = Document {
            id: id.to_string(),
            rev: rev.map(|r| r.parse().unwrap()),
            deleted: false,
            data: body,
            revisions: None,
        };
        let results = adapter.write(vec![doc], BulkDocsOptions::new()).await;
        assert!(results[0].ok, "{:?}", results[0].reason);
        results[0].rev.clone().unwrap()
    }

    #[tokio::test]
    async fn replicates_all_documents_to_empty_target() {
        let source = Arc::new(MemoryAdapter::new("source"));
        let target: Arc<dyn Adapter> = Arc::new(MemoryAdapter::new("target"));

        put(source.as_ref(), "a", None, serde_json::json!({"v": 1})).await;
        put(source.as_ref(), "b", None, serde_json::json!({"v": 2})).await;

        let result = replicate(
            source.clone(),
            target.clone(),
            ReplicationOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.ok);
        assert_eq!(result.history[0].docs_written, 2);

        let read = target
            .read(vec![ReadRequest {
                id: "a".into(),
                opts: GetOptions::default(),
            }])
            .await;
        assert_eq!(read[0].as_ref().unwrap()[0].data["v"], 1);
    }

    #[tokio::test]
    async fn second_replication_is_idempotent() {
        let source = Arc::new(MemoryAdapter::new("source"));
        let target: Arc<dyn Adapter> = Arc::new(MemoryAdapter::new("target"));

        for i in 0..10 {
            put(source.as_ref(), &format!("doc{i}"), None, serde_json::json!({"i": i})).await;
        }

        replicate(
            source.clone(),
            target.clone(),
            ReplicationOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let target_seq_before = target.update_seq().await.unwrap();

        let second = replicate(
            source.clone(),
            target.clone(),
            ReplicationOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(second.history[0].docs_written, 0);
        assert_eq!(target.update_seq().await.unwrap(), target_seq_before);
    }

    #[tokio::test]
    async fn missing_target_without_create_fails() {
        struct NeverThere;

        #[async_trait::async_trait]
        impl Adapter for NeverThere {
            async fn id(&self) -> Result<String> {
                Ok("never-there".into())
            }
            async fn update_seq(&self) -> Result<Seq> {
                Err(RouchError::NotFound("no database".into()))
            }
            async fn revs_limit(&self) -> Result<u64> {
                Ok(1000)
            }
            async fn set_revs_limit(&self, _limit: u64) -> Result<()> {
                Ok(())
            }
            async fn changes(&self, _opts: ChangesOptions) -> Result<rouchdb_core::document::ChangesResponse> {
                unreachable!()
            }
            async fn revs_diff(
                &self,
                _requests: Vec<RevsDiffRequest>,
            ) -> Result<Vec<rouchdb_core::adapter::RevsDiffEntry>> {
                unreachable!()
            }
            async fn read(&self, _requests: Vec<ReadRequest>) -> Vec<Result<Vec<Document>>> {
                unreachable!()
            }
            async fn write(&self, _docs: Vec<Document>, _opts: BulkDocsOptions) -> Vec<rouchdb_core::document::DocResult> {
                unreachable!()
            }
            async fn conflicts(&self, _id: &str) -> Result<Vec<String>> {
                unreachable!()
            }
        }

        let source = Arc::new(MemoryAdapter::new("source"));
        let target: Arc<dyn Adapter> = Arc::new(NeverThere);

        let err = replicate(
            source,
            target,
            ReplicationOptions { create_target: false, continuous: false },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RouchError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn replication_id_is_stable_for_same_inputs() {
        let a = replication_id("src", "tgt", false, false);
        let b = replication_id("src", "tgt", false, false);
        assert_eq!(a, b);
        let c = replication_id("src", "tgt", true, false);
        assert_ne!(a, c);
    }

    /// A target wrapper that lets a test pin down the exact point in a
    /// multi-document stream at which cancellation takes effect: after
    /// forwarding its `cancel_after`-th write, it hands a buffered
    /// permit to a waiting task and yields, so that task's `cancel.cancel()`
    /// is guaranteed to run before `replicate`'s next per-change iteration
    /// re-checks `cancel.is_cancelled()`.
    struct CancelAfterWrites {
        inner: Arc<dyn Adapter>,
        calls: std::sync::atomic::AtomicU64,
        cancel_after: u64,
        notify: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl Adapter for CancelAfterWrites {
        async fn id(&self) -> Result<String> {
            self.inner.id().await
        }
        async fn update_seq(&self) -> Result<Seq> {
            self.inner.update_seq().await
        }
        async fn revs_limit(&self) -> Result<u64> {
            self.inner.revs_limit().await
        }
        async fn set_revs_limit(&self, limit: u64) -> Result<()> {
            self.inner.set_revs_limit(limit).await
        }
        async fn create(&self) -> Result<()> {
            self.inner.create().await
        }
        async fn ensure_full_commit(&self) -> Result<()> {
            self.inner.ensure_full_commit().await
        }
        async fn changes(&self, opts: ChangesOptions) -> Result<rouchdb_core::document::ChangesResponse> {
            self.inner.changes(opts).await
        }
        async fn revs_diff(
            &self,
            requests: Vec<RevsDiffRequest>,
        ) -> Result<Vec<rouchdb_core::adapter::RevsDiffEntry>> {
            self.inner.revs_diff(requests).await
        }
        async fn read(&self, requests: Vec<ReadRequest>) -> Vec<Result<Vec<Document>>> {
            self.inner.read(requests).await
        }
        async fn write(
            &self,
            docs: Vec<Document>,
            opts: BulkDocsOptions,
        ) -> Vec<rouchdb_core::document::DocResult> {
            let results = self.inner.write(docs, opts).await;
            let call_idx = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call_idx == self.cancel_after {
                self.notify.notify_one();
                tokio::task::yield_now().await;
            }
            results
        }
        async fn conflicts(&self, id: &str) -> Result<Vec<String>> {
            self.inner.conflicts(id).await
        }
    }

    #[tokio::test]
    async fn cancellation_midstream_then_resume_completes_without_reprocessing() {
        use std::sync::atomic::AtomicU64;

        let source = Arc::new(MemoryAdapter::new("source"));
        for i in 0..20 {
            put(source.as_ref(), &format!("doc{i}"), None, serde_json::json!({"i": i})).await;
        }

        let real_target = Arc::new(MemoryAdapter::new("target"));
        let notify = Arc::new(tokio::sync::Notify::new());
        let target: Arc<dyn Adapter> = Arc::new(CancelAfterWrites {
            inner: real_target.clone(),
            calls: AtomicU64::new(0),
            cancel_after: 5,
            notify: notify.clone(),
        });

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let waiter = tokio::spawn(async move {
            notify.notified().await;
            cancel_clone.cancel();
        });

        let first = replicate(source.clone(), target.clone(), ReplicationOptions::default(), cancel)
            .await
            .unwrap();
        waiter.await.unwrap();

        let first_written = first.history[0].docs_written;
        assert_eq!(first_written, 5, "cancellation should land right after the 5th write");
        assert_eq!(
            first.source_last_seq,
            Seq::zero(),
            "no checkpoint is recorded when replication is cancelled mid-stream"
        );

        // No checkpoint was persisted, so this run resumes from seq 0 again;
        // `revs_diff` against the target (not a checkpoint) is what keeps it
        // from rewriting the documents the first run already committed.
        let second = replicate(
            source.clone(),
            target.clone(),
            ReplicationOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(first_written + second.history[0].docs_written, 20);
        assert_eq!(real_target.update_seq().await.unwrap().0, 20);
    }
}
