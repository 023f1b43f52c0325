//! RouchDB: a local-first document database speaking the CouchDB
//! replication protocol.
//!
//! `Database` is a thin, ergonomic facade over the lower-level crates in
//! this workspace (`rouchdb-core`, `rouchdb-adapter-memory`,
//! `rouchdb-changes`, `rouchdb-replication`). It only ever talks to the
//! in-memory backend; a remote/HTTP-speaking `Database` is a natural
//! extension of this same facade but is not built here.
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use rouchdb_adapter_memory::MemoryAdapter;
pub use rouchdb_core::adapter::Adapter;
pub use rouchdb_core::document::{
    BulkDocsOptions, ChangeEvent, DbInfo, DocResult, Document, GetOptions, ReadRevs, Seq,
};
use rouchdb_core::adapter::ReadRequest;
use rouchdb_core::document::ChangesOptions;
pub use rouchdb_core::error::{Result, RouchError};
pub use rouchdb_changes::{ChangesHandle, ChangesStreamOptions};
pub use rouchdb_replication::{ReplicationOptions, ReplicationResult};

/// A local-first, replicating document database.
#[derive(Clone)]
pub struct Database {
    adapter: Arc<MemoryAdapter>,
}

impl Database {
    /// Open an in-memory database identified by `id`. Two `Database`
    /// handles constructed with different ids never share state; clone an
    /// existing handle to share one.
    pub fn memory(id: impl Into<String>) -> Self {
        Self {
            adapter: Arc::new(MemoryAdapter::new(id)),
        }
    }

    fn as_dyn(&self) -> Arc<dyn Adapter> {
        self.adapter.clone()
    }

    /// Insert a new document under `id`. Fails with `Conflict` if `id`
    /// already exists.
    pub async fn put(&self, id: &str, body: Value) -> Result<DocResult> {
        self.write_one(id, None, body, false).await
    }

    /// Update the document at `id`, asserting it is currently at `rev`.
    /// Fails with `Conflict` if `rev` is stale.
    pub async fn update(&self, id: &str, rev: &str, body: Value) -> Result<DocResult> {
        self.write_one(id, Some(rev), body, false).await
    }

    /// Delete the document at `id`, asserting it is currently at `rev`.
    /// Leaves a tombstone behind rather than erasing history.
    pub async fn remove(&self, id: &str, rev: &str) -> Result<DocResult> {
        self.write_one(id, Some(rev), Value::Object(Default::default()), true)
            .await
    }

    async fn write_one(
        &self,
        id: &str,
        rev: Option<&str>,
        body: Value,
        deleted: bool,
    ) -> Result<DocResult> {
        let mut obj = match body {
            Value::Object(m) => m,
            _ => serde_json::Map::new(),
        };
        obj.insert("_id".into(), Value::String(id.to_string()));
        if let Some(rev) = rev {
            obj.insert("_rev".into(), Value::String(rev.to_string()));
        }
        if deleted {
            obj.insert("_deleted".into(), Value::Bool(true));
        }

        let doc = Document::from_json(Value::Object(obj))?;
        let mut results = self
            .adapter
            .write(vec![doc], BulkDocsOptions::new())
            .await;
        let result = results.remove(0);
        if result.ok {
            Ok(result)
        } else {
            Err(doc_result_error(&result))
        }
    }

    /// Fetch the winning revision of `id`.
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.get_with_opts(id, GetOptions::default()).await
    }

    /// Fetch `id` with finer control: a specific branch selection, the
    /// `_revisions` ancestry block, or a `_conflicts` list embedded in the
    /// returned body.
    pub async fn get_with_opts(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let conflicts_requested = opts.conflicts;
        let mut results = self
            .adapter
            .read(vec![ReadRequest {
                id: id.to_string(),
                opts,
            }])
            .await;
        let mut docs = results.remove(0)?;
        let mut doc = docs.remove(0);

        if conflicts_requested {
            let conflicts = self.adapter.conflicts(id).await?;
            if !conflicts.is_empty() {
                if let Value::Object(map) = &mut doc.data {
                    map.insert(
                        "_conflicts".into(),
                        Value::Array(conflicts.into_iter().map(Value::String).collect()),
                    );
                }
            }
        }

        Ok(doc)
    }

    /// Every non-winning, non-tombstone revision of `id`.
    pub async fn conflicts(&self, id: &str) -> Result<Vec<String>> {
        self.adapter.conflicts(id).await
    }

    /// Summary statistics: database id, document count, current sequence.
    pub async fn info(&self) -> Result<DbInfo> {
        let id = self.adapter.id().await?;
        let update_seq = self.adapter.update_seq().await?;
        let changes = self
            .adapter
            .changes(ChangesOptions::default())
            .await?;
        Ok(DbInfo {
            db_name: id,
            doc_count: changes.results.len() as u64,
            update_seq,
        })
    }

    /// One-shot changes feed.
    pub async fn changes(&self, opts: ChangesStreamOptions) -> Result<Vec<ChangeEvent>> {
        rouchdb_changes::get_changes(self.adapter.as_ref(), opts).await
    }

    /// A live changes feed that wakes immediately on writes (rather than
    /// only on the stream's poll interval), backed by this database's
    /// own write-notification channel.
    pub fn live_changes(
        &self,
        opts: ChangesStreamOptions,
    ) -> (tokio::sync::mpsc::Receiver<ChangeEvent>, ChangesHandle) {
        rouchdb_changes::live_changes(self.as_dyn(), Some(self.adapter.subscribe()), opts)
    }

    /// Replicate every change this database knows about into `target`.
    pub async fn replicate_to(&self, target: &Database) -> Result<ReplicationResult> {
        rouchdb_replication::replicate(
            self.as_dyn(),
            target.as_dyn(),
            ReplicationOptions::default(),
            CancellationToken::new(),
        )
        .await
    }

    /// Replicate every change `source` knows about into this database.
    pub async fn replicate_from(&self, source: &Database) -> Result<ReplicationResult> {
        source.replicate_to(self).await
    }

    /// Replicate in both directions: this database to `other`, then
    /// `other` to this database. Returns `(push, pull)` stats.
    pub async fn sync(&self, other: &Database) -> Result<(ReplicationResult, ReplicationResult)> {
        let push = self.replicate_to(other).await?;
        let pull = self.replicate_from(other).await?;
        Ok((push, pull))
    }
}

/// Reconstruct a `RouchError` from a failed `DocResult`'s wire-form kind
/// name, so single-document facade calls can propagate a typed error
/// instead of a boolean `ok: false`.
fn doc_result_error(result: &DocResult) -> RouchError {
    let reason = result.reason.clone().unwrap_or_default();
    match result.error.as_deref() {
        Some("conflict") => RouchError::Conflict,
        Some("missing_id") => RouchError::MissingId,
        Some("not_found") => RouchError::NotFound(reason),
        Some("invalid_rev") => RouchError::InvalidRev(reason),
        _ => RouchError::BadRequest(reason),
    }
}
