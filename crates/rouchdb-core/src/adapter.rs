//! The backend contract every RouchDB store implements.
//!
//! An in-memory store, a remote CouchDB-speaking store, or a test double
//! all implement the same six operations. The replicator (and the facade
//! `Database` type) is written entirely against this trait and never knows
//! which backend it is driving.
use async_trait::async_trait;

use crate::document::{
    BulkDocsOptions, ChangesOptions, ChangesResponse, DocResult, Document, GetOptions, Seq,
};
use crate::error::Result;

/// One `revs_diff` query: does the peer already have any of these revisions
/// of this document?
#[derive(Debug, Clone)]
pub struct RevsDiffRequest {
    pub id: String,
    pub revs: Vec<String>,
}

/// The subset of a `RevsDiffRequest`'s revisions the peer does not have.
#[derive(Debug, Clone)]
pub struct RevsDiffEntry {
    pub id: String,
    pub missing: Vec<String>,
}

/// One `read` query: fetch `id`, restricted to the branches `opts.revs`
/// selects.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub id: String,
    pub opts: GetOptions,
}

/// Every backend exposes exactly these operations. Bulk methods take and
/// return owned `Vec`s rather than a generic `Stream` associated type —
/// `async-trait` objects cannot return a borrowed/unboxed `impl Stream`,
/// and it mirrors how the original CouchDB-style bulk endpoints
/// (`_bulk_docs`, `_all_docs`) are already shaped. Laziness and
/// back-pressure are realized one layer up, in the replicator, which
/// drives the pipeline one change at a time instead of materializing an
/// entire feed.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// A stable identity string for this backend instance.
    async fn id(&self) -> Result<String>;

    /// The current update sequence. `NotFound` if the backend has no
    /// database yet (see `create`).
    async fn update_seq(&self) -> Result<Seq>;

    /// The number of old revisions retained per document (always >= 1).
    async fn revs_limit(&self) -> Result<u64>;

    /// Change the retained-revision count. Implementations reject 0.
    async fn set_revs_limit(&self, limit: u64) -> Result<()>;

    /// Create the underlying database if the backend supports on-demand
    /// creation. A no-op for backends that always exist.
    async fn create(&self) -> Result<()> {
        Ok(())
    }

    /// A durability barrier: when this returns, every write accepted so
    /// far is guaranteed durable. A no-op for volatile backends.
    async fn ensure_full_commit(&self) -> Result<()> {
        Ok(())
    }

    /// Change entries with sequence strictly greater than `opts.since`, in
    /// ascending sequence order.
    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse>;

    /// For each request, the subset of its revisions not present anywhere
    /// in that document's revision tree. An absent document reports all
    /// revisions missing.
    async fn revs_diff(&self, requests: Vec<RevsDiffRequest>) -> Result<Vec<RevsDiffEntry>>;

    /// For each request, every document matching its `GetOptions.revs`
    /// selection, in input order. A request for an unknown id yields a
    /// single `NotFound` error at that index.
    async fn read(&self, requests: Vec<ReadRequest>) -> Vec<Result<Vec<Document>>>;

    /// Apply a batch of writes. Returns one result per input document, in
    /// order, reporting success or the specific failure (conflict,
    /// invalid revision, etc).
    async fn write(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Vec<DocResult>;

    /// String-form revisions of every non-winning, non-tombstone leaf —
    /// an ambient convenience built on top of the revision tree so
    /// conflicts are observable without re-deriving them from `read`.
    async fn conflicts(&self, id: &str) -> Result<Vec<String>>;
}
