//! An in-memory [`Adapter`] implementation.
//!
//! All state lives behind a single `std::sync::Mutex` (§5: the store's
//! mutations are synchronous and never suspend, so holding the lock across
//! an `.await` point never happens and the lock is never contended for
//! long). Every async method here does its work inside one short critical
//! section and returns.
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use rouchdb_core::adapter::{Adapter, ReadRequest, RevsDiffEntry, RevsDiffRequest};
use rouchdb_core::document::{
    BulkDocsOptions, ChangeEvent, ChangeRev, ChangesOptions, ChangesResponse, DocResult, Document,
    GetOptions, ReadRevs, Revision, RevisionsInfo, Seq,
};
use rouchdb_core::error::{Result, RouchError};
use rouchdb_core::notify::{ChangeReceiver, ChangeSender};
use rouchdb_core::rev_tree::RevisionTree;

const LOCAL_PREFIX: &str = "_local/";

fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

struct DocRecord {
    tree: RevisionTree,
    winner_index: usize,
    seq: u64,
}

struct Inner {
    id: String,
    by_id: std::collections::HashMap<String, DocRecord>,
    by_seq: BTreeMap<u64, String>,
    locals: std::collections::HashMap<String, Value>,
    update_seq: u64,
    revs_limit: u64,
}

impl Inner {
    fn new(id: String) -> Self {
        Self {
            id,
            by_id: std::collections::HashMap::new(),
            by_seq: BTreeMap::new(),
            locals: std::collections::HashMap::new(),
            update_seq: 0,
            revs_limit: 1000,
        }
    }

    fn next_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn write_one(&mut self, doc: Document, opts: BulkDocsOptions) -> std::result::Result<String, RouchError> {
        if doc.id.is_empty() {
            return Err(RouchError::MissingId);
        }

        if is_local_id(&doc.id) {
            if doc.deleted {
                self.locals.remove(&doc.id);
            } else {
                self.locals.insert(doc.id.clone(), doc.data.clone());
            }
            return Ok("0-1".to_string());
        }

        let existing = self.by_id.get(&doc.id);
        let body = if doc.deleted { None } else { Some(doc.data.clone()) };

        let (gen, path) = if opts.new_edits {
            let winner = existing.map(|r| r.tree.winner());
            match (&doc.rev, winner) {
                (None, None) => {
                    (1u64, vec![Self::next_token()])
                }
                (None, Some(_)) => return Err(RouchError::Conflict),
                (Some(_), None) => return Err(RouchError::Conflict),
                (Some(rev), Some(w)) => {
                    if rev.pos != w.leaf_gen || rev.hash != w.leaf_token() {
                        return Err(RouchError::Conflict);
                    }
                    let token = Self::next_token();
                    let mut path = vec![token];
                    path.extend(w.path.iter().cloned());
                    (w.leaf_gen + 1, path)
                }
            }
        } else {
            let rev = doc
                .rev
                .clone()
                .ok_or_else(|| RouchError::InvalidRev("replicated write missing _rev".into()))?;
            let path = match &doc.revisions {
                Some(RevisionsInfo { start, ids }) => {
                    if *start != rev.pos || ids.first() != Some(&rev.hash) {
                        return Err(RouchError::InvalidRev(
                            "_revisions does not match _rev".into(),
                        ));
                    }
                    ids.clone()
                }
                None => vec![rev.hash.clone()],
            };
            (rev.pos, path)
        };

        let tree = &mut self
            .by_id
            .entry(doc.id.clone())
            .or_insert_with(|| DocRecord {
                tree: RevisionTree::new(),
                winner_index: 0,
                seq: 0,
            })
            .tree;
        tree.merge(gen, path.clone(), body, self.revs_limit);

        let record = self.by_id.get_mut(&doc.id).unwrap();
        record.winner_index = record.tree.winner_index();

        if record.seq != 0 {
            self.by_seq.remove(&record.seq);
        }
        self.update_seq += 1;
        let seq = self.update_seq;
        record.seq = seq;
        self.by_seq.insert(seq, doc.id.clone());

        Ok(Revision::new(gen, path[0].clone()).to_string())
    }

    fn read_local(&self, id: &str) -> Result<Document> {
        let data = self
            .locals
            .get(id)
            .cloned()
            .ok_or_else(|| RouchError::NotFound(id.to_string()))?;
        Ok(Document {
            id: id.to_string(),
            rev: Some(Revision::new(0, "1".into())),
            deleted: false,
            data,
            revisions: None,
        })
    }

    fn read_one(&self, req: &ReadRequest) -> Result<Vec<Document>> {
        if is_local_id(&req.id) {
            if req.opts.revs != ReadRevs::Winner {
                return Err(RouchError::BadRequest(
                    "local documents only support the winning revision".into(),
                ));
            }
            return Ok(vec![self.read_local(&req.id)?]);
        }

        let record = self
            .by_id
            .get(&req.id)
            .ok_or_else(|| RouchError::NotFound(req.id.clone()))?;

        let branches: Vec<_> = match &req.opts.revs {
            ReadRevs::Winner => vec![record.tree.winner()],
            ReadRevs::All => record.tree.branches().collect(),
            ReadRevs::Specific(revs) => {
                let wanted: Vec<Revision> = revs
                    .iter()
                    .map(|s| s.parse::<Revision>())
                    .collect::<Result<_>>()?;
                record
                    .tree
                    .branches()
                    .filter(|b| {
                        wanted
                            .iter()
                            .any(|r| b.leaf_gen == r.pos && b.leaf_token() == r.hash)
                    })
                    .collect()
            }
        };

        Ok(branches
            .into_iter()
            .map(|b| Document {
                id: req.id.clone(),
                rev: Some(b.leaf_revision()),
                deleted: b.is_tombstone(),
                data: b.leaf_body.clone().unwrap_or(Value::Object(Default::default())),
                revisions: if req.opts.include_path {
                    Some(RevisionsInfo {
                        start: b.leaf_gen,
                        ids: b.path.clone(),
                    })
                } else {
                    None
                },
            })
            .collect())
    }
}

/// An in-memory, single-database store.
///
/// Cheap to construct (`Store::new`), cheap to clone (wrap in `Arc` and
/// clone the `Arc`, as [`MemoryAdapter`] does).
pub struct Store {
    inner: Mutex<Inner>,
    changes: ChangeSender,
}

impl Store {
    pub fn new(id: impl Into<String>) -> Self {
        let (changes, _rx) = ChangeSender::new(256);
        Self {
            inner: Mutex::new(Inner::new(id.into())),
            changes,
        }
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        self.changes.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// The [`Adapter`] implementation backing an in-process, in-memory database.
#[derive(Clone)]
pub struct MemoryAdapter {
    store: std::sync::Arc<Store>,
}

impl MemoryAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            store: std::sync::Arc::new(Store::new(id)),
        }
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        self.store.subscribe()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self {
            store: std::sync::Arc::new(Store::default()),
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn id(&self) -> Result<String> {
        Ok(self.store.inner.lock().unwrap().id.clone())
    }

    async fn update_seq(&self) -> Result<Seq> {
        Ok(Seq(self.store.inner.lock().unwrap().update_seq))
    }

    async fn revs_limit(&self) -> Result<u64> {
        Ok(self.store.inner.lock().unwrap().revs_limit)
    }

    async fn set_revs_limit(&self, limit: u64) -> Result<()> {
        if limit < 1 {
            return Err(RouchError::BadRequest("revs_limit must be >= 1".into()));
        }
        self.store.inner.lock().unwrap().revs_limit = limit;
        Ok(())
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let inner = self.store.inner.lock().unwrap();
        let mut results = Vec::new();
        for (&seq, id) in inner.by_seq.range((opts.since.0 + 1)..) {
            if let Some(doc_ids) = &opts.doc_ids {
                if !doc_ids.contains(id) {
                    continue;
                }
            }
            let Some(record) = inner.by_id.get(id) else {
                continue;
            };
            let winner = &record.tree.branches_ascending()[record.winner_index];
            let doc = if opts.include_docs {
                Some(
                    Document {
                        id: id.clone(),
                        rev: Some(winner.leaf_revision()),
                        deleted: winner.is_tombstone(),
                        data: winner
                            .leaf_body
                            .clone()
                            .unwrap_or(Value::Object(Default::default())),
                        revisions: None,
                    }
                    .to_json(false),
                )
            } else {
                None
            };
            results.push(ChangeEvent {
                seq: Seq(seq),
                id: id.clone(),
                changes: vec![ChangeRev {
                    rev: winner.leaf_revision().to_string(),
                }],
                deleted: winner.is_tombstone(),
                doc,
            });
            if let Some(limit) = opts.limit {
                if results.len() as u64 >= limit {
                    break;
                }
            }
        }
        let last_seq = results.last().map(|c| c.seq).unwrap_or(opts.since);
        Ok(ChangesResponse { results, last_seq })
    }

    async fn revs_diff(&self, requests: Vec<RevsDiffRequest>) -> Result<Vec<RevsDiffEntry>> {
        let inner = self.store.inner.lock().unwrap();
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            let parsed: Vec<Revision> = req
                .revs
                .iter()
                .map(|s| s.parse::<Revision>())
                .collect::<Result<_>>()?;
            let missing = match inner.by_id.get(&req.id) {
                Some(record) => record.tree.revs_diff(&parsed),
                None => parsed,
            };
            out.push(RevsDiffEntry {
                id: req.id,
                missing: missing.into_iter().map(|r| r.to_string()).collect(),
            });
        }
        Ok(out)
    }

    async fn read(&self, requests: Vec<ReadRequest>) -> Vec<Result<Vec<Document>>> {
        let inner = self.store.inner.lock().unwrap();
        requests.iter().map(|req| inner.read_one(req)).collect()
    }

    async fn write(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Vec<DocResult> {
        let mut inner = self.store.inner.lock().unwrap();
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone();
            match inner.write_one(doc, opts) {
                Ok(rev) => {
                    trace!(%id, %rev, "document written");
                    results.push(DocResult::ok(id.clone(), rev));
                    if !is_local_id(&id) {
                        let seq = inner.by_id.get(&id).map(|r| r.seq).unwrap_or(0);
                        self.store.changes.notify(Seq(seq), id);
                    }
                }
                Err(e) => {
                    debug!(%id, error = %e, "write failed");
                    results.push(DocResult::failed(id, &e));
                }
            }
        }
        results
    }

    async fn conflicts(&self, id: &str) -> Result<Vec<String>> {
        let inner = self.store.inner.lock().unwrap();
        let record = inner
            .by_id
            .get(id)
            .ok_or_else(|| RouchError::NotFound(id.to_string()))?;
        let winner_rev = record.tree.winner().leaf_revision();
        Ok(record
            .tree
            .branches()
            .filter(|b| !b.is_tombstone() && b.leaf_revision() != winner_rev)
            .map(|b| b.leaf_revision().to_string())
            .collect())
    }
}
