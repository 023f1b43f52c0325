use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouchError};

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// A revision identifier: `{pos}-{hash}`.
///
/// - `pos` is the generation number (starts at 1, increments each edit).
/// - `hash` is an opaque token, unique within one document's history.
///   RouchDB does not hash revision content (see Non-goals); the token is
///   generated fresh by the store on every new-edits write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub pos: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(pos: u64, hash: String) -> Self {
        Self { pos, hash }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RouchError;

    fn from_str(s: &str) -> Result<Self> {
        let (pos_str, hash) = s
            .split_once('-')
            .ok_or_else(|| RouchError::InvalidRev(s.to_string()))?;
        let pos: u64 = pos_str
            .parse()
            .map_err(|_| RouchError::InvalidRev(s.to_string()))?;
        if pos == 0 || hash.is_empty() {
            return Err(RouchError::InvalidRev(s.to_string()));
        }
        Ok(Revision {
            pos,
            hash: hash.to_string(),
        })
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.pos
            .cmp(&other.pos)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// RevisionsInfo — the `_revisions` block on the wire
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionsInfo {
    pub start: u64,
    pub ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A document: its id, current revision, and JSON body.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub rev: Option<Revision>,
    pub deleted: bool,
    pub data: serde_json::Value,
    /// Full ancestry for this revision, present only when the write supplied
    /// one explicitly (e.g. a replicated document) or a read requested it.
    pub revisions: Option<RevisionsInfo>,
}

impl Document {
    /// Create a new document from a JSON value.
    ///
    /// Extracts `_id`, `_rev`, `_deleted`, and `_revisions` from the value
    /// and puts the remaining fields in `data`.
    pub fn from_json(mut value: serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| RouchError::BadRequest("document must be a JSON object".into()))?;

        let id = obj
            .remove("_id")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();

        let rev = obj
            .remove("_rev")
            .and_then(|v| v.as_str().map(String::from))
            .map(|s| s.parse::<Revision>())
            .transpose()?;

        let deleted = obj
            .remove("_deleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let revisions: Option<RevisionsInfo> = obj
            .remove("_revisions")
            .map(serde_json::from_value)
            .transpose()?;

        Ok(Document {
            id,
            rev,
            deleted,
            data: value,
            revisions,
        })
    }

    /// Convert back to a JSON value with the reserved underscore fields.
    pub fn to_json(&self, include_revisions: bool) -> serde_json::Value {
        let mut obj = match &self.data {
            serde_json::Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };

        obj.insert("_id".into(), serde_json::Value::String(self.id.clone()));

        if let Some(rev) = &self.rev {
            obj.insert("_rev".into(), serde_json::Value::String(rev.to_string()));
        }

        if self.deleted {
            obj.insert("_deleted".into(), serde_json::Value::Bool(true));
        }

        if include_revisions {
            if let Some(revisions) = &self.revisions {
                obj.insert("_revisions".into(), serde_json::to_value(revisions).unwrap());
            }
        }

        serde_json::Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// Option / response types shared across the crate
// ---------------------------------------------------------------------------

/// Which branch(es) a `read` should return.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadRevs {
    /// Just the winning branch.
    Winner,
    /// Every leaf, including tombstones.
    All,
    /// Every branch containing any of these revision strings.
    Specific(Vec<String>),
}

impl Default for ReadRevs {
    fn default() -> Self {
        ReadRevs::Winner
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub revs: ReadRevs,
    /// Include conflicting (non-winning, non-tombstone) revisions in `_conflicts`.
    pub conflicts: bool,
    /// Reconstruct the `_revisions` ancestry block on each returned document.
    pub include_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    pub ok: bool,
    pub id: String,
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

impl DocResult {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            ok: true,
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: &RouchError) -> Self {
        Self {
            ok: false,
            id: id.into(),
            rev: None,
            error: Some(error.kind_name().into()),
            reason: Some(error.to_string()),
        }
    }
}

/// Controls whether `write` treats incoming `_rev`/`_revisions` as
/// authoritative (replication) or generates a fresh revision and checks for
/// conflicts (ordinary client writes).
#[derive(Debug, Clone, Copy)]
pub struct BulkDocsOptions {
    /// When false (replication), accept revisions as-is via `merge`.
    /// When true (default), generate new revisions and check conflicts.
    pub new_edits: bool,
}

impl BulkDocsOptions {
    pub fn new() -> Self {
        Self { new_edits: true }
    }

    pub fn replication() -> Self {
        Self { new_edits: false }
    }
}

impl Default for BulkDocsOptions {
    /// Agrees with `new()`: the default is ordinary-client-write semantics,
    /// not replication semantics.
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: Seq,
}

// ---------------------------------------------------------------------------
// Changes types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub since: Seq,
    pub limit: Option<u64>,
    pub include_docs: bool,
    pub doc_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: Seq,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEvent>,
    pub last_seq: Seq,
}

// ---------------------------------------------------------------------------
// Sequence type
// ---------------------------------------------------------------------------

/// A database sequence identifier. This store always uses numeric
/// sequences; the type stays an enum so remote backends exposing opaque
/// string sequences (out of scope here) are representable without a
/// breaking change to the `Adapter` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl Seq {
    pub fn zero() -> Self {
        Seq(0)
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::zero()
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq(n)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::new(3, "abc123".into());
        assert_eq!(rev.to_string(), "3-abc123");

        let parsed: Revision = "3-abc123".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn revision_ordering() {
        let r1 = Revision::new(1, "aaa".into());
        let r2 = Revision::new(2, "aaa".into());
        let r3 = Revision::new(2, "bbb".into());
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[test]
    fn invalid_revision() {
        assert!("nope".parse::<Revision>().is_err());
        assert!("abc-123".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
    }

    #[test]
    fn document_from_json_roundtrip() {
        let json = serde_json::json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "name": "Alice",
            "age": 30
        });

        let doc = Document::from_json(json).unwrap();
        assert_eq!(doc.id, "doc1");
        assert_eq!(doc.rev.as_ref().unwrap().to_string(), "1-abc");
        assert_eq!(doc.data["name"], "Alice");
        assert!(!doc.data.as_object().unwrap().contains_key("_id"));

        let back = doc.to_json(false);
        assert_eq!(back["_id"], "doc1");
        assert_eq!(back["_rev"], "1-abc");
        assert_eq!(back["name"], "Alice");
    }

    #[test]
    fn document_from_json_minimal() {
        let json = serde_json::json!({"hello": "world"});
        let doc = Document::from_json(json).unwrap();
        assert!(doc.id.is_empty());
        assert!(doc.rev.is_none());
        assert!(!doc.deleted);
    }

    #[test]
    fn bulk_docs_options_defaults() {
        let opts = BulkDocsOptions::new();
        assert!(opts.new_edits);

        let repl = BulkDocsOptions::replication();
        assert!(!repl.new_edits);
    }
}
