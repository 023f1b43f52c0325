//! The revision tree: a per-document set of branches.
//!
//! Each branch is one leaf of a document's history plus its known ancestor
//! chain, stored as a flat `(leaf_gen, path)` pair rather than as a shared
//! nested tree of nodes. Branches are kept sorted ascending by
//! `(leaf_gen, path[0])`; that ordering is the whole of the winner rule and
//! the insertion point for new branches.
use serde_json::Value;

use crate::document::Revision;

/// One leaf of a document's revision history, plus its ancestor chain.
///
/// `path` is leaf-first: `path[0]` is the leaf token, `path[i]` has
/// generation `leaf_gen - i`. `leaf_body` is `None` for a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub leaf_gen: u64,
    pub path: Vec<String>,
    pub leaf_body: Option<Value>,
}

impl Branch {
    pub fn new(leaf_gen: u64, path: Vec<String>, leaf_body: Option<Value>) -> Self {
        debug_assert!(leaf_gen >= 1, "generation must be >= 1");
        debug_assert!(!path.is_empty(), "path must be nonempty");
        debug_assert!(leaf_gen >= path.len() as u64, "leaf_gen must cover path");
        Self {
            leaf_gen,
            path,
            leaf_body,
        }
    }

    pub fn leaf_token(&self) -> &str {
        &self.path[0]
    }

    pub fn is_tombstone(&self) -> bool {
        self.leaf_body.is_none()
    }

    pub fn leaf_revision(&self) -> Revision {
        Revision::new(self.leaf_gen, self.path[0].clone())
    }

    /// Sort/winner key: `(leaf_gen, path[0])`.
    fn sort_key(&self) -> (u64, &str) {
        (self.leaf_gen, self.path[0].as_str())
    }

    /// Does this branch's path contain `token` at generation `gen`?
    pub fn contains(&self, gen: u64, token: &str) -> bool {
        if gen == 0 || gen > self.leaf_gen {
            return false;
        }
        let idx = (self.leaf_gen - gen) as usize;
        idx < self.path.len() && self.path[idx] == token
    }

    /// Every `(Revision)` reachable along this branch, leaf-first.
    pub fn revisions(&self) -> impl Iterator<Item = Revision> + '_ {
        self.path
            .iter()
            .enumerate()
            .map(move |(i, token)| Revision::new(self.leaf_gen - i as u64, token.clone()))
    }

    fn truncate(mut self, revs_limit: u64) -> Self {
        if self.path.len() as u64 > revs_limit {
            self.path.truncate(revs_limit as usize);
        }
        self
    }
}

/// The set of all known branches for one document.
///
/// Kept sorted ascending by `(leaf_gen, path[0])`. The empty tree is only a
/// legal transient state before the first `merge`.
#[derive(Debug, Clone, Default)]
pub struct RevisionTree {
    branches: Vec<Branch>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Branches in ascending `(leaf_gen, path[0])` order (the tree's native
    /// storage order).
    pub fn branches_ascending(&self) -> &[Branch] {
        &self.branches
    }

    /// Branches in descending `(leaf_gen, path[0])` order.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter().rev()
    }

    fn insert_sorted(&mut self, branch: Branch) {
        let key = branch.sort_key();
        let pos = self
            .branches
            .partition_point(|b| b.sort_key() < key);
        self.branches.insert(pos, branch);
    }

    /// Insert a revision path supplied by a peer or a local write.
    ///
    /// `gen` and `path` describe the incoming leaf; `path` is leaf-first and
    /// must be nonempty. See module docs and the spec for the four cases.
    pub fn merge(&mut self, gen: u64, path: Vec<String>, body: Option<Value>, revs_limit: u64) {
        assert!(gen >= 1, "merge: generation must be >= 1");
        assert!(!path.is_empty(), "merge: path must be nonempty");

        // Case 1: already known. Wins over case 2 even when both could
        // match, which is what makes merge idempotent.
        for b in &self.branches {
            if gen <= b.leaf_gen {
                let j = (b.leaf_gen - gen) as usize;
                if j < b.path.len() && b.path[j] == path[0] {
                    return;
                }
            }
        }

        // Case 2: branch extension. Replace the matching branch with one
        // whose path is the new prefix spliced onto the old path.
        for i in 0..self.branches.len() {
            let existing_leaf_gen = self.branches[i].leaf_gen;
            if gen < existing_leaf_gen {
                continue;
            }
            let k = (gen - existing_leaf_gen) as usize;
            if k < path.len() && path[k] == self.branches[i].path[0] {
                let old = self.branches.remove(i);
                let mut new_path = path[0..k].to_vec();
                new_path.extend(old.path);
                let branch = Branch::new(gen, new_path, body).truncate(revs_limit);
                self.insert_sorted(branch);
                return;
            }
        }

        // Case 3: merge with shared ancestry. Iterate existing branches in
        // descending order and take the first that shares a common
        // (generation, token) point with the incoming path.
        for b in self.branches.iter().rev() {
            let b_start_gen = b.leaf_gen + 1 - b.path.len() as u64;
            let new_start_gen = gen + 1 - path.len() as u64;
            let common_gen = b_start_gen.max(new_start_gen);
            if common_gen > b.leaf_gen || common_gen > gen {
                continue;
            }
            let b_idx = (b.leaf_gen - common_gen) as usize;
            let new_idx = (gen - common_gen) as usize;
            if b_idx >= b.path.len() || new_idx >= path.len() {
                continue;
            }
            if b.path[b_idx] != path[new_idx] {
                continue;
            }
            let tail_start = (gen - common_gen) as usize;
            let mut spliced = path[0..tail_start].to_vec();
            let graft_start = (b.leaf_gen - common_gen) as usize;
            spliced.extend(b.path[graft_start..].iter().cloned());
            let branch = Branch::new(gen, spliced, body).truncate(revs_limit);
            self.insert_sorted(branch);
            return;
        }

        // Case 4: unrelated new branch.
        let branch = Branch::new(gen, path, body).truncate(revs_limit);
        self.insert_sorted(branch);
    }

    /// Index into `branches_ascending()` of the winning branch.
    ///
    /// The branch with the greatest `(leaf_gen, path[0])` whose body is
    /// present wins; if every branch is a tombstone, the greatest overall
    /// wins. Undefined (panics) on an empty tree.
    pub fn winner_index(&self) -> usize {
        assert!(!self.is_empty(), "winner_index on empty tree");
        self.branches
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| !b.is_tombstone())
            .map(|(i, _)| i)
            .unwrap_or(self.branches.len() - 1)
    }

    /// The winning branch itself.
    pub fn winner(&self) -> &Branch {
        &self.branches[self.winner_index()]
    }

    /// Every branch whose path contains `token` at generation `gen`.
    pub fn find(&self, gen: u64, token: &str) -> impl Iterator<Item = &Branch> {
        self.branches().filter(move |b| b.contains(gen, token))
    }

    /// Every `(Revision, branch)` pair reachable in the tree, leaf-first per
    /// branch, highest-leaf branch first. Used by revision-diff.
    pub fn all_revisions(&self) -> impl Iterator<Item = Revision> + '_ {
        self.branches().flat_map(|b| b.revisions())
    }

    /// The subset of `revs` that do not appear anywhere in this tree.
    pub fn revs_diff(&self, revs: &[Revision]) -> Vec<Revision> {
        revs.iter()
            .filter(|r| self.find(r.pos, &r.hash).next().is_none())
            .cloned()
            .collect()
    }
}
