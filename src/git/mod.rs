//! Git Capability
//!
//! Clone, fetch, diff and hard-reset on-disk clones, plus read-only lookups
//! of branch tips, commit parents, tree listings and blobs.
//!
//! Components depend on the [`GitCapability`] trait; [`LocalGit`] is the
//! implementation backed by the `git` binary and `gix`.

pub mod error;
pub mod local;
pub mod patch;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{GitError, GitResult};
pub use local::LocalGit;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Object id used for the missing side of a created or deleted ref
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Id of the empty tree, the diff base for root commits
pub const EMPTY_TREE_OID: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Movement of one ref during a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
}

impl RefUpdate {
    pub fn is_created(&self) -> bool {
        self.old == ZERO_OID
    }

    pub fn is_deleted(&self) -> bool {
        self.new == ZERO_OID
    }
}

/// Refs moved by a fetch, keyed by upstream ref name (`refs/heads/main`)
pub type RefChanges = BTreeMap<String, RefUpdate>;

/// Branch name for an upstream ref name
pub fn branch_name(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

/// A blob reachable from a tree, with its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlob {
    pub path: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait GitCapability: Send + Sync {
    /// Clone `url` into `dest`, which must not exist
    async fn clone_repo(&self, url: &str, dest: &Path) -> GitResult<()>;

    /// Fetch from origin and report which upstream refs moved
    async fn fetch(&self, repo: &Path) -> GitResult<RefChanges>;

    async fn hard_reset(&self, repo: &Path, oid: &str) -> GitResult<()>;

    /// Unified diff between two commits with no context lines. `None` diffs
    /// against the empty tree.
    async fn diff(&self, repo: &Path, from: Option<&str>, to: &str) -> GitResult<Vec<u8>>;

    /// Upstream branch name to tip commit
    async fn branch_tips(&self, repo: &Path) -> GitResult<BTreeMap<String, String>>;

    async fn parents(&self, repo: &Path, sha: &str) -> GitResult<Vec<String>>;

    /// Every blob in the tree of `sha` no larger than `max_bytes`, read in
    /// one pass over the object database
    async fn tree_blobs(&self, repo: &Path, sha: &str, max_bytes: usize)
        -> GitResult<Vec<TreeBlob>>;
}
