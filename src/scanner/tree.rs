//! Snapshot scanning of a commit's full tree

use crate::git::{GitCapability, GitResult};
use crate::sniff::{Sniffer, Violation};
use std::path::Path;

/// Blobs above this size are not sniffed
pub const MAX_BLOB_BYTES: usize = 5 * 1024 * 1024;

/// Same heuristic as git: a NUL in the first 8000 bytes means binary
fn is_binary(content: &[u8]) -> bool {
    content.iter().take(8000).any(|&b| b == 0)
}

/// Sniff every line of one file
pub fn sniff_blob(sniffer: &dyn Sniffer, path: &str, content: &[u8]) -> Vec<Violation> {
    if content.len() > MAX_BLOB_BYTES || is_binary(content) {
        return Vec::new();
    }
    content
        .split(|&b| b == b'\n')
        .enumerate()
        .flat_map(|(index, line)| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            sniffer.sniff(path, index as u32 + 1, line)
        })
        .collect()
}

/// Sniff every text blob in the tree of `sha`
pub async fn sniff_tree(
    git: &dyn GitCapability,
    sniffer: &dyn Sniffer,
    repo_path: &Path,
    sha: &str,
) -> GitResult<Vec<Violation>> {
    Ok(git
        .tree_blobs(repo_path, sha, MAX_BLOB_BYTES)
        .await?
        .iter()
        .flat_map(|blob| sniff_blob(sniffer, &blob.path, &blob.content))
        .collect())
}
