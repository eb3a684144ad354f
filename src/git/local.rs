//! `git` binary + `gix` implementation of [`GitCapability`]
//!
//! Network and working-tree operations shell out to `git`. Object reads go
//! through `gix` on the blocking pool.

use super::error::{GitError, GitResult};
use super::{GitCapability, RefChanges, RefUpdate, TreeBlob, EMPTY_TREE_OID, ZERO_OID};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const REMOTE_PREFIX: &str = "refs/remotes/origin/";

/// Runs `git` from PATH
#[derive(Debug, Clone, Default)]
pub struct LocalGit;

impl LocalGit {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> GitResult<Vec<u8>> {
        let command_line = format!("git {}", args.join(" "));

        let mut command = Command::new("git");
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        log::trace!("Running {}", command_line);
        let output = command.output().await.map_err(|source| GitError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn blocking<T, F>(&self, repo: &Path, op: F) -> GitResult<T>
    where
        T: Send + 'static,
        F: FnOnce(gix::Repository, PathBuf) -> GitResult<T> + Send + 'static,
    {
        let path = repo.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let repository = gix::open(&path).map_err(|e| GitError::repository(&path, e))?;
            op(repository, path)
        })
        .await
        .map_err(|e| GitError::Task {
            message: format!("Failed to execute git operation: {}", e),
        })?
    }

    async fn remote_refs(&self, repo: &Path) -> GitResult<BTreeMap<String, String>> {
        self.blocking(repo, |repository, path| remote_refs(&repository, &path))
            .await
    }
}

fn parse_oid(oid: &str) -> GitResult<gix::ObjectId> {
    gix::ObjectId::from_hex(oid.as_bytes()).map_err(|_| GitError::InvalidObjectId {
        oid: oid.to_string(),
    })
}

/// Branch name under `origin` to tip commit, skipping the symbolic `HEAD`
fn remote_refs(repository: &gix::Repository, path: &Path) -> GitResult<BTreeMap<String, String>> {
    let platform = repository
        .references()
        .map_err(|e| GitError::repository(path, e))?;
    let iter = platform
        .remote_branches()
        .map_err(|e| GitError::repository(path, e))?;

    let mut tips = BTreeMap::new();
    for reference in iter {
        let mut reference = reference.map_err(|e| GitError::repository(path, e))?;
        let full_name = reference.name().as_bstr().to_string();
        let Some(branch) = full_name.strip_prefix(REMOTE_PREFIX) else {
            continue;
        };
        if branch == "HEAD" {
            continue;
        }
        let branch = branch.to_string();
        let id = reference
            .peel_to_id_in_place()
            .map_err(|e| GitError::repository(path, e))?;
        tips.insert(branch, id.to_string());
    }
    Ok(tips)
}

/// Compare remote tips before and after a fetch
pub(crate) fn ref_changes(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> RefChanges {
    let mut changes = RefChanges::new();
    for (branch, new) in after {
        match before.get(branch) {
            Some(old) if old == new => {}
            Some(old) => {
                changes.insert(
                    format!("refs/heads/{}", branch),
                    RefUpdate {
                        old: old.clone(),
                        new: new.clone(),
                    },
                );
            }
            None => {
                changes.insert(
                    format!("refs/heads/{}", branch),
                    RefUpdate {
                        old: ZERO_OID.to_string(),
                        new: new.clone(),
                    },
                );
            }
        }
    }
    for (branch, old) in before {
        if !after.contains_key(branch) {
            changes.insert(
                format!("refs/heads/{}", branch),
                RefUpdate {
                    old: old.clone(),
                    new: ZERO_OID.to_string(),
                },
            );
        }
    }
    changes
}

#[async_trait]
impl GitCapability for LocalGit {
    async fn clone_repo(&self, url: &str, dest: &Path) -> GitResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dest.to_string_lossy();
        self.run(None, &["clone", "--quiet", "--no-tags", url, dest.as_ref()])
            .await?;
        Ok(())
    }

    async fn fetch(&self, repo: &Path) -> GitResult<RefChanges> {
        let before = self.remote_refs(repo).await?;
        self.run(Some(repo), &["fetch", "--quiet", "--prune", "--no-tags", "origin"])
            .await?;
        let after = self.remote_refs(repo).await?;
        Ok(ref_changes(&before, &after))
    }

    async fn hard_reset(&self, repo: &Path, oid: &str) -> GitResult<()> {
        parse_oid(oid)?;
        self.run(Some(repo), &["reset", "--hard", "--quiet", oid]).await?;
        Ok(())
    }

    async fn diff(&self, repo: &Path, from: Option<&str>, to: &str) -> GitResult<Vec<u8>> {
        let from = from.unwrap_or(EMPTY_TREE_OID);
        parse_oid(from)?;
        parse_oid(to)?;
        self.run(
            Some(repo),
            &[
                "-c",
                "core.quotePath=false",
                "diff",
                "--no-color",
                "--no-ext-diff",
                "--no-textconv",
                "--no-renames",
                "--unified=0",
                from,
                to,
            ],
        )
        .await
    }

    async fn branch_tips(&self, repo: &Path) -> GitResult<BTreeMap<String, String>> {
        self.remote_refs(repo).await
    }

    async fn parents(&self, repo: &Path, sha: &str) -> GitResult<Vec<String>> {
        let id = parse_oid(sha)?;
        self.blocking(repo, move |repository, path| {
            let commit = repository
                .find_commit(id)
                .map_err(|_| GitError::ObjectNotFound {
                    path: path.clone(),
                    oid: id.to_string(),
                })?;
            Ok(commit.parent_ids().map(|parent| parent.to_string()).collect())
        })
        .await
    }

    async fn tree_blobs(
        &self,
        repo: &Path,
        sha: &str,
        max_bytes: usize,
    ) -> GitResult<Vec<TreeBlob>> {
        let id = parse_oid(sha)?;
        self.blocking(repo, move |repository, path| {
            let commit = repository
                .find_commit(id)
                .map_err(|_| GitError::ObjectNotFound {
                    path: path.clone(),
                    oid: id.to_string(),
                })?;
            let tree = commit.tree().map_err(|e| GitError::repository(&path, e))?;
            let mut recorder = gix::traverse::tree::Recorder::default();
            tree.traverse()
                .breadthfirst(&mut recorder)
                .map_err(|e| GitError::repository(&path, e))?;

            let mut blobs = Vec::new();
            for entry in recorder.records.into_iter().filter(|e| e.mode.is_blob()) {
                let object = repository
                    .find_object(entry.oid)
                    .map_err(|_| GitError::ObjectNotFound {
                        path: path.clone(),
                        oid: entry.oid.to_string(),
                    })?;
                if object.data.len() > max_bytes {
                    log::debug!("Skipping {} ({} bytes)", entry.filepath, object.data.len());
                    continue;
                }
                blobs.push(TreeBlob {
                    path: entry.filepath.to_string(),
                    content: object.detach().data,
                });
            }
            Ok(blobs)
        })
        .await
    }
}
