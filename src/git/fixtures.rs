//! Git repository fixtures for unit tests
//!
//! An [`Origin`] is a bare repository plus a seed working copy used to
//! author commits and push them. Clones made by the code under test use
//! the bare path as their URL.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Run git in `dir`, panicking on failure, and return trimmed stdout
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub struct Origin {
    pub dir: TempDir,
    bare: PathBuf,
    seed: PathBuf,
}

impl Origin {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let bare = dir.path().join("origin.git");
        let seed = dir.path().join("seed");

        git(dir.path(), &["init", "--quiet", "--bare", "-b", "main", "origin.git"]);
        git(dir.path(), &["init", "--quiet", "-b", "main", "seed"]);
        git(&seed, &["config", "user.name", "Test User"]);
        git(&seed, &["config", "user.email", "test@example.com"]);
        git(&seed, &["config", "commit.gpgsign", "false"]);
        git(&seed, &["remote", "add", "origin", &bare.to_string_lossy()]);

        Self { dir, bare, seed }
    }

    /// Clone URL of the bare repository
    pub fn url(&self) -> String {
        self.bare.to_string_lossy().to_string()
    }

    /// Write `content` to `path` in the seed, commit it and return the sha
    pub fn commit(&self, path: &str, content: &str, message: &str) -> String {
        let file = self.seed.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file, content).unwrap();
        git(&self.seed, &["add", "."]);
        git(&self.seed, &["commit", "--quiet", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        git(&self.seed, &["rev-parse", "HEAD"])
    }

    pub fn checkout_new(&self, branch: &str) {
        git(&self.seed, &["checkout", "--quiet", "-b", branch]);
    }

    pub fn checkout(&self, branch: &str) {
        git(&self.seed, &["checkout", "--quiet", branch]);
    }

    /// Merge `branch` into the current branch with a merge commit
    pub fn merge(&self, branch: &str) -> String {
        git(
            &self.seed,
            &["merge", "--quiet", "--no-ff", "-m", &format!("merge {}", branch), branch],
        );
        self.head()
    }

    pub fn push(&self) {
        git(&self.seed, &["push", "--quiet", "--all", "--force", "origin"]);
    }

    pub fn delete_remote_branch(&self, branch: &str) {
        git(&self.seed, &["push", "--quiet", "origin", "--delete", branch]);
    }

    /// Scratch directory next to the origin for clones
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
