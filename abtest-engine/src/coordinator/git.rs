//! Git working tree as a code-change sink.
//!
//! Changes are applied by rewriting a file under the repository root and
//! committing it with the `git` CLI on the requested branch. The working
//! tree and HEAD are shared, so each checkout-edit-commit sequence holds the
//! workspace lock.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use super::models::{ChangeReceipt, ChangeRequest, CodeChangeSink, RollbackRequest};

/// Commits winner changes into a local git repository
pub struct GitWorkspace {
    root: PathBuf,
    author_name: String,
    author_email: String,
    tree: Mutex<()>,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            author_name: "abtest-engine".to_string(),
            author_email: "abtest-engine@localhost".to_string(),
            tree: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if the root is inside a git repository
    pub fn is_git_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&self.root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run git and return stdout untouched
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn lock_tree(&self) -> Result<MutexGuard<'_, ()>> {
        self.tree
            .lock()
            .map_err(|_| anyhow!("git workspace lock poisoned"))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        Ok(self.run(args)?.trim().to_string())
    }

    /// Resolve a repository-relative path, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.trim().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("path '{path}' must be relative to the repository root");
        }
        Ok(self.root.join(relative))
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let current = self.git(&["symbolic-ref", "--short", "HEAD"]).ok();
        if current.as_deref() == Some(branch) {
            return Ok(());
        }

        let exists = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .is_ok();
        if exists {
            self.git(&["checkout", branch])?;
        } else {
            self.git(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    fn commit(&self, path: &str, message: &str) -> Result<ChangeReceipt> {
        self.git(&["add", "--", path])?;
        self.git(&["commit", "-m", message])?;
        let commit_hash = self.git(&["rev-parse", "HEAD"])?;
        Ok(ChangeReceipt { commit_hash })
    }
}

impl CodeChangeSink for GitWorkspace {
    fn implement_change(&self, request: &ChangeRequest) -> Result<ChangeReceipt> {
        let target = self.resolve(&request.path)?;
        let _tree = self.lock_tree()?;
        self.checkout(&request.branch)?;

        let current = if target.exists() {
            fs::read_to_string(&target)
                .with_context(|| format!("failed to read {}", target.display()))?
        } else {
            String::new()
        };

        let updated = if request.original.is_empty() {
            request.modified.clone()
        } else if current.contains(&request.original) {
            current.replacen(&request.original, &request.modified, 1)
        } else {
            bail!("original content not found in {}", request.path);
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, updated)
            .with_context(|| format!("failed to write {}", target.display()))?;

        let receipt = self.commit(&request.path, &request.message)?;
        log::info!(
            "committed {} on {} as {}",
            request.path,
            request.branch,
            receipt.commit_hash
        );
        Ok(receipt)
    }

    /// Swap the change's `modified` content back to `original` in the
    /// current file, leaving later edits to the file intact. A change that
    /// created the file removes it again.
    fn rollback_change(&self, request: &RollbackRequest) -> Result<ChangeReceipt> {
        let target = self.resolve(&request.path)?;
        let _tree = self.lock_tree()?;
        self.checkout(&request.branch)?;

        let current = fs::read_to_string(&target)
            .with_context(|| format!("failed to read {}", target.display()))?;

        if request.original.is_empty() && current == request.modified {
            fs::remove_file(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        } else if !request.modified.is_empty() && current.contains(&request.modified) {
            let restored = current.replacen(&request.modified, &request.original, 1);
            fs::write(&target, restored)
                .with_context(|| format!("failed to write {}", target.display()))?;
        } else {
            bail!("modified content not found in {}", request.path);
        }

        let receipt = self.commit(&request.path, &request.message)?;
        log::info!(
            "reverted {} ({}) as {}",
            request.path,
            request.commit_hash,
            receipt.commit_hash
        );
        Ok(receipt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo() -> (tempfile::TempDir, GitWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = GitWorkspace::new(dir.path());
        workspace.git(&["init", "--quiet"]).unwrap();
        (dir, workspace)
    }

    #[test]
    fn test_rejects_paths_outside_root() {
        let workspace = GitWorkspace::new("/tmp/repo");
        assert!(workspace.resolve("../etc/passwd").is_err());
        assert!(workspace.resolve("/etc/passwd").is_err());
        assert!(workspace.resolve("").is_err());
        assert!(workspace.resolve("src/index.html").is_ok());
    }

    #[test]
    fn test_implement_and_rollback_commit() -> anyhow::Result<()> {
        if !git_available() {
            eprintln!("git not available, skipping");
            return Ok(());
        }
        let (dir, workspace) = init_repo();
        assert!(workspace.is_git_repo());

        let create = ChangeRequest {
            path: "site/index.html".to_string(),
            original: String::new(),
            modified: "<h1>Welcome</h1>\n".to_string(),
            message: "seed page".to_string(),
            branch: "main".to_string(),
        };
        workspace.implement_change(&create)?;

        let change = ChangeRequest {
            path: "site/index.html".to_string(),
            original: "Welcome".to_string(),
            modified: "Start your free trial".to_string(),
            message: "apply winner".to_string(),
            branch: "main".to_string(),
        };
        let receipt = workspace.implement_change(&change)?;
        assert_eq!(receipt.commit_hash.len(), 40);
        let page = dir.path().join("site/index.html");
        assert_eq!(fs::read_to_string(&page)?, "<h1>Start your free trial</h1>\n");

        workspace.rollback_change(&RollbackRequest {
            path: "site/index.html".to_string(),
            commit_hash: receipt.commit_hash,
            original: "Welcome".to_string(),
            modified: "Start your free trial".to_string(),
            message: "roll back winner".to_string(),
            branch: "main".to_string(),
        })?;
        assert_eq!(fs::read_to_string(&page)?, "<h1>Welcome</h1>\n");
        Ok(())
    }

    #[test]
    fn test_missing_original_fails() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (_dir, workspace) = init_repo();
        let err = workspace
            .implement_change(&ChangeRequest {
                path: "missing.txt".to_string(),
                original: "absent".to_string(),
                modified: "present".to_string(),
                message: "should fail".to_string(),
                branch: "main".to_string(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("original content not found"));
        Ok(())
    }

    fn write_file(workspace: &GitWorkspace, path: &str, contents: &str, branch: &str) -> String {
        workspace
            .implement_change(&ChangeRequest {
                path: path.to_string(),
                original: String::new(),
                modified: contents.to_string(),
                message: format!("write {path}"),
                branch: branch.to_string(),
            })
            .unwrap()
            .commit_hash
    }

    fn edit(workspace: &GitWorkspace, path: &str, from: &str, to: &str) -> ChangeReceipt {
        workspace
            .implement_change(&ChangeRequest {
                path: path.to_string(),
                original: from.to_string(),
                modified: to.to_string(),
                message: format!("{from} -> {to}"),
                branch: "main".to_string(),
            })
            .unwrap()
    }

    fn revert(commit_hash: &str, path: &str, original: &str, modified: &str) -> RollbackRequest {
        RollbackRequest {
            path: path.to_string(),
            commit_hash: commit_hash.to_string(),
            original: original.to_string(),
            modified: modified.to_string(),
            message: format!("revert {commit_hash}"),
            branch: "main".to_string(),
        }
    }

    #[test]
    fn test_rollback_keeps_later_edits() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (dir, workspace) = init_repo();
        write_file(
            &workspace,
            "index.html",
            "<h1>Old</h1>\n<p>body</p>\n<footer>2023</footer>\n",
            "main",
        );
        let winner = edit(&workspace, "index.html", "<h1>Old</h1>", "<h1>New</h1>");
        edit(&workspace, "index.html", "2023", "2024");

        workspace.rollback_change(&revert(
            &winner.commit_hash,
            "index.html",
            "<h1>Old</h1>",
            "<h1>New</h1>",
        ))?;
        assert_eq!(
            fs::read_to_string(dir.path().join("index.html"))?,
            "<h1>Old</h1>\n<p>body</p>\n<footer>2024</footer>\n"
        );
        Ok(())
    }

    #[test]
    fn test_rollback_fails_when_modified_content_gone() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (dir, workspace) = init_repo();
        write_file(&workspace, "index.html", "<h1>Old</h1>\n", "main");
        let winner = edit(&workspace, "index.html", "Old", "New");
        edit(&workspace, "index.html", "New", "Fresh");

        let err = workspace
            .rollback_change(&revert(&winner.commit_hash, "index.html", "Old", "New"))
            .unwrap_err();
        assert!(err.to_string().contains("modified content not found"));
        assert_eq!(
            fs::read_to_string(dir.path().join("index.html"))?,
            "<h1>Fresh</h1>\n"
        );
        Ok(())
    }

    #[test]
    fn test_rollback_of_created_file_removes_it() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (dir, workspace) = init_repo();
        write_file(&workspace, "README.md", "seed\n", "main");
        let created = write_file(&workspace, "promo.html", "<p>Sale</p>\n", "main");

        workspace.rollback_change(&revert(&created, "promo.html", "", "<p>Sale</p>\n"))?;
        assert!(!dir.path().join("promo.html").exists());
        assert!(dir.path().join("README.md").exists());
        Ok(())
    }

    #[test]
    fn test_concurrent_branches_keep_commits_apart() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (_dir, workspace) = init_repo();
        write_file(&workspace, "README.md", "seed\n", "main");
        workspace.git(&["branch", "exp-a"])?;
        workspace.git(&["branch", "exp-b"])?;
        let workspace = std::sync::Arc::new(workspace);

        let handles: Vec<_> = ["exp-a", "exp-b"]
            .into_iter()
            .map(|branch| {
                let workspace = std::sync::Arc::clone(&workspace);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| {
                            let path = format!("{branch}-{i}.txt");
                            let hash = write_file(&workspace, &path, &format!("{i}\n"), branch);
                            (branch, hash)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut commits = Vec::new();
        for handle in handles {
            commits.extend(handle.join().unwrap());
        }
        assert_eq!(commits.len(), 20);
        for (branch, hash) in commits {
            let containing =
                workspace.git(&["branch", "--contains", &hash, "--format=%(refname:short)"])?;
            assert_eq!(containing, branch, "commit {hash} landed on {containing}");
        }
        Ok(())
    }
}
