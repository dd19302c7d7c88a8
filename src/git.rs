//! Async wrappers around the `git` CLI, shared by the Repo Store (A) and
//! Worktree Manager (B). Shelling out to the user's installed `git` (rather
//! than a bundled implementation) keeps behavior identical to what the user
//! would get locally and preserves their credential-helper/SSH-agent
//! integration, which the auth-required failure mode depends on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

const SOFT_TIMEOUT: Duration = Duration::from_secs(30);
const HARD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("merge conflict: {0}")]
    Conflict(String),
    #[error("authentication required: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("git error: {0}")]
    Other(String),
}

impl GitError {
    /// Classifies raw `git` stderr text into the taxonomy required by §4.1/§4.2.
    fn classify(stderr: &str) -> GitError {
        let lower = stderr.to_lowercase();
        if lower.contains("conflict") || lower.contains("would be overwritten") {
            GitError::Conflict(stderr.trim().to_string())
        } else if lower.contains("authentication")
            || lower.contains("permission denied")
            || lower.contains("could not read username")
        {
            GitError::Auth(stderr.trim().to_string())
        } else if lower.contains("could not resolve host")
            || lower.contains("connection timed out")
            || lower.contains("network is unreachable")
            || lower.contains("unable to access")
        {
            GitError::Network(stderr.trim().to_string())
        } else if lower.contains("did not match any") || lower.contains("not found") {
            GitError::NotFound(stderr.trim().to_string())
        } else {
            GitError::Other(stderr.trim().to_string())
        }
    }
}

/// Runs a `git` subcommand with the soft/hard timeout bound required by the
/// concurrency model (§5): the server must not deadlock on a misbehaving
/// child even though it never sends it a signal on client disconnect.
async fn run(cwd: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let mut command = Command::new("git");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    tracing::debug!(args = ?args, cwd = ?cwd, "running git");

    let child = command
        .spawn()
        .map_err(|err| GitError::Other(format!("failed to spawn git: {err}")))?;

    let output = match timeout(HARD_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.map_err(|err| GitError::Other(err.to_string()))?,
        Err(_) => return Err(GitError::Other("git command exceeded hard timeout".into())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::classify(&stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Same as [`run`] but bounded by the shorter soft timeout, for operations
/// expected to be quick (everything but clone/fetch).
async fn run_soft(cwd: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    match timeout(SOFT_TIMEOUT, run(cwd, args)).await {
        Ok(result) => result,
        Err(_) => Err(GitError::Other("git command exceeded soft timeout".into())),
    }
}

/// Clones `remote_url` as a bare mirror into `bare_path`, creating parent
/// directories as needed. Idempotent: if `bare_path` already exists this is a
/// no-op (callers should call [`fetch_prune`] instead to refresh).
pub async fn clone_bare(remote_url: &str, bare_path: &Path) -> Result<(), GitError> {
    if bare_path.exists() {
        return Ok(());
    }
    if let Some(parent) = bare_path.parent() {
        fs_err::tokio::create_dir_all(parent)
            .await
            .map_err(|err| GitError::Other(err.to_string()))?;
    }

    run(
        None,
        &["clone", "--bare", remote_url, &bare_path.to_string_lossy()],
    )
    .await?;
    Ok(())
}

/// Fetches all refs into a bare repo, pruning stale remote-tracking refs.
pub async fn fetch_prune(bare_path: &Path) -> Result<(), GitError> {
    run(
        Some(bare_path),
        &["fetch", "--prune", "origin", "+refs/heads/*:refs/heads/*"],
    )
    .await?;
    Ok(())
}

/// Lists local branch names in a bare repo.
pub async fn list_branches(bare_path: &Path) -> Result<Vec<String>, GitError> {
    let output = run(
        Some(bare_path),
        &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
    )
    .await?;
    Ok(output.lines().map(|l| l.trim().to_string()).collect())
}

/// Resolves the remote's default branch (`HEAD` symbolic ref), falling back
/// to `main` if the remote hasn't advertised one.
pub async fn resolve_default_branch(bare_path: &Path) -> Result<String, GitError> {
    match run_soft(Some(bare_path), &["symbolic-ref", "--short", "HEAD"]).await {
        Ok(branch) if !branch.is_empty() => Ok(branch),
        _ => Ok("main".to_string()),
    }
}

/// Resolves a ref (branch, tag, or raw sha) to its commit hash.
pub async fn rev_parse(repo_path: &Path, rev: &str) -> Result<String, GitError> {
    run_soft(Some(repo_path), &["rev-parse", rev]).await
}

/// Checks whether `ancestor` is reachable from `descendant` (fast-forward check).
pub async fn is_ancestor(repo_path: &Path, ancestor: &str, descendant: &str) -> bool {
    run_soft(
        Some(repo_path),
        &["merge-base", "--is-ancestor", ancestor, descendant],
    )
    .await
    .is_ok()
}

/// Adds a worktree checked out at `worktree_path` for `branch`, creating the
/// branch from `start_point` if it doesn't already exist locally.
pub async fn worktree_add(
    bare_path: &Path,
    worktree_path: &Path,
    branch: &str,
    start_point: &str,
    create_branch: bool,
) -> Result<(), GitError> {
    if let Some(parent) = worktree_path.parent() {
        fs_err::tokio::create_dir_all(parent)
            .await
            .map_err(|err| GitError::Other(err.to_string()))?;
    }

    let worktree_path_str = worktree_path.to_string_lossy().into_owned();
    let args: Vec<&str> = if create_branch {
        vec![
            "worktree",
            "add",
            "-b",
            branch,
            &worktree_path_str,
            start_point,
        ]
    } else {
        vec!["worktree", "add", &worktree_path_str, branch]
    };

    run(Some(bare_path), &args).await?;
    Ok(())
}

/// Removes a worktree. Idempotent: a missing path is success.
pub async fn worktree_remove(bare_path: &Path, worktree_path: &Path) -> Result<(), GitError> {
    if !worktree_path.exists() {
        let _ = run_soft(Some(bare_path), &["worktree", "prune"]).await;
        return Ok(());
    }

    let result = run(
        Some(bare_path),
        &[
            "worktree",
            "remove",
            "--force",
            &worktree_path.to_string_lossy(),
        ],
    )
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(GitError::NotFound(_)) => Ok(()),
        Err(other) => Err(other),
    }
}

/// Updates `refname` (e.g. `refs/catnip/my-branch`) to point at `commit`.
pub async fn update_ref(repo_path: &Path, refname: &str, commit: &str) -> Result<(), GitError> {
    run_soft(Some(repo_path), &["update-ref", refname, commit]).await?;
    Ok(())
}

/// Returns true if the worktree has uncommitted changes (staged or not).
pub async fn is_dirty(worktree_path: &Path) -> Result<bool, GitError> {
    let output = run_soft(Some(worktree_path), &["status", "--porcelain"]).await?;
    Ok(!output.is_empty())
}

/// Lists dirty file paths relative to the worktree root.
pub async fn dirty_files(worktree_path: &Path) -> Result<Vec<PathBuf>, GitError> {
    let output = run_soft(Some(worktree_path), &["status", "--porcelain"]).await?;
    Ok(output
        .lines()
        .filter_map(|line| line.get(3..).map(PathBuf::from))
        .collect())
}

/// Stages every change and commits with `message`. A no-op (returns `Ok(false)`)
/// if there is nothing to commit.
pub async fn add_all_and_commit(worktree_path: &Path, message: &str) -> Result<bool, GitError> {
    if !is_dirty(worktree_path).await? {
        return Ok(false);
    }

    run_soft(Some(worktree_path), &["add", "-A"]).await?;
    run_soft(Some(worktree_path), &["commit", "-m", message, "--no-verify"]).await?;
    Ok(true)
}

/// Counts commits reachable from `head` but not from `base` (ahead count).
pub async fn commit_count_ahead(repo_path: &Path, base: &str, head: &str) -> Result<u32, GitError> {
    let output = run_soft(
        Some(repo_path),
        &["rev-list", "--count", &format!("{base}..{head}")],
    )
    .await?;
    output
        .trim()
        .parse()
        .map_err(|_| GitError::Other(format!("unexpected rev-list output: {output}")))
}

/// Finds the merge-base (fork point) commit between two refs.
pub async fn merge_base(repo_path: &Path, a: &str, b: &str) -> Result<String, GitError> {
    run_soft(Some(repo_path), &["merge-base", a, b]).await
}

/// Produces a unified diff between two commits, or a commit and the working tree
/// (`to == "HEAD"` combined with including unstaged changes via `diff`).
pub async fn diff_unified(repo_path: &Path, from: &str, to: &str) -> Result<String, GitError> {
    run_soft(Some(repo_path), &["diff", "--find-renames", &format!("{from}..{to}")]).await
}

/// Diff of unstaged/uncommitted changes against `HEAD`.
pub async fn diff_working_tree(repo_path: &Path) -> Result<String, GitError> {
    run_soft(Some(repo_path), &["diff", "--find-renames", "HEAD"]).await
}

/// Attempts a fast-forward merge of `source_branch` into the current branch.
/// Falls back to stash + merge + pop when the worktree is dirty; returns a
/// [`GitError::Conflict`] if the merge can't complete cleanly, leaving
/// intermediate state in place for the user to resolve.
pub async fn sync_from_source(worktree_path: &Path, source_branch: &str) -> Result<(), GitError> {
    let dirty = is_dirty(worktree_path).await?;

    if dirty {
        run_soft(Some(worktree_path), &["stash", "push", "-u", "-m", "catnip-sync"]).await?;
    }

    let merge_result = run_soft(
        Some(worktree_path),
        &["merge", "--ff-only", source_branch],
    )
    .await;

    let result = match merge_result {
        Ok(_) => Ok(()),
        Err(GitError::Other(_)) => {
            // Not a fast-forward; fall back to a real merge.
            run_soft(Some(worktree_path), &["merge", "--no-edit", source_branch])
                .await
                .map(|_| ())
        }
        Err(other) => Err(other),
    };

    if dirty {
        let pop_result = run_soft(Some(worktree_path), &["stash", "pop"]).await;
        if let Err(err) = pop_result {
            return Err(GitError::Conflict(format!(
                "sync succeeded but stash pop conflicted: {err}"
            )));
        }
    }

    result
}

/// Pushes `branch` to `origin`, optionally force-with-lease.
pub async fn push(repo_path: &Path, branch: &str, force_with_lease: bool) -> Result<(), GitError> {
    let mut args = vec!["push", "origin", branch];
    if force_with_lease {
        args.insert(1, "--force-with-lease");
    }
    run(Some(repo_path), &args).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_conflict() {
        assert!(matches!(
            GitError::classify("CONFLICT (content): Merge conflict in a.txt"),
            GitError::Conflict(_)
        ));
    }

    #[test]
    fn classifies_auth() {
        assert!(matches!(
            GitError::classify("fatal: could not read Username for 'https://github.com'"),
            GitError::Auth(_)
        ));
    }

    #[test]
    fn classifies_network() {
        assert!(matches!(
            GitError::classify("fatal: unable to access 'https://example.com/': Could not resolve host"),
            GitError::Network(_)
        ));
    }

    #[test]
    fn classifies_unknown_as_other() {
        assert!(matches!(GitError::classify("fatal: something weird"), GitError::Other(_)));
    }
}
