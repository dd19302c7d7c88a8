//! Worktree Manager (Component B).
//!
//! Per-worktree mutable git state (commit-on-write, ref<->branch sync, diff,
//! delete) is serialized behind a single `tokio::sync::Mutex` per worktree —
//! the "coarse mutex plus queued operations" option from the design notes,
//! chosen over a dedicated actor task because every operation here is
//! already an `await`-able git subprocess call; a channel actor would just
//! add indirection around the same mutual exclusion.

mod status;

pub use status::{ChangeType, DiffResult, FileDiff, WorktreeStatus};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::CatnipError;
use crate::events::{EventBus, EventKind};
use crate::git::{self, GitError};
use crate::id::{two_word_name, RepoId, WorktreeId};
use crate::repo::RepoStore;

const COLLISION_RETRY_LIMIT: u32 = 32;
const STATUS_CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct Worktree {
    pub id: String,
    pub repo_id: String,
    pub project: String,
    pub name: String,
    pub branch: String,
    pub catnip_ref: String,
    pub path: PathBuf,
    pub head: String,
    pub fork_point: String,
    pub is_dirty: bool,
    pub dirty_files: Vec<String>,
    pub commit_count: u32,
    pub commits_behind: u32,
    pub has_conflicts: bool,
    pub pull_request_url: Option<String>,
}

struct WorktreeState {
    worktree: Worktree,
    bare_path: PathBuf,
    source_branch: String,
    last_commit_source: Option<CommitSource>,
    cached_status_at: Option<(Instant, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CommitSource {
    Hook,
    IdleTimer,
}

struct WorktreeHandle {
    state: Mutex<WorktreeState>,
}

pub struct WorktreeManager {
    config: Arc<Config>,
    repo_store: Arc<RepoStore>,
    bus: Arc<EventBus>,
    registry: DashMap<WorktreeId, Arc<WorktreeHandle>>,
}

impl WorktreeManager {
    pub fn new(config: Arc<Config>, repo_store: Arc<RepoStore>, bus: Arc<EventBus>) -> Arc<WorktreeManager> {
        Arc::new(WorktreeManager {
            config,
            repo_store,
            bus,
            registry: DashMap::new(),
        })
    }

    /// Creates a worktree per the branch-selection tie-break order in §4.2.
    pub async fn create(
        &self,
        repo_id: &RepoId,
        branch_or_ref: Option<&str>,
        project: &str,
    ) -> Result<Worktree, CatnipError> {
        let bare_path = self.repo_store.bare_path(repo_id);
        let source_branch = self.repo_store.resolve_default_branch(repo_id).await?;

        let (branch, name, create_branch, start_point) = match branch_or_ref {
            Some(requested) => {
                let existing = git::rev_parse(&bare_path, requested).await;
                let start_point = match existing {
                    Ok(sha) => sha,
                    Err(_) => return Err(GitError::NotFound(requested.to_string()).into()),
                };
                (requested.to_string(), requested.replace('/', "-"), false, start_point)
            }
            None => {
                let base_sha = git::rev_parse(&bare_path, &source_branch).await?;
                let seed = fnv_seed(project);
                let mut attempt = 0;
                let mut chosen = two_word_name(seed, attempt);
                while self.registry.contains_key(&WorktreeId::from_name(&chosen))
                    && attempt < COLLISION_RETRY_LIMIT
                {
                    attempt += 1;
                    chosen = two_word_name(seed, attempt);
                }
                (format!("feature/{chosen}"), chosen, true, base_sha)
            }
        };

        let worktree_id = WorktreeId::from_name(&format!("{project}-{name}"));
        let worktree_path = self.config.worktrees_dir.join(project).join(&name);

        git::worktree_add(&bare_path, &worktree_path, &branch, &start_point, create_branch).await?;

        let head = git::rev_parse(&worktree_path, "HEAD").await?;
        let catnip_ref = format!("refs/catnip/{project}/{name}");
        git::update_ref(&worktree_path, &catnip_ref, &head).await?;

        let worktree = Worktree {
            id: worktree_id.to_string(),
            repo_id: repo_id.to_string(),
            project: project.to_string(),
            name: name.clone(),
            branch,
            catnip_ref,
            path: worktree_path,
            head: head.clone(),
            fork_point: head,
            is_dirty: false,
            dirty_files: Vec::new(),
            commit_count: 0,
            commits_behind: 0,
            has_conflicts: false,
            pull_request_url: None,
        };

        self.registry.insert(
            worktree_id,
            Arc::new(WorktreeHandle {
                state: Mutex::new(WorktreeState {
                    worktree: worktree.clone(),
                    bare_path,
                    source_branch,
                    last_commit_source: None,
                    cached_status_at: None,
                }),
            }),
        );

        self.bus.publish(EventKind::WorktreeCreated { id: worktree.id.clone() });

        Ok(worktree)
    }

    pub async fn list(&self) -> Vec<Worktree> {
        let mut out = Vec::with_capacity(self.registry.len());
        for entry in self.registry.iter() {
            let state = entry.value().state.lock().await;
            out.push(state.worktree.clone());
        }
        out
    }

    pub async fn get(&self, id: &WorktreeId) -> Result<Worktree, CatnipError> {
        let handle = self.lookup(id)?;
        let state = handle.state.lock().await;
        Ok(state.worktree.clone())
    }

    /// Resolves the worktree owning `path`, used by the hook endpoint and the
    /// lightweight session-polling endpoint, both of which only know a
    /// filesystem path.
    pub async fn find_by_path(&self, path: &std::path::Path) -> Option<WorktreeId> {
        for entry in self.registry.iter() {
            let state = entry.value().state.lock().await;
            if path.starts_with(&state.worktree.path) {
                return Some(entry.key().clone());
            }
        }
        None
    }

    fn lookup(&self, id: &WorktreeId) -> Result<Arc<WorktreeHandle>, CatnipError> {
        self.registry
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| CatnipError::NotFound(format!("worktree {id}")))
    }

    /// Idempotent: a missing path or ref is success.
    pub async fn delete(&self, id: &WorktreeId) -> Result<(), CatnipError> {
        let handle = match self.registry.remove(id) {
            Some((_, handle)) => handle,
            None => return Ok(()),
        };
        let state = handle.state.lock().await;
        git::worktree_remove(&state.bare_path, &state.worktree.path).await?;
        drop(state);

        self.bus.publish(EventKind::WorktreeDeleted { id: id.to_string() });
        Ok(())
    }

    /// Refreshes `is_dirty`, `dirty_files`, `commit_count`, `commits_behind`,
    /// caching the result for `STATUS_CACHE_TTL` keyed loosely by `head`.
    pub async fn refresh_status(&self, id: &WorktreeId) -> Result<Worktree, CatnipError> {
        let handle = self.lookup(id)?;
        let mut state = handle.state.lock().await;

        if let Some((at, head)) = &state.cached_status_at {
            if at.elapsed() < STATUS_CACHE_TTL && *head == state.worktree.head {
                return Ok(state.worktree.clone());
            }
        }

        let path = state.worktree.path.clone();
        let head = git::rev_parse(&path, "HEAD").await?;
        let dirty_files = git::dirty_files(&path).await?;
        let source_branch = state.source_branch.clone();
        let fork_point = git::merge_base(&path, &head, &source_branch)
            .await
            .unwrap_or_else(|_| state.worktree.fork_point.clone());
        let commit_count = git::commit_count_ahead(&path, &fork_point, &head).await.unwrap_or(0);
        let commits_behind = git::commit_count_ahead(&path, &head, &source_branch).await.unwrap_or(0);

        state.worktree.head = head.clone();
        state.worktree.fork_point = fork_point;
        state.worktree.is_dirty = !dirty_files.is_empty();
        state.worktree.dirty_files = dirty_files.iter().map(|p| p.display().to_string()).collect();
        state.worktree.commit_count = commit_count;
        state.worktree.commits_behind = commits_behind;
        state.cached_status_at = Some((Instant::now(), head));

        Ok(state.worktree.clone())
    }

    /// Invalidates the cached status for `id`, e.g. on a filesystem event
    /// from the activity monitor's watcher.
    pub fn invalidate_status(&self, id: &WorktreeId) {
        if let Some(handle) = self.registry.get(id) {
            if let Ok(mut state) = handle.state.try_lock() {
                state.cached_status_at = None;
            }
        }
    }

    /// Called by the PTY registry after an idle interval or an explicit
    /// Claude Activity Monitor hook. Stages all changes, commits, and updates
    /// both `catnip_ref` and (iff fast-forward holds) `branch`. No-op if
    /// nothing changed.
    pub async fn commit_on_write(&self, id: &WorktreeId, source: CommitTrigger) -> Result<bool, CatnipError> {
        let handle = self.lookup(id)?;
        let mut state = handle.state.lock().await;

        // The idle-interval trigger no-ops if a hook already committed within
        // the current idle window (resolved Open Question, §9).
        if source == CommitTrigger::IdleTimer && state.last_commit_source == Some(CommitSource::Hook) {
            state.last_commit_source = None;
            return Ok(false);
        }

        let path = state.worktree.path.clone();
        let message = format!("catnip: agent turn at {}", crate::activity::now_rfc3339());
        let committed = git::add_all_and_commit(&path, &message).await?;

        if !committed {
            return Ok(false);
        }

        let head = git::rev_parse(&path, "HEAD").await?;
        git::update_ref(&path, &state.worktree.catnip_ref, &head).await?;

        let branch = state.worktree.branch.clone();
        if git::is_ancestor(&state.bare_path, &state.worktree.head, &head).await {
            git::update_ref(&path, &format!("refs/heads/{branch}"), &head).await?;
            state.worktree.has_conflicts = false;
        } else {
            state.worktree.has_conflicts = true;
        }

        state.worktree.head = head;
        state.cached_status_at = None;
        state.last_commit_source = Some(match source {
            CommitTrigger::Hook => CommitSource::Hook,
            CommitTrigger::IdleTimer => CommitSource::IdleTimer,
        });

        let worktree_id = state.worktree.id.clone();
        drop(state);

        self.bus.publish(EventKind::WorktreeUpdated { id: worktree_id });
        Ok(true)
    }

    /// Fast-forwards if clean; otherwise stash + merge + pop. Conflicts are
    /// surfaced as a structured error, leaving intermediate state for the user.
    pub async fn sync(&self, id: &WorktreeId) -> Result<(), CatnipError> {
        let handle = self.lookup(id)?;
        let mut state = handle.state.lock().await;

        let path = state.worktree.path.clone();
        let source_branch = state.source_branch.clone();
        git::sync_from_source(&path, &source_branch).await?;

        let head = git::rev_parse(&path, "HEAD").await?;
        state.worktree.head = head;
        state.cached_status_at = None;
        let worktree_id = state.worktree.id.clone();
        drop(state);

        self.bus.publish(EventKind::WorktreeUpdated { id: worktree_id });
        Ok(())
    }

    pub async fn diff(&self, id: &WorktreeId) -> Result<DiffResult, CatnipError> {
        let handle = self.lookup(id)?;
        let state = handle.state.lock().await;
        let path = state.worktree.path.clone();
        let fork_point = state.worktree.fork_point.clone();
        drop(state);

        let committed = git::diff_unified(&path, &fork_point, "HEAD").await?;
        let working = git::diff_working_tree(&path).await?;
        Ok(status::parse_unified_diff(&committed, &working))
    }

    /// Pushes `branch` (force-with-lease if requested) and invokes the host's
    /// PR-creation command (delegated to the `gh`/`hub` CLI already on PATH,
    /// matching the shell-out policy used for all other git plumbing).
    pub async fn open_pr(
        &self,
        id: &WorktreeId,
        title: &str,
        body: &str,
        force_push: bool,
    ) -> Result<String, CatnipError> {
        let handle = self.lookup(id)?;
        let mut state = handle.state.lock().await;
        let path = state.worktree.path.clone();
        let branch = state.worktree.branch.clone();

        git::push(&path, &branch, force_push).await?;

        let output = tokio::process::Command::new("gh")
            .args(["pr", "create", "--fill", "--title", title, "--body", body, "--head", &branch])
            .current_dir(&path)
            .output()
            .await
            .map_err(|err| CatnipError::Internal(format!("failed to run gh pr create: {err}")))?;

        if !output.status.success() {
            return Err(CatnipError::Internal(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        state.worktree.pull_request_url = Some(url.clone());
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    Hook,
    IdleTimer,
}

fn fnv_seed(s: &str) -> u64 {
    crate::events::fnv1a_hash(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_seed_is_stable() {
        assert_eq!(fnv_seed("acme/demo"), fnv_seed("acme/demo"));
    }
}
