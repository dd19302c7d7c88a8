//! Repo Store (Component A): bare-mirror clones of remote repositories,
//! refreshed on demand. Registry keyed by opaque [`RepoId`], per-repo mutex
//! so concurrent callers against the same repo wait rather than race.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::git::{self, GitError};
use crate::id::RepoId;

#[derive(Debug, Clone, Serialize)]
pub struct RepoInfo {
    pub id: String,
    pub remote_url: String,
    pub default_branch: String,
    pub available: bool,
}

struct RepoEntry {
    remote_url: String,
    lock: Mutex<()>,
}

/// Owns every known repo's bare mirror. No global lock: each repo serializes
/// independently through its own `tokio::sync::Mutex`.
pub struct RepoStore {
    config: Arc<Config>,
    repos: DashMap<RepoId, Arc<RepoEntry>>,
}

impl RepoStore {
    pub fn new(config: Arc<Config>) -> RepoStore {
        RepoStore {
            config,
            repos: DashMap::new(),
        }
    }

    fn entry_for(&self, repo_id: &RepoId, remote_url: &str) -> Arc<RepoEntry> {
        self.repos
            .entry(repo_id.clone())
            .or_insert_with(|| {
                Arc::new(RepoEntry {
                    remote_url: remote_url.to_string(),
                    lock: Mutex::new(()),
                })
            })
            .clone()
    }

    pub fn bare_path(&self, repo_id: &RepoId) -> std::path::PathBuf {
        self.config.bare_repo_path(&repo_id.0)
    }

    /// Idempotent: clones on first call, fetch-prunes on subsequent calls.
    /// Marks the repo unavailable and reinitializes on a corrupt bare
    /// directory rather than propagating the corruption upward.
    pub async fn ensure_repo(&self, remote_url: &str) -> Result<RepoId, GitError> {
        let repo_id = RepoId::from_remote(remote_url);
        let entry = self.entry_for(&repo_id, remote_url);
        let _guard = entry.lock.lock().await;

        let bare_path = self.bare_path(&repo_id);

        if bare_path.exists() {
            if let Err(err) = git::fetch_prune(&bare_path).await {
                tracing::warn!(repo = %repo_id, %err, "fetch failed against existing mirror, reinitializing");
                let _ = fs_err::tokio::remove_dir_all(&bare_path).await;
                git::clone_bare(remote_url, &bare_path).await?;
            }
        } else {
            git::clone_bare(remote_url, &bare_path).await?;
        }

        Ok(repo_id)
    }

    pub async fn fetch(&self, repo_id: &RepoId) -> Result<(), GitError> {
        let remote_url = self
            .repos
            .get(repo_id)
            .map(|e| e.remote_url.clone())
            .ok_or_else(|| GitError::NotFound(repo_id.to_string()))?;
        let entry = self.entry_for(repo_id, &remote_url);
        let _guard = entry.lock.lock().await;
        git::fetch_prune(&self.bare_path(repo_id)).await
    }

    pub async fn list_branches(&self, repo_id: &RepoId) -> Result<Vec<String>, GitError> {
        git::list_branches(&self.bare_path(repo_id)).await
    }

    pub async fn resolve_default_branch(&self, repo_id: &RepoId) -> Result<String, GitError> {
        git::resolve_default_branch(&self.bare_path(repo_id)).await
    }

    pub fn info(&self, repo_id: &RepoId) -> Option<RepoInfo> {
        let entry = self.repos.get(repo_id)?;
        let bare_path = self.bare_path(repo_id);
        Some(RepoInfo {
            id: repo_id.to_string(),
            remote_url: entry.remote_url.clone(),
            default_branch: String::new(),
            available: bare_path.exists(),
        })
    }

    pub fn known_repo_ids(&self) -> Vec<RepoId> {
        self.repos.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_reused_across_calls() {
        let store = RepoStore::new(Arc::new(Config::default()));
        let id = RepoId::from_remote("git@github.com:acme/demo.git");
        let a = store.entry_for(&id, "git@github.com:acme/demo.git");
        let b = store.entry_for(&id, "git@github.com:acme/demo.git");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
