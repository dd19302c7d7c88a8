//! Claude Activity Monitor (Component D): derives per-worktree activity
//! state from agent hook events, with a filesystem-watch fallback.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::events::{EventBus, EventKind};
use crate::id::WorktreeId;

const HOOK_DEDUP_CAPACITY: usize = 128;
const RUNNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ACTIVE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Running,
    Inactive,
}

impl ActivityState {
    fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Active => "active",
            ActivityState::Running => "running",
            ActivityState::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEventType {
    UserPromptSubmit,
    Stop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    pub event_type: HookEventType,
    pub working_directory: PathBuf,
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl Serialize for TodoStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let v = match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
        };
        s.serialize_str(v)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub tool_call_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_hits: u64,
    pub last_context_size: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    pub state: &'static str,
    pub latest_user_prompt: Option<String>,
    pub latest_claude_message: Option<String>,
    pub latest_thought: Option<String>,
    pub todos: Vec<Todo>,
    pub stats: SessionStats,
}

struct TrackerState {
    t_prompt: Option<Instant>,
    t_stop: Option<Instant>,
    latest_user_prompt: Option<String>,
    latest_claude_message: Option<String>,
    latest_thought: Option<String>,
    todos: Vec<Todo>,
    stats: SessionStats,
    seen_keys: VecDeque<(String, Option<String>, String)>,
    seen_set: HashSet<(String, Option<String>, String)>,
    hook_seen_at: Option<Instant>,
}

impl Default for TrackerState {
    fn default() -> Self {
        TrackerState {
            t_prompt: None,
            t_stop: None,
            latest_user_prompt: None,
            latest_claude_message: None,
            latest_thought: None,
            todos: Vec::new(),
            stats: SessionStats::default(),
            seen_keys: VecDeque::new(),
            seen_set: HashSet::new(),
            hook_seen_at: None,
        }
    }
}

impl TrackerState {
    fn classify(&self, now: Instant) -> ActivityState {
        match (self.t_prompt, self.t_stop) {
            (Some(prompt), stop) => {
                let stop_after_prompt = stop.is_some_and(|s| s > prompt);
                if !stop_after_prompt && now.saturating_duration_since(prompt) < ACTIVE_TIMEOUT {
                    return ActivityState::Active;
                }
                if stop_after_prompt {
                    let stop = stop.unwrap();
                    if now.saturating_duration_since(stop) < RUNNING_TIMEOUT {
                        return ActivityState::Running;
                    }
                }
                ActivityState::Inactive
            }
            (None, _) => ActivityState::Inactive,
        }
    }

    fn dedup_key(event_type: &str, session_id: &Option<String>, timestamp: &str) -> (String, Option<String>, String) {
        (event_type.to_string(), session_id.clone(), timestamp.to_string())
    }

    fn seen_before(&mut self, key: (String, Option<String>, String)) -> bool {
        if self.seen_set.contains(&key) {
            return true;
        }
        if self.seen_keys.len() >= HOOK_DEDUP_CAPACITY {
            if let Some(oldest) = self.seen_keys.pop_front() {
                self.seen_set.remove(&oldest);
            }
        }
        self.seen_set.insert(key.clone());
        self.seen_keys.push_back(key);
        false
    }
}

/// Per-worktree activity tracker plus the shared dedup/transcript-fallback
/// machinery. State is read on every `GET /v1/worktrees` poll and on the
/// ETag projection, so lookups are cheap (`DashMap` + a short-lived mutex).
pub struct ActivityMonitor {
    trackers: DashMap<WorktreeId, Arc<Mutex<TrackerState>>>,
    fallback_spawned: DashMap<WorktreeId, ()>,
    bus: Arc<EventBus>,
}

/// Resolves the directory Claude Code writes this working directory's
/// session transcripts to, following its `~/.claude/projects/<encoded-cwd>`
/// convention (path separators replaced with dashes).
pub fn transcript_dir_for(working_directory: &std::path::Path) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let encoded = working_directory.to_string_lossy().replace('/', "-");
    Some(home.join(".claude").join("projects").join(encoded))
}

impl ActivityMonitor {
    pub fn new(bus: Arc<EventBus>) -> Arc<ActivityMonitor> {
        Arc::new(ActivityMonitor {
            trackers: DashMap::new(),
            fallback_spawned: DashMap::new(),
            bus,
        })
    }

    fn tracker_for(&self, id: &WorktreeId) -> Arc<Mutex<TrackerState>> {
        self.trackers
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TrackerState::default())))
            .clone()
    }

    /// Records a hook POST, using a synthetic timestamp (caller-provided
    /// wall-clock string, since hooks are deduplicated on `(event_type,
    /// session_id, timestamp)` rather than arrival order).
    pub async fn record_hook(&self, worktree_id: &WorktreeId, event: HookEvent, received_at: &str) {
        let tracker = self.tracker_for(worktree_id);
        let mut state = tracker.lock().await;

        let type_name = match event.event_type {
            HookEventType::UserPromptSubmit => "UserPromptSubmit",
            HookEventType::Stop => "Stop",
        };
        let key = TrackerState::dedup_key(type_name, &event.session_id, received_at);
        if state.seen_before(key) {
            return;
        }

        let now = Instant::now();
        state.hook_seen_at = Some(now);

        match event.event_type {
            HookEventType::UserPromptSubmit => {
                state.t_prompt = Some(now);
                if let Some(prompt) = event.prompt {
                    state.latest_user_prompt = Some(prompt);
                }
                state.stats.message_count += 1;
            }
            HookEventType::Stop => {
                state.t_stop = Some(now);
                if let Some(message) = event.message {
                    state.latest_claude_message = Some(message);
                }
            }
        }

        let activity = state.classify(now);
        drop(state);

        self.bus.publish(EventKind::ClaudeActivity {
            worktree_id: worktree_id.to_string(),
            state: activity.as_str().to_string(),
        });
    }

    /// Replaces the todo list atomically, as produced from the agent's
    /// todo-tool transcript for the current turn.
    pub async fn set_todos(&self, worktree_id: &WorktreeId, todos: Vec<Todo>) {
        let tracker = self.tracker_for(worktree_id);
        let mut state = tracker.lock().await;
        state.todos = todos;
        drop(state);
        self.bus.publish(EventKind::WorktreeTodosUpdated { id: worktree_id.to_string() });
    }

    pub async fn snapshot(&self, worktree_id: &WorktreeId) -> ActivitySnapshot {
        let tracker = self.tracker_for(worktree_id);
        let state = tracker.lock().await;
        let activity = state.classify(Instant::now());
        ActivitySnapshot {
            state: activity.as_str(),
            latest_user_prompt: state.latest_user_prompt.clone(),
            latest_claude_message: state.latest_claude_message.clone(),
            latest_thought: state.latest_thought.clone(),
            todos: state.todos.clone(),
            stats: state.stats.clone(),
        }
    }

    /// True when no hook has been heard from for `worktree_id` within the
    /// running-state timeout, i.e. the transcript-fallback watcher should
    /// take over deriving `t_prompt`/`t_stop`.
    pub async fn hook_channel_stale(&self, worktree_id: &WorktreeId) -> bool {
        let tracker = self.tracker_for(worktree_id);
        let state = tracker.lock().await;
        match state.hook_seen_at {
            Some(at) => at.elapsed() > RUNNING_TIMEOUT,
            None => true,
        }
    }

    /// Applies a fallback-derived observation. Never overwrites a more
    /// recent hook-sourced value — guarded by `hook_channel_stale`.
    pub async fn record_fallback_observation(&self, worktree_id: &WorktreeId, prompt_seen: bool, stop_seen: bool) {
        if !self.hook_channel_stale(worktree_id).await {
            return;
        }
        let tracker = self.tracker_for(worktree_id);
        let mut state = tracker.lock().await;
        let now = Instant::now();
        if prompt_seen {
            state.t_prompt = Some(now);
        }
        if stop_seen {
            state.t_stop = Some(now);
        }
    }

    /// Spawns the transcript-directory watcher for `worktree_id` at most
    /// once; safe to call on every hook delivery and on worktree creation
    /// without accumulating duplicate watchers.
    pub fn ensure_transcript_fallback(self: &Arc<Self>, worktree_id: WorktreeId, transcript_dir: PathBuf) {
        if self.fallback_spawned.contains_key(&worktree_id) {
            return;
        }
        self.fallback_spawned.insert(worktree_id.clone(), ());
        self.spawn_transcript_fallback(worktree_id, transcript_dir);
    }

    /// Spawns a background watcher over an agent transcript directory,
    /// re-deriving activity and todos from file writes when the hook channel
    /// has gone quiet. The watcher is advisory only: it never disagrees with
    /// a more recent hook-sourced timestamp.
    fn spawn_transcript_fallback(self: &Arc<Self>, worktree_id: WorktreeId, transcript_dir: PathBuf) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut watcher = match catnip_vfs::DirWatcher::new() {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(%err, "failed to start transcript fallback watcher");
                    return;
                }
            };
            if let Err(err) = watcher.watch(&transcript_dir) {
                tracing::warn!(%err, path = %transcript_dir.display(), "failed to watch transcript directory");
                return;
            }

            let events = watcher.event_receiver();
            loop {
                match events.recv() {
                    Ok(catnip_vfs::WatchEvent::Write(path)) | Ok(catnip_vfs::WatchEvent::Create(path)) => {
                        monitor.record_fallback_observation(&worktree_id, true, false).await;
                        if monitor.hook_channel_stale(&worktree_id).await {
                            if let Some(todos) = read_latest_todos(&path) {
                                monitor.set_todos(&worktree_id, todos).await;
                            }
                        }
                    }
                    Ok(catnip_vfs::WatchEvent::Remove(_)) => {}
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    }
}

/// Best-effort extraction of the most recent `TodoWrite` tool call from a
/// transcript JSONL file: reads the last non-empty line and walks its
/// `message.content` blocks for a `tool_use` entry named `TodoWrite`.
fn read_latest_todos(path: &std::path::Path) -> Option<Vec<Todo>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let last_line = contents.lines().rev().find(|line| !line.trim().is_empty())?;
    let entry: serde_json::Value = serde_json::from_str(last_line).ok()?;

    let blocks = entry.get("message")?.get("content")?.as_array()?;
    for block in blocks {
        if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
            continue;
        }
        if block.get("name").and_then(|v| v.as_str()) != Some("TodoWrite") {
            continue;
        }
        let raw_todos = block.get("input")?.get("todos")?.as_array()?;
        let todos = raw_todos
            .iter()
            .filter_map(|raw| {
                let content = raw.get("content")?.as_str()?.to_string();
                let status = match raw.get("status").and_then(|v| v.as_str()) {
                    Some("in_progress") => TodoStatus::InProgress,
                    Some("completed") => TodoStatus::Completed,
                    _ => TodoStatus::Pending,
                };
                Some(Todo { content, status })
            })
            .collect();
        return Some(todos);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_within_window_and_no_later_stop() {
        let mut state = TrackerState::default();
        state.t_prompt = Some(Instant::now());
        assert_eq!(state.classify(Instant::now()), ActivityState::Active);
    }

    #[test]
    fn inactive_with_no_prompt() {
        let state = TrackerState::default();
        assert_eq!(state.classify(Instant::now()), ActivityState::Inactive);
    }

    #[test]
    fn dedup_rejects_repeated_key() {
        let mut state = TrackerState::default();
        let key = TrackerState::dedup_key("UserPromptSubmit", &Some("s1".to_string()), "t1");
        assert!(!state.seen_before(key.clone()));
        assert!(state.seen_before(key));
    }

    #[tokio::test]
    async fn record_hook_deduplicates_across_calls() {
        let bus = EventBus::new();
        let monitor = ActivityMonitor::new(bus);
        let id = WorktreeId::from_name("demo");

        let event = HookEvent {
            event_type: HookEventType::UserPromptSubmit,
            working_directory: PathBuf::from("/tmp"),
            session_id: Some("s1".to_string()),
            prompt: Some("hi".to_string()),
            message: None,
        };

        monitor.record_hook(&id, event.clone(), "2026-01-01T00:00:00Z").await;
        monitor.record_hook(&id, event, "2026-01-01T00:00:00Z").await;

        let snapshot = monitor.snapshot(&id).await;
        assert_eq!(snapshot.stats.message_count, 1);
    }
}
