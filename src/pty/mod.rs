//! PTY Session Registry (Component C): one child process per
//! `(workspace, agent)` key, a bounded scrollback, and many viewers with
//! at-most-one writer.

mod session;

pub use session::Scrollback;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::worktree::{CommitTrigger, WorktreeManager};

const SCROLLBACK_CAPACITY: usize = 1 << 20; // 1 MiB
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const COMMIT_IDLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("pty session is not ready")]
    NotReady,
    #[error("pty session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PtyKey {
    pub workspace: String,
    pub agent: String,
}

impl fmt::Display for PtyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace, self.agent)
    }
}

pub type ViewerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Exited,
}

/// A server-to-client control message, framed as JSON text on the WS/SSE
/// transports (§6).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "writer")]
    PromotedToWriter,
    #[serde(rename = "read-only")]
    DemotedToReadOnly,
    #[serde(rename = "stalled")]
    Stalled,
}

pub enum OutboundFrame {
    Bytes(Vec<u8>),
    Control(ControlMessage),
}

struct Viewer {
    id: ViewerId,
    focused: bool,
    queue: Arc<Mutex<VecDeque<OutboundFrame>>>,
    notify: Arc<Notify>,
    stale: bool,
}

struct SessionInner {
    state: SessionState,
    viewers: Vec<Viewer>,
    writer_id: Option<ViewerId>,
    scrollback: Scrollback,
}

pub struct PtySession {
    key: PtyKey,
    inner: Mutex<SessionInner>,
    writer_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    master: Mutex<Option<Box<dyn portable_pty::MasterPty + Send>>>,
    last_output: Mutex<Instant>,
    commit_watcher_spawned: AtomicBool,
}

impl PtySession {
    fn new(key: PtyKey) -> Arc<PtySession> {
        Arc::new(PtySession {
            key,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                viewers: Vec::new(),
                writer_id: None,
                scrollback: Scrollback::new(SCROLLBACK_CAPACITY),
            }),
            writer_tx: Mutex::new(None),
            master: Mutex::new(None),
            last_output: Mutex::new(Instant::now()),
            commit_watcher_spawned: AtomicBool::new(false),
        })
    }

    async fn spawn_child(
        self: &Arc<Self>,
        cwd: &std::path::Path,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        registry_notify: Arc<dyn Fn(PtyKey) + Send + Sync>,
    ) -> Result<(), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Io(std::io::Error::other(err.to_string())))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| PtyError::Io(std::io::Error::other(err.to_string())))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| PtyError::Io(std::io::Error::other(err.to_string())))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| PtyError::Io(std::io::Error::other(err.to_string())))?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        *self.writer_tx.lock().await = Some(writer_tx);
        *self.master.lock().await = Some(pair.master);

        // The PTY read side is blocking at the syscall level, so the master
        // reader runs on its own OS thread and forwards bytes into the async
        // world over a bounded channel, per §4.3/§5.
        let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(256);
        std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if byte_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Writer-side: a dedicated task owns the PTY writer handle so input
        // from the promoted viewer serializes without a lock held across I/O.
        let mut master_writer = writer;
        tokio::spawn(async move {
            use std::io::Write;
            while let Some(bytes) = writer_rx.recv().await {
                if master_writer.write_all(&bytes).is_err() {
                    break;
                }
            }
        });

        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(bytes) = byte_rx.recv().await {
                session.on_output(&bytes).await;
            }
            session.on_exit().await;
        });

        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Running;
        }

        let key = self.key.clone();
        tokio::spawn(async move {
            let _ = child.wait();
            registry_notify(key);
        });

        Ok(())
    }

    async fn on_output(&self, bytes: &[u8]) {
        *self.last_output.lock().await = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.scrollback.push(bytes);
        for viewer in &inner.viewers {
            push_frame(viewer, OutboundFrame::Bytes(bytes.to_vec())).await;
        }
    }

    async fn on_exit(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Exited;
    }
}

async fn push_frame(viewer: &Viewer, frame: OutboundFrame) {
    let mut queue = viewer.queue.lock().await;
    if queue.len() >= OUTBOUND_QUEUE_CAPACITY {
        queue.pop_front();
    }
    queue.push_back(frame);
    viewer.notify.notify_one();
}

pub struct AttachedViewer {
    pub id: ViewerId,
    pub queue: Arc<Mutex<VecDeque<OutboundFrame>>>,
    pub notify: Arc<Notify>,
}

pub struct PtyRegistry {
    sessions: Arc<DashMap<PtyKey, Arc<PtySession>>>,
    next_viewer_id: AtomicU64,
    worktree_manager: Arc<WorktreeManager>,
}

impl PtyRegistry {
    pub fn new(worktree_manager: Arc<WorktreeManager>) -> Arc<PtyRegistry> {
        Arc::new(PtyRegistry {
            sessions: Arc::new(DashMap::new()),
            next_viewer_id: AtomicU64::new(1),
            worktree_manager,
        })
    }

    fn session_for(&self, key: &PtyKey) -> Arc<PtySession> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| PtySession::new(key.clone()))
            .clone()
    }

    /// Starts the session (if not already running) and adds a viewer.
    /// Returns `true` if the newly attached viewer is the writer.
    pub async fn attach(
        &self,
        key: &PtyKey,
        cwd: &std::path::Path,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<(ViewerId, bool, Arc<Mutex<VecDeque<OutboundFrame>>>, Arc<Notify>), PtyError> {
        let session = self.session_for(key);

        let needs_spawn = {
            let inner = session.inner.lock().await;
            inner.state == SessionState::Idle
        };

        if needs_spawn {
            let sessions = Arc::clone(&self.sessions);
            let notify = Arc::new(move |key: PtyKey| {
                sessions.remove(&key);
            });
            session.spawn_child(cwd, program, args, env, notify).await?;
        }

        let viewer_id = self.next_viewer_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let mut inner = session.inner.lock().await;
        let is_writer = inner.writer_id.is_none();
        if is_writer {
            inner.writer_id = Some(viewer_id);
        }
        inner.viewers.push(Viewer {
            id: viewer_id,
            focused: false,
            queue: Arc::clone(&queue),
            notify: Arc::clone(&notify),
            stale: false,
        });

        Ok((viewer_id, is_writer, queue, notify))
    }

    pub async fn send_input(&self, key: &PtyKey, viewer_id: ViewerId, bytes: Vec<u8>) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or_else(|| PtyError::NotFound(key.to_string()))?;
        let inner = session.inner.lock().await;
        if inner.writer_id != Some(viewer_id) {
            return Ok(()); // silently rejected: not the writer
        }
        drop(inner);

        let tx = session.writer_tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(bytes).await;
                Ok(())
            }
            None => Err(PtyError::NotReady),
        }
    }

    pub async fn send_prompt(&self, key: &PtyKey, viewer_id: ViewerId, text: &str, submit: bool) -> Result<(), PtyError> {
        let mut payload = text.as_bytes().to_vec();
        if submit {
            payload.push(b'\r');
        }
        self.send_input(key, viewer_id, payload).await
    }

    /// Injects text directly into a session's writer pipe, bypassing the
    /// viewer writer-promotion model. Used by server-driven callers (the
    /// hook-triggered prompt endpoint) that are not themselves a connected
    /// viewer. Returns [`PtyError::NotReady`] if the session has no running
    /// child yet, matching the 408 contract of that endpoint.
    pub async fn force_send(&self, key: &PtyKey, text: &str, submit: bool) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or(PtyError::NotReady)?;
        let tx = session.writer_tx.lock().await;
        let tx = tx.as_ref().ok_or(PtyError::NotReady)?;

        let mut payload = text.as_bytes().to_vec();
        if submit {
            payload.push(b'\r');
        }
        tx.send(payload).await.map_err(|_| PtyError::NotReady)
    }

    pub async fn resize(&self, key: &PtyKey, cols: u16, rows: u16) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or_else(|| PtyError::NotFound(key.to_string()))?;
        let master = session.master.lock().await;
        let master = master.as_ref().ok_or(PtyError::NotReady)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Io(std::io::Error::other(err.to_string())))
    }

    /// Replays the full scrollback ring to the signalling viewer.
    pub async fn ready(&self, key: &PtyKey, viewer_id: ViewerId) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or_else(|| PtyError::NotFound(key.to_string()))?;
        let inner = session.inner.lock().await;
        let replay = inner.scrollback.replay();
        if let Some(viewer) = inner.viewers.iter().find(|v| v.id == viewer_id) {
            push_frame(viewer, OutboundFrame::Bytes(replay)).await;
        }
        Ok(())
    }

    /// Applies the focus/promotion rules of §4.3, linearized by the session
    /// mutex so two concurrent focus events resolve to a single final state.
    pub async fn focus(&self, key: &PtyKey, viewer_id: ViewerId, focused: bool) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or_else(|| PtyError::NotFound(key.to_string()))?;
        let mut inner = session.inner.lock().await;

        if let Some(viewer) = inner.viewers.iter_mut().find(|v| v.id == viewer_id) {
            viewer.focused = focused;
        }

        if focused && inner.writer_id != Some(viewer_id) {
            let previous_writer = inner.writer_id;
            inner.writer_id = Some(viewer_id);

            if let Some(prev) = previous_writer {
                if let Some(v) = inner.viewers.iter().find(|v| v.id == prev) {
                    push_frame(v, OutboundFrame::Control(ControlMessage::DemotedToReadOnly)).await;
                }
            }
            if let Some(v) = inner.viewers.iter().find(|v| v.id == viewer_id) {
                push_frame(v, OutboundFrame::Control(ControlMessage::PromotedToWriter)).await;
            }
        }

        Ok(())
    }

    pub async fn detach(&self, key: &PtyKey, viewer_id: ViewerId) -> Result<(), PtyError> {
        let session = self.sessions.get(key).map(|e| e.clone()).ok_or_else(|| PtyError::NotFound(key.to_string()))?;
        let mut inner = session.inner.lock().await;
        inner.viewers.retain(|v| v.id != viewer_id);

        if inner.writer_id == Some(viewer_id) {
            // Promote an arbitrary remaining focused viewer, else any viewer, else none.
            let next = inner
                .viewers
                .iter()
                .find(|v| v.focused)
                .or_else(|| inner.viewers.first())
                .map(|v| v.id);
            inner.writer_id = next;
            if let Some(next_id) = next {
                if let Some(v) = inner.viewers.iter().find(|v| v.id == next_id) {
                    push_frame(v, OutboundFrame::Control(ControlMessage::PromotedToWriter)).await;
                }
            }
        }

        let empty = inner.viewers.is_empty();
        let exited = inner.state == SessionState::Exited;
        drop(inner);

        if empty && exited {
            self.sessions.remove(key);
        }

        Ok(())
    }

    pub async fn kill(&self, key: &PtyKey) -> Result<(), PtyError> {
        self.sessions.remove(key);
        Ok(())
    }

    pub async fn state(&self, key: &PtyKey) -> Option<SessionState> {
        let session = self.sessions.get(key)?.clone();
        let inner = session.inner.lock().await;
        Some(inner.state.clone())
    }

    /// Spawns the idle-commit watchdog for a session, once: after each
    /// `COMMIT_IDLE_INTERVAL` tick, triggers the worktree manager's
    /// commit-on-write hook only if no output has arrived since the last
    /// tick, i.e. the PTY has actually gone quiet rather than just having
    /// reached a fixed-interval deadline. A session-level guard makes this
    /// idempotent across repeated `attach`/hook/sse/ws calls.
    pub fn spawn_idle_commit_watcher(self: &Arc<Self>, key: PtyKey, worktree_id: crate::id::WorktreeId) {
        let session = self.session_for(&key);
        if session.commit_watcher_spawned.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(COMMIT_IDLE_INTERVAL).await;
                match registry.state(&key).await {
                    Some(SessionState::Exited) | None => break,
                    _ => {}
                }

                let Some(session) = registry.sessions.get(&key).map(|e| e.clone()) else { break };
                let idle_for = session.last_output.lock().await.elapsed();
                if idle_for < COMMIT_IDLE_INTERVAL {
                    continue;
                }

                let _ = registry
                    .worktree_manager
                    .commit_on_write(&worktree_id, CommitTrigger::IdleTimer)
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_key_display() {
        let key = PtyKey { workspace: "w1".into(), agent: "claude".into() };
        assert_eq!(key.to_string(), "w1/claude");
    }
}
