use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use serde::Deserialize;

use crate::activity::HookEvent;
use crate::error::CatnipError;
use crate::events::worktree_list_etag;
use crate::id::{RepoId, WorktreeId};
use crate::pty::PtyKey;
use crate::state::Daemon;

use super::{json_response, BoxedBody};

const AGENT_PROGRAM: &str = "claude";

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    Some((
                        percent_encoding::percent_decode_str(k).decode_utf8_lossy().into_owned(),
                        percent_encoding::percent_decode_str(v).decode_utf8_lossy().into_owned(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, CatnipError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|err| CatnipError::InvalidRequest(err.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|err| CatnipError::InvalidRequest(err.to_string()))
}

fn last_path_segment<'a>(path: &'a str, strip_suffix: Option<&str>) -> &'a str {
    let trimmed = strip_suffix.and_then(|s| path.strip_suffix(s)).unwrap_or(path);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub fn info(daemon: &Daemon, shutting_down: &Arc<AtomicBool>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    if shutting_down.load(Ordering::SeqCst) {
        return Err(CatnipError::CodespaceShutdown);
    }
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": "ok",
        }),
    ))
}

pub async fn list_worktrees(
    daemon: &Daemon,
    req: &Request<Incoming>,
) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let worktrees = daemon.worktrees().list().await;

    let mut rows = Vec::with_capacity(worktrees.len());
    for wt in &worktrees {
        let snapshot = daemon.activity().snapshot(&WorktreeId(wt.id.clone())).await;
        let prompt_ts = 0u64;
        rows.push((wt.id.clone(), wt.head.clone(), wt.is_dirty, snapshot.state.to_string(), prompt_ts));
    }
    let etag = worktree_list_etag(&rows);

    if let Some(if_none_match) = req.headers().get(hyper::header::IF_NONE_MATCH) {
        if if_none_match.to_str().ok() == Some(etag.as_str()) {
            return Ok(hyper::Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(hyper::header::ETAG, &etag)
                .body(http_body_util::Empty::new().map_err(|e: std::convert::Infallible| match e {}).boxed())
                .unwrap());
        }
    }

    let mut response = json_response(StatusCode::OK, serde_json::json!({ "worktrees": worktrees }));
    response
        .headers_mut()
        .insert(hyper::header::ETAG, hyper::header::HeaderValue::from_str(&etag).unwrap());
    Ok(response)
}

pub async fn get_worktree(daemon: &Daemon, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = WorktreeId(last_path_segment(path, None).to_string());
    let worktree = daemon.worktrees().refresh_status(&id).await?;
    Ok(json_response(StatusCode::OK, serde_json::to_value(worktree).unwrap()))
}

pub async fn delete_worktree(daemon: &Daemon, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = WorktreeId(last_path_segment(path, None).to_string());
    daemon.worktrees().delete(&id).await?;
    daemon.ports().release(&id.0);
    Ok(json_response(StatusCode::OK, serde_json::json!({ "deleted": true })))
}

pub async fn worktree_diff(daemon: &Daemon, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = WorktreeId(last_path_segment(path, Some("/diff")).to_string());
    let diff = daemon.worktrees().diff(&id).await?;
    Ok(json_response(StatusCode::OK, serde_json::to_value(diff).unwrap()))
}

#[derive(Deserialize)]
struct OpenPrRequest {
    title: String,
    body: String,
    #[serde(default)]
    force_push: bool,
}

pub async fn open_pr(daemon: &Daemon, path: &str, req: Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = WorktreeId(last_path_segment(path, Some("/pr")).to_string());
    let body: OpenPrRequest = read_json_body(req).await?;
    let url = daemon.worktrees().open_pr(&id, &body.title, &body.body, body.force_push).await?;
    Ok(json_response(StatusCode::OK, serde_json::json!({ "url": url })))
}

pub async fn sync_worktree(daemon: &Daemon, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = WorktreeId(last_path_segment(path, Some("/sync")).to_string());
    daemon.worktrees().sync(&id).await?;
    Ok(json_response(StatusCode::OK, serde_json::json!({ "synced": true })))
}

pub async fn git_status(daemon: &Daemon) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let repositories: Vec<_> = daemon
        .repos()
        .known_repo_ids()
        .iter()
        .filter_map(|id| daemon.repos().info(id))
        .collect();
    let worktrees = daemon.worktrees().list().await;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "repositories": repositories, "worktrees": worktrees }),
    ))
}

pub async fn list_branches(daemon: &Daemon, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let encoded = path.strip_prefix("/v1/git/branches/").unwrap_or_default();
    let repo_id = RepoId(percent_encoding::percent_decode_str(encoded).decode_utf8_lossy().into_owned());
    let branches = daemon.repos().list_branches(&repo_id).await?;
    Ok(json_response(StatusCode::OK, serde_json::json!({ "branches": branches })))
}

pub async fn checkout(daemon: &Daemon, req: &Request<Incoming>, path: &str) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let rest = path.strip_prefix("/v1/git/checkout/").unwrap_or_default();
    let mut segments = rest.splitn(2, '/');
    let org = segments.next().unwrap_or_default();
    let repo = segments.next().unwrap_or_default();
    if org.is_empty() || repo.is_empty() {
        return Err(CatnipError::InvalidRequest("expected /v1/git/checkout/{org}/{repo}".into()));
    }

    let remote_url = format!("https://github.com/{org}/{repo}.git");
    let repo_id = daemon.repos().ensure_repo(&remote_url).await?;

    let params = query_params(req);
    let branch = params.get("branch").map(|s| s.as_str());

    let worktree = daemon.worktrees().create(&repo_id, branch, &format!("{org}-{repo}")).await?;
    if let Some(port) = daemon.ports().allocate(&worktree.id) {
        daemon.ports().set_service_label(port, format!("{org}/{repo}"));
    }
    if let Some(transcript_dir) = crate::activity::transcript_dir_for(&worktree.path) {
        daemon.activity().ensure_transcript_fallback(WorktreeId(worktree.id.clone()), transcript_dir);
    }
    Ok(json_response(StatusCode::CREATED, serde_json::to_value(worktree).unwrap()))
}

pub async fn claude_hook(daemon: &Daemon, req: Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let received_at = crate::activity::now_rfc3339();
    let event: HookEvent = read_json_body(req).await?;

    let worktree_id = daemon
        .worktrees()
        .find_by_path(&event.working_directory)
        .await
        .ok_or_else(|| CatnipError::NotFound("no worktree owns that working directory".into()))?;

    if let Some(transcript_dir) = crate::activity::transcript_dir_for(&event.working_directory) {
        daemon.activity().ensure_transcript_fallback(worktree_id.clone(), transcript_dir);
    }

    daemon.activity().record_hook(&worktree_id, event, &received_at).await;

    let key = PtyKey { workspace: worktree_id.to_string(), agent: AGENT_PROGRAM.to_string() };
    daemon.ptys().spawn_idle_commit_watcher(key, worktree_id);

    Ok(json_response(StatusCode::ACCEPTED, serde_json::json!({ "received": true })))
}

pub async fn session_for_workspace(daemon: &Daemon, req: &Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let params = query_params(req);
    let workspace = params.get("workspace").ok_or_else(|| CatnipError::InvalidRequest("missing workspace".into()))?;
    let id = WorktreeId(workspace.clone());

    let worktree = daemon.worktrees().get(&id).await?;
    let snapshot = daemon.activity().snapshot(&id).await;

    Ok(json_response(StatusCode::OK, session_summary_json(&worktree, &snapshot)))
}

fn session_summary_json(
    worktree: &crate::worktree::Worktree,
    snapshot: &crate::activity::ActivitySnapshot,
) -> serde_json::Value {
    serde_json::json!({
        "session_info": { "worktree_id": worktree.id, "branch": worktree.branch },
        "latest_user_prompt": snapshot.latest_user_prompt,
        "latest_message": snapshot.latest_claude_message,
        "latest_thought": snapshot.latest_thought,
        "stats": snapshot.stats,
        "todos": snapshot.todos,
        "latest_session_title": worktree.branch,
    })
}

async fn resolve_worktree_path(daemon: &Daemon, req: &Request<Incoming>) -> Result<WorktreeId, CatnipError> {
    let params = query_params(req);
    let worktree_path = params
        .get("worktree_path")
        .ok_or_else(|| CatnipError::InvalidRequest("missing worktree_path".into()))?;
    daemon
        .worktrees()
        .find_by_path(std::path::Path::new(worktree_path))
        .await
        .ok_or_else(|| CatnipError::NotFound("no worktree at that path".into()))
}

/// Map of worktree path to session summary, for clients that poll every
/// active session at once rather than one worktree at a time.
pub async fn claude_sessions(daemon: &Daemon) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let worktrees = daemon.worktrees().list().await;
    let mut sessions = serde_json::Map::with_capacity(worktrees.len());
    for worktree in &worktrees {
        let id = WorktreeId(worktree.id.clone());
        let snapshot = daemon.activity().snapshot(&id).await;
        sessions.insert(worktree.path.to_string_lossy().into_owned(), session_summary_json(worktree, &snapshot));
    }
    Ok(json_response(StatusCode::OK, serde_json::Value::Object(sessions)))
}

pub async fn claude_session(daemon: &Daemon, req: &Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = resolve_worktree_path(daemon, req).await?;
    let worktree = daemon.worktrees().get(&id).await?;
    let snapshot = daemon.activity().snapshot(&id).await;
    Ok(json_response(StatusCode::OK, session_summary_json(&worktree, &snapshot)))
}

pub async fn claude_latest_message(daemon: &Daemon, req: &Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let id = resolve_worktree_path(daemon, req).await?;
    let snapshot = daemon.activity().snapshot(&id).await;
    Ok(json_response(StatusCode::OK, serde_json::json!({ "message": snapshot.latest_claude_message })))
}

#[derive(Deserialize)]
struct ClaudeMessageRequest {
    worktree_path: String,
    message: String,
    #[serde(default)]
    resume: bool,
    #[serde(default)]
    max_turns: Option<u32>,
    #[serde(default)]
    suppress_events: bool,
    #[serde(default)]
    disable_tools: bool,
    #[serde(default)]
    stream: bool,
}

/// Proxies a single completion request to the agent running in the
/// worktree's PTY. The agent itself is the only thing that can produce a
/// completion, so this injects the message as a prompt on the existing (or
/// freshly started) session rather than opening a side channel to it;
/// `resume`/`max_turns`/`disable_tools` are accepted for forward
/// compatibility with richer agent CLIs but are not interpreted here.
pub async fn claude_messages(daemon: &Daemon, req: Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let body: ClaudeMessageRequest = read_json_body(req).await?;
    let worktree_id = daemon
        .worktrees()
        .find_by_path(std::path::Path::new(&body.worktree_path))
        .await
        .ok_or_else(|| CatnipError::NotFound("no worktree at that path".into()))?;
    let worktree = daemon.worktrees().get(&worktree_id).await?;

    let key = PtyKey { workspace: worktree_id.to_string(), agent: AGENT_PROGRAM.to_string() };
    let port = daemon.ports().allocate(&worktree.id).unwrap_or(0);
    let env = vec![("PORT".to_string(), port.to_string())];
    daemon.ptys().attach(&key, &worktree.path, AGENT_PROGRAM, &[], &env).await?;
    daemon.ptys().spawn_idle_commit_watcher(key.clone(), worktree_id);

    daemon
        .ptys()
        .force_send(&key, &body.message, true)
        .await
        .map_err(|_| CatnipError::Timeout("pty session not ready".into()))?;

    Ok(json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({
            "accepted": true,
            "resumed": body.resume,
            "max_turns": body.max_turns,
            "suppress_events": body.suppress_events,
            "disable_tools": body.disable_tools,
            "stream": body.stream,
        }),
    ))
}

pub fn list_ports(daemon: &Daemon) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    Ok(json_response(StatusCode::OK, serde_json::json!({ "ports": daemon.ports().list() })))
}

#[derive(Deserialize)]
struct SetPortLabelRequest {
    service_label: String,
}

pub async fn set_port_label(daemon: &Daemon, path: &str, req: Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let port: u16 = last_path_segment(path, None)
        .parse()
        .map_err(|_| CatnipError::InvalidRequest("invalid port".into()))?;
    let body: SetPortLabelRequest = read_json_body(req).await?;
    daemon.ports().set_service_label(port, body.service_label);
    Ok(json_response(StatusCode::OK, serde_json::json!({ "updated": true })))
}

fn resolve_pty_key(params: &HashMap<String, String>) -> Result<(PtyKey, String), CatnipError> {
    let session = params.get("session").ok_or_else(|| CatnipError::InvalidRequest("missing session".into()))?;
    let agent = params.get("agent").cloned().unwrap_or_else(|| AGENT_PROGRAM.to_string());
    Ok((PtyKey { workspace: session.clone(), agent }, session.clone()))
}

pub async fn pty_start(daemon: &Daemon, req: &Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let params = query_params(req);
    let (key, session) = resolve_pty_key(&params)?;
    let worktree_id = WorktreeId(session);
    let worktree = daemon.worktrees().get(&worktree_id).await?;

    let port = daemon.ports().allocate(&worktree.id).unwrap_or(0);
    let env = vec![("PORT".to_string(), port.to_string())];

    let (viewer_id, is_writer, _queue, _notify) = daemon
        .ptys()
        .attach(&key, &worktree.path, AGENT_PROGRAM, &[], &env)
        .await?;
    daemon.ptys().spawn_idle_commit_watcher(key, worktree_id);

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "viewer_id": viewer_id, "is_writer": is_writer }),
    ))
}

#[derive(Deserialize)]
struct PtyPromptRequest {
    prompt: String,
    #[serde(default = "default_true")]
    submit: bool,
}

fn default_true() -> bool {
    true
}

pub async fn pty_prompt(daemon: &Daemon, req: Request<Incoming>) -> Result<hyper::Response<BoxedBody>, CatnipError> {
    let params = query_params(&req);
    let (key, _session) = resolve_pty_key(&params)?;
    let body: PtyPromptRequest = read_json_body(req).await?;

    daemon
        .ptys()
        .force_send(&key, &body.prompt, body.submit)
        .await
        .map_err(|_| CatnipError::Timeout("pty session not ready".into()))?;

    Ok(json_response(StatusCode::OK, serde_json::json!({ "sent": true })))
}

pub async fn proxy(daemon: &Daemon, req: Request<Incoming>) -> hyper::Response<BoxedBody> {
    let path = req.uri().path().to_string();
    let mut segments = path[1..].splitn(2, '/');
    let port_str = segments.next().unwrap_or_default();
    let rest = segments.next().unwrap_or_default();
    let downstream_path = format!("/{rest}");

    let Ok(port) = port_str.parse::<u16>() else {
        return super::error_response(CatnipError::InvalidRequest("invalid proxy port".into()));
    };

    match daemon.proxy().forward(port, &downstream_path, req).await {
        Ok(response) => response,
        Err(err) => super::error_response(err),
    }
}
