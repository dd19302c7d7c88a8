//! Server-sent-event and WebSocket transports for the PTY and event-bus
//! endpoints. SSE framing follows §6: `event: <type>\ndata: <json>\n\n`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::CatnipError;
use crate::pty::{ControlMessage, OutboundFrame, PtyKey, PtyRegistry, ViewerId};
use crate::state::Daemon;

use super::{error_response, BoxedBody};

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

fn sse_frame(event: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

fn boxed_stream_body<S>(stream: S) -> BoxedBody
where
    S: futures_util::Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + Sync + 'static,
{
    StreamBody::new(stream).map_err(|e: Infallible| match e {}).boxed()
}

/// Detaches the viewer when the response body (and therefore this guard,
/// carried in the stream's `unfold` state) is dropped, i.e. on client
/// disconnect.
struct ViewerGuard {
    registry: Arc<PtyRegistry>,
    key: PtyKey,
    viewer_id: ViewerId,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let key = self.key.clone();
        let viewer_id = self.viewer_id;
        tokio::spawn(async move {
            let _ = registry.detach(&key, viewer_id).await;
        });
    }
}

pub async fn pty_sse(daemon: &Daemon, req: Request<Incoming>) -> Response<BoxedBody> {
    match pty_sse_inner(daemon, req).await {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

async fn pty_sse_inner(daemon: &Daemon, req: Request<Incoming>) -> Result<Response<BoxedBody>, CatnipError> {
    let params = query_params(&req);
    let session = params.get("session").ok_or_else(|| CatnipError::InvalidRequest("missing session".into()))?;
    let agent = params.get("agent").cloned().unwrap_or_else(|| AGENT_PROGRAM.to_string());
    let key = PtyKey { workspace: session.clone(), agent };

    let worktree_id = crate::id::WorktreeId(session.clone());
    let worktree = daemon.worktrees().get(&worktree_id).await?;
    let port = daemon.ports().allocate(&worktree.id).unwrap_or(0);
    let env = vec![("PORT".to_string(), port.to_string())];

    let (viewer_id, _is_writer, queue, notify) = daemon
        .ptys()
        .attach(&key, &worktree.path, AGENT_PROGRAM, &[], &env)
        .await?;
    daemon.ptys().spawn_idle_commit_watcher(key.clone(), worktree_id);
    daemon.ptys().ready(&key, viewer_id).await?;

    if let Some(prompt) = params.get("prompt") {
        let _ = daemon.ptys().force_send(&key, prompt, true).await;
    }

    let guard = ViewerGuard { registry: Arc::clone(daemon.ptys()), key, viewer_id };
    let state = (queue, notify, Some(guard));

    let stream = stream::unfold(state, |(queue, notify, guard)| async move {
        loop {
            let frame = {
                let mut q = queue.lock().await;
                q.pop_front()
            };
            match frame {
                Some(OutboundFrame::Bytes(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let data = serde_json::json!({ "bytes": text }).to_string();
                    return Some((Ok(Frame::data(sse_frame("pty:output", &data))), (queue, notify, guard)));
                }
                Some(OutboundFrame::Control(ctrl)) => {
                    let name = match &ctrl {
                        ControlMessage::PromotedToWriter => "pty:writer",
                        ControlMessage::DemotedToReadOnly => "pty:read-only",
                        ControlMessage::Stalled => "pty:stalled",
                    };
                    let data = serde_json::to_string(&ctrl).unwrap_or_else(|_| "{}".to_string());
                    return Some((Ok(Frame::data(sse_frame(name, &data))), (queue, notify, guard)));
                }
                None => notify.notified().await,
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(boxed_stream_body(stream))
        .unwrap_or_else(|_| error_response(CatnipError::Internal("response build failed".into()))))
}

pub async fn event_bus_sse(daemon: &Daemon, _req: Request<Incoming>) -> Response<BoxedBody> {
    let receiver = daemon.bus().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(Frame::data(sse_frame(event.event.ty, &data))))
            }
            Err(_lagged) => None,
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(boxed_stream_body(stream))
        .unwrap_or_else(|_| error_response(CatnipError::Internal("response build failed".into())))
}

pub async fn pty_websocket(daemon: Daemon, mut req: Request<Incoming>) -> Response<BoxedBody> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(CatnipError::InvalidRequest("expected websocket upgrade".into()));
    }

    let params = query_params(&req);
    let session = match params.get("session") {
        Some(s) => s.clone(),
        None => return error_response(CatnipError::InvalidRequest("missing session".into())),
    };
    let agent = params.get("agent").cloned().unwrap_or_else(|| AGENT_PROGRAM.to_string());

    let (response, websocket) = match hyper_tungstenite::upgrade(&mut req, None) {
        Ok(pair) => pair,
        Err(err) => return error_response(CatnipError::Internal(format!("ws upgrade failed: {err}"))),
    };

    tokio::spawn(async move {
        if let Err(err) = run_pty_websocket(daemon, session, agent, websocket).await {
            tracing::debug!(%err, "pty websocket closed with error");
        }
    });

    let (parts, _) = response.into_parts();
    let body: BoxedBody = http_body_util::Empty::new().map_err(|e: Infallible| match e {}).boxed();
    Response::from_parts(parts, body)
}

async fn run_pty_websocket(
    daemon: Daemon,
    session: String,
    agent: String,
    websocket: hyper_tungstenite::HyperWebsocket,
) -> anyhow::Result<()> {
    let key = PtyKey { workspace: session.clone(), agent };
    let worktree_id = crate::id::WorktreeId(session);
    let worktree = daemon.worktrees().get(&worktree_id).await?;
    let port = daemon.ports().allocate(&worktree.id).unwrap_or(0);
    let env = vec![("PORT".to_string(), port.to_string())];

    let (viewer_id, _is_writer, queue, notify) = daemon
        .ptys()
        .attach(&key, &worktree.path, AGENT_PROGRAM, &[], &env)
        .await?;
    daemon.ptys().spawn_idle_commit_watcher(key.clone(), worktree_id);
    daemon.ptys().ready(&key, viewer_id).await?;

    let mut websocket = websocket.await?;
    let guard = ViewerGuard { registry: Arc::clone(daemon.ptys()), key: key.clone(), viewer_id };

    loop {
        tokio::select! {
            _ = notify.notified() => {
                loop {
                    let frame = { let mut q = queue.lock().await; q.pop_front() };
                    match frame {
                        Some(OutboundFrame::Bytes(bytes)) => {
                            if websocket.send(Message::Binary(bytes.into())).await.is_err() {
                                drop(guard);
                                return Ok(());
                            }
                        }
                        Some(OutboundFrame::Control(ctrl)) => {
                            let text = serde_json::to_string(&ctrl).unwrap_or_default();
                            if websocket.send(Message::Text(text.into())).await.is_err() {
                                drop(guard);
                                return Ok(());
                            }
                        }
                        None => break,
                    }
                }
            }
            msg = futures_util::StreamExt::next(&mut websocket) => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = daemon.ptys().send_input(&key, viewer_id, data.to_vec()).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ctrl) = serde_json::from_str::<serde_json::Value>(&text) {
                            match ctrl.get("type").and_then(|v| v.as_str()) {
                                Some("input") => {
                                    let data = ctrl.get("data").and_then(|v| v.as_str()).unwrap_or_default();
                                    let _ = daemon.ptys().send_input(&key, viewer_id, data.as_bytes().to_vec()).await;
                                }
                                Some("prompt") => {
                                    let data = ctrl.get("data").and_then(|v| v.as_str()).unwrap_or_default();
                                    let submit = ctrl.get("submit").and_then(|v| v.as_bool()).unwrap_or(true);
                                    let _ = daemon.ptys().force_send(&key, data, submit).await;
                                }
                                Some("resize") => {
                                    let cols = ctrl.get("cols").and_then(|v| v.as_u64()).unwrap_or(80) as u16;
                                    let rows = ctrl.get("rows").and_then(|v| v.as_u64()).unwrap_or(24) as u16;
                                    let _ = daemon.ptys().resize(&key, cols, rows).await;
                                }
                                Some("ready") => {
                                    let _ = daemon.ptys().ready(&key, viewer_id).await;
                                }
                                Some("focus") => {
                                    let focused = ctrl.get("focused").and_then(|v| v.as_bool()).unwrap_or(true);
                                    let _ = daemon.ptys().focus(&key, viewer_id, focused).await;
                                }
                                _ => {}
                            }
                        } else {
                            let _ = daemon.ptys().send_input(&key, viewer_id, text.as_bytes().to_vec()).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        drop(guard);
                        return Ok(());
                    }
                    Some(Err(_)) => {
                        drop(guard);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}
