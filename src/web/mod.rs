//! HTTP API Surface (Component H). Thin handlers translating requests into
//! core component calls; shared concerns (auth, request logging, error
//! mapping, ETags) live here rather than duplicated per-handler.

mod handlers;
mod sse;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::CatnipError;
use crate::state::Daemon;

type BoxedBody = BoxBody<Bytes, hyper::Error>;

pub struct LiveServer {
    daemon: Daemon,
    shutting_down: Arc<AtomicBool>,
}

impl LiveServer {
    pub fn new(daemon: Daemon) -> LiveServer {
        LiveServer {
            daemon,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn serve(self, address: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(address).await?;
        install_shutdown_handler(Arc::clone(&self.shutting_down));

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let daemon = self.daemon.clone();
            let shutting_down = Arc::clone(&self.shutting_down);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let daemon = daemon.clone();
                    let shutting_down = Arc::clone(&shutting_down);
                    async move { Ok::<_, Infallible>(dispatch(daemon, shutting_down, peer, req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!(%err, "connection closed with error");
                }
            });
        }
    }
}

fn install_shutdown_handler(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received, draining in-flight requests");
        flag.store(true, Ordering::SeqCst);
    });
}

fn authorized(daemon: &Daemon, req: &Request<Incoming>, peer: SocketAddr) -> bool {
    let Some(expected) = daemon.config().bearer_token.as_deref() else {
        return true;
    };
    if peer.ip().is_loopback() {
        return true;
    }
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn dispatch(
    daemon: Daemon,
    shutting_down: Arc<AtomicBool>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxedBody> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if shutting_down.load(Ordering::SeqCst) && path != "/v1/info" {
        let response = error_response(CatnipError::CodespaceShutdown);
        tracing::info!(%method, %path, status = 502, elapsed_ms = start.elapsed().as_millis() as u64, "request");
        return response;
    }

    if path.starts_with("/v1/") && !authorized(&daemon, &req, peer) {
        let response = error_response(CatnipError::Unauthenticated);
        tracing::info!(%method, %path, status = 401, elapsed_ms = start.elapsed().as_millis() as u64, "request");
        return response;
    }

    let response = route(&daemon, &shutting_down, req).await;
    tracing::info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn route(daemon: &Daemon, shutting_down: &Arc<AtomicBool>, req: Request<Incoming>) -> Response<BoxedBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Routes whose handlers need the full `Request` (body and/or upgrade)
    // are matched first and return directly; the rest run through the
    // `Result<Response, CatnipError>` funnel below.
    match (&method, path.as_str()) {
        (&Method::POST, "/v1/claude/hooks") => return wrap(handlers::claude_hook(daemon, req).await),
        (&Method::POST, "/v1/claude/messages") => return wrap(handlers::claude_messages(daemon, req).await),
        (&Method::POST, "/v1/pty/prompt") => return wrap(handlers::pty_prompt(daemon, req).await),
        (&Method::POST, p) if p.starts_with("/v1/git/worktrees/") && p.ends_with("/pr") => {
            return wrap(handlers::open_pr(daemon, p, req).await);
        }
        (&Method::PUT, p) if p.starts_with("/v1/ports/") => {
            return wrap(handlers::set_port_label(daemon, p, req).await);
        }
        (&Method::GET, "/v1/pty/sse") => return sse::pty_sse(daemon, req).await,
        (&Method::GET, "/v1/pty") => return sse::pty_websocket(daemon.clone(), req).await,
        (&Method::GET, "/v1/events") => return sse::event_bus_sse(daemon, req).await,
        (_, p) if is_proxy_path(p) => return handlers::proxy(daemon, req).await,
        _ => {}
    }

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/v1/info") => handlers::info(daemon, shutting_down),
        (&Method::GET, "/v1/git/worktrees") => handlers::list_worktrees(daemon, &req).await,
        (&Method::GET, p) if p.starts_with("/v1/git/worktrees/") && p.ends_with("/diff") => {
            handlers::worktree_diff(daemon, p).await
        }
        (&Method::GET, p) if p.starts_with("/v1/git/worktrees/") => handlers::get_worktree(daemon, p).await,
        (&Method::DELETE, p) if p.starts_with("/v1/git/worktrees/") => handlers::delete_worktree(daemon, p).await,
        (&Method::POST, p) if p.starts_with("/v1/git/worktrees/") && p.ends_with("/sync") => {
            handlers::sync_worktree(daemon, p).await
        }
        (&Method::GET, "/v1/git/status") => handlers::git_status(daemon).await,
        (&Method::GET, p) if p.starts_with("/v1/git/branches/") => handlers::list_branches(daemon, p).await,
        (&Method::POST, p) if p.starts_with("/v1/git/checkout/") => handlers::checkout(daemon, &req, p).await,
        (&Method::GET, "/v1/sessions/workspace") => handlers::session_for_workspace(daemon, &req).await,
        (&Method::GET, "/v1/claude/sessions") => handlers::claude_sessions(daemon).await,
        (&Method::GET, "/v1/claude/session") => handlers::claude_session(daemon, &req).await,
        (&Method::GET, "/v1/claude/latest-message") => handlers::claude_latest_message(daemon, &req).await,
        (&Method::GET, "/v1/ports") | (&Method::GET, "/v1/ports/mappings") => handlers::list_ports(daemon),
        (&Method::POST, "/v1/pty/start") => handlers::pty_start(daemon, &req).await,
        _ => Err(CatnipError::NotFound(format!("route not found: {path}"))),
    };

    wrap(result)
}

fn is_proxy_path(path: &str) -> bool {
    path.len() > 1
        && !path.starts_with("/v1/")
        && path[1..]
            .split('/')
            .next()
            .is_some_and(|seg| seg.parse::<u16>().is_ok())
}

fn wrap(result: Result<Response<BoxedBody>, CatnipError>) -> Response<BoxedBody> {
    match result {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

pub fn error_response(err: CatnipError) -> Response<BoxedBody> {
    let status = err.status();
    let code = err.code();
    let message = err.to_string();
    json_response(status, serde_json::json!({ "code": code, "message": message }))
}

pub fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxedBody> {
    let payload = serde_json::to_vec(&value).unwrap_or_else(|_| b"{}".to_vec());
    let body: BoxedBody = Full::new(Bytes::from(payload)).map_err(|e| match e {}).boxed();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(body)
        .unwrap_or_else(|_| {
            let fallback: BoxedBody = Full::new(Bytes::from_static(b"{\"code\":\"internal\"}"))
                .map_err(|e| match e {})
                .boxed();
            Response::new(fallback)
        })
}
