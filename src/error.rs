//! Shared error taxonomy. Every component returns a component-specific
//! `thiserror` type that `From`-converts into [`CatnipError`]; HTTP handlers
//! map `CatnipError` into a response via [`CatnipError::into_response`] so the
//! JSON error envelope is identical everywhere, including the reverse proxy's
//! non-HTML error path.

use std::fmt;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::git::GitError;
use crate::pty::PtyError;

#[derive(Debug, thiserror::Error)]
pub enum CatnipError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream down: {0}")]
    UpstreamDown(String),

    #[error("codespace shutting down")]
    CodespaceShutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CatnipError {
    pub fn code(&self) -> &'static str {
        match self {
            CatnipError::InvalidRequest(_) => "invalid_request",
            CatnipError::Unauthenticated => "unauthenticated",
            CatnipError::NotFound(_) => "not_found",
            CatnipError::Conflict(_) => "conflict",
            CatnipError::Timeout(_) => "timeout",
            CatnipError::UpstreamDown(_) => "upstream_down",
            CatnipError::CodespaceShutdown => "codespace_shutdown",
            CatnipError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CatnipError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CatnipError::Unauthenticated => StatusCode::UNAUTHORIZED,
            CatnipError::NotFound(_) => StatusCode::NOT_FOUND,
            CatnipError::Conflict(_) => StatusCode::CONFLICT,
            CatnipError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            CatnipError::UpstreamDown(_) | CatnipError::CodespaceShutdown => {
                StatusCode::BAD_GATEWAY
            }
            CatnipError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            code: &'a str,
            message: String,
        }

        let status = self.status();
        let body = Envelope {
            code: self.code(),
            message: self.to_string(),
        };

        let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .unwrap_or_else(|_| {
                Response::new(Full::new(Bytes::from_static(b"{\"code\":\"internal\"}")))
            })
    }
}

impl From<GitError> for CatnipError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Conflict(msg) => CatnipError::Conflict(msg),
            GitError::Auth(msg) => CatnipError::Conflict(format!("authentication required: {msg}")),
            GitError::Network(msg) => CatnipError::UpstreamDown(msg),
            GitError::NotFound(msg) => CatnipError::NotFound(msg),
            GitError::Other(msg) => CatnipError::Internal(msg),
        }
    }
}

impl From<PtyError> for CatnipError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::NotReady => CatnipError::Timeout("pty session not ready".into()),
            PtyError::NotFound(key) => CatnipError::NotFound(format!("pty session {key} not found")),
            PtyError::Io(err) => CatnipError::Internal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for CatnipError {
    fn from(err: std::io::Error) -> Self {
        CatnipError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CatnipError {
    fn from(err: serde_json::Error) -> Self {
        CatnipError::InvalidRequest(err.to_string())
    }
}

/// Blanket helper for components that just need a quick "unreadable input" error.
pub fn invalid<T: fmt::Display>(msg: T) -> CatnipError {
    CatnipError::InvalidRequest(msg.to_string())
}
