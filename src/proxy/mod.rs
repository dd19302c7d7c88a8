//! Reverse Proxy (Component F): forwards `/<port>/…` to `127.0.0.1:<port>`,
//! rewriting HTML attributes and redirect/cookie paths to keep the prefix.

use std::sync::LazyLock;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_tungstenite::is_upgrade_request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use regex::Regex;

use crate::error::CatnipError;

type BoxedBody = BoxBody<Bytes, hyper::Error>;

static HTML_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(href|src|action|srcset)=(["'])/"#).unwrap());
static BASE_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)<base[^>]*>"#).unwrap());
static HEAD_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)<head[^>]*>"#).unwrap());

pub struct ReverseProxy {
    client: Client<HttpConnector, Incoming>,
}

impl ReverseProxy {
    pub fn new() -> ReverseProxy {
        ReverseProxy {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// Forwards `req` (with the `/<port>` prefix already stripped from
    /// `downstream_path`) to the loopback service on `port`.
    pub async fn forward(
        &self,
        port: u16,
        downstream_path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<BoxedBody>, CatnipError> {
        if is_upgrade_request(&req) {
            return self.forward_websocket(port, downstream_path, req).await;
        }

        let upstream_uri: Uri = format!("http://127.0.0.1:{port}{downstream_path}")
            .parse()
            .map_err(|_| CatnipError::InvalidRequest("malformed upstream path".to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri;
        parts.headers.remove(hyper::header::HOST);
        let upstream_req = Request::from_parts(parts, body);

        let response = self.client.request(upstream_req).await.map_err(|err| {
            tracing::warn!(%port, %err, "upstream dial failed");
            CatnipError::UpstreamDown(format!("127.0.0.1:{port} unreachable"))
        })?;

        let (mut parts, body) = response.into_parts();
        rewrite_location_header(&mut parts.headers, port);
        rewrite_cookie_paths(&mut parts.headers, port);

        let is_html = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/html"));

        if is_html {
            let collected = body.collect().await.map_err(|err| CatnipError::Internal(err.to_string()))?;
            let original = collected.to_bytes();
            let rewritten = rewrite_html(&String::from_utf8_lossy(&original), port);
            parts.headers.remove(hyper::header::CONTENT_LENGTH);
            let body: BoxedBody = Full::new(Bytes::from(rewritten)).map_err(|e| match e {}).boxed();
            Ok(Response::from_parts(parts, body))
        } else {
            let body: BoxedBody = body.map_err(|e| e).boxed();
            Ok(Response::from_parts(parts, body))
        }
    }

    async fn forward_websocket(
        &self,
        port: u16,
        downstream_path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<BoxedBody>, CatnipError> {
        let upstream_addr = format!("127.0.0.1:{port}");
        let mut upstream_stream = tokio::net::TcpStream::connect(&upstream_addr)
            .await
            .map_err(|_| CatnipError::UpstreamDown(upstream_addr.clone()))?;

        let (response, websocket) = hyper_tungstenite::upgrade(req, None)
            .map_err(|err| CatnipError::Internal(format!("ws upgrade failed: {err}")))?;

        let path = downstream_path.to_string();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let handshake = format!(
                "GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
            );
            if upstream_stream.write_all(handshake.as_bytes()).await.is_err() {
                return;
            }

            let mut ws_stream = match websocket.await {
                Ok(ws) => ws,
                Err(_) => return,
            };

            let (mut upstream_read, mut upstream_write) = upstream_stream.split();
            let mut buf = [0u8; 8192];
            loop {
                tokio::select! {
                    n = upstream_read.read(&mut buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                use futures_util::SinkExt;
                                if ws_stream.send(hyper_tungstenite::tungstenite::Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    msg = futures_util::StreamExt::next(&mut ws_stream) => {
                        match msg {
                            Some(Ok(hyper_tungstenite::tungstenite::Message::Binary(data))) => {
                                if upstream_write.write_all(&data).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(hyper_tungstenite::tungstenite::Message::Text(text))) => {
                                if upstream_write.write_all(text.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                }
            }
        });

        let body: BoxedBody = Full::new(Bytes::new()).map_err(|e| match e {}).boxed();
        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, body))
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        ReverseProxy::new()
    }
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<BoxedBody> {
    let payload = serde_json::json!({ "code": code, "message": message }).to_string();
    let body: BoxedBody = Full::new(Bytes::from(payload)).map_err(|e| match e {}).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Rewrites root-relative `href`/`src`/`action`/`srcset` attribute values and
/// injects a `<base>` tag, by regex substitution over attribute text, not a
/// general HTML parse — fixture-driven per the narrow scope of this rewrite.
fn rewrite_html(html: &str, port: u16) -> String {
    let prefix = format!("/{port}");
    let mut buf = String::with_capacity(html.len());
    let mut last_end = 0;
    for caps in HTML_ATTR_RE.captures_iter(html) {
        let m = caps.get(0).unwrap();
        buf.push_str(&html[last_end..m.start()]);
        if html[m.end()..].starts_with('/') {
            // Protocol-relative URL (`//host/...`) — leave untouched.
            buf.push_str(m.as_str());
        } else {
            buf.push_str(&format!("{}={}{}/", &caps[1], &caps[2], prefix));
        }
        last_end = m.end();
    }
    buf.push_str(&html[last_end..]);
    let rewritten = buf;

    if BASE_TAG_RE.is_match(&rewritten) {
        rewritten
    } else if let Some(m) = HEAD_OPEN_RE.find(&rewritten) {
        let insert_at = m.end();
        let mut out = String::with_capacity(rewritten.len() + 64);
        out.push_str(&rewritten[..insert_at]);
        out.push_str(&format!("<base href=\"{prefix}/\">"));
        out.push_str(&rewritten[insert_at..]);
        out
    } else {
        rewritten
    }
}

fn rewrite_location_header(headers: &mut hyper::HeaderMap, port: u16) {
    let Some(location) = headers.get(LOCATION).cloned() else { return };
    let Ok(location_str) = location.to_str() else { return };
    if location_str.starts_with('/') && !location_str.starts_with("//") {
        if let Ok(rewritten) = HeaderValue::from_str(&format!("/{port}{location_str}")) {
            headers.insert(LOCATION, rewritten);
        }
    }
}

fn rewrite_cookie_paths(headers: &mut hyper::HeaderMap, port: u16) {
    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);
    for cookie in cookies {
        let Ok(cookie_str) = cookie.to_str() else { continue };
        let rewritten = if let Some(idx) = cookie_str.to_lowercase().find("path=/") {
            let (before, after) = cookie_str.split_at(idx + "path=".len());
            format!("{before}/{port}{after}")
        } else {
            cookie_str.to_string()
        };
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_root_relative_href() {
        let html = r#"<html><head></head><body><a href="/app.js"></a></body></html>"#;
        let out = rewrite_html(html, 4000);
        assert!(out.contains(r#"href="/4000/app.js""#));
    }

    #[test]
    fn leaves_cross_origin_url_untouched() {
        let html = r#"<a href="https://example.com/x"></a>"#;
        let out = rewrite_html(html, 4000);
        assert_eq!(out, html);
    }

    #[test]
    fn injects_base_tag_when_absent() {
        let html = "<html><head><title>t</title></head></html>";
        let out = rewrite_html(html, 4000);
        assert!(out.contains(r#"<base href="/4000/">"#));
    }

    #[test]
    fn rewrites_root_relative_location_header() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/next"));
        rewrite_location_header(&mut headers, 4000);
        assert_eq!(headers.get(LOCATION).unwrap(), "/4000/next");
    }
}
