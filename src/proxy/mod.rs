//! Reverse proxy: forwards a request to the sandbox's resolved entry point
//! over a single per-request connection built from the low-level
//! `hyper::client::conn::http1` handshake, so the body can be streamed
//! through unbuffered.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::error::RouterError;

/// Forward `req` to `target_base` (e.g. `http://sandbox-7:8080`), rewriting
/// the URI's path and query but preserving everything else.
pub async fn proxy_http(req: Request, target_base: &str) -> Result<Response, RouterError> {
    let authority = authority_of(target_base)?;
    let scheme = if target_base.starts_with("https://") {
        "https"
    } else {
        "http"
    };

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let target_uri = Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| RouterError::InvalidArgument(format!("bad proxy target: {e}")))?;

    debug!(%target_uri, "proxying request");

    let stream = TcpStream::connect(authority.as_str())
        .await
        .map_err(|e| RouterError::sandbox_unreachable(format!("connect to {authority}: {e}")))?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| RouterError::sandbox_unreachable(format!("handshake: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!("proxy connection error: {e}");
        }
    });

    let (parts, body) = req.into_parts();
    let mut proxy_req = hyper::Request::from_parts(parts, body);
    *proxy_req.uri_mut() = target_uri;

    strip_hop_by_hop(proxy_req.headers_mut());

    proxy_req.headers_mut().insert(
        hyper::header::HOST,
        HeaderValue::from_str(&authority).unwrap_or_else(|_| HeaderValue::from_static("sandbox")),
    );

    let resp = sender
        .send_request(proxy_req)
        .await
        .map_err(|e| RouterError::sandbox_unreachable(e.to_string()))?;

    let (parts, body) = resp.into_parts();
    let body = Body::new(body.map_err(|e| std::io::Error::other(e.to_string())).boxed_unsync());
    Ok(Response::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut axum::http::HeaderMap) {
    headers.remove(header::CONNECTION);
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
}

/// `target_base` is `{scheme}://{host}[:{port}]`; this pulls the bare
/// `host[:port]` authority the `TcpStream` and outbound `Host` header need,
/// defaulting the port by scheme (80/443) when the entry point's endpoint
/// omits one — an endpoint like `"http://backend"` (the spec's own S1
/// example) must still resolve to a connectable socket address.
fn authority_of(target_base: &str) -> Result<String, RouterError> {
    let (scheme, rest) = target_base
        .split_once("://")
        .ok_or_else(|| RouterError::InvalidArgument(format!("malformed entry point target: {target_base}")))?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(RouterError::InvalidArgument(format!(
            "malformed entry point target: {target_base}"
        )));
    }

    if host_has_explicit_port(rest) {
        Ok(rest.to_string())
    } else {
        let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        Ok(format!("{rest}:{default_port}"))
    }
}

/// Whether `authority` (a bare `host[:port]`, possibly an IPv6 literal in
/// brackets) already carries an explicit port.
fn host_has_explicit_port(authority: &str) -> bool {
    match authority.strip_prefix('[') {
        // IPv6 literal: "[::1]" has no port, "[::1]:8080" does.
        Some(rest) => rest.split(']').nth(1).is_some_and(|after| after.starts_with(':')),
        None => authority.contains(':'),
    }
}
