use std::{convert::Infallible, future, net::SocketAddr, time::Duration};

use bytes::Bytes;
use chrono::SecondsFormat;
use http_body_util::Full;
use hyper::{body::Incoming, header, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{RuleSetCache, SharedRuleSetCache};

/// Maximum size of HTTP request headers.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const ROUTE_PREFIX: &str = "/rules/";

/// Metadata about the latest version of a ruleset. Polled by the data plane
/// to decide whether a full fetch is needed.
#[derive(serde::Serialize)]
struct LatestResponse<'a> {
    uuid: &'a str,
    timestamp: String,
}

/// Serves the read-only ruleset cache endpoints until the shutdown drain
/// fires, then drains in-flight requests for a bounded grace period.
///
/// The server runs on every replica: its output is a function of cache state
/// only, so the data plane gets local fanout without leader coordination.
pub async fn serve(
    addr: SocketAddr,
    cache: SharedRuleSetCache,
    drain: drain::Watch,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "ruleset cache server listening");

    let graceful = GracefulShutdown::new();
    let signaled = drain.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, client) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };
                debug!(%client, "accepted connection");

                let cache = cache.clone();
                let service = service_fn(move |req: Request<Incoming>| {
                    // Request bodies are never read.
                    let rsp = route(&cache, req.method(), req.uri().path());
                    future::ready(Ok::<_, Infallible>(rsp))
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(READ_HEADER_TIMEOUT)
                    .max_buf_size(MAX_HEADER_SIZE)
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(error) = conn.await {
                        debug!(%error, "connection error");
                    }
                });
            }

            handle = &mut signaled => {
                info!("shutting down ruleset cache server");
                let shutdown = tokio::time::timeout(SHUTDOWN_GRACE, graceful.shutdown());
                if handle.release_after(shutdown).await.is_err() {
                    warn!(grace = ?SHUTDOWN_GRACE, "graceful shutdown timed out, closing connections");
                }
                return Ok(());
            }
        }
    }
}

// The key segment is opaque to routing: it contains a `/` (the RuleSet's
// `namespace/name`), so only the prefix and the optional trailing `/latest`
// are interpreted.
fn route(cache: &RuleSetCache, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let Some(key) = path.strip_prefix(ROUTE_PREFIX) else {
        return text_response(StatusCode::NOT_FOUND, "Not found");
    };
    if key.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Instance name required");
    }

    if let Some(key) = key.strip_suffix("/latest") {
        return handle_latest(cache, key);
    }
    handle_rules(cache, key)
}

fn handle_latest(cache: &RuleSetCache, key: &str) -> Response<Full<Bytes>> {
    let Some(entry) = cache.get(key) else {
        return text_response(StatusCode::NOT_FOUND, "Instance not found");
    };

    json_response(&LatestResponse {
        uuid: &entry.uuid,
        timestamp: entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
    })
}

fn handle_rules(cache: &RuleSetCache, key: &str) -> Response<Full<Bytes>> {
    let Some(entry) = cache.get(key) else {
        return text_response(StatusCode::NOT_FOUND, "Instance not found");
    };

    debug!(%key, uuid = %entry.uuid, "serving rules from cache");
    json_response(&entry)
}

fn json_response<T: serde::Serialize>(body: &T) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "failed to encode response");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Encoding failure");
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("cache response must be valid")
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(format!("{message}\n"))))
        .expect("error response must be valid")
}
