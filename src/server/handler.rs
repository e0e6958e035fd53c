//! HTTP/1.1 connection handling

use super::dispatch::{text_response, Dispatcher, ResponseBody};
use crate::error::{ErrorResponse, GatewayError};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve one accepted connection until it closes
///
/// Every request gets a child of `requests` as its cancellation token. The token is
/// also cancelled when the request future is dropped, which happens when the
/// client goes away. Once `drain` is cancelled the connection finishes the request
/// in flight and then closes instead of waiting for the next one.
pub async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    requests: CancellationToken,
    drain: CancellationToken,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        let cancel = requests.child_token();
        async move { Ok::<_, Infallible>(handle_request(&dispatcher, req, cancel, addr).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);
    let draining = drain.cancelled();
    tokio::pin!(draining);
    let mut closing = false;

    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = &mut draining, if !closing => {
                debug!("Closing connection from {} after in-flight request", addr);
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    };

    if let Err(e) = result {
        if !e.is_incomplete_message() {
            debug!("HTTP connection error from {}: {}", addr, e);
        }
    }
}

/// Read the body and dispatch, turning errors into plain-text responses
pub async fn handle_request(
    dispatcher: &Dispatcher,
    req: Request<Incoming>,
    cancel: CancellationToken,
    addr: SocketAddr,
) -> Response<ResponseBody> {
    let _guard = cancel.clone().drop_guard();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (parts, body) = req.into_parts();
    let collected = tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = body.collect() => result
            .map(|collected| collected.to_bytes())
            .map_err(|e| GatewayError::InvalidRequest(format!("Failed to read request body: {}", e))),
    };

    let result = match collected {
        Ok(bytes) => dispatcher.dispatch(Request::from_parts(parts, bytes), &cancel).await,
        Err(e) => Err(e),
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => error_response(&e),
    };

    info!(
        client = %addr,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Map a gateway error to its response
pub fn error_response(err: &GatewayError) -> Response<ResponseBody> {
    let ErrorResponse { status, message } = ErrorResponse::from(err);
    match err {
        GatewayError::RouteNotFound(_) => debug!("{}", err),
        GatewayError::Cancelled => debug!("Request cancelled"),
        _ => warn!("Request failed: {}", err),
    }

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, &message)
}
