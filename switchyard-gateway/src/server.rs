//! Inbound connection handling and error mapping.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::forward::Forwarder;
use switchyard_core::domain::route::SharedRoutingTable;
use switchyard_core::error::GatewayError;

/// Shared state every connection handler sees.
pub struct GatewayState {
    /// The active routing table.
    pub table: Arc<SharedRoutingTable>,
    /// The forwarding engine.
    pub forwarder: Arc<Forwarder>,
}

/// Starts the gateway on the given address, terminating TLS when an
/// acceptor is configured.
pub async fn start_server(
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    state: Arc<GatewayState>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, tls = tls_acceptor.is_some(), "gateway listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        if let Some(acceptor) = &tls_acceptor {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);
                        let service = service_fn(move |req| handle_request(req, state.clone()));
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                        {
                            tracing::debug!(error = %err, "connection error");
                        }
                    }
                    Err(err) => tracing::debug!(error = %err, "tls handshake failed"),
                }
            });
        } else {
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(move |req| handle_request(req, state.clone()));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(error = %err, "connection error");
                }
            });
        }
    }
}

/// Routes and forwards one inbound request.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let host = host_for_routing(&parts);

    let table = state.table.snapshot();
    let Some(route) = table.match_route(parts.uri.path(), &host) else {
        return Ok(error_response(&GatewayError::RouteNotFound));
    };

    // Buffered up front so a connection-level retry can replay it.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!(error = %err, "inbound body aborted");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    match state
        .forwarder
        .forward(route, parts.method, &parts.uri, &parts.headers, body)
        .await
    {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(err) => {
            tracing::warn!(
                kind = err.kind(),
                error = %err,
                path = %parts.uri.path(),
                "forwarding failed"
            );
            Ok(error_response(&err))
        }
    }
}

fn host_for_routing(parts: &hyper::http::request::Parts) -> String {
    parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn full_body(data: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(full_body(message.to_string()))
        .unwrap()
}

/// Maps a gateway failure to its client-visible JSON response.
pub fn error_response(err: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "error": err.kind(),
        "message": err.to_string(),
    })
    .to_string();

    Response::builder()
        .status(err.status_code())
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .unwrap()
}
