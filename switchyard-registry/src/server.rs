//! HTTP server exposing the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::registry::{HeartbeatAck, Registry};
use crate::wire::{
    ErrorResponse, HeartbeatResponse, HeartbeatStatus, QueryResponse, RegisterRequest,
    RegisterResponse,
};
use switchyard_core::domain::endpoint::ServiceName;

/// How long a watch request is held open before the current view is
/// returned unchanged.
const WATCH_HOLD: Duration = Duration::from_secs(25);

/// Starts the registry server on the given address.
pub async fn start_server(addr: SocketAddr, registry: Arc<Registry>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "registry listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, registry.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %err, "registry connection error");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let after = parse_after(parts.uri.query());
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&parts.method, segments.as_slice()) {
        (&Method::POST, ["services", service]) => {
            let service = ServiceName::new(*service);
            let raw = body.collect().await?.to_bytes();
            match serde_json::from_slice::<RegisterRequest>(&raw) {
                Ok(register) => {
                    let lease = registry.register(service, register.endpoint);
                    json(
                        StatusCode::OK,
                        &RegisterResponse {
                            lease_id: lease.id,
                            lease_ttl_ms: registry.lease_ttl().as_millis() as u64,
                        },
                    )
                }
                Err(err) => error_json(StatusCode::BAD_REQUEST, &err.to_string()),
            }
        }
        (&Method::GET, ["services", service]) => {
            let service = ServiceName::new(*service);
            let view = registry.view(&service);
            json(
                StatusCode::OK,
                &QueryResponse {
                    service,
                    version: view.version,
                    endpoints: view.endpoints,
                },
            )
        }
        (&Method::GET, ["services", service, "watch"]) => {
            let service = ServiceName::new(*service);
            watch(&registry, service, after).await
        }
        (&Method::PUT, ["leases", lease_id]) => {
            let status = match registry.heartbeat(lease_id) {
                HeartbeatAck::Renewed => HeartbeatStatus::Renewed,
                HeartbeatAck::Expired => HeartbeatStatus::Expired,
            };
            json(StatusCode::OK, &HeartbeatResponse { status })
        }
        (&Method::DELETE, ["leases", lease_id]) => {
            // A missing lease still counts as deregistered: expiry already
            // cleaned it up.
            registry.deregister(lease_id);
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Holds the request open until the service view moves past `after`, or
/// answers with the current view once the hold elapses.
async fn watch(registry: &Registry, service: ServiceName, after: u64) -> Response<Full<Bytes>> {
    let mut rx = registry.watch(&service);
    let hold = tokio::time::sleep(WATCH_HOLD);
    tokio::pin!(hold);

    loop {
        let view = rx.borrow_and_update().clone();
        if view.version > after {
            return json(
                StatusCode::OK,
                &QueryResponse {
                    service,
                    version: view.version,
                    endpoints: view.endpoints,
                },
            );
        }

        tokio::select! {
            _ = &mut hold => {
                let view = registry.view(&service);
                return json(
                    StatusCode::OK,
                    &QueryResponse {
                        service,
                        version: view.version,
                        endpoints: view.endpoints,
                    },
                );
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    let view = registry.view(&service);
                    return json(
                        StatusCode::OK,
                        &QueryResponse {
                            service,
                            version: view.version,
                            endpoints: view.endpoints,
                        },
                    );
                }
            }
        }
    }
}

fn parse_after(query: Option<&str>) -> u64 {
    query
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| pair.strip_prefix("after="))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}
