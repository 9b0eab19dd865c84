//! Proxies one inbound request to a resolved backend.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::forward::pool::ConnectionPool;
use crate::resolve::EndpointResolver;
use switchyard_core::balancer::SelectionPolicy;
use switchyard_core::domain::endpoint::Endpoint;
use switchyard_core::domain::route::Route;
use switchyard_core::error::GatewayError;
use switchyard_core::health::{HealthTracker, Outcome};

/// Delay between attempts after a connection-level failure.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Headers that belong to one hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

enum SendError {
    /// Nothing was written to a live connection; the attempt may be retried.
    Connect(String),
    /// The request reached a live connection; retrying risks duplicate
    /// side effects, including after any response byte was received.
    Exchange(String),
}

/// Executes proxied calls: resolution, selection, rewrite, deadline,
/// retry-with-backoff on connection-level failure.
pub struct Forwarder {
    resolver: Arc<dyn EndpointResolver>,
    health: Arc<HealthTracker>,
    policy: Arc<dyn SelectionPolicy>,
    pool: ConnectionPool,
}

impl Forwarder {
    /// Creates a forwarder over the given resolution and selection stack.
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        health: Arc<HealthTracker>,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Self {
        Self {
            resolver,
            health,
            policy,
            pool: ConnectionPool::new(),
        }
    }

    /// Forwards an inbound request according to the route's policy.
    ///
    /// The body is pre-buffered by the server so a retried attempt can
    /// replay it byte-for-byte.
    pub async fn forward(
        &self,
        route: &Route,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, GatewayError> {
        let deadline = Instant::now() + Duration::from_millis(route.timeout_ms);

        let candidates = self.resolver.resolve(&route.service).await?;
        let healthy = self.health.healthy(&candidates);
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyEndpoint(route.service.to_string()));
        }

        let path_and_query = rewritten_path_and_query(route, uri);
        let max_attempts = if is_idempotent(&method) {
            route.max_retries.saturating_add(1)
        } else {
            1
        };

        let mut previous: Option<Endpoint> = None;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::UpstreamTimeout(route.timeout_ms));
            }
            let remaining = deadline - now;

            // A retry prefers an endpoint other than the one that failed.
            let pick_from: Vec<Endpoint> = match &previous {
                Some(failed) if healthy.len() > 1 => healthy
                    .iter()
                    .filter(|ep| ep.instance_id != failed.instance_id)
                    .cloned()
                    .collect(),
                _ => healthy.clone(),
            };
            let endpoint = self
                .policy
                .select(&route.service, &pick_from)
                .ok_or_else(|| GatewayError::NoHealthyEndpoint(route.service.to_string()))?;

            self.policy.on_dispatch(&endpoint);
            let started = Instant::now();
            let outcome = time::timeout(
                remaining,
                self.try_send(&endpoint, &method, &path_and_query, headers, body.clone()),
            )
            .await;

            match outcome {
                Err(_) => {
                    self.policy.on_complete(&endpoint, None);
                    self.health.report(&endpoint, Outcome::ConnectFailure);
                    return Err(GatewayError::UpstreamTimeout(route.timeout_ms));
                }
                Ok(Ok(response)) => {
                    self.policy.on_complete(&endpoint, Some(started.elapsed()));
                    self.health.report(&endpoint, Outcome::Success);
                    if attempt > 0 {
                        tracing::debug!(
                            endpoint = %endpoint,
                            attempt,
                            "retry succeeded"
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(SendError::Connect(message))) => {
                    self.policy.on_complete(&endpoint, None);
                    self.health.report(&endpoint, Outcome::ConnectFailure);
                    tracing::debug!(endpoint = %endpoint, error = %message, "connect failed");
                    previous = Some(endpoint);
                    last_error = message;
                }
                Ok(Err(SendError::Exchange(message))) => {
                    self.policy.on_complete(&endpoint, None);
                    self.health.report(&endpoint, Outcome::ConnectFailure);
                    return Err(GatewayError::UpstreamUnavailable(message));
                }
            }

            if attempt + 1 < max_attempts {
                if Instant::now() + RETRY_DELAY >= deadline {
                    return Err(GatewayError::UpstreamTimeout(route.timeout_ms));
                }
                time::sleep(RETRY_DELAY).await;
            }
        }

        Err(GatewayError::UpstreamUnavailable(last_error))
    }

    async fn try_send(
        &self,
        endpoint: &Endpoint,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, SendError> {
        let authority = endpoint.authority();

        let mut sender = match self.pool.try_pop(&authority) {
            Some(sender) => sender,
            None => {
                let stream = TcpStream::connect(&authority)
                    .await
                    .map_err(|err| SendError::Connect(err.to_string()))?;
                let io = TokioIo::new(stream);
                let (sender, connection) = http1::handshake(io)
                    .await
                    .map_err(|err| SendError::Connect(err.to_string()))?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::debug!(error = %err, "upstream connection closed");
                    }
                });
                sender
            }
        };

        let mut request = Request::builder()
            .method(method.clone())
            .uri(path_and_query)
            .body(Full::new(body))
            .map_err(|err| SendError::Connect(err.to_string()))?;
        copy_headers(headers, request.headers_mut(), &authority);

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| SendError::Exchange(err.to_string()))?;

        self.pool.push(authority, sender);
        Ok(response)
    }
}

/// Retry eligibility per RFC 9110 idempotent methods.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

fn rewritten_path_and_query(route: &Route, uri: &Uri) -> String {
    let path = route.rewrite.apply(uri.path());
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

fn copy_headers(inbound: &HeaderMap, outbound: &mut HeaderMap, authority: &str) {
    for (name, value) in inbound {
        let lower = name.as_str();
        if lower == "host" || HOP_BY_HOP.contains(&lower) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    if let Ok(host) = HeaderValue::from_str(authority) {
        outbound.insert(HOST, host);
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::resolve::static_list::StaticListResolver;
    use switchyard_core::balancer::RoundRobin;
    use switchyard_core::domain::endpoint::ServiceName;
    use switchyard_core::domain::route::RewriteRule;

    use super::*;

    /// Backend answering 200 with a fixed body and counting requests.
    async fn spawn_backend(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counting = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let io = TokioIo::new(stream);
                let counting = counting.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let counting = counting.clone();
                        async move {
                            counting.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                        }
                    });
                    let _ = server_http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });
        (addr, hits)
    }

    /// An address with nothing listening: connections are refused.
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// Backend that accepts, reads the request, and slams the connection.
    async fn spawn_resetting_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                drop(stream);
            }
        });
        addr
    }

    /// Backend that accepts and never answers.
    async fn spawn_black_hole() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });
        addr
    }

    fn route(service: &str, timeout_ms: u64, max_retries: u32) -> Route {
        Route {
            prefix: "/api/vet".to_string(),
            host: None,
            service: ServiceName::new(service),
            timeout_ms,
            max_retries,
            priority: 0,
            rewrite: RewriteRule {
                strip_prefix: Some("/api/vet".to_string()),
                prepend: None,
            },
        }
    }

    fn forwarder_over(
        service: &str,
        endpoints: Vec<Endpoint>,
    ) -> (Forwarder, Arc<HealthTracker>) {
        let mut services = std::collections::BTreeMap::new();
        services.insert(ServiceName::new(service), endpoints);
        let health = Arc::new(HealthTracker::default());
        let forwarder = Forwarder::new(
            Arc::new(StaticListResolver::new(services)),
            health.clone(),
            Arc::new(RoundRobin::default()),
        );
        (forwarder, health)
    }

    fn ep(addr: SocketAddr, id: &str) -> Endpoint {
        Endpoint::new(addr.ip().to_string(), addr.port(), id)
    }

    #[tokio::test]
    async fn refused_endpoint_retries_on_the_other_one() {
        let refused = refused_addr().await;
        let (live, hits) = spawn_backend("ok").await;
        // Instance ids order the rotation so the refused endpoint goes first.
        let (forwarder, _) =
            forwarder_over("vets-service", vec![ep(refused, "a"), ep(live, "b")]);

        let response = forwarder
            .forward(
                &route("vets-service", 2_000, 2),
                Method::GET,
                &"/api/vet/1".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        // Exactly one retry: the live endpoint saw exactly one request.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_idempotent_methods_are_never_retried() {
        let refused = refused_addr().await;
        let (live, hits) = spawn_backend("ok").await;
        let (forwarder, _) =
            forwarder_over("vets-service", vec![ep(refused, "a"), ep(live, "b")]);

        let err = forwarder
            .forward(
                &route("vets-service", 2_000, 2),
                Method::POST,
                &"/api/vet".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_retry_once_the_exchange_has_begun() {
        let resetting = spawn_resetting_backend().await;
        let (live, hits) = spawn_backend("ok").await;
        let (forwarder, _) =
            forwarder_over("vets-service", vec![ep(resetting, "a"), ep(live, "b")]);

        let err = forwarder
            .forward(
                &route("vets-service", 2_000, 2),
                Method::GET,
                &"/api/vet/1".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();

        // The request reached a live connection, so even an idempotent
        // method must not be re-sent elsewhere.
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_unhealthy_rejects_without_an_upstream_call() {
        let (live_a, hits_a) = spawn_backend("a").await;
        let (live_b, hits_b) = spawn_backend("b").await;
        let a = ep(live_a, "a");
        let b = ep(live_b, "b");
        let (forwarder, health) = forwarder_over("vets-service", vec![a.clone(), b.clone()]);

        for endpoint in [&a, &b] {
            for _ in 0..3 {
                health.report(endpoint, Outcome::ConnectFailure);
            }
        }

        let err = forwarder
            .forward(
                &route("vets-service", 2_000, 2),
                Method::GET,
                &"/api/vet/1".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::NoHealthyEndpoint(_)));
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let black_hole = spawn_black_hole().await;
        let (forwarder, _) = forwarder_over("vets-service", vec![ep(black_hole, "a")]);

        let err = forwarder
            .forward(
                &route("vets-service", 100, 0),
                Method::GET,
                &"/api/vet/1".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamTimeout(100)));
    }

    #[tokio::test]
    async fn unknown_service_fails_resolution() {
        let (forwarder, _) = forwarder_over("vets-service", vec![]);

        let err = forwarder
            .forward(
                &route("ghost-service", 1_000, 0),
                Method::GET,
                &"/api/vet".parse().unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Resolution(_)));
    }

    #[test]
    fn rewrite_preserves_the_query_string() {
        let uri: Uri = "/api/vet/1?fields=name".parse().unwrap();
        assert_eq!(
            rewritten_path_and_query(&route("vets-service", 1_000, 0), &uri),
            "/1?fields=name"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("x-request-id", HeaderValue::from_static("r-1"));
        inbound.insert("host", HeaderValue::from_static("edge.example.com"));

        let mut outbound = HeaderMap::new();
        copy_headers(&inbound, &mut outbound, "10.0.0.1:8081");

        assert!(outbound.get("connection").is_none());
        assert_eq!(outbound.get("x-request-id").unwrap(), "r-1");
        assert_eq!(outbound.get("host").unwrap(), "10.0.0.1:8081");
    }
}
