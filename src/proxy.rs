use crate::error::{text_error_response, unmapped_host_response, ProxyErrorCode, UnmappedUpgrade};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::ServiceRegistry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Type of every response the router produces
pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// The public listener: routes each request by Host header to the backend
/// registered for that domain.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, registry, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, pool, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request.
///
/// An `Err` is only returned for upgrade requests to unmapped hosts; hyper
/// then drops the connection without writing a response.
async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<ServiceRegistry>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, UnmappedUpgrade> {
    let upgrade = is_upgrade_request(&req);
    let host = request_host(&req);

    let Some((hostname, port)) = host.as_deref().and_then(|h| registry.route(h)) else {
        let host = host.unwrap_or_default();
        if upgrade {
            debug!(host, "Closing upgrade for unmapped host");
            return Err(UnmappedUpgrade { host });
        }
        debug!(host, method = %req.method(), uri = %req.uri(), "No backend mapped for host");
        return Ok(unmapped_host_response(&host));
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, port, method = %req.method(), uri = %req.uri(), request_id, "Routing request");

    if upgrade {
        return Ok(handle_upgrade(req, &pool, hostname, port, request_id).await);
    }

    match pool.send_request(req, port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(hostname, port, request_id, error = %e, "Failed to forward request");
            Ok(connection_failed(&hostname))
        }
    }
}

/// Host the request is addressed to, exactly as the client sent it.
/// Falls back to the URI authority for HTTP/2 requests.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    match req.headers().get(hyper::header::HOST) {
        Some(host) => Some(String::from_utf8_lossy(host.as_bytes()).into_owned()),
        None => req.uri().authority().map(|a| a.as_str().to_string()),
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn connection_failed(hostname: &str) -> ProxyResponse {
    text_error_response(
        ProxyErrorCode::ConnectionFailed,
        format!("Backend for {} is unreachable", hostname),
    )
}

/// Client-facing `101` built from the backend's, without body framing headers
fn switching_protocols_response<B>(backend: &Response<B>) -> Result<ProxyResponse, hyper::http::Error> {
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in backend.headers() {
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            continue;
        }
        response = response.header(name, value);
    }
    response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
}

/// Forward an upgrade handshake and then splice both streams together.
///
/// A backend that declines the upgrade has its response, body included,
/// passed back to the client.
async fn handle_upgrade(
    mut req: Request<Incoming>,
    pool: &ConnectionPool,
    hostname: String,
    port: u16,
    request_id: String,
) -> ProxyResponse {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut backend_response = match pool.send_upgrade(req, port).await {
        Ok(response) => response,
        Err(e) => {
            warn!(hostname, port, error = %e, "Failed to send upgrade request to backend");
            return connection_failed(&hostname);
        }
    };

    if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(hostname, status = %backend_response.status(), "Backend declined upgrade");
        let (parts, body) = backend_response.into_parts();
        return Response::from_parts(parts, body.boxed());
    }

    let response = match switching_protocols_response(&backend_response) {
        Ok(response) => response,
        Err(e) => {
            warn!(hostname, error = %e, "Invalid upgrade response headers from backend");
            return connection_failed(&hostname);
        }
    };
    let backend_upgrade = hyper::upgrade::on(&mut backend_response);

    debug!(hostname, request_id, "Upgrade accepted by backend");

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client, backend)) => {
                forward_bidirectional(client, backend, &hostname, &request_id).await;
            }
            Err(e) => {
                warn!(hostname, request_id, error = %e, "Failed to upgrade connections");
            }
        }
    });

    response
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(
    client: Upgraded,
    backend: Upgraded,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
