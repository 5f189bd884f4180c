use crate::registry::{normalize_domain, ServiceRegistry};
use crate::reload::{ReloadCommand, ReloadSender};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the multiplexer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Loopback admin API: backend listing and reload requests
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    reload_tx: ReloadSender,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        reload_tx: ReloadSender,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            reload_tx,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept admin connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = AdminState {
                                registry: Arc::clone(&self.registry),
                                reload_tx: self.reload_tx.clone(),
                                auth_token: Arc::clone(&self.auth_token),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Per-connection handles shared with every request
#[derive(Clone)]
struct AdminState {
    registry: Arc<ServiceRegistry>,
    reload_tx: ReloadSender,
    auth_token: Arc<String>,
}

async fn serve_admin_connection<S>(stream: S, state: AdminState) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, hyper::Error>(handle_admin_request(&req, &state)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn handle_admin_request<B>(req: &Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/backends") => {
            if !check_auth(req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let backends = state.registry.list();
            let response_body = serde_json::json!({
                "count": backends.len(),
                "backends": backends,
            });
            json_response(StatusCode::OK, response_body.to_string())
        }

        // Restart one backend: POST /reload/{domain}
        (&Method::POST, path) if path.starts_with("/reload/") => {
            if !check_auth(req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let Some(domain) = normalize_domain(path.strip_prefix("/reload/").unwrap_or("")) else {
                return response(StatusCode::BAD_REQUEST, "missing domain");
            };
            if state.registry.get(&domain).is_none() {
                return response(StatusCode::NOT_FOUND, "unknown domain");
            }
            match state.reload_tx.try_send(ReloadCommand::new(domain.as_str())) {
                Ok(()) => {
                    info!(domain, "Reload requested via admin API");
                    response(StatusCode::ACCEPTED, "reload queued")
                }
                Err(TrySendError::Full(_)) => {
                    warn!(domain, "Reload queue full");
                    response(StatusCode::SERVICE_UNAVAILABLE, "reload queue full")
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(domain, "Reload consumer not running");
                    response(StatusCode::SERVICE_UNAVAILABLE, "reload unavailable")
                }
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
