//! HTTP surface: the websocket upgrade on `/`, a health probe, and the two
//! ways of serving the router (plain TCP or TLS).

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::WebSocket},
    http::Request,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::TlsPaths;
use crate::connection::run_connection;
use crate::hub::Hub;
use crate::stats::CoordinatorStatsSnapshot;

pub fn build_router(hub: Hub) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(hub): State<Hub>,
) -> Response {
    info!(%remote, "Websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, remote, hub))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, hub: Hub) {
    let (sink, stream) = socket.split();
    let id = run_connection(stream, sink, &hub).await;
    debug!(conn_id = %id, %remote, "Connection finished");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: usize,
    pub coordinator: CoordinatorStatsSnapshot,
}

/// Health check endpoint: live connection count and coordinator counters.
async fn health_handler(State(hub): State<Hub>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok".to_string(),
        connections: hub.connection_count().await,
        coordinator: hub.stats(),
    })
}

/// Serve `router` over plain TCP until `shutdown` resolves.
pub async fn serve_plain<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")
}

/// Read the certificate chain and private key into a rustls server config.
pub fn load_tls_config(paths: &TlsPaths) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = File::open(&paths.cert_path).with_context(|| {
        format!(
            "Failed to open certificate chain {}",
            paths.cert_path.display()
        )
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {}", paths.cert_path.display()))?;
    if certs.is_empty() {
        bail!("No certificates found in {}", paths.cert_path.display());
    }

    let key_file = File::open(&paths.key_path)
        .with_context(|| format!("Failed to open private key {}", paths.key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse {}", paths.key_path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", paths.key_path.display()))?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to select TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Certificate and private key do not form a usable pair")?;
    // Websocket upgrades need HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Serve `router` over TLS until `shutdown` resolves.
///
/// Each accepted socket gets its own task for the handshake and the HTTP
/// connection, so a slow handshake never stalls the accept loop.
pub async fn serve_tls<F>(
    listener: TcpListener,
    router: Router,
    tls: Arc<rustls::ServerConfig>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let acceptor = TlsAcceptor::from(tls);
    tokio::pin!(shutdown);

    loop {
        let (tcp, remote) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo(remote));
                router.clone().oneshot(req)
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(%remote, error = %e, "Connection error");
            }
        });
    }

    info!("Stopped accepting connections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubSettings;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const FAKE_CERT: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    #[test]
    fn tls_missing_cert_file() {
        let paths = TlsPaths {
            cert_path: PathBuf::from("/nonexistent/fullchain.pem"),
            key_path: PathBuf::from("/nonexistent/privkey.pem"),
        };
        let err = load_tls_config(&paths).unwrap_err();
        assert!(err.to_string().contains("Failed to open certificate chain"));
    }

    #[test]
    fn tls_empty_cert_chain() {
        let cert = pem_file("");
        let key = pem_file("");
        let paths = TlsPaths {
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
        };
        let err = load_tls_config(&paths).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn tls_missing_private_key() {
        let cert = pem_file(FAKE_CERT);
        let key = pem_file("not a key\n");
        let paths = TlsPaths {
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
        };
        let err = load_tls_config(&paths).unwrap_err();
        assert!(err.to_string().contains("No private key found"));
    }

    #[test]
    fn tls_missing_key_file() {
        let cert = pem_file(FAKE_CERT);
        let paths = TlsPaths {
            cert_path: cert.path().to_path_buf(),
            key_path: PathBuf::from("/nonexistent/privkey.pem"),
        };
        let err = load_tls_config(&paths).unwrap_err();
        assert!(err.to_string().contains("Failed to open private key"));
    }

    #[tokio::test]
    async fn health_reports_connection_count() {
        let hub = Hub::start(HubSettings::default()).unwrap();
        let response = health_handler(State(hub)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
        assert_eq!(health.coordinator.ticks, 0);
    }
}
