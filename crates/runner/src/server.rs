//! Manifest server
//!
//! Both harness clients fetch `GET /manifest.json` from here before they
//! start. The server lives for the duration of the run.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use steeplechase_common::{Manifest, MANIFEST_PATH};

use crate::error::{RunnerError, RunnerResult};

/// Router serving the manifest
pub fn router(manifest: Manifest) -> Router {
    Router::new()
        .route(MANIFEST_PATH, get(get_manifest))
        .with_state(Arc::new(manifest))
}

async fn get_manifest(State(manifest): State<Arc<Manifest>>) -> Json<Manifest> {
    debug!("Serving manifest with {} test(s)", manifest.len());
    Json(manifest.as_ref().clone())
}

/// Handle to the running manifest server
pub struct ManifestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ManifestServer {
    pub async fn start(listen: SocketAddr, manifest: Manifest) -> RunnerResult<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| RunnerError::Server(format!("cannot bind {}: {}", listen, e)))?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let app = router(manifest);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!("Manifest server stopped: {}", e);
            }
        });

        info!("Serving manifest on http://{}{}", addr, MANIFEST_PATH);
        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the server task
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("Manifest server stopped");
    }
}

impl Drop for ManifestServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Listen address, taking the port from `remote_webserver` when none was given
pub fn listen_addr(listen: SocketAddr, remote_webserver: Option<&str>) -> SocketAddr {
    let remote_port = remote_webserver
        .and_then(|remote| remote.rsplit_once(':'))
        .and_then(|(_, port)| port.parse::<u16>().ok());
    match remote_port {
        Some(port) if listen.port() == 0 => SocketAddr::new(listen.ip(), port),
        _ => listen,
    }
}

/// Base URL the clients use to reach the server
pub fn advertised_url(bound: SocketAddr, remote_webserver: Option<&str>) -> String {
    match remote_webserver {
        Some(remote) => {
            let host = remote.split(':').next().unwrap_or(remote);
            format!("http://{}:{}/", host, bound.port())
        }
        None => format!("http://{}/", bound),
    }
}
