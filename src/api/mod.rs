//! Endpoints HTTP que iniciam, sondam, acordam e param workers.

pub mod error;
mod handlers;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::{Router, routing::post};

use crate::coordinator::Coordinator;
use crate::loopback::LoopbackResolver;
use crate::worker::WorkerDeps;

pub use handlers::{NoopRequest, WorkerRequest};

/// Estado compartilhado por todos os endpoints.
#[derive(Clone)]
pub struct AppState {
    pub workers: WorkerDeps,
    pub coordinator: Arc<Coordinator>,
    /// Ausente quando nenhuma url de endpoint está configurada.
    pub resolver: Option<Arc<LoopbackResolver>>,
    pub secret: Arc<str>,
    /// `/wakeup` é recusado enquanto ausente.
    pub admin_token: Option<Arc<str>>,
}

/// Endereço do par conectado, quando o servidor o registra.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(PeerAddr(peer))
    }
}

/// Rotas montadas sob `prefix` (por exemplo `/bg/v1`).
pub fn router(state: AppState, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/startWorker", post(handlers::start_worker))
        .route("/noop", post(handlers::noop))
        .route("/wakeup", post(handlers::wakeup))
        .route("/stopWorker", post(handlers::stop_worker));

    let prefix = normalize_prefix(prefix);
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    };
    app.with_state(state)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
