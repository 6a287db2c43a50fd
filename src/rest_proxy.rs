//! # Local request proxy.
//!
//! A small always-on loopback service that executes outbound API requests on
//! behalf of every worker process, so network credentials live in exactly one
//! place instead of being duplicated per process. Callers authenticate with
//! the per-run shared secret from their spawn blob; the credential is
//! compared exactly, and unauthenticated requests are rejected with 401
//! before the underlying call is even looked at.
//!
//! The actual HTTP execution against the remote API is the business of the
//! [`RestExecutor`] seam; this module only fronts it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RestProxyConfig;
use crate::error::ProxyError;

/// Largest request body the proxy will buffer.
const BODY_LIMIT: usize = 8 * 1024 * 1024;

/// One outbound API request, opaque to the proxy.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// The upstream's answer, relayed verbatim.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Seam for the external request execution library.
#[async_trait]
pub trait RestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: ProxiedRequest) -> Result<ProxiedResponse, ProxyError>;
}

#[derive(Clone)]
struct ProxyState {
    secret: Arc<str>,
    executor: Arc<dyn RestExecutor>,
}

/// The request-proxy process: a bound loopback listener plus its router.
pub struct RestProxy {
    listener: TcpListener,
    router: Router,
}

impl RestProxy {
    /// Binds the listener. Port 0 picks an ephemeral port; use
    /// [`RestProxy::local_addr`] for the resolved address to hand out.
    pub async fn bind(
        cfg: &RestProxyConfig,
        executor: Arc<dyn RestExecutor>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        let state = ProxyState {
            secret: Arc::from(cfg.authorization_secret.as_str()),
            executor,
        };
        let router = Router::new().fallback(relay).with_state(state);
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        self.listener.local_addr().map_err(ProxyError::from)
    }

    /// Serves until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(ProxyError::from)
    }
}

async fn relay(State(state): State<ProxyState>, request: Request) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|credential| credential == state.secret.as_ref());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let method = request.method().as_str().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let body = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state
        .executor
        .execute(ProxiedRequest { method, path, body })
        .await
    {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, response.body).into_response()
        }
        Err(e) => {
            warn!(error = %e, "proxied request failed upstream");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
