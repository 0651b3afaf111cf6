use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use miette::IntoDiagnostic;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::gate::config::ChainConfig;
use crate::gate::enforcer::{self, PolicyGate};
use crate::gate::errors::SetupError;
use crate::remote_addr::{self, RemoteAddrLogger};
use crate::settings::Settings;

/// Provisioned handlers placed in front of an upstream router.
#[derive(Debug, Clone, Default)]
pub struct HandlerChain {
    pub remote_addr: Option<RemoteAddrLogger>,
    pub gate: Option<PolicyGate>,
}

impl HandlerChain {
    pub fn provision(config: &ChainConfig) -> Result<Self, SetupError> {
        let gate = config.gate.as_ref().map(PolicyGate::provision).transpose()?;
        if gate.is_none() {
            tracing::warn!("No policy gate configured, upstream is served unprotected");
        }
        Ok(Self {
            remote_addr: config.remote_addr.map(RemoteAddrLogger::new),
            gate,
        })
    }

    /// Put the policy gate in front of every route of `upstream`, including
    /// its fallback.
    pub fn protect(&self, upstream: Router) -> Router {
        match &self.gate {
            Some(gate) => upstream.layer(middleware::from_fn_with_state(
                gate.clone(),
                enforcer::authorize,
            )),
            None => upstream,
        }
    }

    pub fn observe(&self, router: Router) -> Router {
        match &self.remote_addr {
            Some(logger) => router.layer(middleware::from_fn_with_state(
                logger.clone(),
                remote_addr::log_remote_addr,
            )),
            None => router,
        }
    }
}

/// Full request path: address logging, then the gate, then `upstream`.
/// `/healthz` answers without consulting the gate.
pub fn router(chain: &HandlerChain, upstream: Router) -> Router {
    let router = Router::new()
        .route("/healthz", get(health))
        .merge(chain.protect(upstream));
    chain.observe(router)
}

pub async fn serve(settings: Settings) -> miette::Result<()> {
    let chain_config = settings.chain_config()?;
    let chain = HandlerChain::provision(&chain_config)?;

    tracing::info!(root = %settings.site.root.display(), "Serving site");
    let upstream = Router::new().fallback_service(ServeDir::new(&settings.site.root));

    let app = router(&chain, upstream).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = settings
        .bind_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
