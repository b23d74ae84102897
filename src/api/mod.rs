//! HTTP API for health checks, endpoint status, and monitoring

use crate::chain::EndpointStatus;
use crate::config::ApiConfig;
use crate::error::{DispersalError, DispersalResult};
use crate::service::{DispersalService, ReadinessReport};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DispersalService>,
    pub started: Instant,
}

pub fn router(service: Arc<DispersalService>) -> Router {
    let state = AppState {
        service,
        started: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/treasury", get(get_treasury))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, service: Arc<DispersalService>) -> DispersalResult<()> {
    let app = router(service);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DispersalError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| DispersalError::Internal(format!("API server stopped: {}", e)))
}

/// Liveness only
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

/// Store reachable and every chain has a healthy endpoint
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessReport>) {
    let report = state.service.readiness().await;
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn get_chains(State(state): State<AppState>) -> Response {
    let rpc = &state.service.rpc;
    let mut chains = Vec::new();
    for chain_id in rpc.chain_ids() {
        match rpc.endpoint_health(chain_id) {
            Ok(endpoints) => chains.push(ChainEndpoints {
                chain_id,
                name: rpc.chain_name(chain_id).unwrap_or_default().to_string(),
                healthy: endpoints.iter().any(|e| e.health.healthy),
                endpoints,
            }),
            Err(e) => return error_response(e),
        }
    }
    Json(ChainsResponse { chains }).into_response()
}

async fn get_stats(State(state): State<AppState>) -> Response {
    match state.service.get_metrics().await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_treasury(State(state): State<AppState>) -> impl IntoResponse {
    let balances = state.service.get_all_treasury_balances().await;
    Json(TreasuryResponse { balances })
}

fn error_response(err: DispersalError) -> Response {
    error!("API request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }),
    )
        .into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ChainEndpoints {
    chain_id: u64,
    name: String,
    healthy: bool,
    endpoints: Vec<EndpointStatus>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainEndpoints>,
}

#[derive(Serialize)]
struct TreasuryResponse {
    balances: Vec<crate::coordination::TreasuryBalance>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_settings, test_wallet, FakeConnector, FakeRpc};
    use crate::tx::SignerRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const URL: &str = "http://api.test";

    fn app(fake: Arc<FakeRpc>) -> Router {
        let settings = fake_settings(&[(114, &[URL][..])]);
        let connector = FakeConnector::new(&[(URL, fake)]);
        let service = DispersalService::with_connector(
            &settings,
            &connector,
            Arc::new(SignerRegistry::shared(test_wallet(), &[114])),
        )
        .unwrap();
        router(Arc::new(service))
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_always_ok() {
        let fake = FakeRpc::new();
        fake.set_down(true);
        let (status, body) = get_json(app(fake), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reports_unhealthy_chain() {
        let fake = FakeRpc::new();
        let app = app(fake.clone());

        let (status, body) = get_json(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        // The treasury read probes the endpoint and marks it unhealthy
        fake.set_down(true);
        let (_, body) = get_json(app.clone(), "/treasury").await;
        assert!(body["balances"][0]["error"].is_string());

        let (status, body) = get_json(app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["chains"][0]["healthy"], false);
    }

    #[tokio::test]
    async fn test_chains_lists_endpoints() {
        let (status, body) = get_json(app(FakeRpc::new()), "/chains").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chains"][0]["chain_id"], 114);
        assert_eq!(body["chains"][0]["endpoints"][0]["bound"], true);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (status, body) = get_json(app(FakeRpc::new()), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intents"]["total"], 0);
        assert_eq!(body["distributions"]["total_attempts"], 0);
    }
}
