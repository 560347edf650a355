use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use utoipa::ToSchema;

use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
    /// Optional component that was never configured
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthDetails {
    pub database: ComponentHealth,
    pub cache: ComponentHealth,
    pub payment_gateway: ComponentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub details: HealthDetails,
}

/// Liveness probe
async fn liveness_check() -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Database and cache health.
///
/// The database is critical; a configured but unreachable cache only
/// degrades the service since every cache operation fails open.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy or degraded", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_start = Instant::now();
    let db_up = crate::db::check_connection(&state.db).await.is_ok();
    let database = ComponentHealth {
        status: if db_up {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        },
        latency_ms: Some(db_start.elapsed().as_millis() as u64),
    };

    let cache_start = Instant::now();
    let cache = match state.cache.health_check().await {
        None => ComponentHealth {
            status: ComponentStatus::Disabled,
            latency_ms: None,
        },
        Some(up) => ComponentHealth {
            status: if up {
                ComponentStatus::Up
            } else {
                ComponentStatus::Down
            },
            latency_ms: Some(cache_start.elapsed().as_millis() as u64),
        },
    };

    let payment_gateway = if state.payments.is_configured() {
        ComponentStatus::Up
    } else {
        ComponentStatus::Disabled
    };

    let status = match (database.status, cache.status) {
        (ComponentStatus::Down, _) => ComponentStatus::Down,
        (_, ComponentStatus::Down) => ComponentStatus::Degraded,
        _ => ComponentStatus::Up,
    };
    let code = if status == ComponentStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            details: HealthDetails {
                database,
                cache,
                payment_gateway,
            },
        }),
    )
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}
