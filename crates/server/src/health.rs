use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use expensa_core::config::EscalationConfig;
use expensa_db::{ping, DbPool};
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    escalation: EscalationConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub escalation: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, escalation: EscalationConfig) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, escalation })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    escalation: EscalationConfig,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, escalation)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        escalation: escalation_check(&state.escalation),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn escalation_check(escalation: &EscalationConfig) -> HealthCheck {
    if !escalation.enabled {
        return HealthCheck { status: "disabled", detail: "escalation scheduler is off".to_string() };
    }
    HealthCheck {
        status: "scheduled",
        detail: format!(
            "every {}s, escalating approvals pending for more than {}h",
            escalation.interval_secs, escalation.stale_after_hours
        ),
    }
}
