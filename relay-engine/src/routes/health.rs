use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use diesel::prelude::*;

use relay_shared::types::api::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let db = state.db.clone();
    let db_check = tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok::<_, anyhow::Error>(())
    })
    .await;

    let check = match db_check {
        Ok(Ok(())) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Ok(Err(e)) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
        },
        Err(e) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
        },
    };

    let response =
        HealthResponse::healthy("relay-engine", env!("CARGO_PKG_VERSION")).with_checks(vec![check]);

    let status = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}
