use axum::Json;

use crate::metrics;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "notifyd",
    }))
}

pub async fn metrics_endpoint() -> String {
    metrics::gather()
}
