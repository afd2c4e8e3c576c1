use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::auth::require_auth;
use super::handlers::{
    batch_query_notifications, batch_send_notifications, batch_send_notifications_async,
    cancel_tx, commit_tx, prepare_tx, query_notification, send_notification,
    send_notification_async,
};
use super::health::{health, metrics_endpoint};

pub fn api_routes(state: AppState) -> Router<AppState> {
    let tenant_api = Router::new()
        // Send
        .route("/notifications/send", post(send_notification))
        .route("/notifications/send-async", post(send_notification_async))
        .route("/notifications/batch", post(batch_send_notifications))
        .route(
            "/notifications/batch-async",
            post(batch_send_notifications_async),
        )
        // Transactional
        .route("/transactions/prepare", post(prepare_tx))
        .route("/transactions/commit", post(commit_tx))
        .route("/transactions/cancel", post(cancel_tx))
        // Query
        .route("/notifications", get(query_notification))
        .route("/notifications/query", post(batch_query_notifications))
        .layer(middleware::from_fn_with_state(state, require_auth));

    Router::new()
        // Health & metrics are unauthenticated
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api/v1", tenant_api)
}
