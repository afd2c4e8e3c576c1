//! API handlers. Business errors are encoded in the response envelope;
//! system errors propagate and become transport-level failures.

use axum::{extract::State, Extension, Json};

use crate::error::{AppError, Result};
use crate::server::AppState;

use super::auth::TenantIdentity;
use super::dto::{
    BatchQueryRequest, BatchSendAsyncResponse, BatchSendNotificationRequest,
    BatchSendNotificationResponse, NotificationView, SendNotificationRequest,
    SendNotificationResponse, TxKeyRequest,
};

fn envelope(result: Result<crate::domain::SendReceipt>) -> Result<Json<SendNotificationResponse>> {
    match result {
        Ok(receipt) => Ok(Json(SendNotificationResponse::from_receipt(receipt))),
        Err(e) if e.is_business() => Ok(Json(SendNotificationResponse::from_business_error(&e))),
        Err(e) => Err(e),
    }
}

pub async fn send_notification(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<SendNotificationRequest>,
) -> Result<Json<SendNotificationResponse>> {
    if let Err(e) = state.rate_limiter.check(tenant.biz_id).await {
        return envelope(Err(e));
    }
    let notification = request.notification.into_domain(tenant.biz_id);
    envelope(state.send_service.send_notification(notification).await)
}

pub async fn send_notification_async(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<SendNotificationRequest>,
) -> Result<Json<SendNotificationResponse>> {
    if let Err(e) = state.rate_limiter.check(tenant.biz_id).await {
        return envelope(Err(e));
    }
    let notification = request.notification.into_domain(tenant.biz_id);
    envelope(
        state
            .send_service
            .send_notification_async(notification)
            .await,
    )
}

pub async fn batch_send_notifications(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<BatchSendNotificationRequest>,
) -> Result<Json<BatchSendNotificationResponse>> {
    if let Err(e) = state.rate_limiter.check(tenant.biz_id).await {
        if e.is_business() {
            return Ok(Json(BatchSendNotificationResponse {
                results: Vec::new(),
                error_code: e.error_code(),
                error_message: Some(e.to_string()),
            }));
        }
        return Err(e);
    }
    let notifications = request
        .notifications
        .into_iter()
        .map(|dto| dto.into_domain(tenant.biz_id))
        .collect();
    match state
        .send_service
        .batch_send_notifications(notifications)
        .await
    {
        Ok(receipts) => Ok(Json(BatchSendNotificationResponse {
            results: receipts
                .into_iter()
                .map(SendNotificationResponse::from_receipt)
                .collect(),
            error_code: None,
            error_message: None,
        })),
        Err(e) if e.is_business() => Ok(Json(BatchSendNotificationResponse {
            results: Vec::new(),
            error_code: e.error_code(),
            error_message: Some(e.to_string()),
        })),
        Err(e) => Err(e),
    }
}

pub async fn batch_send_notifications_async(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<BatchSendNotificationRequest>,
) -> Result<Json<BatchSendAsyncResponse>> {
    let business_error = |e: &AppError| BatchSendAsyncResponse {
        notification_ids: Vec::new(),
        error_code: e.error_code(),
        error_message: Some(e.to_string()),
    };
    if let Err(e) = state.rate_limiter.check(tenant.biz_id).await {
        if e.is_business() {
            return Ok(Json(business_error(&e)));
        }
        return Err(e);
    }
    let notifications = request
        .notifications
        .into_iter()
        .map(|dto| dto.into_domain(tenant.biz_id))
        .collect();
    match state
        .send_service
        .batch_send_notifications_async(notifications)
        .await
    {
        Ok(ids) => Ok(Json(BatchSendAsyncResponse {
            notification_ids: ids,
            error_code: None,
            error_message: None,
        })),
        Err(e) if e.is_business() => Ok(Json(business_error(&e))),
        Err(e) => Err(e),
    }
}

pub async fn prepare_tx(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<SendNotificationRequest>,
) -> Result<Json<SendNotificationResponse>> {
    if let Err(e) = state.rate_limiter.check(tenant.biz_id).await {
        return envelope(Err(e));
    }
    let mut notification = request.notification.into_domain(tenant.biz_id);
    if let Err(e) = notification.validate() {
        return envelope(Err(e));
    }
    notification.id = state
        .id_generator
        .generate(notification.biz_id, &notification.key);
    match state.tx_service.prepare(notification).await {
        Ok(id) => Ok(Json(SendNotificationResponse {
            notification_id: id,
            status: Some(crate::domain::SendStatus::Prepare),
            error_code: None,
            error_message: None,
        })),
        Err(e) if e.is_business() => {
            Ok(Json(SendNotificationResponse::from_business_error(&e)))
        }
        Err(e) => Err(e),
    }
}

pub async fn commit_tx(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<TxKeyRequest>,
) -> Result<Json<serde_json::Value>> {
    state.tx_service.commit(tenant.biz_id, &request.key).await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn cancel_tx(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<TxKeyRequest>,
) -> Result<Json<serde_json::Value>> {
    state.tx_service.cancel(tenant.biz_id, &request.key).await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn query_notification(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    axum::extract::Query(params): axum::extract::Query<TxKeyRequest>,
) -> Result<Json<NotificationView>> {
    let notification = state
        .send_service
        .query_notification(tenant.biz_id, &params.key)
        .await?;
    Ok(Json(NotificationView::from_domain(&notification)))
}

pub async fn batch_query_notifications(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantIdentity>,
    Json(request): Json<BatchQueryRequest>,
) -> Result<Json<Vec<NotificationView>>> {
    let notifications = state
        .send_service
        .batch_query_notifications(tenant.biz_id, &request.keys)
        .await?;
    Ok(Json(
        notifications.iter().map(NotificationView::from_domain).collect(),
    ))
}
