//! Request and response bodies for the tenant API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Channel, Notification, SendReceipt, SendStatus, SendStrategyConfig, TemplateRef};
use crate::error::{AppError, ErrorCode};

#[derive(Debug, Deserialize)]
pub struct NotificationDto {
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template_id: i64,
    #[serde(default)]
    pub template_version_id: i64,
    #[serde(default)]
    pub template_params: HashMap<String, String>,
    #[serde(default)]
    pub send_strategy: Option<SendStrategyConfig>,
}

impl NotificationDto {
    /// Bind the request to the authenticated tenant. Absent strategy means
    /// IMMEDIATE.
    pub fn into_domain(self, biz_id: i64) -> Notification {
        Notification {
            id: 0,
            biz_id,
            key: self.key,
            receivers: self.receivers,
            channel: self.channel,
            template: TemplateRef {
                id: self.template_id,
                version_id: self.template_version_id,
                params: self.template_params,
            },
            status: SendStatus::Pending,
            scheduled_start: 0,
            scheduled_end: 0,
            version: 1,
            strategy: self.send_strategy.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendNotificationRequest {
    pub notification: NotificationDto,
}

#[derive(Debug, Deserialize)]
pub struct BatchSendNotificationRequest {
    pub notifications: Vec<NotificationDto>,
}

#[derive(Debug, Deserialize)]
pub struct TxKeyRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchQueryRequest {
    pub keys: Vec<String>,
}

/// Envelope for single-send style operations. Business failures ride here
/// with an error code; system failures become transport errors instead.
#[derive(Debug, Serialize)]
pub struct SendNotificationResponse {
    pub notification_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SendStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SendNotificationResponse {
    pub fn from_receipt(receipt: SendReceipt) -> Self {
        Self {
            notification_id: receipt.notification_id,
            status: Some(receipt.status),
            error_code: None,
            error_message: None,
        }
    }

    pub fn from_business_error(error: &AppError) -> Self {
        Self {
            notification_id: 0,
            status: None,
            error_code: error.error_code(),
            error_message: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchSendNotificationResponse {
    pub results: Vec<SendNotificationResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchSendAsyncResponse {
    pub notification_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NotificationView {
    pub notification_id: i64,
    pub key: String,
    pub channel: Channel,
    pub status: SendStatus,
    pub scheduled_start: i64,
    pub scheduled_end: i64,
}

impl NotificationView {
    pub fn from_domain(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            key: n.key.clone(),
            channel: n.channel,
            status: n.status,
            scheduled_start: n.scheduled_start,
            scheduled_end: n.scheduled_end,
        }
    }
}
