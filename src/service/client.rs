//! Outbound calls to tenant services: result callbacks and transaction
//! check-backs. Service names resolve to base URLs through the endpoint
//! registry configured in settings.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TenantEndpoints;
use crate::domain::{Channel, Notification, SendStatus};
use crate::error::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Verdict of a transaction check-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCheckStatus {
    Unknown,
    Commit,
    Cancel,
}

impl TxCheckStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TxCheckStatus::Commit,
            2 => TxCheckStatus::Cancel,
            _ => TxCheckStatus::Unknown,
        }
    }
}

/// Payload posted to the tenant's result-callback endpoint: the terminal
/// result plus enough of the original request to correlate it.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationResultRequest {
    pub notification_id: i64,
    pub original_request: OriginalRequest,
    pub result: NotificationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginalRequest {
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template_id: i64,
    pub template_params: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationResult {
    pub notification_id: i64,
    pub status: SendStatus,
}

impl NotificationResultRequest {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            original_request: OriginalRequest {
                key: notification.key.clone(),
                receivers: notification.receivers.clone(),
                channel: notification.channel,
                template_id: notification.template.id,
                template_params: notification.template.params.clone(),
            },
            result: NotificationResult {
                notification_id: notification.id,
                status: notification.status,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct TxCheckResponse {
    status: i32,
}

/// Boundary to tenant-owned services. The HTTP implementation is the real
/// one; tests substitute their own.
#[async_trait]
pub trait TenantGateway: Send + Sync {
    /// Deliver a terminal send result. Returns the tenant's acknowledgement.
    async fn notify_result(
        &self,
        service_name: &str,
        request: &NotificationResultRequest,
    ) -> Result<bool>;

    /// Ask the tenant whether a prepared transaction should proceed.
    async fn transaction_check(&self, service_name: &str, key: &str) -> Result<TxCheckStatus>;
}

pub struct HttpTenantGateway {
    http: reqwest::Client,
    endpoints: TenantEndpoints,
}

impl HttpTenantGateway {
    pub fn new(endpoints: TenantEndpoints) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { http, endpoints }
    }

    fn base_url(&self, service_name: &str) -> Result<&str> {
        self.endpoints
            .resolve(service_name)
            .ok_or_else(|| AppError::TenantCall(format!("unknown service: {service_name}")))
    }
}

#[async_trait]
impl TenantGateway for HttpTenantGateway {
    async fn notify_result(
        &self,
        service_name: &str,
        request: &NotificationResultRequest,
    ) -> Result<bool> {
        let url = format!("{}/notifications/result", self.base_url(service_name)?);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::TenantCall(format!("callback to {service_name}: {e}")))?;
        let body: CallbackResponse = response
            .error_for_status()
            .map_err(|e| AppError::TenantCall(format!("callback to {service_name}: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::TenantCall(format!("callback body from {service_name}: {e}")))?;
        Ok(body.success)
    }

    async fn transaction_check(&self, service_name: &str, key: &str) -> Result<TxCheckStatus> {
        let url = format!("{}/transactions/check", self.base_url(service_name)?);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "key": key }))
            .send()
            .await
            .map_err(|e| AppError::TenantCall(format!("check-back to {service_name}: {e}")))?;
        let body: TxCheckResponse = response
            .error_for_status()
            .map_err(|e| AppError::TenantCall(format!("check-back to {service_name}: {e}")))?
            .json()
            .await
            .map_err(|e| {
                AppError::TenantCall(format!("check-back body from {service_name}: {e}"))
            })?;
        Ok(TxCheckStatus::from_code(body.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_codes_map_like_the_wire_contract() {
        assert_eq!(TxCheckStatus::from_code(0), TxCheckStatus::Unknown);
        assert_eq!(TxCheckStatus::from_code(1), TxCheckStatus::Commit);
        assert_eq!(TxCheckStatus::from_code(2), TxCheckStatus::Cancel);
        // Anything out of range degrades to UNKNOWN rather than failing.
        assert_eq!(TxCheckStatus::from_code(42), TxCheckStatus::Unknown);
    }

    #[test]
    fn result_request_carries_original_fields() {
        use crate::domain::{SendStrategyConfig, TemplateRef};
        let mut params = std::collections::HashMap::new();
        params.insert("code".into(), "9".into());
        let n = Notification {
            id: 10,
            biz_id: 7,
            key: "k1".into(),
            receivers: vec!["+15550100".into()],
            channel: Channel::Sms,
            template: TemplateRef {
                id: 3,
                version_id: 4,
                params,
            },
            status: SendStatus::Succeeded,
            scheduled_start: 0,
            scheduled_end: 0,
            version: 2,
            strategy: SendStrategyConfig::Immediate,
        };
        let request = NotificationResultRequest::from_notification(&n);
        assert_eq!(request.notification_id, 10);
        assert_eq!(request.original_request.key, "k1");
        assert_eq!(request.result.status, SendStatus::Succeeded);
    }
}
