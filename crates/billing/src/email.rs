//! Billing notification emails
//!
//! Sent through the Resend HTTP API. Every send is best-effort: callers log
//! failures and carry on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com";

/// Facts about a completed activation, used to fill both emails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationNotice {
    pub portal_key: String,
    pub company_name: String,
    pub customer_email: String,
    pub billing_model: String,
    pub redirect_url: String,
    pub invitation_id: String,
    pub charge: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_customer_welcome(&self, notice: &ActivationNotice) -> BillingResult<()>;

    async fn send_ops_activation(&self, notice: &ActivationNotice) -> BillingResult<()>;
}

#[derive(Clone)]
pub struct EmailConfig {
    /// Sending is disabled without a key
    pub api_key: Option<String>,
    pub from: String,
    pub ops_email: Option<String>,
    pub api_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from: "Leadgen Billing <billing@leadgen.local>".to_string(),
            ops_email: None,
            api_url: RESEND_API_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .field("ops_email", &self.ops_email)
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Internal(format!("http client: {}", e)))?;
        if config.api_key.is_none() {
            tracing::warn!("RESEND_API_KEY not set; billing emails are disabled");
        }
        Ok(Self { http, config })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn send(&self, to: &str, subject: String, text: String) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(subject = %subject, "Email disabled; skipping send");
            return Ok(());
        };

        let response = self
            .http
            .post(format!("{}/emails", self.config.api_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&ResendEmail {
                from: &self.config.from,
                to: [to],
                subject,
                text,
            })
            .send()
            .await
            .map_err(|e| BillingError::Email(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!(
                "send failed with status {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send_customer_welcome(&self, notice: &ActivationNotice) -> BillingResult<()> {
        let subject = format!("Welcome aboard, {}", notice.company_name);
        let text = format!(
            "Thanks for your payment. Your lead portal for {} is ready.\n\n\
             Accept your invitation to get started: {}\n",
            notice.company_name, notice.redirect_url
        );
        self.send(&notice.customer_email, subject, text).await
    }

    async fn send_ops_activation(&self, notice: &ActivationNotice) -> BillingResult<()> {
        let Some(ops_email) = self.config.ops_email.as_deref() else {
            return Ok(());
        };
        let subject = format!("New activation: {} ({})", notice.company_name, notice.portal_key);
        let text = format!(
            "Portal key: {}\nCompany: {}\nCustomer email: {}\nBilling model: {}\n\
             Charge: {}\nInvitation: {}\n",
            notice.portal_key,
            notice.company_name,
            notice.customer_email,
            notice.billing_model,
            notice.charge,
            notice.invitation_id
        );
        self.send(ops_email, subject, text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentEmail {
    CustomerWelcome,
    OpsActivation,
}

/// Notifier double that records sends and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(SentEmail, String)>>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(SentEmail, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, kind: SentEmail, portal_key: &str) -> BillingResult<()> {
        if self.failing {
            return Err(BillingError::Email("mail provider unavailable".into()));
        }
        self.sent
            .lock()
            .map_err(|_| BillingError::Internal("notifier recorder poisoned".into()))?
            .push((kind, portal_key.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_customer_welcome(&self, notice: &ActivationNotice) -> BillingResult<()> {
        self.record(SentEmail::CustomerWelcome, &notice.portal_key)
    }

    async fn send_ops_activation(&self, notice: &ActivationNotice) -> BillingResult<()> {
        self.record(SentEmail::OpsActivation, &notice.portal_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn notice() -> ActivationNotice {
        ActivationNotice {
            portal_key: "bob-hvac".into(),
            company_name: "Bob HVAC".into(),
            customer_email: "bob@hvac.test".into(),
            billing_model: "package_40_paid_in_full".into(),
            redirect_url: "https://portal.leadgen.test".into(),
            invitation_id: "inv_1".into(),
            charge: "initial".into(),
        }
    }

    #[tokio::test]
    async fn test_disabled_without_key() {
        let service = BillingEmailService::new(EmailConfig::default()).unwrap();
        assert!(!service.is_enabled());
        service.send_customer_welcome(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_welcome_posts_to_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "to": ["bob@hvac.test"],
                "subject": "Welcome aboard, Bob HVAC"
            })))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = BillingEmailService::new(EmailConfig {
            api_key: Some("re_test".into()),
            api_url: server.url(),
            ..EmailConfig::default()
        })
        .unwrap();
        service.send_customer_welcome(&notice()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ops_email_skipped_without_recipient() {
        let service = BillingEmailService::new(EmailConfig {
            api_key: Some("re_test".into()),
            api_url: "http://127.0.0.1:9".into(),
            ..EmailConfig::default()
        })
        .unwrap();
        service.send_ops_activation(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_is_email_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/emails")
            .with_status(500)
            .create_async()
            .await;
        let service = BillingEmailService::new(EmailConfig {
            api_key: Some("re_test".into()),
            api_url: server.url(),
            ..EmailConfig::default()
        })
        .unwrap();
        let err = service.send_customer_welcome(&notice()).await.unwrap_err();
        assert!(matches!(err, BillingError::Email(_)));
    }
}
