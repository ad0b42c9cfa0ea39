//! Portal account invitations
//!
//! The identity provider mints sign-up invitations for newly paid customers.
//! `HttpInvitationClient` talks to its REST API; `RecordingInvitationProvider`
//! stands in for it in tests and local runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Metadata attached to the invitation, echoed back on sign-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvitationMetadata {
    pub portal_key: String,
    pub company_name: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationRequest {
    pub email: String,
    pub redirect_url: String,
    pub metadata: InvitationMetadata,
}

#[async_trait]
pub trait InvitationProvider: Send + Sync {
    /// Create an invitation, returning the provider's invitation id
    async fn create_invitation(&self, request: &InvitationRequest) -> BillingResult<String>;

    async fn revoke_invitation(&self, invitation_id: &str) -> BillingResult<()>;
}

#[derive(Clone)]
pub struct InvitationConfig {
    pub api_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for InvitationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitationConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
struct CreateInvitationBody<'a> {
    email_address: &'a str,
    redirect_url: &'a str,
    public_metadata: &'a InvitationMetadata,
}

#[derive(Deserialize)]
struct InvitationResponse {
    id: String,
}

#[derive(Clone)]
pub struct HttpInvitationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpInvitationClient {
    pub fn new(config: &InvitationConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BillingError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn check(response: reqwest::Response, action: &str) -> BillingResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %body,
            action = action,
            "Invitation provider request failed"
        );
        Err(BillingError::InvitationProvider(format!(
            "{} failed with status {}",
            action, status
        )))
    }
}

#[async_trait]
impl InvitationProvider for HttpInvitationClient {
    async fn create_invitation(&self, request: &InvitationRequest) -> BillingResult<String> {
        let response = self
            .http
            .post(format!("{}/v1/invitations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CreateInvitationBody {
                email_address: &request.email,
                redirect_url: &request.redirect_url,
                public_metadata: &request.metadata,
            })
            .send()
            .await
            .map_err(|e| BillingError::InvitationProvider(e.to_string()))?;

        let invitation: InvitationResponse = Self::check(response, "create invitation")
            .await?
            .json()
            .await
            .map_err(|e| BillingError::InvitationProvider(format!("bad response: {}", e)))?;

        tracing::info!(
            portal_key = %request.metadata.portal_key,
            invitation_id = %invitation.id,
            "Invitation created"
        );
        Ok(invitation.id)
    }

    async fn revoke_invitation(&self, invitation_id: &str) -> BillingResult<()> {
        let response = self
            .http
            .post(format!("{}/v1/invitations/{}/revoke", self.base_url, invitation_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BillingError::InvitationProvider(e.to_string()))?;
        Self::check(response, "revoke invitation").await?;
        tracing::info!(invitation_id = %invitation_id, "Invitation revoked");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordedInvitations {
    created: Vec<InvitationRequest>,
    revoked: Vec<String>,
    fail_create: bool,
}

/// Provider double that records every call
#[derive(Debug, Clone, Default)]
pub struct RecordingInvitationProvider {
    inner: Arc<Mutex<RecordedInvitations>>,
}

impl RecordingInvitationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_create = fail;
        }
    }

    pub fn created(&self) -> Vec<InvitationRequest> {
        self.inner
            .lock()
            .map(|inner| inner.created.clone())
            .unwrap_or_default()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.revoked.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InvitationProvider for RecordingInvitationProvider {
    async fn create_invitation(&self, request: &InvitationRequest) -> BillingResult<String> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BillingError::Internal("invitation recorder poisoned".into()))?;
        if inner.fail_create {
            return Err(BillingError::InvitationProvider("create invitation failed".into()));
        }
        inner.created.push(request.clone());
        Ok(format!("inv_{}", inner.created.len()))
    }

    async fn revoke_invitation(&self, invitation_id: &str) -> BillingResult<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BillingError::Internal("invitation recorder poisoned".into()))?;
        inner.revoked.push(invitation_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(api_url: String) -> InvitationConfig {
        InvitationConfig {
            api_url,
            api_key: "sk_test_invites".into(),
        }
    }

    fn request() -> InvitationRequest {
        InvitationRequest {
            email: "bob@hvac.test".into(),
            redirect_url: "https://portal.leadgen.test".into(),
            metadata: InvitationMetadata {
                portal_key: "bob-hvac".into(),
                company_name: "Bob HVAC".into(),
                source: "stripe_checkout".into(),
            },
        }
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = config("http://unused".into());
        assert!(!format!("{:?}", config).contains("sk_test_invites"));
    }

    #[tokio::test]
    async fn test_create_invitation_posts_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/invitations")
            .match_header("authorization", "Bearer sk_test_invites")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "email_address": "bob@hvac.test",
                "redirect_url": "https://portal.leadgen.test",
                "public_metadata": { "portal_key": "bob-hvac", "source": "stripe_checkout" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"inv_123","status":"pending"}"#)
            .create_async()
            .await;

        let client = HttpInvitationClient::new(&config(server.url())).unwrap();
        let id = client.create_invitation(&request()).await.unwrap();
        assert_eq!(id, "inv_123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_error_is_upstream_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/invitations")
            .with_status(422)
            .with_body(r#"{"errors":[{"code":"duplicate_record"}]}"#)
            .create_async()
            .await;

        let client = HttpInvitationClient::new(&config(server.url())).unwrap();
        let err = client.create_invitation(&request()).await.unwrap_err();
        assert!(matches!(err, BillingError::InvitationProvider(_)));
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_revoke_invitation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/invitations/inv_9/revoke")
            .with_status(200)
            .with_body(r#"{"id":"inv_9","revoked":true}"#)
            .create_async()
            .await;

        let client = HttpInvitationClient::new(&config(server.url())).unwrap();
        client.revoke_invitation("inv_9").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_recording_provider() {
        let provider = RecordingInvitationProvider::new();
        assert_eq!(provider.create_invitation(&request()).await.unwrap(), "inv_1");
        provider.revoke_invitation("inv_1").await.unwrap();
        provider.fail_create(true);
        assert!(provider.create_invitation(&request()).await.is_err());
        assert_eq!(provider.created().len(), 1);
        assert_eq!(provider.revoked(), vec!["inv_1".to_string()]);
    }
}
