use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{UserId, UserProfile},
    protocol::AuthRefreshResponse,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::ClientError;

/// Obtains a fresh access token when the current one is rejected.
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String>;
}

/// A fixed token with nothing to refresh it from.
pub struct StaticCredentials;

#[async_trait]
impl AuthRefresher for StaticCredentials {
    async fn refresh(&self) -> Result<String> {
        Err(ClientError::Unauthorized.into())
    }
}

/// Refreshes through `POST {base}/v1/auth/refresh`, relying on the session cookie.
pub struct HttpAuthRefresher {
    http: Client,
    base_url: String,
}

impl HttpAuthRefresher {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .context("failed to build auth http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AuthRefresher for HttpAuthRefresher {
    async fn refresh(&self) -> Result<String> {
        let response: AuthRefreshResponse = self
            .http
            .post(format!("{}/v1/auth/refresh", self.base_url))
            .send()
            .await?
            .error_for_status()
            .map_err(|_| ClientError::Unauthorized)?
            .json()
            .await?;
        Ok(response.access_token)
    }
}

/// Credentials and identity of the signed-in user, handed explicitly to every
/// collaborator that needs them.
pub struct SessionContext {
    access_token: RwLock<Option<String>>,
    user: RwLock<Option<UserProfile>>,
    refresher: Arc<dyn AuthRefresher>,
    refresh_gate: Mutex<()>,
}

impl SessionContext {
    pub fn new(access_token: Option<String>, refresher: Arc<dyn AuthRefresher>) -> Arc<Self> {
        Arc::new(Self {
            access_token: RwLock::new(access_token),
            user: RwLock::new(None),
            refresher,
            refresh_gate: Mutex::new(()),
        })
    }

    pub async fn access_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    pub async fn set_access_token(&self, token: impl Into<String>) {
        *self.access_token.write().await = Some(token.into());
    }

    pub async fn user(&self) -> Option<UserProfile> {
        self.user.read().await.clone()
    }

    pub async fn set_user(&self, user: UserProfile) {
        *self.user.write().await = Some(user);
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.user.read().await.as_ref().map(|user| user.id.clone())
    }

    pub async fn username(&self) -> Option<String> {
        self.user
            .read()
            .await
            .as_ref()
            .map(|user| user.username.clone())
    }

    /// Single-flight refresh. `rejected` is the token the caller saw fail; if
    /// another task already replaced it, the newer token is returned as is.
    pub async fn refresh_credentials(&self, rejected: Option<&str>) -> Result<String> {
        let _gate = self.refresh_gate.lock().await;
        if let Some(current) = self.access_token().await {
            if rejected != Some(current.as_str()) {
                return Ok(current);
            }
        }

        match self.refresher.refresh().await {
            Ok(token) => {
                info!("session: access token refreshed");
                self.set_access_token(token.clone()).await;
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "session: credential refresh failed");
                Err(ClientError::Unauthorized.into())
            }
        }
    }

    pub async fn logout(&self) {
        *self.access_token.write().await = None;
        *self.user.write().await = None;
        info!("session: logged out");
    }
}
