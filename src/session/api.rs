//! Study-group REST endpoints used around a live session

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::signaling::protocol::UserId;

/// Common envelope of study-group responses
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiStatus {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub participant_count: Option<u32>,
}

/// `GET /session-info` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub success: bool,
    pub group: Option<serde_json::Value>,
    pub members: Vec<serde_json::Value>,
    pub websocket_url: String,
}

#[derive(Serialize)]
struct UserBody<'a> {
    user_id: &'a UserId,
}

#[derive(Serialize)]
struct GroupBody<'a> {
    group_id: &'a str,
}

/// Something that keeps the session marked active
#[async_trait]
pub trait ActivityPinger: Send + Sync {
    async fn update_activity(&self) -> Result<()>;
}

/// REST client bound to one study group
pub struct StudyGroupApi {
    client: reqwest::Client,
    base_url: String,
    group_id: String,
}

impl StudyGroupApi {
    pub fn new(base_url: &str, group_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            group_id: group_id.into(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register the local user before signaling connects
    pub async fn join_session(&self, user_id: &UserId) -> Result<ApiStatus> {
        let path = format!("/api/study-groups/{}/join-session", self.group_id);
        let status: ApiStatus = self.post(&path, &UserBody { user_id }).await?;
        info!(
            "Joined study group {} ({} participants)",
            self.group_id,
            status.participant_count.unwrap_or(0)
        );
        Ok(status)
    }

    pub async fn leave_session(&self, user_id: &UserId) -> Result<ApiStatus> {
        let path = format!("/api/study-groups/{}/leave-session", self.group_id);
        let status: ApiStatus = self.post(&path, &UserBody { user_id }).await?;
        info!("Left study group {}", self.group_id);
        Ok(status)
    }

    pub async fn session_info(&self) -> Result<SessionInfo> {
        let url = self.url(&format!("/api/study-groups/{}/session-info", self.group_id));
        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<SessionInfo>().await?)
    }

    /// Signaling URL for this group, asking the server for its path
    pub async fn signaling_url(&self) -> Result<String> {
        let info = self.session_info().await?;
        let path = if info.websocket_url.is_empty() {
            format!("/ws/study-group/{}", self.group_id)
        } else {
            info.websocket_url
        };
        Ok(websocket_url(&self.base_url, &path))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ActivityPinger for StudyGroupApi {
    async fn update_activity(&self) -> Result<()> {
        let status: ApiStatus = self
            .post(
                "/api/study-groups/update-activity",
                &GroupBody {
                    group_id: &self.group_id,
                },
            )
            .await?;

        if status.success {
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "activity update rejected: {}",
                status
                    .error
                    .or(status.message)
                    .unwrap_or_else(|| "unknown reason".to_string())
            )))
        }
    }
}

/// Build a WebSocket URL from the HTTP API base and a server path
pub fn websocket_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };

    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
