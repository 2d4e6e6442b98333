//! REST client for the relay's job API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use taskrelay_core::task::{AnalysisRequest, TaskStatusRecord, TaskSubmitted};

use crate::error::ClientError;
use crate::poller::StatusSource;

/// HTTP client for the `/api/v1` routes.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// * `base_url` - server root, e.g. `http://localhost:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] and its connection pool.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/v1/analyze`
    pub async fn submit(&self, request: &AnalysisRequest) -> Result<TaskSubmitted, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/v1/analyze", self.base_url))
            .json(request)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /api/v1/task/{task_id}`
    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusRecord, ClientError> {
        let response = self
            .client
            .get(format!("{}/api/v1/task/{task_id}", self.base_url))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::TaskNotFound(task_id.to_string()));
        }
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatusRecord, ClientError> {
        self.task_status(task_id).await
    }
}
