use reqwest::{Client, StatusCode};
use std::time::Duration;
use stevedore_shared::{Container, Heartbeat, Node};
use thiserror::Error;

/// Timeout applied to every request against the control plane.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("control plane returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// The worker's view of the control plane.
pub trait ControlApi: Send + Sync + 'static + Clone {
    fn register(&self, node: &Node) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn heartbeat(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn assigned_containers(&self) -> impl Future<Output = Result<Vec<Container>, ApiError>> + Send;

    fn report_status(&self, container: &Container)
    -> impl Future<Output = Result<(), ApiError>> + Send;

    fn delete_container(&self, id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Clone)]
pub struct HttpApiClient {
    base: String,
    node_id: String,
    client: Client,
}

impl HttpApiClient {
    pub fn new(
        control_url: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(HttpApiClient {
            base: control_url.into().trim_end_matches('/').to_string(),
            node_id: node_id.into(),
            client,
        })
    }

    async fn ok(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

impl ControlApi for HttpApiClient {
    async fn register(&self, node: &Node) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/nodes/register", self.base))
            .json(node)
            .send()
            .await?;
        Self::ok(response).await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), ApiError> {
        let beat = Heartbeat {
            node_id: self.node_id.clone(),
        };
        let response = self
            .client
            .post(format!("{}/nodes/heartbeat", self.base))
            .json(&beat)
            .send()
            .await?;
        Self::ok(response).await?;
        Ok(())
    }

    async fn assigned_containers(&self) -> Result<Vec<Container>, ApiError> {
        let response = self
            .client
            .get(format!(
                "{}/containers/assigned?node_id={}",
                self.base, self.node_id
            ))
            .send()
            .await?;
        Ok(Self::ok(response).await?.json().await?)
    }

    async fn report_status(&self, container: &Container) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/containers/status", self.base))
            .json(container)
            .send()
            .await?;
        Self::ok(response).await?;
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(format!("{}/containers/{id}", self.base))
            .send()
            .await?;
        Self::ok(response).await?;
        Ok(())
    }
}
