use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::time::Duration;
use url::Url;

/// Body of the single ingestion call.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub gateway_id: &'a str,
    pub gateway_password: &'a str,
    pub measurements: &'a serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("backlog I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed batch: {0}")]
    Json(#[from] serde_json::Error),
}

/// Something measurements can be posted to. Only a 200 answer counts as delivered.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn post(&self, envelope: &Envelope<'_>) -> Result<(), DeliveryError>;
}

pub struct HttpBackend {
    client: Client,
    endpoint: Url,
}

impl HttpBackend {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpBackend { client, endpoint })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn post(&self, envelope: &Envelope<'_>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!("Backend accepted batch");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
