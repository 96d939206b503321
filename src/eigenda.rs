use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    config::Config,
    store::{BatchHandle, BlobStatus, BoxFuture, Identity, RemoteStore, StoreError},
};

#[derive(Debug, Clone)]
pub struct EigenDaOptions {
    pub base_url: String,
    pub identifier: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl EigenDaOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url.clone(),
            identifier: config.identifier.clone(),
            api_key: config.api_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// HTTP client for the EigenDA log API.
pub struct EigenDaStore {
    base: String,
    api_key: Option<String>,
    configured_identifier: Option<String>,
    identity: OnceCell<Identity>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IdentifierResponse {
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    data: String,
}

fn parse_status(raw: &str) -> Result<BlobStatus, StoreError> {
    match raw.to_ascii_lowercase().as_str() {
        "queued" | "processing" | "pending" => Ok(BlobStatus::Pending),
        "confirmed" | "finalized" => Ok(BlobStatus::Confirmed),
        "failed" => Ok(BlobStatus::Failed),
        other => Err(StoreError::Decode(format!("unknown blob status {other:?}"))),
    }
}

impl EigenDaStore {
    pub fn new(options: EigenDaOptions) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dalog/", env!("CARGO_PKG_VERSION")))
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            base: options.base_url,
            api_key: options.api_key,
            configured_identifier: options.identifier,
            identity: OnceCell::new(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn bootstrap_identity(&self) -> Result<Identity, StoreError> {
        if let Some(id) = &self.configured_identifier {
            return Ok(Identity::new(id.clone()));
        }

        let resp = self
            .send(self.client.post(self.url("/v1/identifiers")))
            .await?
            .json::<IdentifierResponse>()
            .await?;
        if resp.identifier.trim().is_empty() {
            return Err(StoreError::Rejected("empty identifier issued".to_string()));
        }
        info!(identifier = %resp.identifier, "eigenda identifier issued");
        Ok(Identity::new(resp.identifier))
    }

    async fn identity(&self) -> Result<&Identity, StoreError> {
        self.identity
            .get_or_try_init(|| self.bootstrap_identity())
            .await
    }
}

impl RemoteStore for EigenDaStore {
    fn ensure_identity(&self) -> BoxFuture<'_, Result<Identity, StoreError>> {
        Box::pin(async move { self.identity().await.cloned() })
    }

    fn submit(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<BatchHandle, StoreError>> {
        Box::pin(async move {
            let identity = self.identity().await?;
            let body = serde_json::json!({
                "identifier": identity,
                "data": base64::engine::general_purpose::STANDARD.encode(&payload),
            });
            let resp = self
                .send(self.client.post(self.url("/v1/logs")).json(&body))
                .await?
                .json::<SubmitResponse>()
                .await?;
            if resp.job_id.trim().is_empty() {
                return Err(StoreError::Rejected("empty job_id in submit response".to_string()));
            }
            debug!(job_id = %resp.job_id, bytes = payload.len(), "eigenda batch accepted");
            Ok(BatchHandle::new(resp.job_id))
        })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<BlobStatus, StoreError>> {
        Box::pin(async move {
            let resp = self
                .send(
                    self.client
                        .get(self.url(&format!("/v1/logs/{handle}/status"))),
                )
                .await?
                .json::<StatusResponse>()
                .await?;
            parse_status(&resp.status)
        })
    }

    fn retrieve<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            let resp = match self
                .send(self.client.get(self.url(&format!("/v1/logs/{handle}"))))
                .await
            {
                Ok(resp) => resp,
                Err(StoreError::Status { status: 404, .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            let body = resp.json::<RetrieveResponse>().await?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(body.data.as_bytes())
                .map_err(|e| StoreError::Decode(format!("invalid base64 payload: {e}")))?;
            Ok(Some(bytes))
        })
    }
}
