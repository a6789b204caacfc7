use async_trait::async_trait;
use meshvault_protocol::{
    encode_b64, ContentAddress, ErrorBody, ExistsResponse, NodeHealth, StoreChunkRequest,
    StoreChunkResponse, VerifyResponse, ADMIN_TOKEN_HEADER,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::ReplicaTransport;
use crate::directory::Peer;
use crate::error::TransportError;

/// Request/reply binding: one HTTP call per operation, retried with
/// exponential backoff while the failure stays transient.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    retries: u32,
    backoff_base: Duration,
    admin_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        request_timeout: Duration,
        retries: u32,
        backoff_base: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            retries,
            backoff_base,
            admin_token: None,
        })
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    fn url(peer: &Peer, path: &str) -> String {
        let base = peer.address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}{path}")
        } else {
            format!("http://{base}{path}")
        }
    }

    /// Attempt `n` (1-based retry) waits `base * 2^(n-1)`.
    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, peer: &Peer, call: F) -> Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    let wait = self.backoff(attempt);
                    warn!(peer = %peer.id, op, attempt, "transient failure: {e}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    debug!(peer = %peer.id, op, "giving up: {e}");
                    return Err(e);
                }
            }
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, TransportError> {
    request.send().await.map_err(map_reqwest)
}

async fn into_error(response: Response) -> TransportError {
    let status = response.status().as_u16();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => String::new(),
    };
    TransportError::Http { status, message }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    if !response.status().is_success() {
        return Err(into_error(response).await);
    }
    response.json().await.map_err(map_reqwest)
}

#[async_trait]
impl ReplicaTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn store(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
        data: &[u8],
    ) -> Result<StoreChunkResponse, TransportError> {
        let body = StoreChunkRequest {
            chunk_hash: Some(cid.clone()),
            data_b64: encode_b64(data),
        };
        let url = Self::url(peer, "/store");
        self.with_retries("store", peer, || async {
            json(send(self.client.post(&url).json(&body)).await?).await
        })
        .await
    }

    async fn retrieve(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let url = Self::url(peer, &format!("/retrieve/{cid}"));
        self.with_retries("retrieve", peer, || async {
            let response = send(self.client.get(&url)).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let bytes = response.bytes().await.map_err(map_reqwest)?;
                    Ok(Some(bytes.to_vec()))
                }
                _ => Err(into_error(response).await),
            }
        })
        .await
    }

    async fn exists(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        let url = Self::url(peer, &format!("/exists/{cid}"));
        self.with_retries("exists", peer, || async {
            let response: ExistsResponse = json(send(self.client.get(&url)).await?).await?;
            Ok(response.exists)
        })
        .await
    }

    async fn delete(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        let url = Self::url(peer, &format!("/chunk/{cid}"));
        self.with_retries("delete", peer, || async {
            let mut request = self.client.delete(&url);
            if let Some(token) = &self.admin_token {
                request = request.header(ADMIN_TOKEN_HEADER, token);
            }
            let response = send(request).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(false),
                s if s.is_success() => Ok(true),
                _ => Err(into_error(response).await),
            }
        })
        .await
    }

    async fn verify(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<VerifyResponse, TransportError> {
        let url = Self::url(peer, &format!("/verify/{cid}"));
        self.with_retries("verify", peer, || async {
            json(send(self.client.get(&url)).await?).await
        })
        .await
    }

    /// Single attempt: a probe that needs retrying is already slow.
    async fn ping(&self, peer: &Peer) -> Result<NodeHealth, TransportError> {
        json(send(self.client.get(Self::url(peer, "/health"))).await?).await
    }
}
