//! Streaming request/response exchanges with the attestation service

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tls;

/// Response body as a stream of raw chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// How the connection to the service is established
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportParameters {
    pub ignore_certificate_errors: bool,
    pub force_ohttp: bool,
    pub use_compression: bool,
    /// Bundle the traffic is attributed to
    pub bundle_identifier: Option<String>,
}

/// A single POST written as one complete message
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response head plus the still-streaming body
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Opens exchanges with the attestation service
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        parameters: &TransportParameters,
        endpoint: &str,
        request_id: Uuid,
    ) -> Result<Box<dyn Exchange>>;
}

/// One open request/response exchange
#[async_trait]
pub trait Exchange: Send {
    /// Write the request and wait for the response head
    async fn send(self: Box<Self>, request: OutboundRequest) -> Result<StreamingResponse>;
}

/// Connection factory backed by reqwest over rustls
///
/// Clients are built lazily and shared between exchanges with the same TLS
/// and compression settings.
#[derive(Default)]
pub struct HttpConnectionFactory {
    clients: Mutex<HashMap<(bool, bool), reqwest::Client>>,
}

impl HttpConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, parameters: &TransportParameters) -> Result<reqwest::Client> {
        let key = (parameters.ignore_certificate_errors, parameters.use_compression);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = tls::create_client(key.0, key.1)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    async fn connect(
        &self,
        parameters: &TransportParameters,
        endpoint: &str,
        request_id: Uuid,
    ) -> Result<Box<dyn Exchange>> {
        if parameters.force_ohttp {
            return Err(Error::Transport("oblivious HTTP relaying is not supported".into()));
        }

        debug!(
            %request_id,
            endpoint,
            bundle = parameters.bundle_identifier.as_deref().unwrap_or("-"),
            "opening exchange"
        );

        Ok(Box::new(HttpExchange {
            client: self.client_for(parameters)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }))
    }
}

struct HttpExchange {
    client: reqwest::Client,
    endpoint: String,
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn send(self: Box<Self>, request: OutboundRequest) -> Result<StreamingResponse> {
        let url = format!("{}{}", self.endpoint, request.path);

        let response = self
            .client
            .post(&url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(io::Error::other);

        Ok(StreamingResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
