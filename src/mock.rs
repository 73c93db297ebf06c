//! Scriptable collaborators for exercising the prefetch pipeline without a
//! network or a real verifier

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use uuid::Uuid;

use crate::attestation::{AttestationVerifier, PrefetchParameters, ValidatedAttestation};
use crate::error::{Error, Result, VerificationError};
use crate::framing::encode_frame;
use crate::proto::{Attestation, PrefetchResponse};
use crate::rate_limit::{RateLimitConfiguration, RateLimiter};
use crate::transport::{ConnectionFactory, Exchange, OutboundRequest, StreamingResponse, TransportParameters};

/// Attestation for `node` with placeholder evidence
pub fn attestation(node: &str) -> Attestation {
    Attestation {
        node_identifier: node.to_string(),
        attestation_bundle: node.as_bytes().to_vec(),
        cloudos_version: "1.0".to_string(),
        cloudos_release_type: "test".to_string(),
        ..Default::default()
    }
}

enum Scripted {
    Reply { status: StatusCode, body: Vec<u8> },
    ConnectError(String),
}

/// A request as seen by `MockConnectionFactory`
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_id: Uuid,
    pub endpoint: String,
    pub parameters: TransportParameters,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Default)]
struct FactoryState {
    script: VecDeque<Scripted>,
    requests: Vec<RecordedRequest>,
    connects: usize,
}

/// Replays scripted responses in order, one per connection
///
/// Clones share the same script and recordings.
#[derive(Clone)]
pub struct MockConnectionFactory {
    state: Arc<Mutex<FactoryState>>,
    chunk_size: usize,
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            chunk_size: 7,
        }
    }

    /// Split response bodies into chunks of this many bytes
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Queue a response carrying `messages` as frames
    pub fn push_response(&self, status: u16, messages: Vec<PrefetchResponse>) {
        let body = messages.iter().flat_map(|m| encode_frame(m).to_vec()).collect();
        self.push_raw(status, body);
    }

    /// Queue a response with an arbitrary body
    pub fn push_raw(&self, status: u16, body: Vec<u8>) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.state.lock().script.push_back(Scripted::Reply { status, body });
    }

    /// Queue a connection failure
    pub fn push_connect_error(&self, message: impl Into<String>) {
        self.state.lock().script.push_back(Scripted::ConnectError(message.into()));
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(
        &self,
        parameters: &TransportParameters,
        endpoint: &str,
        request_id: Uuid,
    ) -> Result<Box<dyn Exchange>> {
        let mut state = self.state.lock();
        state.connects += 1;

        match state.script.pop_front() {
            Some(Scripted::Reply { status, body }) => Ok(Box::new(MockExchange {
                state: Arc::clone(&self.state),
                request_id,
                endpoint: endpoint.to_string(),
                parameters: parameters.clone(),
                status,
                body,
                chunk_size: self.chunk_size,
            })),
            Some(Scripted::ConnectError(message)) => Err(Error::Transport(message)),
            None => Err(Error::Transport("no scripted response left".into())),
        }
    }
}

struct MockExchange {
    state: Arc<Mutex<FactoryState>>,
    request_id: Uuid,
    endpoint: String,
    parameters: TransportParameters,
    status: StatusCode,
    body: Vec<u8>,
    chunk_size: usize,
}

#[async_trait]
impl Exchange for MockExchange {
    async fn send(self: Box<Self>, request: OutboundRequest) -> Result<StreamingResponse> {
        let MockExchange {
            state,
            request_id,
            endpoint,
            parameters,
            status,
            body,
            chunk_size,
        } = *self;

        state.lock().requests.push(RecordedRequest {
            request_id,
            endpoint,
            parameters,
            path: request.path,
            headers: request.headers,
            body: request.body,
        });

        let chunks: Vec<io::Result<Bytes>> = body
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(StreamingResponse {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }
}

#[derive(Default)]
struct VerifierCalls {
    identifier: AtomicUsize,
    validate: AtomicUsize,
}

/// Verifier whose verdicts are configured per node identifier
///
/// Nodes map to unique identifier `uid-<node>` and validate with a one hour
/// expiry unless configured otherwise. Clones share call counters.
#[derive(Clone, Default)]
pub struct MockVerifier {
    identifier_errors: HashSet<String>,
    missing_identifiers: HashSet<String>,
    unidentified_after_validation: HashSet<String>,
    validation_failures: HashSet<String>,
    expiries: HashMap<String, Duration>,
    validation_delay: Option<std::time::Duration>,
    calls: Arc<VerifierCalls>,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier extraction fails for `node`
    pub fn with_identifier_error(mut self, node: &str) -> Self {
        self.identifier_errors.insert(node.to_string());
        self
    }

    /// `node` carries no unique identifier
    pub fn without_identifier(mut self, node: &str) -> Self {
        self.missing_identifiers.insert(node.to_string());
        self
    }

    /// Full validation of `node` succeeds but omits the identifier
    pub fn without_validated_identifier(mut self, node: &str) -> Self {
        self.unidentified_after_validation.insert(node.to_string());
        self
    }

    pub fn with_validation_failure(mut self, node: &str) -> Self {
        self.validation_failures.insert(node.to_string());
        self
    }

    /// Validated attestations of `node` expire `valid_for` from now
    pub fn with_expiry(mut self, node: &str, valid_for: Duration) -> Self {
        self.expiries.insert(node.to_string(), valid_for);
        self
    }

    /// Suspend inside every `validate` call for `delay`
    pub fn with_validation_delay(mut self, delay: std::time::Duration) -> Self {
        self.validation_delay = Some(delay);
        self
    }

    pub fn identifier_calls(&self) -> usize {
        self.calls.identifier.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.calls.validate.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationVerifier for MockVerifier {
    async fn unique_node_identifier(
        &self,
        attestation: &Attestation,
        _parameters: &PrefetchParameters,
    ) -> std::result::Result<Option<String>, VerificationError> {
        self.calls.identifier.fetch_add(1, Ordering::SeqCst);
        let node = &attestation.node_identifier;

        if self.identifier_errors.contains(node) {
            return Err(VerificationError::Malformed(format!("unreadable bundle for {}", node)));
        }
        if self.missing_identifiers.contains(node) {
            return Ok(None);
        }
        Ok(Some(format!("uid-{}", node)))
    }

    async fn validate(
        &self,
        attestation: &Attestation,
        _parameters: &PrefetchParameters,
    ) -> std::result::Result<ValidatedAttestation, VerificationError> {
        self.calls.validate.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.validation_delay {
            tokio::time::sleep(delay).await;
        }
        let node = &attestation.node_identifier;

        if self.validation_failures.contains(node) {
            return Err(VerificationError::Rejected(format!("measurement mismatch for {}", node)));
        }

        let valid_for = self.expiries.get(node).copied().unwrap_or_else(|| Duration::hours(1));
        let unique_node_identifier = if self.unidentified_after_validation.contains(node) {
            None
        } else {
            Some(format!("uid-{}", node))
        };

        Ok(ValidatedAttestation {
            attestation: attestation.clone(),
            unique_node_identifier,
            public_key: node.as_bytes().to_vec(),
            expiry: Utc::now() + valid_for,
            validated_cell_id: attestation.unvalidated_cell_id.clone(),
        })
    }
}

/// Records applied rate limits instead of enforcing them
#[derive(Clone, Default)]
pub struct RecordingRateLimiter {
    applied: Arc<Mutex<Vec<RateLimitConfiguration>>>,
    persists: Arc<AtomicUsize>,
}

impl RecordingRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<RateLimitConfiguration> {
        self.applied.lock().clone()
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimiter for RecordingRateLimiter {
    async fn apply(&self, configuration: RateLimitConfiguration) {
        self.applied.lock().push(configuration);
    }

    async fn persist(&self) {
        self.persists.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_script_exhausted() {
        let factory = MockConnectionFactory::new();
        factory.push_connect_error("refused");

        let params = TransportParameters {
            ignore_certificate_errors: false,
            force_ohttp: false,
            use_compression: true,
            bundle_identifier: None,
        };
        for _ in 0..2 {
            let result = factory.connect(&params, "https://attest.example.net", Uuid::new_v4()).await;
            assert!(matches!(result, Err(Error::Transport(_))));
        }
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_body_is_chunked() {
        let factory = MockConnectionFactory::new().with_chunk_size(3);
        factory.push_raw(200, vec![1, 2, 3, 4, 5, 6, 7]);

        let params = TransportParameters {
            ignore_certificate_errors: false,
            force_ohttp: false,
            use_compression: true,
            bundle_identifier: None,
        };
        let exchange = factory.connect(&params, "https://a", Uuid::new_v4()).await.unwrap();
        let response = exchange
            .send(OutboundRequest {
                path: "/p".into(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap();

        let sizes: Vec<usize> = response.body.map(|c| c.unwrap().len()).collect().await;
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(factory.requests()[0].path, "/p");
    }
}
