//! One prefetch round trip: request, streamed response, bounded verification

use std::pin::pin;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use prost::Message;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::framing::deframed;
use crate::proto::{prefetch_response, PrefetchRequest, PrefetchResponse, RateLimitConfigurationList};
use crate::rate_limit::{RateLimitConfiguration, RateLimiter};
use crate::telemetry::{self, NodeSource, PrefetchEvent};
use crate::transport::{ConnectionFactory, OutboundRequest, TransportParameters};

use super::types::{BatchResponse, NodeOutcome};
use super::worker::{verify_and_store, BatchContext};

/// Verification tasks allowed in flight per batch
pub const MAX_CONCURRENT_VERIFICATIONS: usize = 10;

pub(crate) struct BatchFetcher<'a> {
    pub connection_factory: &'a dyn ConnectionFactory,
    pub rate_limiter: &'a dyn RateLimiter,
    pub config: &'a Configuration,
    pub transport: &'a TransportParameters,
    pub headers: &'a HeaderMap,
    pub max_attestations: usize,
}

/// Running totals of one batch
struct Collected {
    response: BatchResponse,
    saved: usize,
    node_ids: Vec<String>,
}

impl Collected {
    fn fold(&mut self, joined: std::result::Result<NodeOutcome, JoinError>) {
        let node = match joined {
            Ok(node) => node,
            Err(e) => {
                error!(error = %e, "verification task failed");
                return;
            }
        };

        if node.saved_to_cache {
            self.saved += 1;
        }
        if let Some(uid) = &node.unique_node_identifier {
            self.node_ids.push(uid.clone());
        }
        self.response.nodes.push(node);
    }
}

impl BatchFetcher<'_> {
    /// Fetch and process one batch
    ///
    /// Returns the processed nodes and how many of them were saved.
    pub async fn fetch_batch(&self, ctx: Arc<BatchContext>) -> Result<(BatchResponse, usize)> {
        let request_id = ctx.request.request_id;
        info!("executing prefetch request");

        let exchange = self
            .connection_factory
            .connect(self.transport, &self.config.service_url, request_id)
            .await?;

        let requested = u32::try_from(self.max_attestations).unwrap_or(u32::MAX);
        let body = PrefetchRequest::streaming(requested).encode_to_vec();
        debug!(
            authority = self.config.service_hostname(),
            path = %self.config.prefetch_request_path,
            parameters = %ctx.parameters,
            "sending request"
        );

        let response = exchange
            .send(OutboundRequest {
                path: self.config.prefetch_request_path.clone(),
                headers: self.headers.clone(),
                body: body.into(),
            })
            .await?;

        info!(status = %response.status, "response head received");
        if response.status != StatusCode::OK {
            return Err(Error::UnexpectedStatusCode(response.status.as_u16()));
        }
        ctx.store.delete_entries(&ctx.parameters, ctx.request.batch_id).await;

        let mut collected = Collected {
            response: BatchResponse::new(request_id),
            saved: 0,
            node_ids: Vec::new(),
        };
        let mut received = 0usize;
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        let mut messages = pin!(deframed::<PrefetchResponse>(response.body, self.config.max_frame_length));

        while let Some(message) = messages.next().await {
            let message = message.inspect_err(|e| error!(error = %e, "response failed"))?;

            match message.r#type {
                Some(prefetch_response::Type::Attestation(attestation)) => {
                    debug!("attestation received");
                    received += 1;

                    if tasks.len() == MAX_CONCURRENT_VERIFICATIONS {
                        if let Some(joined) = tasks.join_next().await {
                            collected.fold(joined);
                        }
                    }

                    // In-flight tasks count toward the cap; they always finish
                    if collected.response.nodes.len() + tasks.len() >= self.max_attestations {
                        debug!(node = %attestation.node_identifier, "attestation cap reached, skipping");
                        continue;
                    }

                    let ctx = Arc::clone(&ctx);
                    tasks.spawn(async move { verify_and_store(attestation, &ctx).await }.in_current_span());
                }
                Some(prefetch_response::Type::RateLimitConfigurationList(list)) => {
                    self.apply_rate_limits(list).await;
                }
                None => {}
            }
        }

        info!("response complete");
        while let Some(joined) = tasks.join_next().await {
            collected.fold(joined);
        }

        if received == 0 {
            warn!("prefetch returned empty response");
            return Err(Error::EmptyPrefetchResponse);
        }

        let source = if ctx.prewarm { NodeSource::Prewarm } else { NodeSource::Prefetch };
        telemetry::emit(
            &ctx.events,
            PrefetchEvent::NodesReceived {
                node_ids: collected.node_ids,
                source,
            },
        );

        Ok((collected.response, collected.saved))
    }

    async fn apply_rate_limits(&self, list: RateLimitConfigurationList) {
        info!(count = list.rate_limit_configuration.len(), "received rate limit configuration");

        for proto in &list.rate_limit_configuration {
            match RateLimitConfiguration::from_proto(Utc::now(), proto, self.config) {
                Ok(configuration) => self.rate_limiter.apply(configuration).await,
                Err(e) => error!(error = %e, "unable to process rate limit configuration"),
            }
        }
        self.rate_limiter.persist().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{PrefetchParameters, RequestParameters};
    use crate::mock::{attestation, MockConnectionFactory, MockVerifier, RecordingRateLimiter};
    use crate::proto::RateLimitConfiguration as WireRateLimit;
    use std::time::Duration as StdDuration;
    use crate::store::InMemoryAttestationStore;
    use crate::prefetch::types::{BatchRequest, ValidationResult};
    use crate::prefetch::worker::ReportingContext;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        factory: MockConnectionFactory,
        limiter: RecordingRateLimiter,
        verifier: MockVerifier,
        store: Arc<InMemoryAttestationStore>,
        config: Configuration,
        events: mpsc::UnboundedReceiver<PrefetchEvent>,
        ctx: Arc<BatchContext>,
    }

    impl Harness {
        fn new(verifier: MockVerifier) -> Self {
            let store = Arc::new(InMemoryAttestationStore::new());
            let (tx, events) = mpsc::unbounded_channel();
            let ctx = Arc::new(BatchContext {
                store: store.clone(),
                verifier: Arc::new(verifier.clone()),
                events: tx,
                parameters: PrefetchParameters::derive(&RequestParameters::new("llm")).unwrap(),
                prewarm: false,
                request: BatchRequest {
                    request_id: Uuid::new_v4(),
                    request_id_for_reporting: Uuid::new_v4(),
                    batch_id: 0,
                    fetch_time: Utc::now(),
                },
                reporting: ReportingContext {
                    environment: "development".into(),
                    client_info: "test".into(),
                    locale: "en_US".into(),
                    bundle_id: None,
                    feature_id: None,
                },
            });

            Self {
                factory: MockConnectionFactory::new(),
                limiter: RecordingRateLimiter::new(),
                verifier,
                store,
                config: Configuration::default(),
                events,
                ctx,
            }
        }

        async fn fetch(&self, max_attestations: usize) -> Result<(BatchResponse, usize)> {
            let transport = TransportParameters {
                ignore_certificate_errors: false,
                force_ohttp: false,
                use_compression: true,
                bundle_identifier: None,
            };
            let headers = HeaderMap::new();
            BatchFetcher {
                connection_factory: &self.factory,
                rate_limiter: &self.limiter,
                config: &self.config,
                transport: &transport,
                headers: &headers,
                max_attestations,
            }
            .fetch_batch(self.ctx.clone())
            .await
        }
    }

    fn attestations(nodes: &[&str]) -> Vec<PrefetchResponse> {
        nodes.iter().map(|n| PrefetchResponse::attestation(attestation(n))).collect()
    }

    #[tokio::test]
    async fn test_request_body_and_delete_before_processing() {
        let h = Harness::new(MockVerifier::new());
        h.factory.push_response(200, attestations(&["a", "b"]));

        let (response, saved) = h.fetch(5).await.unwrap();
        assert_eq!(response.id, h.ctx.request.request_id);
        assert_eq!(response.nodes.len(), 2);
        assert_eq!(saved, 2);

        let requests = h.factory.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, h.ctx.request.request_id);
        assert_eq!(requests[0].path, "/v1/prefetch");
        let body = PrefetchRequest::decode(requests[0].body.clone()).unwrap();
        assert_eq!(body, PrefetchRequest::streaming(5));
    }

    #[tokio::test]
    async fn test_duplicate_node_saved_once() {
        let h = Harness::new(MockVerifier::new());
        h.factory.push_response(200, attestations(&["a", "a"]));

        let (response, saved) = h.fetch(10).await.unwrap();
        assert_eq!(response.nodes.len(), 2);
        assert_eq!(saved, 1);
        assert_eq!(response.nodes.iter().filter(|n| n.saved_to_cache).count(), 1);
        assert_eq!(h.store.tracked_count(&h.ctx.parameters, 0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_validated_concurrently() {
        // Both copies are past the cache check before either is saved
        let h = Harness::new(MockVerifier::new().with_validation_delay(StdDuration::from_millis(20)));
        h.factory.push_response(200, attestations(&["a", "a"]));

        let (response, saved) = h.fetch(10).await.unwrap();
        assert_eq!(h.verifier.validate_calls(), 2);
        assert_eq!(saved, 1);
        assert_eq!(h.store.tracked_count(&h.ctx.parameters, 0), 1);

        let mut outcomes: Vec<(bool, bool)> = response
            .nodes
            .iter()
            .map(|n| {
                let valid = matches!(n.validation_result, ValidationResult::Valid { .. });
                let duplicate = n.validation_result == ValidationResult::NodeAlreadyExistsInBatch;
                assert!(valid || duplicate, "unexpected result {:?}", n.validation_result);
                assert_eq!(n.saved_to_cache, valid);
                assert_eq!(n.unique_node_identifier.as_deref(), Some("uid-a"));
                (valid, duplicate)
            })
            .collect();
        outcomes.sort();
        assert_eq!(outcomes, vec![(false, true), (true, false)]);
    }

    #[tokio::test]
    async fn test_cutoff_limits_verifications() {
        let h = Harness::new(MockVerifier::new());
        h.factory
            .push_response(200, attestations(&["n1", "n2", "n3", "n4", "n5", "n6", "n7"]));

        let (response, saved) = h.fetch(3).await.unwrap();
        assert_eq!(response.nodes.len(), 3);
        assert_eq!(saved, 3);
        assert_eq!(h.verifier.identifier_calls(), 3);
        assert_eq!(h.verifier.validate_calls(), 3);
    }

    #[tokio::test]
    async fn test_more_than_concurrency_limit() {
        let h = Harness::new(MockVerifier::new());
        let nodes: Vec<String> = (0..25).map(|i| format!("n{}", i)).collect();
        let refs: Vec<&str> = nodes.iter().map(String::as_str).collect();
        h.factory.push_response(200, attestations(&refs));

        let (response, saved) = h.fetch(60).await.unwrap();
        assert_eq!(response.nodes.len(), 25);
        assert_eq!(saved, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cutoff_above_concurrency_limit() {
        let h = Harness::new(MockVerifier::new().with_validation_delay(StdDuration::from_millis(20)));
        let nodes: Vec<String> = (0..25).map(|i| format!("n{}", i)).collect();
        let refs: Vec<&str> = nodes.iter().map(String::as_str).collect();
        h.factory.push_response(200, attestations(&refs));

        let (response, saved) = h.fetch(15).await.unwrap();
        assert_eq!(response.nodes.len(), 15);
        assert_eq!(saved, 15);
        assert_eq!(h.verifier.identifier_calls(), 15);
        assert_eq!(h.verifier.validate_calls(), 15);
    }

    #[tokio::test]
    async fn test_requested_count_saturates() {
        let h = Harness::new(MockVerifier::new());
        h.factory.push_response(200, attestations(&["a"]));

        let (response, _) = h.fetch(usize::MAX).await.unwrap();
        assert_eq!(response.nodes.len(), 1);
        let body = PrefetchRequest::decode(h.factory.requests()[0].body.clone()).unwrap();
        assert_eq!(body, PrefetchRequest::streaming(u32::MAX));
    }

    #[tokio::test]
    async fn test_rate_limits_only_is_empty_response() {
        let h = Harness::new(MockVerifier::new());
        let list = RateLimitConfigurationList {
            rate_limit_configuration: vec![
                WireRateLimit {
                    request_count: 2,
                    duration_seconds: 60.0,
                    ttl_seconds: 300.0,
                    ..Default::default()
                },
                // Zero window is malformed and skipped
                WireRateLimit {
                    request_count: 2,
                    duration_seconds: 0.0,
                    ttl_seconds: 300.0,
                    ..Default::default()
                },
            ],
        };
        h.factory.push_response(200, vec![PrefetchResponse::rate_limits(list)]);

        let result = h.fetch(5).await;
        assert!(matches!(result, Err(Error::EmptyPrefetchResponse)));
        assert_eq!(h.limiter.applied().len(), 1);
        assert_eq!(h.limiter.persist_count(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let h = Harness::new(MockVerifier::new());
        h.factory.push_response(503, attestations(&["a"]));

        let result = h.fetch(5).await;
        assert!(matches!(result, Err(Error::UnexpectedStatusCode(503))));
        assert_eq!(h.verifier.identifier_calls(), 0);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails_batch() {
        let h = Harness::new(MockVerifier::new());
        let mut body = crate::framing::encode_frame(&PrefetchResponse::attestation(attestation("a"))).to_vec();
        body.extend_from_slice(&[0, 0, 0, 9, 1]);
        h.factory.push_raw(200, body);

        let result = h.fetch(5).await;
        assert!(matches!(result, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn test_nodes_received_event() {
        let mut h = Harness::new(MockVerifier::new().without_identifier("b"));
        h.factory.push_response(200, attestations(&["a", "b", "c"]));

        let (response, _) = h.fetch(5).await.unwrap();
        assert!(response
            .nodes
            .iter()
            .any(|n| n.validation_result == ValidationResult::NoUniqueIdentifier));

        match h.events.try_recv().unwrap() {
            PrefetchEvent::NodesReceived { mut node_ids, source } => {
                node_ids.sort();
                assert_eq!(node_ids, vec!["uid-a".to_string(), "uid-c".to_string()]);
                assert_eq!(source, NodeSource::Prefetch);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
