//! Per-attestation verification
//!
//! Each received attestation is processed by one task:
//!
//! ```text
//! received -> identifier known to the store?
//!     yes -> track for batch -> NodeAlreadyExistsInBatch | ValidationNotNeeded
//!     no  -> validate -> Valid | Invalid | NoUniqueIdentifier | ValidatedExpiryTooLarge
//!                     | NodeAlreadyExistsInBatch (a concurrent task saved it first)
//! ```
//!
//! Failures never escape a task; every path ends in a `NodeOutcome`.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::attestation::{AttestationVerifier, PrefetchParameters};
use crate::error::VerificationError;
use crate::proto::Attestation;
use crate::store::{AttestationStore, SaveOutcome};
use crate::telemetry::{self, EventSender, PrefetchEvent, Reportable, VerificationErrorMetric};

use super::types::{BatchRequest, NodeOutcome, ValidationResult};

/// Attestations may not be valid for longer than this
pub const MAXIMUM_EXPIRY_DURATION_HOURS: i64 = 48;

/// Invocation details copied into verification error metrics
#[derive(Debug, Clone)]
pub(crate) struct ReportingContext {
    pub environment: String,
    pub client_info: String,
    pub locale: String,
    pub bundle_id: Option<String>,
    pub feature_id: Option<String>,
}

/// State shared by the verification tasks of one batch
pub(crate) struct BatchContext {
    pub store: Arc<dyn AttestationStore>,
    pub verifier: Arc<dyn AttestationVerifier>,
    pub events: EventSender,
    pub parameters: PrefetchParameters,
    pub prewarm: bool,
    pub request: BatchRequest,
    pub reporting: ReportingContext,
}

impl BatchContext {
    fn verification_error_metric(
        &self,
        attestation: &Attestation,
        error: &VerificationError,
        elapsed: StdDuration,
    ) -> VerificationErrorMetric {
        VerificationErrorMetric {
            client_request_id: self.request.request_id_for_reporting,
            event_time: Utc::now(),
            environment: self.reporting.environment.clone(),
            client_info: self.reporting.client_info.clone(),
            feature_id: self.reporting.feature_id.clone(),
            bundle_id: self.reporting.bundle_id.clone(),
            locale: self.reporting.locale.clone(),
            // Always part of the prefetch flow here
            is_prefetched_attestation: true,
            node_identifier: attestation.node_identifier.clone(),
            error: error.public_description(),
            verification_time_ms: elapsed.as_millis() as i64,
        }
    }
}

fn expiry_too_large(expiry: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expiry - now > Duration::hours(MAXIMUM_EXPIRY_DURATION_HOURS)
}

pub(crate) async fn verify_and_store(attestation: Attestation, ctx: &BatchContext) -> NodeOutcome {
    let node = attestation.node_identifier.as_str();
    let prefetched = !ctx.prewarm;

    match ctx.verifier.unique_node_identifier(&attestation, &ctx.parameters).await {
        Ok(Some(uid)) => {
            if ctx.store.node_exists(&uid).await {
                debug!(node, uid = %uid, "node exists in store");
                let already_tracked = ctx
                    .store
                    .track_node_for_parameters(
                        &ctx.parameters,
                        &uid,
                        prefetched,
                        ctx.request.batch_id,
                        ctx.request.fetch_time,
                    )
                    .await;

                return if already_tracked {
                    NodeOutcome::new(&attestation, ValidationResult::NodeAlreadyExistsInBatch, false, Some(uid))
                } else {
                    NodeOutcome::new(&attestation, ValidationResult::ValidationNotNeeded, true, Some(uid))
                };
            }
        }
        Ok(None) => {
            error!(node, "unique identifier for attestation missing");
            return NodeOutcome::new(&attestation, ValidationResult::NoUniqueIdentifier, false, None);
        }
        Err(e) => {
            error!(node, error = %e, "unable to check the unique id of the attestation, skipping validation");
            return NodeOutcome::new(
                &attestation,
                ValidationResult::Invalid { error: e.to_string() },
                false,
                None,
            );
        }
    }

    let started = Instant::now();
    let validated = match ctx.verifier.validate(&attestation, &ctx.parameters).await {
        Ok(validated) => validated,
        Err(e) => {
            error!(node, error = %e, "attestation validation failed");
            let metric = ctx.verification_error_metric(&attestation, &e, started.elapsed());
            telemetry::emit(&ctx.events, PrefetchEvent::ExportMetric(metric));
            return NodeOutcome::new(
                &attestation,
                ValidationResult::Invalid { error: e.to_string() },
                false,
                None,
            );
        }
    };

    let Some(uid) = validated.unique_node_identifier.clone() else {
        error!(node, "attestation validation did not return a unique id");
        return NodeOutcome::new(&attestation, ValidationResult::NoUniqueIdentifier, false, None);
    };

    if expiry_too_large(validated.expiry, Utc::now()) {
        error!(node, expiry = %validated.expiry, "attestation validation returned too long expiration");
        return NodeOutcome::new(&attestation, ValidationResult::ValidatedExpiryTooLarge, false, None);
    }

    let saved = match ctx
        .store
        .save_validated_attestation(
            &validated,
            &ctx.parameters,
            prefetched,
            ctx.request.batch_id,
            ctx.request.fetch_time,
        )
        .await
    {
        SaveOutcome::Saved => {
            debug!(node, "saved attestation");
            true
        }
        SaveOutcome::AlreadyTracked => {
            info!(node, uid = %uid, "node stored concurrently for this batch");
            return NodeOutcome::new(&attestation, ValidationResult::NodeAlreadyExistsInBatch, false, Some(uid));
        }
        SaveOutcome::Rejected => {
            info!(node, "attestation not saved, store rejected the write");
            false
        }
    };

    NodeOutcome::new(
        &attestation,
        ValidationResult::Valid {
            public_key: validated.public_key,
            expiry: validated.expiry,
        },
        saved,
        Some(uid),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::RequestParameters;
    use crate::mock::MockVerifier;
    use crate::store::InMemoryAttestationStore;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn attestation(node: &str) -> Attestation {
        Attestation {
            node_identifier: node.to_string(),
            attestation_bundle: node.as_bytes().to_vec(),
            cloudos_version: "1.2".into(),
            cloudos_release_type: "release".into(),
            ..Default::default()
        }
    }

    fn context(
        verifier: MockVerifier,
        store: Arc<InMemoryAttestationStore>,
    ) -> (BatchContext, mpsc::UnboundedReceiver<PrefetchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let request_id = Uuid::new_v4();
        let ctx = BatchContext {
            store,
            verifier: Arc::new(verifier),
            events,
            parameters: PrefetchParameters::derive(&RequestParameters::new("llm")).unwrap(),
            prewarm: false,
            request: BatchRequest {
                request_id,
                request_id_for_reporting: Uuid::new_v4(),
                batch_id: 0,
                fetch_time: Utc::now(),
            },
            reporting: ReportingContext {
                environment: "production".into(),
                client_info: "linux; x86_64".into(),
                locale: "en_US".into(),
                bundle_id: Some("com.example.app".into()),
                feature_id: None,
            },
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_valid_attestation_saved() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let (ctx, _rx) = context(MockVerifier::new(), store.clone());

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert!(matches!(outcome.validation_result, ValidationResult::Valid { .. }));
        assert!(outcome.saved_to_cache);
        assert_eq!(outcome.unique_node_identifier.as_deref(), Some("uid-n1"));
        assert_eq!(outcome.cloud_os_version, "1.2");
        assert!(store.node_exists("uid-n1").await);
    }

    #[tokio::test]
    async fn test_known_node_not_revalidated() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let verifier = MockVerifier::new();
        let (ctx, _rx) = context(verifier.clone(), store.clone());

        verify_and_store(attestation("n1"), &ctx).await;
        let second = verify_and_store(attestation("n1"), &ctx).await;
        assert_eq!(second.validation_result, ValidationResult::NodeAlreadyExistsInBatch);
        assert!(!second.saved_to_cache);

        let mut next_batch = context(verifier.clone(), store.clone()).0;
        next_batch.request.batch_id = 1;
        let third = verify_and_store(attestation("n1"), &next_batch).await;
        assert_eq!(third.validation_result, ValidationResult::ValidationNotNeeded);
        assert!(third.saved_to_cache);

        assert_eq!(verifier.validate_calls(), 1);
    }

    #[tokio::test]
    async fn test_identifier_error_is_invalid() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let verifier = MockVerifier::new().with_identifier_error("n1");
        let (ctx, mut rx) = context(verifier.clone(), store);

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert!(matches!(outcome.validation_result, ValidationResult::Invalid { .. }));
        assert!(!outcome.saved_to_cache);
        assert_eq!(verifier.validate_calls(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_identifier() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let (ctx, _rx) = context(MockVerifier::new().without_identifier("n1"), store);

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert_eq!(outcome.validation_result, ValidationResult::NoUniqueIdentifier);
        assert!(!outcome.saved_to_cache);
        assert!(outcome.unique_node_identifier.is_none());
    }

    #[tokio::test]
    async fn test_validated_without_identifier_not_saved() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let (ctx, _rx) = context(MockVerifier::new().without_validated_identifier("n1"), store.clone());

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert_eq!(outcome.validation_result, ValidationResult::NoUniqueIdentifier);
        assert!(!outcome.saved_to_cache);
        assert!(store.all_nodes_and_attestations().await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_emits_metric() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let (ctx, mut rx) = context(MockVerifier::new().with_validation_failure("n1"), store.clone());

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert!(matches!(outcome.validation_result, ValidationResult::Invalid { .. }));
        assert!(!outcome.saved_to_cache);
        assert!(!store.node_exists("uid-n1").await);

        match rx.try_recv().unwrap() {
            PrefetchEvent::ExportMetric(metric) => {
                assert_eq!(metric.client_request_id, ctx.request.request_id_for_reporting);
                assert_eq!(metric.node_identifier, "n1");
                assert_eq!(metric.error, "verification.rejected");
                assert_eq!(metric.bundle_id.as_deref(), Some("com.example.app"));
                assert!(metric.is_prefetched_attestation);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expiry_too_large_never_cached() {
        let store = Arc::new(InMemoryAttestationStore::new());
        let verifier = MockVerifier::new().with_expiry("n1", Duration::hours(49));
        let (ctx, _rx) = context(verifier, store.clone());

        let outcome = verify_and_store(attestation("n1"), &ctx).await;
        assert_eq!(outcome.validation_result, ValidationResult::ValidatedExpiryTooLarge);
        assert!(!outcome.saved_to_cache);
        assert!(store.all_nodes_and_attestations().await.is_empty());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        assert!(!expiry_too_large(now + Duration::hours(48), now));
        assert!(expiry_too_large(now + Duration::hours(48) + Duration::seconds(1), now));
    }
}
