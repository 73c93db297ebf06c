//! Batched attestation prefetching
//!
//! `BatchedPrefetch` fetches attestations for a workload ahead of time, one
//! batch per round trip, and verifies and caches them so later requests can
//! skip the handshake.
//!
//! ```no_run
//! # async fn run(collaborators: attestation_prefetch::prefetch::Collaborators) -> attestation_prefetch::Result<()> {
//! use std::sync::Arc;
//! use attestation_prefetch::attestation::RequestParameters;
//! use attestation_prefetch::config::{Configuration, SystemInfo};
//! use attestation_prefetch::prefetch::{BatchedPrefetch, FetchType};
//!
//! let prefetch = BatchedPrefetch::new(
//!     collaborators,
//!     Arc::new(Configuration::default()),
//!     SystemInfo::detect(),
//!     RequestParameters::new("llm").with_argument("model", "m1"),
//!     FetchType::AllBatches,
//! );
//! for batch in prefetch.send_request().await? {
//!     println!("{}: {} nodes", batch.id, batch.nodes.len());
//! }
//! # Ok(())
//! # }
//! ```

mod fetcher;
pub mod headers;
pub mod types;
mod worker;

pub use fetcher::MAX_CONCURRENT_VERIFICATIONS;
pub use types::{BatchRequest, BatchResponse, FetchType, NodeOutcome, ValidationResult};
pub use worker::MAXIMUM_EXPIRY_DURATION_HOURS;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::attestation::{AttestationVerifier, PrefetchParameters, RequestParameters};
use crate::config::{Configuration, ServerDrivenConfiguration, SystemInfo};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::store::AttestationStore;
use crate::telemetry::EventSender;
use crate::transport::{ConnectionFactory, TransportParameters};

use fetcher::BatchFetcher;
use worker::{BatchContext, ReportingContext};

/// Batches whose worth of attestations must be cached to skip a full prefetch
pub const PREWARM_AVAILABILITY_BATCH_COUNT: usize = 3;

/// Services a prefetch depends on
#[derive(Clone)]
pub struct Collaborators {
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub store: Arc<dyn AttestationStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub verifier: Arc<dyn AttestationVerifier>,
    pub events: EventSender,
}

/// Effective per-invocation limits after applying server overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_attestations_per_request: usize,
    pub max_prefetch_batches: usize,
    pub prewarm_validity_secs: u64,
}

impl BatchLimits {
    /// The configured attestation count is a ceiling the server may only lower
    pub fn resolve(config: &Configuration, server: &ServerDrivenConfiguration) -> Self {
        let configured = config.max_prefetched_attestations;
        let requested = server.max_prefetched_attestations.unwrap_or(configured);

        Self {
            max_attestations_per_request: requested.min(configured).max(1),
            max_prefetch_batches: server.max_prefetch_batches.unwrap_or(config.max_prefetch_batches).max(1),
            prewarm_validity_secs: server
                .prewarm_attestations_validity_secs
                .unwrap_or(config.prewarm_attestations_validity_secs),
        }
    }

    /// Cached attestations needed to consider the workload warm
    pub fn prewarm_availability(&self) -> usize {
        self.max_attestations_per_request.saturating_mul(PREWARM_AVAILABILITY_BATCH_COUNT)
    }

    /// Oldest fetch time still counted as warm
    ///
    /// A window reaching past the representable range counts every cached
    /// attestation.
    pub fn fresh_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.prewarm_validity_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// One prefetch invocation for a workload
pub struct BatchedPrefetch {
    collaborators: Collaborators,
    config: Arc<Configuration>,
    server_config: ServerDrivenConfiguration,
    system_info: SystemInfo,
    parameters: RequestParameters,
    fetch_type: FetchType,
    prewarm: bool,
    bundle_identifier: Option<String>,
    feature_identifier: Option<String>,
    batch_uuid: Uuid,
}

impl BatchedPrefetch {
    pub fn new(
        collaborators: Collaborators,
        config: Arc<Configuration>,
        system_info: SystemInfo,
        parameters: RequestParameters,
        fetch_type: FetchType,
    ) -> Self {
        Self {
            collaborators,
            config,
            server_config: ServerDrivenConfiguration::default(),
            system_info,
            parameters,
            fetch_type,
            prewarm: false,
            bundle_identifier: None,
            feature_identifier: None,
            batch_uuid: Uuid::new_v4(),
        }
    }

    pub fn with_server_config(mut self, server_config: ServerDrivenConfiguration) -> Self {
        self.server_config = server_config;
        self
    }

    /// Fetch on behalf of a caller instead of in the background
    ///
    /// Prewarms must name the bundle and feature they are for.
    pub fn prewarm(mut self) -> Self {
        self.prewarm = true;
        self
    }

    pub fn with_bundle_identifier(mut self, bundle_identifier: impl Into<String>) -> Self {
        self.bundle_identifier = Some(bundle_identifier.into());
        self
    }

    pub fn with_feature_identifier(mut self, feature_identifier: impl Into<String>) -> Self {
        self.feature_identifier = Some(feature_identifier.into());
        self
    }

    pub fn batch_uuid(&self) -> Uuid {
        self.batch_uuid
    }

    /// Run every batch of this invocation in order
    ///
    /// Returns one response per fetched batch. Invalid request parameters
    /// yield no batches rather than an error. The first failing batch aborts
    /// the invocation and its error is returned.
    pub async fn send_request(&self) -> Result<Vec<BatchResponse>> {
        let span = info_span!("prefetch", batch_uuid = %self.batch_uuid, prewarm = self.prewarm);
        self.run().instrument(span).await
    }

    async fn run(&self) -> Result<Vec<BatchResponse>> {
        info!("executing batch of prefetch requests");

        let Some(parameters) = PrefetchParameters::derive(&self.parameters) else {
            error!("invalid set of parameters for prefetching");
            return Ok(Vec::new());
        };

        let limits = BatchLimits::resolve(&self.config, &self.server_config);
        let batch_ids = self.fetch_type.batch_ids(limits.max_prefetch_batches);
        info!(
            max_attestations = limits.max_attestations_per_request,
            max_prefetch_batches = limits.max_prefetch_batches,
            batches = batch_ids.clone().count(),
            prewarm_availability = limits.prewarm_availability(),
            "configuration"
        );

        if self.fetch_type == FetchType::AllBatches {
            let since = limits.fresh_since(Utc::now());
            if self
                .collaborators
                .store
                .attestations_exist(&parameters, limits.prewarm_availability(), since)
                .await
            {
                error!(%parameters, "not prefetching, attestations exist for workload");
                return Err(Error::AttestationsExist);
            }
        }

        let (bundle_id, feature_id) = self.caller_identifiers()?;
        let mut request_headers = self.base_headers(&parameters, bundle_id.as_deref(), &feature_id)?;

        let transport = TransportParameters {
            ignore_certificate_errors: self.config.ignore_certificate_errors,
            force_ohttp: self.config.force_ohttp,
            use_compression: true,
            bundle_identifier: self.bundle_identifier.clone(),
        };
        let reporting = ReportingContext {
            environment: self.config.environment.name().to_string(),
            client_info: self.system_info.os_info.clone(),
            locale: self.system_info.locale.clone(),
            bundle_id,
            feature_id: Some(feature_id),
        };

        let fetch_time = Utc::now();
        let mut responses = Vec::new();

        for batch_id in batch_ids {
            let request_id = Uuid::new_v4();
            let request_id_for_reporting = if self.config.environment.separates_reporting_ids() {
                Uuid::new_v4()
            } else {
                request_id
            };
            request_headers.insert(
                HeaderName::from_static(headers::REQUEST_UUID),
                HeaderValue::from_str(&request_id.to_string())?,
            );

            let ctx = Arc::new(BatchContext {
                store: Arc::clone(&self.collaborators.store),
                verifier: Arc::clone(&self.collaborators.verifier),
                events: self.collaborators.events.clone(),
                parameters: parameters.clone(),
                prewarm: self.prewarm,
                request: BatchRequest {
                    request_id,
                    request_id_for_reporting,
                    batch_id,
                    fetch_time,
                },
                reporting: reporting.clone(),
            });

            let fetcher = BatchFetcher {
                connection_factory: self.collaborators.connection_factory.as_ref(),
                rate_limiter: self.collaborators.rate_limiter.as_ref(),
                config: &self.config,
                transport: &transport,
                headers: &request_headers,
                max_attestations: limits.max_attestations_per_request,
            };

            let span = info_span!(
                "prefetch_batch",
                %request_id,
                %request_id_for_reporting,
                batch_id
            );
            match fetcher.fetch_batch(ctx).instrument(span).await {
                Ok((response, saved)) => {
                    let duplicates = response.nodes.len() - saved;
                    info!(batch_id, saved, duplicates, "attestations saved");
                    responses.push(response);
                }
                Err(e) => {
                    error!(batch_id, error = %e, "failed to fetch batch");
                    return Err(e);
                }
            }
        }

        info!(batches = responses.len(), "finished batch of prefetch requests");
        Ok(responses)
    }

    /// Bundle and feature identifiers the traffic is attributed to
    fn caller_identifiers(&self) -> Result<(Option<String>, String)> {
        if self.prewarm {
            let Some(bundle_id) = self.bundle_identifier.clone() else {
                error!("not prefetching, missing bundle identifier");
                return Err(Error::MissingBundleIdentifier);
            };
            let Some(feature_id) = self.feature_identifier.clone() else {
                error!("not prefetching, missing feature identifier");
                return Err(Error::MissingFeatureIdentifier);
            };
            Ok((Some(bundle_id), feature_id))
        } else {
            Ok((
                self.config.default_bundle_identifier.clone(),
                headers::DEFAULT_FEATURE_ID.to_string(),
            ))
        }
    }

    fn base_headers(
        &self,
        parameters: &PrefetchParameters,
        bundle_id: Option<&str>,
        feature_id: &str,
    ) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        let mut set = |name: &'static str, value: &str| -> Result<()> {
            map.insert(HeaderName::from_static(name), HeaderValue::from_str(value)?);
            Ok(())
        };

        set(headers::CLIENT_INFO, &self.system_info.os_info)?;
        set(headers::WORKLOAD, parameters.pipeline_kind())?;
        set(headers::WORKLOAD_PARAMETERS, &parameters.workload_parameters_json()?)?;
        set(headers::FEATURE_ID, feature_id)?;
        if let Some(bundle_id) = bundle_id {
            set(headers::BUNDLE_ID, bundle_id)?;
        }
        if let Some(group) = &self.system_info.automated_device_group {
            set(headers::AUTOMATED_DEVICE_GROUP, group)?;
        }
        if let Some(test_options) = &self.config.test_options {
            set(headers::TEST_OPTIONS, test_options)?;
        }
        if let Some(cell_id) = &self.config.override_cell_id {
            set(headers::SERVER_HINT, cell_id)?;
            set(headers::SERVER_HINT_FORCE, "true")?;
        }

        map.insert(CONTENT_TYPE, HeaderValue::from_static(headers::CONTENT_TYPE_PROTOBUF));
        map.insert(USER_AGENT, HeaderValue::from_str(&self.config.user_agent)?);
        Ok(map)
    }
}
