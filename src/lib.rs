//! # Attestation Prefetch Client
//!
//! Fetches, verifies and caches node attestations for a workload ahead of
//! time, so requests to the confidential compute service can start without
//! a round trip for attestation evidence.
//!
//! ## Pipeline
//!
//! ### Batch Orchestrator
//! - Derives the workload identity from the invocation parameters
//! - Skips the fetch entirely when enough fresh attestations are cached
//! - Runs one round trip per batch, strictly in order, failing fast
//!
//! ### Batch Fetcher
//! - POSTs a protobuf `PrefetchRequest` and reads back a stream of
//!   length-prefixed `PrefetchResponse` frames
//! - Verifies up to ten attestations concurrently and stops submitting once
//!   the per-request cap is reached
//! - Applies server-pushed rate limit configuration as it arrives
//!
//! ### Verification Worker
//! - Skips full validation for nodes already in the cache
//! - Rejects attestations valid for more than 48 hours
//! - Reports validation failures as privacy-safe metrics
//!
//! ## Collaborators
//!
//! Verification, storage, rate limiting and transport are traits. The crate
//! ships `HttpConnectionFactory` (reqwest over rustls),
//! `InMemoryAttestationStore` and `InMemoryRateLimiter`; the verifier is
//! always supplied by the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use attestation_prefetch::{
//!     BatchedPrefetch, Collaborators, Configuration, FetchType, HttpConnectionFactory,
//!     InMemoryAttestationStore, InMemoryRateLimiter, RequestParameters, SystemInfo,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Configuration::load("prefetch.json").await?);
//!     let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//!
//!     let collaborators = Collaborators {
//!         connection_factory: Arc::new(HttpConnectionFactory::new()),
//!         store: Arc::new(InMemoryAttestationStore::new()),
//!         rate_limiter: Arc::new(InMemoryRateLimiter::load("rate-limits.json").await?),
//!         verifier: Arc::new(MyVerifier::new()),
//!         events,
//!     };
//!
//!     let responses = BatchedPrefetch::new(
//!         collaborators,
//!         config,
//!         SystemInfo::detect(),
//!         RequestParameters::new("llm").with_argument("model", "m1"),
//!         FetchType::AllBatches,
//!     )
//!     .send_request()
//!     .await?;
//!
//!     for batch in responses {
//!         println!("{}: {} nodes, {} saved", batch.id, batch.nodes.len(), batch.saved_count());
//!     }
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod framing;
pub mod prefetch;
pub mod proto;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
pub mod tls;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use attestation::{AttestationVerifier, PrefetchParameters, RequestParameters, ValidatedAttestation};
pub use config::{Configuration, Environment, ServerDrivenConfiguration, SystemInfo};
pub use error::{Error, Result, VerificationError};
pub use prefetch::{BatchResponse, BatchedPrefetch, Collaborators, FetchType, NodeOutcome, ValidationResult};
pub use rate_limit::{InMemoryRateLimiter, RateLimiter};
pub use store::{AttestationStore, InMemoryAttestationStore};
pub use telemetry::{EventSender, PrefetchEvent};
pub use transport::{ConnectionFactory, HttpConnectionFactory};
