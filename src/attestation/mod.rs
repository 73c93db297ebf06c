//! Attestation verification capability
//!
//! Verifying the evidence itself (signatures, measurements, transparency
//! proofs) is delegated to an `AttestationVerifier` supplied by the caller.
//! The prefetch pipeline only needs two operations from it:
//!
//! - a cheap extraction of the node's unique identifier, used to skip full
//!   validation for nodes already in the store
//! - full validation, yielding the node's public key and attestation expiry

pub mod types;

pub use types::{PrefetchParameters, RequestParameters, ValidatedAttestation};

use async_trait::async_trait;

use crate::error::VerificationError;
use crate::proto::Attestation;

#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    /// Unique identifier of the node, or `None` if the evidence carries none
    async fn unique_node_identifier(
        &self,
        attestation: &Attestation,
        parameters: &PrefetchParameters,
    ) -> Result<Option<String>, VerificationError>;

    /// Fully validate the evidence
    async fn validate(
        &self,
        attestation: &Attestation,
        parameters: &PrefetchParameters,
    ) -> Result<ValidatedAttestation, VerificationError>;
}
