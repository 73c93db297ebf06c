//! Request and outcome types of the prefetch pipeline

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::proto::Attestation;

/// Which batches one prefetch invocation fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchType {
    /// Batches `0..max_prefetch_batches`, unless the cache is already warm
    AllBatches,

    /// Top up one batch after an invocation consumed it
    SingleBatch(u64),
}

impl FetchType {
    pub fn batch_ids(&self, max_prefetch_batches: usize) -> RangeInclusive<u64> {
        match *self {
            FetchType::AllBatches => 0..=(max_prefetch_batches.max(1) as u64 - 1),
            FetchType::SingleBatch(batch_id) => batch_id..=batch_id,
        }
    }
}

/// Identifiers and timing of one network round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// Sent to the server for correlation
    pub request_id: Uuid,

    /// Used in telemetry; differs from `request_id` in production
    pub request_id_for_reporting: Uuid,

    pub batch_id: u64,

    /// Shared by every batch of one invocation
    pub fetch_time: DateTime<Utc>,
}

/// Nodes processed in one batch, in verification completion order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResponse {
    pub id: Uuid,
    pub nodes: Vec<NodeOutcome>,
}

impl BatchResponse {
    pub fn new(id: Uuid) -> Self {
        Self { id, nodes: Vec::new() }
    }

    pub fn saved_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.saved_to_cache).count()
    }
}

/// Result of processing one received attestation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub identifier: String,
    pub cloud_os_version: String,
    pub cloud_os_release_type: String,
    pub validation_result: ValidationResult,
    pub saved_to_cache: bool,
    pub unique_node_identifier: Option<String>,
}

impl NodeOutcome {
    pub(crate) fn new(
        attestation: &Attestation,
        validation_result: ValidationResult,
        saved_to_cache: bool,
        unique_node_identifier: Option<String>,
    ) -> Self {
        Self {
            identifier: attestation.node_identifier.clone(),
            cloud_os_version: attestation.cloudos_version.clone(),
            cloud_os_release_type: attestation.cloudos_release_type.clone(),
            validation_result,
            saved_to_cache,
            unique_node_identifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ValidationResult {
    Valid {
        #[serde(rename = "publicKey", serialize_with = "hex_bytes")]
        public_key: Vec<u8>,
        expiry: DateTime<Utc>,
    },
    Invalid {
        error: String,
    },
    NodeAlreadyExistsInBatch,
    ValidationNotNeeded,
    NoUniqueIdentifier,
    ValidatedExpiryTooLarge,
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}
