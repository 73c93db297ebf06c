//! Core types for attestation prefetching

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto::Attestation;

/// Parameters of an invocation, as supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParameters {
    pub pipeline_kind: String,
    pub pipeline_arguments: BTreeMap<String, String>,
}

impl RequestParameters {
    pub fn new(pipeline_kind: impl Into<String>) -> Self {
        Self {
            pipeline_kind: pipeline_kind.into(),
            pipeline_arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pipeline_arguments.insert(key.into(), value.into());
        self
    }
}

/// Workload identity that partitions the attestation cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchParameters {
    pipeline_kind: String,
    pipeline_arguments: BTreeMap<String, String>,
}

impl PrefetchParameters {
    /// Derive the prefetch workload from invocation parameters
    ///
    /// Returns `None` if the pipeline kind or any argument key is blank.
    pub fn derive(parameters: &RequestParameters) -> Option<Self> {
        let pipeline_kind = parameters.pipeline_kind.trim();
        if pipeline_kind.is_empty() {
            return None;
        }
        if parameters.pipeline_arguments.keys().any(|k| k.trim().is_empty()) {
            return None;
        }

        Some(Self {
            pipeline_kind: pipeline_kind.to_string(),
            pipeline_arguments: parameters.pipeline_arguments.clone(),
        })
    }

    pub fn pipeline_kind(&self) -> &str {
        &self.pipeline_kind
    }

    pub fn pipeline_arguments(&self) -> &BTreeMap<String, String> {
        &self.pipeline_arguments
    }

    /// Arguments as a JSON object with sorted keys
    pub fn workload_parameters_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.pipeline_arguments)
    }
}

impl std::fmt::Display for PrefetchParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipelinekind: {} pipelineArguments: ", self.pipeline_kind)?;
        for (key, value) in &self.pipeline_arguments {
            write!(f, "[{}: {}]", key, value)?;
        }
        Ok(())
    }
}

/// Result of a successful full validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAttestation {
    pub attestation: Attestation,

    pub unique_node_identifier: Option<String>,

    /// Node public key (raw bytes, format defined by the verifier)
    pub public_key: Vec<u8>,

    pub expiry: DateTime<Utc>,

    pub validated_cell_id: Option<String>,
}
