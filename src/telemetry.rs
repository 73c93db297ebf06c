//! Events and metrics emitted by the prefetch pipeline

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, VerificationError};

/// Where a set of received nodes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    Prefetch,
    Prewarm,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrefetchEvent {
    /// Unique identifiers of the nodes processed in one batch
    NodesReceived { node_ids: Vec<String>, source: NodeSource },

    ExportMetric(VerificationErrorMetric),
}

pub type EventSender = mpsc::UnboundedSender<PrefetchEvent>;

/// Emit an event; a closed receiver just means nobody is listening
pub(crate) fn emit(events: &EventSender, event: PrefetchEvent) {
    let _ = events.send(event);
}

/// Report of an attestation that failed full validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationErrorMetric {
    pub client_request_id: Uuid,
    pub event_time: DateTime<Utc>,
    pub environment: String,
    pub client_info: String,
    pub feature_id: Option<String>,
    pub bundle_id: Option<String>,
    pub locale: String,
    pub is_prefetched_attestation: bool,
    pub node_identifier: String,
    pub error: String,
    pub verification_time_ms: i64,
}

/// Description of a value that is safe to log or export in production
///
/// Unlike `Display`, this never includes caller data, node identifiers or
/// server-provided text.
pub trait Reportable {
    fn public_description(&self) -> String;
}

impl Reportable for VerificationError {
    fn public_description(&self) -> String {
        let kind = match self {
            VerificationError::Malformed(_) => "malformed",
            VerificationError::Rejected(_) => "rejected",
            VerificationError::Expired(_) => "expired",
            VerificationError::Unavailable(_) => "unavailable",
        };
        format!("verification.{}", kind)
    }
}

impl Reportable for Error {
    fn public_description(&self) -> String {
        let kind = match self {
            Error::Http(_) => "http".to_string(),
            Error::Json(_) => "json".to_string(),
            Error::Decode(_) => "decode".to_string(),
            Error::Io(e) => format!("io({:?})", e.kind()),
            Error::InvalidHeaderValue(_) => "invalidHeaderValue".to_string(),
            Error::AttestationsExist => "attestationsExist".to_string(),
            Error::MissingBundleIdentifier => "missingBundleIdentifier".to_string(),
            Error::MissingFeatureIdentifier => "missingFeatureIdentifier".to_string(),
            Error::UnexpectedStatusCode(code) => format!("unexpectedStatusCode({})", code),
            Error::EmptyPrefetchResponse => "emptyPrefetchResponse".to_string(),
            Error::Transport(_) => "transport".to_string(),
            Error::Tls(_) => "tls".to_string(),
            Error::Framing(_) => "framing".to_string(),
            Error::InvalidRateLimitConfiguration(_) => "invalidRateLimitConfiguration".to_string(),
            Error::Configuration(_) => "configuration".to_string(),
        };
        format!("prefetch.{}", kind)
    }
}
