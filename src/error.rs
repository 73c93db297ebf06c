//! Error types for the prefetch client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protobuf decoding failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Attestations exist for workload")]
    AttestationsExist,

    #[error("Missing bundle identifier for prewarm request")]
    MissingBundleIdentifier,

    #[error("Missing feature identifier for prewarm request")]
    MissingFeatureIdentifier,

    #[error("Unexpected status code: {0}")]
    UnexpectedStatusCode(u16),

    #[error("Prefetch returned empty response")]
    EmptyPrefetchResponse,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimitConfiguration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by an attestation verifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Malformed attestation bundle: {0}")]
    Malformed(String),

    #[error("Attestation rejected: {0}")]
    Rejected(String),

    #[error("Attestation expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("Verifier unavailable: {0}")]
    Unavailable(String),
}
