//! Protobuf messages exchanged with the attestation service

use std::collections::HashMap;

/// Request body of a prefetch round trip
#[derive(Clone, PartialEq, prost::Message)]
pub struct PrefetchRequest {
    #[prost(message, optional, tag = "1")]
    pub capabilities: Option<Capabilities>,

    #[prost(uint32, tag = "2")]
    pub client_requested_attestation_count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Capabilities {
    #[prost(bool, tag = "1")]
    pub attestation_streaming: bool,
}

impl PrefetchRequest {
    /// Streaming-capable request for `count` attestations
    pub fn streaming(count: u32) -> Self {
        Self {
            capabilities: Some(Capabilities {
                attestation_streaming: true,
            }),
            client_requested_attestation_count: count,
        }
    }
}

/// One framed message of the response stream
#[derive(Clone, PartialEq, prost::Message)]
pub struct PrefetchResponse {
    #[prost(oneof = "prefetch_response::Type", tags = "1, 2")]
    pub r#type: Option<prefetch_response::Type>,
}

pub mod prefetch_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Attestation(super::Attestation),

        #[prost(message, tag = "2")]
        RateLimitConfigurationList(super::RateLimitConfigurationList),
    }
}

impl PrefetchResponse {
    pub fn attestation(attestation: Attestation) -> Self {
        Self {
            r#type: Some(prefetch_response::Type::Attestation(attestation)),
        }
    }

    pub fn rate_limits(list: RateLimitConfigurationList) -> Self {
        Self {
            r#type: Some(prefetch_response::Type::RateLimitConfigurationList(list)),
        }
    }
}

/// Attestation evidence for one node
#[derive(Clone, PartialEq, prost::Message)]
pub struct Attestation {
    #[prost(string, tag = "1")]
    pub node_identifier: String,

    #[prost(bytes = "vec", tag = "2")]
    pub attestation_bundle: Vec<u8>,

    #[prost(string, tag = "3")]
    pub cloudos_version: String,

    #[prost(string, tag = "4")]
    pub cloudos_release_type: String,

    #[prost(string, optional, tag = "5")]
    pub unvalidated_cell_id: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub ensemble_id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RateLimitConfigurationList {
    #[prost(message, repeated, tag = "1")]
    pub rate_limit_configuration: Vec<RateLimitConfiguration>,
}

/// Server-pushed request limit, as sent on the wire
#[derive(Clone, PartialEq, prost::Message)]
pub struct RateLimitConfiguration {
    #[prost(string, optional, tag = "1")]
    pub bundle_identifier: Option<String>,

    #[prost(string, optional, tag = "2")]
    pub feature_identifier: Option<String>,

    #[prost(string, optional, tag = "3")]
    pub workload_type: Option<String>,

    #[prost(map = "string, string", tag = "4")]
    pub workload_tags: HashMap<String, String>,

    #[prost(uint32, tag = "5")]
    pub request_count: u32,

    #[prost(double, tag = "6")]
    pub duration_seconds: f64,

    #[prost(double, tag = "7")]
    pub ttl_seconds: f64,

    #[prost(double, tag = "8")]
    pub jitter_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_streaming_request_fields() {
        let request = PrefetchRequest::streaming(42);
        let decoded = PrefetchRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.client_requested_attestation_count, 42);
        assert!(decoded.capabilities.unwrap().attestation_streaming);
    }

    #[test]
    fn test_empty_response_has_no_type() {
        let decoded = PrefetchResponse::decode(&[][..]).unwrap();
        assert!(decoded.r#type.is_none());
    }
}
