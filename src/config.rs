//! Client configuration
//!
//! `Configuration` holds the locally configured defaults and ceilings,
//! `ServerDrivenConfiguration` the optional overrides pushed by the service.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Deployment environment of the attestation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }

    /// Production keeps reporting identifiers separate from operational ones
    pub fn separates_reporting_ids(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    pub environment: Environment,

    /// Base URL of the attestation service, e.g. `https://attest.example.net`
    pub service_url: String,

    pub prefetch_request_path: String,

    /// Per-request attestation count, also the ceiling for server overrides
    pub max_prefetched_attestations: usize,

    pub max_prefetch_batches: usize,

    /// How long prefetched attestations count towards the warm-cache check
    pub prewarm_attestations_validity_secs: u64,

    pub ignore_certificate_errors: bool,

    pub force_ohttp: bool,

    pub test_options: Option<String>,

    pub override_cell_id: Option<String>,

    /// Bundle identifier sent on background prefetches
    pub default_bundle_identifier: Option<String>,

    pub user_agent: String,

    /// Largest accepted response frame in bytes
    pub max_frame_length: usize,

    /// Upper bound on the lifetime of a server-pushed rate limit
    pub max_rate_limit_ttl_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            service_url: "https://attestation.invalid".to_string(),
            prefetch_request_path: "/v1/prefetch".to_string(),
            max_prefetched_attestations: 60,
            max_prefetch_batches: 3,
            prewarm_attestations_validity_secs: 4 * 60 * 60,
            ignore_certificate_errors: false,
            force_ohttp: false,
            test_options: None,
            override_cell_id: None,
            default_bundle_identifier: None,
            user_agent: concat!("attestation-prefetch/", env!("CARGO_PKG_VERSION")).to_string(),
            max_frame_length: 4 * 1024 * 1024,
            max_rate_limit_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Configuration {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Configuration = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<()> {
        if !self.service_url.starts_with("https://") && !self.service_url.starts_with("http://") {
            return Err(Error::Configuration(format!(
                "service URL must be http(s): {}",
                self.service_url
            )));
        }
        if !self.prefetch_request_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "request path must start with '/': {}",
                self.prefetch_request_path
            )));
        }
        if self.max_frame_length == 0 {
            return Err(Error::Configuration("max frame length must be non-zero".into()));
        }
        Ok(())
    }

    /// Host part of the service URL, used as the request authority
    pub fn service_hostname(&self) -> &str {
        let without_scheme = self
            .service_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.service_url);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }
}

/// Overrides delivered by the service; `None` falls back to `Configuration`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerDrivenConfiguration {
    pub max_prefetched_attestations: Option<usize>,
    pub max_prefetch_batches: Option<usize>,
    pub prewarm_attestations_validity_secs: Option<u64>,
}

/// Facts about the device issuing the requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub os_info: String,
    pub automated_device_group: Option<String>,
    pub locale: String,
}

impl SystemInfo {
    /// Describe the current host from the standard environment
    pub fn detect() -> Self {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .and_then(|l| l.split('.').next().map(str::to_string))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en_US".to_string());

        Self {
            os_info: format!("{}; {}", std::env::consts::OS, std::env::consts::ARCH),
            automated_device_group: std::env::var("AUTOMATED_DEVICE_GROUP").ok(),
            locale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Configuration::from_json(r#"{"maxPrefetchBatches": 5}"#).unwrap();
        assert_eq!(config.max_prefetch_batches, 5);
        assert_eq!(config.max_prefetched_attestations, 60);
        assert_eq!(config.environment, Environment::Production);
    }

    #[test]
    fn test_environment_parsing() {
        let config = Configuration::from_json(r#"{"environment": "staging"}"#).unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert!(!config.environment.separates_reporting_ids());
        assert_eq!(config.environment.name(), "staging");
    }

    #[test]
    fn test_rejects_bad_request_path() {
        let err = Configuration::from_json(r#"{"prefetchRequestPath": "prefetch"}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_service_hostname() {
        let config = Configuration {
            service_url: "https://attest.example.net:8443/base".to_string(),
            ..Default::default()
        };
        assert_eq!(config.service_hostname(), "attest.example.net:8443");
    }

    #[test]
    fn test_server_config_partial() {
        let server: ServerDrivenConfiguration =
            serde_json::from_str(r#"{"maxPrefetchedAttestations": 12}"#).unwrap();
        assert_eq!(server.max_prefetched_attestations, Some(12));
        assert_eq!(server.max_prefetch_batches, None);
    }
}
