//! Server-driven rate limit configuration
//!
//! The service may interleave rate limit configuration lists with the
//! attestations it streams back. Each entry is validated here and handed to
//! a `RateLimiter`; how the limiter enforces them is its own business.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::proto;

/// Which requests a limit applies to; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitFilter {
    pub bundle_identifier: Option<String>,
    pub feature_identifier: Option<String>,
    pub workload_type: Option<String>,
    pub workload_tags: BTreeMap<String, String>,
}

/// A validated rate limit, anchored to the time it was received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfiguration {
    pub filter: RateLimitFilter,

    /// Requests allowed per window
    pub request_count: u32,

    pub window_secs: f64,

    pub jitter_rate: f64,

    pub expires_at: DateTime<Utc>,
}

impl RateLimitConfiguration {
    /// Validate a wire entry received at `now`
    ///
    /// The lifetime is capped at `Configuration::max_rate_limit_ttl_secs`.
    pub fn from_proto(
        now: DateTime<Utc>,
        proto: &proto::RateLimitConfiguration,
        config: &Configuration,
    ) -> Result<Self> {
        if !proto.duration_seconds.is_finite() || proto.duration_seconds <= 0.0 {
            return Err(Error::InvalidRateLimitConfiguration(format!(
                "window must be positive, got {}",
                proto.duration_seconds
            )));
        }
        if !proto.ttl_seconds.is_finite() || proto.ttl_seconds <= 0.0 {
            return Err(Error::InvalidRateLimitConfiguration(format!(
                "ttl must be positive, got {}",
                proto.ttl_seconds
            )));
        }
        if !(0.0..=1.0).contains(&proto.jitter_rate) {
            return Err(Error::InvalidRateLimitConfiguration(format!(
                "jitter rate must be within [0, 1], got {}",
                proto.jitter_rate
            )));
        }

        let ttl_secs = proto.ttl_seconds.min(config.max_rate_limit_ttl_secs as f64);
        let ttl = Duration::milliseconds((ttl_secs * 1000.0) as i64);

        Ok(Self {
            filter: RateLimitFilter {
                bundle_identifier: proto.bundle_identifier.clone(),
                feature_identifier: proto.feature_identifier.clone(),
                workload_type: proto.workload_type.clone(),
                workload_tags: proto.workload_tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            request_count: proto.request_count,
            window_secs: proto.duration_seconds,
            jitter_rate: proto.jitter_rate,
            expires_at: now + ttl,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn apply(&self, configuration: RateLimitConfiguration);

    /// Persist the current configuration set
    async fn persist(&self);
}

/// Keeps the latest configuration per filter, optionally saved as JSON
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    configurations: Mutex<Vec<RateLimitConfiguration>>,
    state_path: Option<PathBuf>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a state file, starting empty if it does not exist yet
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let configurations = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            configurations: Mutex::new(configurations),
            state_path: Some(path),
        })
    }

    /// Unexpired configurations, in the order they were applied
    pub fn active_configurations(&self) -> Vec<RateLimitConfiguration> {
        let now = Utc::now();
        self.configurations
            .lock()
            .iter()
            .filter(|c| !c.is_expired(now))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn apply(&self, configuration: RateLimitConfiguration) {
        let now = Utc::now();
        let mut configurations = self.configurations.lock();
        configurations.retain(|c| !c.is_expired(now) && c.filter != configuration.filter);
        debug!(
            request_count = configuration.request_count,
            window_secs = configuration.window_secs,
            "applying rate limit configuration"
        );
        configurations.push(configuration);
    }

    async fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };

        let json = match serde_json::to_vec_pretty(&*self.configurations.lock()) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "unable to serialize rate limit configurations");
                return;
            }
        };

        if let Err(e) = tokio::fs::write(path, json).await {
            warn!(path = %path.display(), error = %e, "unable to persist rate limit configurations");
        }
    }
}
