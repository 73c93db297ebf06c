//! Request header names understood by the attestation service

pub const CLIENT_INFO: &str = "x-client-info";
pub const WORKLOAD: &str = "x-workload";
pub const WORKLOAD_PARAMETERS: &str = "x-workload-parameters";
pub const REQUEST_UUID: &str = "x-request-uuid";
pub const BUNDLE_ID: &str = "x-bundle-id";
pub const FEATURE_ID: &str = "x-feature-id";
pub const AUTOMATED_DEVICE_GROUP: &str = "x-automated-device-group";
pub const TEST_OPTIONS: &str = "x-test-options";
pub const SERVER_HINT: &str = "x-server-hint";

/// Marks `x-server-hint` as a forced cell override
pub const SERVER_HINT_FORCE: &str = "x-server-hint-force";

pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

/// Feature identifier of background prefetches
pub const DEFAULT_FEATURE_ID: &str = "backgroundActivity.prefetchRequest";
