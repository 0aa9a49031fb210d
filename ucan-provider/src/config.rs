//! Provider configuration.

use std::path::PathBuf;
use std::time::Duration;

use ucan_reconciler::SchedulerConfig;

/// Deployment name used when none is configured.
pub const DEFAULT_INSTANCE: &str = "default";

/// Base URLs of the ucan APIs, one per resource family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub volume: String,
    pub network: String,
    pub compute: String,
}

impl Endpoints {
    /// All kinds served by one base URL (tests, API gateways).
    pub fn single(base_url: &str) -> Self {
        Self {
            volume: base_url.to_string(),
            network: base_url.to_string(),
            compute: base_url.to_string(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            volume: "http://volume.ucan.ustack.com".to_string(),
            network: "http://zed-network-apiserver.ucan-system.svc.cluster.local:8088".to_string(),
            compute: "http://virtualmachine.ucan.ustack.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Declared state, re-read every `manifest_interval`.
    pub manifest: PathBuf,
    /// Directory holding one store snapshot per kind.
    pub state_dir: PathBuf,
    pub manifest_interval: Duration,
    pub request_timeout: Duration,
    pub scheduler: SchedulerConfig,
    pub endpoints: Endpoints,
    /// Distinguishes deployments sharing one project in ownership tags.
    pub instance: String,
}

impl ProviderConfig {
    pub fn new(manifest: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            state_dir: state_dir.into(),
            manifest_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            scheduler: SchedulerConfig::default(),
            endpoints: Endpoints::default(),
            instance: DEFAULT_INSTANCE.to_string(),
        }
    }

    /// Snapshot file of one kind's store.
    pub fn store_path(&self, kind: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", kind))
    }
}
