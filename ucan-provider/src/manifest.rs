//! Manifest feeder - authors the declared state from a JSON file.
//!
//! The manifest lists every object the provider should keep alive. Each pass
//! applies all entries and requests deletion of stored objects that are no
//! longer listed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ucan_reconciler::{DesiredStore, ObjectKey, Spec, StoreError};

use crate::kinds::{
    FloatingIpSpec, VirtualMachineSpec, VolumeSpec, floating_ip, virtual_machine, volume,
};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{kind} entry without a name")]
    EmptyName { kind: &'static str },

    #[error("{kind} {name} is declared twice")]
    Duplicate { kind: &'static str, name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry<S> {
    pub name: String,
    pub spec: S,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub volumes: Vec<ManifestEntry<VolumeSpec>>,
    #[serde(default)]
    pub floating_ips: Vec<ManifestEntry<FloatingIpSpec>>,
    #[serde(default)]
    pub virtual_machines: Vec<ManifestEntry<VirtualMachineSpec>>,
}

impl Manifest {
    pub fn parse(data: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        check_names(volume::KIND, &manifest.volumes)?;
        check_names(floating_ip::KIND, &manifest.floating_ips)?;
        check_names(virtual_machine::KIND, &manifest.virtual_machines)?;
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse(&data)
    }
}

fn check_names<S>(kind: &'static str, entries: &[ManifestEntry<S>]) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.name.is_empty() {
            return Err(ManifestError::EmptyName { kind });
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(ManifestError::Duplicate {
                kind,
                name: entry.name.clone(),
            });
        }
    }
    Ok(())
}

/// Result of syncing one kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub declared: usize,
    pub pruned: usize,
    pub failed: usize,
}

/// Apply the entries of one kind and request deletion of undeclared objects.
pub async fn sync_kind<S: Spec>(
    kind: &str,
    store: &dyn DesiredStore<S>,
    entries: Vec<ManifestEntry<S>>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let declared: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();

    for entry in entries {
        let key = ObjectKey::new(kind, entry.name);
        match store.apply(key.clone(), entry.spec).await {
            Ok(()) => report.declared += 1,
            Err(e) => {
                warn!(%key, error = %e, "Failed to apply declared object");
                report.failed += 1;
            }
        }
    }

    for key in store.list().await {
        if key.kind != kind || declared.contains(&key.name) {
            continue;
        }
        match store.get(&key).await {
            Some(object) if !object.is_deletion_requested() => {}
            _ => continue,
        }
        match store.request_deletion(&key).await {
            Ok(()) => {
                info!(%key, "Object no longer declared, requesting deletion");
                report.pruned += 1;
            }
            // Finalized meanwhile
            Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                warn!(%key, error = %e, "Failed to request deletion");
                report.failed += 1;
            }
        }
    }

    report
}

/// The stores of all kinds, as seen by the feeder.
#[derive(Clone)]
pub struct Stores {
    pub volumes: Arc<dyn DesiredStore<VolumeSpec>>,
    pub floating_ips: Arc<dyn DesiredStore<FloatingIpSpec>>,
    pub virtual_machines: Arc<dyn DesiredStore<VirtualMachineSpec>>,
}

pub struct ManifestFeeder {
    path: PathBuf,
    interval: Duration,
    stores: Stores,
}

impl ManifestFeeder {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, stores: Stores) -> Self {
        Self {
            path: path.into(),
            interval,
            stores,
        }
    }

    /// Read the manifest once and sync every kind.
    ///
    /// An unreadable manifest changes nothing.
    pub async fn sync_once(&self) -> Result<(), ManifestError> {
        let manifest = Manifest::load(&self.path).await?;

        let volumes = sync_kind(volume::KIND, self.stores.volumes.as_ref(), manifest.volumes).await;
        let floating_ips = sync_kind(
            floating_ip::KIND,
            self.stores.floating_ips.as_ref(),
            manifest.floating_ips,
        )
        .await;
        let virtual_machines = sync_kind(
            virtual_machine::KIND,
            self.stores.virtual_machines.as_ref(),
            manifest.virtual_machines,
        )
        .await;

        debug!(
            ?volumes,
            ?floating_ips,
            ?virtual_machines,
            "Manifest synced"
        );
        Ok(())
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(path = %self.path.display(), interval = ?self.interval, "Manifest feeder started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Skipping manifest, keeping last declared state"
                        );
                    }
                }
            }
        }
        info!("Manifest feeder stopped");
    }
}
