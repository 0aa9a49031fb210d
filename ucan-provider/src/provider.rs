//! Provider wiring: one store, reconciler and scheduler per kind plus the
//! manifest feeder, all sharing one cancellation token.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ucan_reconciler::{ClientFactory, ExternalClient, MemoryStore, Reconciler, Scheduler, WorkQueue};

use crate::config::ProviderConfig;
use crate::kinds::{FloatingIpClient, VirtualMachineClient, VolumeClient};
use crate::manifest::{ManifestFeeder, Stores};

pub struct Provider {
    stores: Stores,
    queues: Vec<(&'static str, WorkQueue)>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Provider {
    /// Open the stores, connect every kind and start all loops.
    pub async fn start(
        config: ProviderConfig,
        credentials: &[u8],
        cancel: CancellationToken,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("cannot create {}", config.state_dir.display()))?;

        let timeout = config.request_timeout;
        let volumes = VolumeClient::factory(&config.endpoints.volume, timeout)
            .connect(credentials)
            .map(|client| client.with_instance(config.instance.as_str()))
            .context("cannot build volume client")?;
        let floating_ips = FloatingIpClient::factory(&config.endpoints.network, timeout)
            .connect(credentials)
            .context("cannot build floating IP client")?;
        let virtual_machines = VirtualMachineClient::factory(&config.endpoints.compute, timeout)
            .connect(credentials)
            .context("cannot build virtual machine client")?;

        let mut tasks = JoinSet::new();
        let mut queues = Vec::new();

        let volume_store = launch(&config, volumes, &cancel, &mut tasks, &mut queues).await?;
        let floating_ip_store =
            launch(&config, floating_ips, &cancel, &mut tasks, &mut queues).await?;
        let virtual_machine_store =
            launch(&config, virtual_machines, &cancel, &mut tasks, &mut queues).await?;

        let stores = Stores {
            volumes: volume_store,
            floating_ips: floating_ip_store,
            virtual_machines: virtual_machine_store,
        };

        let feeder =
            ManifestFeeder::new(&config.manifest, config.manifest_interval, stores.clone());
        tasks.spawn(feeder.run(cancel.clone()));

        info!(
            manifest = %config.manifest.display(),
            state_dir = %config.state_dir.display(),
            "Provider started"
        );

        Ok(Self {
            stores,
            queues,
            tasks,
            cancel,
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Work queue of one kind.
    pub fn queue(&self, kind: &str) -> Option<WorkQueue> {
        self.queues
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, queue)| queue.clone())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for every loop to exit.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Provider task panicked");
            }
        }
        info!("Provider stopped");
    }
}

/// Open the store of one kind and spawn its scheduler.
async fn launch<C: ExternalClient>(
    config: &ProviderConfig,
    client: C,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
    queues: &mut Vec<(&'static str, WorkQueue)>,
) -> Result<Arc<MemoryStore<C::Spec>>> {
    let kind = client.kind();
    let path = config.store_path(kind);
    let store = Arc::new(
        MemoryStore::open(&path)
            .await
            .with_context(|| format!("cannot open {} store", kind))?,
    );

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(client),
        store.clone(),
        cancel.clone(),
    ));
    let scheduler = Scheduler::new(reconciler, config.scheduler.clone(), cancel.clone());
    queues.push((kind, scheduler.queue()));
    tasks.spawn(scheduler.run());

    Ok(store)
}
