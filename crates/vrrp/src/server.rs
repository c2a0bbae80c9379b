//! Server facade: bootstraps the engine and forwards management calls.

use crate::adapter::{Dependency, SwitchAdapter};
use crate::binder::DropCounters;
use crate::bootstrap::{self, Readiness, RetryPolicy};
use crate::dispatcher::{CreateOutcome, Dispatcher, DispatcherHandle, InterfaceEvent};
use crate::error::VrrpError;
use crate::registry::RegistryHandle;
use crate::types::{
    BulkState, ConfigField, DropStats, InstanceConfig, InstanceKey, InstanceSnapshot,
    InstanceUpdate,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Capacity of each inbound dispatcher channel
    pub channel_size: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channel_size: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle to a running VRRP engine.
///
/// Dropping the server stops the engine; [`VrrpServer::shutdown`] also waits
/// for every binding and timer to be released.
pub struct VrrpServer {
    dispatcher: DispatcherHandle,
    registry: RegistryHandle,
    drops: Arc<DropCounters>,
    readiness: watch::Receiver<Readiness>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VrrpServer {
    /// Start the engine.
    ///
    /// Dependencies are connected first; requests issued meanwhile are queued
    /// and handled once the engine is ready.
    pub fn spawn(
        adapter: Arc<dyn SwitchAdapter>,
        dependencies: Vec<Arc<dyn Dependency>>,
        settings: EngineSettings,
    ) -> Self {
        let (dispatcher, handle) = Dispatcher::new(adapter, settings.channel_size);
        let registry = dispatcher.registry();
        let drops = dispatcher.drop_counters();

        let pending = dependencies.iter().map(|dep| dep.name().to_string()).collect();
        let (ready_tx, readiness) = watch::channel(Readiness::NotReady { pending });

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let report = tokio::select! {
                _ = token.cancelled() => return,
                report = bootstrap::connect_all(&dependencies, &settings.retry, &ready_tx) => report,
            };
            if !report.is_ready() {
                error!(failed = ?report.failed(), "VRRP engine not started");
                return;
            }
            dispatcher.run(token).await;
        });

        info!("VRRP server started");
        Self {
            dispatcher: handle,
            registry,
            drops,
            readiness,
            shutdown,
            task: Some(task),
        }
    }

    pub async fn create_instance(&self, config: InstanceConfig) -> Result<CreateOutcome, VrrpError> {
        self.check_not_failed()?;
        let config = config.validate()?;
        self.dispatcher.create(config).await
    }

    pub async fn update_instance(
        &self,
        key: InstanceKey,
        update: InstanceUpdate,
    ) -> Result<(), VrrpError> {
        self.check_not_failed()?;
        let update = update.validate()?;
        self.dispatcher.update(key, update).await
    }

    /// Update the fields named in `dirty`, taking their new values from `values`
    pub async fn update_instance_fields<I>(
        &self,
        key: InstanceKey,
        dirty: I,
        values: &InstanceConfig,
    ) -> Result<(), VrrpError>
    where
        I: IntoIterator<Item = ConfigField>,
    {
        let update = InstanceUpdate::from_dirty(dirty, values)?;
        self.update_instance(key, update).await
    }

    pub async fn delete_instance(&self, key: InstanceKey) -> Result<(), VrrpError> {
        self.check_not_failed()?;
        self.dispatcher.delete(key).await
    }

    /// Forward an interface or address notification
    pub async fn notify_interface(&self, event: InterfaceEvent) -> Result<(), VrrpError> {
        self.dispatcher.notify(event).await
    }

    pub async fn get_instance(&self, key: InstanceKey) -> Option<InstanceSnapshot> {
        self.registry.get(key).await
    }

    pub async fn get_bulk_state(&self, start: usize, count: usize) -> BulkState {
        self.registry.bulk(start, count).await
    }

    pub fn drop_stats(&self) -> DropStats {
        self.drops.snapshot()
    }

    /// Read handle for status endpoints
    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    pub fn drop_counters(&self) -> Arc<DropCounters> {
        self.drops.clone()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Wait until bootstrap has finished
    pub async fn wait_ready(&self) -> Result<(), VrrpError> {
        let mut readiness = self.readiness.clone();
        let state = readiness
            .wait_for(|state| !matches!(state, Readiness::NotReady { .. }))
            .await
            .map_err(|_| VrrpError::EngineStopped)?
            .clone();

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed { dependencies } => Err(VrrpError::NotReady(dependencies)),
            Readiness::NotReady { pending } => Err(VrrpError::NotReady(pending)),
        }
    }

    /// Stop the engine and wait for it to release its resources
    pub async fn shutdown(mut self) {
        info!("Shutting down VRRP server");
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "VRRP engine task failed");
            }
        }
    }

    fn check_not_failed(&self) -> Result<(), VrrpError> {
        match &*self.readiness.borrow() {
            Readiness::Failed { dependencies } => Err(VrrpError::NotReady(dependencies.clone())),
            _ => Ok(()),
        }
    }
}

impl Drop for VrrpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
