//! BridgeService: owns named bridge instances and their lifecycle.
//!
//! This service owns:
//! - Name binding (via [`Registrar`]) for every instance it spawns
//! - The stored config per reference, so an instance can be respawned
//! - A watcher per instance that unbinds its name and publishes an [`ExitEvent`]
//!
//! Restart policy is left to the owner: subscribe to exit events and call
//! [`BridgeService::respawn`] for outcomes that warrant it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::exit::ExitOutcome;
use crate::instance::{
    BridgeConfig, BridgeHandle, BridgeInstance, CallError, CallResult, SpawnError,
};
use crate::registrar::{BridgeRef, InstanceId, Registrar};

const EVENT_CAPACITY: usize = 64;

/// Published once per instance when it terminates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitEvent {
    pub id: InstanceId,
    pub reference: BridgeRef,
    pub outcome: ExitOutcome,
}

struct Managed {
    handle: BridgeHandle,
    /// Cancelled by the watcher once the exit is fully processed.
    exited: CancellationToken,
}

pub struct BridgeService {
    registrar: Registrar,
    instances: DashMap<InstanceId, Managed>,
    configs: DashMap<BridgeRef, BridgeConfig>,
    events: broadcast::Sender<ExitEvent>,
}

impl BridgeService {
    pub fn new(registrar: Registrar) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            registrar,
            instances: DashMap::new(),
            configs: DashMap::new(),
            events,
        })
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExitEvent> {
        self.events.subscribe()
    }

    /// Number of running instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Bind `reference`, spawn the child and start its instance.
    ///
    /// An `Id` reference fixes the instance id; names get a fresh one. The name
    /// is bound before the child starts and released again if spawning fails.
    pub async fn spawn(
        self: &Arc<Self>,
        reference: BridgeRef,
        config: BridgeConfig,
    ) -> Result<BridgeHandle, SpawnError> {
        if self.running(&reference).await.is_some() {
            return Err(SpawnError::AlreadyRunning(reference));
        }

        let id = match &reference {
            BridgeRef::Id(id) => *id,
            _ => InstanceId::new(),
        };
        self.registrar.bind(&reference, id).await?;

        let instance = match BridgeInstance::spawn(id, reference.clone(), &config) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!(%reference, error = %e, "Failed to spawn bridge instance");
                self.registrar.unbind(&reference, id).await;
                return Err(e);
            }
        };

        let handle = instance.handle().clone();
        let exited = CancellationToken::new();
        self.instances.insert(
            id,
            Managed {
                handle: handle.clone(),
                exited: exited.clone(),
            },
        );
        self.configs.insert(reference.clone(), config);

        tokio::spawn(watch_instance(Arc::downgrade(self), instance, exited));
        Ok(handle)
    }

    /// Stop the instance under `reference` and forget its config.
    ///
    /// Returns after the instance has exited and its name is released.
    pub async fn despawn(&self, reference: &BridgeRef) -> Result<(), SpawnError> {
        let config = self.configs.remove(reference);
        let stopped = self.stop_running(reference, "despawn").await;
        if config.is_none() && !stopped {
            return Err(SpawnError::NotFound(reference.clone()));
        }
        tracing::info!(%reference, "Bridge instance despawned");
        Ok(())
    }

    /// Replace the instance under `reference` with a fresh one using its stored
    /// config. Works whether or not the old instance is still running.
    pub async fn respawn(self: &Arc<Self>, reference: &BridgeRef) -> Result<BridgeHandle, SpawnError> {
        let config = self
            .configs
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SpawnError::NotFound(reference.clone()))?;

        self.stop_running(reference, "respawn").await;
        tracing::info!(%reference, "Respawning bridge instance");
        self.spawn(reference.clone(), config).await
    }

    /// Despawn every instance.
    pub async fn shutdown(&self) {
        let references: Vec<BridgeRef> = self
            .configs
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for reference in references {
            if let Err(e) = self.despawn(&reference).await {
                tracing::debug!(%reference, error = %e, "Already gone at shutdown");
            }
        }
    }

    /// Handle of the running instance bound to `reference`.
    pub async fn handle(&self, reference: &BridgeRef) -> Option<BridgeHandle> {
        self.running(reference).await
    }

    pub async fn resolve(&self, reference: &BridgeRef) -> Option<InstanceId> {
        self.running(reference).await.map(|handle| handle.id())
    }

    pub async fn call(
        &self,
        reference: &BridgeRef,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        self.lookup(reference).await?.call(function, args, timeout).await
    }

    pub async fn cast(
        &self,
        reference: &BridgeRef,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), CallError> {
        self.lookup(reference).await?.cast(function, args, timeout).await
    }

    pub async fn load(
        &self,
        reference: &BridgeRef,
        source: impl Into<String>,
        timeout: Option<Duration>,
    ) -> CallResult {
        self.lookup(reference).await?.load(source, timeout).await
    }

    async fn lookup(&self, reference: &BridgeRef) -> Result<BridgeHandle, CallError> {
        self.running(reference)
            .await
            .ok_or_else(|| CallError::NotFound(reference.clone()))
    }

    async fn running(&self, reference: &BridgeRef) -> Option<BridgeHandle> {
        let id = self.registrar.resolve(reference).await?;
        self.instances.get(&id).map(|managed| managed.handle.clone())
    }

    /// Stop the running instance, if any, and wait for its watcher to finish.
    async fn stop_running(&self, reference: &BridgeRef, reason: &str) -> bool {
        let Some(id) = self.registrar.resolve(reference).await else {
            return false;
        };
        let Some((_, managed)) = self.instances.remove(&id) else {
            return false;
        };
        managed.handle.stop(reason);
        managed.exited.cancelled().await;
        true
    }
}

async fn watch_instance(
    service: Weak<BridgeService>,
    instance: BridgeInstance,
    exited: CancellationToken,
) {
    let handle = instance.handle().clone();
    let id = handle.id();
    let reference = handle.reference().clone();
    let outcome = instance.wait().await;

    if let Some(service) = service.upgrade() {
        // Release the name first: once the entry is gone, a respawn must find
        // the name free.
        service.registrar.unbind(&reference, id).await;
        service
            .instances
            .remove_if(&id, |_, managed| managed.handle.same_instance(&handle));

        let event = ExitEvent {
            id,
            reference,
            outcome,
        };
        if service.events.send(event).is_err() {
            tracing::trace!(%id, "No exit event subscribers");
        }
    }
    exited.cancel();
}
