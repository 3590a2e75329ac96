//! Instance references and name binding.
//!
//! An instance is reachable by its raw [`InstanceId`], by a name in the
//! process-local table, or by a name in a [`GlobalRegistry`]. Global
//! registration is eventually visible, so binding polls until the name resolves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Unique identifier for a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How callers address an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeRef {
    Id(InstanceId),
    Local(String),
    Global(String),
}

impl BridgeRef {
    pub fn local(name: impl Into<String>) -> Self {
        Self::Local(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::Global(name.into())
    }

    /// Form passed to callbacks as their first argument.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<InstanceId> for BridgeRef {
    fn from(id: InstanceId) -> Self {
        Self::Id(id)
    }
}

impl std::fmt::Display for BridgeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Local(name) => write!(f, "local:{}", name),
            Self::Global(name) => write!(f, "global:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrarError {
    #[error("name {0} is already registered")]
    NameTaken(String),
    #[error("global name {name} not visible after {attempts} attempts")]
    NotVisible { name: String, attempts: u32 },
    #[error("global registry error: {0}")]
    Global(String),
}

/// Cluster-wide name service. Registration may become visible with a delay.
#[async_trait]
pub trait GlobalRegistry: Send + Sync {
    async fn register(&self, name: &str, id: InstanceId) -> Result<(), RegistrarError>;
    async fn whereis(&self, name: &str) -> Option<InstanceId>;
    async fn unregister(&self, name: &str);
}

/// In-process [`GlobalRegistry`] with a configurable propagation delay.
#[derive(Default)]
pub struct InMemoryGlobalRegistry {
    names: DashMap<String, (InstanceId, Instant)>,
    propagation_delay: Duration,
}

impl InMemoryGlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_propagation_delay(delay: Duration) -> Self {
        Self {
            names: DashMap::new(),
            propagation_delay: delay,
        }
    }
}

#[async_trait]
impl GlobalRegistry for InMemoryGlobalRegistry {
    async fn register(&self, name: &str, id: InstanceId) -> Result<(), RegistrarError> {
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistrarError::NameTaken(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert((id, Instant::now() + self.propagation_delay));
                Ok(())
            }
        }
    }

    async fn whereis(&self, name: &str) -> Option<InstanceId> {
        self.names
            .get(name)
            .filter(|entry| Instant::now() >= entry.1)
            .map(|entry| entry.0)
    }

    async fn unregister(&self, name: &str) {
        self.names.remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Sleep between visibility checks for global names.
    pub poll_interval: Duration,
    /// Checks before giving up on a global name.
    pub max_attempts: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 20,
        }
    }
}

impl RegistrarConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

pub struct Registrar {
    local: DashMap<String, InstanceId>,
    global: Arc<dyn GlobalRegistry>,
    config: RegistrarConfig,
}

impl Registrar {
    pub fn new(config: RegistrarConfig, global: Arc<dyn GlobalRegistry>) -> Self {
        Self {
            local: DashMap::new(),
            global,
            config,
        }
    }

    /// Bind `reference` to `id`. Global names return only once visible.
    pub async fn bind(&self, reference: &BridgeRef, id: InstanceId) -> Result<(), RegistrarError> {
        match reference {
            BridgeRef::Id(_) => Ok(()),
            BridgeRef::Local(name) => match self.local.entry(name.clone()) {
                Entry::Occupied(_) => Err(RegistrarError::NameTaken(name.clone())),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    tracing::debug!(%name, %id, "Bound local name");
                    Ok(())
                }
            },
            BridgeRef::Global(name) => self.register_and_await_visible(name, id).await,
        }
    }

    /// Register a global name, then sleep-then-check until it resolves to `id`.
    pub async fn register_and_await_visible(
        &self,
        name: &str,
        id: InstanceId,
    ) -> Result<(), RegistrarError> {
        self.global.register(name, id).await?;

        for attempt in 1..=self.config.max_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            if self.global.whereis(name).await == Some(id) {
                tracing::debug!(%name, %id, attempt, "Global name visible");
                return Ok(());
            }
            tracing::trace!(%name, attempt, "Global name not yet visible");
        }

        tracing::warn!(%name, attempts = self.config.max_attempts, "Global name never became visible");
        self.global.unregister(name).await;
        Err(RegistrarError::NotVisible {
            name: name.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Remove a binding, but only if it still points at `id`.
    pub async fn unbind(&self, reference: &BridgeRef, id: InstanceId) {
        match reference {
            BridgeRef::Id(_) => {}
            BridgeRef::Local(name) => {
                self.local.remove_if(name, |_, bound| *bound == id);
            }
            BridgeRef::Global(name) => {
                if self.global.whereis(name).await == Some(id) {
                    self.global.unregister(name).await;
                }
            }
        }
    }

    pub async fn resolve(&self, reference: &BridgeRef) -> Option<InstanceId> {
        match reference {
            BridgeRef::Id(id) => Some(*id),
            BridgeRef::Local(name) => self.local.get(name).map(|id| *id),
            BridgeRef::Global(name) => self.global.whereis(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrar(global: InMemoryGlobalRegistry) -> Registrar {
        Registrar::new(
            RegistrarConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_max_attempts(5),
            Arc::new(global),
        )
    }

    #[tokio::test]
    async fn raw_id_binding_is_noop() {
        let reg = registrar(InMemoryGlobalRegistry::new());
        let id = InstanceId::new();
        reg.bind(&BridgeRef::Id(id), id).await.unwrap();
        assert_eq!(reg.resolve(&BridgeRef::Id(id)).await, Some(id));
    }

    #[tokio::test]
    async fn local_name_taken_fails() {
        let reg = registrar(InMemoryGlobalRegistry::new());
        let first = InstanceId::new();
        let second = InstanceId::new();
        let name = BridgeRef::local("worker");

        reg.bind(&name, first).await.unwrap();
        assert_eq!(
            reg.bind(&name, second).await,
            Err(RegistrarError::NameTaken("worker".to_string()))
        );
        assert_eq!(reg.resolve(&name).await, Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn global_bind_waits_for_visibility() {
        let reg = registrar(InMemoryGlobalRegistry::with_propagation_delay(
            Duration::from_millis(35),
        ));
        let id = InstanceId::new();
        let started = Instant::now();

        reg.bind(&BridgeRef::global("cluster"), id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(35));
        assert_eq!(reg.resolve(&BridgeRef::global("cluster")).await, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn global_bind_gives_up_after_max_attempts() {
        let reg = registrar(InMemoryGlobalRegistry::with_propagation_delay(
            Duration::from_secs(60),
        ));
        let err = reg
            .bind(&BridgeRef::global("slow"), InstanceId::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistrarError::NotVisible {
                name: "slow".to_string(),
                attempts: 5
            }
        );
        // Failed registration is rolled back, so the name is free again.
        assert!(matches!(
            reg.bind(&BridgeRef::global("slow"), InstanceId::new()).await,
            Err(RegistrarError::NotVisible { .. })
        ));
    }

    #[tokio::test]
    async fn unbind_only_removes_own_binding() {
        let reg = registrar(InMemoryGlobalRegistry::new());
        let owner = InstanceId::new();
        let name = BridgeRef::local("svc");
        reg.bind(&name, owner).await.unwrap();

        reg.unbind(&name, InstanceId::new()).await;
        assert_eq!(reg.resolve(&name).await, Some(owner));

        reg.unbind(&name, owner).await;
        assert_eq!(reg.resolve(&name).await, None);
    }

    #[test]
    fn reference_value_and_display() {
        assert_eq!(
            BridgeRef::local("a").to_value(),
            serde_json::json!({"local": "a"})
        );
        assert_eq!(BridgeRef::global("b").to_string(), "global:b");
    }
}
