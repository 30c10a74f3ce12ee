//! Instance lifecycle: provision, decommission, power and status.
//!
//! Every operation that touches an existing instance checks ownership first
//! and holds that instance's lock from [`InstanceLocks`] while it talks to
//! the engine. Operations on different instances never contend.

use crate::config::ControllerConfig;
use crate::error::{CoreError, Result};
use crate::instance::{Instance, InstanceId, InstancePhase, OwnerId};
use crate::locks::InstanceLocks;
use crate::registry::{InstanceRegistry, Lookup};
use burrow_engine::{
    ContainerEngine, ContainerSpec, EngineError, RawState, LABEL_INSTANCE, LABEL_MANAGED,
    LABEL_OWNER,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Longest accepted display name, in characters.
const MAX_DISPLAY_NAME: usize = 64;

// ============================================================================
// Public types
// ============================================================================

/// Power actions accepted by [`LifecycleController::set_power`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Restart,
    Shutdown,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Restart => write!(f, "restart"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Runtime status of an instance's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    Stopped,
    Restarting,
    Unknown,
}

impl From<&RawState> for RuntimeStatus {
    fn from(state: &RawState) -> Self {
        match state {
            RawState::Running => Self::Running,
            RawState::Exited | RawState::Created | RawState::Dead | RawState::Paused => {
                Self::Stopped
            }
            RawState::Restarting => Self::Restarting,
            RawState::Removing | RawState::Other(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Restarting => write!(f, "restarting"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Differences between the registry and the engine's container list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Records whose container the engine no longer lists.
    pub missing_containers: Vec<InstanceId>,
    /// Managed containers with no registry record.
    pub orphaned_containers: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_containers.is_empty() && self.orphaned_containers.is_empty()
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Orchestrates instance operations against the engine and the registry.
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<InstanceRegistry>,
    locks: Arc<InstanceLocks>,
    config: ControllerConfig,
}

impl LifecycleController {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<InstanceRegistry>,
        locks: Arc<InstanceLocks>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            locks,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Create and start a container for `owner`, then record it.
    ///
    /// Nothing is recorded unless the container is running. A failure after
    /// `create` removes the container again, best effort.
    pub async fn provision(
        &self,
        owner: &OwnerId,
        display_name: &str,
        os_label: &str,
    ) -> Result<Instance> {
        let display_name = display_name.trim();
        if display_name.is_empty() || display_name.chars().count() > MAX_DISPLAY_NAME {
            return Err(CoreError::InvalidInput(format!(
                "display name must be 1-{MAX_DISPLAY_NAME} characters"
            )));
        }
        let image = self.config.catalog.resolve(os_label)?.to_string();
        let id = InstanceId::new();
        let start = Instant::now();

        tracing::info!(instance_id = %id, owner_id = %owner, image = %image, "Provisioning instance");

        let spec = ContainerSpec::new(&image, format!("{}-{}", self.config.container_prefix, id))
            .cmd([self.config.shell.as_str()])
            .label(LABEL_MANAGED, "true")
            .label(LABEL_INSTANCE, id.to_string())
            .label(LABEL_OWNER, owner.as_str())
            .ports(self.config.ports.iter().copied());

        let container_id = self
            .engine
            .create(&spec)
            .await
            .map_err(CoreError::ProvisionFailed)?;
        tracing::debug!(instance_id = %id, container_id = %container_id, "Container created");

        if let Err(e) = self.engine.start(&container_id).await {
            tracing::error!(instance_id = %id, container_id = %container_id, error = %e, "Container failed to start");
            self.discard_container(&container_id, false).await;
            return Err(CoreError::ProvisionFailed(e));
        }

        let instance = Instance {
            id,
            owner_id: owner.clone(),
            display_name: display_name.to_string(),
            image_reference: image,
            runtime_container_id: Some(container_id.clone()),
            os_label: Some(os_label.trim().to_ascii_lowercase()),
            phase: InstancePhase::Active,
            created_at: Utc::now(),
        };

        if let Err(e) = self.registry.insert(instance.clone()).await {
            tracing::error!(instance_id = %id, error = %e, "Failed to record instance, discarding container");
            self.discard_container(&container_id, true).await;
            return Err(e);
        }

        tracing::info!(
            instance_id = %id,
            container_id = %container_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Instance provisioned"
        );
        Ok(instance)
    }

    /// Stop and remove the instance's container, then delete its record.
    ///
    /// Repeating a successful decommission as the same owner is a no-op.
    pub async fn decommission(&self, id: InstanceId, requester: &OwnerId) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let instance = match self.registry.lookup(id).await? {
            Lookup::Found(instance) if instance.is_owned_by(requester) => instance,
            Lookup::Found(_) => return Err(not_owner(id, requester)),
            Lookup::Gone { owner_id } if &owner_id == requester => {
                tracing::debug!(instance_id = %id, "Instance already decommissioned");
                return Ok(());
            }
            Lookup::Gone { .. } => return Err(not_owner(id, requester)),
            Lookup::Unknown => return Err(CoreError::InstanceNotFound(id)),
        };

        tracing::info!(instance_id = %id, owner_id = %requester, "Decommissioning instance");

        if let Some(container_id) = instance.container_id() {
            match self.engine.stop(container_id, self.config.stop_grace).await {
                Ok(()) | Err(EngineError::ContainerNotFound(_)) => {}
                Err(e) => {
                    tracing::error!(instance_id = %id, error = %e, "Failed to stop container");
                    return Err(e.into());
                }
            }

            match self.engine.remove(container_id).await {
                Ok(()) | Err(EngineError::ContainerNotFound(_)) => {}
                Err(e) => {
                    tracing::error!(instance_id = %id, container_id, error = %e, "Container stopped but not removed");
                    if instance.phase != InstancePhase::TeardownPending {
                        let pending = Instance {
                            phase: InstancePhase::TeardownPending,
                            ..instance.clone()
                        };
                        if let Err(store_err) = self.registry.update(pending).await {
                            tracing::warn!(instance_id = %id, error = %store_err, "Failed to mark teardown pending");
                        }
                    }
                    return Err(CoreError::PartialTeardown {
                        instance: id,
                        source: e,
                    });
                }
            }
        }

        self.registry.remove(&instance).await?;
        tracing::info!(instance_id = %id, "Instance decommissioned");
        Ok(())
    }

    /// Start, restart or shut down the instance's container.
    pub async fn set_power(
        &self,
        id: InstanceId,
        requester: &OwnerId,
        action: PowerAction,
    ) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let instance = self.registry.find_owned(id, requester).await?;
        if instance.phase == InstancePhase::TeardownPending {
            return Err(CoreError::TeardownPending(id));
        }
        let container_id = instance
            .container_id()
            .ok_or(CoreError::NotProvisioned(id))?;

        tracing::info!(instance_id = %id, action = %action, "Power action");
        let grace = self.config.stop_grace;
        let result = match action {
            PowerAction::Start => self.engine.start(container_id).await,
            PowerAction::Restart => self.engine.restart(container_id, grace).await,
            PowerAction::Shutdown => self.engine.stop(container_id, grace).await,
        };
        result.map_err(|e| {
            tracing::error!(instance_id = %id, action = %action, error = %e, "Power action failed");
            e.into()
        })
    }

    /// Ask the engine for the container's state.
    pub async fn query_status(&self, id: InstanceId, requester: &OwnerId) -> Result<RuntimeStatus> {
        let instance = self.registry.find_owned(id, requester).await?;
        let container_id = instance
            .container_id()
            .ok_or(CoreError::NotProvisioned(id))?;

        let status = self.engine.inspect(container_id).await.map_err(|e| {
            if matches!(e, EngineError::ContainerNotFound(_)) {
                tracing::warn!(instance_id = %id, container_id, "Recorded container missing from engine");
            }
            CoreError::from(e)
        })?;
        tracing::debug!(instance_id = %id, state = %status.state, "Queried status");
        Ok(RuntimeStatus::from(&status.state))
    }

    /// Fetch one instance owned by `requester`.
    pub async fn get(&self, id: InstanceId, requester: &OwnerId) -> Result<Instance> {
        self.registry.find_owned(id, requester).await
    }

    /// All instances owned by `owner`, oldest first.
    pub async fn list_instances(&self, owner: &OwnerId) -> Result<Vec<Instance>> {
        self.registry.list_for(owner).await
    }

    /// Compare the registry against the engine and log any drift.
    ///
    /// Read only: nothing is created, removed or rewritten.
    pub async fn reconcile(&self) -> Result<DriftReport> {
        let containers = self.engine.list_all().await?;
        let records = self.registry.list_all().await?;

        let listed: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        let recorded: HashSet<&str> = records.iter().filter_map(Instance::container_id).collect();

        let mut report = DriftReport::default();
        for instance in &records {
            if let Some(container_id) = instance.container_id() {
                if !listed.contains(container_id) {
                    tracing::warn!(instance_id = %instance.id, container_id, "Container missing for recorded instance");
                    report.missing_containers.push(instance.id);
                }
            }
        }
        for container in &containers {
            let managed = container.label(LABEL_MANAGED) == Some("true");
            if managed && !recorded.contains(container.id.as_str()) {
                tracing::warn!(
                    container_id = %container.id,
                    instance = container.label(LABEL_INSTANCE).unwrap_or("-"),
                    "Managed container has no instance record"
                );
                report.orphaned_containers.push(container.id.clone());
            }
        }

        tracing::info!(
            records = records.len(),
            missing = report.missing_containers.len(),
            orphaned = report.orphaned_containers.len(),
            "Reconciled registry with engine"
        );
        Ok(report)
    }

    async fn discard_container(&self, container_id: &str, running: bool) {
        if running {
            if let Err(e) = self.engine.stop(container_id, self.config.stop_grace).await {
                tracing::warn!(container_id, error = %e, "Cleanup stop failed");
            }
        }
        if let Err(e) = self.engine.remove(container_id).await {
            tracing::warn!(container_id, error = %e, "Cleanup remove failed");
        }
    }
}

fn not_owner(id: InstanceId, requester: &OwnerId) -> CoreError {
    CoreError::NotOwner {
        instance: id,
        requester: requester.clone(),
    }
}
