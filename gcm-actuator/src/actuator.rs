//! Machine actuator.
//!
//! Entry points for the fleet controller. Every call builds its own
//! [`MachineScope`], runs one reconciler operation, persists the scope
//! where the operation calls for it and records a single event.

use std::sync::Arc;

use gcm_cloud::{ComputeServiceBuilder, TagServiceBuilder};
use tracing::{error, info};

use crate::config::FeatureGates;
use crate::core::{CoreClient, EndpointLookup};
use crate::error::{Error, Result};
use crate::events::{EventRecorder, EventType};
use crate::machine::{Machine, PHASE_DELETING, PHASE_FAILED};
use crate::reconciler::{Reconciled, Reconciler};
use crate::scope::{MachineScope, MachineScopeParams};

const CREATE_EVENT_ACTION: &str = "Create";
const UPDATE_EVENT_ACTION: &str = "Update";
const DELETE_EVENT_ACTION: &str = "Delete";

/// Inputs for [`Actuator::new`].
pub struct ActuatorParams {
    pub core: Arc<dyn CoreClient>,
    pub events: Arc<dyn EventRecorder>,
    pub compute_builder: ComputeServiceBuilder,
    pub tag_builder: TagServiceBuilder,
    pub feature_gates: FeatureGates,
    pub endpoint_lookup: Option<Arc<dyn EndpointLookup>>,
}

pub struct Actuator {
    core: Arc<dyn CoreClient>,
    events: Arc<dyn EventRecorder>,
    compute_builder: ComputeServiceBuilder,
    tag_builder: TagServiceBuilder,
    feature_gates: FeatureGates,
    endpoint_lookup: Option<Arc<dyn EndpointLookup>>,
}

impl Actuator {
    pub fn new(params: ActuatorParams) -> Self {
        Self {
            core: params.core,
            events: params.events,
            compute_builder: params.compute_builder,
            tag_builder: params.tag_builder,
            feature_gates: params.feature_gates,
            endpoint_lookup: params.endpoint_lookup,
        }
    }

    async fn scope(&self, machine: &Machine) -> Result<MachineScope> {
        MachineScope::new(MachineScopeParams {
            machine: machine.clone(),
            core: self.core.clone(),
            compute_builder: self.compute_builder.clone(),
            tag_builder: self.tag_builder.clone(),
            feature_gates: self.feature_gates,
            endpoint_lookup: self.endpoint_lookup.clone(),
        })
        .await
        .map_err(|e| Error::Scope {
            machine: machine.name().to_string(),
            source: Box::new(e),
        })
    }

    /// Log the error and record a `Failed<action>` warning. Returns the
    /// error so callers can hand it straight back.
    async fn handle_machine_error(&self, machine: &Machine, err: Error, action: &str) -> Error {
        error!("{} error: {}", machine.name(), err);
        self.events
            .event(
                machine,
                EventType::Warning,
                &format!("Failed{}", action),
                &err.to_string(),
            )
            .await;
        err
    }

    fn reconcile_error(machine: &Machine, action: &str, err: Error) -> Error {
        Error::Reconcile {
            machine: machine.name().to_string(),
            action: action.to_string(),
            source: Box::new(err),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn create(&self, machine: &Machine) -> Result<Reconciled> {
        info!("{}: Creating machine", machine.name());

        let mut scope = match self.scope(machine).await {
            Ok(scope) => scope,
            Err(e) => {
                return Err(self
                    .handle_machine_error(machine, e, CREATE_EVENT_ACTION)
                    .await);
            }
        };

        let reconciled = match Reconciler::new(&mut scope).create().await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                // Keep whatever the failed attempt recorded.
                if let Err(close_error) = scope.close().await {
                    error!("{}: failed to persist machine: {}", machine.name(), close_error);
                }
                let err = Self::reconcile_error(machine, CREATE_EVENT_ACTION, e);
                return Err(self
                    .handle_machine_error(machine, err, CREATE_EVENT_ACTION)
                    .await);
            }
        };

        self.events
            .event(
                machine,
                EventType::Normal,
                CREATE_EVENT_ACTION,
                &format!("Created Machine {}", machine.name()),
            )
            .await;

        scope.close().await?;
        Ok(reconciled)
    }

    /// Whether the instance exists.
    ///
    /// The scope is never persisted here: the controller follows up with
    /// create or update on the same machine, and a write in between would
    /// make that call conflict.
    pub async fn exists(&self, machine: &mut Machine) -> Result<bool> {
        info!("{}: Checking if machine exists", machine.name());

        let mut scope = self.scope(machine).await?;
        let result = Reconciler::new(&mut scope).exists().await;

        let err = match result {
            Err(e) if e.is_invalid_configuration() => e,
            other => return other,
        };

        if machine.status.phase.is_none() {
            machine.status.phase = Some(PHASE_FAILED.to_string());
        }

        // An invalid machine that never reached the cloud may still be
        // deleted. One with a provider ID may own a real instance.
        if machine.status.phase.as_deref() == Some(PHASE_DELETING)
            && machine.spec.provider_id.is_none()
        {
            return Ok(false);
        }

        Err(err)
    }

    pub async fn update(&self, machine: &Machine) -> Result<Reconciled> {
        info!("{}: Updating machine", machine.name());

        let mut scope = match self.scope(machine).await {
            Ok(scope) => scope,
            Err(e) => {
                return Err(self
                    .handle_machine_error(machine, e, UPDATE_EVENT_ACTION)
                    .await);
            }
        };

        let reconciled = match Reconciler::new(&mut scope).update().await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                if let Err(close_error) = scope.close().await {
                    error!("{}: failed to persist machine: {}", machine.name(), close_error);
                }
                let err = Self::reconcile_error(machine, UPDATE_EVENT_ACTION, e);
                return Err(self
                    .handle_machine_error(machine, err, UPDATE_EVENT_ACTION)
                    .await);
            }
        };

        let previous_version = scope.machine.metadata.resource_version.clone();
        scope.close().await?;

        // Only a write that reached the API server is worth an event.
        if scope.machine.metadata.resource_version != previous_version {
            self.events
                .event(
                    machine,
                    EventType::Normal,
                    UPDATE_EVENT_ACTION,
                    &format!("Updated Machine {}", machine.name()),
                )
                .await;
        }

        Ok(reconciled)
    }

    pub async fn delete(&self, machine: &Machine) -> Result<Reconciled> {
        info!("{}: Deleting machine", machine.name());

        let mut scope = match self.scope(machine).await {
            Ok(scope) => scope,
            Err(e) => {
                return Err(self
                    .handle_machine_error(machine, e, DELETE_EVENT_ACTION)
                    .await);
            }
        };

        let reconciled = match Reconciler::new(&mut scope).delete().await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                let err = Self::reconcile_error(machine, DELETE_EVENT_ACTION, e);
                return Err(self
                    .handle_machine_error(machine, err, DELETE_EVENT_ACTION)
                    .await);
            }
        };

        self.events
            .event(
                machine,
                EventType::Normal,
                DELETE_EVENT_ACTION,
                &format!("Deleted machine {}", machine.name()),
            )
            .await;

        Ok(reconciled)
    }
}
