//! Machine reconciler.
//!
//! Drives one GCE instance towards the provider spec held by a
//! [`MachineScope`]. The reconciler mutates the scope in memory only;
//! persisting is the caller's job through [`MachineScope::close`].

pub mod accelerators;
pub mod instance;
pub mod pools;

use std::collections::BTreeMap;
use std::time::Duration;

use gcm_cloud::CloudErrorKind;
use gcm_cloud::types::{
    AcceleratorConfig, ConfidentialInstanceConfig, Instance, InstanceParams, Scheduling,
    ShieldedInstanceConfig, Tags,
};
use tracing::{error, info};

pub use pools::PoolAction;

use crate::conditions::{Condition, reconcile_conditions};
use crate::error::{Error, Result};
use crate::labels;
use crate::machine::{
    CLUSTER_ID_LABEL, INSTANCE_STATE_ANNOTATION, INSTANCE_TYPE_LABEL,
    INTERRUPTIBLE_INSTANCE_LABEL, Machine, NodeAddress, NodeAddressType, REGION_LABEL, ZONE_LABEL,
};
use crate::provider::{
    POLICY_DISABLED, POLICY_ENABLED, ProviderSpec, RESTART_POLICY_ALWAYS, RESTART_POLICY_NEVER,
    ResourceManagerTag,
};
use crate::scope::MachineScope;
use crate::tags::{self, TagBinder};

/// Delay before an unfinished operation should be looked at again.
pub const REQUEUE_AFTER: Duration = Duration::from_secs(20);

const INSTANCE_STATE_RUNNING: &str = "RUNNING";

/// Outcome of a reconciler operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Complete,
    /// The operation went through but the cloud has not settled yet.
    RequeueAfter(Duration),
}

/// `https://www.googleapis.com/compute/v1/projects/<p>/zones/<z>/instances/<n>`.
pub fn instance_self_link(project: &str, zone: &str, name: &str) -> String {
    format!(
        "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instances/{}",
        project, zone, name
    )
}

/// Map a restart policy to the instance's `automaticRestart` flag. `None`
/// leaves the API default in place.
pub fn restart_policy_to_bool(policy: &str, preemptible: bool) -> Result<Option<bool>> {
    match policy {
        "" => Ok(None),
        RESTART_POLICY_ALWAYS if preemptible => Err(Error::invalid_configuration(
            "preemptible instances cannot be automatically restarted",
        )),
        RESTART_POLICY_ALWAYS => Ok(Some(true)),
        RESTART_POLICY_NEVER => Ok(Some(false)),
        other => Err(Error::invalid_configuration(format!(
            "unrecognized restart policy: {}",
            other
        ))),
    }
}

/// Checks that need no cloud round trip.
pub fn validate_machine(machine: &Machine, spec: &ProviderSpec) -> Result<()> {
    if spec.target_pools.iter().any(String::is_empty) {
        return Err(Error::invalid_configuration(
            "all target pools must have valid name",
        ));
    }
    if machine.cluster_id().is_empty() {
        return Err(Error::invalid_configuration(format!(
            "machine is missing {:?} label",
            CLUSTER_ID_LABEL
        )));
    }
    Ok(())
}

pub struct Reconciler<'a> {
    scope: &'a mut MachineScope,
}

impl<'a> Reconciler<'a> {
    pub fn new(scope: &'a mut MachineScope) -> Self {
        Self { scope }
    }

    fn validate(&self) -> Result<()> {
        validate_machine(&self.scope.machine, &self.scope.provider_spec).map_err(|e| {
            Error::invalid_configuration(format!("failed validating machine provider spec: {}", e))
        })
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(&mut self) -> Result<Reconciled> {
        self.validate()?;

        let machine_name = self.scope.machine.name().to_string();
        let labels = labels::instance_labels(
            self.scope.core.as_ref(),
            self.scope.feature_gates.gcp_labels_tags,
            &self.scope.provider_spec.labels,
            self.scope.machine.cluster_id(),
        )
        .await
        .map_err(|e| {
            e.context(format!(
                "error getting user-defined labels for machine {}",
                machine_name
            ))
        })?;

        let user_tags = if self.scope.feature_gates.gcp_labels_tags {
            self.resolved_tags().await.map_err(|e| {
                e.context(format!("failed to fetch user-defined tags for {}", machine_name))
            })?
        } else {
            BTreeMap::new()
        };

        let mut instance = self.base_instance(labels, &user_tags);

        let spec = &self.scope.provider_spec;
        let automatic_restart = restart_policy_to_bool(&spec.restart_policy, spec.preemptible)
            .map_err(|e| {
                Error::invalid_configuration(format!("failed to determine restart policy: {}", e))
            })?;
        if let Some(scheduling) = instance.scheduling.as_mut() {
            scheduling.automatic_restart = automatic_restart;
        }

        instance.shielded_instance_config = Some(ShieldedInstanceConfig {
            enable_secure_boot: spec.shielded_instance_config.secure_boot == POLICY_ENABLED,
            enable_vtpm: spec.shielded_instance_config.virtualized_trusted_platform_module
                != POLICY_DISABLED,
            enable_integrity_monitoring: spec.shielded_instance_config.integrity_monitoring
                != POLICY_DISABLED,
        });

        if spec.confidential_compute == POLICY_ENABLED {
            instance.confidential_instance_config = Some(ConfidentialInstanceConfig {
                enable_confidential_compute: true,
            });
        }

        match spec.gpus.as_slice() {
            [] => {}
            [gpu] => instance.guest_accelerators.push(AcceleratorConfig {
                accelerator_type: format!("zones/{}/acceleratorTypes/{}", spec.zone, gpu.gpu_type),
                accelerator_count: gpu.count,
            }),
            _ => {
                return Err(Error::invalid_configuration(
                    "More than one type of accelerator provided. Instances support only one accelerator type at a time.",
                ));
            }
        }

        self.validate_guest_accelerators().await?;

        instance.disks = self.disks(&user_tags).await?;
        instance.network_interfaces = self.network_interfaces();
        instance.service_accounts = self.service_accounts();
        instance.metadata = Some(self.metadata().await?);

        info!("Creating instance {}", machine_name);
        let inserted = self
            .scope
            .compute
            .instances_insert(&self.scope.project_id, &self.scope.provider_spec.zone, &instance)
            .await;

        if let Err(e) = inserted {
            let condition = Condition::machine_creation_failed(e.to_string());
            if let Err(reconcile_error) = self.reconcile_machine_with_cloud_state(Some(condition)).await {
                error!("Failed to reconcile machine with cloud state: {}", reconcile_error);
            }
            if e.is_client_error() {
                info!("Error launching instance: {}", e);
                return Err(Error::invalid_configuration(format!(
                    "error launching instance: {}",
                    e
                )));
            }
            return Err(Error::cloud("failed to create instance via compute service", e));
        }

        self.reconcile_machine_with_cloud_state(None).await
    }

    fn base_instance(
        &self,
        labels: BTreeMap<String, String>,
        user_tags: &BTreeMap<String, String>,
    ) -> Instance {
        let spec = &self.scope.provider_spec;

        Instance {
            name: self.scope.machine.name().to_string(),
            machine_type: format!("zones/{}/machineTypes/{}", spec.zone, spec.machine_type),
            can_ip_forward: spec.can_ip_forward,
            deletion_protection: spec.deletion_protection,
            labels,
            tags: Some(Tags {
                items: spec.tags.clone(),
            }),
            scheduling: Some(Scheduling {
                preemptible: spec.preemptible,
                on_host_maintenance: (!spec.on_host_maintenance.is_empty())
                    .then(|| spec.on_host_maintenance.clone()),
                automatic_restart: None,
            }),
            shielded_instance_config: Some(ShieldedInstanceConfig {
                enable_secure_boot: false,
                enable_vtpm: true,
                enable_integrity_monitoring: true,
            }),
            params: Some(InstanceParams {
                resource_manager_tags: user_tags.clone(),
            }),
            ..Default::default()
        }
    }

    /// Infrastructure and spec tags, merged.
    async fn merged_tags(&self) -> Result<Option<Vec<ResourceManagerTag>>> {
        let infrastructure = self
            .scope
            .core
            .get_infrastructure()
            .await
            .map_err(|e| Error::from(e).context("failed to get infrastructure"))?;
        let infrastructure_tags = infrastructure
            .gcp
            .map(|gcp| gcp.resource_tags)
            .unwrap_or_default();

        tags::merge_tags(
            &infrastructure_tags,
            &self.scope.provider_spec.resource_manager_tags,
        )
    }

    /// Merged tags resolved to `tagKeys/N -> tagValues/M`.
    async fn resolved_tags(&self) -> Result<BTreeMap<String, String>> {
        match self.merged_tags().await? {
            Some(merged) => tags::resolve_tags(self.scope.tags.as_ref(), &merged).await,
            None => Ok(BTreeMap::new()),
        }
    }

    // =========================================================================
    // Update
    // =========================================================================

    pub async fn update(&mut self) -> Result<Reconciled> {
        self.validate()?;

        self.process_target_pools(true, PoolAction::Add).await?;

        if self.scope.machine.is_control_plane() {
            self.register_instance_to_control_plane_instance_group()
                .await
                .map_err(|e| e.context("failed to register instance to instance group"))?;
        }

        if self.scope.feature_gates.gcp_labels_tags {
            self.bind_missing_tags().await?;
        }

        self.reconcile_machine_with_cloud_state(None).await
    }

    /// Attach merged tags that are not yet bound to the instance. Stale
    /// bindings are left alone.
    async fn bind_missing_tags(&self) -> Result<()> {
        let Some(merged) = self.merged_tags().await? else {
            return Ok(());
        };

        let spec = &self.scope.provider_spec;
        let instance = self
            .scope
            .compute
            .instances_get(&self.scope.project_id, &spec.zone, self.scope.machine.name())
            .await
            .map_err(|e| Error::cloud("failed to get instance via compute service", e))?;
        let Some(instance_id) = instance.id else {
            return Ok(());
        };

        let values: Vec<String> = merged.iter().map(tags::namespaced_value).collect();
        TagBinder::default()
            .bind(
                self.scope.tags.as_ref(),
                &self.scope.project_id,
                &spec.zone,
                &instance_id,
                &values,
            )
            .await
    }

    // =========================================================================
    // Exists / Delete
    // =========================================================================

    pub async fn exists(&self) -> Result<bool> {
        self.validate()?;

        let spec = &self.scope.provider_spec;
        match self
            .scope
            .compute
            .instances_get(&self.scope.project_id, &spec.zone, self.scope.machine.name())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match e.kind {
                CloudErrorKind::ProjectNotFound => Err(Error::invalid_configuration(format!(
                    "{}: Project does not exist",
                    self.scope.project_id
                ))),
                CloudErrorKind::InvalidZone => Err(Error::invalid_configuration(format!(
                    "{}: Zone does not exist",
                    spec.zone
                ))),
                CloudErrorKind::NotFound => {
                    info!("{}: Machine does not exist", self.scope.machine.name());
                    Ok(false)
                }
                _ => Err(Error::cloud("error getting running instances", e)),
            },
        }
    }

    pub async fn delete(&mut self) -> Result<Reconciled> {
        self.process_target_pools(false, PoolAction::Remove).await?;

        let name = self.scope.machine.name().to_string();
        let exists = match self.exists().await {
            Ok(exists) => exists,
            Err(e) if e.is_invalid_configuration() => {
                if self.scope.machine.spec.provider_id.is_some() {
                    return Err(Error::transient(format!(
                        "the machine {} has invalid configuration, but already exists, make the configuration of the machine valid for the deletion to be successful",
                        name
                    )));
                }
                false
            }
            Err(e) => return Err(e),
        };
        if !exists {
            info!("{}: Machine not found during delete, skipping", name);
            return Ok(Reconciled::Complete);
        }

        if self.scope.machine.is_control_plane() {
            self.unregister_instance_from_control_plane_instance_group()
                .await
                .map_err(|e| {
                    e.context(format!(
                        "{}: failed to unregister instance from instance group",
                        name
                    ))
                })?;
        }

        self.scope
            .compute
            .instances_delete(
                &self.scope.machine.metadata.uid,
                &self.scope.project_id,
                &self.scope.provider_spec.zone,
                &name,
            )
            .await
            .map_err(|e| Error::cloud("failed to delete instance via compute service", e))?;

        info!("{}: machine status is exists, requeuing...", name);
        Ok(Reconciled::RequeueAfter(REQUEUE_AFTER))
    }

    // =========================================================================
    // Cloud state
    // =========================================================================

    /// Copy observed instance state onto the machine.
    ///
    /// With a `failed_condition` only the condition is recorded.
    pub async fn reconcile_machine_with_cloud_state(
        &mut self,
        failed_condition: Option<Condition>,
    ) -> Result<Reconciled> {
        let name = self.scope.machine.name().to_string();
        info!("{}: Reconciling machine object with cloud state", name);

        if let Some(condition) = failed_condition {
            self.scope.provider_status.conditions =
                reconcile_conditions(&self.scope.provider_status.conditions, condition);
            return Ok(Reconciled::Complete);
        }

        let zone = self.scope.provider_spec.zone.clone();
        let project = self.scope.project_id.clone();
        let instance = self
            .scope
            .compute
            .instances_get(&project, &zone, &name)
            .await
            .map_err(|e| Error::cloud("failed to get instance via compute service", e))?;

        let Some(interface) = instance.network_interfaces.first() else {
            return Err(Error::transient(format!(
                "could not find network interfaces for instance {:?}",
                instance.name
            )));
        };

        let mut addresses = vec![NodeAddress::new(
            NodeAddressType::InternalIp,
            interface.network_ip.clone().unwrap_or_default(),
        )];
        for access in &interface.access_configs {
            addresses.push(NodeAddress::new(
                NodeAddressType::ExternalIp,
                access.nat_ip.clone().unwrap_or_default(),
            ));
        }
        // Both internal DNS schemes, since the project's age is unknown,
        // plus the bare name reachable through the search path.
        addresses.push(NodeAddress::new(
            NodeAddressType::InternalDns,
            format!("{}.{}.c.{}.internal", name, zone, project),
        ));
        addresses.push(NodeAddress::new(
            NodeAddressType::InternalDns,
            format!("{}.c.{}.internal", name, project),
        ));
        addresses.push(NodeAddress::new(NodeAddressType::InternalDns, name.clone()));

        self.scope.machine.spec.provider_id = Some(self.scope.provider_id.clone());
        self.scope.machine.status.addresses = addresses;
        self.scope.provider_status.instance_state = Some(instance.status.clone());
        self.scope.provider_status.instance_id = Some(instance.name.clone());
        self.scope.provider_status.conditions = reconcile_conditions(
            &self.scope.provider_status.conditions,
            Condition::machine_created(),
        );

        self.set_machine_cloud_provider_specifics(&instance);

        if instance.status != INSTANCE_STATE_RUNNING {
            info!("{}: machine status is {:?}, requeuing...", name, instance.status);
            return Ok(Reconciled::RequeueAfter(REQUEUE_AFTER));
        }

        Ok(Reconciled::Complete)
    }

    fn set_machine_cloud_provider_specifics(&mut self, instance: &Instance) {
        let spec = &self.scope.provider_spec;
        let metadata = &mut self.scope.machine.metadata;

        metadata
            .annotations
            .insert(INSTANCE_STATE_ANNOTATION.to_string(), instance.status.clone());
        // Taken from the spec rather than detected from the instance.
        metadata
            .labels
            .insert(INSTANCE_TYPE_LABEL.to_string(), spec.machine_type.clone());
        metadata
            .labels
            .insert(REGION_LABEL.to_string(), spec.region.clone());
        metadata
            .labels
            .insert(ZONE_LABEL.to_string(), spec.zone.clone());

        if spec.preemptible {
            metadata
                .labels
                .insert(INTERRUPTIBLE_INSTANCE_LABEL.to_string(), String::new());
            self.scope
                .machine
                .spec
                .metadata
                .labels
                .insert(INTERRUPTIBLE_INSTANCE_LABEL.to_string(), String::new());
        }
    }
}
