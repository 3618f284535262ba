//! Target pool and control-plane instance group membership.
//!
//! Every step reads the shared cloud object first and only writes when the
//! observed membership differs from the desired one.

use std::collections::HashSet;

use gcm_cloud::types::{Backend, InstanceGroup};
use tracing::{debug, info};

use super::{Reconciler, instance_self_link};
use crate::error::{Error, Result};
use crate::machine::MACHINE_ROLE_LABEL;

const INSTANCE_STATE_RUNNING: &str = "RUNNING";
const BALANCING_MODE_CONNECTION: &str = "CONNECTION";

/// Mutation applied to a pool whose membership differs from the desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    Add,
    Remove,
}

impl Reconciler<'_> {
    // =========================================================================
    // Target pools
    // =========================================================================

    pub(crate) async fn process_target_pools(&self, desired: bool, action: PoolAction) -> Result<()> {
        let link = self.instance_self_link();

        for pool in &self.scope.provider_spec.target_pools {
            let present = self.instance_exists_in_pool(&link, pool).await?;
            if present != desired {
                info!(
                    "{}: reconciling instance for targetpool with cloud provider; desired state: {}",
                    self.scope.machine.name(),
                    desired
                );
                match action {
                    PoolAction::Add => self.add_instance_to_target_pool(&link, pool).await?,
                    PoolAction::Remove => self.remove_instance_from_target_pool(&link, pool).await?,
                }
            }
        }

        Ok(())
    }

    async fn instance_exists_in_pool(&self, link: &str, pool: &str) -> Result<bool> {
        let target_pool = self
            .scope
            .compute
            .target_pools_get(&self.scope.project_id, &self.scope.provider_spec.region, pool)
            .await
            .map_err(|e| Error::cloud("unable to get targetpool", e))?;

        Ok(target_pool.instances.iter().any(|i| i == link))
    }

    async fn add_instance_to_target_pool(&self, link: &str, pool: &str) -> Result<()> {
        self.scope
            .compute
            .target_pools_add_instance(&self.scope.project_id, &self.scope.provider_spec.region, pool, link)
            .await
            .map_err(|e| {
                Error::cloud(
                    format!(
                        "failed to add instance {} to target pool {}",
                        self.scope.machine.name(),
                        pool
                    ),
                    e,
                )
            })?;
        Ok(())
    }

    async fn remove_instance_from_target_pool(&self, link: &str, pool: &str) -> Result<()> {
        self.scope
            .compute
            .target_pools_remove_instance(
                &self.scope.project_id,
                &self.scope.provider_spec.region,
                pool,
                link,
            )
            .await
            .map_err(|e| {
                Error::cloud(
                    format!(
                        "failed to remove instance {} from target pool {}",
                        self.scope.machine.name(),
                        pool
                    ),
                    e,
                )
            })?;
        Ok(())
    }

    // =========================================================================
    // Control-plane instance group
    // =========================================================================

    /// Add the instance to its zone's control-plane group once it runs.
    pub(crate) async fn register_instance_to_control_plane_instance_group(&self) -> Result<()> {
        let link = self.instance_self_link();
        let group = self.control_plane_group_name();

        self.ensure_instance_group(&group).await.map_err(|e| {
            e.context(format!(
                "failed to ensure that instance group {} is a proper instance group",
                group
            ))
        })?;

        let members = self.fetch_running_instances_in_instance_group(&group).await?;
        let running =
            self.scope.provider_status.instance_state.as_deref() == Some(INSTANCE_STATE_RUNNING);

        if !members.contains(&link) && running {
            debug!(machine = %self.scope.machine.name(), group = %group, "Registering instance in the instance group");
            self.scope
                .compute
                .instance_groups_add_instances(
                    &self.scope.project_id,
                    &self.scope.provider_spec.zone,
                    &link,
                    &group,
                )
                .await
                .map_err(|e| Error::cloud("InstanceGroupsAddInstances request failed", e))?;
        }

        Ok(())
    }

    pub(crate) async fn unregister_instance_from_control_plane_instance_group(&self) -> Result<()> {
        let link = self.instance_self_link();
        let group = self.control_plane_group_name();

        let members = self.fetch_running_instances_in_instance_group(&group).await?;
        if members.contains(&link) {
            debug!(machine = %self.scope.machine.name(), group = %group, "Unregistering instance from the instance group");
            self.scope
                .compute
                .instance_groups_remove_instances(
                    &self.scope.project_id,
                    &self.scope.provider_spec.zone,
                    &link,
                    &group,
                )
                .await
                .map_err(|e| Error::cloud("InstanceGroupsRemoveInstances request failed", e))?;
        }

        Ok(())
    }

    /// Create the group when missing and make sure the cluster's internal
    /// API backend service points at it.
    async fn ensure_instance_group(&self, group: &str) -> Result<()> {
        match self
            .scope
            .compute
            .instance_groups_get(&self.scope.project_id, &self.scope.provider_spec.zone, group)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.register_new_instance_group().await.map_err(|e| {
                    e.context(format!(
                        "failed to register the new instance group named {}",
                        group
                    ))
                })?;
            }
            Err(e) => return Err(Error::cloud("instanceGroupGet request failed", e)),
        }

        let registered = self
            .check_registration_of_backend()
            .await
            .map_err(|e| e.context("failed to retrieve the backend service"))?;

        if !registered {
            self.update_backend_service_with_instance_group()
                .await
                .map_err(|e| {
                    e.context(format!(
                        "failed to update the backend service with new instance group {}",
                        group
                    ))
                })?;
        }

        Ok(())
    }

    async fn register_new_instance_group(&self) -> Result<()> {
        let spec = &self.scope.provider_spec;
        let (network, subnetwork) = self.network_and_subnet_names()?;
        info!("Creating instance group {}", self.control_plane_group_name());

        self.scope
            .compute
            .instance_groups_insert(
                &self.scope.project_id,
                &spec.zone,
                &InstanceGroup {
                    name: self.control_plane_group_name(),
                    region: Some(spec.region.clone()),
                    zone: Some(spec.zone.clone()),
                    network: Some(format!(
                        "projects/{}/global/networks/{}",
                        self.scope.project_id, network
                    )),
                    subnetwork: Some(format!(
                        "projects/{}/regions/{}/subnetworks/{}",
                        self.scope.project_id, spec.region, subnetwork
                    )),
                    self_link: None,
                },
            )
            .await
            .map_err(|e| Error::cloud("instanceGroupInsert request failed", e))?;

        Ok(())
    }

    /// The interface on `<cluster>-network` / `<cluster>-<role>-subnet`, or
    /// else the first interface.
    fn network_and_subnet_names(&self) -> Result<(String, String)> {
        let machine = &self.scope.machine;
        let cluster_id = machine.cluster_id();
        let role = machine.label(MACHINE_ROLE_LABEL).unwrap_or_default();

        let network = format!("{}-network", cluster_id);
        let subnetwork = format!("{}-{}-subnet", cluster_id, role);

        let interfaces = &self.scope.provider_spec.network_interfaces;
        if interfaces
            .iter()
            .any(|nic| nic.network == network && nic.subnetwork == subnetwork)
        {
            return Ok((network, subnetwork));
        }

        let first = interfaces.first().ok_or_else(|| {
            Error::invalid_configuration(format!(
                "machine {} has no network interfaces for the instance group",
                machine.name()
            ))
        })?;
        Ok((first.network.clone(), first.subnetwork.clone()))
    }

    async fn check_registration_of_backend(&self) -> Result<bool> {
        let service = self
            .scope
            .compute
            .region_backend_services_get(
                &self.scope.project_id,
                &self.scope.provider_spec.region,
                &self.backend_service_name(),
            )
            .await
            .map_err(|e| Error::cloud("backendServiceGet request failed", e))?;

        let group_link = self.instance_group_link();
        Ok(service.backends.iter().any(|b| b.group == group_link))
    }

    async fn update_backend_service_with_instance_group(&self) -> Result<()> {
        let name = self.backend_service_name();
        let region = &self.scope.provider_spec.region;
        let compute = &self.scope.compute;

        let mut service = compute
            .region_backend_services_get(&self.scope.project_id, region, &name)
            .await
            .map_err(|e| Error::cloud("backendServiceGet request failed", e))?;

        service.backends.push(Backend {
            group: self.instance_group_link(),
            balancing_mode: Some(BALANCING_MODE_CONNECTION.to_string()),
        });

        compute
            .region_backend_services_patch(&self.scope.project_id, region, &name, &service)
            .await
            .map_err(|e| Error::cloud("addInstanceGroupToBackendService request failed", e))?;

        Ok(())
    }

    async fn fetch_running_instances_in_instance_group(
        &self,
        group: &str,
    ) -> Result<HashSet<String>> {
        let members = self
            .scope
            .compute
            .instance_groups_list_instances(
                &self.scope.project_id,
                &self.scope.provider_spec.zone,
                group,
            )
            .await
            .map_err(|e| {
                Error::cloud("instanceGroupsListInstances request failed", e).context(format!(
                    "failed to fetch running instances in instance group {}",
                    group
                ))
            })?;

        Ok(members.into_iter().map(|m| m.instance).collect())
    }

    // =========================================================================
    // Names
    // =========================================================================

    fn instance_self_link(&self) -> String {
        instance_self_link(
            &self.scope.project_id,
            &self.scope.provider_spec.zone,
            self.scope.machine.name(),
        )
    }

    /// `<cluster>-master-<zone>`.
    pub(crate) fn control_plane_group_name(&self) -> String {
        format!(
            "{}-master-{}",
            self.scope.machine.cluster_id(),
            self.scope.provider_spec.zone
        )
    }

    fn instance_group_link(&self) -> String {
        format!(
            "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instanceGroups/{}",
            self.scope.project_id,
            self.scope.provider_spec.zone,
            self.control_plane_group_name()
        )
    }

    /// `<cluster>-api-internal`.
    fn backend_service_name(&self) -> String {
        format!("{}-api-internal", self.scope.machine.cluster_id())
    }
}
