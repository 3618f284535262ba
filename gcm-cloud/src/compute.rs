//! Compute capability contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CloudError, Result};
use crate::types::{
    AcceleratorType, BackendService, GpuCompatibleMachineTypes, GpuInfo, Image, Instance,
    InstanceGroup, InstanceWithNamedPorts, MachineType, Operation, Region, TargetPool, Zone,
};

/// Default Compute Engine v1 endpoint.
pub const DEFAULT_COMPUTE_BASE_PATH: &str = "https://compute.googleapis.com/compute/v1/";

/// Builds a compute client from the credentials JSON and an optional
/// endpoint override.
pub type ComputeServiceBuilder =
    Arc<dyn Fn(&str, Option<&str>) -> std::result::Result<Arc<dyn ComputeService>, CloudError> + Send + Sync>;

/// Operations the actuator needs from Compute Engine.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Base path used to resolve relative resource references.
    fn base_path(&self) -> &str;

    // =========================================================================
    // Instances
    // =========================================================================

    /// Create an instance.
    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation>;

    /// Get an instance by name.
    async fn instances_get(&self, project: &str, zone: &str, name: &str) -> Result<Instance>;

    /// Delete an instance. `request_id` makes retries idempotent.
    async fn instances_delete(
        &self,
        request_id: &str,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation>;

    // =========================================================================
    // Regions, zones, accelerators
    // =========================================================================

    /// Get a region, including its quotas.
    async fn regions_get(&self, project: &str, region: &str) -> Result<Region>;

    /// Get a zone.
    async fn zones_get(&self, project: &str, zone: &str) -> Result<Zone>;

    /// Get an accelerator type available in a zone.
    async fn accelerator_types_get(
        &self,
        project: &str,
        zone: &str,
        accelerator_type: &str,
    ) -> Result<AcceleratorType>;

    /// List the machine types in a zone that can carry accelerators.
    async fn gpu_compatible_machine_types(
        &self,
        project: &str,
        zone: &str,
    ) -> Result<GpuCompatibleMachineTypes>;

    // =========================================================================
    // Target pools
    // =========================================================================

    /// Get a target pool.
    async fn target_pools_get(&self, project: &str, region: &str, pool: &str)
    -> Result<TargetPool>;

    /// Add an instance (by self-link) to a target pool.
    async fn target_pools_add_instance(
        &self,
        project: &str,
        region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation>;

    /// Remove an instance (by self-link) from a target pool.
    async fn target_pools_remove_instance(
        &self,
        project: &str,
        region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation>;

    // =========================================================================
    // Instance groups
    // =========================================================================

    /// Get an unmanaged instance group.
    async fn instance_groups_get(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<InstanceGroup>;

    /// Create an unmanaged instance group.
    async fn instance_groups_insert(
        &self,
        project: &str,
        zone: &str,
        group: &InstanceGroup,
    ) -> Result<Operation>;

    /// Add an instance (by self-link) to a group.
    async fn instance_groups_add_instances(
        &self,
        project: &str,
        zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation>;

    /// Remove an instance (by self-link) from a group.
    async fn instance_groups_remove_instances(
        &self,
        project: &str,
        zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation>;

    /// List the running members of a group.
    async fn instance_groups_list_instances(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<Vec<InstanceWithNamedPorts>>;

    // =========================================================================
    // Backend services
    // =========================================================================

    /// Get a regional backend service.
    async fn region_backend_services_get(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<BackendService>;

    /// Patch a regional backend service.
    async fn region_backend_services_patch(
        &self,
        project: &str,
        region: &str,
        name: &str,
        service: &BackendService,
    ) -> Result<Operation>;

    // =========================================================================
    // Images
    // =========================================================================

    /// Get an image.
    async fn images_get(&self, project: &str, image: &str) -> Result<Image>;
}

/// Split a zone's machine types into the a2 family (fixed accelerator) and
/// the n1 family (declared accelerator). Everything else is dropped.
pub fn classify_gpu_machine_types(
    machine_types: impl IntoIterator<Item = MachineType>,
) -> GpuCompatibleMachineTypes {
    let mut result = GpuCompatibleMachineTypes::default();
    for machine_type in machine_types {
        if machine_type.name.starts_with("a2-") {
            if let Some(accelerator) = machine_type.accelerators.first() {
                result.a2.insert(
                    machine_type.name.clone(),
                    GpuInfo {
                        accelerator_type: accelerator.guest_accelerator_type.clone(),
                        count: accelerator.guest_accelerator_count,
                    },
                );
            }
        } else if machine_type.name.starts_with("n1-") {
            result.n1.push(machine_type.name);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineTypeAccelerator;

    fn machine_type(name: &str, accelerators: &[(&str, i64)]) -> MachineType {
        MachineType {
            name: name.to_string(),
            accelerators: accelerators
                .iter()
                .map(|(t, c)| MachineTypeAccelerator {
                    guest_accelerator_type: t.to_string(),
                    guest_accelerator_count: *c,
                })
                .collect(),
        }
    }

    #[test]
    fn test_classify_gpu_machine_types() {
        let types = classify_gpu_machine_types(vec![
            machine_type("a2-highgpu-1g", &[("nvidia-tesla-a100", 1)]),
            machine_type("n1-standard-4", &[]),
            machine_type("e2-medium", &[]),
        ]);

        assert_eq!(
            types.a2.get("a2-highgpu-1g"),
            Some(&GpuInfo {
                accelerator_type: "nvidia-tesla-a100".to_string(),
                count: 1
            })
        );
        assert_eq!(types.n1, vec!["n1-standard-4".to_string()]);
        assert!(!types.a2.contains_key("e2-medium"));
    }

    #[test]
    fn test_a2_without_accelerator_listing_is_skipped() {
        let types = classify_gpu_machine_types(vec![machine_type("a2-megagpu-16g", &[])]);
        assert!(types.a2.is_empty());
    }
}
