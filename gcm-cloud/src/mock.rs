//! Deterministic in-memory doubles for the capability contracts.
//!
//! The doubles keep just enough state for read-then-write sequences to
//! behave like the real APIs. Every call is recorded by method name and any
//! method can be made to fail with [`MockComputeService::fail`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::compute::{ComputeService, ComputeServiceBuilder, DEFAULT_COMPUTE_BASE_PATH};
use crate::error::{CloudError, Result};
use crate::tags::{TagService, TagServiceBuilder};
use crate::types::{
    AcceleratorType, BackendService, EffectiveTag, GpuCompatibleMachineTypes, GpuInfo, Image,
    Instance, InstanceGroup, InstanceWithNamedPorts, Operation, Quota, Region, TagBinding,
    TagValue, TargetPool, Zone,
};

/// Private IP assigned to every inserted instance.
pub const MOCK_INTERNAL_IP: &str = "10.0.0.15";
/// NAT IP assigned to every access config of an inserted instance.
pub const MOCK_EXTERNAL_IP: &str = "35.243.147.143";

const GPU_METRICS: &[&str] = &[
    "NVIDIA_K80_GPUS",
    "NVIDIA_P100_GPUS",
    "NVIDIA_V100_GPUS",
    "NVIDIA_A100_GPUS",
    "NVIDIA_P4_GPUS",
    "NVIDIA_T4_GPUS",
    "NVIDIA_A100_80GB_GPUS",
];

const ACCELERATOR_TYPES: &[&str] = &[
    "nvidia-tesla-k80",
    "nvidia-tesla-p100",
    "nvidia-tesla-v100",
    "nvidia-tesla-a100",
    "nvidia-tesla-p4",
    "nvidia-tesla-t4",
    "nvidia-a100-80gb",
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn done(name: &str) -> Operation {
    Operation {
        name: name.to_string(),
        status: "DONE".to_string(),
        target_link: None,
    }
}

// =============================================================================
// Compute
// =============================================================================

struct ComputeState {
    instances: HashMap<String, Instance>,
    regions: HashMap<String, Region>,
    accelerator_types: HashSet<String>,
    gpu_machine_types: GpuCompatibleMachineTypes,
    target_pools: HashMap<String, TargetPool>,
    instance_groups: HashMap<String, InstanceGroup>,
    group_members: HashMap<String, Vec<InstanceWithNamedPorts>>,
    backend_services: HashMap<String, BackendService>,
    images: HashMap<String, Image>,
    failures: HashMap<String, CloudError>,
    calls: Vec<String>,
    delete_request_ids: Vec<String>,
    insert_status: String,
    next_id: u64,
}

/// In-memory [`ComputeService`].
///
/// Seeded with every supported accelerator type, the a2/n1 machine type
/// families, and regions whose GPU quotas have a limit of 8 and no usage.
pub struct MockComputeService {
    base_path: String,
    state: Mutex<ComputeState>,
}

impl Default for MockComputeService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockComputeService {
    pub fn new() -> Self {
        let mut a2 = BTreeMap::new();
        a2.insert(
            "a2-highgpu-1g".to_string(),
            GpuInfo {
                accelerator_type: "nvidia-tesla-a100".to_string(),
                count: 1,
            },
        );
        a2.insert(
            "a2-highgpu-2g".to_string(),
            GpuInfo {
                accelerator_type: "nvidia-tesla-a100".to_string(),
                count: 2,
            },
        );

        Self {
            base_path: DEFAULT_COMPUTE_BASE_PATH.to_string(),
            state: Mutex::new(ComputeState {
                instances: HashMap::new(),
                regions: HashMap::new(),
                accelerator_types: ACCELERATOR_TYPES.iter().map(|t| t.to_string()).collect(),
                gpu_machine_types: GpuCompatibleMachineTypes {
                    a2,
                    n1: vec!["n1-standard-1".to_string(), "n1-standard-4".to_string()],
                },
                target_pools: HashMap::new(),
                instance_groups: HashMap::new(),
                group_members: HashMap::new(),
                backend_services: HashMap::new(),
                images: HashMap::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                delete_request_ids: Vec::new(),
                insert_status: "RUNNING".to_string(),
                next_id: 1_000_000,
            }),
        }
    }

    pub fn with_base_path(mut self, base_path: &str) -> Self {
        self.base_path = base_path.to_string();
        self
    }

    /// Wrap the double in a builder that always hands out this instance.
    pub fn builder(service: Arc<Self>) -> ComputeServiceBuilder {
        Arc::new(move |_credentials: &str, _endpoint: Option<&str>| {
            let service: Arc<dyn ComputeService> = service.clone();
            Ok(service)
        })
    }

    // --- seeding ---

    pub fn add_instance(&self, instance: Instance) {
        lock(&self.state)
            .instances
            .insert(instance.name.clone(), instance);
    }

    pub fn add_region(&self, region: Region) {
        lock(&self.state).regions.insert(region.name.clone(), region);
    }

    pub fn remove_accelerator_type(&self, accelerator_type: &str) {
        lock(&self.state).accelerator_types.remove(accelerator_type);
    }

    pub fn add_target_pool(&self, name: &str, instances: &[&str]) {
        lock(&self.state).target_pools.insert(
            name.to_string(),
            TargetPool {
                name: name.to_string(),
                instances: instances.iter().map(|i| i.to_string()).collect(),
            },
        );
    }

    pub fn add_instance_group(&self, group: InstanceGroup) {
        lock(&self.state)
            .instance_groups
            .insert(group.name.clone(), group);
    }

    pub fn add_group_member(&self, group: &str, instance_link: &str, status: &str) {
        lock(&self.state)
            .group_members
            .entry(group.to_string())
            .or_default()
            .push(InstanceWithNamedPorts {
                instance: instance_link.to_string(),
                status: status.to_string(),
            });
    }

    pub fn add_backend_service(&self, service: BackendService) {
        lock(&self.state)
            .backend_services
            .insert(service.name.clone(), service);
    }

    pub fn add_image(&self, image: Image) {
        lock(&self.state).images.insert(image.name.clone(), image);
    }

    /// Status given to instances created through `instances_insert`.
    pub fn set_insert_status(&self, status: &str) {
        lock(&self.state).insert_status = status.to_string();
    }

    /// Make every call to `method` fail with `error`.
    pub fn fail(&self, method: &str, error: CloudError) {
        lock(&self.state)
            .failures
            .insert(method.to_string(), error);
    }

    pub fn clear_failure(&self, method: &str) {
        lock(&self.state).failures.remove(method);
    }

    // --- inspection ---

    /// Method names of every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        lock(&self.state).instances.get(name).cloned()
    }

    pub fn target_pool(&self, name: &str) -> Option<TargetPool> {
        lock(&self.state).target_pools.get(name).cloned()
    }

    pub fn instance_group(&self, name: &str) -> Option<InstanceGroup> {
        lock(&self.state).instance_groups.get(name).cloned()
    }

    pub fn group_members(&self, group: &str) -> Vec<InstanceWithNamedPorts> {
        lock(&self.state)
            .group_members
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn backend_service(&self, name: &str) -> Option<BackendService> {
        lock(&self.state).backend_services.get(name).cloned()
    }

    pub fn delete_request_ids(&self) -> Vec<String> {
        lock(&self.state).delete_request_ids.clone()
    }

    fn enter(&self, method: &str) -> Result<MutexGuard<'_, ComputeState>> {
        let mut state = lock(&self.state);
        state.calls.push(method.to_string());
        if let Some(error) = state.failures.get(method).cloned() {
            return Err(error);
        }
        Ok(state)
    }
}

fn default_region(name: &str) -> Region {
    let quotas = GPU_METRICS
        .iter()
        .flat_map(|metric| [metric.to_string(), format!("PREEMPTIBLE_{}", metric)])
        .map(|metric| Quota {
            metric,
            limit: 8.0,
            usage: 0.0,
        })
        .collect();
    Region {
        name: name.to_string(),
        quotas,
    }
}

fn instance_link(project: &str, zone: &str, name: &str) -> String {
    format!(
        "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instances/{}",
        project, zone, name
    )
}

#[async_trait]
impl ComputeService for MockComputeService {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation> {
        let mut state = self.enter("instances_insert")?;
        state.next_id += 1;

        let mut created = instance.clone();
        created.id = Some(state.next_id.to_string());
        created.status = state.insert_status.clone();
        created.zone = Some(zone.to_string());
        created.self_link = Some(instance_link(project, zone, &instance.name));
        for interface in &mut created.network_interfaces {
            interface.network_ip = Some(MOCK_INTERNAL_IP.to_string());
            for access in &mut interface.access_configs {
                access.nat_ip = Some(MOCK_EXTERNAL_IP.to_string());
            }
        }

        state.instances.insert(created.name.clone(), created);
        Ok(done("insert"))
    }

    async fn instances_get(&self, project: &str, zone: &str, name: &str) -> Result<Instance> {
        let state = self.enter("instances_get")?;
        state.instances.get(name).cloned().ok_or_else(|| {
            CloudError::not_found(format!(
                "The resource 'projects/{}/zones/{}/instances/{}' was not found",
                project, zone, name
            ))
        })
    }

    async fn instances_delete(
        &self,
        request_id: &str,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation> {
        let mut state = self.enter("instances_delete")?;
        state.delete_request_ids.push(request_id.to_string());
        match state.instances.remove(name) {
            Some(_) => Ok(done("delete")),
            None => Err(CloudError::not_found(format!(
                "The resource 'projects/{}/zones/{}/instances/{}' was not found",
                project, zone, name
            ))),
        }
    }

    async fn regions_get(&self, _project: &str, region: &str) -> Result<Region> {
        let state = self.enter("regions_get")?;
        Ok(state
            .regions
            .get(region)
            .cloned()
            .unwrap_or_else(|| default_region(region)))
    }

    async fn zones_get(&self, _project: &str, zone: &str) -> Result<Zone> {
        let _state = self.enter("zones_get")?;
        Ok(Zone {
            name: zone.to_string(),
            status: "UP".to_string(),
            region: None,
        })
    }

    async fn accelerator_types_get(
        &self,
        _project: &str,
        zone: &str,
        accelerator_type: &str,
    ) -> Result<AcceleratorType> {
        let state = self.enter("accelerator_types_get")?;
        if state.accelerator_types.contains(accelerator_type) {
            Ok(AcceleratorType {
                name: accelerator_type.to_string(),
                description: None,
                maximum_cards_per_instance: Some(8),
            })
        } else {
            Err(CloudError::not_found(format!(
                "accelerator type {} not found in zone {}",
                accelerator_type, zone
            )))
        }
    }

    async fn gpu_compatible_machine_types(
        &self,
        _project: &str,
        _zone: &str,
    ) -> Result<GpuCompatibleMachineTypes> {
        let state = self.enter("gpu_compatible_machine_types")?;
        Ok(state.gpu_machine_types.clone())
    }

    async fn target_pools_get(
        &self,
        _project: &str,
        _region: &str,
        pool: &str,
    ) -> Result<TargetPool> {
        let state = self.enter("target_pools_get")?;
        state
            .target_pools
            .get(pool)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("target pool {} not found", pool)))
    }

    async fn target_pools_add_instance(
        &self,
        _project: &str,
        _region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation> {
        let mut state = self.enter("target_pools_add_instance")?;
        let target = state
            .target_pools
            .get_mut(pool)
            .ok_or_else(|| CloudError::not_found(format!("target pool {} not found", pool)))?;
        target.instances.push(instance_link.to_string());
        Ok(done("addInstance"))
    }

    async fn target_pools_remove_instance(
        &self,
        _project: &str,
        _region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation> {
        let mut state = self.enter("target_pools_remove_instance")?;
        let target = state
            .target_pools
            .get_mut(pool)
            .ok_or_else(|| CloudError::not_found(format!("target pool {} not found", pool)))?;
        target.instances.retain(|i| i != instance_link);
        Ok(done("removeInstance"))
    }

    async fn instance_groups_get(
        &self,
        _project: &str,
        _zone: &str,
        group: &str,
    ) -> Result<InstanceGroup> {
        let state = self.enter("instance_groups_get")?;
        state
            .instance_groups
            .get(group)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("instance group {} not found", group)))
    }

    async fn instance_groups_insert(
        &self,
        project: &str,
        zone: &str,
        group: &InstanceGroup,
    ) -> Result<Operation> {
        let mut state = self.enter("instance_groups_insert")?;
        let mut created = group.clone();
        created.zone = Some(zone.to_string());
        created.self_link = Some(format!(
            "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instanceGroups/{}",
            project, zone, group.name
        ));
        state.instance_groups.insert(created.name.clone(), created);
        Ok(done("insertGroup"))
    }

    async fn instance_groups_add_instances(
        &self,
        _project: &str,
        _zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation> {
        let mut state = self.enter("instance_groups_add_instances")?;
        state
            .group_members
            .entry(group.to_string())
            .or_default()
            .push(InstanceWithNamedPorts {
                instance: instance_link.to_string(),
                status: "RUNNING".to_string(),
            });
        Ok(done("addInstances"))
    }

    async fn instance_groups_remove_instances(
        &self,
        _project: &str,
        _zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation> {
        let mut state = self.enter("instance_groups_remove_instances")?;
        if let Some(members) = state.group_members.get_mut(group) {
            members.retain(|m| m.instance != instance_link);
        }
        Ok(done("removeInstances"))
    }

    async fn instance_groups_list_instances(
        &self,
        _project: &str,
        _zone: &str,
        group: &str,
    ) -> Result<Vec<InstanceWithNamedPorts>> {
        let state = self.enter("instance_groups_list_instances")?;
        Ok(state
            .group_members
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.status == "RUNNING")
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn region_backend_services_get(
        &self,
        _project: &str,
        _region: &str,
        name: &str,
    ) -> Result<BackendService> {
        let state = self.enter("region_backend_services_get")?;
        state
            .backend_services
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("backend service {} not found", name)))
    }

    async fn region_backend_services_patch(
        &self,
        _project: &str,
        _region: &str,
        name: &str,
        service: &BackendService,
    ) -> Result<Operation> {
        let mut state = self.enter("region_backend_services_patch")?;
        state
            .backend_services
            .insert(name.to_string(), service.clone());
        Ok(done("patchBackendService"))
    }

    async fn images_get(&self, _project: &str, image: &str) -> Result<Image> {
        let state = self.enter("images_get")?;
        state
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("image {} not found", image)))
    }
}

// =============================================================================
// Tags
// =============================================================================

#[derive(Default)]
struct TagState {
    values: HashMap<String, TagValue>,
    effective: HashMap<String, Vec<EffectiveTag>>,
    lookup_failures: HashMap<String, CloudError>,
    binding_failures: HashMap<String, CloudError>,
    bindings: Vec<TagBinding>,
    calls: Vec<String>,
}

/// In-memory [`TagService`].
#[derive(Default)]
pub struct MockTagService {
    state: Mutex<TagState>,
}

impl MockTagService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder(service: Arc<Self>) -> TagServiceBuilder {
        Arc::new(move |_credentials: &str, _endpoint: Option<&str>| {
            let service: Arc<dyn TagService> = service.clone();
            Ok(service)
        })
    }

    /// Register `namespaced_name` (`<parent>/<key>/<value>`) as resolving to
    /// `tagKeys/<key_id>` / `tagValues/<value_id>`.
    pub fn add_tag_value(&self, namespaced_name: &str, key_id: &str, value_id: &str) {
        let short_name = namespaced_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        lock(&self.state).values.insert(
            namespaced_name.to_string(),
            TagValue {
                name: format!("tagValues/{}", value_id),
                parent: format!("tagKeys/{}", key_id),
                short_name,
                namespaced_name: namespaced_name.to_string(),
            },
        );
    }

    /// Mark `namespaced_value` as already bound to `parent`.
    pub fn add_effective_tag(&self, parent: &str, namespaced_value: &str) {
        lock(&self.state)
            .effective
            .entry(parent.to_string())
            .or_default()
            .push(EffectiveTag {
                namespaced_tag_value: namespaced_value.to_string(),
                ..Default::default()
            });
    }

    pub fn fail_lookup(&self, namespaced_name: &str, error: CloudError) {
        lock(&self.state)
            .lookup_failures
            .insert(namespaced_name.to_string(), error);
    }

    pub fn fail_binding(&self, namespaced_value: &str, error: CloudError) {
        lock(&self.state)
            .binding_failures
            .insert(namespaced_value.to_string(), error);
    }

    pub fn bindings(&self) -> Vec<TagBinding> {
        lock(&self.state).bindings.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl TagService for MockTagService {
    async fn get_namespaced_tag_value(&self, namespaced_name: &str) -> Result<TagValue> {
        let mut state = lock(&self.state);
        state.calls.push("get_namespaced_tag_value".to_string());
        if let Some(error) = state.lookup_failures.get(namespaced_name) {
            return Err(error.clone());
        }
        state.values.get(namespaced_name).cloned().ok_or_else(|| {
            CloudError::not_found(format!("tag value {} not found", namespaced_name))
        })
    }

    async fn list_effective_tags(
        &self,
        _location: &str,
        parent: &str,
    ) -> Result<Vec<EffectiveTag>> {
        let mut state = lock(&self.state);
        state.calls.push("list_effective_tags".to_string());
        Ok(state.effective.get(parent).cloned().unwrap_or_default())
    }

    async fn create_tag_binding(
        &self,
        _location: &str,
        parent: &str,
        tag_value_namespaced_name: &str,
    ) -> Result<TagBinding> {
        let mut state = lock(&self.state);
        state.calls.push("create_tag_binding".to_string());
        if let Some(error) = state.binding_failures.get(tag_value_namespaced_name) {
            return Err(error.clone());
        }

        let binding = TagBinding {
            name: format!("tagBindings/{}", state.bindings.len() + 1),
            parent: parent.to_string(),
            tag_value_namespaced_name: tag_value_namespaced_name.to_string(),
        };
        state.bindings.push(binding.clone());
        state
            .effective
            .entry(parent.to_string())
            .or_default()
            .push(EffectiveTag {
                namespaced_tag_value: tag_value_namespaced_name.to_string(),
                ..Default::default()
            });
        Ok(binding)
    }
}
