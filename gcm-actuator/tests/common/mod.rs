//! Shared test utilities for gcm-actuator integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use gcm_actuator::core::{CoreError, CoreResult, Infrastructure, Secret};
use gcm_actuator::events::EventType;
use gcm_actuator::machine::{CLUSTER_ID_LABEL, MACHINE_ROLE_LABEL};
use gcm_actuator::provider::{
    Disk, LocalSecretReference, NetworkInterfaceSpec, ProviderSpec, ServiceAccountSpec,
};
use gcm_actuator::scope::CREDENTIALS_SECRET_KEY;
use gcm_actuator::{
    Actuator, ActuatorParams, CoreClient, EventRecorder, FeatureGates, Machine, MachineScope,
    MachineScopeParams,
};
use gcm_cloud::mock::{MOCK_INTERNAL_IP, MockComputeService, MockTagService};
use gcm_cloud::types::{Backend, BackendService, Instance, NetworkInterface};
use serde_json::{Map, Value};

pub const NAMESPACE: &str = "openshift-machine-api";
pub const CLUSTER_ID: &str = "test-3546b";
pub const PROJECT: &str = "proj";
pub const REGION: &str = "us-east1";
pub const ZONE: &str = "us-east1-b";
pub const CREDENTIALS_SECRET: &str = "gcp-cloud-credentials";
pub const USER_DATA_SECRET: &str = "worker-user-data";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Core client
// =============================================================================

#[derive(Default)]
struct CoreState {
    secrets: HashMap<(String, String), Secret>,
    infrastructure: Infrastructure,
    machines: HashMap<String, Machine>,
    machine_patches: Vec<Value>,
    status_patches: Vec<Value>,
}

/// In-memory API server: secrets, the infrastructure document and machines
/// that accept merge patches.
#[derive(Default)]
pub struct FakeCoreClient {
    state: Mutex<CoreState>,
}

impl FakeCoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        };
        lock(&self.state)
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    /// Like [`FakeCoreClient::add_secret`] but with raw values.
    pub fn add_secret_bytes(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        let secret = Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        };
        lock(&self.state)
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn set_infrastructure(&self, infrastructure: Infrastructure) {
        lock(&self.state).infrastructure = infrastructure;
    }

    /// Store `machine` as the server-side copy.
    pub fn add_machine(&self, machine: &Machine) {
        lock(&self.state)
            .machines
            .insert(machine.name().to_string(), machine.clone());
    }

    pub fn machine(&self, name: &str) -> Option<Machine> {
        lock(&self.state).machines.get(name).cloned()
    }

    pub fn machine_patches(&self) -> Vec<Value> {
        lock(&self.state).machine_patches.clone()
    }

    pub fn status_patches(&self) -> Vec<Value> {
        lock(&self.state).status_patches.clone()
    }

    fn apply(&self, machine: &Machine, patch: &Value, status: bool) -> CoreResult<Machine> {
        let mut state = lock(&self.state);
        let stored = state
            .machines
            .get(machine.name())
            .cloned()
            .unwrap_or_else(|| machine.clone());

        let mut document =
            serde_json::to_value(&stored).map_err(|e| CoreError::Internal(e.to_string()))?;
        let mut patch = patch.clone();
        // The main resource ignores status and the sub-resource ignores the rest.
        if let Value::Object(map) = &mut patch {
            if status {
                map.retain(|k, _| k == "status");
            } else {
                map.remove("status");
            }
        }
        apply_merge_patch(&mut document, &patch);

        let mut updated: Machine =
            serde_json::from_value(document).map_err(|e| CoreError::Internal(e.to_string()))?;
        let version = stored.metadata.resource_version.parse::<u64>().unwrap_or(0);
        updated.metadata.resource_version = (version + 1).to_string();

        if status {
            state.status_patches.push(patch);
        } else {
            state.machine_patches.push(patch);
        }
        state
            .machines
            .insert(updated.name().to_string(), updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl CoreClient for FakeCoreClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> CoreResult<Secret> {
        lock(&self.state)
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("secret {}/{}", namespace, name)))
    }

    async fn get_infrastructure(&self) -> CoreResult<Infrastructure> {
        Ok(lock(&self.state).infrastructure.clone())
    }

    async fn patch_machine(&self, machine: &Machine, patch: &Value) -> CoreResult<Machine> {
        self.apply(machine, patch, false)
    }

    async fn patch_machine_status(&self, machine: &Machine, patch: &Value) -> CoreResult<Machine> {
        self.apply(machine, patch, true)
    }
}

/// RFC 7386 merge patch application.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn event(&self, _machine: &Machine, kind: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn provider_spec() -> ProviderSpec {
    ProviderSpec {
        region: REGION.to_string(),
        zone: ZONE.to_string(),
        machine_type: "n1-standard-4".to_string(),
        disks: vec![Disk {
            auto_delete: true,
            boot: true,
            size_gb: 128,
            disk_type: "pd-ssd".to_string(),
            image: "rhcos".to_string(),
            ..Default::default()
        }],
        network_interfaces: vec![NetworkInterfaceSpec {
            network: format!("{}-network", CLUSTER_ID),
            subnetwork: format!("{}-worker-subnet", CLUSTER_ID),
            ..Default::default()
        }],
        service_accounts: vec![ServiceAccountSpec {
            email: format!("{}-w@{}.iam.gserviceaccount.com", CLUSTER_ID, PROJECT),
            scopes: vec!["https://www.googleapis.com/auth/cloud-platform".to_string()],
        }],
        credentials_secret: Some(LocalSecretReference {
            name: CREDENTIALS_SECRET.to_string(),
        }),
        ..Default::default()
    }
}

pub fn machine_with(name: &str, spec: &ProviderSpec) -> Machine {
    let mut machine = Machine::default();
    machine.metadata.name = name.to_string();
    machine.metadata.namespace = NAMESPACE.to_string();
    machine.metadata.uid = format!("{}-uid", name);
    machine.metadata.resource_version = "1".to_string();
    machine.metadata.labels = BTreeMap::from([
        (CLUSTER_ID_LABEL.to_string(), CLUSTER_ID.to_string()),
        (MACHINE_ROLE_LABEL.to_string(), "worker".to_string()),
    ]);
    machine.spec.provider_spec.value = Some(spec.encode().expect("encode provider spec"));
    machine
}

pub fn machine(name: &str) -> Machine {
    machine_with(name, &provider_spec())
}

pub fn control_plane_machine(name: &str) -> Machine {
    let mut spec = provider_spec();
    spec.network_interfaces[0].subnetwork = format!("{}-master-subnet", CLUSTER_ID);
    let mut machine = machine_with(name, &spec);
    machine
        .metadata
        .labels
        .insert(MACHINE_ROLE_LABEL.to_string(), "master".to_string());
    machine
}

pub fn instance_link(name: &str) -> String {
    gcm_actuator::reconciler::instance_self_link(PROJECT, ZONE, name)
}

pub fn control_plane_group() -> String {
    format!("{}-master-{}", CLUSTER_ID, ZONE)
}

pub fn control_plane_group_link() -> String {
    format!(
        "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instanceGroups/{}",
        PROJECT,
        ZONE,
        control_plane_group()
    )
}

/// Cloud doubles, a fake API server and an event sink wired together.
pub struct Harness {
    pub core: Arc<FakeCoreClient>,
    pub compute: Arc<MockComputeService>,
    pub tags: Arc<MockTagService>,
    pub events: Arc<RecordingEventRecorder>,
    pub feature_gates: FeatureGates,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gates(FeatureGates::default())
    }

    pub fn with_gates(feature_gates: FeatureGates) -> Self {
        let core = Arc::new(FakeCoreClient::new());
        core.add_secret(
            NAMESPACE,
            CREDENTIALS_SECRET,
            &[(
                CREDENTIALS_SECRET_KEY,
                r#"{"type": "service_account", "project_id": "proj"}"#,
            )],
        );

        let compute = Arc::new(MockComputeService::new());
        compute.add_backend_service(BackendService {
            name: format!("{}-api-internal", CLUSTER_ID),
            backends: Vec::<Backend>::new(),
            fingerprint: None,
        });

        Self {
            core,
            compute,
            tags: Arc::new(MockTagService::new()),
            events: Arc::new(RecordingEventRecorder::default()),
            feature_gates,
        }
    }

    pub fn actuator(&self) -> Actuator {
        Actuator::new(ActuatorParams {
            core: self.core.clone(),
            events: self.events.clone(),
            compute_builder: MockComputeService::builder(self.compute.clone()),
            tag_builder: MockTagService::builder(self.tags.clone()),
            feature_gates: self.feature_gates,
            endpoint_lookup: None,
        })
    }

    pub fn scope_params(&self, machine: &Machine) -> MachineScopeParams {
        MachineScopeParams {
            machine: machine.clone(),
            core: self.core.clone(),
            compute_builder: MockComputeService::builder(self.compute.clone()),
            tag_builder: MockTagService::builder(self.tags.clone()),
            feature_gates: self.feature_gates,
            endpoint_lookup: None,
        }
    }

    pub async fn scope(&self, machine: &Machine) -> MachineScope {
        MachineScope::new(self.scope_params(machine))
            .await
            .expect("Failed to build machine scope")
    }

    /// Seed a running instance for `name`, the way the cloud would report
    /// it after creation.
    pub fn add_running_instance(&self, name: &str, id: &str) {
        self.compute.add_instance(Instance {
            id: Some(id.to_string()),
            name: name.to_string(),
            status: "RUNNING".to_string(),
            zone: Some(ZONE.to_string()),
            self_link: Some(instance_link(name)),
            network_interfaces: vec![NetworkInterface {
                network_ip: Some(MOCK_INTERNAL_IP.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
    }
}
