//! Reconciler behaviour against the compute and tag doubles.

mod common;

use std::collections::BTreeMap;

use common::*;
use gcm_actuator::conditions::{ConditionStatus, MACHINE_CREATED, MACHINE_CREATION_FAILED};
use gcm_actuator::core::{GcpPlatformStatus, Infrastructure, ResourceLabel, ResourceTag};
use gcm_actuator::machine::{
    INSTANCE_STATE_ANNOTATION, INSTANCE_TYPE_LABEL, INTERRUPTIBLE_INSTANCE_LABEL, NodeAddress,
    NodeAddressType, OS_ID_LABEL, REGION_LABEL, WINDOWS_OS_ID, ZONE_LABEL,
};
use gcm_actuator::provider::{GpuConfig, LocalSecretReference, MetadataEntry, ResourceManagerTag};
use gcm_actuator::reconciler::instance::{USER_DATA_SECRET_KEY, WINDOWS_SCRIPT_METADATA_KEY};
use gcm_actuator::{FeatureGates, REQUEUE_AFTER, Reconciled, Reconciler};
use gcm_cloud::mock::{MOCK_EXTERNAL_IP, MOCK_INTERNAL_IP};
use gcm_cloud::types::{InstanceGroup, Quota, Region};
use gcm_cloud::{ApiErrorDetail, CloudError, CloudErrorKind};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

const NAME: &str = "worker-0";

fn tags_gate() -> FeatureGates {
    FeatureGates {
        gcp_labels_tags: true,
        ..Default::default()
    }
}

fn tag(parent: &str, key: &str, value: &str) -> ResourceManagerTag {
    ResourceManagerTag {
        parent_id: parent.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn project_not_found() -> CloudError {
    CloudError::from_api(
        404,
        "The resource 'projects/proj' was not found",
        &[ApiErrorDetail {
            reason: "notFound".to_string(),
            message: "The resource 'projects/proj' was not found".to_string(),
            domain: "global".to_string(),
        }],
        Some(PROJECT),
    )
}

fn invalid_zone() -> CloudError {
    CloudError::from_api(
        404,
        "Invalid value for field 'zone': 'us-east1-z'. Unknown zone.",
        &[ApiErrorDetail {
            reason: "invalid".to_string(),
            message: "Invalid value for field 'zone': 'us-east1-z'. Unknown zone.".to_string(),
            domain: "global".to_string(),
        }],
        Some(PROJECT),
    )
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_builds_instance() {
    let harness = Harness::new();
    let mut scope = harness.scope(&machine(NAME)).await;

    let reconciled = assert_ok!(Reconciler::new(&mut scope).create().await);
    assert_eq!(reconciled, Reconciled::Complete);

    let instance = harness.compute.instance(NAME).expect("instance inserted");
    assert_eq!(instance.machine_type, "zones/us-east1-b/machineTypes/n1-standard-4");
    assert_eq!(
        instance.labels.get("kubernetes-io-cluster-test-3546b").map(String::as_str),
        Some("owned")
    );

    let disk = instance.disks[0]
        .initialize_params
        .as_ref()
        .expect("disk initialize params");
    assert_eq!(disk.disk_type, "zones/us-east1-b/diskTypes/pd-ssd");
    assert_eq!(
        disk.source_image,
        "https://compute.googleapis.com/compute/v1/projects/proj/global/images/rhcos"
    );
    assert_eq!(disk.disk_size_gb, 128);

    let nic = &instance.network_interfaces[0];
    assert_eq!(
        nic.network.as_deref(),
        Some("projects/proj/global/networks/test-3546b-network")
    );
    assert_eq!(
        nic.subnetwork.as_deref(),
        Some("projects/proj/regions/us-east1/subnetworks/test-3546b-worker-subnet")
    );
    assert!(nic.access_configs.is_empty());

    let shielded = instance
        .shielded_instance_config
        .as_ref()
        .expect("shielded config");
    assert!(!shielded.enable_secure_boot);
    assert!(shielded.enable_vtpm);
    assert!(shielded.enable_integrity_monitoring);
    assert!(instance.confidential_instance_config.is_none());

    let metadata = instance.metadata.as_ref().expect("metadata");
    assert_eq!(metadata.items[0].key, "user-data");
    assert_eq!(metadata.items[0].value.as_deref(), Some(""));
}

#[tokio::test]
async fn test_create_keeps_qualified_image() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.disks[0].image = "projects/rhcos-cloud/global/images/rhcos-412".to_string();
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let instance = harness.compute.instance(NAME).expect("instance inserted");
    let disk = instance.disks[0]
        .initialize_params
        .as_ref()
        .expect("disk initialize params");
    assert_eq!(disk.source_image, "projects/rhcos-cloud/global/images/rhcos-412");
}

#[tokio::test]
async fn test_create_reflects_cloud_state() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.network_interfaces[0].public_ip = true;
    spec.preemptible = true;
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    assert_eq!(
        scope.machine.spec.provider_id.as_deref(),
        Some("gce://proj/us-east1-b/worker-0")
    );
    assert_eq!(
        scope.machine.status.addresses,
        vec![
            NodeAddress::new(NodeAddressType::InternalIp, MOCK_INTERNAL_IP),
            NodeAddress::new(NodeAddressType::ExternalIp, MOCK_EXTERNAL_IP),
            NodeAddress::new(
                NodeAddressType::InternalDns,
                "worker-0.us-east1-b.c.proj.internal"
            ),
            NodeAddress::new(NodeAddressType::InternalDns, "worker-0.c.proj.internal"),
            NodeAddress::new(NodeAddressType::InternalDns, "worker-0"),
        ]
    );

    assert_eq!(scope.provider_status.instance_state.as_deref(), Some("RUNNING"));
    assert_eq!(scope.provider_status.instance_id.as_deref(), Some(NAME));
    let condition = &scope.provider_status.conditions[0];
    assert_eq!(condition.kind, MACHINE_CREATED);
    assert_eq!(condition.status, ConditionStatus::True);

    let labels = &scope.machine.metadata.labels;
    assert_eq!(labels.get(INSTANCE_TYPE_LABEL).map(String::as_str), Some("n1-standard-4"));
    assert_eq!(labels.get(REGION_LABEL).map(String::as_str), Some(REGION));
    assert_eq!(labels.get(ZONE_LABEL).map(String::as_str), Some(ZONE));
    assert!(labels.contains_key(INTERRUPTIBLE_INSTANCE_LABEL));
    assert!(
        scope
            .machine
            .spec
            .metadata
            .labels
            .contains_key(INTERRUPTIBLE_INSTANCE_LABEL)
    );
    assert_eq!(
        scope
            .machine
            .metadata
            .annotations
            .get(INSTANCE_STATE_ANNOTATION)
            .map(String::as_str),
        Some("RUNNING")
    );
}

#[tokio::test]
async fn test_create_requeues_until_running() {
    let harness = Harness::new();
    harness.compute.set_insert_status("PROVISIONING");
    let mut scope = harness.scope(&machine(NAME)).await;

    let reconciled = assert_ok!(Reconciler::new(&mut scope).create().await);
    assert_eq!(reconciled, Reconciled::RequeueAfter(REQUEUE_AFTER));
    assert_eq!(
        scope.provider_status.instance_state.as_deref(),
        Some("PROVISIONING")
    );
}

#[tokio::test]
async fn test_create_validation_fails_before_any_call() {
    let harness = Harness::new();
    let mut machine = machine(NAME);
    machine.metadata.labels.clear();
    let mut scope = harness.scope(&machine).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().starts_with("failed validating machine provider spec"));
    assert!(harness.compute.calls().is_empty());
}

#[tokio::test]
async fn test_ownership_label_always_wins() {
    let harness = Harness::with_gates(tags_gate());
    harness.core.set_infrastructure(Infrastructure {
        gcp: Some(GcpPlatformStatus {
            resource_labels: vec![
                ResourceLabel {
                    key: "kubernetes-io-cluster-test-3546b".to_string(),
                    value: "shared".to_string(),
                },
                ResourceLabel {
                    key: "env".to_string(),
                    value: "infra".to_string(),
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    });

    let mut spec = provider_spec();
    spec.labels = BTreeMap::from([
        ("kubernetes-io-cluster-test-3546b".to_string(), "mine".to_string()),
        ("env".to_string(), "user".to_string()),
    ]);
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let instance = harness.compute.instance(NAME).expect("instance inserted");
    assert_eq!(
        instance.labels,
        BTreeMap::from([
            ("env".to_string(), "user".to_string()),
            ("kubernetes-io-cluster-test-3546b".to_string(), "owned".to_string()),
        ])
    );
}

#[tokio::test]
async fn test_too_many_labels_is_configuration_error() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.labels = (0..33)
        .map(|i| (format!("label-{}", i), "value".to_string()))
        .collect();
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_too_many_tags_is_configuration_error() {
    let harness = Harness::with_gates(tags_gate());
    let mut spec = provider_spec();
    spec.resource_manager_tags = (0..51)
        .map(|i| tag("openshift", &format!("key-{}", i), "value"))
        .collect();
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(harness.tags.calls().is_empty());
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_create_resolves_tags() {
    let harness = Harness::with_gates(tags_gate());
    harness.core.set_infrastructure(Infrastructure {
        gcp: Some(GcpPlatformStatus {
            resource_tags: vec![ResourceTag {
                parent_id: "openshift".to_string(),
                key: "team".to_string(),
                value: "infra".to_string(),
            }],
            ..Default::default()
        }),
        ..Default::default()
    });
    harness.tags.add_tag_value("openshift/env/prod", "101", "201");
    harness.tags.add_tag_value("openshift/team/infra", "102", "202");

    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![tag("openshift", "env", "prod")];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let expected = BTreeMap::from([
        ("tagKeys/101".to_string(), "tagValues/201".to_string()),
        ("tagKeys/102".to_string(), "tagValues/202".to_string()),
    ]);
    let instance = harness.compute.instance(NAME).expect("instance inserted");
    assert_eq!(
        instance.params.as_ref().map(|p| &p.resource_manager_tags),
        Some(&expected)
    );
    assert_eq!(
        instance.disks[0]
            .initialize_params
            .as_ref()
            .map(|p| &p.resource_manager_tags),
        Some(&expected)
    );
}

#[tokio::test]
async fn test_unresolvable_tag_fails_whole_create() {
    let harness = Harness::with_gates(tags_gate());
    harness.tags.add_tag_value("openshift/env/prod", "101", "201");

    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![
        tag("openshift", "env", "prod"),
        tag("openshift", "team", "missing"),
    ];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().contains("tag openshift/team/missing does not exist"));
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_tag_permission_denied_is_configuration_error() {
    let harness = Harness::with_gates(tags_gate());
    harness.tags.fail_lookup(
        "openshift/env/prod",
        CloudError::new(CloudErrorKind::PermissionDenied, "forbidden").with_code(403),
    );

    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![tag("openshift", "env", "prod")];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().contains("permission denied to fetch tag openshift/env/prod"));
}

#[tokio::test]
async fn test_tags_ignored_without_gate() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![tag("openshift", "env", "prod")];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);
    assert!(harness.tags.calls().is_empty());
}

#[tokio::test]
async fn test_restart_policy_on_instance() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.restart_policy = "Never".to_string();
    spec.preemptible = true;
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let scheduling = harness
        .compute
        .instance(NAME)
        .and_then(|i| i.scheduling)
        .expect("scheduling");
    assert!(scheduling.preemptible);
    assert_eq!(scheduling.automatic_restart, Some(false));
}

#[tokio::test]
async fn test_preemptible_always_restart_rejected() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.restart_policy = "Always".to_string();
    spec.preemptible = true;
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "failed to determine restart policy: preemptible instances cannot be automatically restarted"
    );
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_shielded_and_confidential_overrides() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.shielded_instance_config.secure_boot = "Enabled".to_string();
    spec.shielded_instance_config.integrity_monitoring = "Disabled".to_string();
    spec.confidential_compute = "Enabled".to_string();
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let instance = harness.compute.instance(NAME).expect("instance inserted");
    let shielded = instance.shielded_instance_config.expect("shielded config");
    assert!(shielded.enable_secure_boot);
    assert!(shielded.enable_vtpm);
    assert!(!shielded.enable_integrity_monitoring);
    assert!(
        instance
            .confidential_instance_config
            .is_some_and(|c| c.enable_confidential_compute)
    );
}

// =============================================================================
// Metadata and user data
// =============================================================================

#[tokio::test]
async fn test_windows_user_data() {
    let harness = Harness::new();
    harness.core.add_secret(
        NAMESPACE,
        USER_DATA_SECRET,
        &[(USER_DATA_SECRET_KEY, "<powershell>Write-Host hello</powershell>")],
    );

    let mut spec = provider_spec();
    spec.user_data_secret = Some(LocalSecretReference {
        name: USER_DATA_SECRET.to_string(),
    });
    spec.gcp_metadata = vec![MetadataEntry {
        key: "startup-script".to_string(),
        value: Some("echo".to_string()),
    }];
    let mut machine = machine_with(NAME, &spec);
    machine
        .metadata
        .labels
        .insert(OS_ID_LABEL.to_string(), WINDOWS_OS_ID.to_string());
    let mut scope = harness.scope(&machine).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let metadata = harness
        .compute
        .instance(NAME)
        .and_then(|i| i.metadata)
        .expect("metadata");
    assert_eq!(metadata.items.len(), 2);
    assert_eq!(metadata.items[0].key, WINDOWS_SCRIPT_METADATA_KEY);
    assert_eq!(metadata.items[0].value.as_deref(), Some("Write-Host hello"));
    assert_eq!(metadata.items[1].key, "startup-script");
}

#[tokio::test]
async fn test_windows_user_data_overridden_by_spec_entry() {
    let harness = Harness::new();
    harness.core.add_secret(
        NAMESPACE,
        USER_DATA_SECRET,
        &[(USER_DATA_SECRET_KEY, "<powershell>Write-Host hello</powershell>")],
    );

    let mut spec = provider_spec();
    spec.user_data_secret = Some(LocalSecretReference {
        name: USER_DATA_SECRET.to_string(),
    });
    spec.gcp_metadata = vec![MetadataEntry {
        key: WINDOWS_SCRIPT_METADATA_KEY.to_string(),
        value: Some("Write-Host override".to_string()),
    }];
    let mut machine = machine_with(NAME, &spec);
    machine
        .metadata
        .labels
        .insert(OS_ID_LABEL.to_string(), WINDOWS_OS_ID.to_string());
    let mut scope = harness.scope(&machine).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let metadata = harness
        .compute
        .instance(NAME)
        .and_then(|i| i.metadata)
        .expect("metadata");
    assert_eq!(metadata.items.len(), 1);
    assert_eq!(metadata.items[0].key, WINDOWS_SCRIPT_METADATA_KEY);
    assert_eq!(metadata.items[0].value.as_deref(), Some("Write-Host override"));
}

#[tokio::test]
async fn test_missing_user_data_secret() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.user_data_secret = Some(LocalSecretReference {
        name: USER_DATA_SECRET.to_string(),
    });
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().starts_with("error getting custom user data"));
}

#[tokio::test]
async fn test_user_data_secret_without_key() {
    let harness = Harness::new();
    harness
        .core
        .add_secret(NAMESPACE, USER_DATA_SECRET, &[("disableTemplating", "true")]);
    let mut spec = provider_spec();
    spec.user_data_secret = Some(LocalSecretReference {
        name: USER_DATA_SECRET.to_string(),
    });
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().contains("does not have \"userData\" field set"));
}

#[tokio::test]
async fn test_user_data_must_be_utf8() {
    let harness = Harness::new();
    let script: &[u8] = &[0x23, 0x21, 0xff, 0xfe];
    harness
        .core
        .add_secret_bytes(NAMESPACE, USER_DATA_SECRET, &[(USER_DATA_SECRET_KEY, script)]);
    let mut spec = provider_spec();
    spec.user_data_secret = Some(LocalSecretReference {
        name: USER_DATA_SECRET.to_string(),
    });
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().contains("is not valid UTF-8"));
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

// =============================================================================
// Accelerators
// =============================================================================

fn gpu(kind: &str, count: i64) -> GpuConfig {
    GpuConfig {
        count,
        gpu_type: kind.to_string(),
    }
}

#[tokio::test]
async fn test_n1_with_gpu() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.gpus = vec![gpu("nvidia-tesla-t4", 2)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).create().await);

    let accelerators = harness
        .compute
        .instance(NAME)
        .map(|i| i.guest_accelerators)
        .unwrap_or_default();
    assert_eq!(accelerators.len(), 1);
    assert_eq!(
        accelerators[0].accelerator_type,
        "zones/us-east1-b/acceleratorTypes/nvidia-tesla-t4"
    );
    assert_eq!(accelerators[0].accelerator_count, 2);
}

#[tokio::test]
async fn test_more_than_one_gpu_type() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.gpus = vec![gpu("nvidia-tesla-t4", 1), gpu("nvidia-tesla-p4", 1)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().starts_with("More than one type of accelerator provided"));
}

#[tokio::test]
async fn test_a2_rejects_explicit_gpus() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.machine_type = "a2-highgpu-1g".to_string();
    spec.gpus = vec![gpu("nvidia-tesla-a100", 1)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().starts_with("A2 Machine types have pre-attached guest accelerators"));
}

#[tokio::test]
async fn test_gpu_on_unsupported_family() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.machine_type = "e2-standard-4".to_string();
    spec.gpus = vec![gpu("nvidia-tesla-t4", 1)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().contains("does not support accelerators"));
}

#[tokio::test]
async fn test_gpu_quota_exceeded() {
    let harness = Harness::new();
    harness.compute.add_region(Region {
        name: REGION.to_string(),
        quotas: vec![Quota {
            metric: "NVIDIA_T4_GPUS".to_string(),
            limit: 8.0,
            usage: 7.0,
        }],
    });
    let mut spec = provider_spec();
    spec.gpus = vec![gpu("nvidia-tesla-t4", 2)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "Quota exceeded. Metric: NVIDIA_T4_GPUS. Usage: 7. Limit: 8."
    );
}

#[tokio::test]
async fn test_gpu_quota_overflow_is_exceeded() {
    let harness = Harness::new();
    harness.compute.add_region(Region {
        name: REGION.to_string(),
        quotas: vec![Quota {
            metric: "NVIDIA_T4_GPUS".to_string(),
            limit: 8.0,
            usage: 7.0,
        }],
    });
    let mut spec = provider_spec();
    spec.gpus = vec![gpu("nvidia-tesla-t4", i64::MAX)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "Quota exceeded. Metric: NVIDIA_T4_GPUS. Usage: 7. Limit: 8."
    );
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_gpu_count_must_be_positive() {
    let harness = Harness::new();
    for count in [0, -1, i64::MIN] {
        let mut spec = provider_spec();
        spec.gpus = vec![gpu("nvidia-tesla-t4", count)];
        let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

        let err = assert_err!(Reconciler::new(&mut scope).create().await);
        assert!(err.is_invalid_configuration());
        assert!(err.to_string().contains("must be positive"));
    }
    assert_eq!(harness.compute.call_count("instances_insert"), 0);
}

#[tokio::test]
async fn test_preemptible_a2_uses_preemptible_quota() {
    let harness = Harness::new();
    harness.compute.add_region(Region {
        name: REGION.to_string(),
        quotas: vec![Quota {
            metric: "NVIDIA_A100_GPUS".to_string(),
            limit: 8.0,
            usage: 0.0,
        }],
    });
    let mut spec = provider_spec();
    spec.machine_type = "a2-highgpu-2g".to_string();
    spec.preemptible = true;
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "No quota found. Metric: PREEMPTIBLE_NVIDIA_A100_GPUS."
    );
}

#[tokio::test]
async fn test_unavailable_accelerator_type() {
    let harness = Harness::new();
    harness.compute.remove_accelerator_type("nvidia-tesla-t4");
    let mut spec = provider_spec();
    spec.gpus = vec![gpu("nvidia-tesla-t4", 1)];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert!(err.to_string().starts_with("AcceleratorType nvidia-tesla-t4 not available in the zone us-east1-b"));
}

// =============================================================================
// Insert failures
// =============================================================================

#[tokio::test]
async fn test_insert_client_error_records_condition() {
    let harness = Harness::new();
    harness.compute.fail(
        "instances_insert",
        CloudError::from_api(400, "Invalid value for field 'resource.machineType'", &[], Some(PROJECT)),
    );
    let mut scope = harness.scope(&machine(NAME)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "error launching instance: Error 400: Invalid value for field 'resource.machineType'"
    );

    let condition = &scope.provider_status.conditions[0];
    assert_eq!(condition.kind, MACHINE_CREATED);
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, MACHINE_CREATION_FAILED);
    assert!(scope.machine.spec.provider_id.is_none());
}

#[tokio::test]
async fn test_insert_server_error_is_transient() {
    let harness = Harness::new();
    harness.compute.fail(
        "instances_insert",
        CloudError::from_api(503, "backend unavailable", &[], Some(PROJECT)),
    );
    let mut scope = harness.scope(&machine(NAME)).await;

    let err = assert_err!(Reconciler::new(&mut scope).create().await);
    assert!(!err.is_invalid_configuration());
    assert!(err.to_string().starts_with("failed to create instance via compute service"));
    assert_eq!(scope.provider_status.conditions[0].reason, MACHINE_CREATION_FAILED);
}

// =============================================================================
// Exists
// =============================================================================

#[tokio::test]
async fn test_exists_classification() {
    let harness = Harness::new();
    let mut scope = harness.scope(&machine(NAME)).await;

    assert!(!assert_ok!(Reconciler::new(&mut scope).exists().await));

    harness.add_running_instance(NAME, "1234");
    assert!(assert_ok!(Reconciler::new(&mut scope).exists().await));

    harness.compute.fail("instances_get", project_not_found());
    let err = assert_err!(Reconciler::new(&mut scope).exists().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(err.to_string(), "proj: Project does not exist");

    harness.compute.fail("instances_get", invalid_zone());
    let err = assert_err!(Reconciler::new(&mut scope).exists().await);
    assert!(err.is_invalid_configuration());
    assert_eq!(err.to_string(), "us-east1-b: Zone does not exist");

    harness.compute.fail(
        "instances_get",
        CloudError::from_api(500, "internal error", &[], Some(PROJECT)),
    );
    let err = assert_err!(Reconciler::new(&mut scope).exists().await);
    assert!(!err.is_invalid_configuration());
    assert!(err.to_string().starts_with("error getting running instances"));
}

// =============================================================================
// Target pools
// =============================================================================

#[tokio::test]
async fn test_target_pools_are_idempotent() {
    let harness = Harness::new();
    harness.add_running_instance(NAME, "1234");
    harness.compute.add_target_pool("pool-a", &[&instance_link(NAME)]);
    harness.compute.add_target_pool("pool-b", &[]);

    let mut spec = provider_spec();
    spec.target_pools = vec!["pool-a".to_string(), "pool-b".to_string()];
    let machine = machine_with(NAME, &spec);

    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);
    assert_eq!(harness.compute.call_count("target_pools_add_instance"), 1);
    assert_eq!(
        harness.compute.target_pool("pool-b").map(|p| p.instances),
        Some(vec![instance_link(NAME)])
    );

    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);
    assert_eq!(harness.compute.call_count("target_pools_add_instance"), 1);
    assert_eq!(harness.compute.call_count("target_pools_remove_instance"), 0);

    harness.compute.add_target_pool("pool-b", &[]);
    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).delete().await);
    assert_eq!(harness.compute.call_count("target_pools_remove_instance"), 1);
    assert_eq!(
        harness.compute.target_pool("pool-a").map(|p| p.instances),
        Some(Vec::new())
    );
}

#[tokio::test]
async fn test_empty_target_pool_name_rejected() {
    let harness = Harness::new();
    let mut spec = provider_spec();
    spec.target_pools = vec![String::new()];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).update().await);
    assert!(err.is_invalid_configuration());
    assert!(harness.compute.calls().is_empty());
}

// =============================================================================
// Control-plane instance group
// =============================================================================

#[tokio::test]
async fn test_control_plane_registration() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");
    let mut machine = control_plane_machine(name);
    machine.status.provider_status = Some(json!({"instanceState": "RUNNING"}));

    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);

    let group = harness
        .compute
        .instance_group(&control_plane_group())
        .expect("instance group created");
    assert_eq!(
        group.network.as_deref(),
        Some("projects/proj/global/networks/test-3546b-network")
    );
    assert_eq!(
        group.subnetwork.as_deref(),
        Some("projects/proj/regions/us-east1/subnetworks/test-3546b-master-subnet")
    );

    let backends = harness
        .compute
        .backend_service("test-3546b-api-internal")
        .map(|s| s.backends)
        .unwrap_or_default();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].group, control_plane_group_link());
    assert_eq!(backends[0].balancing_mode.as_deref(), Some("CONNECTION"));

    let members = harness.compute.group_members(&control_plane_group());
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].instance, instance_link(name));

    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);
    assert_eq!(harness.compute.call_count("instance_groups_insert"), 1);
    assert_eq!(harness.compute.call_count("region_backend_services_patch"), 1);
    assert_eq!(harness.compute.call_count("instance_groups_add_instances"), 1);
}

#[tokio::test]
async fn test_instance_group_uses_first_interface_without_cluster_subnet() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");
    let mut machine = control_plane_machine(name);
    let mut spec = provider_spec();
    spec.network_interfaces[0].network = "shared-vpc".to_string();
    spec.network_interfaces[0].subnetwork = "shared-control-plane".to_string();
    machine.spec.provider_spec.value = Some(spec.encode().expect("encode provider spec"));

    let mut scope = harness.scope(&machine).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);

    let group = harness
        .compute
        .instance_group(&control_plane_group())
        .expect("instance group created");
    assert_eq!(
        group.network.as_deref(),
        Some("projects/proj/global/networks/shared-vpc")
    );
    assert_eq!(
        group.subnetwork.as_deref(),
        Some("projects/proj/regions/us-east1/subnetworks/shared-control-plane")
    );
}

#[tokio::test]
async fn test_existing_instance_group_added_to_backend_service() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");
    harness.compute.add_instance_group(InstanceGroup {
        name: control_plane_group(),
        zone: Some(ZONE.to_string()),
        self_link: Some(control_plane_group_link()),
        ..Default::default()
    });

    let mut scope = harness.scope(&control_plane_machine(name)).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);

    assert_eq!(harness.compute.call_count("instance_groups_insert"), 0);
    assert_eq!(harness.compute.call_count("region_backend_services_patch"), 1);
    let backends = harness
        .compute
        .backend_service("test-3546b-api-internal")
        .map(|s| s.backends)
        .unwrap_or_default();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].group, control_plane_group_link());
}

#[tokio::test]
async fn test_instance_group_missing_project_404_creates_group() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");
    harness.compute.fail("instance_groups_get", project_not_found());

    let mut scope = harness.scope(&control_plane_machine(name)).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);

    assert_eq!(harness.compute.call_count("instance_groups_insert"), 1);
    assert!(harness.compute.instance_group(&control_plane_group()).is_some());
}

#[tokio::test]
async fn test_control_plane_not_registered_before_running() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");

    let mut scope = harness.scope(&control_plane_machine(name)).await;
    assert_ok!(Reconciler::new(&mut scope).update().await);

    assert!(harness.compute.instance_group(&control_plane_group()).is_some());
    assert_eq!(harness.compute.call_count("instance_groups_add_instances"), 0);
}

#[tokio::test]
async fn test_control_plane_unregistered_on_delete() {
    let harness = Harness::new();
    let name = "master-0";
    harness.add_running_instance(name, "1234");
    harness
        .compute
        .add_group_member(&control_plane_group(), &instance_link(name), "RUNNING");

    let mut scope = harness.scope(&control_plane_machine(name)).await;
    let reconciled = assert_ok!(Reconciler::new(&mut scope).delete().await);

    assert_eq!(reconciled, Reconciled::RequeueAfter(REQUEUE_AFTER));
    assert!(harness.compute.group_members(&control_plane_group()).is_empty());
    assert_eq!(harness.compute.call_count("instances_delete"), 1);
}

// =============================================================================
// Tag binding
// =============================================================================

#[tokio::test]
async fn test_update_binds_missing_tags() {
    let harness = Harness::with_gates(tags_gate());
    harness.add_running_instance(NAME, "1234");
    let parent = "//compute.googleapis.com/projects/proj/zones/us-east1-b/instances/1234";
    harness.tags.add_effective_tag(parent, "openshift/env/prod");

    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![
        tag("openshift", "env", "prod"),
        tag("openshift", "team", "infra"),
    ];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    assert_ok!(Reconciler::new(&mut scope).update().await);

    let bindings = harness.tags.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].parent, parent);
    assert_eq!(bindings[0].tag_value_namespaced_name, "openshift/team/infra");
}

#[tokio::test]
async fn test_update_reports_failed_binding() {
    let harness = Harness::with_gates(tags_gate());
    harness.add_running_instance(NAME, "1234");
    harness.tags.fail_binding(
        "openshift/env/prod",
        CloudError::from_api(500, "backend error", &[], None),
    );

    let mut spec = provider_spec();
    spec.resource_manager_tags = vec![tag("openshift", "env", "prod")];
    let mut scope = harness.scope(&machine_with(NAME, &spec)).await;

    let err = assert_err!(Reconciler::new(&mut scope).update().await);
    assert!(!err.is_invalid_configuration());
    assert_eq!(err.to_string(), "failed to add tags to 1234 VM");
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_existing_instance() {
    let harness = Harness::new();
    harness.add_running_instance(NAME, "1234");
    let machine = machine(NAME);
    let mut scope = harness.scope(&machine).await;

    let reconciled = assert_ok!(Reconciler::new(&mut scope).delete().await);
    assert_eq!(reconciled, Reconciled::RequeueAfter(REQUEUE_AFTER));
    assert!(harness.compute.instance(NAME).is_none());
    assert_eq!(harness.compute.delete_request_ids(), vec![machine.metadata.uid.clone()]);
}

#[tokio::test]
async fn test_delete_missing_instance_is_noop() {
    let harness = Harness::new();
    let mut scope = harness.scope(&machine(NAME)).await;

    let reconciled = assert_ok!(Reconciler::new(&mut scope).delete().await);
    assert_eq!(reconciled, Reconciled::Complete);
    assert_eq!(harness.compute.call_count("instances_delete"), 0);
}

#[tokio::test]
async fn test_delete_invalid_zone_with_provider_id_refused() {
    let harness = Harness::new();
    harness.compute.fail("instances_get", invalid_zone());
    let mut machine = machine(NAME);
    machine.spec.provider_id = Some("gce://proj/us-east1-b/worker-0".to_string());
    let mut scope = harness.scope(&machine).await;

    let err = assert_err!(Reconciler::new(&mut scope).delete().await);
    assert!(!err.is_invalid_configuration());
    assert!(err.to_string().contains("has invalid configuration, but already exists"));
    assert_eq!(harness.compute.call_count("instances_delete"), 0);
}

#[tokio::test]
async fn test_delete_invalid_zone_without_provider_id_proceeds() {
    let harness = Harness::new();
    harness.compute.fail("instances_get", invalid_zone());
    let mut scope = harness.scope(&machine(NAME)).await;

    let reconciled = assert_ok!(Reconciler::new(&mut scope).delete().await);
    assert_eq!(reconciled, Reconciled::Complete);
    assert_eq!(harness.compute.call_count("instances_delete"), 0);
}

#[tokio::test]
async fn test_delete_propagates_transient_exists_error() {
    let harness = Harness::new();
    harness.compute.fail(
        "instances_get",
        CloudError::from_api(500, "internal error", &[], Some(PROJECT)),
    );
    let mut scope = harness.scope(&machine(NAME)).await;

    let err = assert_err!(Reconciler::new(&mut scope).delete().await);
    assert!(err.to_string().starts_with("error getting running instances"));
}

// =============================================================================
// Cloud state
// =============================================================================

#[tokio::test]
async fn test_cloud_state_requires_network_interface() {
    let harness = Harness::new();
    harness.compute.add_instance(gcm_cloud::types::Instance {
        name: NAME.to_string(),
        status: "RUNNING".to_string(),
        ..Default::default()
    });
    let mut scope = harness.scope(&machine(NAME)).await;

    let err = assert_err!(
        Reconciler::new(&mut scope)
            .reconcile_machine_with_cloud_state(None)
            .await
    );
    assert_eq!(
        err.to_string(),
        "could not find network interfaces for instance \"worker-0\""
    );
}
