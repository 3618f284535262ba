//! Provider spec and status documents and their codec.
//!
//! Both documents are stored opaquely on the machine. Fields this crate does
//! not model are kept in `extra` so that a decode/encode cycle never drops
//! them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::Condition;

pub const RESTART_POLICY_ALWAYS: &str = "Always";
pub const RESTART_POLICY_NEVER: &str = "Never";

pub const POLICY_ENABLED: &str = "Enabled";
pub const POLICY_DISABLED: &str = "Disabled";

/// Desired state of a GCE instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSpec {
    #[serde(rename = "projectID", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    pub region: String,
    pub zone: String,
    pub machine_type: String,
    #[serde(rename = "canIPForward")]
    pub can_ip_forward: bool,
    pub deletion_protection: bool,
    pub disks: Vec<Disk>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub service_accounts: Vec<ServiceAccountSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuConfig>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub preemptible: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub on_host_maintenance: String,
    /// `""`, `Always` or `Never`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
    pub shielded_instance_config: ShieldedInstanceConfigSpec,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub confidential_compute: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_pools: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_manager_tags: Vec<ResourceManagerTag>,
    /// Instance metadata entries.
    #[serde(rename = "metadata", skip_serializing_if = "Vec::is_empty")]
    pub gcp_metadata: Vec<MetadataEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<LocalSecretReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<LocalSecretReference>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Disk {
    pub auto_delete: bool,
    pub boot: bool,
    pub size_gb: i64,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub image: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<EncryptionKeyReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionKeyReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key: Option<KmsKeyReference>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kms_key_service_account: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KmsKeyReference {
    pub name: String,
    pub key_ring: String,
    #[serde(rename = "projectID", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterfaceSpec {
    #[serde(rename = "projectID", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    pub network: String,
    pub subnetwork: String,
    #[serde(rename = "publicIP", skip_serializing_if = "std::ops::Not::not")]
    pub public_ip: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccountSpec {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuConfig {
    pub count: i64,
    #[serde(rename = "type")]
    pub gpu_type: String,
}

/// Each field is `""`, `Enabled` or `Disabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShieldedInstanceConfigSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secure_boot: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub virtualized_trusted_platform_module: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub integrity_monitoring: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceManagerTag {
    #[serde(rename = "parentID")]
    pub parent_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSecretReference {
    pub name: String,
}

/// Observed state of a GCE instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProviderSpec {
    /// Decode a provider spec payload. A missing payload is an empty spec.
    pub fn decode(value: Option<&Value>) -> serde_json::Result<Self> {
        match value {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl ProviderStatus {
    /// Decode a provider status payload. A missing payload is an empty status.
    pub fn decode(value: Option<&Value>) -> serde_json::Result<Self> {
        match value {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
