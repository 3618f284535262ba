//! Core client contract: secrets, the cluster infrastructure document and
//! machine persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::Machine;

/// Name of the compute service endpoint override.
pub const COMPUTE_ENDPOINT: &str = "Compute";
/// Name of the tag manager service endpoint override.
pub const TAG_MANAGER_ENDPOINT: &str = "TagManager";

/// Errors returned by the core client.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for core client operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Cluster-wide infrastructure document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Infrastructure {
    pub infrastructure_name: String,
    pub gcp: Option<GcpPlatformStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcpPlatformStatus {
    pub resource_labels: Vec<ResourceLabel>,
    pub resource_tags: Vec<ResourceTag>,
    pub service_endpoints: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLabel {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceTag {
    #[serde(rename = "parentID")]
    pub parent_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
}

/// Access to the cluster API server.
#[async_trait]
pub trait CoreClient: Send + Sync {
    /// Get a secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> CoreResult<Secret>;

    /// Get the cluster infrastructure document.
    async fn get_infrastructure(&self) -> CoreResult<Infrastructure>;

    /// Apply a JSON merge patch to the machine, excluding status. Returns
    /// the stored machine.
    async fn patch_machine(
        &self,
        machine: &Machine,
        patch: &serde_json::Value,
    ) -> CoreResult<Machine>;

    /// Apply a JSON merge patch to the machine's status sub-resource.
    async fn patch_machine_status(
        &self,
        machine: &Machine,
        patch: &serde_json::Value,
    ) -> CoreResult<Machine>;
}

/// Finds the override URL of a GCP service endpoint.
#[async_trait]
pub trait EndpointLookup: Send + Sync {
    async fn lookup(&self, core: &dyn CoreClient, name: &str) -> CoreResult<Option<String>>;
}

/// Reads service endpoint overrides from the infrastructure document.
pub struct InfrastructureEndpointLookup;

#[async_trait]
impl EndpointLookup for InfrastructureEndpointLookup {
    async fn lookup(&self, core: &dyn CoreClient, name: &str) -> CoreResult<Option<String>> {
        let infrastructure = core.get_infrastructure().await?;
        Ok(infrastructure.gcp.and_then(|gcp| {
            gcp.service_endpoints
                .into_iter()
                .find(|endpoint| endpoint.name == name)
                .map(|endpoint| endpoint.url)
        }))
    }
}
