//! Per-call machine scope.
//!
//! A scope is built for exactly one actuator call. It decodes the provider
//! payloads, resolves credentials and the project, binds the capability
//! clients, and on [`MachineScope::close`] persists whatever the reconciler
//! changed as two JSON merge patches.

use std::sync::Arc;

use chrono::Utc;
use gcm_cloud::{ComputeService, ComputeServiceBuilder, TagService, TagServiceBuilder};
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::config::FeatureGates;
use crate::core::{
    COMPUTE_ENDPOINT, CoreClient, EndpointLookup, InfrastructureEndpointLookup,
    TAG_MANAGER_ENDPOINT,
};
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::merge_patch;
use crate::provider::{ProviderSpec, ProviderStatus};

/// Key of the service account JSON in the credentials secret.
pub const CREDENTIALS_SECRET_KEY: &str = "service_account.json";

/// Inputs for [`MachineScope::new`].
pub struct MachineScopeParams {
    pub machine: Machine,
    pub core: Arc<dyn CoreClient>,
    pub compute_builder: ComputeServiceBuilder,
    pub tag_builder: TagServiceBuilder,
    pub feature_gates: FeatureGates,
    /// Falls back to [`InfrastructureEndpointLookup`].
    pub endpoint_lookup: Option<Arc<dyn EndpointLookup>>,
}

pub struct MachineScope {
    pub machine: Machine,
    pub provider_spec: ProviderSpec,
    pub provider_status: ProviderStatus,
    pub project_id: String,
    /// `gce://<project>/<zone>/<name>`.
    pub provider_id: String,
    pub core: Arc<dyn CoreClient>,
    pub compute: Arc<dyn ComputeService>,
    pub tags: Arc<dyn TagService>,
    pub feature_gates: FeatureGates,

    // Captured at construction and never touched again.
    origin_machine: Machine,
    origin_status: ProviderStatus,
}

impl std::fmt::Debug for MachineScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineScope")
            .field("machine", &self.machine)
            .field("provider_spec", &self.provider_spec)
            .field("provider_status", &self.provider_status)
            .field("project_id", &self.project_id)
            .field("provider_id", &self.provider_id)
            .field("feature_gates", &self.feature_gates)
            .finish_non_exhaustive()
    }
}

impl MachineScope {
    pub async fn new(params: MachineScopeParams) -> Result<Self> {
        let MachineScopeParams {
            machine,
            core,
            compute_builder,
            tag_builder,
            feature_gates,
            endpoint_lookup,
        } = params;

        let provider_spec = ProviderSpec::decode(machine.spec.provider_spec.value.as_ref())
            .map_err(|e| {
                Error::invalid_configuration(format!("failed to get machine config: {}", e))
            })?;
        let provider_status = ProviderStatus::decode(machine.status.provider_status.as_ref())
            .map_err(|e| {
                Error::invalid_configuration(format!(
                    "failed to get machine provider status: {}",
                    e
                ))
            })?;

        let credentials = credentials_json(core.as_ref(), machine.namespace(), &provider_spec).await?;

        let project_id = if provider_spec.project_id.is_empty() {
            project_id_from_json_key(&credentials).map_err(|e| {
                Error::invalid_configuration(format!("error getting project from JSON key: {}", e))
            })?
        } else {
            provider_spec.project_id.clone()
        };

        let (compute_endpoint, tags_endpoint) = if feature_gates.gcp_custom_api_endpoints {
            let lookup: Arc<dyn EndpointLookup> =
                endpoint_lookup.unwrap_or_else(|| Arc::new(InfrastructureEndpointLookup));
            let compute = lookup
                .lookup(core.as_ref(), COMPUTE_ENDPOINT)
                .await
                .map_err(|e| {
                    Error::invalid_configuration(format!(
                        "error getting compute service endpoint: {}",
                        e
                    ))
                })?;
            let tags = lookup
                .lookup(core.as_ref(), TAG_MANAGER_ENDPOINT)
                .await
                .map_err(|e| {
                    Error::invalid_configuration(format!(
                        "error getting tag manager service endpoint: {}",
                        e
                    ))
                })?;
            (compute, tags)
        } else {
            (None, None)
        };

        let compute = compute_builder(&credentials, compute_endpoint.as_deref()).map_err(|e| {
            Error::invalid_configuration(format!("error creating compute service: {}", e))
        })?;
        let tags = tag_builder(&credentials, tags_endpoint.as_deref()).map_err(|e| {
            Error::invalid_configuration(format!("error creating tag service: {}", e))
        })?;

        let provider_id = format!(
            "gce://{}/{}/{}",
            project_id,
            provider_spec.zone,
            machine.name()
        );
        debug!(machine = %machine.name(), project = %project_id, "Built machine scope");

        Ok(Self {
            origin_machine: machine.clone(),
            origin_status: provider_status.clone(),
            machine,
            provider_spec,
            provider_status,
            project_id,
            provider_id,
            core,
            compute,
            tags,
            feature_gates,
        })
    }

    /// Persist the machine spec and status.
    ///
    /// The status is left untouched (and `lastUpdated` does not move) when
    /// neither the provider status nor the addresses changed.
    pub async fn close(&mut self) -> Result<()> {
        self.set_machine_status().map_err(|e| {
            e.context(format!(
                "[machinescope] failed to set provider status for machine {:?} in namespace {:?}",
                self.machine.name(),
                self.machine.namespace()
            ))
        })?;
        self.set_machine_spec().map_err(|e| {
            e.context(format!(
                "[machinescope] failed to set machine spec {:?} in namespace {:?}",
                self.machine.name(),
                self.machine.namespace()
            ))
        })?;
        self.patch_machine().await.map_err(|e| {
            e.context(format!(
                "[machinescope] failed to patch machine {:?} in namespace {:?}",
                self.machine.name(),
                self.machine.namespace()
            ))
        })
    }

    fn set_machine_spec(&mut self) -> Result<()> {
        debug!(
            machine = %self.machine.name(),
            resource_version = %self.machine.metadata.resource_version,
            "Storing machine spec"
        );
        self.machine.spec.provider_spec.value = Some(self.provider_spec.encode()?);
        Ok(())
    }

    fn set_machine_status(&mut self) -> Result<()> {
        if self.provider_status == self.origin_status
            && self.machine.status.addresses == self.origin_machine.status.addresses
        {
            info!("{}: status unchanged", self.machine.name());
            return Ok(());
        }

        debug!(
            machine = %self.machine.name(),
            resource_version = %self.machine.metadata.resource_version,
            "Storing machine status"
        );
        self.machine.status.provider_status = Some(self.provider_status.encode()?);
        self.machine.status.last_updated = Some(Utc::now());
        Ok(())
    }

    async fn patch_machine(&mut self) -> Result<()> {
        debug!("{}: patching machine", self.machine.name());

        // The first patch returns the stored object, whose status is stale.
        let status = self.machine.status.clone();

        let original = serde_json::to_value(&self.origin_machine)?;
        let current = serde_json::to_value(&self.machine)?;

        let patch = merge_patch::diff(&without_status(&original), &without_status(&current));
        if !merge_patch::is_empty(&patch) {
            self.machine = self
                .core
                .patch_machine(&self.machine, &patch)
                .await
                .inspect_err(|e| error!("Failed to patch machine {}: {}", self.machine.name(), e))?;
        }

        self.machine.status = status;

        let patch = merge_patch::diff(
            &json!({ "status": original.get("status") }),
            &json!({ "status": serde_json::to_value(&self.machine.status)? }),
        );
        if !merge_patch::is_empty(&patch) {
            self.machine = self
                .core
                .patch_machine_status(&self.machine, &patch)
                .await
                .inspect_err(|e| {
                    error!("Failed to patch machine status {}: {}", self.machine.name(), e)
                })?;
        }

        Ok(())
    }
}

fn without_status(value: &Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove("status");
    }
    value
}

/// Read the service account JSON named by the provider spec.
async fn credentials_json(
    core: &dyn CoreClient,
    namespace: &str,
    spec: &ProviderSpec,
) -> Result<String> {
    let Some(reference) = spec.credentials_secret.as_ref() else {
        return Err(Error::invalid_configuration(
            "credentials secret is not set in the provider spec",
        ));
    };

    let secret = match core.get_secret(namespace, &reference.name).await {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => {
            return Err(Error::invalid_configuration(format!(
                "credentials secret {:?} in namespace {:?} not found: {}",
                reference.name, namespace, e
            )));
        }
        Err(e) => {
            return Err(Error::from(e).context(format!(
                "error getting credentials secret {:?} in namespace {:?}",
                reference.name, namespace
            )));
        }
    };

    let data = secret.data.get(CREDENTIALS_SECRET_KEY).ok_or_else(|| {
        Error::invalid_configuration(format!(
            "secret {}/{} does not have {:?} field set",
            namespace, reference.name, CREDENTIALS_SECRET_KEY
        ))
    })?;

    String::from_utf8(data.clone()).map_err(|e| {
        Error::invalid_configuration(format!(
            "secret {}/{} field {:?} is not valid UTF-8: {}",
            namespace, reference.name, CREDENTIALS_SECRET_KEY, e
        ))
    })
}

fn project_id_from_json_key(credentials: &str) -> std::result::Result<String, String> {
    let key: Value = serde_json::from_str(credentials).map_err(|e| e.to_string())?;
    match key.get("project_id").and_then(Value::as_str) {
        Some(project) if !project.is_empty() => Ok(project.to_string()),
        _ => Err("project_id not found in JSON key".to_string()),
    }
}
