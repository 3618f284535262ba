//! Guest accelerator validation and GPU quota checks.

use tracing::debug;

use super::Reconciler;
use crate::error::{Error, Result};
use crate::provider::GpuConfig;

const A2_PREFIX: &str = "a2-";
const N1_PREFIX: &str = "n1-";

/// Quota metric of a supported accelerator type.
pub fn gpu_quota_metric(accelerator_type: &str) -> Option<&'static str> {
    match accelerator_type {
        "nvidia-tesla-k80" => Some("NVIDIA_K80_GPUS"),
        "nvidia-tesla-p100" => Some("NVIDIA_P100_GPUS"),
        "nvidia-tesla-v100" => Some("NVIDIA_V100_GPUS"),
        "nvidia-tesla-a100" => Some("NVIDIA_A100_GPUS"),
        "nvidia-tesla-p4" => Some("NVIDIA_P4_GPUS"),
        "nvidia-tesla-t4" => Some("NVIDIA_T4_GPUS"),
        "nvidia-a100-80gb" => Some("NVIDIA_A100_80GB_GPUS"),
        _ => None,
    }
}

impl Reconciler<'_> {
    /// Only a2 and n1 machine types carry accelerators. a2 types come with
    /// a fixed accelerator, n1 types take the declared one. Either way the
    /// regional quota must have room.
    pub(crate) async fn validate_guest_accelerators(&self) -> Result<()> {
        let spec = &self.scope.provider_spec;
        let machine_type = spec.machine_type.as_str();

        if spec.gpus.is_empty() && !machine_type.starts_with(A2_PREFIX) {
            return Ok(());
        }
        if !spec.gpus.is_empty() && machine_type.starts_with(A2_PREFIX) {
            return Err(Error::invalid_configuration(
                "A2 Machine types have pre-attached guest accelerators. Adding additional guest accelerators is not supported",
            ));
        }
        if !machine_type.starts_with(N1_PREFIX) && !machine_type.starts_with(A2_PREFIX) {
            return Err(Error::invalid_configuration(format!(
                "MachineType {} does not support accelerators. Only A2 and N1 machine type families support guest acceleartors.",
                machine_type
            )));
        }

        let families = self
            .scope
            .compute
            .gpu_compatible_machine_types(&self.scope.project_id, &spec.zone)
            .await
            .map_err(|e| Error::cloud("failed to list GPU compatible machine types", e))?;

        if let Some(gpu) = families.a2.get(machine_type) {
            debug!(machine_type = %machine_type, accelerator = %gpu.accelerator_type, count = gpu.count, "a2 machine type");
            return self
                .check_quota(&GpuConfig {
                    gpu_type: gpu.accelerator_type.clone(),
                    count: gpu.count,
                })
                .await;
        }
        if families.n1.iter().any(|t| t == machine_type) {
            if let Some(gpu) = spec.gpus.first() {
                return self.check_quota(gpu).await;
            }
        }

        Err(Error::invalid_configuration(format!(
            "MachineType {} is not available in the zone {}.",
            machine_type, spec.zone
        )))
    }

    pub(crate) async fn check_quota(&self, accelerator: &GpuConfig) -> Result<()> {
        let spec = &self.scope.provider_spec;
        let compute = &self.scope.compute;

        if accelerator.count <= 0 {
            return Err(Error::invalid_configuration(format!(
                "Accelerator count for {} must be positive, got {}",
                accelerator.gpu_type, accelerator.count
            )));
        }

        let region = compute
            .regions_get(&self.scope.project_id, &spec.region)
            .await
            .map_err(|e| {
                Error::invalid_configuration(format!(
                    "Failed to get region {} via compute service: {}",
                    spec.region, e
                ))
            })?;

        compute
            .accelerator_types_get(&self.scope.project_id, &spec.zone, &accelerator.gpu_type)
            .await
            .map_err(|e| {
                Error::invalid_configuration(format!(
                    "AcceleratorType {} not available in the zone {} : {}",
                    accelerator.gpu_type, spec.zone, e
                ))
            })?;

        let Some(metric) = gpu_quota_metric(&accelerator.gpu_type) else {
            return Err(Error::invalid_configuration(format!(
                "Unsupported accelerator type {}",
                accelerator.gpu_type
            )));
        };
        // Preemptible instances draw from their own quota.
        let metric = if spec.preemptible {
            format!("PREEMPTIBLE_{}", metric)
        } else {
            metric.to_string()
        };

        let Some(quota) = region.quotas.iter().find(|q| q.metric == metric) else {
            return Err(Error::invalid_configuration(format!(
                "No quota found. Metric: {}.",
                metric
            )));
        };
        // An overflowing request can never fit.
        let requested = (quota.usage as i64).checked_add(accelerator.count);
        if requested.is_none_or(|total| total > quota.limit as i64) {
            return Err(Error::invalid_configuration(format!(
                "Quota exceeded. Metric: {}. Usage: {}. Limit: {}.",
                metric, quota.usage, quota.limit
            )));
        }

        Ok(())
    }
}
