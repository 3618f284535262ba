//! Compute Engine v1 REST client.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ApiClient, join};
use crate::compute::{ComputeService, DEFAULT_COMPUTE_BASE_PATH, classify_gpu_machine_types};
use crate::error::Result;
use crate::types::{
    AcceleratorType, BackendService, GpuCompatibleMachineTypes, Image, Instance, InstanceGroup,
    InstanceWithNamedPorts, MachineType, Operation, Region, TargetPool, Zone,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default)]
    items: Vec<T>,
    next_page_token: Option<String>,
}

/// [`ComputeService`] backed by the Compute Engine REST API.
pub struct RestComputeService {
    api: ApiClient,
    base_path: String,
}

impl RestComputeService {
    /// Build a client from service account JSON. `endpoint` overrides the
    /// default base path.
    pub fn new(credentials_json: &str, endpoint: Option<&str>) -> Result<Self> {
        let base_path = match endpoint {
            Some(endpoint) if !endpoint.is_empty() => {
                format!("{}/", endpoint.trim_end_matches('/'))
            }
            _ => DEFAULT_COMPUTE_BASE_PATH.to_string(),
        };
        Ok(Self {
            api: ApiClient::from_credentials(credentials_json)?,
            base_path,
        })
    }

    fn url(&self, path: &str) -> String {
        join(&self.base_path, path)
    }

    fn zonal(&self, project: &str, zone: &str, path: &str) -> String {
        self.url(&format!("projects/{}/zones/{}/{}", project, zone, path))
    }

    fn regional(&self, project: &str, region: &str, path: &str) -> String {
        self.url(&format!("projects/{}/regions/{}/{}", project, region, path))
    }
}

#[async_trait]
impl ComputeService for RestComputeService {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation> {
        debug!("Inserting instance {} in {}/{}", instance.name, project, zone);
        let request = self
            .api
            .request(Method::POST, &self.zonal(project, zone, "instances"))
            .json(instance);
        self.api.send(request, Some(project)).await
    }

    async fn instances_get(&self, project: &str, zone: &str, name: &str) -> Result<Instance> {
        let url = self.zonal(project, zone, &format!("instances/{}", name));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn instances_delete(
        &self,
        request_id: &str,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation> {
        debug!("Deleting instance {} in {}/{}", name, project, zone);
        let url = self.zonal(project, zone, &format!("instances/{}", name));
        let request = self
            .api
            .request(Method::DELETE, &url)
            .query(&[("requestId", request_id)]);
        self.api.send(request, Some(project)).await
    }

    async fn regions_get(&self, project: &str, region: &str) -> Result<Region> {
        let url = self.url(&format!("projects/{}/regions/{}", project, region));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn zones_get(&self, project: &str, zone: &str) -> Result<Zone> {
        let url = self.url(&format!("projects/{}/zones/{}", project, zone));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn accelerator_types_get(
        &self,
        project: &str,
        zone: &str,
        accelerator_type: &str,
    ) -> Result<AcceleratorType> {
        let url = self.zonal(project, zone, &format!("acceleratorTypes/{}", accelerator_type));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn gpu_compatible_machine_types(
        &self,
        project: &str,
        zone: &str,
    ) -> Result<GpuCompatibleMachineTypes> {
        let url = self.zonal(project, zone, "machineTypes");
        let mut machine_types: Vec<MachineType> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.api.request(Method::GET, &url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListPage<MachineType> = self.api.send(request, Some(project)).await?;
            machine_types.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(classify_gpu_machine_types(machine_types))
    }

    async fn target_pools_get(
        &self,
        project: &str,
        region: &str,
        pool: &str,
    ) -> Result<TargetPool> {
        let url = self.regional(project, region, &format!("targetPools/{}", pool));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn target_pools_add_instance(
        &self,
        project: &str,
        region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation> {
        let url = self.regional(project, region, &format!("targetPools/{}/addInstance", pool));
        let request = self
            .api
            .request(Method::POST, &url)
            .json(&json!({ "instances": [{ "instance": instance_link }] }));
        self.api.send(request, Some(project)).await
    }

    async fn target_pools_remove_instance(
        &self,
        project: &str,
        region: &str,
        pool: &str,
        instance_link: &str,
    ) -> Result<Operation> {
        let url = self.regional(
            project,
            region,
            &format!("targetPools/{}/removeInstance", pool),
        );
        let request = self
            .api
            .request(Method::POST, &url)
            .json(&json!({ "instances": [{ "instance": instance_link }] }));
        self.api.send(request, Some(project)).await
    }

    async fn instance_groups_get(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<InstanceGroup> {
        let url = self.zonal(project, zone, &format!("instanceGroups/{}", group));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn instance_groups_insert(
        &self,
        project: &str,
        zone: &str,
        group: &InstanceGroup,
    ) -> Result<Operation> {
        let request = self
            .api
            .request(Method::POST, &self.zonal(project, zone, "instanceGroups"))
            .json(group);
        self.api.send(request, Some(project)).await
    }

    async fn instance_groups_add_instances(
        &self,
        project: &str,
        zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation> {
        let url = self.zonal(project, zone, &format!("instanceGroups/{}/addInstances", group));
        let request = self
            .api
            .request(Method::POST, &url)
            .json(&json!({ "instances": [{ "instance": instance_link }] }));
        self.api.send(request, Some(project)).await
    }

    async fn instance_groups_remove_instances(
        &self,
        project: &str,
        zone: &str,
        instance_link: &str,
        group: &str,
    ) -> Result<Operation> {
        let url = self.zonal(
            project,
            zone,
            &format!("instanceGroups/{}/removeInstances", group),
        );
        let request = self
            .api
            .request(Method::POST, &url)
            .json(&json!({ "instances": [{ "instance": instance_link }] }));
        self.api.send(request, Some(project)).await
    }

    async fn instance_groups_list_instances(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<Vec<InstanceWithNamedPorts>> {
        let url = self.zonal(project, zone, &format!("instanceGroups/{}/listInstances", group));
        let mut members = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .api
                .request(Method::POST, &url)
                .json(&json!({ "instanceState": "RUNNING" }));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListPage<InstanceWithNamedPorts> =
                self.api.send(request, Some(project)).await?;
            members.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(members)
    }

    async fn region_backend_services_get(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<BackendService> {
        let url = self.regional(project, region, &format!("backendServices/{}", name));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }

    async fn region_backend_services_patch(
        &self,
        project: &str,
        region: &str,
        name: &str,
        service: &BackendService,
    ) -> Result<Operation> {
        let url = self.regional(project, region, &format!("backendServices/{}", name));
        let request = self.api.request(Method::PATCH, &url).json(service);
        self.api.send(request, Some(project)).await
    }

    async fn images_get(&self, project: &str, image: &str) -> Result<Image> {
        let url = self.url(&format!("projects/{}/global/images/{}", project, image));
        self.api
            .send(self.api.request(Method::GET, &url), Some(project))
            .await
    }
}
