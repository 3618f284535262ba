//! Resource Manager v3 tag REST client.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use super::{ApiClient, join};
use crate::error::Result;
use crate::tags::{DEFAULT_TAGS_BASE_PATH, TagService};
use crate::types::{EffectiveTag, TagBinding, TagValue};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EffectiveTagsPage {
    effective_tags: Vec<EffectiveTag>,
    next_page_token: Option<String>,
}

/// Long-running operation wrapping a tag binding.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BindingOperation {
    done: bool,
    response: Option<TagBinding>,
}

/// [`TagService`] backed by the Resource Manager REST API.
///
/// Effective tags and bindings of zonal resources live on the regional
/// `<zone>-cloudresourcemanager` endpoint unless an override is given.
pub struct RestTagService {
    api: ApiClient,
    endpoint: Option<String>,
}

impl RestTagService {
    pub fn new(credentials_json: &str, endpoint: Option<&str>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_credentials(credentials_json)?,
            endpoint: endpoint
                .filter(|e| !e.is_empty())
                .map(|e| e.trim_end_matches('/').to_string()),
        })
    }

    fn global_url(&self, path: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => join(endpoint, path),
            None => join(DEFAULT_TAGS_BASE_PATH, path),
        }
    }

    fn location_url(&self, location: &str, path: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => join(endpoint, path),
            None => join(
                &format!("https://{}-cloudresourcemanager.googleapis.com/v3", location),
                path,
            ),
        }
    }
}

#[async_trait]
impl TagService for RestTagService {
    async fn get_namespaced_tag_value(&self, namespaced_name: &str) -> Result<TagValue> {
        let request = self
            .api
            .request(Method::GET, &self.global_url("tagValues/namespaced"))
            .query(&[("name", namespaced_name)]);
        self.api.send(request, None).await
    }

    async fn list_effective_tags(
        &self,
        location: &str,
        parent: &str,
    ) -> Result<Vec<EffectiveTag>> {
        let url = self.location_url(location, "effectiveTags");
        let mut tags = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .api
                .request(Method::GET, &url)
                .query(&[("parent", parent)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: EffectiveTagsPage = self.api.send(request, None).await?;
            tags.extend(page.effective_tags);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tags)
    }

    async fn create_tag_binding(
        &self,
        location: &str,
        parent: &str,
        tag_value_namespaced_name: &str,
    ) -> Result<TagBinding> {
        debug!("Binding tag {} to {}", tag_value_namespaced_name, parent);
        let binding = TagBinding {
            name: String::new(),
            parent: parent.to_string(),
            tag_value_namespaced_name: tag_value_namespaced_name.to_string(),
        };
        let request = self
            .api
            .request(Method::POST, &self.location_url(location, "tagBindings"))
            .json(&binding);
        let operation: BindingOperation = self.api.send(request, None).await?;

        // A pending operation still means the binding was accepted.
        match operation.response {
            Some(bound) if operation.done => Ok(bound),
            _ => Ok(binding),
        }
    }
}
