//! Tag capability contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CloudError, Result};
use crate::types::{EffectiveTag, TagBinding, TagValue};

/// Default Resource Manager v3 endpoint.
pub const DEFAULT_TAGS_BASE_PATH: &str = "https://cloudresourcemanager.googleapis.com/v3/";

/// Builds a tag client from the credentials JSON and an optional endpoint
/// override.
pub type TagServiceBuilder =
    Arc<dyn Fn(&str, Option<&str>) -> std::result::Result<Arc<dyn TagService>, CloudError> + Send + Sync>;

/// Operations the actuator needs from Resource Manager tags.
#[async_trait]
pub trait TagService: Send + Sync {
    /// Resolve `<parent>/<key>/<value>` to its tag value.
    async fn get_namespaced_tag_value(&self, namespaced_name: &str) -> Result<TagValue>;

    /// List the tags effectively bound to `parent` (a full resource name).
    /// `location` is the zone of a zonal resource.
    async fn list_effective_tags(&self, location: &str, parent: &str)
    -> Result<Vec<EffectiveTag>>;

    /// Bind the namespaced tag value to `parent`.
    async fn create_tag_binding(
        &self,
        location: &str,
        parent: &str,
        tag_value_namespaced_name: &str,
    ) -> Result<TagBinding>;
}
