//! Resource-manager tag merging, resolution and binding.

use std::collections::BTreeMap;
use std::num::NonZeroU32;

use gcm_cloud::{CloudErrorKind, TagService};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, error, info, warn};

use crate::core::ResourceTag;
use crate::error::{Error, Result};
use crate::provider::ResourceManagerTag;

/// Most tags GCE accepts on one instance.
pub const MAX_TAGS: usize = 50;

/// Tag bindings per second. The API allows 10.
pub const TAG_BINDINGS_PER_SECOND: u32 = 8;

const COMPUTE_RESOURCE_PREFIX: &str = "//compute.googleapis.com";

/// Full resource name used as the parent of an instance's tag bindings.
pub fn instance_parent(project: &str, zone: &str, instance_id: &str) -> String {
    format!(
        "{}/projects/{}/zones/{}/instances/{}",
        COMPUTE_RESOURCE_PREFIX, project, zone, instance_id
    )
}

/// `<parentID>/<key>/<value>`.
pub fn namespaced_value(tag: &ResourceManagerTag) -> String {
    format!("{}/{}/{}", tag.parent_id, tag.key, tag.value)
}

/// Merge infrastructure tags with user tags keyed by `(parentID, key)`,
/// user tags winning. Returns `None` when both are empty.
pub fn merge_tags(
    infrastructure: &[ResourceTag],
    user: &[ResourceManagerTag],
) -> Result<Option<Vec<ResourceManagerTag>>> {
    let mut merged: BTreeMap<(String, String), String> = BTreeMap::new();
    for tag in infrastructure {
        merged.insert((tag.parent_id.clone(), tag.key.clone()), tag.value.clone());
    }
    for tag in user {
        merged.insert((tag.parent_id.clone(), tag.key.clone()), tag.value.clone());
    }

    if merged.is_empty() {
        return Ok(None);
    }
    if merged.len() > MAX_TAGS {
        return Err(Error::invalid_configuration(format!(
            "maximum of {} tags can be added to a VM instance, infrastructure and provider spec combined configure {} tags",
            MAX_TAGS,
            merged.len()
        )));
    }

    Ok(Some(
        merged
            .into_iter()
            .map(|((parent_id, key), value)| ResourceManagerTag {
                parent_id,
                key,
                value,
            })
            .collect(),
    ))
}

/// Resolve each tag to `tagKeys/<id> -> tagValues/<id>`.
///
/// A single failed lookup fails the whole set.
pub async fn resolve_tags(
    service: &dyn TagService,
    tags: &[ResourceManagerTag],
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();

    for tag in tags {
        let name = namespaced_value(tag);
        let value = service
            .get_namespaced_tag_value(&name)
            .await
            .map_err(|e| match e.kind {
                CloudErrorKind::NotFound | CloudErrorKind::ProjectNotFound => {
                    Error::invalid_configuration(format!(
                        "tag {} does not exist: {}",
                        name, e
                    ))
                }
                CloudErrorKind::PermissionDenied => Error::invalid_configuration(format!(
                    "permission denied to fetch tag {}: {}",
                    name, e
                )),
                _ => Error::cloud(format!("failed to fetch tag {}", name), e),
            })?;
        debug!(tag = %name, key = %value.parent, value = %value.name, "Resolved tag");
        resolved.insert(value.parent, value.name);
    }

    Ok(resolved)
}

/// Attaches tags to instances through a rate limiter that starts empty, so
/// the first burst is already throttled.
pub struct TagBinder {
    limiter: DefaultDirectRateLimiter,
}

impl Default for TagBinder {
    fn default() -> Self {
        Self::new(TAG_BINDINGS_PER_SECOND)
    }
}

impl TagBinder {
    pub fn new(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(rate).allow_burst(rate));
        // Drain the initial burst.
        let _ = limiter.check_n(rate);
        Self { limiter }
    }

    /// Bind every namespaced value in `values` that is not already
    /// effective on the instance. Bindings are never removed.
    pub async fn bind(
        &self,
        service: &dyn TagService,
        project: &str,
        zone: &str,
        instance_id: &str,
        values: &[String],
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let parent = instance_parent(project, zone, instance_id);
        let pending = filter_bound(service, zone, &parent, values).await;
        if pending.is_empty() {
            debug!(instance = %instance_id, "All tags already bound");
            return Ok(());
        }

        let mut failed = false;
        for value in &pending {
            self.limiter.until_ready().await;
            match service.create_tag_binding(zone, &parent, value).await {
                Ok(_) => info!(instance = %instance_id, tag = %value, "Bound tag"),
                Err(e) => {
                    failed = true;
                    error!(instance = %instance_id, tag = %value, "request to add tag to VM failed: {}", e);
                }
            }
        }

        if failed {
            return Err(Error::transient(format!(
                "failed to add tags to {} VM",
                instance_id
            )));
        }
        Ok(())
    }
}

/// Drop values already bound to `parent`. A failed listing keeps them all.
async fn filter_bound(
    service: &dyn TagService,
    location: &str,
    parent: &str,
    values: &[String],
) -> Vec<String> {
    let effective = match service.list_effective_tags(location, parent).await {
        Ok(effective) => effective,
        Err(e) => {
            warn!(parent = %parent, "Failed to list effective tags: {}", e);
            Vec::new()
        }
    };

    let mut pending: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let bound = effective.iter().any(|t| &t.namespaced_tag_value == value);
        if !bound && !pending.contains(value) {
            pending.push(value.clone());
        }
    }
    pending
}
