//! Instance label merging.

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::{CoreClient, ResourceLabel};
use crate::error::{Error, Result};

/// Most user-defined labels GCE accepts next to the ownership labels.
pub const MAX_USER_LABELS: usize = 32;
/// Most ownership labels a single instance may carry.
pub const MAX_OWNERSHIP_LABELS: usize = 32;

pub const OWNED: &str = "owned";

/// `kubernetes-io-cluster-<cluster id>`.
pub fn ownership_label_key(cluster_id: &str) -> String {
    format!("kubernetes-io-cluster-{}", cluster_id)
}

/// Merge infrastructure labels, user labels and the ownership label, later
/// sources winning on key collision.
pub fn merge_labels(
    infrastructure: &[ResourceLabel],
    user: &BTreeMap<String, String>,
    cluster_id: &str,
) -> Result<BTreeMap<String, String>> {
    let mut labels: BTreeMap<String, String> = infrastructure
        .iter()
        .map(|label| (label.key.clone(), label.value.clone()))
        .collect();
    labels.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));

    let ownership = BTreeMap::from([(ownership_label_key(cluster_id), OWNED.to_string())]);

    labels.retain(|key, _| !ownership.contains_key(key));
    if labels.len() > MAX_USER_LABELS {
        return Err(Error::invalid_configuration(format!(
            "ocp can add {} labels to instances, but {} user-defined labels were configured in infrastructure and provider spec combined",
            MAX_USER_LABELS,
            labels.len()
        )));
    }
    if ownership.len() > MAX_OWNERSHIP_LABELS {
        return Err(Error::invalid_configuration(format!(
            "ownership labels exceed the limit of {}",
            MAX_OWNERSHIP_LABELS
        )));
    }

    labels.extend(ownership);
    Ok(labels)
}

/// Labels for a new instance and its disks.
///
/// The infrastructure document is only consulted when `with_infrastructure`
/// is set.
pub async fn instance_labels(
    core: &dyn CoreClient,
    with_infrastructure: bool,
    user: &BTreeMap<String, String>,
    cluster_id: &str,
) -> Result<BTreeMap<String, String>> {
    if !with_infrastructure {
        return merge_labels(&[], user, cluster_id);
    }

    let infrastructure = core
        .get_infrastructure()
        .await
        .map_err(|e| Error::from(e).context("failed to get infrastructure"))?;
    let infrastructure_labels = infrastructure
        .gcp
        .map(|gcp| gcp.resource_labels)
        .unwrap_or_default();
    debug!(
        infrastructure = infrastructure_labels.len(),
        user = user.len(),
        "Merging instance labels"
    );

    merge_labels(&infrastructure_labels, user, cluster_id)
}
