//! Instance descriptor assembly: disks, networking, user data and metadata.

use std::collections::BTreeMap;

use gcm_cloud::types::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, CustomerEncryptionKey, Metadata,
    MetadataItem, NetworkInterface, ServiceAccount,
};

use super::Reconciler;
use crate::error::{Error, Result};
use crate::labels;
use crate::provider::{EncryptionKeyReference, MetadataEntry};

/// Key of the user data in the user-data secret.
pub const USER_DATA_SECRET_KEY: &str = "userData";
pub const USER_DATA_METADATA_KEY: &str = "user-data";
/// Windows machines read their boot script from this metadata key.
pub const WINDOWS_SCRIPT_METADATA_KEY: &str = "sysprep-specialize-script-ps1";

impl Reconciler<'_> {
    pub(crate) async fn disks(
        &self,
        user_tags: &BTreeMap<String, String>,
    ) -> Result<Vec<AttachedDisk>> {
        let scope = &*self.scope;
        let spec = &scope.provider_spec;
        let mut disks = Vec::with_capacity(spec.disks.len());

        for disk in &spec.disks {
            let source_image = if disk.image.contains('/') {
                disk.image.clone()
            } else {
                resolve_relative(
                    scope.compute.base_path(),
                    &format!("projects/{}/global/images/{}", scope.project_id, disk.image),
                )
            };

            let labels = labels::instance_labels(
                scope.core.as_ref(),
                scope.feature_gates.gcp_labels_tags,
                &disk.labels,
                scope.machine.cluster_id(),
            )
            .await
            .map_err(|e| {
                e.context(format!(
                    "error getting user-defined labels for machine disk {}",
                    scope.machine.name()
                ))
            })?;

            disks.push(AttachedDisk {
                auto_delete: disk.auto_delete,
                boot: disk.boot,
                initialize_params: Some(AttachedDiskInitializeParams {
                    disk_size_gb: disk.size_gb,
                    disk_type: format!("zones/{}/diskTypes/{}", spec.zone, disk.disk_type),
                    source_image,
                    labels,
                    resource_manager_tags: user_tags.clone(),
                }),
                disk_encryption_key: disk_encryption_key(
                    disk.encryption_key.as_ref(),
                    &scope.project_id,
                ),
            });
        }

        Ok(disks)
    }

    pub(crate) fn network_interfaces(&self) -> Vec<NetworkInterface> {
        let spec = &self.scope.provider_spec;

        spec.network_interfaces
            .iter()
            .map(|nic| {
                let project = if nic.project_id.is_empty() {
                    self.scope.project_id.as_str()
                } else {
                    nic.project_id.as_str()
                };
                NetworkInterface {
                    network: (!nic.network.is_empty())
                        .then(|| format!("projects/{}/global/networks/{}", project, nic.network)),
                    subnetwork: (!nic.subnetwork.is_empty()).then(|| {
                        format!(
                            "projects/{}/regions/{}/subnetworks/{}",
                            project, spec.region, nic.subnetwork
                        )
                    }),
                    network_ip: None,
                    access_configs: if nic.public_ip {
                        vec![AccessConfig::default()]
                    } else {
                        Vec::new()
                    },
                }
            })
            .collect()
    }

    pub(crate) fn service_accounts(&self) -> Vec<ServiceAccount> {
        self.scope
            .provider_spec
            .service_accounts
            .iter()
            .map(|sa| ServiceAccount {
                email: sa.email.clone(),
                scopes: sa.scopes.clone(),
            })
            .collect()
    }

    /// User data from the referenced secret, empty when none is referenced.
    pub(crate) async fn custom_user_data(&self) -> Result<String> {
        let Some(reference) = self.scope.provider_spec.user_data_secret.as_ref() else {
            return Ok(String::new());
        };
        let namespace = self.scope.machine.namespace();

        let secret = match self.scope.core.get_secret(namespace, &reference.name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                return Err(Error::invalid_configuration(format!(
                    "user data secret {:?} in namespace {:?} not found: {}",
                    reference.name, namespace, e
                )));
            }
            Err(e) => {
                return Err(Error::from(e).context(format!(
                    "error getting user data secret {:?} in namespace {:?}",
                    reference.name, namespace
                )));
            }
        };

        let data = secret.data.get(USER_DATA_SECRET_KEY).ok_or_else(|| {
            Error::invalid_configuration(format!(
                "secret {}/{} does not have {:?} field set. Thus, no user data applied when creating an instance",
                namespace, reference.name, USER_DATA_SECRET_KEY
            ))
        })?;

        String::from_utf8(data.clone()).map_err(|e| {
            Error::invalid_configuration(format!(
                "secret {}/{} field {:?} is not valid UTF-8: {}",
                namespace, reference.name, USER_DATA_SECRET_KEY, e
            ))
        })
    }

    /// Metadata items for the instance, user data first.
    pub(crate) async fn metadata(&self) -> Result<Metadata> {
        let mut user_data = self
            .custom_user_data()
            .await
            .map_err(|e| e.context("error getting custom user data"))?;

        let key = if self.scope.machine.is_windows() {
            user_data = remove_powershell_tags(&user_data);
            WINDOWS_SCRIPT_METADATA_KEY
        } else {
            USER_DATA_METADATA_KEY
        };

        Ok(build_metadata(
            key,
            user_data,
            &self.scope.provider_spec.gcp_metadata,
        ))
    }
}

/// A spec entry with the user data key replaces the user data. Every
/// other entry is appended.
pub(crate) fn build_metadata(
    user_data_key: &str,
    user_data: String,
    entries: &[MetadataEntry],
) -> Metadata {
    let mut items = vec![MetadataItem {
        key: user_data_key.to_string(),
        value: Some(user_data),
    }];

    for entry in entries {
        if entry.key == user_data_key {
            items[0].value = entry.value.clone();
        } else {
            items.push(MetadataItem {
                key: entry.key.clone(),
                value: entry.value.clone(),
            });
        }
    }

    Metadata { items }
}

pub(crate) fn remove_powershell_tags(user_data: &str) -> String {
    user_data
        .replace("<powershell>", "")
        .replace("</powershell>", "")
}

/// `projects/<p>/locations/<l>/keyRings/<r>/cryptoKeys/<k>`, the project
/// defaulting to the machine's.
pub(crate) fn disk_encryption_key(
    reference: Option<&EncryptionKeyReference>,
    project_id: &str,
) -> Option<CustomerEncryptionKey> {
    let reference = reference?;
    let key = reference.kms_key.as_ref()?;
    let project = if key.project_id.is_empty() {
        project_id
    } else {
        key.project_id.as_str()
    };

    Some(CustomerEncryptionKey {
        kms_key_name: format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            project, key.location, key.key_ring, key.name
        ),
        kms_key_service_account: (!reference.kms_key_service_account.is_empty())
            .then(|| reference.kms_key_service_account.clone()),
    })
}

/// Resolve a relative reference against `base` the way a URL is: the last
/// path segment of `base` is replaced.
pub(crate) fn resolve_relative(base: &str, reference: &str) -> String {
    match base.rfind('/') {
        Some(index) => format!("{}{}", &base[..=index], reference),
        None => reference.to_string(),
    }
}
