//! Feature gates.
//!
//! Gates are resolved once by the embedding binary and handed to every
//! scope. Nothing in this crate reads them from global state.

use std::fmt;
use std::str::FromStr;

use clap::Args;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GCP_LABELS_TAGS: &str = "GCPLabelsTags";
pub const GCP_CUSTOM_API_ENDPOINTS: &str = "GCPCustomAPIEndpoints";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureGateError {
    #[error("unrecognized feature gate: {0}")]
    Unknown(String),
    #[error("missing bool value for {0}")]
    MissingValue(String),
    #[error("invalid value of {name}={value}, expected true or false")]
    InvalidValue { name: String, value: String },
}

/// Feature gates that change reconciliation behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureGates {
    /// Merge cluster labels and bind resource-manager tags.
    #[serde(rename = "GCPLabelsTags")]
    pub gcp_labels_tags: bool,
    /// Honour service endpoint overrides from the cluster infrastructure.
    #[serde(rename = "GCPCustomAPIEndpoints")]
    pub gcp_custom_api_endpoints: bool,
}

impl FeatureGates {
    pub fn set(&mut self, name: &str, enabled: bool) -> Result<(), FeatureGateError> {
        match name {
            GCP_LABELS_TAGS => self.gcp_labels_tags = enabled,
            GCP_CUSTOM_API_ENDPOINTS => self.gcp_custom_api_endpoints = enabled,
            other => return Err(FeatureGateError::Unknown(other.to_string())),
        }
        Ok(())
    }
}

/// Parses `Name=bool,Name=bool`. An empty string leaves every gate off.
impl FromStr for FeatureGates {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = FeatureGates::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FeatureGateError::MissingValue(entry.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            let enabled = value
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
            gates.set(name, enabled)?;
        }
        Ok(gates)
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={},{}={}",
            GCP_LABELS_TAGS, self.gcp_labels_tags, GCP_CUSTOM_API_ENDPOINTS, self.gcp_custom_api_endpoints
        )
    }
}

/// Command-line flags for binaries embedding the actuator.
#[derive(Debug, Clone, Default, Args)]
pub struct FeatureGateArgs {
    /// Comma separated feature gates, e.g. GCPLabelsTags=true
    #[arg(long = "feature-gates", value_name = "NAME=BOOL,...", default_value = "")]
    pub feature_gates: FeatureGates,
}
