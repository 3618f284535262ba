//! Provider status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MACHINE_CREATED: &str = "MachineCreated";

pub const MACHINE_CREATION_SUCCEEDED: &str = "MachineCreationSucceeded";
pub const MACHINE_CREATION_FAILED: &str = "MachineCreationFailed";
pub const MACHINE_CREATION_SUCCEEDED_MESSAGE: &str = "Machine successfully created";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// `MachineCreated=True`.
    pub fn machine_created() -> Self {
        Self::new(
            MACHINE_CREATED,
            ConditionStatus::True,
            MACHINE_CREATION_SUCCEEDED,
            MACHINE_CREATION_SUCCEEDED_MESSAGE,
        )
    }

    /// `MachineCreated=False` carrying the failure.
    pub fn machine_creation_failed(message: impl Into<String>) -> Self {
        Self::new(
            MACHINE_CREATED,
            ConditionStatus::False,
            MACHINE_CREATION_FAILED,
            message,
        )
    }

    pub fn new(
        kind: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_probe_time: None,
            last_transition_time: None,
        }
    }
}

/// Merge `new` into `conditions`.
///
/// A condition of an unseen type is appended with both timestamps set to
/// now. An existing one is rewritten only when status, reason or message
/// differ, and its transition time moves only when the status flips.
pub fn reconcile_conditions(conditions: &[Condition], new: Condition) -> Vec<Condition> {
    let now = Utc::now();
    let mut conditions = conditions.to_vec();

    match conditions.iter_mut().find(|c| c.kind == new.kind) {
        None => conditions.push(Condition {
            last_probe_time: Some(now),
            last_transition_time: Some(now),
            ..new
        }),
        Some(current) => {
            if should_update_condition(current, &new) {
                if current.status != new.status {
                    current.last_transition_time = Some(now);
                }
                current.status = new.status;
                current.reason = new.reason;
                current.message = new.message;
                current.last_probe_time = Some(now);
            }
        }
    }

    conditions
}

pub fn should_update_condition(old: &Condition, new: &Condition) -> bool {
    old.reason != new.reason || old.message != new.message || old.status != new.status
}
