//! Machine events.
//!
//! Each actuator call emits exactly one event. The default recorder writes
//! events through tracing under the `events` target.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::machine::Machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Sink for events about a machine.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn event(&self, machine: &Machine, kind: EventType, reason: &str, message: &str);
}

/// Records events locally via tracing.
pub struct TracingEventRecorder {
    component: String,
}

impl TracingEventRecorder {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }
}

#[async_trait]
impl EventRecorder for TracingEventRecorder {
    async fn event(&self, machine: &Machine, kind: EventType, reason: &str, message: &str) {
        let object = format!("{}/{}", machine.namespace(), machine.name());
        match kind {
            EventType::Normal => {
                tracing::info!(target: "events", component = %self.component, object = %object, reason = %reason, "{}", message)
            }
            EventType::Warning => {
                tracing::warn!(target: "events", component = %self.component, object = %object, reason = %reason, "{}", message)
            }
        }
    }
}

/// Create a shared tracing event recorder
pub fn create_event_recorder(component: &str) -> Arc<dyn EventRecorder> {
    Arc::new(TracingEventRecorder::new(component))
}
