//! gcm-actuator: reconciles Machine resources against Compute Engine
//! instances.
//!
//! The fleet controller calls [`Actuator`] for each lifecycle event. The
//! actuator builds a [`MachineScope`], runs the matching [`Reconciler`]
//! operation and persists the scope with merge patches.

pub mod actuator;
pub mod conditions;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod labels;
pub mod machine;
pub mod merge_patch;
pub mod provider;
pub mod reconciler;
pub mod scope;
pub mod tags;

pub use actuator::{Actuator, ActuatorParams};
pub use config::FeatureGates;
pub use core::CoreClient;
pub use error::{Error, Result};
pub use events::{EventRecorder, EventType, TracingEventRecorder, create_event_recorder};
pub use machine::Machine;
pub use reconciler::{REQUEUE_AFTER, Reconciled, Reconciler};
pub use scope::{MachineScope, MachineScopeParams};
