//! gcm-cloud: capability contracts over Google Compute Engine and the
//! Resource Manager tag APIs.
//!
//! The machine actuator only talks to the cloud through the two traits in
//! this crate:
//! - [`ComputeService`]: instances, regions, zones, accelerators, target
//!   pools, instance groups, backend services and images
//! - [`TagService`]: resource-manager tag lookup and tag bindings
//!
//! Each trait has one production implementation in [`rest`] and one
//! deterministic double in [`mock`].

pub mod compute;
pub mod error;
pub mod mock;
pub mod rest;
pub mod tags;
pub mod types;

pub use compute::{ComputeService, ComputeServiceBuilder, DEFAULT_COMPUTE_BASE_PATH};
pub use error::{ApiErrorDetail, CloudError, CloudErrorKind, Result};
pub use tags::{DEFAULT_TAGS_BASE_PATH, TagService, TagServiceBuilder};
