//! Worker fleet management for keel
//!
//! The fleet keeps a target number of workers running from one launch
//! template. Workers are fungible: a replacement carries no state from the
//! instance it replaces and joins through the credential channel exactly like
//! an initial worker.
//!
//! - [`template`] - launch template (shape, image, spot options, user data)
//! - [`launcher`] - [`InstanceLauncher`] seam and lifecycle events
//! - [`manager`] - [`FleetManager`] capacity and replacement loop
//! - [`local`] - in-process launcher running boot hooks as tokio tasks

#![deny(missing_docs)]

pub mod launcher;
pub mod local;
pub mod manager;
pub mod template;

pub use launcher::{InstanceEvent, InstanceId, InstanceLauncher};
pub use local::{BootHook, LocalLauncher};
pub use manager::{FleetManager, FleetStatus, InstancePhase};
pub use template::{CpuArch, LaunchTemplate, MachineImage, MarketOptions};
