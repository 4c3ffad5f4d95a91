//! keel node boot agent
//!
//! The program every keel instance runs from its startup script. It owns the
//! per-instance half of the credential handoff:
//!
//! - [`controller`] - control-plane state machine: install, start, mint, publish
//! - [`worker`] - worker state machine: install, fetch (with retry), join
//! - [`runtime`] - the [`ClusterRuntime`](runtime::ClusterRuntime) seam both drive
//! - [`k0s`] - the k0s implementation of that seam
//!
//! Each instance runs its sequence once, linearly, with no coordination with
//! other instances beyond the credential channel.

#![deny(missing_docs)]

pub mod controller;
pub mod k0s;
pub mod runtime;
pub mod worker;

pub use controller::{ControlPlaneBootstrapper, ControlPlaneConfig, ControlPlaneOutcome, ControlPlaneState};
pub use k0s::{K0sRuntime, K0sSettings};
pub use runtime::{ClusterRuntime, NodeRole, RuntimeError};
pub use worker::{WorkerBootstrapper, WorkerState};
