//! Integration stories for the bootstrap and credential handoff protocol
//!
//! - `bootstrap`: control plane and workers meeting through the channel
//!   (concurrent joins, late publish, denied publish, token expiry)
//! - `provisioning`: the orchestrator end to end, including interruptible
//!   worker replacement
//!
//! Every story runs with paused tokio time, so backoff and fetch deadlines
//! elapse instantly.

mod bootstrap;
mod helpers;
mod provisioning;
