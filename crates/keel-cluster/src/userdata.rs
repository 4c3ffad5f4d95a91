//! Instance startup scripts
//!
//! Both scripts do the same thing: put the `keel-node` boot agent on the
//! instance and run it with the credential store's name. Everything the
//! bootstrappers need arrives through `KEEL_*` environment variables, which
//! the agent's CLI reads as fallbacks.

use minijinja::{context, Environment, UndefinedBehavior};

use keel_common::config::ClusterConfig;
use keel_common::Error;

/// Control-plane startup script template
const CONTROL_PLANE_TEMPLATE: &str = include_str!("../templates/controlplane-userdata.sh");

/// Worker startup script template
const WORKER_TEMPLATE: &str = include_str!("../templates/worker-userdata.sh");

/// Values substituted into the startup scripts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootScriptContext {
    /// Credential store (bucket) name
    pub bucket: String,
    /// Region of the credential store
    pub region: Option<String>,
    /// Download URL for the boot agent; `None` when baked into the image
    pub agent_url: Option<String>,
    /// Join token validity window in seconds
    pub token_validity_secs: u64,
    /// Worker token-fetch deadline in seconds
    pub fetch_timeout_secs: u64,
    /// First delay between token polls in milliseconds
    pub fetch_initial_delay_ms: u64,
    /// Upper bound on the delay between token polls in seconds
    pub fetch_max_delay_secs: u64,
}

impl BootScriptContext {
    /// Context for a store and cluster configuration
    pub fn new(bucket: impl Into<String>, region: Option<String>, config: &ClusterConfig) -> Self {
        Self {
            bucket: bucket.into(),
            region,
            agent_url: config.boot_agent_url.clone(),
            token_validity_secs: config.token_validity_secs,
            fetch_timeout_secs: config.token_fetch.timeout_secs,
            fetch_initial_delay_ms: config.token_fetch.initial_delay_ms,
            fetch_max_delay_secs: config.token_fetch.max_delay_secs,
        }
    }

    /// Values end up unquoted in a shell script; refuse anything that could
    /// break out of a word
    fn validate(&self) -> Result<(), Error> {
        let shell_safe = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':'))
        };

        if !shell_safe(&self.bucket) {
            return Err(Error::validation_for_field(
                "bucket",
                format!("'{}' is not a valid store name", self.bucket),
            ));
        }
        if let Some(region) = &self.region {
            if !shell_safe(region) {
                return Err(Error::validation_for_field("region", format!("invalid region '{}'", region)));
            }
        }
        if let Some(url) = &self.agent_url {
            if !shell_safe(url) || !url.starts_with("https://") {
                return Err(Error::validation_for_field(
                    "bootAgentUrl",
                    "boot agent URL must be a plain https:// URL",
                ));
            }
        }
        Ok(())
    }
}

fn render(name: &str, template: &str, ctx: &BootScriptContext) -> Result<String, Error> {
    ctx.validate()?;

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(name, template)
        .map_err(|e| Error::internal_with_context("userdata", e.to_string()))?;

    env.get_template(name)
        .and_then(|t| {
            t.render(context! {
                bucket => ctx.bucket,
                region => ctx.region,
                agent_url => ctx.agent_url,
                token_validity_secs => ctx.token_validity_secs,
                fetch_timeout_secs => ctx.fetch_timeout_secs,
                fetch_initial_delay_ms => ctx.fetch_initial_delay_ms,
                fetch_max_delay_secs => ctx.fetch_max_delay_secs,
            })
        })
        .map_err(|e| Error::internal_with_context("userdata", e.to_string()))
}

/// Startup script for the control-plane instance
pub fn render_control_plane(ctx: &BootScriptContext) -> Result<String, Error> {
    render("controlplane-userdata.sh", CONTROL_PLANE_TEMPLATE, ctx)
}

/// Startup script baked into the worker launch template
pub fn render_worker(ctx: &BootScriptContext) -> Result<String, Error> {
    render("worker-userdata.sh", WORKER_TEMPLATE, ctx)
}
