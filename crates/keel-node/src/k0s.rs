//! k0s cluster runtime
//!
//! Drives the `k0s` binary the same way an instance boot script would:
//!
//! ```text
//! curl -sSLf https://get.k0s.sh | sh
//! k0s default-config > k0s.yaml
//! k0s install controller -c k0s.yaml
//! k0s start
//! k0s token create --role=worker --expiry=100h
//! ```
//!
//! and on workers `k0s install worker --token-file <file>` followed by
//! `k0s start`. Every step is idempotent across a reboot of the same instance:
//! an already-present binary is not downloaded again and an already-installed
//! service is started rather than re-installed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use keel_common::credentials::{AdminCredentialBundle, JoinToken, JoinTokenRequest};
use keel_common::retry::{retry_with_backoff, RetryConfig};

use crate::runtime::{ClusterRuntime, NodeRole, RuntimeError};

/// Default location of the k0s install script
pub const DEFAULT_INSTALL_SCRIPT_URL: &str = "https://get.k0s.sh";

/// Where k0s writes the cluster admin kubeconfig on a controller
pub const DEFAULT_ADMIN_CONF: &str = "/var/lib/k0s/pki/admin.conf";

/// Settings for driving k0s on an instance
#[derive(Clone, Debug)]
pub struct K0sSettings {
    /// k0s executable (looked up on PATH when relative)
    pub k0s_bin: PathBuf,
    /// Install script piped into `sh` when k0s is missing
    pub install_script_url: String,
    /// Directory for generated config and the worker token file
    pub work_dir: PathBuf,
    /// Admin kubeconfig written by the controller
    pub admin_conf: PathBuf,
    /// Address to report for the control plane (discovered when unset)
    pub advertise_address: Option<String>,
    /// How long to wait for `k0s status` to report a running node
    pub ready_timeout: Duration,
}

impl Default for K0sSettings {
    fn default() -> Self {
        Self {
            k0s_bin: PathBuf::from("k0s"),
            install_script_url: DEFAULT_INSTALL_SCRIPT_URL.to_string(),
            work_dir: PathBuf::from("/etc/keel"),
            admin_conf: PathBuf::from(DEFAULT_ADMIN_CONF),
            advertise_address: None,
            ready_timeout: Duration::from_secs(300),
        }
    }
}

impl K0sSettings {
    fn config_path(&self) -> PathBuf {
        self.work_dir.join("k0s.yaml")
    }

    fn token_path(&self) -> PathBuf {
        self.work_dir.join("worker-token")
    }
}

/// Add `address` to `spec.api.sans` of a k0s cluster config
///
/// k0s only puts interface addresses in the API server certificate. A public
/// address reached through NAT has to be listed explicitly, or clients using
/// the published admin bundle fail certificate verification.
pub fn with_api_san(config: &str, address: &str) -> Result<String, String> {
    use serde_yaml::{Mapping, Value};

    let mut doc: Value =
        serde_yaml::from_str(config).map_err(|e| format!("invalid k0s config: {}", e))?;

    let mut node = &mut doc;
    for key in ["spec", "api"] {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| format!("k0s config: parent of '{}' is not a mapping", key))?;
        node = map
            .entry(Value::from(key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
    }
    let api = node
        .as_mapping_mut()
        .ok_or_else(|| "k0s config: spec.api is not a mapping".to_string())?;
    let sans = api
        .entry(Value::from("sans"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if sans.is_null() {
        *sans = Value::Sequence(Vec::new());
    }
    let sans = sans
        .as_sequence_mut()
        .ok_or_else(|| "k0s config: spec.api.sans is not a list".to_string())?;

    if !sans.iter().any(|san| san.as_str() == Some(address)) {
        sans.push(Value::from(address));
    }
    serde_yaml::to_string(&doc).map_err(|e| format!("cannot render k0s config: {}", e))
}

/// Map the output of a failed worker join onto the runtime contract
///
/// Only catches expiry that k0s reports synchronously. A worker whose token
/// is refused after `k0s start` logs that to its service journal, and
/// `k0s status` keeps failing until the readiness timeout, which lands here
/// as `JoinRejected`.
pub fn classify_join_failure(output: &str) -> RuntimeError {
    let lower = output.to_ascii_lowercase();
    if lower.contains("expired") {
        RuntimeError::TokenExpired(output.trim().to_string())
    } else {
        RuntimeError::JoinRejected(output.trim().to_string())
    }
}

/// Pick the first address out of `hostname -I` output
pub fn first_address(hostname_output: &str) -> Option<String> {
    hostname_output.split_whitespace().next().map(str::to_string)
}

/// k0s driven through its CLI
#[derive(Clone, Debug, Default)]
pub struct K0sRuntime {
    settings: K0sSettings,
}

impl K0sRuntime {
    /// Create a runtime with the given settings
    pub fn new(settings: K0sSettings) -> Self {
        Self { settings }
    }

    /// Settings in use
    pub fn settings(&self) -> &K0sSettings {
        &self.settings
    }

    /// Run k0s with `args`, returning stdout or a description of the failure
    async fn k0s(&self, args: &[&str]) -> Result<String, String> {
        debug!(bin = %self.settings.k0s_bin.display(), args = ?args, "running k0s");
        let output = Command::new(&self.settings.k0s_bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.settings.k0s_bin.display(), e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(format!(
                "k0s {} exited with {}: {}{}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        }
    }

    async fn ensure_binary(&self, role: NodeRole) -> Result<(), RuntimeError> {
        if self.k0s(&["version"]).await.is_ok() {
            debug!("k0s already present, skipping download");
            return Ok(());
        }

        info!(url = %self.settings.install_script_url, "downloading k0s");
        let script = format!("curl -sSLf {} | sh", self.settings.install_script_url);
        let output = Command::new("sh")
            .args(["-c", &script])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Install {
                role,
                message: format!("failed to run install script: {}", e),
            })?;

        if !output.status.success() {
            return Err(RuntimeError::Install {
                role,
                message: format!(
                    "install script exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    async fn ensure_work_dir(&self, role: NodeRole) -> Result<(), RuntimeError> {
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| RuntimeError::Install {
                role,
                message: format!("cannot create {}: {}", self.settings.work_dir.display(), e),
            })
    }

    /// `k0s install ...` fails if the service already exists; a reboot lands here
    fn already_installed(message: &str) -> bool {
        message.contains("already exists") || message.contains("already installed")
    }

    async fn wait_until_running(&self) -> Result<(), String> {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::with_timeout(self.settings.ready_timeout)
        };
        retry_with_backoff(&config, "k0s_status", || self.k0s(&["status"])).await?;
        Ok(())
    }

    async fn discover_address(&self) -> Result<String, RuntimeError> {
        if let Some(address) = &self.settings.advertise_address {
            return Ok(address.clone());
        }

        let output = Command::new("hostname")
            .arg("-I")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Start(format!("cannot determine node address: {}", e)))?;

        first_address(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| RuntimeError::Start("node has no address".to_string()))
    }
}

async fn write_secret_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[async_trait]
impl ClusterRuntime for K0sRuntime {
    async fn install(&self, role: NodeRole) -> Result<(), RuntimeError> {
        self.ensure_work_dir(role).await?;
        self.ensure_binary(role).await?;

        if role == NodeRole::Worker {
            // Worker install needs the join token; it happens in join_worker
            return Ok(());
        }

        let mut default_config = self
            .k0s(&["default-config"])
            .await
            .map_err(|message| RuntimeError::Install { role, message })?;
        if let Some(address) = &self.settings.advertise_address {
            default_config = with_api_san(&default_config, address)
                .map_err(|message| RuntimeError::Install { role, message })?;
            debug!(address = %address, "added advertise address to API server SANs");
        }
        let config_path = self.settings.config_path();
        tokio::fs::write(&config_path, default_config)
            .await
            .map_err(|e| RuntimeError::Install {
                role,
                message: format!("cannot write {}: {}", config_path.display(), e),
            })?;

        let config_arg = config_path.to_string_lossy();
        match self.k0s(&["install", "controller", "-c", &config_arg]).await {
            Ok(_) => {}
            Err(message) if Self::already_installed(&message) => {
                info!("k0s controller service already installed");
            }
            Err(message) => return Err(RuntimeError::Install { role, message }),
        }
        Ok(())
    }

    async fn start_controller(&self) -> Result<String, RuntimeError> {
        if let Err(message) = self.k0s(&["start"]).await {
            // Starting an already-running service is not a failure
            if !message.contains("already running") {
                return Err(RuntimeError::Start(message));
            }
        }
        self.wait_until_running().await.map_err(RuntimeError::Start)?;
        self.discover_address().await
    }

    async fn create_join_token(
        &self,
        request: &JoinTokenRequest,
    ) -> Result<JoinToken, RuntimeError> {
        let role = format!("--role={}", request.role.as_str());
        let expiry = format!("--expiry={}", request.expiry_arg());
        let stdout = self
            .k0s(&["token", "create", &role, &expiry])
            .await
            .map_err(RuntimeError::TokenCreate)?;
        JoinToken::new(stdout).map_err(|e| RuntimeError::TokenCreate(e.to_string()))
    }

    async fn admin_credentials(&self) -> Result<AdminCredentialBundle, RuntimeError> {
        let raw = tokio::fs::read_to_string(&self.settings.admin_conf)
            .await
            .map_err(|e| {
                RuntimeError::AdminCredentials(format!(
                    "cannot read {}: {}",
                    self.settings.admin_conf.display(),
                    e
                ))
            })?;
        AdminCredentialBundle::parse(raw).map_err(|e| RuntimeError::AdminCredentials(e.to_string()))
    }

    async fn join_worker(&self, token: &JoinToken) -> Result<(), RuntimeError> {
        let token_path = self.settings.token_path();
        write_secret_file(&token_path, &token.to_blob())
            .await
            .map_err(|e| RuntimeError::Install {
                role: NodeRole::Worker,
                message: format!("cannot write {}: {}", token_path.display(), e),
            })?;

        let token_arg = token_path.to_string_lossy();
        match self.k0s(&["install", "worker", "--token-file", &token_arg]).await {
            Ok(_) => {}
            Err(message) if Self::already_installed(&message) => {
                warn!("k0s worker service already installed, reusing it");
            }
            Err(message) => return Err(classify_join_failure(&message)),
        }

        if let Err(message) = self.k0s(&["start"]).await {
            if !message.contains("already running") {
                return Err(classify_join_failure(&message));
            }
        }
        self.wait_until_running()
            .await
            .map_err(|message| classify_join_failure(&message))
    }
}
