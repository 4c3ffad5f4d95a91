//! keel-node - instance boot agent
//!
//! Invoked from the instance startup script. Exits non-zero whenever the
//! bootstrap sequence fails, so the failure shows up in the instance's boot
//! status and, for the control plane, as the provisioning failure an operator
//! must act on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use keel_channel::{CredentialChannel, FsChannel, S3Channel};
use keel_common::config::FetchPolicy;
use keel_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use keel_common::DEFAULT_TOKEN_VALIDITY_SECS;
use keel_node::{
    ControlPlaneBootstrapper, ControlPlaneConfig, K0sRuntime, K0sSettings, WorkerBootstrapper,
};

/// keel node boot agent
#[derive(Parser, Debug)]
#[command(name = "keel-node", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Json, env = "KEEL_LOG_FORMAT", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the control plane and publish the join token
    Controller(ControllerArgs),
    /// Fetch the join token and join the cluster as a worker
    Worker(WorkerArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Json,
    Compact,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Compact => LogFormat::Compact,
        }
    }
}

/// Where the credential channel lives; exactly one must be given
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ChannelArgs {
    /// S3 bucket holding the cluster credentials
    #[arg(long, env = "KEEL_BUCKET")]
    bucket: Option<String>,

    /// Shared directory holding the cluster credentials
    #[arg(long, env = "KEEL_CHANNEL_DIR")]
    channel_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RuntimeArgs {
    /// k0s executable
    #[arg(long, env = "KEEL_K0S_BIN", default_value = "k0s")]
    k0s_bin: PathBuf,

    /// Directory for generated runtime config and token files
    #[arg(long, env = "KEEL_WORK_DIR", default_value = "/etc/keel")]
    work_dir: PathBuf,

    /// AWS region for the S3 bucket (instance default when unset)
    #[arg(long, env = "KEEL_REGION")]
    region: Option<String>,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    channel: ChannelArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Join token validity window in seconds
    #[arg(long, env = "KEEL_TOKEN_VALIDITY_SECS", default_value_t = DEFAULT_TOKEN_VALIDITY_SECS)]
    token_validity_secs: u64,

    /// Public address to advertise in the endpoint and admin kubeconfig
    #[arg(long, env = "KEEL_ADVERTISE_ADDRESS")]
    advertise_address: Option<String>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    channel: ChannelArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Give up waiting for the join token after this many seconds
    #[arg(long, env = "KEEL_FETCH_TIMEOUT_SECS", default_value_t = FetchPolicy::default().timeout_secs)]
    fetch_timeout_secs: u64,

    /// First delay between token polls, in milliseconds
    #[arg(long, env = "KEEL_FETCH_INITIAL_DELAY_MS", default_value_t = FetchPolicy::default().initial_delay_ms)]
    fetch_initial_delay_ms: u64,

    /// Upper bound on the delay between token polls, in seconds
    #[arg(long, env = "KEEL_FETCH_MAX_DELAY_SECS", default_value_t = FetchPolicy::default().max_delay_secs)]
    fetch_max_delay_secs: u64,
}

impl WorkerArgs {
    fn fetch_policy(&self) -> Result<FetchPolicy, keel_common::Error> {
        let policy = FetchPolicy {
            initial_delay_ms: self.fetch_initial_delay_ms,
            max_delay_secs: self.fetch_max_delay_secs,
            timeout_secs: self.fetch_timeout_secs,
        };
        policy.validate()?;
        Ok(policy)
    }
}

fn open_channel(channel: &ChannelArgs, region: Option<&str>) -> anyhow::Result<Arc<dyn CredentialChannel>> {
    match (&channel.bucket, &channel.channel_dir) {
        (Some(bucket), _) => {
            let mut s3 = S3Channel::new(bucket.clone());
            if let Some(region) = region {
                s3 = s3.with_region(region);
            }
            Ok(Arc::new(s3))
        }
        (None, Some(dir)) => Ok(Arc::new(FsChannel::new(dir.clone()))),
        (None, None) => anyhow::bail!("either --bucket or --channel-dir is required"),
    }
}

fn k0s_runtime(args: &RuntimeArgs, advertise_address: Option<String>) -> K0sRuntime {
    K0sRuntime::new(K0sSettings {
        k0s_bin: args.k0s_bin.clone(),
        work_dir: args.work_dir.clone(),
        advertise_address,
        ..Default::default()
    })
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let channel = open_channel(&args.channel, args.runtime.region.as_deref())?;
    let runtime = Arc::new(k0s_runtime(&args.runtime, args.advertise_address.clone()));
    let config = ControlPlaneConfig {
        token_validity: Duration::from_secs(args.token_validity_secs),
        advertise_address: args.advertise_address,
        ..Default::default()
    };

    let outcome = ControlPlaneBootstrapper::new(runtime, channel, config)
        .run()
        .await
        .context("control-plane bootstrap failed")?;

    info!(endpoint = %outcome.endpoint, kubeconfig = %outcome.kubeconfig_locator, "control plane ready");
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let fetch = args.fetch_policy()?;
    let channel = open_channel(&args.channel, args.runtime.region.as_deref())?;
    let runtime = Arc::new(k0s_runtime(&args.runtime, None));

    WorkerBootstrapper::new(runtime, channel, fetch)
        .run()
        .await
        .context("worker bootstrap failed")?;

    info!("worker joined");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "keel-node".to_string(),
        format: cli.log_format.into(),
    })?;

    let result = match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Worker(args) => run_worker(args).await,
    };

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "boot agent exiting with failure");
    }
    result
}
