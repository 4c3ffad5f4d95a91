//! S3 credential channel via the `aws` CLI
//!
//! Instances already carry the AWS CLI and an instance profile, so the channel
//! shells out to `aws s3 cp` the same way the boot scripts always have,
//! streaming blobs through stdin/stdout so nothing secret touches the disk.
//! S3 object PUTs are atomic and strongly read-after-write consistent.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{validate_key, ChannelError, CredentialChannel};

/// S3 bucket accessed through the AWS CLI
#[derive(Clone, Debug)]
pub struct S3Channel {
    bucket: String,
    region: Option<String>,
    aws_bin: PathBuf,
}

impl S3Channel {
    /// Use `bucket` with the CLI found on PATH and the default region
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            aws_bin: PathBuf::from("aws"),
        }
    }

    /// Pin the region instead of relying on instance metadata
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Use a specific `aws` executable
    pub fn with_aws_bin(mut self, aws_bin: impl Into<PathBuf>) -> Self {
        self.aws_bin = aws_bin.into();
        self
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn cp_command(&self, src: &str, dst: &str) -> Command {
        let mut cmd = Command::new(&self.aws_bin);
        cmd.args(["s3", "cp", "--only-show-errors", src, dst]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Map `aws s3 cp` stderr onto the channel contract
pub fn classify_cli_failure(key: &str, stderr: &str) -> ChannelError {
    let message = stderr.trim().lines().last().unwrap_or("aws s3 cp failed").to_string();

    if stderr.contains("AccessDenied") || stderr.contains("(403)") || stderr.contains("Forbidden") {
        ChannelError::access_denied(key, message)
    } else if stderr.contains("NoSuchKey")
        || stderr.contains("(404)")
        || stderr.contains("Not Found")
        || stderr.contains("does not exist")
    {
        ChannelError::not_found(key)
    } else {
        ChannelError::unavailable(key, message)
    }
}

#[async_trait]
impl CredentialChannel for S3Channel {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        validate_key(key)?;
        let uri = self.object_uri(key);

        let mut child = self
            .cp_command("-", &uri)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| ChannelError::unavailable(key, format!("failed to run aws CLI: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(blob)
                .await
                .map_err(|e| ChannelError::unavailable(key, format!("failed to stream blob: {}", e)))?;
            // Dropping stdin closes the pipe so the upload can complete
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ChannelError::unavailable(key, e.to_string()))?;

        if !output.status.success() {
            return Err(classify_cli_failure(key, &String::from_utf8_lossy(&output.stderr)));
        }

        debug!(uri = %uri, bytes = blob.len(), "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        validate_key(key)?;
        let uri = self.object_uri(key);

        let output = self
            .cp_command(&uri, "-")
            .output()
            .await
            .map_err(|e| ChannelError::unavailable(key, format!("failed to run aws CLI: {}", e)))?;

        if !output.status.success() {
            return Err(classify_cli_failure(key, &String::from_utf8_lossy(&output.stderr)));
        }

        Ok(output.stdout)
    }

    fn locate(&self, key: &str) -> String {
        self.object_uri(key)
    }
}
