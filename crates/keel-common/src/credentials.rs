//! Credentials handed from the control plane to workers and operators
//!
//! Both types are secrets. Their `Debug` output never includes the secret
//! material; the join token shows a SHA-256 fingerprint instead so log lines
//! from the control plane and from workers can be correlated.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_yaml::Value;

use crate::{Error, KUBECONFIG_KEY, WORKER_TOKEN_KEY};

/// Role a join token grants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenRole {
    /// Register as a worker node
    Worker,
}

impl TokenRole {
    /// Role name as understood by the cluster runtime
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
        }
    }
}

/// Request for a join token from the local control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinTokenRequest {
    /// Role the token is scoped to
    pub role: TokenRole,
    /// How long the token stays valid
    pub validity: Duration,
}

impl JoinTokenRequest {
    /// Worker-scoped token with the given validity window
    pub fn worker(validity: Duration) -> Self {
        Self {
            role: TokenRole::Worker,
            validity,
        }
    }

    /// Validity formatted as a duration string (`100h`, `90m`, `45s`)
    pub fn expiry_arg(&self) -> String {
        let secs = self.validity.as_secs();
        if secs > 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}

/// An opaque worker join token
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken(String);

impl JoinToken {
    /// Wrap a token string, trimming surrounding whitespace
    pub fn new(token: impl AsRef<str>) -> Result<Self, Error> {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return Err(Error::invalid_credential(WORKER_TOKEN_KEY, "token is empty"));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(Error::invalid_credential(
                WORKER_TOKEN_KEY,
                "token contains embedded whitespace",
            ));
        }
        Ok(Self(token.to_string()))
    }

    /// Parse a token from a channel blob
    pub fn from_blob(blob: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(blob)
            .map_err(|_| Error::invalid_credential(WORKER_TOKEN_KEY, "token is not valid UTF-8"))?;
        Self::new(text)
    }

    /// Serialize the token for the channel (newline-terminated, like a token file)
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = self.0.clone().into_bytes();
        blob.push(b'\n');
        blob
    }

    /// The token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        use aws_lc_rs::digest::{digest, SHA256};
        let hash = digest(&SHA256, self.0.as_bytes());
        let mut encoded = URL_SAFE_NO_PAD.encode(hash.as_ref());
        encoded.truncate(12);
        encoded
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't expose the actual token in debug output
        f.debug_struct("JoinToken")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Administrative kubeconfig for the cluster
#[derive(Clone, PartialEq)]
pub struct AdminCredentialBundle {
    raw: String,
}

impl AdminCredentialBundle {
    /// Parse and validate a kubeconfig document
    pub fn parse(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        let doc: Value = serde_yaml::from_str(&raw)
            .map_err(|e| Error::invalid_credential(KUBECONFIG_KEY, e.to_string()))?;
        let has_clusters = doc
            .get("clusters")
            .and_then(Value::as_sequence)
            .is_some_and(|clusters| !clusters.is_empty());
        if !has_clusters {
            return Err(Error::invalid_credential(
                KUBECONFIG_KEY,
                "kubeconfig has no clusters",
            ));
        }
        Ok(Self { raw })
    }

    /// Parse a bundle from a channel blob
    pub fn from_blob(blob: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(blob).map_err(|_| {
            Error::invalid_credential(KUBECONFIG_KEY, "kubeconfig is not valid UTF-8")
        })?;
        Self::parse(text)
    }

    /// The bundle as channel blob bytes
    pub fn to_blob(&self) -> Vec<u8> {
        self.raw.clone().into_bytes()
    }

    /// The raw kubeconfig document
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// API server URL of the first cluster entry
    pub fn server(&self) -> Option<String> {
        let doc: Value = serde_yaml::from_str(&self.raw).ok()?;
        doc.get("clusters")?
            .as_sequence()?
            .first()?
            .get("cluster")?
            .get("server")?
            .as_str()
            .map(str::to_string)
    }

    /// Copy of this bundle with every cluster's API server URL replaced
    ///
    /// The runtime writes its admin config against a local address; operators
    /// retrieving the bundle need the public endpoint instead.
    pub fn with_server(&self, server: &str) -> Result<Self, Error> {
        let mut doc: Value = serde_yaml::from_str(&self.raw)
            .map_err(|e| Error::invalid_credential(KUBECONFIG_KEY, e.to_string()))?;

        if let Some(clusters) = doc.get_mut("clusters").and_then(Value::as_sequence_mut) {
            for entry in clusters {
                if let Some(cluster) = entry.get_mut("cluster").and_then(Value::as_mapping_mut) {
                    cluster.insert(
                        Value::String("server".to_string()),
                        Value::String(server.to_string()),
                    );
                }
            }
        }

        let raw = serde_yaml::to_string(&doc)
            .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;
        Ok(Self { raw })
    }
}

impl fmt::Debug for AdminCredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Client keys live in the document; only show where it points
        f.debug_struct("AdminCredentialBundle")
            .field("server", &self.server())
            .finish()
    }
}
