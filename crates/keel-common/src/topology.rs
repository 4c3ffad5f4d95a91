//! Cluster topology: what gets launched, resolved from configuration
//!
//! A [`ClusterTopology`] is built once at provisioning time and never mutated.
//! Changing the worker count afterwards scales the fleet; it does not produce a
//! new topology.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::Error;

/// A cloud instance shape such as `m6g.medium`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceType(String);

impl InstanceType {
    /// Instance family (`m6g` for `m6g.medium`)
    pub fn family(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// Instance size (`medium` for `m6g.medium`)
    pub fn size(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or_default()
    }

    /// Whether the family runs on ARM (Graviton families carry a `g` after the generation)
    pub fn is_arm(&self) -> bool {
        let family = self.family();
        let generation_end = family
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i + 1);
        match generation_end {
            Some(idx) => family[idx..].starts_with('g'),
            None => false,
        }
    }

    /// The instance type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for InstanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(family), Some(size), None)
                if !family.is_empty()
                    && !size.is_empty()
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') =>
            {
                Ok(Self(s.to_ascii_lowercase()))
            }
            _ => Err(Error::validation(format!(
                "invalid instance type '{}': expected <family>.<size>",
                s
            ))),
        }
    }
}

impl TryFrom<String> for InstanceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceType> for String {
    fn from(value: InstanceType) -> Self {
        value.0
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How worker instances are acquired
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarketType {
    /// Durable on-demand capacity
    OnDemand,
    /// Interruptible (spot) capacity, reclaimable with short notice
    Spot,
}

impl MarketType {
    /// Whether instances of this market type can be reclaimed by the platform
    pub fn is_interruptible(self) -> bool {
        matches!(self, Self::Spot)
    }
}

/// The single control-plane instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    /// Instance shape
    pub instance_type: InstanceType,
}

/// The worker fleet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetDescriptor {
    /// Number of workers the fleet keeps running
    pub min_capacity: u32,
    /// Instance shape for every worker
    pub instance_type: InstanceType,
    /// On-demand or spot
    pub market: MarketType,
}

/// Resolved description of everything the cluster launches
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Control-plane instance
    pub control_plane: NodeDescriptor,
    /// Worker fleet
    pub workers: FleetDescriptor,
}

impl ClusterTopology {
    /// Resolve a topology from validated configuration
    pub fn from_config(config: &ClusterConfig) -> Result<Self, Error> {
        config.validate()?;

        let control_plane_type: InstanceType = config.control_plane_instance_type.parse()?;
        let worker_type: InstanceType = config.worker_instance_type.parse()?;

        Ok(Self {
            control_plane: NodeDescriptor {
                instance_type: control_plane_type,
            },
            workers: FleetDescriptor {
                min_capacity: config.worker_min_capacity,
                instance_type: worker_type,
                market: if config.spot_worker_nodes {
                    MarketType::Spot
                } else {
                    MarketType::OnDemand
                },
            },
        })
    }
}
