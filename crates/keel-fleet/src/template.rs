//! Launch templates for worker instances
//!
//! Every worker, initial or replacement, is launched from the same template,
//! so nothing distinguishes a replacement from the instance it replaces. The
//! template's user data runs the worker bootstrapper from scratch.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::{json, Value};

use keel_common::topology::{FleetDescriptor, InstanceType, MarketType};

/// CPU architecture of a machine image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    /// 64-bit ARM (Graviton)
    Arm64,
    /// 64-bit x86
    X86_64,
}

impl CpuArch {
    /// Architecture matching an instance shape
    pub fn for_instance_type(instance_type: &InstanceType) -> Self {
        if instance_type.is_arm() {
            Self::Arm64
        } else {
            Self::X86_64
        }
    }
}

/// Machine image an instance boots from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineImage {
    /// Latest Amazon Linux 2 for an architecture, resolved at launch time
    LatestAmazonLinux2(CpuArch),
    /// A fixed image id
    Id(String),
}

impl MachineImage {
    /// Latest Amazon Linux 2 image matching `instance_type`
    pub fn latest_for(instance_type: &InstanceType) -> Self {
        Self::LatestAmazonLinux2(CpuArch::for_instance_type(instance_type))
    }

    /// Image reference as accepted by the launch API
    ///
    /// Latest-image aliases are SSM public parameters, resolved with the
    /// `resolve:ssm:` prefix.
    pub fn image_ref(&self) -> String {
        match self {
            Self::LatestAmazonLinux2(CpuArch::Arm64) => {
                "resolve:ssm:/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-arm64-gp2".into()
            }
            Self::LatestAmazonLinux2(CpuArch::X86_64) => {
                "resolve:ssm:/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2".into()
            }
            Self::Id(id) => id.clone(),
        }
    }
}

/// Spot request lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SpotInstanceType {
    /// Not re-requested after interruption; the fleet launches a replacement
    #[serde(rename = "one-time")]
    OneTime,
}

/// Market options attached to interruptible launches
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarketOptions {
    /// Always `spot`
    pub market_type: String,
    /// Spot request behaviour
    pub spot_options: SpotOptions,
}

/// Spot-specific options
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotOptions {
    /// Request lifetime
    pub spot_instance_type: SpotInstanceType,
}

impl MarketOptions {
    /// Options for `market`; on-demand launches carry none
    pub fn for_market(market: MarketType) -> Option<Self> {
        match market {
            MarketType::OnDemand => None,
            MarketType::Spot => Some(Self {
                market_type: "spot".to_string(),
                spot_options: SpotOptions {
                    spot_instance_type: SpotInstanceType::OneTime,
                },
            }),
        }
    }
}

/// Everything needed to launch one worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplate {
    /// Template name
    pub name: String,
    /// Instance shape
    pub instance_type: InstanceType,
    /// Boot image
    pub image: MachineImage,
    /// On-demand or spot
    pub market: MarketType,
    /// Startup script (plain text)
    pub user_data: String,
    /// Instance profile granting the worker identity (read-only channel access)
    pub instance_profile: Option<String>,
    /// Security groups attached to each instance
    pub security_groups: Vec<String>,
}

impl LaunchTemplate {
    /// Template for a fleet descriptor with the given startup script
    pub fn for_fleet(name: impl Into<String>, fleet: &FleetDescriptor, user_data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_type: fleet.instance_type.clone(),
            image: MachineImage::latest_for(&fleet.instance_type),
            market: fleet.market,
            user_data: user_data.into(),
            instance_profile: None,
            security_groups: Vec::new(),
        }
    }

    /// Attach an instance profile
    pub fn with_instance_profile(mut self, profile: impl Into<String>) -> Self {
        self.instance_profile = Some(profile.into());
        self
    }

    /// Attach a security group
    pub fn with_security_group(mut self, group: impl Into<String>) -> Self {
        self.security_groups.push(group.into());
        self
    }

    /// Market options for this template, if interruptible
    pub fn market_options(&self) -> Option<MarketOptions> {
        MarketOptions::for_market(self.market)
    }

    /// User data encoded for the launch API
    pub fn user_data_base64(&self) -> String {
        STANDARD.encode(self.user_data.as_bytes())
    }

    /// Launch template data in the shape the EC2 launch API takes
    pub fn launch_template_data(&self) -> Value {
        let mut data = json!({
            "ImageId": self.image.image_ref(),
            "InstanceType": self.instance_type.as_str(),
            "UserData": self.user_data_base64(),
        });
        if let Some(options) = self.market_options() {
            data["InstanceMarketOptions"] = json!(options);
        }
        if let Some(profile) = &self.instance_profile {
            data["IamInstanceProfile"] = json!({ "Arn": profile });
        }
        if !self.security_groups.is_empty() {
            data["SecurityGroupIds"] = json!(self.security_groups);
        }
        data
    }
}
