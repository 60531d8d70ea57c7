//! Recognized configuration keys and setting items.
//!
//! The settings table is an ordered set of string tuples; this module pins
//! the closed set of keys the control plane understands. Unknown keys are
//! ignored on write and absent on read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recognized configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingKey {
    /// Gate: the dispatcher refuses to run until deployment saved settings
    DeploymentSettingsSaved,
    /// Scaling group whose members may hold the primary role
    MasterScalingGroupName,
    ByolScalingGroupName,
    PaygScalingGroupName,
    HeartbeatInterval,
    HeartbeatLossCount,
    HeartbeatDelayAllowance,
    MasterElectionTimeout,
    MasterElectionNoWait,
    AssetStorageName,
    AssetStorageKeyPrefix,
    FortigateLicenseStorageKeyPrefix,
    EnableHybridLicensing,
    GetLicenseGracePeriod,
    AutoscaleHandlerUrl,
    FortigatePskSecret,
    FortigateSyncInterface,
    FortigateTrafficPort,
    FortigateAdminPort,
    /// Written by the heartbeat path when a new primary is seated
    FortigateDefaultPassword,
    /// Virtual network the fleet is authorized to report from
    VpcId,
}

impl SettingKey {
    /// Wire string of the key as persisted in the settings table
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::DeploymentSettingsSaved => "deployment-settings-saved",
            SettingKey::MasterScalingGroupName => "master-scaling-group-name",
            SettingKey::ByolScalingGroupName => "byol-scaling-group-name",
            SettingKey::PaygScalingGroupName => "payg-scaling-group-name",
            SettingKey::HeartbeatInterval => "heartbeat-interval",
            SettingKey::HeartbeatLossCount => "heartbeat-loss-count",
            SettingKey::HeartbeatDelayAllowance => "heartbeat-delay-allowance",
            SettingKey::MasterElectionTimeout => "master-election-timeout",
            SettingKey::MasterElectionNoWait => "master-election-no-wait",
            SettingKey::AssetStorageName => "asset-storage-name",
            SettingKey::AssetStorageKeyPrefix => "asset-storage-key-prefix",
            SettingKey::FortigateLicenseStorageKeyPrefix => {
                "fortigate-license-storage-key-prefix"
            }
            SettingKey::EnableHybridLicensing => "enable-hybrid-licensing",
            SettingKey::GetLicenseGracePeriod => "get-license-grace-period",
            SettingKey::AutoscaleHandlerUrl => "autoscale-handler-url",
            SettingKey::FortigatePskSecret => "fortigate-psk-secret",
            SettingKey::FortigateSyncInterface => "fortigate-sync-interface",
            SettingKey::FortigateTrafficPort => "fortigate-traffic-port",
            SettingKey::FortigateAdminPort => "fortigate-admin-port",
            SettingKey::FortigateDefaultPassword => "fortigate-default-password",
            SettingKey::VpcId => "vpc-id",
        }
    }

    /// All recognized keys, in table order
    pub fn all() -> &'static [SettingKey] {
        &[
            SettingKey::DeploymentSettingsSaved,
            SettingKey::MasterScalingGroupName,
            SettingKey::ByolScalingGroupName,
            SettingKey::PaygScalingGroupName,
            SettingKey::HeartbeatInterval,
            SettingKey::HeartbeatLossCount,
            SettingKey::HeartbeatDelayAllowance,
            SettingKey::MasterElectionTimeout,
            SettingKey::MasterElectionNoWait,
            SettingKey::AssetStorageName,
            SettingKey::AssetStorageKeyPrefix,
            SettingKey::FortigateLicenseStorageKeyPrefix,
            SettingKey::EnableHybridLicensing,
            SettingKey::GetLicenseGracePeriod,
            SettingKey::AutoscaleHandlerUrl,
            SettingKey::FortigatePskSecret,
            SettingKey::FortigateSyncInterface,
            SettingKey::FortigateTrafficPort,
            SettingKey::FortigateAdminPort,
            SettingKey::FortigateDefaultPassword,
            SettingKey::VpcId,
        ]
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .find(|key| key.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown setting key: {}", s))
    }
}

/// One row of the settings table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingItem {
    pub key: String,
    pub value: String,
    pub description: String,
    /// Whether operators may edit the row after deployment
    pub editable: bool,
    /// Whether `value` carries a JSON document
    pub json_encoded: bool,
}

impl SettingItem {
    /// Builds a plain editable item for a recognized key
    pub fn new(key: SettingKey, value: impl Into<String>) -> Self {
        Self {
            key: key.as_str().to_string(),
            value: value.into(),
            description: String::new(),
            editable: true,
            json_encoded: false,
        }
    }

    /// Tolerant boolean reading of the value
    ///
    /// `"true"` in any case maps to true; anything else maps to false, so
    /// normalization is idempotent.
    pub fn as_bool(&self) -> bool {
        parse_bool_loose(&self.value)
    }
}

/// Tolerant boolean parsing shared by the settings surface
pub fn parse_bool_loose(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
