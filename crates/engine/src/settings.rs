//! Typed settings registry.
//!
//! A registry is loaded once per handler invocation from the platform
//! settings table and never cached across requests. Every recognized key has
//! a typed accessor; unknown keys are ignored on write and absent on read.

use autoscale_core::{
    settings::parse_bool_loose, AutoscaleError, Result, SettingItem, SettingKey,
};
use autoscale_platform::PlatformAdapter;
use std::collections::HashMap;
use tracing::debug;

/// Fallback seconds between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL_SEC: u64 = 30;
/// Fallback missed-window budget before a VM is dropped
pub const DEFAULT_HEARTBEAT_LOSS_COUNT: u32 = 3;
/// Fallback tolerated delay beyond the expected arrival
pub const DEFAULT_HEARTBEAT_DELAY_ALLOWANCE_SEC: u64 = 2;
/// Fallback vote deadline for a pending election
pub const DEFAULT_ELECTION_TIMEOUT_SEC: u64 = 90;
/// Fallback wait before an unseen license holder may be recycled
pub const DEFAULT_LICENSE_GRACE_PERIOD_SEC: u64 = 600;

/// Read-through view of the settings table
pub struct SettingsRegistry {
    items: HashMap<String, SettingItem>,
}

impl SettingsRegistry {
    /// Fetches the full settings table from the platform
    pub async fn load(platform: &dyn PlatformAdapter) -> Result<Self> {
        let items = platform
            .get_settings()
            .await?
            .into_iter()
            .filter(|item| item.key.parse::<SettingKey>().is_ok())
            .map(|item| (item.key.clone(), item))
            .collect::<HashMap<_, _>>();
        debug!(count = items.len(), "settings loaded");
        Ok(Self { items })
    }

    /// Writes one recognized setting through the platform and the local view
    pub async fn save(
        &mut self,
        platform: &dyn PlatformAdapter,
        key: SettingKey,
        value: impl Into<String>,
    ) -> Result<()> {
        let item = SettingItem::new(key, value);
        platform.set_setting_item(&item).await?;
        self.items.insert(item.key.clone(), item);
        Ok(())
    }

    fn value(&self, key: SettingKey) -> Option<&str> {
        self.items.get(key.as_str()).map(|item| item.value.as_str())
    }

    fn require(&self, key: SettingKey) -> Result<&str> {
        self.value(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AutoscaleError::ConfigurationMissing {
                key: key.as_str().to_string(),
            })
    }

    fn bool_value(&self, key: SettingKey) -> bool {
        self.value(key).map(parse_bool_loose).unwrap_or(false)
    }

    fn u64_value(&self, key: SettingKey, default: u64) -> u64 {
        self.value(key)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(default)
    }

    // --- Typed accessors, one per recognized key ---

    pub fn deployment_settings_saved(&self) -> bool {
        self.bool_value(SettingKey::DeploymentSettingsSaved)
    }

    /// Scaling group whose members are eligible for the primary role
    pub fn master_scaling_group_name(&self) -> Result<&str> {
        self.require(SettingKey::MasterScalingGroupName)
    }

    pub fn byol_scaling_group_name(&self) -> Result<&str> {
        self.require(SettingKey::ByolScalingGroupName)
    }

    pub fn payg_scaling_group_name(&self) -> Result<&str> {
        self.require(SettingKey::PaygScalingGroupName)
    }

    pub fn heartbeat_interval(&self) -> u64 {
        self.u64_value(
            SettingKey::HeartbeatInterval,
            DEFAULT_HEARTBEAT_INTERVAL_SEC,
        )
    }

    pub fn heartbeat_loss_count(&self) -> u32 {
        self.u64_value(
            SettingKey::HeartbeatLossCount,
            DEFAULT_HEARTBEAT_LOSS_COUNT as u64,
        ) as u32
    }

    pub fn heartbeat_delay_allowance(&self) -> u64 {
        self.u64_value(
            SettingKey::HeartbeatDelayAllowance,
            DEFAULT_HEARTBEAT_DELAY_ALLOWANCE_SEC,
        )
    }

    pub fn master_election_timeout(&self) -> u64 {
        self.u64_value(
            SettingKey::MasterElectionTimeout,
            DEFAULT_ELECTION_TIMEOUT_SEC,
        )
    }

    pub fn master_election_no_wait(&self) -> bool {
        self.bool_value(SettingKey::MasterElectionNoWait)
    }

    pub fn asset_storage_name(&self) -> Result<&str> {
        self.require(SettingKey::AssetStorageName)
    }

    pub fn asset_storage_key_prefix(&self) -> &str {
        self.value(SettingKey::AssetStorageKeyPrefix).unwrap_or("")
    }

    pub fn license_storage_key_prefix(&self) -> &str {
        self.value(SettingKey::FortigateLicenseStorageKeyPrefix)
            .unwrap_or("fortigate-license")
    }

    pub fn enable_hybrid_licensing(&self) -> bool {
        self.bool_value(SettingKey::EnableHybridLicensing)
    }

    pub fn get_license_grace_period(&self) -> u64 {
        self.u64_value(
            SettingKey::GetLicenseGracePeriod,
            DEFAULT_LICENSE_GRACE_PERIOD_SEC,
        )
    }

    pub fn autoscale_handler_url(&self) -> Option<&str> {
        self.value(SettingKey::AutoscaleHandlerUrl)
    }

    pub fn fortigate_psk_secret(&self) -> &str {
        self.value(SettingKey::FortigatePskSecret).unwrap_or("")
    }

    pub fn fortigate_sync_interface(&self) -> &str {
        self.value(SettingKey::FortigateSyncInterface)
            .unwrap_or("port1")
    }

    pub fn fortigate_traffic_port(&self) -> u64 {
        self.u64_value(SettingKey::FortigateTrafficPort, 443)
    }

    pub fn fortigate_admin_port(&self) -> u64 {
        self.u64_value(SettingKey::FortigateAdminPort, 8443)
    }

    pub fn fortigate_default_password(&self) -> Option<&str> {
        self.value(SettingKey::FortigateDefaultPassword)
    }

    /// Virtual network the fleet must report from; unchecked when unset
    pub fn vpc_id(&self) -> Option<&str> {
        self.value(SettingKey::VpcId).filter(|value| !value.is_empty())
    }
}
