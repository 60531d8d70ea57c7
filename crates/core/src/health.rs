//! Heartbeat health records and classification tags.
//!
//! One `HealthCheckRecord` exists per live VM. It is created by the first
//! accepted heartbeat (or the bootstrap path), mutated only by the heartbeat
//! sync orchestrator, and deleted when the lifecycle handler removes the VM.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cluster membership state of a monitored VM
///
/// An out-of-sync VM is no longer eligible for the primary role and is not
/// counted as participating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    #[serde(rename = "in-sync")]
    InSync,
    #[serde(rename = "out-of-sync")]
    OutOfSync,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::InSync => write!(f, "in-sync"),
            SyncState::OutOfSync => write!(f, "out-of-sync"),
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-sync" => Ok(SyncState::InSync),
            "out-of-sync" => Ok(SyncState::OutOfSync),
            _ => Err(format!("Unknown sync state: {}", s)),
        }
    }
}

/// Classification of one heartbeat arrival against its expected window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckResult {
    /// Arrived at or before the expected time
    OnTime,
    /// Arrived past the expected time but within the delay allowance
    Late,
    /// Arrived past the allowance; loss count incremented
    TooLate,
    /// Loss count exhausted; the VM left the cluster
    Dropped,
    /// Out-of-sync VM produced an in-window heartbeat
    Recovering,
    /// Enough consecutive in-window heartbeats; the VM rejoined the cluster
    Recovered,
}

impl HealthCheckResult {
    /// Checks whether the arrival was accepted (the window advances)
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Self::OnTime | Self::Late | Self::Recovering | Self::Recovered
        )
    }
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckResult::OnTime => write!(f, "on-time"),
            HealthCheckResult::Late => write!(f, "late"),
            HealthCheckResult::TooLate => write!(f, "too-late"),
            HealthCheckResult::Dropped => write!(f, "dropped"),
            HealthCheckResult::Recovering => write!(f, "recovering"),
            HealthCheckResult::Recovered => write!(f, "recovered"),
        }
    }
}

/// Per-VM heartbeat monitor record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRecord {
    /// Monitored VM id (table key)
    pub vm_id: String,
    /// Scaling group of the monitored VM
    pub scaling_group_name: String,
    /// Private IP the VM reported from
    pub ip: String,
    /// Private IP of the primary this VM currently follows; empty when none
    pub primary_ip: String,
    /// Configured seconds between heartbeats; always > 0
    pub heartbeat_interval: u64,
    /// Consecutive missed-window count
    pub heartbeat_loss_count: u32,
    /// Absolute ms timestamp the next heartbeat is expected at
    pub next_heartbeat_time: u64,
    /// Cluster membership state
    pub sync_state: SyncState,
    /// Consecutive in-window arrivals while recovering
    pub sync_recovery_count: u32,
    /// Accepted-heartbeat sequence number, monotonic per VM
    pub seq: u64,
    /// Whether the VM currently counts as healthy
    pub healthy: bool,
    /// Whether the VM runs the expected configuration revision
    pub up_to_date: bool,

    // Device-reported auxiliary fields, echoed verbatim from the heartbeat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_sync_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_sync_fail_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_sync_status: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_is_primary: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_checksum: Option<String>,
}

impl HealthCheckRecord {
    /// Builds the monitor record for a VM's first accepted heartbeat
    pub fn first_heartbeat(
        vm_id: impl Into<String>,
        scaling_group_name: impl Into<String>,
        ip: impl Into<String>,
        primary_ip: impl Into<String>,
        heartbeat_interval: u64,
        t_now: u64,
    ) -> Self {
        debug_assert!(heartbeat_interval > 0);
        Self {
            vm_id: vm_id.into(),
            scaling_group_name: scaling_group_name.into(),
            ip: ip.into(),
            primary_ip: primary_ip.into(),
            heartbeat_interval,
            heartbeat_loss_count: 0,
            next_heartbeat_time: t_now + heartbeat_interval * 1000,
            sync_state: SyncState::InSync,
            sync_recovery_count: 0,
            seq: 1,
            healthy: true,
            up_to_date: true,
            send_time: None,
            device_sync_time: None,
            device_sync_fail_time: None,
            device_sync_status: None,
            device_is_primary: None,
            device_checksum: None,
        }
    }

    /// Checks whether this VM still counts toward the cluster
    pub fn is_participating(&self) -> bool {
        self.sync_state == SyncState::InSync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_wire_strings() {
        assert_eq!(SyncState::InSync.to_string(), "in-sync");
        assert_eq!("out-of-sync".parse::<SyncState>(), Ok(SyncState::OutOfSync));
        assert!("active".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_result_acceptance() {
        assert!(HealthCheckResult::OnTime.is_accepted());
        assert!(HealthCheckResult::Late.is_accepted());
        assert!(HealthCheckResult::Recovering.is_accepted());
        assert!(!HealthCheckResult::TooLate.is_accepted());
        assert!(!HealthCheckResult::Dropped.is_accepted());
    }

    #[test]
    fn test_first_heartbeat_record() {
        let record = HealthCheckRecord::first_heartbeat("i-01", "byol", "10.0.0.4", "", 30, 0);
        assert_eq!(record.next_heartbeat_time, 30_000);
        assert_eq!(record.seq, 1);
        assert_eq!(record.heartbeat_loss_count, 0);
        assert!(record.healthy);
        assert!(record.is_participating());
    }

    #[test]
    fn test_record_serde_field_names() {
        let record = HealthCheckRecord::first_heartbeat("i-01", "byol", "10.0.0.4", "", 30, 0);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("vmId").is_some());
        assert!(json.get("nextHeartbeatTime").is_some());
        assert_eq!(json.get("syncState").unwrap(), "in-sync");
    }
}
