//! Heartbeat sync orchestration.
//!
//! One call per reporting VM: verify identity, classify the arrival, keep the
//! monitor record current, trigger an election when the cluster has no
//! healthy primary, and build the exact wire body the device expects —
//! `{"master-ip": ...}` on a change, `{"action":"shutdown"}` on eviction,
//! the empty string otherwise.

use crate::election::{ElectionConfig, ElectionOutcome, ElectionRunner};
use crate::health::{HealthCheckConfig, HealthCheckEngine};
use crate::settings::SettingsRegistry;
use autoscale_core::{
    AutoscaleError, HealthCheckRecord, HealthCheckResult, Result, SettingKey, SyncState,
    VirtualMachine, VmDescriptor,
};
use autoscale_platform::{
    HeartbeatInterval, PlatformAdapter, ProxyAdapter, ProxyResponse, RequestInfo,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle action completed when a VM's first heartbeat lands
const BOOTSTRAP_LIFECYCLE_ACTION: &str = "get-config";

/// Resolves the reporting VM, trying the BYOL group first, then PAYG
pub(crate) async fn find_reporting_vm(
    platform: &dyn PlatformAdapter,
    settings: &SettingsRegistry,
    vm_id: &str,
) -> Result<VirtualMachine> {
    let mut groups = Vec::new();
    if let Ok(group) = settings.byol_scaling_group_name() {
        groups.push(group.to_string());
    }
    if let Ok(group) = settings.payg_scaling_group_name() {
        groups.push(group.to_string());
    }

    for group in &groups {
        if let Some(vm) = platform
            .describe_vm(&VmDescriptor::in_group(vm_id, group))
            .await?
        {
            return Ok(vm);
        }
    }
    if groups.is_empty() {
        if let Some(vm) = platform.describe_vm(&VmDescriptor::by_id(vm_id)).await? {
            return Ok(vm);
        }
    }

    Err(AutoscaleError::Unauthorized {
        reason: format!("Instance {} is not in a managed scaling group", vm_id),
    })
}

/// Per-request heartbeat handler
pub struct HeartbeatOrchestrator {
    platform: Arc<dyn PlatformAdapter>,
    proxy: Arc<dyn ProxyAdapter>,
}

impl HeartbeatOrchestrator {
    pub fn new(platform: Arc<dyn PlatformAdapter>, proxy: Arc<dyn ProxyAdapter>) -> Self {
        Self { platform, proxy }
    }

    /// Handles one heartbeat from the VM named in `info`
    pub async fn handle(
        &self,
        info: &RequestInfo,
        settings: &mut SettingsRegistry,
    ) -> Result<ProxyResponse> {
        let t_now = self.proxy.now_ms();
        let self_vm = find_reporting_vm(self.platform.as_ref(), settings, &info.vm_id).await?;

        if let Some(vpc_id) = settings.vpc_id() {
            if self_vm.virtual_network_id != vpc_id {
                return Err(AutoscaleError::Unauthorized {
                    reason: format!(
                        "Instance {} reports from virtual network {}, expected {}",
                        self_vm.vm_id, self_vm.virtual_network_id, vpc_id
                    ),
                });
            }
        }

        let engine = HealthCheckEngine::new(HealthCheckConfig {
            max_loss_count: settings.heartbeat_loss_count(),
            delay_allowance_sec: settings.heartbeat_delay_allowance(),
            ..HealthCheckConfig::default()
        });
        let primary_group = settings.master_scaling_group_name()?.to_string();
        let self_health = self
            .platform
            .get_health_check_record(&self_vm.vm_id)
            .await?;

        // An out-of-sync reporter only gets the recovery classification and
        // an empty reply; everything else absorbs without mutation.
        if let Some(record) = &self_health {
            if !record.is_participating() {
                let mut updated = record.clone();
                let result = engine.classify(&mut updated, t_now);
                if &updated != record {
                    self.platform.update_health_check_record(&updated).await?;
                }
                debug!(vm_id = %self_vm.vm_id, %result, "out-of-sync reporter");
                return Ok(self.proxy.format_response(200, String::new(), false));
            }
        }

        let primary_record = self.platform.get_primary_record().await?;
        let self_unhealthy = self_health.as_ref().map(|h| !h.healthy).unwrap_or(false);

        // The primary reporting about itself reads its own monitor record;
        // monitor rows are keyed by vm id, so the adoption is the identity.
        let primary_settled_healthy = match &primary_record {
            Some(record) if record.is_done() => self
                .platform
                .get_health_check_record(&record.vm_id)
                .await?
                .map(|h| engine.judge_healthy(&h, t_now))
                .unwrap_or(true),
            _ => false,
        };

        let mut lifecycle_should_abandon = false;
        let mut election_outcome = None;

        if self_unhealthy {
            debug!(vm_id = %self_vm.vm_id, "unhealthy reporter skips the election check");
        } else if !primary_settled_healthy {
            let runner = ElectionRunner::new(
                self.platform.clone(),
                self.proxy.clone(),
                engine,
                ElectionConfig {
                    primary_scaling_group: primary_group.clone(),
                    election_timeout_sec: settings.master_election_timeout(),
                    no_wait: settings.master_election_no_wait(),
                },
            );
            match runner.run(&self_vm).await {
                Ok(ElectionOutcome::TimedOut) => {
                    // Out of time without a verdict: leave the cluster so the
                    // scaling group replaces this VM with a fresh one.
                    warn!(vm_id = %self_vm.vm_id, "election timed out; removing reporter");
                    self.platform
                        .delete_health_check_record(&self_vm.vm_id)
                        .await?;
                    self.platform.delete_vm(&self_vm).await?;
                    return Err(AutoscaleError::ElectionTimeout {
                        vm_id: self_vm.vm_id.clone(),
                    });
                }
                Ok(outcome) => election_outcome = Some(outcome),
                Err(AutoscaleError::LifecycleAbandon { vm_id }) => {
                    warn!(%vm_id, "vote finalization failed; bootstrap will be abandoned");
                    lifecycle_should_abandon = true;
                }
                Err(err) => return Err(err),
            }
        }

        let self_is_new_primary = matches!(
            &election_outcome,
            Some(ElectionOutcome::Elected(record)) if record.names(&self_vm)
        );
        let master_ip = match (&election_outcome, &primary_record) {
            (Some(ElectionOutcome::Elected(record)), _) => record.ip.clone(),
            (Some(ElectionOutcome::Follower(record)), _) => record.ip.clone(),
            // A vote still pending under no-wait reports no primary yet
            (Some(ElectionOutcome::Pending(_)), _) => String::new(),
            (Some(ElectionOutcome::NoPrimary), _) => String::new(),
            (None, Some(record)) if record.is_done() && primary_settled_healthy => {
                record.ip.clone()
            }
            _ => String::new(),
        };

        match self_health {
            None => {
                self.insert_first_record(
                    info,
                    settings,
                    &self_vm,
                    &master_ip,
                    self_is_new_primary,
                    lifecycle_should_abandon,
                    t_now,
                )
                .await
            }
            Some(record) if record.healthy => {
                self.refresh_record(info, &engine, &self_vm, record, &master_ip, t_now)
                    .await
            }
            Some(record) => self.evict(&self_vm, record).await,
        }
    }

    /// First heartbeat: complete the bootstrap lifecycle action and insert
    /// the monitor record
    #[allow(clippy::too_many_arguments)]
    async fn insert_first_record(
        &self,
        info: &RequestInfo,
        settings: &mut SettingsRegistry,
        self_vm: &VirtualMachine,
        master_ip: &str,
        self_is_new_primary: bool,
        lifecycle_should_abandon: bool,
        t_now: u64,
    ) -> Result<ProxyResponse> {
        self.platform
            .complete_lifecycle_action(
                &self_vm.vm_id,
                BOOTSTRAP_LIFECYCLE_ACTION,
                lifecycle_should_abandon,
            )
            .await?;

        let interval = match info.heartbeat_interval {
            HeartbeatInterval::Seconds(seconds) if seconds > 0 => seconds,
            _ => settings.heartbeat_interval(),
        };
        let record = HealthCheckRecord::first_heartbeat(
            &self_vm.vm_id,
            &self_vm.scaling_group_name,
            &self_vm.primary_private_ip,
            master_ip,
            interval,
            t_now,
        );
        match self.platform.create_health_check_record(&record).await {
            Ok(()) => info!(vm_id = %self_vm.vm_id, "monitor record inserted"),
            Err(err) if err.is_race_lost() => {
                // Duplicate delivery of the first heartbeat
                debug!(vm_id = %self_vm.vm_id, "monitor record already present");
            }
            Err(err) => return Err(err),
        }

        if self_is_new_primary {
            settings
                .save(
                    self.platform.as_ref(),
                    SettingKey::FortigateDefaultPassword,
                    &self_vm.vm_id,
                )
                .await?;
        }

        let body = if !self_is_new_primary && !master_ip.is_empty() {
            json!({ "master-ip": master_ip }).to_string()
        } else {
            String::new()
        };
        Ok(self.proxy.format_response(200, body, false))
    }

    /// Subsequent heartbeat from a healthy reporter: classify and persist
    async fn refresh_record(
        &self,
        info: &RequestInfo,
        engine: &HealthCheckEngine,
        self_vm: &VirtualMachine,
        mut record: HealthCheckRecord,
        master_ip: &str,
        t_now: u64,
    ) -> Result<ProxyResponse> {
        if let HeartbeatInterval::Seconds(seconds) = info.heartbeat_interval {
            if seconds > 0 {
                record.heartbeat_interval = seconds;
            }
        }

        let result = engine.classify(&mut record, t_now);
        if result == HealthCheckResult::Dropped {
            self.platform.update_health_check_record(&record).await?;
            info!(vm_id = %self_vm.vm_id, "loss budget exhausted; directing shutdown");
            self.platform.delete_vm(self_vm).await?;
            return Ok(self.proxy.format_response(
                200,
                json!({ "action": "shutdown" }).to_string(),
                false,
            ));
        }

        let ip_changed = record.primary_ip != master_ip;
        let notify = ip_changed && !master_ip.is_empty();
        if ip_changed {
            record.primary_ip = master_ip.to_string();
        }
        self.platform.update_health_check_record(&record).await?;
        debug!(vm_id = %self_vm.vm_id, %result, seq = record.seq, "heartbeat recorded");

        let body = if notify {
            json!({ "master-ip": master_ip }).to_string()
        } else {
            String::new()
        };
        Ok(self.proxy.format_response(200, body, false))
    }

    /// Reporter known unhealthy but still in-sync: evict it
    async fn evict(
        &self,
        self_vm: &VirtualMachine,
        mut record: HealthCheckRecord,
    ) -> Result<ProxyResponse> {
        if record.is_participating() {
            record.sync_state = SyncState::OutOfSync;
            record.sync_recovery_count = 0;
            self.platform.update_health_check_record(&record).await?;
            info!(vm_id = %self_vm.vm_id, "unhealthy reporter left the cluster; terminating");
            self.platform.delete_vm(self_vm).await?;
        }
        Ok(self.proxy.format_response(
            200,
            json!({ "action": "shutdown" }).to_string(),
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscale_core::SettingKey;
    use autoscale_platform::{MemoryPlatformAdapter, StaticProxy};

    fn seeded_platform() -> MemoryPlatformAdapter {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_setting(SettingKey::DeploymentSettingsSaved, "true");
        platform.seed_setting(SettingKey::MasterScalingGroupName, "byol");
        platform.seed_setting(SettingKey::ByolScalingGroupName, "byol");
        platform.seed_setting(SettingKey::PaygScalingGroupName, "payg");
        platform.seed_setting(SettingKey::HeartbeatInterval, "30");
        platform
    }

    fn vm(id: &str, group: &str, ip: &str) -> VirtualMachine {
        VirtualMachine {
            vm_id: id.to_string(),
            scaling_group_name: group.to_string(),
            primary_private_ip: ip.to_string(),
            primary_public_ip: None,
            virtual_network_id: "vnet-1".to_string(),
            subnet_id: "subnet-1".to_string(),
        }
    }

    fn heartbeat(vm_id: &str) -> RequestInfo {
        RequestInfo {
            vm_id: vm_id.to_string(),
            heartbeat_interval: HeartbeatInterval::Seconds(30),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_vm_is_unauthorized() {
        let platform = seeded_platform();
        let proxy = Arc::new(StaticProxy::new(0, 300_000));
        let orchestrator = HeartbeatOrchestrator::new(Arc::new(platform.clone()), proxy);

        let mut settings = SettingsRegistry::load(&platform).await.unwrap();
        let err = orchestrator
            .handle(&heartbeat("i-ghost"), &mut settings)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn test_vpc_mismatch_is_unauthorized() {
        let platform = seeded_platform();
        platform.seed_setting(SettingKey::VpcId, "vnet-expected");
        platform.seed_vm(vm("i-a", "byol", "10.0.0.4"));
        let proxy = Arc::new(StaticProxy::new(0, 300_000));
        let orchestrator = HeartbeatOrchestrator::new(Arc::new(platform.clone()), proxy);

        let mut settings = SettingsRegistry::load(&platform).await.unwrap();
        let err = orchestrator
            .handle(&heartbeat("i-a"), &mut settings)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn test_out_of_sync_reporter_gets_empty_reply() {
        let platform = seeded_platform();
        platform.seed_vm(vm("i-a", "byol", "10.0.0.4"));
        let mut record =
            HealthCheckRecord::first_heartbeat("i-a", "byol", "10.0.0.4", "", 30, 0);
        record.sync_state = SyncState::OutOfSync;
        record.healthy = false;
        platform.create_health_check_record(&record).await.unwrap();

        let proxy = Arc::new(StaticProxy::new(500_000, 300_000));
        let orchestrator = HeartbeatOrchestrator::new(Arc::new(platform.clone()), proxy);
        let mut settings = SettingsRegistry::load(&platform).await.unwrap();
        let response = orchestrator
            .handle(&heartbeat("i-a"), &mut settings)
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_empty_body());
        // Late arrival: the record absorbed the heartbeat untouched
        assert_eq!(platform.health_record_now("i-a").unwrap(), record);
    }
}
