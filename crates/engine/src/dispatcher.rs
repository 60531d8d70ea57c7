//! Top-level request dispatcher.
//!
//! Routes a classified request to its handler and maps every surfaced error
//! onto the wire status the device understands: 403 for identity failures,
//! 500 with a JSON diagnostic for everything else. Dispatch refuses to run
//! until the deployment has saved its settings.

use crate::bootstrap::{BootstrapContext, BootstrapStrategy};
use crate::election::{ElectionConfig, ElectionOutcome, ElectionRunner};
use crate::health::{HealthCheckConfig, HealthCheckEngine};
use crate::heartbeat::{find_reporting_vm, HeartbeatOrchestrator};
use crate::licensing::{LicenseConfig, LicenseStrategy};
use crate::settings::SettingsRegistry;
use autoscale_core::{AutoscaleError, Result, SettingKey, SyncState};
use autoscale_platform::{PlatformAdapter, ProxyAdapter, ProxyResponse, ReqType, ServiceRequest};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Product the license pool is managed for
const LICENSE_PRODUCT: &str = "fortigate";

/// Request handler wiring the engines to the injected adapters
pub struct AutoscaleHandler {
    platform: Arc<dyn PlatformAdapter>,
    proxy: Arc<dyn ProxyAdapter>,
    bootstrap: Arc<dyn BootstrapStrategy>,
}

impl AutoscaleHandler {
    pub fn new(
        platform: Arc<dyn PlatformAdapter>,
        proxy: Arc<dyn ProxyAdapter>,
        bootstrap: Arc<dyn BootstrapStrategy>,
    ) -> Self {
        Self {
            platform,
            proxy,
            bootstrap,
        }
    }

    /// Handles one request end to end; never returns an error
    pub async fn handle(&self, req: &ServiceRequest) -> ProxyResponse {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "request failed");
                let body = json!({ "message": err.to_string() }).to_string();
                self.proxy.format_response(err.http_status(), body, false)
            }
        }
    }

    async fn dispatch(&self, req: &ServiceRequest) -> Result<ProxyResponse> {
        self.platform.init().await?;

        let mut settings = SettingsRegistry::load(self.platform.as_ref()).await?;
        if !settings.deployment_settings_saved() {
            return Err(AutoscaleError::ConfigurationMissing {
                key: SettingKey::DeploymentSettingsSaved.as_str().to_string(),
            });
        }

        let req_type = self.platform.request_type(req);
        info!(%req_type, "dispatching request");
        match req_type {
            ReqType::LaunchingVm => self.on_launching(req).await,
            ReqType::LaunchedVm => self.on_launched(req).await,
            ReqType::BootstrapConfig => self.on_bootstrap(req, &settings).await,
            ReqType::HeartbeatSync => {
                let info = self.platform.request_info(req)?;
                HeartbeatOrchestrator::new(self.platform.clone(), self.proxy.clone())
                    .handle(&info, &mut settings)
                    .await
            }
            ReqType::StatusMessage => {
                let info = self.platform.request_info(req)?;
                debug!(vm_id = %info.vm_id, status = ?info.status, "status message accepted");
                Ok(self.ok_empty())
            }
            ReqType::ServiceForwarding => self.on_license(req, &settings).await,
            ReqType::TerminatingVm => self.on_terminating(req).await,
            ReqType::TerminatedVm => self.on_terminated(req).await,
            ReqType::Unknown => Err(AutoscaleError::Platform {
                operation: "dispatch".to_string(),
                reason: "unrecognized request".to_string(),
            }),
        }
    }

    fn ok_empty(&self) -> ProxyResponse {
        self.proxy.format_response(200, String::new(), false)
    }

    /// Platform-defined hook; nothing to do in the core
    async fn on_launching(&self, req: &ServiceRequest) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;
        info!(vm_id = %info.vm_id, "VM launching");
        Ok(self.ok_empty())
    }

    /// A launched VM joins the fleet passively; no election here
    async fn on_launched(&self, req: &ServiceRequest) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;
        info!(vm_id = %info.vm_id, "VM joined the fleet");
        Ok(self.ok_empty())
    }

    /// Bootstrap: election first, then the configuration blob
    async fn on_bootstrap(
        &self,
        req: &ServiceRequest,
        settings: &SettingsRegistry,
    ) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;
        let self_vm = find_reporting_vm(self.platform.as_ref(), settings, &info.vm_id).await?;

        let engine = HealthCheckEngine::new(HealthCheckConfig {
            max_loss_count: settings.heartbeat_loss_count(),
            delay_allowance_sec: settings.heartbeat_delay_allowance(),
            ..HealthCheckConfig::default()
        });
        let runner = ElectionRunner::new(
            self.platform.clone(),
            self.proxy.clone(),
            engine,
            ElectionConfig {
                primary_scaling_group: settings.master_scaling_group_name()?.to_string(),
                election_timeout_sec: settings.master_election_timeout(),
                no_wait: settings.master_election_no_wait(),
            },
        );

        let mut allow_no_primary = false;
        let (is_primary, primary_ip) = match runner.run(&self_vm).await {
            Ok(ElectionOutcome::Elected(record)) => (true, record.ip),
            Ok(ElectionOutcome::Follower(record)) => (false, record.ip),
            Ok(ElectionOutcome::Pending(_)) | Ok(ElectionOutcome::NoPrimary) => {
                allow_no_primary = true;
                (false, String::new())
            }
            Ok(ElectionOutcome::TimedOut) => {
                return Err(AutoscaleError::ElectionTimeout {
                    vm_id: self_vm.vm_id.clone(),
                })
            }
            Err(AutoscaleError::LifecycleAbandon { vm_id }) => {
                // This VM won but could not seat itself; abandon the hook and
                // let it boot standalone
                warn!(%vm_id, "finalize failed during bootstrap");
                self.platform
                    .complete_lifecycle_action(&vm_id, "get-config", true)
                    .await?;
                allow_no_primary = true;
                (false, String::new())
            }
            Err(err) => return Err(err),
        };

        let license_content = if self.needs_license(settings, &self_vm.scaling_group_name) {
            let config = LicenseConfig::from_settings(settings, LICENSE_PRODUCT)?;
            let assigned = LicenseStrategy::new(self.platform.clone(), self.proxy.clone())
                .assign(&config, &self_vm.vm_id)
                .await?;
            Some(assigned.content)
        } else {
            None
        };
        let secret = license_content.is_some();

        let ctx = BootstrapContext {
            vm: self_vm,
            is_primary,
            primary_ip,
            allow_no_primary,
            psk_secret: settings.fortigate_psk_secret().to_string(),
            sync_interface: settings.fortigate_sync_interface().to_string(),
            traffic_port: settings.fortigate_traffic_port(),
            admin_port: settings.fortigate_admin_port(),
            license_content,
        };
        let config_text = self.bootstrap.load_config(&ctx).await?;
        Ok(self.proxy.format_response(200, config_text, secret))
    }

    fn needs_license(&self, settings: &SettingsRegistry, scaling_group: &str) -> bool {
        settings.enable_hybrid_licensing()
            && settings
                .byol_scaling_group_name()
                .map(|group| group == scaling_group)
                .unwrap_or(false)
    }

    /// License retrieval for the calling VM; the body is marked secret
    async fn on_license(
        &self,
        req: &ServiceRequest,
        settings: &SettingsRegistry,
    ) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;
        let self_vm = find_reporting_vm(self.platform.as_ref(), settings, &info.vm_id).await?;

        let config = LicenseConfig::from_settings(settings, LICENSE_PRODUCT)?;
        let assigned = LicenseStrategy::new(self.platform.clone(), self.proxy.clone())
            .assign(&config, &self_vm.vm_id)
            .await?;
        info!(vm_id = %self_vm.vm_id, file = %assigned.file_name, "license delivered");
        Ok(self.proxy.format_response(200, assigned.content, true))
    }

    /// Departing VM: leave the cluster, clear its state, release the primary
    /// role if it held one
    async fn on_terminating(&self, req: &ServiceRequest) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;

        if let Some(mut record) = self
            .platform
            .get_health_check_record(&info.vm_id)
            .await?
        {
            if record.is_participating() {
                record.sync_state = SyncState::OutOfSync;
                record.healthy = false;
                self.platform.update_health_check_record(&record).await?;
            }
        }
        self.cleanup_fleet_state(&info.vm_id).await?;
        self.platform
            .complete_lifecycle_action(&info.vm_id, "terminating", false)
            .await?;
        info!(vm_id = %info.vm_id, "VM terminating; fleet state cleared");
        Ok(self.ok_empty())
    }

    /// Teardown finalization; every step tolerates absence
    async fn on_terminated(&self, req: &ServiceRequest) -> Result<ProxyResponse> {
        let info = self.platform.request_info(req)?;
        self.cleanup_fleet_state(&info.vm_id).await?;
        self.platform
            .complete_lifecycle_action(&info.vm_id, "terminated", false)
            .await?;
        info!(vm_id = %info.vm_id, "VM teardown finalized");
        Ok(self.ok_empty())
    }

    async fn cleanup_fleet_state(&self, vm_id: &str) -> Result<()> {
        self.platform.delete_health_check_record(vm_id).await?;

        if let Some(record) = self.platform.get_primary_record().await? {
            if record.vm_id == vm_id {
                match self.platform.delete_primary_record(&record).await {
                    Ok(()) => info!(%vm_id, "primary record purged for departing VM"),
                    Err(err) if err.is_race_lost() => {
                        debug!(%vm_id, "primary record already replaced")
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}
