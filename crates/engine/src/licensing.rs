//! License pool assignment.
//!
//! Reconciles the stock table against the blob inventory, then hands the
//! requesting VM a license: its own previous assignment when one exists, an
//! unused license otherwise, or a recycled one taken from a holder that left
//! the cluster. Conditional inserts on the usage table (unique vm id)
//! serialize concurrent assignment; race losers re-list and retry while
//! execution time remains.

use crate::election::EXECUTION_TIME_RESERVE_MS;
use crate::settings::SettingsRegistry;
use autoscale_core::{
    AssignedLicense, AutoscaleError, LicenseFile, LicenseStockRecord, LicenseUsageRecord,
    Result,
};
use autoscale_platform::{PlatformAdapter, ProxyAdapter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Pause between usage-table race retries
pub const LICENSE_RETRY_BACKOFF_MS: u64 = 2000;

/// Pool coordinates resolved from the settings registry
#[derive(Debug, Clone)]
pub struct LicenseConfig {
    pub product_name: String,
    /// Blob container holding the license files
    pub container: String,
    /// Key prefix of the license directory within the container
    pub key_prefix: String,
    /// Seconds before an unseen holder's license may be recycled
    pub grace_period_sec: u64,
}

impl LicenseConfig {
    /// Builds the pool coordinates for a product from the settings table
    pub fn from_settings(settings: &SettingsRegistry, product_name: &str) -> Result<Self> {
        Ok(Self {
            product_name: product_name.to_string(),
            container: settings.asset_storage_name()?.to_string(),
            key_prefix: join_prefix(
                settings.asset_storage_key_prefix(),
                settings.license_storage_key_prefix(),
            ),
            grace_period_sec: settings.get_license_grace_period(),
        })
    }
}

fn join_prefix(base: &str, dir: &str) -> String {
    if base.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), dir)
    }
}

/// Reusable-license assignment strategy
pub struct LicenseStrategy {
    platform: Arc<dyn PlatformAdapter>,
    proxy: Arc<dyn ProxyAdapter>,
}

impl LicenseStrategy {
    pub fn new(platform: Arc<dyn PlatformAdapter>, proxy: Arc<dyn ProxyAdapter>) -> Self {
        Self { platform, proxy }
    }

    /// Returns the license assigned to `vm_id`, assigning one if necessary
    pub async fn assign(&self, config: &LicenseConfig, vm_id: &str) -> Result<AssignedLicense> {
        let (files, stock, usage) = tokio::join!(
            self.platform
                .list_license_files(&config.container, &config.key_prefix),
            self.platform.list_license_stock(&config.product_name),
            self.platform.list_license_usage(&config.product_name),
        );
        let files = files?;
        let stock = stock?;
        let mut usage = usage?;

        let files_by_checksum: HashMap<&str, &LicenseFile> = files
            .iter()
            .map(|file| (file.checksum.as_str(), file))
            .collect();
        self.reconcile_stock(config, &files, &stock, &files_by_checksum)
            .await?;

        loop {
            // Idempotent short-circuit: the VM already holds a live license
            if let Some(own) = usage.iter().find(|u| u.vm_id == vm_id) {
                if let Some(&file) = files_by_checksum.get(own.checksum.as_str()) {
                    debug!(%vm_id, checksum = %own.checksum, "returning existing assignment");
                    return self.fetch(config, file).await;
                }
                // The held checksum no longer exists in the pool; fall
                // through and replace the orphaned row with a live license.
                warn!(%vm_id, checksum = %own.checksum, "assignment is orphaned");
            }

            let t_now = self.proxy.now_ms();
            let used: HashSet<&str> = usage.iter().map(|u| u.checksum.as_str()).collect();
            let unused = files.iter().find(|file| !used.contains(file.checksum.as_str()));

            let attempt = match unused {
                Some(file) => {
                    let record = new_usage(config, vm_id, file, t_now);
                    let write = match usage.iter().find(|u| u.vm_id == vm_id) {
                        Some(orphan) => {
                            self.platform.replace_license_usage(orphan, &record).await
                        }
                        None => self.platform.insert_license_usage(&record).await,
                    };
                    write.map(|_| file)
                }
                None => {
                    match self
                        .find_recyclable(config, &mut usage, &files_by_checksum, t_now)
                        .await?
                    {
                        Some(holder) => match files_by_checksum.get(holder.checksum.as_str()) {
                            Some(&file) => {
                                info!(
                                    from = %holder.vm_id,
                                    to = %vm_id,
                                    checksum = %holder.checksum,
                                    "recycling license"
                                );
                                let record = new_usage(config, vm_id, file, t_now);
                                self.platform
                                    .replace_license_usage(&holder, &record)
                                    .await
                                    .map(|_| file)
                            }
                            None => {
                                return Err(AutoscaleError::LicenseExhausted {
                                    product: config.product_name.clone(),
                                })
                            }
                        },
                        None => {
                            return Err(AutoscaleError::LicenseExhausted {
                                product: config.product_name.clone(),
                            })
                        }
                    }
                }
            };

            match attempt {
                Ok(file) => return self.fetch(config, file).await,
                Err(err) if err.is_race_lost() => {
                    if self.proxy.remaining_execution_time_ms()
                        < EXECUTION_TIME_RESERVE_MS + LICENSE_RETRY_BACKOFF_MS
                    {
                        warn!(%vm_id, "license race retries out of execution time");
                        return Err(err);
                    }
                    debug!(%vm_id, "lost the usage-table race; re-listing");
                    sleep(Duration::from_millis(LICENSE_RETRY_BACKOFF_MS)).await;
                    usage = self
                        .platform
                        .list_license_usage(&config.product_name)
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Brings the stock table in line with the blob inventory
    async fn reconcile_stock(
        &self,
        config: &LicenseConfig,
        files: &[LicenseFile],
        stock: &[LicenseStockRecord],
        files_by_checksum: &HashMap<&str, &LicenseFile>,
    ) -> Result<()> {
        let stocked: HashSet<&str> = stock.iter().map(|rec| rec.checksum.as_str()).collect();
        let put: Vec<LicenseStockRecord> = files
            .iter()
            .filter(|file| !stocked.contains(file.checksum.as_str()))
            .map(|file| LicenseStockRecord::from_file(file, &config.product_name))
            .collect();
        let delete: Vec<String> = stock
            .iter()
            .filter(|rec| !files_by_checksum.contains_key(rec.checksum.as_str()))
            .map(|rec| rec.checksum.clone())
            .collect();

        if !put.is_empty() || !delete.is_empty() {
            info!(
                added = put.len(),
                removed = delete.len(),
                "license stock reconciled"
            );
            self.platform.update_license_stock(&put, &delete).await?;
        }
        Ok(())
    }

    /// Refreshes holders' cached membership and picks the first recyclable one
    ///
    /// A holder with no monitor record is recyclable only once the grace
    /// period since assignment has elapsed: it may still be bootstrapping.
    async fn find_recyclable(
        &self,
        config: &LicenseConfig,
        usage: &mut [LicenseUsageRecord],
        files_by_checksum: &HashMap<&str, &LicenseFile>,
        t_now: u64,
    ) -> Result<Option<LicenseUsageRecord>> {
        let grace_ms = config.grace_period_sec * 1000;
        for record in usage.iter_mut() {
            let in_sync = match self
                .platform
                .get_health_check_record(&record.vm_id)
                .await?
            {
                Some(health) => health.is_participating() && health.healthy,
                None => t_now < record.assigned_at + grace_ms,
            };
            if in_sync != record.vm_in_sync {
                record.vm_in_sync = in_sync;
                if let Err(err) = self.platform.update_license_usage(record).await {
                    debug!(vm_id = %record.vm_id, %err, "usage cache refresh failed");
                }
            }
        }
        Ok(usage
            .iter()
            .find(|rec| !rec.vm_in_sync && files_by_checksum.contains_key(rec.checksum.as_str()))
            .cloned())
    }

    async fn fetch(&self, config: &LicenseConfig, file: &LicenseFile) -> Result<AssignedLicense> {
        let content = match &file.content {
            Some(content) => content.clone(),
            None => {
                self.platform
                    .load_license_file_content(&config.container, &file.blob_key)
                    .await?
            }
        };
        Ok(AssignedLicense {
            checksum: file.checksum.clone(),
            file_name: file.file_name.clone(),
            content,
        })
    }
}

fn new_usage(
    config: &LicenseConfig,
    vm_id: &str,
    file: &LicenseFile,
    t_now: u64,
) -> LicenseUsageRecord {
    LicenseUsageRecord {
        vm_id: vm_id.to_string(),
        checksum: file.checksum.clone(),
        file_name: file.file_name.clone(),
        product_name: config.product_name.clone(),
        vm_in_sync: true,
        assigned_at: t_now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscale_core::{HealthCheckRecord, SyncState};
    use autoscale_platform::{MemoryPlatformAdapter, StaticProxy};

    const PRODUCT: &str = "fortigate";

    fn config() -> LicenseConfig {
        LicenseConfig {
            product_name: PRODUCT.to_string(),
            container: "assets".to_string(),
            key_prefix: "licenses".to_string(),
            grace_period_sec: 600,
        }
    }

    fn strategy(platform: &MemoryPlatformAdapter, proxy: StaticProxy) -> LicenseStrategy {
        LicenseStrategy::new(Arc::new(platform.clone()), Arc::new(proxy))
    }

    #[tokio::test]
    async fn test_fresh_assignment_and_stock_reconciliation() {
        let platform = MemoryPlatformAdapter::new();
        let checksum = platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");

        let assigned = strategy(&platform, StaticProxy::new(0, 300_000))
            .assign(&config(), "i-a")
            .await
            .unwrap();
        assert_eq!(assigned.checksum, checksum);
        assert_eq!(assigned.content, "ONE");

        // Stock was reconciled and the usage row written
        let stock = platform.list_license_stock(PRODUCT).await.unwrap();
        assert_eq!(stock.len(), 1);
        assert_eq!(platform.usage_record_now("i-a").unwrap().checksum, checksum);
    }

    #[tokio::test]
    async fn test_idempotent_re_request() {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");
        platform.seed_license_blob("assets", "licenses/fgt-2.lic", "TWO");

        let strategy = strategy(&platform, StaticProxy::new(0, 300_000));
        let first = strategy.assign(&config(), "i-a").await.unwrap();
        let second = strategy.assign(&config(), "i-a").await.unwrap();
        assert_eq!(first.checksum, second.checksum);

        let usage = platform.list_license_usage(PRODUCT).await.unwrap();
        assert_eq!(usage.len(), 1);
    }

    #[tokio::test]
    async fn test_recycles_out_of_sync_holder() {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");

        let strategy = strategy(&platform, StaticProxy::new(0, 300_000));
        let first = strategy.assign(&config(), "i-a").await.unwrap();

        // The holder leaves the cluster
        let mut health = HealthCheckRecord::first_heartbeat("i-a", "byol", "10.0.0.4", "", 30, 0);
        health.sync_state = SyncState::OutOfSync;
        health.healthy = false;
        platform.create_health_check_record(&health).await.unwrap();

        let recycled = strategy.assign(&config(), "i-b").await.unwrap();
        assert_eq!(recycled.checksum, first.checksum);
        assert!(platform.usage_record_now("i-a").is_none());
        assert_eq!(
            platform.usage_record_now("i-b").unwrap().checksum,
            first.checksum
        );
    }

    #[tokio::test]
    async fn test_grace_period_shields_unseen_holder() {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");

        // i-a holds the only license and has no monitor record yet
        let strategy_now = strategy(&platform, StaticProxy::new(0, 300_000));
        strategy_now.assign(&config(), "i-a").await.unwrap();

        let err = strategy_now.assign(&config(), "i-b").await.unwrap_err();
        assert_eq!(
            err,
            AutoscaleError::LicenseExhausted {
                product: PRODUCT.to_string()
            }
        );

        // Past the grace period the unseen holder is recyclable
        let strategy_later = strategy(&platform, StaticProxy::new(700_000, 300_000));
        let recycled = strategy_later.assign(&config(), "i-b").await.unwrap();
        assert_eq!(recycled.content, "ONE");
        assert!(platform.usage_record_now("i-a").is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_with_healthy_holders() {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");
        platform
            .create_health_check_record(&HealthCheckRecord::first_heartbeat(
                "i-a", "byol", "10.0.0.4", "", 30, 0,
            ))
            .await
            .unwrap();

        let strategy = strategy(&platform, StaticProxy::new(0, 300_000));
        strategy.assign(&config(), "i-a").await.unwrap();

        let err = strategy.assign(&config(), "i-b").await.unwrap_err();
        assert_eq!(
            err,
            AutoscaleError::LicenseExhausted {
                product: PRODUCT.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stale_stock_rows_are_removed() {
        let platform = MemoryPlatformAdapter::new();
        platform.seed_license_blob("assets", "licenses/fgt-1.lic", "ONE");
        platform
            .update_license_stock(
                &[LicenseStockRecord {
                    checksum: "gone".to_string(),
                    file_name: "fgt-0.lic".to_string(),
                    algorithm: "sha256".to_string(),
                    product_name: PRODUCT.to_string(),
                }],
                &[],
            )
            .await
            .unwrap();

        strategy(&platform, StaticProxy::new(0, 300_000))
            .assign(&config(), "i-a")
            .await
            .unwrap();

        let stock = platform.list_license_stock(PRODUCT).await.unwrap();
        assert_eq!(stock.len(), 1);
        assert_ne!(stock[0].checksum, "gone");
    }
}
