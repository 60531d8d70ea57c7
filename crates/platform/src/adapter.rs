//! Platform adapter: the cloud capability set.
//!
//! Every cloud interaction the control plane performs goes through this
//! trait: VM describe, the strongly-consistent KV tables, blob storage and
//! scaling-group actions. Implementations back the tables with a store
//! offering linearizable conditional writes; those conditional writes are
//! the only cross-handler ordering mechanism in the system.
//!
//! Failure policy: every method fails with a categorized `AutoscaleError`;
//! `RaceLost` is non-fatal and handled per component.

use crate::request::{ReqType, RequestInfo, ServiceRequest};
use async_trait::async_trait;
use autoscale_core::{
    HealthCheckRecord, LicenseFile, LicenseStockRecord, LicenseUsageRecord, PrimaryRecord,
    Result, SettingItem, VirtualMachine, VmDescriptor,
};

/// Cloud capability set consumed by the engines
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Prepares the adapter for a request; fails when the platform is unusable
    async fn init(&self) -> Result<()>;

    /// Classifies an incoming request
    fn request_type(&self, req: &ServiceRequest) -> ReqType;

    /// Extracts the normalized request fields
    fn request_info(&self, req: &ServiceRequest) -> Result<RequestInfo>;

    /// Resolves a VM by descriptor; `None` when no VM matches
    async fn describe_vm(&self, desc: &VmDescriptor) -> Result<Option<VirtualMachine>>;

    /// Fetches the full settings table
    async fn get_settings(&self) -> Result<Vec<SettingItem>>;

    /// Writes one settings row
    async fn set_setting_item(&self, item: &SettingItem) -> Result<()>;

    // --- Health table (unique vm id) ---

    async fn get_health_check_record(&self, vm_id: &str) -> Result<Option<HealthCheckRecord>>;

    /// Conditional create; fails with `RaceLost` when a record already exists
    async fn create_health_check_record(&self, record: &HealthCheckRecord) -> Result<()>;

    /// Replaces an existing record; fails with `RecordNotFound` when absent
    async fn update_health_check_record(&self, record: &HealthCheckRecord) -> Result<()>;

    /// Removes a record; absence is not an error
    async fn delete_health_check_record(&self, vm_id: &str) -> Result<()>;

    // --- Primary record (singleton, conditional on the id token) ---

    async fn get_primary_record(&self) -> Result<Option<PrimaryRecord>>;

    /// Conditional put keyed on `expected` (or absence when `None`);
    /// fails with `RaceLost` when the current record does not match
    async fn create_primary_record(
        &self,
        new: &PrimaryRecord,
        expected: Option<&PrimaryRecord>,
    ) -> Result<()>;

    /// Conditional update; the stored record must carry the same id token
    async fn update_primary_record(&self, record: &PrimaryRecord) -> Result<()>;

    /// Conditional delete; fails with `RaceLost` when the current record
    /// does not match `expected` (callers treat that as already purged)
    async fn delete_primary_record(&self, expected: &PrimaryRecord) -> Result<()>;

    // --- Scaling-group actions ---

    /// Terminates and deregisters a VM from its scaling group
    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<()>;

    /// Completes a pending lifecycle action, optionally abandoning it
    async fn complete_lifecycle_action(
        &self,
        vm_id: &str,
        action: &str,
        abandon: bool,
    ) -> Result<()> {
        let _ = (vm_id, action, abandon);
        Ok(())
    }

    // --- License I/O ---

    /// Lists license files under a blob directory, checksums included
    async fn list_license_files(&self, container: &str, prefix: &str)
        -> Result<Vec<LicenseFile>>;

    /// Fetches one license file's content
    async fn load_license_file_content(&self, container: &str, blob_key: &str) -> Result<String>;

    async fn list_license_stock(&self, product: &str) -> Result<Vec<LicenseStockRecord>>;

    async fn list_license_usage(&self, product: &str) -> Result<Vec<LicenseUsageRecord>>;

    /// Applies a stock reconciliation: upserts `put`, removes `delete` by checksum
    async fn update_license_stock(
        &self,
        put: &[LicenseStockRecord],
        delete: &[String],
    ) -> Result<()>;

    /// Conditional insert (unique vm id); fails with `RaceLost` when the VM
    /// already holds a license
    async fn insert_license_usage(&self, record: &LicenseUsageRecord) -> Result<()>;

    /// Conditional replace of a recycled assignment; fails with `RaceLost`
    /// when the observed holder row has changed
    async fn replace_license_usage(
        &self,
        expected: &LicenseUsageRecord,
        new: &LicenseUsageRecord,
    ) -> Result<()>;

    /// Refreshes a usage row in place (e.g. the cached `vm_in_sync` flag)
    async fn update_license_usage(&self, record: &LicenseUsageRecord) -> Result<()>;
}
