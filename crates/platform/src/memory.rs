//! In-memory reference adapter.
//!
//! Backs every logical table with a `parking_lot::RwLock`-guarded map and
//! implements the exact conditional-write contracts of `PlatformAdapter`.
//! The test suites across the workspace drive the engines against this
//! adapter; cloud ports mirror its semantics against their KV stores.

use crate::adapter::PlatformAdapter;
use crate::proxy::ProxyAdapter;
use crate::request::{LifecycleTransition, ReqType, RequestInfo, ServiceRequest};
use async_trait::async_trait;
use autoscale_core::{
    AutoscaleError, HealthCheckRecord, LicenseFile, LicenseStockRecord, LicenseUsageRecord,
    PrimaryRecord, Result, SettingItem, SettingKey, VirtualMachine, VmDescriptor,
};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One completed lifecycle action, journaled for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleCompletion {
    pub vm_id: String,
    pub action: String,
    pub abandon: bool,
}

#[derive(Default)]
struct Tables {
    settings: HashMap<String, SettingItem>,
    vms: HashMap<String, VirtualMachine>,
    health: HashMap<String, HealthCheckRecord>,
    primary: Option<PrimaryRecord>,
    stock: HashMap<String, LicenseStockRecord>,
    usage: HashMap<String, LicenseUsageRecord>,
    blobs: HashMap<String, String>,
    terminated: Vec<String>,
    lifecycle_journal: Vec<LifecycleCompletion>,
}

/// In-process platform with linearizable conditional writes
#[derive(Default, Clone)]
pub struct MemoryPlatformAdapter {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryPlatformAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a VM in the fleet inventory
    pub fn seed_vm(&self, vm: VirtualMachine) {
        self.tables.write().vms.insert(vm.vm_id.clone(), vm);
    }

    /// Writes a settings row directly
    pub fn seed_setting(&self, key: SettingKey, value: impl Into<String>) {
        let item = SettingItem::new(key, value);
        self.tables.write().settings.insert(item.key.clone(), item);
    }

    /// Stores a license blob and returns its sha256 checksum
    pub fn seed_license_blob(
        &self,
        container: &str,
        blob_key: &str,
        content: impl Into<String>,
    ) -> String {
        let content = content.into();
        let checksum = sha256_hex(content.as_bytes());
        self.tables
            .write()
            .blobs
            .insert(blob_path(container, blob_key), content);
        checksum
    }

    /// Snapshot of the primary record for assertions
    pub fn primary_record_now(&self) -> Option<PrimaryRecord> {
        self.tables.read().primary.clone()
    }

    /// Snapshot of one health record for assertions
    pub fn health_record_now(&self, vm_id: &str) -> Option<HealthCheckRecord> {
        self.tables.read().health.get(vm_id).cloned()
    }

    /// Snapshot of one usage row for assertions
    pub fn usage_record_now(&self, vm_id: &str) -> Option<LicenseUsageRecord> {
        self.tables.read().usage.get(vm_id).cloned()
    }

    /// VM ids passed to `delete_vm`, in order
    pub fn terminated_vms(&self) -> Vec<String> {
        self.tables.read().terminated.clone()
    }

    /// Completed lifecycle actions, in order
    pub fn lifecycle_journal(&self) -> Vec<LifecycleCompletion> {
        self.tables.read().lifecycle_journal.clone()
    }

    /// Snapshot of one settings row for assertions
    pub fn setting_now(&self, key: SettingKey) -> Option<String> {
        self.tables
            .read()
            .settings
            .get(key.as_str())
            .map(|item| item.value.clone())
    }
}

fn blob_path(container: &str, blob_key: &str) -> String {
    format!("{}/{}", container, blob_key)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl PlatformAdapter for MemoryPlatformAdapter {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn request_type(&self, req: &ServiceRequest) -> ReqType {
        match req {
            ServiceRequest::Lifecycle { transition, .. } => match transition {
                LifecycleTransition::Launching => ReqType::LaunchingVm,
                LifecycleTransition::Launched => ReqType::LaunchedVm,
                LifecycleTransition::Terminating => ReqType::TerminatingVm,
                LifecycleTransition::Terminated => ReqType::TerminatedVm,
            },
            ServiceRequest::Api { path, body, .. } => {
                if body.contains("\"status\"") {
                    return ReqType::StatusMessage;
                }
                if path.ends_with("/byol-license") {
                    return ReqType::ServiceForwarding;
                }
                if path.ends_with("/get-config") {
                    return ReqType::BootstrapConfig;
                }
                if body.contains("\"instance-id\"") {
                    return ReqType::HeartbeatSync;
                }
                ReqType::Unknown
            }
        }
    }

    fn request_info(&self, req: &ServiceRequest) -> Result<RequestInfo> {
        match req {
            ServiceRequest::Api { body, .. } => RequestInfo::from_api_body(body),
            ServiceRequest::Lifecycle { vm_id, .. } => Ok(RequestInfo::from_lifecycle(vm_id)),
        }
    }

    async fn describe_vm(&self, desc: &VmDescriptor) -> Result<Option<VirtualMachine>> {
        let tables = self.tables.read();
        Ok(tables.vms.values().find(|vm| desc.matches(vm)).cloned())
    }

    async fn get_settings(&self) -> Result<Vec<SettingItem>> {
        Ok(self.tables.read().settings.values().cloned().collect())
    }

    async fn set_setting_item(&self, item: &SettingItem) -> Result<()> {
        self.tables
            .write()
            .settings
            .insert(item.key.clone(), item.clone());
        Ok(())
    }

    async fn get_health_check_record(&self, vm_id: &str) -> Result<Option<HealthCheckRecord>> {
        Ok(self.tables.read().health.get(vm_id).cloned())
    }

    async fn create_health_check_record(&self, record: &HealthCheckRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.health.contains_key(&record.vm_id) {
            return Err(AutoscaleError::race_lost("health"));
        }
        tables.health.insert(record.vm_id.clone(), record.clone());
        Ok(())
    }

    async fn update_health_check_record(&self, record: &HealthCheckRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.health.contains_key(&record.vm_id) {
            return Err(AutoscaleError::not_found("health", &record.vm_id));
        }
        tables.health.insert(record.vm_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_health_check_record(&self, vm_id: &str) -> Result<()> {
        self.tables.write().health.remove(vm_id);
        Ok(())
    }

    async fn get_primary_record(&self) -> Result<Option<PrimaryRecord>> {
        Ok(self.tables.read().primary.clone())
    }

    async fn create_primary_record(
        &self,
        new: &PrimaryRecord,
        expected: Option<&PrimaryRecord>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let matches = match (&tables.primary, expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.id == expected.id,
            _ => false,
        };
        if !matches {
            return Err(AutoscaleError::race_lost("primary"));
        }
        debug!(vm_id = %new.vm_id, "primary record created");
        tables.primary = Some(new.clone());
        Ok(())
    }

    async fn update_primary_record(&self, record: &PrimaryRecord) -> Result<()> {
        let mut tables = self.tables.write();
        match &tables.primary {
            Some(current) if current.id == record.id => {
                tables.primary = Some(record.clone());
                Ok(())
            }
            Some(_) => Err(AutoscaleError::race_lost("primary")),
            None => Err(AutoscaleError::not_found("primary", &record.id)),
        }
    }

    async fn delete_primary_record(&self, expected: &PrimaryRecord) -> Result<()> {
        let mut tables = self.tables.write();
        match &tables.primary {
            Some(current) if current.id == expected.id => {
                tables.primary = None;
                Ok(())
            }
            _ => Err(AutoscaleError::race_lost("primary")),
        }
    }

    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<()> {
        let mut tables = self.tables.write();
        tables.vms.remove(&vm.vm_id);
        tables.terminated.push(vm.vm_id.clone());
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        vm_id: &str,
        action: &str,
        abandon: bool,
    ) -> Result<()> {
        self.tables.write().lifecycle_journal.push(LifecycleCompletion {
            vm_id: vm_id.to_string(),
            action: action.to_string(),
            abandon,
        });
        Ok(())
    }

    async fn list_license_files(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<LicenseFile>> {
        let dir = blob_path(container, prefix);
        let tables = self.tables.read();
        let mut files: Vec<LicenseFile> = tables
            .blobs
            .iter()
            .filter(|(path, _)| path.starts_with(&dir))
            .map(|(path, content)| {
                let blob_key = path
                    .strip_prefix(&format!("{}/", container))
                    .unwrap_or(path)
                    .to_string();
                let file_name = blob_key
                    .rsplit('/')
                    .next()
                    .unwrap_or(blob_key.as_str())
                    .to_string();
                LicenseFile {
                    file_name,
                    checksum: sha256_hex(content.as_bytes()),
                    algorithm: "sha256".to_string(),
                    blob_key,
                    content: None,
                }
            })
            .collect();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    async fn load_license_file_content(&self, container: &str, blob_key: &str) -> Result<String> {
        self.tables
            .read()
            .blobs
            .get(&blob_path(container, blob_key))
            .cloned()
            .ok_or_else(|| AutoscaleError::not_found("blob", blob_key))
    }

    async fn list_license_stock(&self, product: &str) -> Result<Vec<LicenseStockRecord>> {
        Ok(self
            .tables
            .read()
            .stock
            .values()
            .filter(|rec| rec.product_name == product)
            .cloned()
            .collect())
    }

    async fn list_license_usage(&self, product: &str) -> Result<Vec<LicenseUsageRecord>> {
        Ok(self
            .tables
            .read()
            .usage
            .values()
            .filter(|rec| rec.product_name == product)
            .cloned()
            .collect())
    }

    async fn update_license_stock(
        &self,
        put: &[LicenseStockRecord],
        delete: &[String],
    ) -> Result<()> {
        let mut tables = self.tables.write();
        for record in put {
            tables.stock.insert(record.checksum.clone(), record.clone());
        }
        for checksum in delete {
            tables.stock.remove(checksum);
        }
        Ok(())
    }

    async fn insert_license_usage(&self, record: &LicenseUsageRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.usage.contains_key(&record.vm_id) {
            return Err(AutoscaleError::race_lost("license-usage"));
        }
        tables.usage.insert(record.vm_id.clone(), record.clone());
        Ok(())
    }

    async fn replace_license_usage(
        &self,
        expected: &LicenseUsageRecord,
        new: &LicenseUsageRecord,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let holder_matches = tables
            .usage
            .get(&expected.vm_id)
            .map(|current| current.checksum == expected.checksum)
            .unwrap_or(false);
        if !holder_matches {
            return Err(AutoscaleError::race_lost("license-usage"));
        }
        tables.usage.remove(&expected.vm_id);
        tables.usage.insert(new.vm_id.clone(), new.clone());
        Ok(())
    }

    async fn update_license_usage(&self, record: &LicenseUsageRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.usage.contains_key(&record.vm_id) {
            return Err(AutoscaleError::not_found("license-usage", &record.vm_id));
        }
        tables.usage.insert(record.vm_id.clone(), record.clone());
        Ok(())
    }
}

/// Proxy with a settable clock and countdown, for deterministic tests
pub struct StaticProxy {
    now_ms: AtomicU64,
    remaining_ms: AtomicU64,
}

impl StaticProxy {
    pub fn new(now_ms: u64, remaining_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            remaining_ms: AtomicU64::new(remaining_ms),
        }
    }

    /// Moves the wall clock forward
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_now(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn set_remaining(&self, remaining_ms: u64) {
        self.remaining_ms.store(remaining_ms, Ordering::SeqCst);
    }
}

impl ProxyAdapter for StaticProxy {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn remaining_execution_time_ms(&self) -> u64 {
        self.remaining_ms.load(Ordering::SeqCst)
    }
}
