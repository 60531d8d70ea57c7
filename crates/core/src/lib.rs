//! Autoscale Core Module
//!
//! This crate provides the shared data model for the autoscale control plane:
//! VM identity, health check records, the primary election record, license
//! pool records, configuration items, and the common error taxonomy.
//!
//! ## Components
//!
//! - **Vm**: VM identity and lookup descriptors
//! - **Health**: per-VM heartbeat health records and classification tags
//! - **Election**: the singleton primary record and its vote states
//! - **License**: license file, stock and usage records
//! - **Settings**: recognized configuration keys and setting items
//! - **Error**: the control-plane error taxonomy

pub mod election;
pub mod error;
pub mod health;
pub mod license;
pub mod settings;
pub mod vm;

// Re-export main types
pub use election::{PrimaryRecord, VoteState};
pub use error::{AutoscaleError, Result};
pub use health::{HealthCheckRecord, HealthCheckResult, SyncState};
pub use license::{AssignedLicense, LicenseFile, LicenseStockRecord, LicenseUsageRecord};
pub use settings::{SettingItem, SettingKey};
pub use vm::{VirtualMachine, VmDescriptor};
