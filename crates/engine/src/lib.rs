//! Autoscale Engine Module
//!
//! This crate implements the control-plane logic of the autoscale cluster:
//! the typed settings registry, heartbeat health classification, the primary
//! election state machine, the per-request heartbeat sync orchestration,
//! license pool assignment and the top-level request dispatcher.
//!
//! ## Components
//!
//! - **Settings**: typed read-through view of the platform settings table
//! - **Health**: heartbeat window classification and health judgment
//! - **Election**: primary election over the singleton conditional record
//! - **Heartbeat**: the per-request sync orchestration for a reporting VM
//! - **Licensing**: reconciliation and assignment from the license pool
//! - **Dispatcher**: typed request routing and error-to-response mapping
//! - **Bootstrap**: the seam to the configuration-producing strategy

pub mod bootstrap;
pub mod dispatcher;
pub mod election;
pub mod health;
pub mod heartbeat;
pub mod licensing;
pub mod settings;

// Re-export main types
pub use bootstrap::{BootstrapContext, BootstrapStrategy};
pub use dispatcher::AutoscaleHandler;
pub use election::{ElectionConfig, ElectionDecision, ElectionOutcome, ElectionRunner};
pub use health::{HealthCheckConfig, HealthCheckEngine};
pub use heartbeat::HeartbeatOrchestrator;
pub use licensing::{LicenseConfig, LicenseStrategy};
pub use settings::SettingsRegistry;
