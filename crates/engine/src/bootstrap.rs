//! Bootstrap strategy seam.
//!
//! The control plane never renders device configuration itself; it hands the
//! resolved cluster context to an injected strategy and returns whatever
//! configuration text the strategy produces.

use async_trait::async_trait;
use autoscale_core::{Result, VirtualMachine};

/// Everything the strategy needs to render a configuration
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    /// The VM being bootstrapped
    pub vm: VirtualMachine,
    /// Whether this VM holds the primary role
    pub is_primary: bool,
    /// Private IP of the primary to follow; empty when none is settled
    pub primary_ip: String,
    /// A vote was still pending under no-wait; the device boots standalone
    /// and learns the primary from a later heartbeat reply
    pub allow_no_primary: bool,
    pub psk_secret: String,
    pub sync_interface: String,
    pub traffic_port: u64,
    pub admin_port: u64,
    /// License content to embed, for BYOL VMs under hybrid licensing
    pub license_content: Option<String>,
}

/// Produces the final configuration string for a bootstrapping VM
#[async_trait]
pub trait BootstrapStrategy: Send + Sync {
    async fn load_config(&self, ctx: &BootstrapContext) -> Result<String>;
}
