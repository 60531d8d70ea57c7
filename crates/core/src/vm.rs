//! VM identity types.
//!
//! A `VirtualMachine` is the platform's view of one fleet member. The record
//! is immutable for the lifetime of the VM; a re-launch produces a new vm id.

use serde::{Deserialize, Serialize};

/// Identity of a VM as seen by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Unique id within the fleet
    pub vm_id: String,
    /// Scaling group this VM belongs to
    pub scaling_group_name: String,
    /// Primary private IP address
    pub primary_private_ip: String,
    /// Primary public IP address, when one is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_public_ip: Option<String>,
    /// Virtual network (VPC) id
    pub virtual_network_id: String,
    /// Subnet id
    pub subnet_id: String,
}

impl VirtualMachine {
    /// Checks whether two platform records describe the same VM
    pub fn same_instance(&self, other: &VirtualMachine) -> bool {
        self.vm_id == other.vm_id && self.scaling_group_name == other.scaling_group_name
    }
}

/// Lookup selector for `describe_vm`
///
/// Either field may be omitted; the platform resolves the most specific
/// match. A descriptor with both fields set requires the VM to be in the
/// named scaling group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmDescriptor {
    pub vm_id: Option<String>,
    pub scaling_group_name: Option<String>,
}

impl VmDescriptor {
    /// Selects a VM by id across all scaling groups
    pub fn by_id(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: Some(vm_id.into()),
            scaling_group_name: None,
        }
    }

    /// Selects a VM by id within one scaling group
    pub fn in_group(vm_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            vm_id: Some(vm_id.into()),
            scaling_group_name: Some(group.into()),
        }
    }

    /// Checks whether a VM satisfies this selector
    pub fn matches(&self, vm: &VirtualMachine) -> bool {
        if let Some(id) = &self.vm_id {
            if id != &vm.vm_id {
                return false;
            }
        }
        if let Some(group) = &self.scaling_group_name {
            if group != &vm.scaling_group_name {
                return false;
            }
        }
        self.vm_id.is_some() || self.scaling_group_name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str, group: &str) -> VirtualMachine {
        VirtualMachine {
            vm_id: id.to_string(),
            scaling_group_name: group.to_string(),
            primary_private_ip: "10.0.0.4".to_string(),
            primary_public_ip: None,
            virtual_network_id: "vnet-1".to_string(),
            subnet_id: "subnet-1".to_string(),
        }
    }

    #[test]
    fn test_same_instance() {
        let a = vm("i-001", "byol");
        let b = vm("i-001", "byol");
        let c = vm("i-001", "payg");
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[test]
    fn test_descriptor_matching() {
        let target = vm("i-002", "payg");

        assert!(VmDescriptor::by_id("i-002").matches(&target));
        assert!(VmDescriptor::in_group("i-002", "payg").matches(&target));
        assert!(!VmDescriptor::in_group("i-002", "byol").matches(&target));
        // An empty descriptor selects nothing
        assert!(!VmDescriptor::default().matches(&target));
    }
}
