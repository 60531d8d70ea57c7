//! The singleton primary election record.
//!
//! At most one `PrimaryRecord` exists per scaling-group family. All writers
//! go through conditional puts keyed on the record's opaque `id` token (or
//! its absence), which is what serializes concurrent elections.

use crate::vm::VirtualMachine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vote lifecycle of the primary record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteState {
    /// Election in progress; the candidate is not yet authoritative
    Pending,
    /// The candidate is the authoritative primary until purged
    Done,
    /// Terminal tombstone; equivalent to absence for the next election
    Timeout,
}

impl fmt::Display for VoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteState::Pending => write!(f, "pending"),
            VoteState::Done => write!(f, "done"),
            VoteState::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for VoteState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VoteState::Pending),
            "done" => Ok(VoteState::Done),
            "timeout" => Ok(VoteState::Timeout),
            _ => Err(format!("Unknown vote state: {}", s)),
        }
    }
}

/// Singleton record naming the elected (or campaigning) primary VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryRecord {
    /// Opaque token used by conditional writes
    pub id: String,
    /// Candidate or incumbent VM id
    pub vm_id: String,
    /// Private IP of the candidate
    pub ip: String,
    /// Scaling group of the candidate
    pub scaling_group_name: String,
    /// Virtual network of the candidate
    pub virtual_network_id: String,
    /// Subnet of the candidate
    pub subnet_id: String,
    /// Absolute ms deadline for a pending vote
    pub vote_end_time: u64,
    /// Vote lifecycle state
    pub vote_state: VoteState,
}

impl PrimaryRecord {
    /// Opens a new pending vote naming `candidate`
    ///
    /// The conditional-write token is derived from the candidate and the
    /// vote deadline, so two concurrent candidates always carry distinct
    /// tokens.
    pub fn new_vote(candidate: &VirtualMachine, vote_end_time: u64) -> Self {
        Self {
            id: format!("{}:{}", candidate.vm_id, vote_end_time),
            vm_id: candidate.vm_id.clone(),
            ip: candidate.primary_private_ip.clone(),
            scaling_group_name: candidate.scaling_group_name.clone(),
            virtual_network_id: candidate.virtual_network_id.clone(),
            subnet_id: candidate.subnet_id.clone(),
            vote_end_time,
            vote_state: VoteState::Pending,
        }
    }

    /// Checks whether a pending vote has passed its deadline
    pub fn is_expired(&self, t_now: u64) -> bool {
        self.vote_state == VoteState::Pending && t_now > self.vote_end_time
    }

    /// Checks whether the record is an authoritative primary
    pub fn is_done(&self) -> bool {
        self.vote_state == VoteState::Done
    }

    /// Checks whether the record names the given VM
    pub fn names(&self, vm: &VirtualMachine) -> bool {
        self.vm_id == vm.vm_id
    }

    /// Returns a copy finalized to the done state
    pub fn finalized(&self) -> Self {
        let mut record = self.clone();
        record.vote_state = VoteState::Done;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> VirtualMachine {
        VirtualMachine {
            vm_id: "i-primary".to_string(),
            scaling_group_name: "primary-group".to_string(),
            primary_private_ip: "10.0.0.10".to_string(),
            primary_public_ip: None,
            virtual_network_id: "vnet-1".to_string(),
            subnet_id: "subnet-1".to_string(),
        }
    }

    #[test]
    fn test_vote_state_wire_strings() {
        assert_eq!(VoteState::Pending.to_string(), "pending");
        assert_eq!("done".parse::<VoteState>(), Ok(VoteState::Done));
        assert_eq!("timeout".parse::<VoteState>(), Ok(VoteState::Timeout));
        assert!("open".parse::<VoteState>().is_err());
    }

    #[test]
    fn test_new_vote() {
        let record = PrimaryRecord::new_vote(&candidate(), 90_000);
        assert_eq!(record.vote_state, VoteState::Pending);
        assert_eq!(record.vm_id, "i-primary");
        assert_eq!(record.ip, "10.0.0.10");
        assert_eq!(record.id, "i-primary:90000");
    }

    #[test]
    fn test_expiry() {
        let record = PrimaryRecord::new_vote(&candidate(), 90_000);
        assert!(!record.is_expired(90_000));
        assert!(record.is_expired(90_001));
        // A finalized record never expires
        assert!(!record.finalized().is_expired(1_000_000));
    }

    #[test]
    fn test_distinct_tokens_for_concurrent_candidates() {
        let mut other = candidate();
        other.vm_id = "i-other".to_string();
        let a = PrimaryRecord::new_vote(&candidate(), 90_000);
        let b = PrimaryRecord::new_vote(&other, 90_000);
        assert_ne!(a.id, b.id);
    }
}
