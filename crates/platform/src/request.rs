//! Request envelope and normalization types.
//!
//! The transport hands the dispatcher a `ServiceRequest`; the platform
//! adapter classifies it into a `ReqType` and extracts the `RequestInfo`
//! fields the engines work with.

use autoscale_core::{AutoscaleError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scaling-group lifecycle transition carried by a platform notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleTransition {
    Launching,
    Launched,
    Terminating,
    Terminated,
}

/// An incoming request before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Device-originated HTTPS call carried by the transport
    Api {
        path: String,
        method: String,
        body: String,
    },
    /// Scaling-group lifecycle notification
    Lifecycle {
        vm_id: String,
        transition: LifecycleTransition,
    },
}

impl ServiceRequest {
    /// Builds an API request with a JSON body
    pub fn api(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Api {
            path: path.into(),
            method: "POST".to_string(),
            body: body.into(),
        }
    }

    /// Builds a lifecycle notification
    pub fn lifecycle(vm_id: impl Into<String>, transition: LifecycleTransition) -> Self {
        Self::Lifecycle {
            vm_id: vm_id.into(),
            transition,
        }
    }
}

/// Typed request classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    LaunchingVm,
    LaunchedVm,
    TerminatingVm,
    TerminatedVm,
    BootstrapConfig,
    HeartbeatSync,
    StatusMessage,
    ServiceForwarding,
    Unknown,
}

impl fmt::Display for ReqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReqType::LaunchingVm => "LaunchingVm",
            ReqType::LaunchedVm => "LaunchedVm",
            ReqType::TerminatingVm => "TerminatingVm",
            ReqType::TerminatedVm => "TerminatedVm",
            ReqType::BootstrapConfig => "BootstrapConfig",
            ReqType::HeartbeatSync => "HeartbeatSync",
            ReqType::StatusMessage => "StatusMessage",
            ReqType::ServiceForwarding => "ServiceForwarding",
            ReqType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Heartbeat interval carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatInterval {
    /// Replace the stored interval with this many seconds
    Seconds(u64),
    /// Keep whatever interval the monitor record already has
    UseExisting,
}

/// Normalized request fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Reporting VM id
    pub vm_id: String,
    /// Requested heartbeat interval
    pub heartbeat_interval: HeartbeatInterval,
    /// Free-form status text, when present
    pub status: Option<String>,
}

/// Wire shape of a device-originated request body
#[derive(Debug, Deserialize)]
struct ApiBody {
    #[serde(rename = "instance-id")]
    instance_id: Option<String>,
    interval: Option<serde_json::Value>,
    status: Option<String>,
}

impl RequestInfo {
    /// Parses the JSON body of a device-originated request
    ///
    /// A missing `instance-id` is an authorization failure: the device on
    /// the other end receives 403.
    pub fn from_api_body(body: &str) -> Result<Self> {
        let parsed: ApiBody = serde_json::from_str(body)
            .map_err(|err| AutoscaleError::Serialization(err.to_string()))?;

        let vm_id = parsed.instance_id.filter(|id| !id.is_empty()).ok_or(
            AutoscaleError::Unauthorized {
                reason: "Instance id not provided".to_string(),
            },
        )?;

        let heartbeat_interval = match parsed.interval {
            None => HeartbeatInterval::UseExisting,
            Some(serde_json::Value::String(s)) if s == "use-existing" => {
                HeartbeatInterval::UseExisting
            }
            Some(serde_json::Value::String(s)) => {
                let seconds = s.parse::<u64>().map_err(|_| {
                    AutoscaleError::Serialization(format!("Invalid interval: {}", s))
                })?;
                HeartbeatInterval::Seconds(seconds)
            }
            Some(serde_json::Value::Number(n)) => {
                let seconds = n.as_u64().ok_or_else(|| {
                    AutoscaleError::Serialization(format!("Invalid interval: {}", n))
                })?;
                HeartbeatInterval::Seconds(seconds)
            }
            Some(other) => {
                return Err(AutoscaleError::Serialization(format!(
                    "Invalid interval: {}",
                    other
                )))
            }
        };

        Ok(Self {
            vm_id,
            heartbeat_interval,
            status: parsed.status,
        })
    }

    /// Builds the info record for a lifecycle notification
    pub fn from_lifecycle(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            heartbeat_interval: HeartbeatInterval::UseExisting,
            status: None,
        }
    }
}
