//! Autoscale Platform Module
//!
//! This crate defines the two capability seams the control plane is built
//! against, plus an in-memory reference implementation:
//!
//! - **PlatformAdapter**: every cloud interaction — VM describe, the
//!   strongly-consistent KV tables with conditional writes, blob listing and
//!   fetch, scaling-group actions, request normalization
//! - **ProxyAdapter**: request context — clock, remaining-execution-time
//!   countdown, response formatting, log sinks
//! - **MemoryPlatformAdapter**: a linearizable in-process implementation used
//!   by the test suites and as the reference for cloud ports

pub mod adapter;
pub mod memory;
pub mod proxy;
pub mod request;

// Re-export main types
pub use adapter::PlatformAdapter;
pub use memory::{LifecycleCompletion, MemoryPlatformAdapter, StaticProxy};
pub use proxy::{LogLevel, ProxyAdapter, ProxyResponse, SystemProxy};
pub use request::{
    HeartbeatInterval, LifecycleTransition, ReqType, RequestInfo, ServiceRequest,
};
