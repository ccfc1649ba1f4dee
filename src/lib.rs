//! Tollgate - Multi-tier Distributed Rate Limiting Service
//!
//! This crate decides, for every inbound client request, whether to admit,
//! delay, or reject it. Three independent limits are consulted in a fixed
//! order (system-wide, per-minute window, monthly quota), each backed by a
//! shared counter store so decisions hold across many server instances.

pub mod catalog;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
pub mod usage;
