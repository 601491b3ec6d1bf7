//! Tollgate - Admission Control for Multi-Tenant HTTP APIs
//!
//! This crate decides, per inbound request, whether to admit it under a
//! sliding-window rate limit, and separately meters the token cost of
//! expensive backend calls per identity. Counters live in a shared store
//! (Redis) when one is reachable and fall back to process-local state when
//! it is not, so request handling never fails on a store outage.

pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod http;
pub mod identity;
pub mod ratelimit;
pub mod store;
