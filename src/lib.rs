//! Tenantgate - a multi-tenant edge router
//!
//! This library provides an edge router for a PaaS-style hosting platform that:
//! - Mirrors the tenant registry (instances, users, machines) over its change feed
//! - Resolves each request's Host header to a tenant deployment
//! - Gates requests on account verification, suspension and power state
//! - Forwards legacy tenants to the legacy fleet and neighbor tenants to their node
//! - Starts local tenant backends on first request, exactly once per tenant
//! - Stops idle backends and drains everything on shutdown

pub mod backend;
pub mod config;
pub mod container;
pub mod deployment;
pub mod dispatch;
pub mod error;
pub mod indexed_cache;
pub mod legacy;
pub mod machine;
pub mod mirror;
pub mod models;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod recovery;
pub mod registry;
pub mod resource_pool;
pub mod slot_map;
