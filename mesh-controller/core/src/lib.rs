//! Core data model for the mesh controller.
//!
//! Everything in this crate is independent of the orchestrator: the routing
//! configuration that is deployed to mesh nodes, the fingerprints that key
//! its entries, the TCP listener port table, and the shared cells
//! (snapshot store, readiness gate, deploy log) read by the HTTP API and
//! the deploy engine.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod deploy_log;
pub mod fingerprint;
pub mod ports;
pub mod snapshot;

pub use self::{
    config::Configuration,
    deploy_log::{DeployLog, DeployRecord},
    ports::{PortStateTable, PortsError},
    snapshot::{ReadinessGate, SnapshotStore},
};
