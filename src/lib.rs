//! tsbridge - expose backend HTTP services on a Tailscale-style mesh
//!
//! This library provides a multi-tenant reverse-proxy manager that:
//! - Runs one mesh node per service, each with its own hostname and identity
//! - Terminates TLS with certificates issued by the mesh control plane
//! - Forwards requests to configured backends over TCP or unix sockets
//! - Ingests declarative service definitions from a TOML file or from
//!   container labels, and reconciles the running set on every change
//! - Preserves per-service node state across reconciliations so mesh
//!   identities stay stable
//! - Injects caller-identity headers resolved through the mesh
//! - Exposes Prometheus metrics for requests, errors and identity lookups

pub mod app;
pub mod config;
pub mod docker;
pub mod errors;
pub mod mesh;
pub mod metrics;
pub mod provider;
pub mod proxy;
pub mod service;
pub mod tsnet;
