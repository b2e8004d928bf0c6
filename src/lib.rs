//! Replicated Map Cluster Library
//!
//! This library crate defines a cluster-wide replicated key/value map and the
//! pieces needed to run it. It serves as the foundation for the node binary
//! (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`map`**: The replicated map itself. Tracks per-key roles (primary, backup,
//!   proxy), replicates values (whole or as deltas), transfers state to joining
//!   nodes and rebalances when members leave.
//! - **`membership`**: Node identity and the per-map membership table with
//!   liveness timestamps and round-robin backup selection.
//! - **`transport`**: The messaging seam. An in-process network for tests and
//!   an HTTP transport (axum + reqwest) for real deployments.
//! - **`api`**: JSON client endpoints exposing put/get/remove/stats.

pub mod api;
pub mod map;
pub mod membership;
pub mod transport;
