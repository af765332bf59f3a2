//! Bid optimization control plane library
//!
//! Exposes the core modules for integration tests and auxiliary
//! binaries; the `bidpilot` binary wires them into running loops.

pub mod ads_api;
pub mod batch;
pub mod coordinator;
pub mod data_plane;
pub mod decision_tree;
pub mod effect;
pub mod errors;
pub mod market_curve;
pub mod models;
pub mod optimization;
pub mod pacing;
pub mod proposals;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod testutil;

pub use coordinator::{BidCoordinator, CoordinationInput, CoordinationResult};
pub use errors::{OpError, OpResult};
pub use service::App;
