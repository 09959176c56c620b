//! tedge-container agent library.
//!
//! Manages containers and compose projects as thin-edge.io software modules
//! and keeps the thin-edge.io entity registry in line with what the
//! container engine runs.
//!
//! ## Architecture
//!
//! ```text
//! engine events ─┐
//! health checks ─┼─► ReconcileActor ─► Registry (HTTP entity store, MQTT, cloud)
//! metrics timer ─┘        │
//!                         └─► ContainerEngine (Docker-compatible API)
//!
//! container / container-group / tools commands ─► Orchestrator ─► ContainerEngine
//! ```
//!
//! ## Modules
//!
//! - `actors`: single-consumer actor framework used by the reconciler
//! - `engine`: container engine interface, Docker adapter and mock
//! - `registry`: thin-edge.io registry interface, adapter and mock
//! - `orchestrator`: clone/fork self-update, image pulls, packages, compose
//! - `reconciler`: reconciliation passes, event monitor, health checks
//! - `metrics`: per-container resource usage
//! - `commands`: the `tedge-container` CLI

pub mod actors;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;

// Re-export commonly used types
pub use config::Config;
pub use engine::{ContainerEngine, FilterSpec, MockEngine};
pub use error::AgentError;
pub use orchestrator::{Orchestrator, UpdateOutcome, UpdateRequest};
pub use reconciler::{Reconciler, ReconcilerHandle};
pub use registry::{MockRegistry, Registry, Target};
