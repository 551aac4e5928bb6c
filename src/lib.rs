//! Cortexpropel library crate
//!
//! A natural-language task manager: a language model proposes changes to a
//! hierarchical task tree, and this crate reconciles them into the persisted
//! tree while keeping task ids stable, rolling progress up to parents, and
//! mirroring every task into a SQLite table.

pub mod api;
pub mod cli;
pub mod config;
pub mod identity;
pub mod manager;
pub mod models;
pub mod reconcile;
pub mod rollup;
pub mod status;
pub mod store;

// Re-export the types most callers need
pub use api::{Gateway, GatewayConfig, GatewayError, HttpGateway, ScriptedGateway};
pub use config::Config;
pub use identity::{IdMapping, IdentityResolver};
pub use manager::{ChatOutcome, ManagerError, TaskManager};
pub use models::{
    ExtensionFields, Operation, OperationKind, Priority, TaskFields, TaskNode, TaskStatus,
    TaskQuery, TaskTree, TreeStats, ROOT_ID,
};
pub use reconcile::{
    BatchReport, OperationEffect, OperationOutcome, ReconcileError, ReconcileOptions, Reconciler,
    Strategy,
};
pub use store::{Mirror, StoreError, TaskRecord, TreeStore};
