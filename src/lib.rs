//! bench-fleet: bounded-concurrency batch runner for terminal-agent evaluations.
//!
//! A batch is a set of task ids. Each task is launched through a
//! [`Launcher`](adapter::Launcher), waited on through a
//! [`Prober`](adapter::Prober), and recorded exactly once into a shared
//! [`BatchState`](batch::BatchState) that can be polled while the batch
//! runs and is persisted when it ends.

pub mod adapter;
pub mod api;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use adapter::{AdapterPair, ExecutionHandle, LaunchConfig, Launcher, Prober};
pub use batch::{BatchId, BatchSnapshot, BatchState, BatchStatus, Outcome, TaskId, Verdict};
pub use config::FleetConfig;
pub use error::{
    BatchError, CancelError, ConfigError, InvariantViolation, LaunchError, ProbeError,
    RegistryError, StoreError,
};
pub use registry::BatchRegistry;
pub use scheduler::{BatchHandle, BatchOptions, Scheduler};
pub use store::{FileResultStore, MemoryResultStore, ResultStore};
