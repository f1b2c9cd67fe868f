//! Bounded-concurrency batch scheduling.
//!
//! - **Scheduler**: runs a batch of task ids against a launcher/prober pair
//! - **BatchOptions**: concurrency, per-task deadline, cancellation grace
//! - **BatchHandle**: a batch running in the background
//!
//! # Architecture
//!
//! ```text
//!                task ids
//!                   │
//!            ┌──────▼───────┐
//!            │  Semaphore   │  acquire slot before spawn
//!            │ (concurrency)│
//!            └──────┬───────┘
//!                   │
//!      ┌────────────┼────────────┐
//!      ▼            ▼            ▼
//!  ┌────────┐  ┌────────┐  ┌────────┐
//!  │ Worker │  │ Worker │  │ Worker │   launch → probe → record
//!  └───┬────┘  └───┬────┘  └───┬────┘
//!      └───────────┼───────────┘
//!                  ▼
//!           ┌─────────────┐
//!           │ BatchState  │  one mutex, one record per task
//!           └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bench_fleet::adapter::{AdapterPair, LocalProcessAdapter, LocalProcessConfig};
//! use bench_fleet::scheduler::{BatchOptions, Scheduler};
//! use std::time::Duration;
//!
//! let adapter = LocalProcessAdapter::new(LocalProcessConfig::default());
//! let scheduler = Scheduler::from_pair(AdapterPair::from_adapter(adapter));
//!
//! let options = BatchOptions::new(4).with_per_task_timeout(Duration::from_secs(900));
//! let state = scheduler.run_batch(task_ids, options).await?;
//! println!("pass rate: {:.1}%", state.pass_rate() * 100.0);
//! ```

pub mod options;
pub mod pool;
mod worker;

pub use options::BatchOptions;
pub use pool::{BatchHandle, Scheduler};
