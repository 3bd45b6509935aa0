//! # dbslice
//!
//! Profile-driven, referentially consistent subset copies inside one PostgreSQL
//! database.
//!
//! A YAML profile names root selections (explicit ids or a query), the table
//! families reachable from each root, and optional redaction rules. A run copies
//! the selected rows from the source schema into a destination schema and then
//! rebuilds the destination's structure from the source catalog:
//!
//! - **Create/Load** with parallel, wave-ordered fanout over fresh sessions
//! - **Sharding** of large roots and dependents into staging tables
//! - **Neuter** for deterministic, idempotent column redaction
//! - **Reconcile** for keys, indexes, constraints, sequences, triggers and functions
//! - **Validation** of every foreign key with an orphan check first
//!
//! Runs can be scoped to the precopy tables or to some families, and each
//! reconcile phase can be rerun on its own for the whole schema or one table.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbslice::{Orchestrator, Profile, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = Profile::load("profile.yaml")?;
//!     let orchestrator = Orchestrator::connect(profile)?;
//!     let report = orchestrator.run(RunOptions::default()).await?;
//!     println!("Copied {} rows", report.totals.rows);
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod audit;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod fanout;
pub mod neuter;
pub mod orchestrator;
pub mod plan;
pub mod reconcile;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use admin::{HealthReport, SwapDirection};
pub use audit::{AuditReport, SequenceAuditReport, TableAudit, TableState};
pub use config::{Profile, RootPhase};
pub use error::{Result, SliceError};
pub use orchestrator::{Orchestrator, RunFailure, RunOptions, RECONCILE_PHASES};
pub use plan::CopyScope;
pub use report::{ExecutionReport, Phase, PhaseReport, RunStatus, TaskReport, TaskStatus};
