//! The structured result of a run.
//!
//! An [`ExecutionReport`] is returned as data by every command that touches the
//! destination; the CLI prints it as YAML or JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RootPhase;
use crate::error::{Result, SliceError};

/// Phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Create,
    Load,
    Neuter,
    Index,
    StorageFinalize,
    Constraints,
    Sequences,
    TriggersFunctions,
    Validation,
    /// Maintenance: recreate the destination schema.
    Restart,
    /// Maintenance: drop tables of named families.
    Reset,
    /// Maintenance: rename schemas.
    Swap,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Create => "create",
            Phase::Load => "load",
            Phase::Neuter => "neuter",
            Phase::Index => "index",
            Phase::StorageFinalize => "storage_finalize",
            Phase::Constraints => "constraints",
            Phase::Sequences => "sequences",
            Phase::TriggersFunctions => "triggers_functions",
            Phase::Validation => "validation",
            Phase::Restart => "restart",
            Phase::Reset => "reset",
            Phase::Swap => "swap",
        }
    }

    /// Human-readable title for log lines.
    pub fn title(&self) -> &'static str {
        match self {
            Phase::Create => "Create destination tables",
            Phase::Load => "Load rows",
            Phase::Neuter => "Neuter columns",
            Phase::Index => "Primary keys and indexes",
            Phase::StorageFinalize => "Switch tables to logged storage",
            Phase::Constraints => "Constraints",
            Phase::Sequences => "Sequences and column defaults",
            Phase::TriggersFunctions => "Functions and triggers",
            Phase::Validation => "Validate foreign keys",
            Phase::Restart => "Recreate destination schema",
            Phase::Reset => "Reset families",
            Phase::Swap => "Rename schemas",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = SliceError;

    /// Parse a phase name; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        ALL_PHASES
            .into_iter()
            .find(|phase| phase.as_str() == name)
            .ok_or_else(|| SliceError::config(format!("unknown phase '{}'", s)))
    }
}

const ALL_PHASES: [Phase; 12] = [
    Phase::Create,
    Phase::Load,
    Phase::Neuter,
    Phase::Index,
    Phase::StorageFinalize,
    Phase::Constraints,
    Phase::Sequences,
    Phase::TriggersFunctions,
    Phase::Validation,
    Phase::Restart,
    Phase::Reset,
    Phase::Swap,
];

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Dry run: would have been executed.
    Planned,
    Succeeded,
    Failed,
    /// Not issued because an earlier task failed.
    NotStarted,
    /// Not issued because the run was cancelled.
    Cancelled,
}

/// Outcome of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Planned,
    Succeeded,
    Failed,
    Cancelled,
}

/// Outcome of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    DryRun,
}

/// One task of a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: String,
    pub table: String,
    pub shard: String,
    pub label: String,
    pub wave: usize,
    pub status: TaskStatus,
    pub rows: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Statements of the task, recorded in dry runs only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statements: Vec<String>,
}

/// One phase of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    /// Stage of Create/Load phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<RootPhase>,
    pub status: PhaseStatus,
    pub duration_seconds: f64,
    pub tasks: Vec<TaskReport>,
}

impl PhaseReport {
    pub fn new(phase: Phase, stage: Option<RootPhase>) -> Self {
        Self {
            phase,
            stage,
            status: PhaseStatus::Succeeded,
            duration_seconds: 0.0,
            tasks: Vec::new(),
        }
    }

    /// Rows affected by succeeded tasks.
    pub fn rows(&self) -> u64 {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .map(|t| t.rows)
            .sum()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Per-root selection summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub root: String,
    pub stage: RootPhase,
    pub ids: usize,
    /// Id count per shard key.
    pub shards: BTreeMap<String, usize>,
}

/// Task counts over all phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_started: usize,
    pub rows: u64,
}

/// Result of a run, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub command: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub profile_hash: String,
    pub source_schema: String,
    pub dest_schema: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<SelectionSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_families: Vec<String>,
    pub phases: Vec<PhaseReport>,
    pub totals: Totals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionReport {
    /// Start a report for `command`.
    pub fn start(
        command: &str,
        profile_hash: String,
        source_schema: &str,
        dest_schema: &str,
        dry_run: bool,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            status: RunStatus::Running,
            dry_run,
            profile_hash,
            source_schema: source_schema.to_string(),
            dest_schema: dest_schema.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: 0.0,
            selections: Vec::new(),
            skipped_families: Vec::new(),
            phases: Vec::new(),
            totals: Totals::default(),
            error: None,
        }
    }

    /// Close the report with a final status and recompute totals.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let completed = Utc::now();
        self.duration_seconds =
            (completed - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.completed_at = Some(completed);
        self.status = status;
        self.error = error;

        let mut totals = Totals::default();
        for phase in &self.phases {
            totals.tasks += phase.tasks.len();
            totals.succeeded += phase.count(TaskStatus::Succeeded);
            totals.failed += phase.count(TaskStatus::Failed);
            totals.not_started += phase.count(TaskStatus::NotStarted);
            totals.rows += phase.rows();
        }
        self.totals = totals;
    }

    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &PhaseReport> {
        self.phases.iter().filter(move |p| p.phase == phase)
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Convert to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
