//! Error types for the slicing library.

use thiserror::Error;

/// Exit code for invalid or unreadable profiles.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection and driver failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for plan-time failures (schema mismatch, cycles, selections).
pub const EXIT_PLAN_ERROR: u8 = 3;
/// Exit code for a failed fanout task.
pub const EXIT_FANOUT_ERROR: u8 = 4;
/// Exit code for reconciliation DDL failures and integrity violations.
pub const EXIT_RECONCILE_ERROR: u8 = 5;
/// Exit code for a run cancelled by signal.
pub const EXIT_CANCELLED: u8 = 6;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for slicing operations.
#[derive(Error, Debug)]
pub enum SliceError {
    /// Configuration error (invalid YAML, missing fields, bad references)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open a database connection
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Profile references a table or column missing from the live catalog
    #[error("Schema mismatch: {}", describe_mismatch(.table, .column.as_deref()))]
    SchemaMismatch {
        table: String,
        column: Option<String>,
    },

    /// The family graph contains a cycle
    #[error("Family graph cycle between tables: {}", .tables.join(", "))]
    GraphCycle { tables: Vec<String> },

    /// A root selector produced an unexpected result
    #[error("Selection failed for root {root}: {message}")]
    Selection { root: String, message: String },

    /// A fanout task failed
    #[error("Fanout task failed in phase {phase}, wave {wave}, table {table}, shard {shard}: {message}")]
    Fanout {
        phase: String,
        wave: usize,
        table: String,
        shard: String,
        message: String,
    },

    /// A reconciliation DDL statement failed
    #[error("Reconciliation failed in phase {phase} for {table}: {message}")]
    Reconciliation {
        phase: String,
        table: String,
        message: String,
    },

    /// Foreign key validation found orphaned rows
    #[error("Integrity violation on {table}: {rows} row(s) violate {constraint}")]
    Integrity {
        table: String,
        constraint: String,
        rows: u64,
    },

    /// Database driver error outside a scheduled task
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, SIGTERM)
    #[error("Run cancelled")]
    Cancelled,
}

fn describe_mismatch(table: &str, column: Option<&str>) -> String {
    match column {
        Some(column) => format!("column {}.{} does not exist", table, column),
        None => format!("table {} does not exist", table),
    }
}

impl SliceError {
    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        SliceError::Config(message.into())
    }

    /// Create a Connection error with context about where it occurred.
    pub fn connection(message: impl Into<String>, context: impl Into<String>) -> Self {
        SliceError::Connection {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a SchemaMismatch error for a missing table.
    pub fn missing_table(table: impl Into<String>) -> Self {
        SliceError::SchemaMismatch {
            table: table.into(),
            column: None,
        }
    }

    /// Create a SchemaMismatch error for a missing column.
    pub fn missing_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SliceError::SchemaMismatch {
            table: table.into(),
            column: Some(column.into()),
        }
    }

    /// Create a Selection error.
    pub fn selection(root: impl Into<String>, message: impl Into<String>) -> Self {
        SliceError::Selection {
            root: root.into(),
            message: message.into(),
        }
    }

    /// Create a Reconciliation error.
    pub fn reconciliation(
        phase: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        SliceError::Reconciliation {
            phase: phase.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            SliceError::Config(_) | SliceError::Yaml(_) | SliceError::Json(_) => EXIT_CONFIG_ERROR,
            SliceError::Connection { .. } | SliceError::Database(_) => EXIT_CONNECTION_ERROR,
            SliceError::SchemaMismatch { .. }
            | SliceError::GraphCycle { .. }
            | SliceError::Selection { .. } => EXIT_PLAN_ERROR,
            SliceError::Fanout { .. } => EXIT_FANOUT_ERROR,
            SliceError::Reconciliation { .. } | SliceError::Integrity { .. } => {
                EXIT_RECONCILE_ERROR
            }
            SliceError::Cancelled => EXIT_CANCELLED,
            SliceError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for slicing operations.
pub type Result<T> = std::result::Result<T, SliceError>;
