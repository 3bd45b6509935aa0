//! Catalog snapshot types.
//!
//! A [`SchemaSnapshot`] is an immutable description of one schema, read live
//! from the catalog once per run (or once per stage for the destination). The
//! family graph validates profile expressions against the source snapshot, and
//! the reconciler diffs source against destination snapshots to decide which
//! DDL to issue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything dbslice knows about one schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Schema name.
    pub schema: String,

    /// Base tables keyed by name.
    pub tables: BTreeMap<String, Table>,

    /// Sequences keyed by name.
    pub sequences: BTreeMap<String, Sequence>,

    /// Functions and procedures defined in the schema.
    pub functions: Vec<Function>,
}

impl SchemaSnapshot {
    /// An empty snapshot for a schema with no objects (or no schema at all).
    pub fn empty(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Check whether a table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Add or replace a table.
    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Look up a function by name and identity arguments.
    pub fn function(&self, name: &str, arguments: &str) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| f.name == name && f.arguments == arguments)
    }
}

/// Table metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Column definitions in ordinal order.
    pub columns: Vec<Column>,

    /// Whether the table is UNLOGGED.
    pub unlogged: bool,

    /// Primary key, if any.
    pub primary_key: Option<PrimaryKey>,

    /// Unique, check, exclusion and foreign key constraints.
    pub constraints: Vec<Constraint>,

    /// All indexes on the table, including those backing constraints.
    pub indexes: Vec<Index>,

    /// User-defined triggers.
    pub triggers: Vec<Trigger>,
}

impl Table {
    /// Create a table with the given columns and nothing else.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            ..Default::default()
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Foreign keys declared on this table.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::ForeignKey)
    }

    /// Look up a constraint by name.
    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    /// Look up a trigger by name.
    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.name == name)
    }
}

/// Column metadata as reported by `information_schema.columns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// SQL data type (e.g. `integer`, `character varying`).
    pub data_type: String,

    /// Underlying type name (e.g. `int4`, `varchar`).
    pub udt_name: String,

    /// Whether NULLs are allowed.
    pub nullable: bool,

    /// Default expression, if any.
    pub default: Option<String>,

    /// Character length limit for character types.
    pub char_max_length: Option<i32>,

    /// Numeric precision.
    pub numeric_precision: Option<i32>,

    /// Numeric scale.
    pub numeric_scale: Option<i32>,
}

impl Column {
    /// Create a nullable column of the given type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            udt_name: data_type.clone(),
            data_type,
            nullable: true,
            ..Default::default()
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Whether this is a two-, four- or eight-byte integer column.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8"
        ) || matches!(self.udt_name.as_str(), "int2" | "int4" | "int8")
    }
}

/// Primary key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Constraint name.
    pub name: String,

    /// Key columns in key order.
    pub columns: Vec<String>,
}

/// Kind of a non-primary-key constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    Check,
    Exclusion,
    ForeignKey,
}

impl ConstraintKind {
    /// Map a `pg_constraint.contype` code.
    pub fn from_contype(code: &str) -> Option<Self> {
        match code {
            "u" => Some(ConstraintKind::Unique),
            "c" => Some(ConstraintKind::Check),
            "x" => Some(ConstraintKind::Exclusion),
            "f" => Some(ConstraintKind::ForeignKey),
            _ => None,
        }
    }
}

/// A unique, check, exclusion or foreign key constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name.
    pub name: String,

    /// Constraint kind.
    pub kind: ConstraintKind,

    /// Definition as printed by `pg_get_constraintdef`.
    pub definition: String,

    /// Referenced columns, for foreign keys.
    pub foreign: Option<ForeignKeyRef>,

    /// False for constraints added `NOT VALID` and not yet validated.
    pub validated: bool,
}

/// Column mapping of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    /// Referencing columns on the constrained table.
    pub columns: Vec<String>,

    /// Schema of the referenced table.
    pub ref_schema: String,

    /// Referenced table.
    pub ref_table: String,

    /// Referenced columns, positionally matching `columns`.
    pub ref_columns: Vec<String>,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Definition as printed by `pg_get_indexdef`.
    pub definition: String,

    /// Predicate of a partial index.
    pub partial_predicate: Option<String>,

    /// True when the index is owned by a primary key, unique or exclusion constraint.
    pub backs_constraint: bool,
}

/// Sequence metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name.
    pub name: String,

    /// Value type (`bigint`, `integer`, `smallint`).
    pub data_type: String,

    /// START WITH value.
    pub start_value: i64,

    /// INCREMENT BY value.
    pub increment: i64,

    /// MINVALUE.
    pub min_value: i64,

    /// MAXVALUE.
    pub max_value: i64,

    /// Last value handed out, or None if the sequence was never called.
    pub last_value: Option<i64>,

    /// Owning table and column (`OWNED BY`).
    pub owned_by: Option<(String, String)>,
}

impl Sequence {
    /// The value `nextval` would return next.
    pub fn next_value(&self) -> i64 {
        match self.last_value {
            Some(last) => last.saturating_add(self.increment),
            None => self.start_value,
        }
    }
}

/// Trigger metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger name.
    pub name: String,

    /// Definition as printed by `pg_get_triggerdef`.
    pub definition: String,
}

/// Function or procedure metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,

    /// Identity arguments (`pg_get_function_identity_arguments`).
    pub arguments: String,

    /// Full definition as printed by `pg_get_functiondef`.
    pub definition: String,
}

impl Function {
    /// Signature used in logs and reports.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.arguments)
    }
}
