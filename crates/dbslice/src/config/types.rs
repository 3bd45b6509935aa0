//! Profile type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::drivers::common::SslMode;
use crate::error::{Result, SliceError};

/// Root profile structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Schema rows are read from (default: public).
    #[serde(default = "default_source_schema", alias = "src_schema")]
    pub source_schema: String,

    /// Schema the slice is written to (default: stage).
    #[serde(default = "default_dest_schema", alias = "dst_schema")]
    pub dest_schema: String,

    /// Scratch schema for per-shard staging tables (default: shards).
    #[serde(default = "default_shards_schema")]
    pub shards_schema: String,

    /// Schema the source is renamed to by `swap` (default: old).
    #[serde(default = "default_old_schema")]
    pub old_schema: String,

    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Tables copied empty or in full, independent of any selection.
    #[serde(default)]
    pub precopy: PrecopyConfig,

    /// Named id selections.
    #[serde(default)]
    pub roots: Vec<RootConfig>,

    /// Table families walked from a root table.
    #[serde(default, alias = "table_groups")]
    pub families: Vec<FamilyConfig>,

    /// Post-load redaction rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neuter: Option<NeuterConfig>,

    /// Concurrency settings.
    #[serde(default)]
    pub run: RunConfig,

    /// Which reconciliation steps run.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Profile {
    /// Look up a root selection by name.
    pub fn root(&self, name: &str) -> Option<&RootConfig> {
        self.roots.iter().find(|r| r.name == name)
    }

    /// Look up a family by name.
    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.name == name)
    }

    /// The stage a family is copied in: that of its selection root, or pre.
    pub fn family_phase(&self, family: &FamilyConfig) -> RootPhase {
        family
            .root
            .selection
            .as_deref()
            .and_then(|name| self.root(name))
            .map(|root| root.phase)
            .unwrap_or_default()
    }
}

/// Database connection settings. Credentials never live in the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Environment variable holding the connection URL (default: DATABASE_URL).
    #[serde(default = "default_url_env")]
    pub url_env: String,

    /// TLS mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: default_url_env(),
            ssl_mode: SslMode::default(),
            connect_timeout_secs: None,
        }
    }
}

impl DatabaseConfig {
    /// Read the connection URL from the configured environment variable.
    pub fn url(&self) -> Result<String> {
        std::env::var(&self.url_env).map_err(|_| {
            SliceError::Config(format!(
                "environment variable {} is not set (database.url_env)",
                self.url_env
            ))
        })
    }
}

/// Tables copied before any family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecopyConfig {
    /// Tables created with structure only.
    #[serde(default)]
    pub schema_only: Vec<String>,

    /// Tables copied in full.
    #[serde(default)]
    pub full_copy: Vec<String>,
}

impl PrecopyConfig {
    pub fn is_empty(&self) -> bool {
        self.schema_only.is_empty() && self.full_copy.is_empty()
    }
}

/// A named id selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Name families refer to in `selection`.
    pub name: String,

    /// Table the ids belong to.
    pub table: String,

    /// Identifier column of `table` (default: id).
    #[serde(default = "default_id_col")]
    pub id_col: String,

    /// How ids are chosen.
    pub selector: Selector,

    /// Ids always included.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ensure: Vec<i64>,

    /// Optional partitioning of the ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardConfig>,

    /// Stage the selection is resolved in.
    #[serde(default)]
    pub phase: RootPhase,

    /// Accept an empty result from a query-based selector.
    #[serde(default)]
    pub allow_empty: bool,
}

impl RootConfig {
    /// Number of shards (1 when unsharded).
    pub fn shard_count(&self) -> u32 {
        self.shard.as_ref().map(|s| s.count).unwrap_or(1)
    }
}

/// How a root's ids are chosen.
///
/// The last four modes read tables already in the destination, typically ones
/// written by `pre` families, and are meant for `post` roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Selector {
    /// Literal ids.
    List { ids: Vec<i64> },
    /// A query; the first column is the id. `%(name)s` placeholders are bound
    /// from `params`.
    Sql {
        sql: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, SqlParam>,
    },
    /// Distinct non-null values of some columns (destination schema by default).
    ReferencedBy { refs: Vec<ColumnRef> },
    /// Root rows whose foreign key points at a row of a destination table.
    FkInStage {
        fk_column: String,
        stage_table: String,
        #[serde(default = "default_id_col")]
        stage_id_col: String,
    },
    /// Root rows referencing a row of any of several destination tables.
    RefersToStage { targets: Vec<StageTarget> },
    /// Values of `column` in every table of a schema that has it, plus `extra_refs`.
    ReferencedByColumn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        column: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extra_refs: Vec<ColumnRef>,
    },
}

impl Selector {
    pub fn mode(&self) -> &'static str {
        match self {
            Selector::List { .. } => "list",
            Selector::Sql { .. } => "sql",
            Selector::ReferencedBy { .. } => "referenced_by",
            Selector::FkInStage { .. } => "fk_in_stage",
            Selector::RefersToStage { .. } => "refers_to_stage",
            Selector::ReferencedByColumn { .. } => "referenced_by_column",
        }
    }

    /// Schemas other than the source and destination the selector reads.
    pub fn extra_schemas<'a>(&'a self, source: &str, dest: &str) -> Vec<&'a str> {
        let refs: Vec<&ColumnRef> = match self {
            Selector::ReferencedBy { refs } => refs.iter().collect(),
            Selector::ReferencedByColumn { extra_refs, .. } => extra_refs.iter().collect(),
            _ => Vec::new(),
        };
        let own = match self {
            Selector::ReferencedByColumn {
                schema: Some(schema),
                ..
            } => Some(schema.as_str()),
            _ => None,
        };
        let mut schemas: Vec<&str> = refs
            .into_iter()
            .filter_map(|r| r.schema.as_deref())
            .chain(own)
            .filter(|s| *s != source && *s != dest)
            .collect();
        schemas.sort_unstable();
        schemas.dedup();
        schemas
    }
}

/// A bound value of a `sql` selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<SqlParam>),
}

/// A column of some table, in the destination schema unless `schema` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

/// A destination table matched by a column of the root table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTarget {
    pub stage_table: String,
    pub local_column: String,
    #[serde(default = "default_id_col")]
    pub stage_id_col: String,
}

/// Stage a root is resolved in. Post roots may read what pre families copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPhase {
    #[default]
    Pre,
    Post,
}

impl RootPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootPhase::Pre => "pre",
            RootPhase::Post => "post",
        }
    }
}

/// Root partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Number of shards.
    pub count: u32,

    /// Assignment strategy (default: round_robin).
    #[serde(default)]
    pub strategy: ShardStrategy,

    /// `(id, weight)` query for the weighted strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_sql: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    #[default]
    RoundRobin,
    Weighted,
}

/// A root table and the tables reachable from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    pub root: FamilyRoot,
    #[serde(default)]
    pub deps: Vec<Dep>,
}

impl FamilyConfig {
    /// Every table the family writes, root first.
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.root.table.as_str())
            .chain(self.deps.iter().map(|d| d.table.as_str()))
            .collect()
    }
}

/// The table at the top of a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRoot {
    pub table: String,

    #[serde(default = "default_id_col")]
    pub id_col: String,

    /// Root selection feeding this table. Without one the table is created empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,

    /// Join between the table (`d`) and the selection (`p`), default `d.<id_col> = p.id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
}

/// A dependent table of a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DepConfig", into = "DepConfig")]
pub struct Dep {
    pub table: String,
    pub kind: DepKind,
    /// Semi-join instead of plain join (single-parent deps).
    pub distinct: bool,
    /// Split the load into `count` key-modulo slices.
    pub pk_mod: Option<PkMod>,
}

impl Dep {
    /// Tables this dep reads from in the destination.
    pub fn parent_tables(&self) -> Vec<&str> {
        match &self.kind {
            DepKind::Join { parent, .. } => vec![parent.as_str()],
            DepKind::Union { sources } => sources
                .iter()
                .filter_map(|s| match s {
                    Source::Parent { table, .. } => Some(table.as_str()),
                    Source::Selection { .. } => None,
                })
                .collect(),
        }
    }

    /// Root selections this dep reads from.
    pub fn selections(&self) -> Vec<&str> {
        match &self.kind {
            DepKind::Join { .. } => Vec::new(),
            DepKind::Union { sources } => sources
                .iter()
                .filter_map(|s| match s {
                    Source::Selection { root, .. } => Some(root.as_str()),
                    Source::Parent { .. } => None,
                })
                .collect(),
        }
    }
}

/// How a dependent table's rows are reached.
#[derive(Debug, Clone, PartialEq)]
pub enum DepKind {
    /// Rows joined to one parent.
    Join {
        parent: String,
        join: String,
        filter: Option<String>,
    },
    /// Rows reachable through any of several paths, each copied once.
    Union { sources: Vec<Source> },
}

/// One path of a union dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SourceConfig", into = "SourceConfig")]
pub enum Source {
    /// A parent table already in the destination.
    Parent {
        table: String,
        join: String,
        filter: Option<String>,
    },
    /// A root selection, exposing `p.id`.
    Selection {
        root: String,
        join: String,
        filter: Option<String>,
    },
}

impl Source {
    pub fn join(&self) -> &str {
        match self {
            Source::Parent { join, .. } | Source::Selection { join, .. } => join,
        }
    }

    pub fn filter(&self) -> Option<&str> {
        match self {
            Source::Parent { filter, .. } | Source::Selection { filter, .. } => filter.as_deref(),
        }
    }
}

/// Key-modulo split of a dependent table's load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkMod {
    pub key: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardBy {
    PkMod,
}

/// Dependency as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepConfig {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_by: Option<ShardBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<u32>,
}

impl TryFrom<DepConfig> for Dep {
    type Error = String;

    fn try_from(raw: DepConfig) -> std::result::Result<Self, Self::Error> {
        let kind = if raw.sources.is_empty() {
            match (raw.parent_table, raw.join) {
                (Some(parent), Some(join)) => DepKind::Join {
                    parent,
                    join,
                    filter: raw.filter,
                },
                _ => {
                    return Err(format!(
                        "dep {} needs parent_table and join, or sources",
                        raw.table
                    ))
                }
            }
        } else {
            if raw.parent_table.is_some() || raw.join.is_some() || raw.filter.is_some() {
                return Err(format!(
                    "dep {} mixes sources with parent_table/join/where",
                    raw.table
                ));
            }
            DepKind::Union {
                sources: raw.sources,
            }
        };

        let pk_mod = match (raw.shard_by, raw.shard_key, raw.shard_count) {
            (None, None, None) => None,
            (Some(ShardBy::PkMod), Some(key), Some(count)) => Some(PkMod { key, count }),
            _ => {
                return Err(format!(
                    "dep {}: shard_by: pk_mod requires shard_key and shard_count",
                    raw.table
                ))
            }
        };

        Ok(Dep {
            table: raw.table,
            kind,
            distinct: raw.distinct,
            pk_mod,
        })
    }
}

impl From<Dep> for DepConfig {
    fn from(dep: Dep) -> Self {
        let (parent_table, join, filter, sources) = match dep.kind {
            DepKind::Join {
                parent,
                join,
                filter,
            } => (Some(parent), Some(join), filter, Vec::new()),
            DepKind::Union { sources } => (None, None, None, sources),
        };
        let (shard_by, shard_key, shard_count) = match dep.pk_mod {
            Some(PkMod { key, count }) => (Some(ShardBy::PkMod), Some(key), Some(count)),
            None => (None, None, None),
        };
        DepConfig {
            table: dep.table,
            parent_table,
            join,
            filter,
            distinct: dep.distinct,
            sources,
            shard_by,
            shard_key,
            shard_count,
        }
    }
}

/// Union source as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    pub join: String,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl TryFrom<SourceConfig> for Source {
    type Error = String;

    fn try_from(raw: SourceConfig) -> std::result::Result<Self, Self::Error> {
        match (raw.parent_table, raw.selection) {
            (Some(table), None) => Ok(Source::Parent {
                table,
                join: raw.join,
                filter: raw.filter,
            }),
            (None, Some(root)) => Ok(Source::Selection {
                root,
                join: raw.join,
                filter: raw.filter,
            }),
            _ => Err("a source needs exactly one of parent_table or selection".to_string()),
        }
    }
}

impl From<Source> for SourceConfig {
    fn from(source: Source) -> Self {
        match source {
            Source::Parent {
                table,
                join,
                filter,
            } => SourceConfig {
                parent_table: Some(table),
                selection: None,
                join,
                filter,
            },
            Source::Selection { root, join, filter } => SourceConfig {
                parent_table: None,
                selection: Some(root),
                join,
                filter,
            },
        }
    }
}

/// Redaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuterConfig {
    /// Run the Neuter phase as part of `run` (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent updates (default: run.fanout_parallel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,

    /// Rules per destination table.
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<NeuterRule>>,
}

/// One column rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuterRule {
    pub column: String,

    #[serde(flatten)]
    pub strategy: NeuterStrategy,

    /// Split the update into key-modulo slices run in parallel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<NeuterShard>,
}

/// Deterministic column rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum NeuterStrategy {
    /// Prepend `value`, truncated to the column's length limit.
    Prefix {
        value: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skip_patterns: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_pattern: Option<String>,
    },
    /// Overwrite with a constant.
    Replace { value: String },
    /// md5 of salt and value.
    Hash {
        #[serde(default)]
        salt: String,
    },
    /// Replace all but the last `keep_last` characters.
    Mask {
        #[serde(default = "default_mask_char")]
        mask_char: String,
        #[serde(default)]
        keep_last: u32,
    },
}

impl NeuterStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            NeuterStrategy::Prefix { .. } => "prefix",
            NeuterStrategy::Replace { .. } => "replace",
            NeuterStrategy::Hash { .. } => "hash",
            NeuterStrategy::Mask { .. } => "mask",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuterShard {
    pub column: String,
    pub modulo: u32,
}

/// Concurrency settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Concurrent Create/Load/reconcile tasks (default: 8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout_parallel: Option<usize>,

    /// Concurrent validation tasks (default: 16).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_parallel: Option<usize>,
}

impl RunConfig {
    pub fn get_fanout_parallel(&self) -> usize {
        self.fanout_parallel.unwrap_or(8)
    }

    pub fn get_validate_parallel(&self) -> usize {
        self.validate_parallel.unwrap_or(16)
    }
}

/// Reconciliation toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_true")]
    pub primary_keys: bool,
    #[serde(default = "default_true")]
    pub indexes: bool,
    #[serde(default = "default_true")]
    pub constraints: bool,
    #[serde(default = "default_true")]
    pub sequences: bool,
    #[serde(default = "default_true")]
    pub column_defaults: bool,
    #[serde(default = "default_true")]
    pub functions: bool,
    #[serde(default = "default_true")]
    pub triggers: bool,
    #[serde(default = "default_true")]
    pub drop_extra_constraints: bool,
    #[serde(default = "default_true")]
    pub drop_extra_triggers: bool,
    #[serde(default)]
    pub drop_extra_sequences: bool,
    /// Check and validate foreign keys after adding them `NOT VALID`.
    #[serde(default = "default_true")]
    pub validate_foreign_keys: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            primary_keys: true,
            indexes: true,
            constraints: true,
            sequences: true,
            column_defaults: true,
            functions: true,
            triggers: true,
            drop_extra_constraints: true,
            drop_extra_triggers: true,
            drop_extra_sequences: false,
            validate_foreign_keys: true,
        }
    }
}

fn default_source_schema() -> String {
    "public".to_string()
}

fn default_dest_schema() -> String {
    "stage".to_string()
}

fn default_shards_schema() -> String {
    "shards".to_string()
}

fn default_old_schema() -> String {
    "old".to_string()
}

fn default_url_env() -> String {
    "DATABASE_URL".to_string()
}

fn default_id_col() -> String {
    "id".to_string()
}

fn default_mask_char() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}
