//! Turn a stage's family graph into Create and Load tasks.
//!
//! Tables whose rows can be selected in one statement are built by a single
//! create-as-select in the Create phase, at a wave equal to their depth in the
//! graph. Tables that need several writers (sharded roots, `pk_mod` deps) and every
//! descendant of such a table are created empty in Create wave 0 and filled by
//! inserts in the Load phase, again waved by depth. Deps reading a sharded root
//! or a sharded selection are filled by one insert per shard.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Dep, FamilyConfig, Profile, RootPhase};
use crate::core::identifier::qualify_pg;
use crate::core::schema::SchemaSnapshot;
use crate::error::{Result, SliceError};

use super::graph::{FamilyGraph, NodeKind};
use super::query::{self, Schemas, ShardSlice};
use super::selection::{RootSelection, SelectionSet, ShardKey};
use super::{Operation, Task};

/// Everything needed to plan one stage.
pub struct StageInput<'a> {
    pub profile: &'a Profile,
    pub stage: RootPhase,
    pub selections: &'a SelectionSet,
    pub source: &'a SchemaSnapshot,
    /// Destination as it was before the stage.
    pub dest: &'a SchemaSnapshot,
    /// Tables written (or skipped as complete) by earlier stages.
    pub earlier: &'a BTreeSet<String>,
    pub scope: &'a CopyScope,
}

/// The part of a profile a run copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CopyScope {
    #[default]
    All,
    /// Precopy tables only; no roots are selected.
    PrecopyOnly,
    /// The named families only, without precopy.
    Families(BTreeSet<String>),
}

impl CopyScope {
    pub fn includes_family(&self, name: &str) -> bool {
        match self {
            CopyScope::All => true,
            CopyScope::PrecopyOnly => false,
            CopyScope::Families(names) => names.contains(name),
        }
    }

    pub fn includes_precopy(&self) -> bool {
        !matches!(self, CopyScope::Families(_))
    }

    /// Fail on family names the profile does not define.
    pub fn check(&self, profile: &Profile) -> Result<()> {
        if let CopyScope::Families(names) = self {
            if names.is_empty() {
                return Err(SliceError::config("no families given"));
            }
            for name in names {
                lookup_family(profile, name)?;
            }
        }
        Ok(())
    }

    /// Tables the scope writes, or `None` for the whole profile.
    pub fn tables<'a>(&self, profile: &'a Profile) -> Option<BTreeSet<&'a str>> {
        match self {
            CopyScope::All => None,
            CopyScope::PrecopyOnly => Some(
                profile
                    .precopy
                    .schema_only
                    .iter()
                    .chain(&profile.precopy.full_copy)
                    .map(String::as_str)
                    .collect(),
            ),
            CopyScope::Families(_) => Some(
                profile
                    .families
                    .iter()
                    .filter(|f| self.includes_family(&f.name))
                    .flat_map(|f| f.tables())
                    .collect(),
            ),
        }
    }

    /// Roots whose selection some family in scope reads.
    pub fn roots<'a>(&self, profile: &'a Profile) -> BTreeSet<&'a str> {
        profile
            .families
            .iter()
            .filter(|f| self.includes_family(&f.name))
            .flat_map(|f| {
                f.root
                    .selection
                    .as_deref()
                    .into_iter()
                    .chain(f.deps.iter().flat_map(|d| d.selections()))
            })
            .collect()
    }
}

/// Tasks of one stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyPlan {
    pub create: Vec<Task>,
    pub load: Vec<Task>,
    /// Whether per-shard staging tables are used.
    pub staging_used: bool,
    /// Tables written, in topological order.
    pub tables: Vec<String>,
    /// Tables already complete in the destination, written or not.
    pub present: BTreeSet<String>,
    pub skipped_families: Vec<String>,
    pub skipped_precopy: Vec<String>,
}

impl CopyPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.load.is_empty()
    }
}

/// Plan the Create and Load tasks of a stage.
pub fn resolve(input: &StageInput<'_>) -> Result<CopyPlan> {
    let profile = input.profile;
    let schemas = Schemas {
        source: &profile.source_schema,
        dest: &profile.dest_schema,
    };
    // A table left logged by a finished run is complete; unlogged ones are re-copied.
    let complete = |table: &str| input.dest.table(table).is_some_and(|t| !t.unlogged);

    let mut plan = CopyPlan::default();
    let mut existing = input.earlier.clone();

    let mut families: Vec<&FamilyConfig> = Vec::new();
    for family in profile
        .families
        .iter()
        .filter(|f| profile.family_phase(f) == input.stage)
    {
        let tables = family.tables();
        if !input.scope.includes_family(&family.name) {
            debug!("Family {} is out of scope", family.name);
            // Deps in scope may still join against what it left in the destination.
            existing.extend(
                tables
                    .into_iter()
                    .filter(|t| input.dest.has_table(t))
                    .map(str::to_string),
            );
            continue;
        }
        if tables.iter().all(|t| complete(t)) {
            info!(
                "Skipping family {}: all {} table(s) already present in {}",
                family.name,
                tables.len(),
                profile.dest_schema
            );
            plan.skipped_families.push(family.name.clone());
            existing.extend(tables.into_iter().map(str::to_string));
        } else {
            families.push(family);
        }
    }

    let mut precopy: Vec<String> = Vec::new();
    if input.stage == RootPhase::Pre {
        for table in profile
            .precopy
            .schema_only
            .iter()
            .chain(&profile.precopy.full_copy)
        {
            if !input.scope.includes_precopy() {
                if input.dest.has_table(table) {
                    existing.insert(table.clone());
                }
            } else if complete(table) {
                info!("Skipping precopy table {}: already present", table);
                plan.skipped_precopy.push(table.clone());
                existing.insert(table.clone());
            } else {
                precopy.push(table.clone());
            }
        }
    }

    let graph = FamilyGraph::build(profile, &families, &precopy, &existing, input.source)?;
    let staged = staged_roots(profile, &graph, input.selections)?;
    let loaded = load_phase_tables(profile, &graph, input.selections, &staged)?;
    let staged_tables: BTreeSet<String> = staged.keys().cloned().collect();

    for table in graph.written() {
        plan.tables.push(table.to_string());
        let target = qualify_pg(&profile.dest_schema, table)?;
        let wave = graph.depth(table);
        let create = |source_query: String, wave: usize| Task {
            table: table.to_string(),
            target: target.clone(),
            shard: ShardKey::Global,
            operation: Operation::CreateAsSelect,
            source_query,
            wave,
        };

        match graph.kind(table) {
            Some(NodeKind::Precopy) => {
                let source_query = if profile.precopy.schema_only.iter().any(|t| t == table) {
                    query::structure_only(schemas, table)?
                } else {
                    query::full_copy(schemas, table)?
                };
                plan.create.push(create(source_query, 0));
            }
            Some(NodeKind::Root { family }) => {
                let family = lookup_family(profile, family)?;
                let selection = match family.root.selection.as_deref() {
                    Some(name) => Some(input.selections.get(name).ok_or_else(|| {
                        SliceError::selection(name, "selection was not resolved before planning")
                    })?),
                    None => None,
                };
                match selection {
                    None => plan
                        .create
                        .push(create(query::structure_only(schemas, table)?, wave)),
                    Some(selection) if selection.is_sharded() => {
                        plan.staging_used = true;
                        plan.create
                            .push(create(query::structure_only(schemas, table)?, 0));
                        for shard in selection.shards.keys() {
                            let ShardKey::Index(i) = shard else { continue };
                            let staging = qualify_pg(
                                &profile.shards_schema,
                                &query::staging_table(table, *i),
                            )?;
                            plan.create.push(Task {
                                table: table.to_string(),
                                target: staging.clone(),
                                shard: *shard,
                                operation: Operation::CreateAsSelect,
                                source_query: query::root_rows(
                                    schemas,
                                    table,
                                    &family.root.id_col,
                                    family.root.join.as_deref(),
                                    &selection.shard_query(*shard),
                                )?,
                                wave: 0,
                            });
                            plan.load.push(Task {
                                table: table.to_string(),
                                target: target.clone(),
                                shard: *shard,
                                operation: Operation::Insert,
                                source_query: format!("SELECT * FROM {}", staging),
                                wave: 0,
                            });
                        }
                    }
                    Some(selection) => plan.create.push(create(
                        query::root_rows(
                            schemas,
                            table,
                            &family.root.id_col,
                            family.root.join.as_deref(),
                            &selection.query(),
                        )?,
                        wave,
                    )),
                }
            }
            Some(NodeKind::Dep { family, index }) => {
                let family = lookup_family(profile, family)?;
                let dep = family.deps.get(*index).ok_or_else(|| {
                    SliceError::Config(format!("family {} has no dep #{}", family.name, index))
                })?;

                if !loaded.contains(table) {
                    plan.create.push(create(
                        query::dep_rows(schemas, dep, input.selections, None)?,
                        wave,
                    ));
                    continue;
                }

                plan.create
                    .push(create(query::structure_only(schemas, table)?, 0));
                match &dep.pk_mod {
                    Some(pk_mod) => {
                        let key = input
                            .source
                            .table(table)
                            .and_then(|t| t.column(&pk_mod.key))
                            .ok_or_else(|| SliceError::missing_column(table, &pk_mod.key))?;
                        for i in 0..pk_mod.count {
                            let predicate = query::pk_mod_predicate(key, pk_mod.count, i)?;
                            plan.load.push(Task {
                                table: table.to_string(),
                                target: target.clone(),
                                shard: ShardKey::Index(i),
                                operation: Operation::Insert,
                                source_query: query::dep_rows(
                                    schemas,
                                    dep,
                                    input.selections,
                                    Some(&predicate),
                                )?,
                                wave,
                            });
                        }
                    }
                    None => {
                        let shards = dep_shards(dep, &staged, input.selections);
                        if shards.is_empty() {
                            plan.load.push(Task {
                                table: table.to_string(),
                                target: target.clone(),
                                shard: ShardKey::Global,
                                operation: Operation::Insert,
                                source_query: query::dep_rows(
                                    schemas,
                                    dep,
                                    input.selections,
                                    None,
                                )?,
                                wave,
                            });
                        }
                        for i in shards {
                            let slice = ShardSlice {
                                shards_schema: &profile.shards_schema,
                                staged: &staged_tables,
                                index: i,
                            };
                            plan.load.push(Task {
                                table: table.to_string(),
                                target: target.clone(),
                                shard: ShardKey::Index(i),
                                operation: Operation::Insert,
                                source_query: query::dep_shard_rows(
                                    schemas,
                                    dep,
                                    input.selections,
                                    slice,
                                )?,
                                wave,
                            });
                        }
                    }
                }
            }
            Some(NodeKind::Existing) | None => {}
        }
    }

    plan.present = existing;
    plan.present.extend(plan.tables.iter().cloned());

    debug!(
        "Stage {}: {} create task(s), {} load task(s), {} table(s)",
        input.stage.as_str(),
        plan.create.len(),
        plan.load.len(),
        plan.tables.len()
    );
    Ok(plan)
}

fn lookup_family<'a>(profile: &'a Profile, name: &str) -> Result<&'a FamilyConfig> {
    profile
        .family(name)
        .ok_or_else(|| SliceError::Config(format!("unknown family '{}'", name)))
}

/// Root tables of this stage whose selection is sharded, with their shard indexes.
fn staged_roots(
    profile: &Profile,
    graph: &FamilyGraph,
    selections: &SelectionSet,
) -> Result<BTreeMap<String, BTreeSet<u32>>> {
    let mut staged = BTreeMap::new();
    for table in graph.written() {
        if let Some(NodeKind::Root { family }) = graph.kind(table) {
            let selection = lookup_family(profile, family)?
                .root
                .selection
                .as_deref()
                .and_then(|name| selections.get(name))
                .filter(|s| s.is_sharded());
            if let Some(selection) = selection {
                staged.insert(table.to_string(), shard_indexes(selection));
            }
        }
    }
    Ok(staged)
}

fn shard_indexes(selection: &RootSelection) -> BTreeSet<u32> {
    selection
        .shards
        .keys()
        .filter_map(|key| match key {
            ShardKey::Index(i) => Some(*i),
            ShardKey::Global => None,
        })
        .collect()
}

/// Shard indexes a dep is loaded in, empty when none of its inputs is sharded.
fn dep_shards(
    dep: &Dep,
    staged: &BTreeMap<String, BTreeSet<u32>>,
    selections: &SelectionSet,
) -> BTreeSet<u32> {
    let mut shards = BTreeSet::new();
    for parent in dep.parent_tables() {
        if let Some(indexes) = staged.get(parent) {
            shards.extend(indexes);
        }
    }
    for root in dep.selections() {
        if let Some(selection) = selections.get(root).filter(|s| s.is_sharded()) {
            shards.extend(shard_indexes(selection));
        }
    }
    shards
}

/// Tables written by more than one task, and everything below them.
fn load_phase_tables(
    profile: &Profile,
    graph: &FamilyGraph,
    selections: &SelectionSet,
    staged: &BTreeMap<String, BTreeSet<u32>>,
) -> Result<HashSet<String>> {
    let mut loaded = HashSet::new();
    for table in graph.written() {
        let split = match graph.kind(table) {
            Some(NodeKind::Root { .. }) => staged.contains_key(table),
            Some(NodeKind::Dep { family, index }) => lookup_family(profile, family)?
                .deps
                .get(*index)
                .is_some_and(|d| {
                    d.pk_mod.is_some() || !dep_shards(d, staged, selections).is_empty()
                }),
            _ => false,
        };
        if split || graph.parents(table).iter().any(|p| loaded.contains(*p)) {
            loaded.insert(table.to_string());
        }
    }
    Ok(loaded)
}
