//! SQL builders for the row-selecting queries of copy tasks.
//!
//! In every query `d` aliases the source table being copied and `p` the parent:
//! a destination table already loaded, a per-shard staging table, or a
//! selection's id list.

use std::collections::BTreeSet;

use crate::config::{Dep, DepKind, Source};
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::Column;
use crate::error::{Result, SliceError};

use super::selection::{SelectionSet, ShardKey};

/// Source and destination schema names for query generation.
#[derive(Debug, Clone, Copy)]
pub struct Schemas<'a> {
    pub source: &'a str,
    pub dest: &'a str,
}

/// Every row of a source table.
pub fn full_copy(schemas: Schemas<'_>, table: &str) -> Result<String> {
    Ok(format!("SELECT d.* FROM {} d", qualify_pg(schemas.source, table)?))
}

/// No rows, only the structure of a source table.
pub fn structure_only(schemas: Schemas<'_>, table: &str) -> Result<String> {
    Ok(format!(
        "SELECT d.* FROM {} d WHERE false",
        qualify_pg(schemas.source, table)?
    ))
}

/// Rows of a root table matched by a selection query.
pub fn root_rows(
    schemas: Schemas<'_>,
    table: &str,
    id_col: &str,
    join: Option<&str>,
    selection: &str,
) -> Result<String> {
    let join = match join {
        Some(join) => join.to_string(),
        None => format!("d.{} = p.id", quote_pg(id_col)?),
    };
    Ok(format!(
        "SELECT d.* FROM {} d JOIN ({}) p ON ({})",
        qualify_pg(schemas.source, table)?,
        selection,
        join
    ))
}

/// Rows of a dependent table, optionally narrowed by an extra predicate on `d`.
pub fn dep_rows(
    schemas: Schemas<'_>,
    dep: &Dep,
    selections: &SelectionSet,
    extra: Option<&str>,
) -> Result<String> {
    let child = qualify_pg(schemas.source, &dep.table)?;
    let mut conditions: Vec<String> = Vec::new();

    let head = match &dep.kind {
        DepKind::Join {
            parent,
            join,
            filter,
        } => {
            let parent = qualify_pg(schemas.dest, parent)?;
            if dep.distinct {
                conditions.push(exists(&parent, join, filter.as_deref()));
                format!("SELECT d.* FROM {} d", child)
            } else {
                if let Some(filter) = filter {
                    conditions.push(format!("({})", filter));
                }
                format!("SELECT d.* FROM {} d JOIN {} p ON ({})", child, parent, join)
            }
        }
        DepKind::Union { sources } => {
            let mut paths = Vec::with_capacity(sources.len());
            for source in sources {
                let from = match source {
                    Source::Parent { table, .. } => qualify_pg(schemas.dest, table)?,
                    Source::Selection { root, .. } => {
                        let selection = selections.get(root).ok_or_else(|| {
                            SliceError::selection(root, "selection was not resolved before use")
                        })?;
                        format!("({})", selection.query())
                    }
                };
                paths.push(exists(&from, source.join(), source.filter()));
            }
            conditions.push(format!("({})", paths.join(" OR ")));
            format!("SELECT d.* FROM {} d", child)
        }
    };

    if let Some(extra) = extra {
        conditions.push(extra.to_string());
    }
    if conditions.is_empty() {
        Ok(head)
    } else {
        Ok(format!("{} WHERE {}", head, conditions.join(" AND ")))
    }
}

/// Name of the staging table holding shard `index` of a sharded root.
pub fn staging_table(table: &str, index: u32) -> String {
    format!("{}_sh{}", table, index)
}

/// One shard of the sharded inputs of a dependent table.
#[derive(Debug, Clone, Copy)]
pub struct ShardSlice<'a> {
    /// Schema holding the staging copies of sharded roots.
    pub shards_schema: &'a str,
    /// Sharded root tables written in the same stage.
    pub staged: &'a BTreeSet<String>,
    pub index: u32,
}

impl ShardSlice<'_> {
    fn staging(&self, table: &str, index: u32) -> Result<String> {
        qualify_pg(self.shards_schema, &staging_table(table, index))
    }
}

/// Rows of a dependent table reachable through one shard of its sharded inputs.
///
/// A plain join reads the parent's staging table for the shard. Semi-joins and
/// unions treat unsharded paths as belonging to shard 0 and leave rows reachable
/// through a lower shard to that shard's task, so every row is inserted once.
pub fn dep_shard_rows(
    schemas: Schemas<'_>,
    dep: &Dep,
    selections: &SelectionSet,
    slice: ShardSlice<'_>,
) -> Result<String> {
    let child = qualify_pg(schemas.source, &dep.table)?;

    let sources = match &dep.kind {
        DepKind::Join {
            parent,
            join,
            filter,
        } if !dep.distinct => {
            let from = if slice.staged.contains(parent) {
                slice.staging(parent, slice.index)?
            } else {
                qualify_pg(schemas.dest, parent)?
            };
            let head = format!("SELECT d.* FROM {} d JOIN {} p ON ({})", child, from, join);
            return Ok(match filter {
                Some(filter) => format!("{} WHERE ({})", head, filter),
                None => head,
            });
        }
        DepKind::Join {
            parent,
            join,
            filter,
        } => vec![Source::Parent {
            table: parent.clone(),
            join: join.clone(),
            filter: filter.clone(),
        }],
        DepKind::Union { sources } => sources.clone(),
    };

    let paths = |index: u32| -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for source in &sources {
            if let Some(from) = shard_source(schemas, source, selections, slice, index)? {
                paths.push(exists(&from, source.join(), source.filter()));
            }
        }
        Ok(paths)
    };

    let current = paths(slice.index)?;
    let mut conditions = vec![if current.is_empty() {
        "false".to_string()
    } else {
        format!("({})", current.join(" OR "))
    }];
    let mut lower = Vec::new();
    for index in 0..slice.index {
        lower.extend(paths(index)?);
    }
    if !lower.is_empty() {
        conditions.push(format!("NOT ({})", lower.join(" OR ")));
    }
    Ok(format!(
        "SELECT d.* FROM {} d WHERE {}",
        child,
        conditions.join(" AND ")
    ))
}

/// The relation a union path reads for shard `index`, if the path has one.
fn shard_source(
    schemas: Schemas<'_>,
    source: &Source,
    selections: &SelectionSet,
    slice: ShardSlice<'_>,
    index: u32,
) -> Result<Option<String>> {
    match source {
        Source::Parent { table, .. } if slice.staged.contains(table) => {
            slice.staging(table, index).map(Some)
        }
        Source::Parent { table, .. } if index == 0 => qualify_pg(schemas.dest, table).map(Some),
        Source::Parent { .. } => Ok(None),
        Source::Selection { root, .. } => {
            let selection = selections
                .get(root)
                .ok_or_else(|| SliceError::selection(root, "selection was not resolved before use"))?;
            let key = ShardKey::Index(index);
            if selection.is_sharded() {
                Ok(selection
                    .shards
                    .contains_key(&key)
                    .then(|| format!("({})", selection.shard_query(key))))
            } else if index == 0 {
                Ok(Some(format!("({})", selection.query())))
            } else {
                Ok(None)
            }
        }
    }
}

fn exists(from: &str, join: &str, filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!(
            "EXISTS (SELECT 1 FROM {} p WHERE ({}) AND ({}))",
            from, join, filter
        ),
        None => format!("EXISTS (SELECT 1 FROM {} p WHERE ({}))", from, join),
    }
}

/// Predicate keeping slice `index` of `count` by the key column.
///
/// Integer keys use their value, anything else a text hash.
pub fn pk_mod_predicate(key: &Column, count: u32, index: u32) -> Result<String> {
    let column = format!("d.{}", quote_pg(&key.name)?);
    if key.is_integer() {
        Ok(format!("({} % {}) = {}", column, count, index))
    } else {
        Ok(format!(
            "(abs(hashtext({}::text)) % {}) = {}",
            column, count, index
        ))
    }
}
