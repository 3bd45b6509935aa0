//! Profile validation.
//!
//! Structural checks only: anything that needs the live catalog (table and column
//! existence) is checked by the family graph against the source snapshot.

use std::collections::HashSet;

use super::{ColumnRef, DepKind, NeuterStrategy, Profile, Selector, ShardStrategy, Source};
use crate::core::identifier::{validate_expression, validate_identifier};
use crate::plan::selection::bind_params;
use crate::error::{Result, SliceError};

/// Schemas that may never be dropped or used as scratch space.
const PROTECTED_SCHEMAS: &[&str] = &["public", "pg_catalog", "information_schema"];

/// Validate the profile.
pub fn validate(profile: &Profile) -> Result<()> {
    validate_schemas(profile)?;

    if profile.roots.is_empty()
        && profile.families.is_empty()
        && profile.precopy.is_empty()
        && profile.neuter.is_none()
    {
        return Err(SliceError::config(
            "profile defines no roots, families, precopy tables or neuter targets",
        ));
    }

    if let Some(0) = profile.run.fanout_parallel {
        return Err(SliceError::config("run.fanout_parallel must be at least 1"));
    }
    if let Some(0) = profile.run.validate_parallel {
        return Err(SliceError::config("run.validate_parallel must be at least 1"));
    }

    validate_roots(profile)?;
    validate_families(profile)?;
    validate_neuter(profile)?;
    Ok(())
}

fn validate_schemas(profile: &Profile) -> Result<()> {
    for (key, name) in [
        ("source_schema", &profile.source_schema),
        ("dest_schema", &profile.dest_schema),
        ("shards_schema", &profile.shards_schema),
        ("old_schema", &profile.old_schema),
    ] {
        validate_identifier(name).map_err(|e| SliceError::Config(format!("{}: {}", key, e)))?;
    }

    let banned = |name: &str| name == profile.source_schema || PROTECTED_SCHEMAS.contains(&name);
    if banned(&profile.dest_schema) {
        return Err(SliceError::Config(format!(
            "dest_schema '{}' would overwrite a protected schema",
            profile.dest_schema
        )));
    }
    if banned(&profile.shards_schema) || profile.shards_schema == profile.dest_schema {
        return Err(SliceError::Config(format!(
            "shards_schema '{}' is dropped after every load and cannot be a protected or destination schema",
            profile.shards_schema
        )));
    }
    if profile.old_schema == profile.source_schema || profile.old_schema == profile.dest_schema {
        return Err(SliceError::Config(format!(
            "old_schema '{}' must differ from source_schema and dest_schema",
            profile.old_schema
        )));
    }
    Ok(())
}

fn validate_roots(profile: &Profile) -> Result<()> {
    let mut names = HashSet::new();
    for root in &profile.roots {
        if root.name.is_empty() {
            return Err(SliceError::config("roots: name is required"));
        }
        if !names.insert(root.name.as_str()) {
            return Err(SliceError::Config(format!("duplicate root name '{}'", root.name)));
        }
        validate_identifier(&root.table)
            .map_err(|e| SliceError::Config(format!("root {}: {}", root.name, e)))?;
        validate_identifier(&root.id_col)
            .map_err(|e| SliceError::Config(format!("root {}: {}", root.name, e)))?;

        validate_selector(&root.name, &root.selector)?;

        if let Some(shard) = &root.shard {
            if shard.count == 0 {
                return Err(SliceError::Config(format!(
                    "root {}: shard.count must be at least 1",
                    root.name
                )));
            }
            match (shard.strategy, &shard.weights_sql) {
                (ShardStrategy::Weighted, None) => {
                    return Err(SliceError::Config(format!(
                        "root {}: weighted sharding requires shard.weights_sql",
                        root.name
                    )))
                }
                (_, Some(sql)) => {
                    validate_expression(sql, &format!("root {} weights_sql", root.name))?
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn validate_selector(root: &str, selector: &Selector) -> Result<()> {
    let context = |e: SliceError| SliceError::Config(format!("root {} selector: {}", root, e));
    match selector {
        Selector::List { .. } => {}
        Selector::Sql { sql, params } => {
            validate_expression(sql, &format!("root {} selector", root))?;
            bind_params(sql, params).map_err(context)?;
        }
        Selector::ReferencedBy { refs } => {
            if refs.is_empty() {
                return Err(SliceError::Config(format!(
                    "root {} selector: referenced_by needs at least one ref",
                    root
                )));
            }
            for column_ref in refs {
                validate_column_ref(column_ref).map_err(context)?;
            }
        }
        Selector::FkInStage {
            fk_column,
            stage_table,
            stage_id_col,
        } => {
            for name in [fk_column, stage_table, stage_id_col] {
                validate_identifier(name).map_err(context)?;
            }
        }
        Selector::RefersToStage { targets } => {
            if targets.is_empty() {
                return Err(SliceError::Config(format!(
                    "root {} selector: refers_to_stage needs at least one target",
                    root
                )));
            }
            for target in targets {
                for name in [&target.stage_table, &target.local_column, &target.stage_id_col] {
                    validate_identifier(name).map_err(context)?;
                }
            }
        }
        Selector::ReferencedByColumn {
            schema,
            column,
            extra_refs,
        } => {
            if let Some(schema) = schema {
                validate_identifier(schema).map_err(context)?;
            }
            validate_identifier(column).map_err(context)?;
            for column_ref in extra_refs {
                validate_column_ref(column_ref).map_err(context)?;
            }
        }
    }
    Ok(())
}

fn validate_column_ref(column_ref: &ColumnRef) -> Result<()> {
    if let Some(schema) = &column_ref.schema {
        validate_identifier(schema)?;
    }
    validate_identifier(&column_ref.table)?;
    validate_identifier(&column_ref.column)
}

fn validate_families(profile: &Profile) -> Result<()> {
    let mut family_names = HashSet::new();
    let mut tables: HashSet<&str> = HashSet::new();

    for table in profile
        .precopy
        .schema_only
        .iter()
        .chain(&profile.precopy.full_copy)
    {
        validate_identifier(table).map_err(|e| SliceError::Config(format!("precopy: {}", e)))?;
        if !tables.insert(table.as_str()) {
            return Err(SliceError::Config(format!(
                "table '{}' is listed more than once in precopy",
                table
            )));
        }
    }

    for family in &profile.families {
        if family.name.is_empty() {
            return Err(SliceError::config("families: name is required"));
        }
        if !family_names.insert(family.name.as_str()) {
            return Err(SliceError::Config(format!(
                "duplicate family name '{}'",
                family.name
            )));
        }
        let context = |what: &str| format!("family {} {}", family.name, what);

        validate_identifier(&family.root.table)
            .map_err(|e| SliceError::Config(format!("{}: {}", context("root"), e)))?;
        if let Some(selection) = &family.root.selection {
            if profile.root(selection).is_none() {
                return Err(SliceError::Config(format!(
                    "{} references unknown selection '{}'",
                    context("root"),
                    selection
                )));
            }
        }
        if let Some(join) = &family.root.join {
            validate_expression(join, &context("root join"))?;
        }

        for table in family.tables() {
            if !tables.insert(table) {
                return Err(SliceError::Config(format!(
                    "table '{}' is written by more than one family or precopy entry",
                    table
                )));
            }
        }

        for dep in &family.deps {
            validate_identifier(&dep.table)
                .map_err(|e| SliceError::Config(format!("{}: {}", context("dep"), e)))?;
            let dep_context = context(&format!("dep {}", dep.table));
            match &dep.kind {
                DepKind::Join {
                    parent,
                    join,
                    filter,
                } => {
                    validate_identifier(parent)?;
                    validate_expression(join, &format!("{} join", dep_context))?;
                    if let Some(filter) = filter {
                        validate_expression(filter, &format!("{} where", dep_context))?;
                    }
                }
                DepKind::Union { sources } => {
                    for source in sources {
                        if let Source::Selection { root, .. } = source {
                            if profile.root(root).is_none() {
                                return Err(SliceError::Config(format!(
                                    "{} references unknown selection '{}'",
                                    dep_context, root
                                )));
                            }
                        }
                        validate_expression(source.join(), &format!("{} join", dep_context))?;
                        if let Some(filter) = source.filter() {
                            validate_expression(filter, &format!("{} where", dep_context))?;
                        }
                    }
                }
            }
            if let Some(pk_mod) = &dep.pk_mod {
                if pk_mod.count == 0 {
                    return Err(SliceError::Config(format!(
                        "{}: shard_count must be at least 1",
                        dep_context
                    )));
                }
                validate_identifier(&pk_mod.key)?;
            }
        }
    }
    Ok(())
}

fn validate_neuter(profile: &Profile) -> Result<()> {
    let Some(neuter) = &profile.neuter else {
        return Ok(());
    };
    if let Some(0) = neuter.parallel {
        return Err(SliceError::config("neuter.parallel must be at least 1"));
    }
    for (table, rules) in &neuter.targets {
        validate_identifier(table)?;
        for rule in rules {
            validate_identifier(&rule.column)
                .map_err(|e| SliceError::Config(format!("neuter {}: {}", table, e)))?;
            if let Some(shard) = &rule.shard {
                validate_identifier(&shard.column)?;
                if shard.modulo == 0 {
                    return Err(SliceError::Config(format!(
                        "neuter {}.{}: shard.modulo must be at least 1",
                        table, rule.column
                    )));
                }
            }
            match &rule.strategy {
                NeuterStrategy::Prefix { value, .. } if value.is_empty() => {
                    return Err(SliceError::Config(format!(
                        "neuter {}.{}: prefix value cannot be empty",
                        table, rule.column
                    )));
                }
                NeuterStrategy::Mask { mask_char, .. } if mask_char.chars().count() != 1 => {
                    return Err(SliceError::Config(format!(
                        "neuter {}.{}: mask_char must be a single character",
                        table, rule.column
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}
