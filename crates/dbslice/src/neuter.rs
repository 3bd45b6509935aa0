//! Column redaction in the destination.
//!
//! Every rule becomes one bulk `UPDATE` per shard slice. The strategies are
//! deterministic and their `WHERE` clauses skip rows that already hold the
//! redacted value, so re-running the phase changes nothing. Only destination
//! tables are ever updated.

use std::collections::BTreeSet;

use tracing::info;

use crate::config::{NeuterConfig, NeuterRule, NeuterShard, NeuterStrategy, Profile};
use crate::core::identifier::{escape_like, qualify_pg, quote_literal, quote_pg};
use crate::core::schema::{Column, SchemaSnapshot};
use crate::error::{Result, SliceError};
use crate::fanout::{Step, Unit, Wave};
use crate::plan::ShardKey;

/// Concurrent updates allowed for the Neuter phase.
pub fn parallelism(profile: &Profile) -> usize {
    profile
        .neuter
        .as_ref()
        .and_then(|n| n.parallel)
        .unwrap_or_else(|| profile.run.get_fanout_parallel())
}

/// Plan the updates for every target, or only for the tables in `only`.
///
/// Rule k of a table runs in wave k, so rules on one table never overlap; the
/// shard slices of a rule run in parallel.
pub fn plan(
    config: &NeuterConfig,
    dest: &SchemaSnapshot,
    only: Option<&[String]>,
) -> Result<Vec<Wave>> {
    if let Some(only) = only {
        for table in only {
            if !config.targets.contains_key(table) {
                return Err(SliceError::config(format!(
                    "table {} has no neuter rules",
                    table
                )));
            }
        }
    }
    let selected: Option<BTreeSet<&str>> =
        only.map(|tables| tables.iter().map(String::as_str).collect());

    let mut waves: Vec<Wave> = Vec::new();
    for (table_name, rules) in &config.targets {
        if selected
            .as_ref()
            .is_some_and(|s| !s.contains(table_name.as_str()))
        {
            continue;
        }
        let table = dest
            .table(table_name)
            .ok_or_else(|| SliceError::missing_table(table_name))?;
        let target = qualify_pg(&dest.schema, table_name)?;

        for (index, rule) in rules.iter().enumerate() {
            let column = table
                .column(&rule.column)
                .ok_or_else(|| SliceError::missing_column(table_name, &rule.column))?;
            if let Some(shard) = &rule.shard {
                if !table.has_column(&shard.column) {
                    return Err(SliceError::missing_column(table_name, &shard.column));
                }
            }
            if waves.len() <= index {
                waves.push(Wave::default());
            }
            waves[index].units.extend(units(&target, table_name, column, rule)?);
        }
        info!("neuter {}: {} rule(s)", table_name, rules.len());
    }
    Ok(waves)
}

fn units(target: &str, table: &str, column: &Column, rule: &NeuterRule) -> Result<Vec<Unit>> {
    let label = format!("{} {}", rule.strategy.name(), rule.column);
    match &rule.shard {
        None => Ok(vec![Unit::statements(
            table,
            label,
            vec![update_sql(target, column, &rule.strategy, None)?],
        )]),
        Some(shard) => (0..shard.modulo)
            .map(|slice| {
                Ok(Unit {
                    table: table.to_string(),
                    shard: ShardKey::Index(slice),
                    label: label.clone(),
                    steps: vec![Step::Execute(update_sql(
                        target,
                        column,
                        &rule.strategy,
                        Some((shard, slice)),
                    )?)],
                })
            })
            .collect(),
    }
}

/// The `UPDATE` applying `strategy` to `column`, optionally restricted to one slice.
pub fn update_sql(
    target: &str,
    column: &Column,
    strategy: &NeuterStrategy,
    slice: Option<(&NeuterShard, u32)>,
) -> Result<String> {
    let col = quote_pg(&column.name)?;
    let fit = |expr: String| match column.char_max_length {
        Some(limit) => format!("left({}, {})", expr, limit),
        None => expr,
    };

    let (value, mut conditions) = match strategy {
        NeuterStrategy::Prefix {
            value,
            skip_patterns,
            skip_pattern,
        } => {
            let mut conditions = vec![
                format!("{} IS NOT NULL", col),
                format!("{} <> ''", col),
                format!(
                    "{} NOT LIKE {}",
                    col,
                    quote_literal(&format!("{}%", escape_like(value)))
                ),
            ];
            for pattern in skip_patterns.iter().chain(skip_pattern.iter()) {
                conditions.push(format!("{} NOT ILIKE {}", col, quote_literal(pattern)));
            }
            (fit(format!("{} || {}", quote_literal(value), col)), conditions)
        }
        NeuterStrategy::Replace { value } => {
            let value = quote_literal(value);
            let condition = format!("{} IS DISTINCT FROM {}", col, value);
            (value, vec![condition])
        }
        NeuterStrategy::Hash { salt } => (
            fit(format!("md5({} || {}::text)", quote_literal(salt), col)),
            vec![
                format!("{} IS NOT NULL", col),
                // Already a digest, possibly cut to the column width.
                format!(
                    "{}::text !~ {}",
                    col,
                    quote_literal(&digest_pattern(column.char_max_length))
                ),
            ],
        ),
        NeuterStrategy::Mask {
            mask_char,
            keep_last,
        } => {
            let masked = format!(
                "repeat({}, greatest(length({}) - {}, 0)) || right({}, {})",
                quote_literal(mask_char),
                col,
                keep_last,
                col,
                keep_last
            );
            let condition = format!("{} IS DISTINCT FROM {}", col, masked);
            (
                masked,
                vec![format!("{} IS NOT NULL", col), condition],
            )
        }
    };

    if let Some((shard, index)) = slice {
        conditions.push(shard_predicate(&shard.column, shard.modulo, index)?);
    }

    Ok(format!(
        "UPDATE {} SET {} = {} WHERE {}",
        target,
        col,
        value,
        conditions.join(" AND ")
    ))
}

/// Pattern matching an md5 digest stored in a column of width `limit`.
pub fn digest_pattern(limit: Option<i32>) -> String {
    let len = limit.map_or(MD5_HEX_LEN, |l| l.clamp(1, MD5_HEX_LEN));
    format!("^[0-9a-f]{{{}}}$", len)
}

const MD5_HEX_LEN: i32 = 32;

/// Non-negative modulo slice predicate, so negative keys land in a slice too.
pub fn shard_predicate(column: &str, modulo: u32, index: u32) -> Result<String> {
    Ok(format!(
        "(({} % {}) + {}) % {} = {}",
        quote_pg(column)?,
        modulo,
        modulo,
        modulo,
        index
    ))
}
