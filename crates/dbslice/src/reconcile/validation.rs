//! Foreign key validation.
//!
//! Each child table gets one unit: for every unvalidated foreign key it counts
//! orphaned rows with an anti-join, fails with the count if there are any, and
//! otherwise marks the constraint valid. Children are checked in parallel.

use super::ReconcileContext;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::ForeignKeyRef;
use crate::error::Result;
use crate::fanout::{Step, Unit, Wave};
use crate::plan::ShardKey;
use tracing::info;

pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    if !ctx.options.validate_foreign_keys {
        info!("Foreign key validation disabled, constraints stay NOT VALID");
        return Ok(Vec::new());
    }
    let mut units = Vec::new();

    for (src, dst) in ctx.tables() {
        let target = ctx.target(&src.name)?;
        let mut steps = Vec::new();
        for fk in dst.foreign_keys().filter(|c| !c.validated) {
            if let Some(reference) = &fk.foreign {
                steps.push(Step::ExpectNone {
                    sql: orphan_count(&target, reference)?,
                    constraint: fk.name.clone(),
                });
            }
            steps.push(Step::Execute(format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                target,
                quote_pg(&fk.name)?
            )));
        }
        if !steps.is_empty() {
            units.push(Unit {
                table: src.name.clone(),
                shard: ShardKey::Global,
                label: "validate foreign keys".to_string(),
                steps,
            });
        }
    }
    Ok(vec![Wave::parallel(units)])
}

/// Rows of `child` whose non-null key has no referenced row (MATCH SIMPLE).
fn orphan_count(child: &str, reference: &ForeignKeyRef) -> Result<String> {
    let mut present = Vec::new();
    let mut matches = Vec::new();
    for (column, ref_column) in reference.columns.iter().zip(&reference.ref_columns) {
        let column = quote_pg(column)?;
        present.push(format!("c.{} IS NOT NULL", column));
        matches.push(format!("r.{} = c.{}", quote_pg(ref_column)?, column));
    }
    Ok(format!(
        "SELECT count(*)::bigint FROM {} c WHERE {} AND NOT EXISTS (SELECT 1 FROM {} r WHERE {})",
        child,
        present.join(" AND "),
        qualify_pg(&reference.ref_schema, &reference.ref_table)?,
        matches.join(" AND ")
    ))
}
