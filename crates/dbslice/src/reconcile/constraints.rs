//! NOT NULL, unique, check, exclusion and foreign key constraints.
//!
//! Foreign keys are added `NOT VALID` one at a time: adding one locks both the
//! child and the referenced table, and the rows are checked later by the
//! validation pass.

use tracing::warn;

use super::ReconcileContext;
use crate::core::identifier::quote_pg;
use crate::core::schema::{Constraint, ConstraintKind, Table};
use crate::error::Result;
use crate::fanout::{Unit, Wave};

/// Wave 0 handles columns and non-FK constraints per table; wave 1 runs FKs serially.
pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    if !ctx.options.constraints {
        return Ok(Vec::new());
    }

    let mut tables = Vec::new();
    let mut foreign = Vec::new();

    for (src, dst) in ctx.tables() {
        let target = ctx.target(&src.name)?;

        let statements = table_statements(ctx, &target, src, dst)?;
        if !statements.is_empty() {
            tables.push(Unit::statements(&src.name, "constraints", statements));
        }

        for fk in src.foreign_keys() {
            if let Some(reference) = &fk.foreign {
                if reference.ref_schema == ctx.source.schema
                    && !ctx.dest.has_table(&reference.ref_table)
                {
                    warn!(
                        "skipping {} on {}: {} was not copied",
                        fk.name, src.name, reference.ref_table
                    );
                    continue;
                }
            }
            let wanted = strip_not_valid(&fk.definition);
            let mut statements = Vec::new();
            if let Some(existing) = dst.constraint(&fk.name) {
                if ctx.same(wanted, strip_not_valid(&existing.definition)) {
                    continue;
                }
                statements.push(drop_constraint(&target, &fk.name)?);
            }
            statements.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {} NOT VALID",
                target,
                quote_pg(&fk.name)?,
                ctx.rewrite(wanted)
            ));
            foreign.push(Unit::statements(
                &src.name,
                format!("foreign key {}", fk.name),
                statements,
            ));
        }

        if ctx.options.drop_extra_constraints {
            for extra in dst
                .foreign_keys()
                .filter(|c| src.constraint(&c.name).is_none())
            {
                foreign.push(Unit::statements(
                    &src.name,
                    format!("drop {}", extra.name),
                    vec![drop_constraint(&target, &extra.name)?],
                ));
            }
        }
    }

    Ok(vec![Wave::parallel(tables), Wave::serial(foreign)])
}

/// Column nullability first, then unique/check/exclusion constraints.
fn table_statements(
    ctx: &ReconcileContext<'_>,
    target: &str,
    src: &Table,
    dst: &Table,
) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let key_columns: &[String] = dst
        .primary_key
        .as_ref()
        .map(|pk| pk.columns.as_slice())
        .unwrap_or_default();

    for column in &src.columns {
        let Some(existing) = dst.column(&column.name) else {
            continue;
        };
        if !column.nullable && existing.nullable {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                target,
                quote_pg(&column.name)?
            ));
        } else if column.nullable && !existing.nullable && !key_columns.contains(&column.name) {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                target,
                quote_pg(&column.name)?
            ));
        }
    }

    for constraint in src.constraints.iter().filter(|c| !is_foreign(c)) {
        if let Some(existing) = dst.constraint(&constraint.name) {
            if ctx.same(&constraint.definition, &existing.definition) {
                continue;
            }
            statements.push(drop_constraint(target, &constraint.name)?);
        }
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            target,
            quote_pg(&constraint.name)?,
            ctx.rewrite(&constraint.definition)
        ));
    }

    if ctx.options.drop_extra_constraints {
        for extra in dst
            .constraints
            .iter()
            .filter(|c| !is_foreign(c) && src.constraint(&c.name).is_none())
        {
            statements.push(drop_constraint(target, &extra.name)?);
        }
    }
    Ok(statements)
}

fn is_foreign(constraint: &Constraint) -> bool {
    constraint.kind == ConstraintKind::ForeignKey
}

fn drop_constraint(target: &str, name: &str) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
        target,
        quote_pg(name)?
    ))
}

fn strip_not_valid(definition: &str) -> &str {
    let trimmed = definition.trim_end();
    trimmed.strip_suffix(" NOT VALID").unwrap_or(trimmed)
}
