//! Primary keys and secondary indexes.

use tracing::debug;

use super::ReconcileContext;
use crate::core::identifier::quote_pg;
use crate::error::Result;
use crate::fanout::{Unit, Wave};

/// Wave 0 adds missing primary keys, wave 1 recreates secondary indexes.
pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    let mut keys = Vec::new();
    let mut indexes = Vec::new();

    for (src, dst) in ctx.tables() {
        let target = ctx.target(&src.name)?;

        if ctx.options.primary_keys {
            if let (Some(pk), None) = (&src.primary_key, &dst.primary_key) {
                let columns = pk
                    .columns
                    .iter()
                    .map(|c| quote_pg(c))
                    .collect::<Result<Vec<_>>>()?;
                keys.push(Unit::statements(
                    &src.name,
                    format!("primary key {}", pk.name),
                    vec![format!(
                        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                        target,
                        quote_pg(&pk.name)?,
                        columns.join(", ")
                    )],
                ));
            }
        }

        if ctx.options.indexes {
            for index in &src.indexes {
                // Constraint-backed indexes come with their constraint.
                if index.backs_constraint {
                    continue;
                }
                if dst.indexes.iter().any(|i| i.name == index.name) {
                    debug!("index {} already present on {}", index.name, target);
                    continue;
                }
                indexes.push(Unit::statements(
                    &src.name,
                    format!("index {}", index.name),
                    vec![if_not_exists(&ctx.rewrite(&index.definition))],
                ));
            }
        }
    }

    Ok(vec![Wave::parallel(keys), Wave::parallel(indexes)])
}

/// Make a `CREATE [UNIQUE] INDEX` statement idempotent.
fn if_not_exists(definition: &str) -> String {
    if definition.contains(" IF NOT EXISTS ") {
        return definition.to_string();
    }
    definition.replacen(" INDEX ", " INDEX IF NOT EXISTS ", 1)
}
