//! Sequences and column defaults.
//!
//! A sequence's next value is set to at least one past the largest copied key, so
//! inserts into the destination never collide with copied rows. `setval` is
//! absolute, which makes the phase safe to re-run.

use super::ReconcileContext;
use crate::core::identifier::{qualify_pg, quote_literal, quote_pg};
use crate::core::schema::Sequence;
use crate::error::Result;
use crate::fanout::{Unit, Wave};

/// Wave 0 creates and positions sequences, wave 1 applies column defaults,
/// wave 2 drops extraneous destination sequences.
pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    let mut sequences = Vec::new();
    let mut defaults = Vec::new();
    let mut extras = Vec::new();

    if ctx.options.sequences {
        for sequence in ctx.source.sequences.values() {
            if is_used(ctx, sequence) {
                sequences.push(Unit::statements(
                    owner_table(sequence),
                    format!("sequence {}", sequence.name),
                    sequence_statements(ctx, sequence)?,
                ));
            }
        }
    }

    if ctx.options.column_defaults {
        for (src, dst) in ctx.tables() {
            let target = ctx.target(&src.name)?;
            let mut statements = Vec::new();
            for column in &src.columns {
                let Some(existing) = dst.column(&column.name) else {
                    continue;
                };
                match (&column.default, &existing.default) {
                    (Some(wanted), Some(current)) if ctx.same_default(wanted, current) => {}
                    (Some(wanted), _) => statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                        target,
                        quote_pg(&column.name)?,
                        ctx.rewrite_default(wanted)
                    )),
                    (None, Some(_)) => statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                        target,
                        quote_pg(&column.name)?
                    )),
                    (None, None) => {}
                }
            }
            if !statements.is_empty() {
                defaults.push(Unit::statements(&src.name, "column defaults", statements));
            }
        }
    }

    if ctx.options.drop_extra_sequences {
        for extra in ctx
            .dest
            .sequences
            .values()
            .filter(|s| !ctx.source.sequences.contains_key(&s.name))
        {
            extras.push(Unit::statements(
                owner_table(extra),
                format!("drop sequence {}", extra.name),
                vec![format!(
                    "DROP SEQUENCE IF EXISTS {}",
                    qualify_pg(&ctx.dest.schema, &extra.name)?
                )],
            ));
        }
    }

    Ok(vec![
        Wave::parallel(sequences),
        Wave::parallel(defaults),
        Wave::parallel(extras),
    ])
}

/// A sequence matters when its owner was copied or a copied column defaults to it.
fn is_used(ctx: &ReconcileContext<'_>, sequence: &Sequence) -> bool {
    if let Some((table, _)) = &sequence.owned_by {
        if ctx.dest.has_table(table) {
            return true;
        }
    }
    ctx.tables().any(|(src, _)| {
        src.columns.iter().any(|c| {
            c.default
                .as_deref()
                .is_some_and(|d| d.contains("nextval(") && d.contains(sequence.name.as_str()))
        })
    })
}

fn owner_table(sequence: &Sequence) -> &str {
    sequence
        .owned_by
        .as_ref()
        .map(|(table, _)| table.as_str())
        .unwrap_or(sequence.name.as_str())
}

fn sequence_statements(ctx: &ReconcileContext<'_>, sequence: &Sequence) -> Result<Vec<String>> {
    let name = qualify_pg(&ctx.dest.schema, &sequence.name)?;
    let mut statements = Vec::new();

    if !ctx.dest.sequences.contains_key(&sequence.name) {
        statements.push(format!(
            "CREATE SEQUENCE IF NOT EXISTS {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {}",
            name,
            sequence.data_type,
            sequence.increment,
            sequence.min_value,
            sequence.max_value,
            sequence.start_value
        ));
    }

    let owner = sequence.owned_by.as_ref().filter(|(table, column)| {
        ctx.dest
            .table(table)
            .is_some_and(|t| t.has_column(column))
    });

    let next = sequence.next_value();
    match owner {
        Some((table, column)) => {
            let target = ctx.target(table)?;
            statements.push(format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                name,
                target,
                quote_pg(column)?
            ));
            let value = if sequence.increment > 0 {
                format!(
                    "GREATEST({}, (SELECT COALESCE(MAX({}), 0) + 1 FROM {}))",
                    next,
                    quote_pg(column)?,
                    target
                )
            } else {
                next.to_string()
            };
            statements.push(format!(
                "SELECT pg_catalog.setval({}, {}, false)",
                quote_literal(&name),
                value
            ));
        }
        None => statements.push(format!(
            "SELECT pg_catalog.setval({}, {}, false)",
            quote_literal(&name),
            next
        )),
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::testing::{loaded_snapshot, shop_snapshot};

    fn sql(unit: &Unit) -> Vec<String> {
        unit.sql()
    }

    #[test]
    fn test_sequence_positioned_past_copied_keys() {
        let source = shop_snapshot();
        let dest = loaded_snapshot(&source, &["store", "order"]);
        let options = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&source, &dest, &options).unwrap();
        let waves = plan(&ctx).unwrap();

        assert_eq!(
            sql(&waves[0].units[0]),
            vec![
                "CREATE SEQUENCE IF NOT EXISTS \"stage\".\"order_id_seq\" AS bigint INCREMENT BY 1 MINVALUE 1 MAXVALUE 9223372036854775807 START WITH 1".to_string(),
                "ALTER SEQUENCE \"stage\".\"order_id_seq\" OWNED BY \"stage\".\"order\".\"id\"".to_string(),
                "SELECT pg_catalog.setval('\"stage\".\"order_id_seq\"', GREATEST(501, (SELECT COALESCE(MAX(\"id\"), 0) + 1 FROM \"stage\".\"order\")), false)".to_string(),
            ]
        );
        assert_eq!(
            sql(&waves[1].units[0]),
            vec!["ALTER TABLE \"stage\".\"order\" ALTER COLUMN \"id\" SET DEFAULT nextval('\"stage\".order_id_seq'::regclass)".to_string()]
        );
        assert!(waves[2].units.is_empty());
    }

    #[test]
    fn test_unused_sequence_skipped() {
        let source = shop_snapshot();
        let dest = loaded_snapshot(&source, &["store"]);
        let options = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&source, &dest, &options).unwrap();
        assert!(plan(&ctx).unwrap().iter().all(|w| w.units.is_empty()));
    }

    #[test]
    fn test_existing_sequence_only_repositioned() {
        let source = shop_snapshot();
        let mut dest = loaded_snapshot(&source, &["order"]);
        dest.sequences = source.sequences.clone();
        dest.tables.get_mut("order").unwrap().columns[0].default =
            Some("nextval('stage.order_id_seq'::regclass)".into());

        let options = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&source, &dest, &options).unwrap();
        let waves = plan(&ctx).unwrap();
        let statements = sql(&waves[0].units[0]);
        assert_eq!(statements.len(), 2);
        assert!(statements[1].starts_with("SELECT pg_catalog.setval"));
        assert!(waves[1].units.is_empty());
    }

    #[test]
    fn test_drop_extra_sequences_opt_in() {
        let source = shop_snapshot();
        let mut dest = loaded_snapshot(&source, &[]);
        let mut stray = source.sequences["order_id_seq"].clone();
        stray.name = "stray_seq".into();
        stray.owned_by = None;
        dest.sequences.insert("stray_seq".into(), stray);

        let options = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&source, &dest, &options).unwrap();
        assert!(plan(&ctx).unwrap()[2].units.is_empty());

        let options = ReconcileConfig {
            drop_extra_sequences: true,
            ..Default::default()
        };
        let ctx = ReconcileContext::new(&source, &dest, &options).unwrap();
        assert_eq!(
            sql(&plan(&ctx).unwrap()[2].units[0]),
            vec!["DROP SEQUENCE IF EXISTS \"stage\".\"stray_seq\"".to_string()]
        );
    }
}
