//! Catalog introspection.
//!
//! Every object of the schema is read with one query per object kind and
//! assembled into a [`SchemaSnapshot`]. Definitions come from the `pg_get_*def`
//! functions so they can be replayed verbatim after schema rewriting.

use tokio_postgres::Client;
use tracing::debug;

use crate::core::schema::{
    Column, Constraint, ConstraintKind, ForeignKeyRef, Function, Index, PrimaryKey,
    SchemaSnapshot, Sequence, Table, Trigger,
};
use crate::error::Result;

const TABLES_QUERY: &str = r#"
    SELECT c.relname::text, c.relpersistence = 'u'
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
    ORDER BY c.relname
"#;

const COLUMNS_QUERY: &str = r#"
    SELECT
        table_name::text,
        column_name::text,
        data_type::text,
        udt_name::text,
        is_nullable = 'YES',
        column_default::text,
        character_maximum_length::int4,
        numeric_precision::int4,
        numeric_scale::int4
    FROM information_schema.columns
    WHERE table_schema = $1
    ORDER BY table_name, ordinal_position
"#;

const CONSTRAINTS_QUERY: &str = r#"
    SELECT
        t.relname::text,
        con.conname::text,
        con.contype::text,
        pg_catalog.pg_get_constraintdef(con.oid, true),
        con.convalidated,
        rn.nspname::text,
        rt.relname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a
              ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ),
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a
              ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        )
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class t ON t.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    LEFT JOIN pg_catalog.pg_class rt ON rt.oid = con.confrelid
    LEFT JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
    WHERE n.nspname = $1
      AND con.contype IN ('p', 'u', 'c', 'x', 'f')
    ORDER BY t.relname, con.conname
"#;

const INDEXES_QUERY: &str = r#"
    SELECT
        t.relname::text,
        i.relname::text,
        pg_catalog.pg_get_indexdef(ix.indexrelid),
        pg_catalog.pg_get_expr(ix.indpred, ix.indrelid),
        EXISTS (
            SELECT 1 FROM pg_catalog.pg_constraint con
            WHERE con.conindid = ix.indexrelid
              AND con.conrelid = ix.indrelid
              AND con.contype IN ('p', 'u', 'x')
        )
    FROM pg_catalog.pg_index ix
    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1
    ORDER BY t.relname, i.relname
"#;

const SEQUENCES_QUERY: &str = r#"
    SELECT
        s.sequencename::text,
        s.data_type::text,
        s.start_value,
        s.increment_by,
        s.min_value,
        s.max_value,
        s.last_value,
        owner.relname::text,
        owner_col.attname::text
    FROM pg_catalog.pg_sequences s
    JOIN pg_catalog.pg_namespace n ON n.nspname = s.schemaname
    JOIN pg_catalog.pg_class sc ON sc.relname = s.sequencename AND sc.relnamespace = n.oid
    LEFT JOIN pg_catalog.pg_depend d
      ON d.classid = 'pg_catalog.pg_class'::regclass
     AND d.objid = sc.oid
     AND d.refclassid = 'pg_catalog.pg_class'::regclass
     AND d.deptype IN ('a', 'i')
    LEFT JOIN pg_catalog.pg_class owner ON owner.oid = d.refobjid
    LEFT JOIN pg_catalog.pg_attribute owner_col
      ON owner_col.attrelid = d.refobjid AND owner_col.attnum = d.refobjsubid
    WHERE s.schemaname = $1
    ORDER BY s.sequencename
"#;

const TRIGGERS_QUERY: &str = r#"
    SELECT t.relname::text, tg.tgname::text, pg_catalog.pg_get_triggerdef(tg.oid, true)
    FROM pg_catalog.pg_trigger tg
    JOIN pg_catalog.pg_class t ON t.oid = tg.tgrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1
      AND NOT tg.tgisinternal
    ORDER BY t.relname, tg.tgname
"#;

const FUNCTIONS_QUERY: &str = r#"
    SELECT
        p.proname::text,
        pg_catalog.pg_get_function_identity_arguments(p.oid),
        pg_catalog.pg_get_functiondef(p.oid)
    FROM pg_catalog.pg_proc p
    JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname = $1
      AND p.prokind IN ('f', 'p')
      AND NOT EXISTS (
          SELECT 1 FROM pg_catalog.pg_depend d
          WHERE d.classid = 'pg_catalog.pg_proc'::regclass
            AND d.objid = p.oid
            AND d.deptype = 'e'
      )
    ORDER BY p.proname, 2
"#;

/// Check whether a schema exists.
pub(crate) async fn schema_exists(client: &Client, schema: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
            &[&schema],
        )
        .await?;
    Ok(row.try_get(0)?)
}

/// Read every table, sequence and function of `schema`.
pub(crate) async fn read_snapshot(client: &Client, schema: &str) -> Result<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::empty(schema);

    // With only pg_catalog visible, every printed definition is schema-qualified.
    client.batch_execute("SET search_path = pg_catalog").await?;

    for row in client.query(TABLES_QUERY, &[&schema]).await? {
        let mut table = Table::new(row.try_get::<_, String>(0)?, Vec::new());
        table.unlogged = row.try_get(1)?;
        snapshot.insert_table(table);
    }

    for row in client.query(COLUMNS_QUERY, &[&schema]).await? {
        let table_name: String = row.try_get(0)?;
        // Views also appear in information_schema.columns.
        let Some(table) = snapshot.tables.get_mut(&table_name) else {
            continue;
        };
        table.columns.push(Column {
            name: row.try_get(1)?,
            data_type: row.try_get(2)?,
            udt_name: row.try_get(3)?,
            nullable: row.try_get(4)?,
            default: row.try_get(5)?,
            char_max_length: row.try_get(6)?,
            numeric_precision: row.try_get(7)?,
            numeric_scale: row.try_get(8)?,
        });
    }

    for row in client.query(CONSTRAINTS_QUERY, &[&schema]).await? {
        let table_name: String = row.try_get(0)?;
        let Some(table) = snapshot.tables.get_mut(&table_name) else {
            continue;
        };
        let name: String = row.try_get(1)?;
        let contype: String = row.try_get(2)?;
        let columns: Vec<String> = row.try_get(7)?;

        if contype == "p" {
            table.primary_key = Some(PrimaryKey { name, columns });
            continue;
        }
        let Some(kind) = ConstraintKind::from_contype(&contype) else {
            continue;
        };
        let foreign = if kind == ConstraintKind::ForeignKey {
            let ref_schema: Option<String> = row.try_get(5)?;
            let ref_table: Option<String> = row.try_get(6)?;
            Some(ForeignKeyRef {
                columns,
                ref_schema: ref_schema.unwrap_or_default(),
                ref_table: ref_table.unwrap_or_default(),
                ref_columns: row.try_get(8)?,
            })
        } else {
            None
        };
        table.constraints.push(Constraint {
            name,
            kind,
            definition: row.try_get(3)?,
            foreign,
            validated: row.try_get(4)?,
        });
    }

    for row in client.query(INDEXES_QUERY, &[&schema]).await? {
        let table_name: String = row.try_get(0)?;
        if let Some(table) = snapshot.tables.get_mut(&table_name) {
            table.indexes.push(Index {
                name: row.try_get(1)?,
                definition: row.try_get(2)?,
                partial_predicate: row.try_get(3)?,
                backs_constraint: row.try_get(4)?,
            });
        }
    }

    for row in client.query(TRIGGERS_QUERY, &[&schema]).await? {
        let table_name: String = row.try_get(0)?;
        if let Some(table) = snapshot.tables.get_mut(&table_name) {
            table.triggers.push(Trigger {
                name: row.try_get(1)?,
                definition: row.try_get(2)?,
            });
        }
    }

    for row in client.query(SEQUENCES_QUERY, &[&schema]).await? {
        let owner_table: Option<String> = row.try_get(7)?;
        let owner_column: Option<String> = row.try_get(8)?;
        let sequence = Sequence {
            name: row.try_get(0)?,
            data_type: row.try_get(1)?,
            start_value: row.try_get(2)?,
            increment: row.try_get(3)?,
            min_value: row.try_get(4)?,
            max_value: row.try_get(5)?,
            last_value: row.try_get(6)?,
            owned_by: owner_table.zip(owner_column),
        };
        snapshot.sequences.insert(sequence.name.clone(), sequence);
    }

    for row in client.query(FUNCTIONS_QUERY, &[&schema]).await? {
        snapshot.functions.push(Function {
            name: row.try_get(0)?,
            arguments: row.try_get(1)?,
            definition: row.try_get(2)?,
        });
    }

    debug!(
        "Snapshot of '{}': {} tables, {} sequences, {} functions",
        schema,
        snapshot.tables.len(),
        snapshot.sequences.len(),
        snapshot.functions.len()
    );
    Ok(snapshot)
}
