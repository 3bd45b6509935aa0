//! Shared fixtures for unit tests: a small shop schema.
//!
//! store 1-n product, store 1-n order, order 1-n order_item n-1 product.

use crate::config::Profile;
use crate::core::schema::{
    Column, Constraint, ConstraintKind, ForeignKeyRef, Index, PrimaryKey, SchemaSnapshot,
    Sequence, Table,
};

pub(crate) const SHOP_PROFILE: &str = r#"
source_schema: public
dest_schema: stage
roots:
  - name: stores
    table: store
    selector: { mode: list, ids: [1, 2] }
families:
  - name: shop
    root: { table: store, selection: stores }
    deps:
      - { table: product, parent_table: store, join: d.store_id = p.id }
      - { table: order, parent_table: store, join: d.store_id = p.id }
      - { table: order_item, parent_table: order, join: d.order_id = p.id }
"#;

pub(crate) fn shop_profile() -> Profile {
    Profile::from_yaml(SHOP_PROFILE).unwrap()
}

fn id() -> Column {
    Column::new("id", "bigint")
        .not_null()
        .with_default("nextval('order_id_seq'::regclass)")
}

fn pk(table: &str) -> Option<PrimaryKey> {
    Some(PrimaryKey {
        name: format!("{}_pkey", table),
        columns: vec!["id".into()],
    })
}

fn fk(name: &str, column: &str, ref_table: &str) -> Constraint {
    Constraint {
        name: name.into(),
        kind: ConstraintKind::ForeignKey,
        definition: format!(
            "FOREIGN KEY ({}) REFERENCES public.{}(id)",
            column, ref_table
        ),
        foreign: Some(ForeignKeyRef {
            columns: vec![column.into()],
            ref_schema: "public".into(),
            ref_table: ref_table.into(),
            ref_columns: vec!["id".into()],
        }),
        validated: true,
    }
}

fn pk_index(table: &str) -> Index {
    Index {
        name: format!("{}_pkey", table),
        definition: format!(
            "CREATE UNIQUE INDEX {t}_pkey ON public.{t} USING btree (id)",
            t = table
        ),
        partial_predicate: None,
        backs_constraint: true,
    }
}

/// Source snapshot of the shop schema with keys, constraints and one sequence.
pub(crate) fn shop_snapshot() -> SchemaSnapshot {
    let mut snapshot = SchemaSnapshot::empty("public");

    let mut store = Table::new(
        "store",
        vec![
            Column::new("id", "bigint").not_null(),
            Column::new("name", "text"),
        ],
    );
    store.primary_key = pk("store");
    store.indexes.push(pk_index("store"));
    snapshot.insert_table(store);

    let mut product = Table::new(
        "product",
        vec![
            Column::new("id", "bigint").not_null(),
            Column::new("store_id", "bigint").not_null(),
            Column::new("sku", "text"),
        ],
    );
    product.primary_key = pk("product");
    product.constraints.push(fk("product_store_id_fkey", "store_id", "store"));
    product.constraints.push(Constraint {
        name: "product_sku_key".into(),
        kind: ConstraintKind::Unique,
        definition: "UNIQUE (sku)".into(),
        foreign: None,
        validated: true,
    });
    product.indexes.push(pk_index("product"));
    product.indexes.push(Index {
        name: "product_sku_key".into(),
        definition: "CREATE UNIQUE INDEX product_sku_key ON public.product USING btree (sku)"
            .into(),
        partial_predicate: None,
        backs_constraint: true,
    });
    snapshot.insert_table(product);

    let mut order = Table::new(
        "order",
        vec![id(), Column::new("store_id", "bigint").not_null()],
    );
    order.primary_key = pk("order");
    order.constraints.push(fk("order_store_id_fkey", "store_id", "store"));
    order.indexes.push(pk_index("order"));
    order.indexes.push(Index {
        name: "order_store_idx".into(),
        definition: "CREATE INDEX order_store_idx ON public.\"order\" USING btree (store_id) WHERE (store_id IS NOT NULL)".into(),
        partial_predicate: Some("(store_id IS NOT NULL)".into()),
        backs_constraint: false,
    });
    snapshot.insert_table(order);

    let mut item = Table::new(
        "order_item",
        vec![
            Column::new("id", "bigint").not_null(),
            Column::new("order_id", "bigint").not_null(),
            Column::new("product_id", "bigint"),
            Column::new("qty", "integer"),
        ],
    );
    item.primary_key = pk("order_item");
    item.constraints.push(fk("order_item_order_id_fkey", "order_id", "order"));
    item.constraints.push(fk("order_item_product_id_fkey", "product_id", "product"));
    item.constraints.push(Constraint {
        name: "order_item_qty_check".into(),
        kind: ConstraintKind::Check,
        definition: "CHECK (qty > 0)".into(),
        foreign: None,
        validated: true,
    });
    item.indexes.push(pk_index("order_item"));
    snapshot.insert_table(item);

    snapshot.sequences.insert(
        "order_id_seq".into(),
        Sequence {
            name: "order_id_seq".into(),
            data_type: "bigint".into(),
            start_value: 1,
            increment: 1,
            min_value: 1,
            max_value: i64::MAX,
            last_value: Some(500),
            owned_by: Some(("order".into(), "id".into())),
        },
    );

    snapshot
}

/// The destination right after Create/Load: bare unlogged copies of `tables`.
pub(crate) fn loaded_snapshot(source: &SchemaSnapshot, tables: &[&str]) -> SchemaSnapshot {
    let mut snapshot = SchemaSnapshot::empty("stage");
    for name in tables {
        if let Some(table) = source.table(name) {
            let mut copy = Table::new(
                table.name.clone(),
                table
                    .columns
                    .iter()
                    .map(|c| Column {
                        nullable: true,
                        default: None,
                        ..c.clone()
                    })
                    .collect(),
            );
            copy.unlogged = true;
            snapshot.insert_table(copy);
        }
    }
    snapshot
}
