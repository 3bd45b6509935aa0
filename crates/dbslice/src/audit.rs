//! Column-level structural diff between source and destination tables, and a
//! definition diff of their sequences.

use serde::{Deserialize, Serialize};

use crate::core::schema::{Column, SchemaSnapshot, Sequence};

/// State of one table or sequence in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    /// Same columns with the same types and nullability, or the same sequence options.
    Matches,
    /// Present in both schemas with column differences.
    Differs,
    /// In the source only.
    MissingInDest,
    /// In the destination only.
    ExtraInDest,
}

/// A column present on both sides whose definition differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub column: String,
    pub source_type: String,
    pub dest_type: String,
    pub source_nullable: bool,
    pub dest_nullable: bool,
}

/// Audit result for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAudit {
    pub table: String,
    pub state: TableState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_columns: Vec<ColumnChange>,
}

/// Audit of every table a profile writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub source_schema: String,
    pub dest_schema: String,
    pub tables: Vec<TableAudit>,
    /// Tables whose columns match.
    pub tables_matching: usize,
    /// Tables that differ, are missing, or are extra.
    pub tables_with_differences: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.tables_with_differences == 0
    }
}

/// Compare `tables` between the two snapshots. Destination tables outside
/// `tables` are reported as extra.
pub fn audit(source: &SchemaSnapshot, dest: &SchemaSnapshot, tables: &[String]) -> AuditReport {
    let mut results = Vec::new();

    for name in tables {
        let Some(src) = source.table(name) else {
            continue;
        };
        let Some(dst) = dest.table(name) else {
            results.push(TableAudit {
                table: name.clone(),
                state: TableState::MissingInDest,
                missing_columns: Vec::new(),
                extra_columns: Vec::new(),
                changed_columns: Vec::new(),
            });
            continue;
        };

        let missing_columns: Vec<String> = src
            .columns
            .iter()
            .filter(|c| !dst.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();
        let extra_columns: Vec<String> = dst
            .columns
            .iter()
            .filter(|c| !src.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();
        let changed_columns: Vec<ColumnChange> = src
            .columns
            .iter()
            .filter_map(|s| dst.column(&s.name).and_then(|d| change(s, d)))
            .collect();

        let state = if missing_columns.is_empty()
            && extra_columns.is_empty()
            && changed_columns.is_empty()
        {
            TableState::Matches
        } else {
            TableState::Differs
        };
        results.push(TableAudit {
            table: name.clone(),
            state,
            missing_columns,
            extra_columns,
            changed_columns,
        });
    }

    for name in dest.tables.keys() {
        if !tables.contains(name) {
            results.push(TableAudit {
                table: name.clone(),
                state: TableState::ExtraInDest,
                missing_columns: Vec::new(),
                extra_columns: Vec::new(),
                changed_columns: Vec::new(),
            });
        }
    }

    let tables_matching = results
        .iter()
        .filter(|t| t.state == TableState::Matches)
        .count();
    AuditReport {
        source_schema: source.schema.clone(),
        dest_schema: dest.schema.clone(),
        tables_with_differences: results.len() - tables_matching,
        tables_matching,
        tables: results,
    }
}

fn change(source: &Column, dest: &Column) -> Option<ColumnChange> {
    let same_type = source.data_type == dest.data_type
        && source.char_max_length == dest.char_max_length
        && source.numeric_precision == dest.numeric_precision
        && source.numeric_scale == dest.numeric_scale;
    if same_type && source.nullable == dest.nullable {
        return None;
    }
    Some(ColumnChange {
        column: source.name.clone(),
        source_type: type_label(source),
        dest_type: type_label(dest),
        source_nullable: source.nullable,
        dest_nullable: dest.nullable,
    })
}

fn type_label(column: &Column) -> String {
    match (column.char_max_length, column.numeric_precision, column.numeric_scale) {
        (Some(length), _, _) => format!("{}({})", column.data_type, length),
        (None, Some(p), Some(s)) if column.data_type == "numeric" => {
            format!("numeric({},{})", p, s)
        }
        _ => column.data_type.clone(),
    }
}

/// A sequence option that differs between the two schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceChange {
    pub option: String,
    pub source: String,
    pub dest: String,
}

/// Audit result for one sequence. Last values are reported, never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceAudit {
    pub sequence: String,
    pub state: TableState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<SequenceChange>,
    pub source_last_value: Option<i64>,
    pub dest_last_value: Option<i64>,
}

/// Audit of every sequence in either schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceAuditReport {
    pub source_schema: String,
    pub dest_schema: String,
    pub sequences: Vec<SequenceAudit>,
    pub sequences_matching: usize,
    pub sequences_with_differences: usize,
}

impl SequenceAuditReport {
    pub fn is_clean(&self) -> bool {
        self.sequences_with_differences == 0
    }
}

/// Compare the sequences of the two snapshots by name.
pub fn audit_sequences(source: &SchemaSnapshot, dest: &SchemaSnapshot) -> SequenceAuditReport {
    let mut results = Vec::new();

    for (name, src) in &source.sequences {
        let dst = dest.sequences.get(name);
        let changes = dst.map(|d| sequence_changes(src, d)).unwrap_or_default();
        let state = match dst {
            None => TableState::MissingInDest,
            Some(_) if changes.is_empty() => TableState::Matches,
            Some(_) => TableState::Differs,
        };
        results.push(SequenceAudit {
            sequence: name.clone(),
            state,
            changes,
            source_last_value: src.last_value,
            dest_last_value: dst.and_then(|d| d.last_value),
        });
    }
    for (name, dst) in &dest.sequences {
        if !source.sequences.contains_key(name) {
            results.push(SequenceAudit {
                sequence: name.clone(),
                state: TableState::ExtraInDest,
                changes: Vec::new(),
                source_last_value: None,
                dest_last_value: dst.last_value,
            });
        }
    }

    let sequences_matching = results
        .iter()
        .filter(|s| s.state == TableState::Matches)
        .count();
    SequenceAuditReport {
        source_schema: source.schema.clone(),
        dest_schema: dest.schema.clone(),
        sequences_with_differences: results.len() - sequences_matching,
        sequences_matching,
        sequences: results,
    }
}

fn sequence_changes(source: &Sequence, dest: &Sequence) -> Vec<SequenceChange> {
    let owner = |s: &Sequence| {
        s.owned_by
            .as_ref()
            .map_or_else(|| "none".to_string(), |(t, c)| format!("{}.{}", t, c))
    };
    [
        ("data_type", source.data_type.clone(), dest.data_type.clone()),
        ("start_value", source.start_value.to_string(), dest.start_value.to_string()),
        ("increment", source.increment.to_string(), dest.increment.to_string()),
        ("min_value", source.min_value.to_string(), dest.min_value.to_string()),
        ("max_value", source.max_value.to_string(), dest.max_value.to_string()),
        ("owned_by", owner(source), owner(dest)),
    ]
    .into_iter()
    .filter(|(_, s, d)| s != d)
    .map(|(option, source, dest)| SequenceChange {
        option: option.to_string(),
        source,
        dest,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Table;
    use crate::testing::{loaded_snapshot, shop_snapshot};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_loaded_copy_differs_only_in_nullability() {
        let source = shop_snapshot();
        let dest = loaded_snapshot(&source, &["store"]);
        let report = audit(&source, &dest, &names(&["store"]));
        let store = &report.tables[0];
        assert_eq!(store.state, TableState::Differs);
        assert_eq!(store.changed_columns.len(), 1);
        assert_eq!(store.changed_columns[0].column, "id");
        assert!(!store.changed_columns[0].source_nullable);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_missing_extra_and_matching() {
        let source = shop_snapshot();
        let mut dest = SchemaSnapshot::empty("stage");
        dest.insert_table(source.table("store").unwrap().clone());
        let mut product = source.table("product").unwrap().clone();
        product.columns.retain(|c| c.name != "sku");
        product.columns.push(Column::new("legacy", "text"));
        dest.insert_table(product);
        dest.insert_table(Table::new("scratch", Vec::new()));

        let report = audit(&source, &dest, &names(&["store", "product", "order"]));
        let state = |t: &str| report.tables.iter().find(|a| a.table == t).unwrap().state;
        assert_eq!(state("store"), TableState::Matches);
        assert_eq!(state("product"), TableState::Differs);
        assert_eq!(state("order"), TableState::MissingInDest);
        assert_eq!(state("scratch"), TableState::ExtraInDest);

        let product = report.tables.iter().find(|a| a.table == "product").unwrap();
        assert_eq!(product.missing_columns, vec!["sku".to_string()]);
        assert_eq!(product.extra_columns, vec!["legacy".to_string()]);
        assert_eq!(report.tables_matching, 1);
        assert_eq!(report.tables_with_differences, 3);
    }

    #[test]
    fn test_sequence_audit() {
        let source = shop_snapshot();
        let mut dest = SchemaSnapshot::empty("stage");
        let mut order_seq = source.sequences["order_id_seq"].clone();
        order_seq.last_value = Some(900);
        dest.sequences.insert("order_id_seq".into(), order_seq.clone());

        let report = audit_sequences(&source, &dest);
        assert!(report.is_clean());
        assert_eq!(report.sequences[0].state, TableState::Matches);
        assert_eq!(report.sequences[0].dest_last_value, Some(900));

        order_seq.increment = 5;
        order_seq.owned_by = None;
        dest.sequences.insert("order_id_seq".into(), order_seq);
        let mut scratch = source.sequences["order_id_seq"].clone();
        scratch.name = "scratch_seq".into();
        dest.sequences.insert("scratch_seq".into(), scratch);

        let report = audit_sequences(&source, &dest);
        assert_eq!(report.sequences_with_differences, 2);
        let order = &report.sequences[0];
        assert_eq!(order.state, TableState::Differs);
        assert_eq!(
            order.changes,
            vec![
                SequenceChange {
                    option: "increment".into(),
                    source: "1".into(),
                    dest: "5".into(),
                },
                SequenceChange {
                    option: "owned_by".into(),
                    source: "order.id".into(),
                    dest: "none".into(),
                },
            ]
        );
        assert_eq!(report.sequences[1].state, TableState::ExtraInDest);

        let report = audit_sequences(&source, &SchemaSnapshot::empty("stage"));
        assert_eq!(report.sequences[0].state, TableState::MissingInDest);
    }
}
