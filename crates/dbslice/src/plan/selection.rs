//! Root selection: turn each root's selector into a concrete, optionally sharded,
//! identifier set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ColumnRef, RootConfig, Selector, ShardStrategy, SqlParam};
use crate::core::identifier::{qualify_pg, quote_literal, quote_pg};
use crate::core::schema::{SchemaSnapshot, Table};
use crate::core::traits::Session;
use crate::error::{Result, SliceError};

/// Partition key of a task. Unsharded work runs under [`ShardKey::Global`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ShardKey {
    Global,
    Index(u32),
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Global => f.write_str("global"),
            ShardKey::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<ShardKey> for String {
    fn from(key: ShardKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ShardKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value == "global" {
            return Ok(ShardKey::Global);
        }
        value
            .parse()
            .map(ShardKey::Index)
            .map_err(|_| format!("invalid shard key '{}'", value))
    }
}

/// The resolved ids of one root.
#[derive(Debug, Clone, PartialEq)]
pub struct RootSelection {
    pub root: String,
    pub table: String,
    /// All ids, in selection order, without duplicates.
    pub ids: Vec<i64>,
    /// Ids per shard. Unsharded roots have a single [`ShardKey::Global`] entry.
    pub shards: BTreeMap<ShardKey, Vec<i64>>,
}

impl RootSelection {
    /// Whether the root is split into more than one shard.
    pub fn is_sharded(&self) -> bool {
        !self.shards.contains_key(&ShardKey::Global)
    }

    /// A query producing every selected id as column `id`.
    pub fn query(&self) -> String {
        values_query(&self.ids)
    }

    /// A query producing the ids of one shard.
    pub fn shard_query(&self, shard: ShardKey) -> String {
        values_query(self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[]))
    }
}

/// Resolved selections of every root planned so far.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    roots: BTreeMap<String, RootSelection>,
}

impl SelectionSet {
    pub fn get(&self, root: &str) -> Option<&RootSelection> {
        self.roots.get(root)
    }

    pub fn insert(&mut self, selection: RootSelection) {
        self.roots.insert(selection.root.clone(), selection);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RootSelection> {
        self.roots.values()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Render ids as a `VALUES` list aliased `v(id)`.
pub fn values_query(ids: &[i64]) -> String {
    if ids.is_empty() {
        return "SELECT NULL::bigint AS id WHERE false".to_string();
    }
    let rows: Vec<String> = ids.iter().map(|id| format!("({})", id)).collect();
    format!(
        "SELECT v.id::bigint AS id FROM (VALUES {}) AS v(id)",
        rows.join(", ")
    )
}

/// Schemas a selector may read, as they were when the stage began.
pub struct SelectorContext<'a> {
    pub source: &'a SchemaSnapshot,
    pub dest: &'a SchemaSnapshot,
    /// Further schemas named by column refs.
    pub others: &'a BTreeMap<String, SchemaSnapshot>,
}

impl SelectorContext<'_> {
    fn schema(&self, name: &str) -> Option<&SchemaSnapshot> {
        if name == self.dest.schema {
            Some(self.dest)
        } else if name == self.source.schema {
            Some(self.source)
        } else {
            self.others.get(name)
        }
    }

    fn table(&self, schema: &str, table: &str) -> Option<&Table> {
        self.schema(schema).and_then(|s| s.table(table))
    }
}

/// Resolve one root against the database its selector reads from.
pub async fn plan_root(
    root: &RootConfig,
    ctx: &SelectorContext<'_>,
    session: &mut dyn Session,
) -> Result<RootSelection> {
    let selected = match &root.selector {
        Selector::List { ids } => ids.clone(),
        selector => match selector_query(root, selector, ctx)? {
            Some(sql) => read_ids(root, &sql, session).await?,
            None if root.allow_empty => {
                warn!(
                    "Selection {}: {} selector reads no existing table",
                    root.name,
                    selector.mode()
                );
                Vec::new()
            }
            None => {
                return Err(SliceError::selection(
                    &root.name,
                    format!(
                        "{} selector reads no existing table (set allow_empty: true if this is expected)",
                        selector.mode()
                    ),
                ))
            }
        },
    };

    let ids = dedupe(selected, &root.ensure);

    let shards = match &root.shard {
        Some(shard) if shard.count > 1 => match shard.strategy {
            ShardStrategy::RoundRobin => assign_round_robin(&ids, shard.count),
            ShardStrategy::Weighted => {
                let sql = shard.weights_sql.as_deref().ok_or_else(|| {
                    SliceError::selection(&root.name, "weighted sharding requires weights_sql")
                })?;
                let weights = read_weights(&root.name, sql, session).await?;
                assign_weighted(&ids, &weights, shard.count)
            }
        },
        _ => BTreeMap::from([(ShardKey::Global, ids.clone())]),
    };

    info!(
        "Selection {}: {} id(s) across {} shard(s)",
        root.name,
        ids.len(),
        shards.len()
    );
    for (key, shard_ids) in &shards {
        debug!("Selection {} shard {}: {} id(s)", root.name, key, shard_ids.len());
    }

    Ok(RootSelection {
        root: root.name.clone(),
        table: root.table.clone(),
        ids,
        shards,
    })
}

/// Run an id query; NULL ids are an error, no rows only with `allow_empty`.
async fn read_ids(root: &RootConfig, sql: &str, session: &mut dyn Session) -> Result<Vec<i64>> {
    let wrapped = format!("SELECT s.id::bigint FROM ({}) AS s(id)", sql);
    let rows = session.query_ints(&wrapped).await?;
    if rows.is_empty() && !root.allow_empty {
        return Err(SliceError::selection(
            &root.name,
            format!(
                "{} selector returned no rows (set allow_empty: true if this is expected)",
                root.selector.mode()
            ),
        ));
    }
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        match row.into_iter().next().flatten() {
            Some(id) => ids.push(id),
            None => {
                return Err(SliceError::selection(
                    &root.name,
                    format!("{} selector returned a NULL id", root.selector.mode()),
                ))
            }
        }
    }
    Ok(ids)
}

/// The id query of a selector, or `None` when every table it reads is missing.
///
/// Refs to missing tables or columns are skipped, the way a partially copied
/// destination would be read.
pub fn selector_query(
    root: &RootConfig,
    selector: &Selector,
    ctx: &SelectorContext<'_>,
) -> Result<Option<String>> {
    let dest = ctx.dest.schema.as_str();
    match selector {
        Selector::List { ids } => Ok(Some(values_query(ids))),
        Selector::Sql { sql, params } => bind_params(sql, params).map(Some),
        Selector::ReferencedBy { refs } => distinct_values(column_refs(ctx, refs, dest)?),
        Selector::ReferencedByColumn {
            schema,
            column,
            extra_refs,
        } => {
            let schema = schema.as_deref().unwrap_or(dest);
            let mut parts = Vec::new();
            if let Some(snapshot) = ctx.schema(schema) {
                for table in snapshot.tables.values().filter(|t| t.has_column(column)) {
                    parts.push(distinct_column(schema, &table.name, column)?);
                }
            }
            parts.extend(column_refs(ctx, extra_refs, dest)?);
            distinct_values(parts)
        }
        Selector::FkInStage {
            fk_column,
            stage_table,
            stage_id_col,
        } => {
            if ctx.source.table(&root.table).is_none() || ctx.dest.table(stage_table).is_none() {
                warn!(
                    "Selection {}: {} or {}.{} is missing",
                    root.name, root.table, dest, stage_table
                );
                return Ok(None);
            }
            let fk = quote_pg(fk_column)?;
            Ok(Some(format!(
                "SELECT DISTINCT d.{} FROM {} d JOIN {} s ON s.{} = d.{} WHERE d.{} IS NOT NULL",
                quote_pg(&root.id_col)?,
                qualify_pg(&ctx.source.schema, &root.table)?,
                qualify_pg(dest, stage_table)?,
                quote_pg(stage_id_col)?,
                fk,
                fk
            )))
        }
        Selector::RefersToStage { targets } => {
            if ctx.source.table(&root.table).is_none() {
                warn!("Selection {}: source table {} is missing", root.name, root.table);
                return Ok(None);
            }
            let mut clauses = Vec::new();
            for target in targets {
                if ctx.dest.table(&target.stage_table).is_none() {
                    warn!(
                        "Selection {}: skipping {}.{}, not in the destination",
                        root.name, dest, target.stage_table
                    );
                    continue;
                }
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM {} x WHERE x.{} = d.{})",
                    qualify_pg(dest, &target.stage_table)?,
                    quote_pg(&target.stage_id_col)?,
                    quote_pg(&target.local_column)?
                ));
            }
            if clauses.is_empty() {
                return Ok(None);
            }
            Ok(Some(format!(
                "SELECT DISTINCT d.{} FROM {} d WHERE {}",
                quote_pg(&root.id_col)?,
                qualify_pg(&ctx.source.schema, &root.table)?,
                clauses.join(" OR ")
            )))
        }
    }
}

fn column_refs(ctx: &SelectorContext<'_>, refs: &[ColumnRef], dest: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    for column_ref in refs {
        let schema = column_ref.schema.as_deref().unwrap_or(dest);
        match ctx.table(schema, &column_ref.table) {
            Some(table) if table.has_column(&column_ref.column) => {
                parts.push(distinct_column(schema, &column_ref.table, &column_ref.column)?)
            }
            _ => debug!(
                "Skipping ref {}.{}.{}: not present",
                schema, column_ref.table, column_ref.column
            ),
        }
    }
    Ok(parts)
}

fn distinct_column(schema: &str, table: &str, column: &str) -> Result<String> {
    Ok(format!(
        "SELECT DISTINCT {} AS id FROM {}",
        quote_pg(column)?,
        qualify_pg(schema, table)?
    ))
}

fn distinct_values(parts: Vec<String>) -> Result<Option<String>> {
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "SELECT u.id FROM ({}) AS u WHERE u.id IS NOT NULL",
        parts.join(" UNION ")
    )))
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\(([A-Za-z_][A-Za-z0-9_]*)\)s").unwrap());

/// Substitute `%(name)s` placeholders with literals rendered from `params`.
pub fn bind_params(sql: &str, params: &BTreeMap<String, SqlParam>) -> Result<String> {
    if let Some(missing) = PLACEHOLDER
        .captures_iter(sql)
        .map(|caps| caps[1].to_string())
        .find(|name| !params.contains_key(name))
    {
        return Err(SliceError::Config(format!(
            "placeholder %({})s has no value in params",
            missing
        )));
    }
    Ok(PLACEHOLDER
        .replace_all(sql, |caps: &Captures<'_>| {
            params.get(&caps[1]).map(render_param).unwrap_or_default()
        })
        .into_owned())
}

fn render_param(param: &SqlParam) -> String {
    match param {
        SqlParam::Bool(value) => value.to_string(),
        SqlParam::Int(value) => value.to_string(),
        SqlParam::Float(value) => value.to_string(),
        SqlParam::Text(value) => quote_literal(value),
        SqlParam::List(values) if values.is_empty() => "'{}'".to_string(),
        SqlParam::List(values) => format!(
            "ARRAY[{}]",
            values.iter().map(render_param).collect::<Vec<_>>().join(", ")
        ),
    }
}

async fn read_weights(
    root: &str,
    sql: &str,
    session: &mut dyn Session,
) -> Result<HashMap<i64, i64>> {
    let wrapped = format!(
        "SELECT w.id::bigint, w.weight::bigint FROM ({}) AS w(id, weight)",
        sql
    );
    let mut weights = HashMap::new();
    for row in session.query_ints(&wrapped).await? {
        match (row.first().copied().flatten(), row.get(1).copied().flatten()) {
            (Some(id), weight) => {
                weights.insert(id, weight.unwrap_or(1));
            }
            (None, _) => {
                return Err(SliceError::selection(root, "weights_sql returned a NULL id"));
            }
        }
    }
    Ok(weights)
}

/// Drop duplicates keeping the first occurrence, then append missing `ensure` ids.
fn dedupe(selected: Vec<i64>, ensure: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(selected.len() + ensure.len());
    selected
        .into_iter()
        .chain(ensure.iter().copied())
        .filter(|id| seen.insert(*id))
        .collect()
}

fn empty_shards(count: u32) -> BTreeMap<ShardKey, Vec<i64>> {
    (0..count).map(|i| (ShardKey::Index(i), Vec::new())).collect()
}

fn assign_round_robin(ids: &[i64], count: u32) -> BTreeMap<ShardKey, Vec<i64>> {
    let mut shards = empty_shards(count);
    for (i, id) in ids.iter().enumerate() {
        let key = ShardKey::Index((i % count as usize) as u32);
        shards.entry(key).or_default().push(*id);
    }
    shards
}

/// Heaviest ids first, each onto the currently lightest shard (lowest index on ties).
fn assign_weighted(
    ids: &[i64],
    weights: &HashMap<i64, i64>,
    count: u32,
) -> BTreeMap<ShardKey, Vec<i64>> {
    let mut weighted: Vec<(i64, i64)> = ids
        .iter()
        .map(|id| (*id, weights.get(id).copied().unwrap_or(1)))
        .collect();
    weighted.sort_by(|a, b| b.1.cmp(&a.1));

    let mut totals = vec![0i64; count as usize];
    let mut shards = empty_shards(count);
    for (id, weight) in weighted {
        let (lightest, _) = totals
            .iter()
            .enumerate()
            .min_by_key(|(i, total)| (**total, *i))
            .unwrap_or((0, &0));
        totals[lightest] = totals[lightest].saturating_add(weight);
        shards
            .entry(ShardKey::Index(lightest as u32))
            .or_default()
            .push(id);
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShardConfig, StageTarget};
    use crate::core::traits::Connector;
    use crate::drivers::mock::MockConnector;
    use crate::testing::{loaded_snapshot, shop_snapshot};

    struct Schemas {
        source: SchemaSnapshot,
        dest: SchemaSnapshot,
        others: BTreeMap<String, SchemaSnapshot>,
    }

    impl Schemas {
        /// Source shop schema, destination holding store and order.
        fn new() -> Self {
            let source = shop_snapshot();
            let dest = loaded_snapshot(&source, &["store", "order"]);
            Self {
                source,
                dest,
                others: BTreeMap::new(),
            }
        }

        fn ctx(&self) -> SelectorContext<'_> {
            SelectorContext {
                source: &self.source,
                dest: &self.dest,
                others: &self.others,
            }
        }
    }

    fn root(selector: Selector) -> RootConfig {
        RootConfig {
            name: "stores".into(),
            table: "store".into(),
            id_col: "id".into(),
            selector,
            ensure: Vec::new(),
            shard: None,
            phase: Default::default(),
            allow_empty: false,
        }
    }

    #[test]
    fn test_values_query() {
        assert_eq!(
            values_query(&[1, 2]),
            "SELECT v.id::bigint AS id FROM (VALUES (1), (2)) AS v(id)"
        );
        assert_eq!(values_query(&[]), "SELECT NULL::bigint AS id WHERE false");
    }

    #[test]
    fn test_dedupe_keeps_first_and_appends_ensure() {
        assert_eq!(dedupe(vec![3, 1, 3, 2, 1], &[2, 9]), vec![3, 1, 2, 9]);
    }

    #[test]
    fn test_round_robin() {
        let shards = assign_round_robin(&[10, 11, 12, 13, 14], 2);
        assert_eq!(shards[&ShardKey::Index(0)], vec![10, 12, 14]);
        assert_eq!(shards[&ShardKey::Index(1)], vec![11, 13]);
    }

    #[test]
    fn test_round_robin_keeps_empty_shards() {
        let shards = assign_round_robin(&[1], 3);
        assert_eq!(shards.len(), 3);
        assert!(shards[&ShardKey::Index(2)].is_empty());
    }

    #[test]
    fn test_weighted_balances_heaviest_first() {
        let weights = HashMap::from([(1, 10), (2, 7), (3, 5), (4, 3)]);
        let shards = assign_weighted(&[1, 2, 3, 4, 5], &weights, 2);
        // 1(10) -> s0; 2(7) -> s1; 3(5) -> s1 (12); 4(3) -> s0 (13); 5(1 default) -> s1 (13)
        assert_eq!(shards[&ShardKey::Index(0)], vec![1, 4]);
        assert_eq!(shards[&ShardKey::Index(1)], vec![2, 3, 5]);
    }

    #[test]
    fn test_shard_key_serde() {
        assert_eq!(serde_json::to_string(&ShardKey::Global).unwrap(), "\"global\"");
        assert_eq!(serde_json::to_string(&ShardKey::Index(3)).unwrap(), "\"3\"");
    }

    #[tokio::test]
    async fn test_list_selector_with_shards() {
        let mut config = root(Selector::List {
            ids: vec![5, 6, 5, 7],
        });
        config.ensure = vec![8];
        config.shard = Some(ShardConfig {
            count: 2,
            strategy: ShardStrategy::RoundRobin,
            weights_sql: None,
        });
        let connector = MockConnector::new();
        let mut session = connector.connect().await.unwrap();
        let selection = plan_root(&config, &Schemas::new().ctx(), session.as_mut()).await.unwrap();
        assert_eq!(selection.ids, vec![5, 6, 7, 8]);
        assert!(selection.is_sharded());
        assert_eq!(selection.shards[&ShardKey::Index(0)], vec![5, 7]);
        assert!(selection.shard_query(ShardKey::Index(1)).contains("(6), (8)"));
        assert!(connector.queries().is_empty());
    }

    #[tokio::test]
    async fn test_sql_selector_reads_first_column() {
        let connector =
            MockConnector::new().with_rows("FROM (SELECT id FROM store", vec![vec![Some(4)], vec![Some(2)]]);
        let mut session = connector.connect().await.unwrap();
        let selection = plan_root(
            &root(Selector::Sql {
                sql: "SELECT id FROM store WHERE active".into(),
                params: BTreeMap::new(),
            }),
            &Schemas::new().ctx(),
            session.as_mut(),
        )
        .await
        .unwrap();
        assert_eq!(selection.ids, vec![4, 2]);
        assert!(!selection.is_sharded());
        assert_eq!(
            connector.queries(),
            vec!["SELECT s.id::bigint FROM (SELECT id FROM store WHERE active) AS s(id)"]
        );
    }

    #[tokio::test]
    async fn test_empty_sql_selector_fails_unless_allowed() {
        let connector = MockConnector::new();
        let mut session = connector.connect().await.unwrap();
        let mut config = root(Selector::Sql {
            sql: "SELECT id FROM store WHERE false".into(),
            params: BTreeMap::new(),
        });
        let err = plan_root(&config, &Schemas::new().ctx(), session.as_mut()).await.unwrap_err();
        assert!(matches!(err, SliceError::Selection { .. }));

        config.allow_empty = true;
        let selection = plan_root(&config, &Schemas::new().ctx(), session.as_mut()).await.unwrap();
        assert!(selection.ids.is_empty());
    }

    #[tokio::test]
    async fn test_null_id_is_selection_error() {
        let connector = MockConnector::new().with_rows("AS s(id)", vec![vec![Some(1)], vec![None]]);
        let mut session = connector.connect().await.unwrap();
        let err = plan_root(
            &root(Selector::Sql {
                sql: "SELECT store_id FROM x".into(),
                params: BTreeMap::new(),
            }),
            &Schemas::new().ctx(),
            session.as_mut(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("NULL"));
    }

    #[tokio::test]
    async fn test_weighted_selector_reads_weights() {
        let connector = MockConnector::new()
            .with_rows("AS w(id, weight)", vec![vec![Some(2), Some(100)], vec![Some(1), None]]);
        let mut session = connector.connect().await.unwrap();
        let mut config = root(Selector::List { ids: vec![1, 2, 3] });
        config.shard = Some(ShardConfig {
            count: 2,
            strategy: ShardStrategy::Weighted,
            weights_sql: Some("SELECT store_id, n FROM store_size".into()),
        });
        let selection = plan_root(&config, &Schemas::new().ctx(), session.as_mut()).await.unwrap();
        assert_eq!(selection.shards[&ShardKey::Index(0)], vec![2]);
        assert_eq!(selection.shards[&ShardKey::Index(1)], vec![1, 3]);
    }

    #[test]
    fn test_bind_params_renders_literals() {
        let params = BTreeMap::from([
            ("region".to_string(), SqlParam::Text("it's".into())),
            ("min".to_string(), SqlParam::Int(3)),
            ("ids".to_string(), SqlParam::List(vec![SqlParam::Int(1), SqlParam::Int(2)])),
            ("live".to_string(), SqlParam::Bool(true)),
        ]);
        let sql = bind_params(
            "SELECT id FROM store WHERE region = %(region)s AND size > %(min)s AND id = ANY(%(ids)s) AND live = %(live)s",
            &params,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT id FROM store WHERE region = 'it''s' AND size > 3 AND id = ANY(ARRAY[1, 2]) AND live = true"
        );
        assert_eq!(
            bind_params("SELECT %(none)s", &BTreeMap::from([("none".to_string(), SqlParam::List(vec![]))]))
                .unwrap(),
            "SELECT '{}'"
        );
    }

    #[test]
    fn test_bind_params_names_missing_placeholder() {
        let err = bind_params("SELECT id FROM store WHERE region = %(region)s", &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, SliceError::Config(_)));
        assert!(err.to_string().contains("region"));
        // Plain percent signs are left alone.
        assert_eq!(
            bind_params("SELECT id FROM store WHERE name LIKE 'a%'", &BTreeMap::new()).unwrap(),
            "SELECT id FROM store WHERE name LIKE 'a%'"
        );
    }

    #[tokio::test]
    async fn test_sql_selector_binds_params() {
        let connector = MockConnector::new().with_rows("AS s(id)", vec![vec![Some(9)]]);
        let mut session = connector.connect().await.unwrap();
        let selection = plan_root(
            &root(Selector::Sql {
                sql: "SELECT id FROM store WHERE size > %(min)s".into(),
                params: BTreeMap::from([("min".to_string(), SqlParam::Int(10))]),
            }),
            &Schemas::new().ctx(),
            session.as_mut(),
        )
        .await
        .unwrap();
        assert_eq!(selection.ids, vec![9]);
        assert_eq!(
            connector.queries(),
            vec!["SELECT s.id::bigint FROM (SELECT id FROM store WHERE size > 10) AS s(id)"]
        );
    }

    #[test]
    fn test_referenced_by_unions_existing_refs() {
        let schemas = Schemas::new();
        let config = root(Selector::ReferencedBy {
            refs: vec![
                ColumnRef {
                    schema: None,
                    table: "order".into(),
                    column: "store_id".into(),
                },
                ColumnRef {
                    schema: None,
                    table: "product".into(),
                    column: "store_id".into(),
                },
            ],
        });
        let sql = selector_query(&config, &config.selector, &schemas.ctx())
            .unwrap()
            .unwrap();
        // product is not in the destination yet.
        assert_eq!(
            sql,
            "SELECT u.id FROM (SELECT DISTINCT \"store_id\" AS id FROM \"stage\".\"order\") AS u WHERE u.id IS NOT NULL"
        );
    }

    #[test]
    fn test_referenced_by_column_scans_schema_and_extra_refs() {
        let mut schemas = Schemas::new();
        schemas.dest = loaded_snapshot(&schemas.source, &["store", "order", "product"]);
        let mut archive = SchemaSnapshot::empty("archive");
        archive.insert_table(Table::new(
            "old_order",
            vec![crate::core::schema::Column::new("shop", "bigint")],
        ));
        schemas.others.insert("archive".into(), archive);

        let config = root(Selector::ReferencedByColumn {
            schema: None,
            column: "store_id".into(),
            extra_refs: vec![
                ColumnRef {
                    schema: Some("archive".into()),
                    table: "old_order".into(),
                    column: "shop".into(),
                },
                ColumnRef {
                    schema: Some("archive".into()),
                    table: "gone".into(),
                    column: "shop".into(),
                },
            ],
        });
        let sql = selector_query(&config, &config.selector, &schemas.ctx())
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT u.id FROM (SELECT DISTINCT \"store_id\" AS id FROM \"stage\".\"order\" \
             UNION SELECT DISTINCT \"store_id\" AS id FROM \"stage\".\"product\" \
             UNION SELECT DISTINCT \"shop\" AS id FROM \"archive\".\"old_order\") AS u WHERE u.id IS NOT NULL"
        );
    }

    #[test]
    fn test_fk_in_stage_joins_destination_table() {
        let schemas = Schemas::new();
        let mut config = root(Selector::FkInStage {
            fk_column: "store_id".into(),
            stage_table: "store".into(),
            stage_id_col: "id".into(),
        });
        config.name = "products".into();
        config.table = "product".into();
        let sql = selector_query(&config, &config.selector, &schemas.ctx())
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT d.\"id\" FROM \"public\".\"product\" d JOIN \"stage\".\"store\" s ON s.\"id\" = d.\"store_id\" WHERE d.\"store_id\" IS NOT NULL"
        );

        config.selector = Selector::FkInStage {
            fk_column: "store_id".into(),
            stage_table: "warehouse".into(),
            stage_id_col: "id".into(),
        };
        assert!(selector_query(&config, &config.selector, &schemas.ctx())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_refers_to_stage_ors_present_targets() {
        let schemas = Schemas::new();
        let mut config = root(Selector::RefersToStage {
            targets: vec![
                StageTarget {
                    stage_table: "order".into(),
                    local_column: "order_id".into(),
                    stage_id_col: "id".into(),
                },
                StageTarget {
                    stage_table: "product".into(),
                    local_column: "product_id".into(),
                    stage_id_col: "id".into(),
                },
            ],
        });
        config.table = "order_item".into();
        let sql = selector_query(&config, &config.selector, &schemas.ctx())
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT d.\"id\" FROM \"public\".\"order_item\" d WHERE EXISTS (SELECT 1 FROM \"stage\".\"order\" x WHERE x.\"id\" = d.\"order_id\")"
        );
    }

    #[tokio::test]
    async fn test_stage_selector_without_tables_fails_unless_allowed() {
        let connector = MockConnector::new();
        let mut session = connector.connect().await.unwrap();
        let mut config = root(Selector::ReferencedBy {
            refs: vec![ColumnRef {
                schema: None,
                table: "invoice".into(),
                column: "store_id".into(),
            }],
        });
        let err = plan_root(&config, &Schemas::new().ctx(), session.as_mut())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("referenced_by selector reads no existing table"));

        config.allow_empty = true;
        let selection = plan_root(&config, &Schemas::new().ctx(), session.as_mut())
            .await
            .unwrap();
        assert!(selection.ids.is_empty());
        assert!(connector.queries().is_empty());
    }
}
