//! The table dependency graph of one stage.
//!
//! Nodes are destination tables, edges run from a parent to the tables whose rows
//! are selected by joining against it. The graph is validated for cycles and
//! against the source catalog before any SQL is generated.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::config::{DepKind, FamilyConfig, Profile, Source};
use crate::core::rewrite::alias_refs;
use crate::core::schema::{SchemaSnapshot, Table};
use crate::error::{Result, SliceError};

/// Role of a table in the stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Copied empty or in full from the precopy list.
    Precopy,
    /// Root table of a family.
    Root { family: String },
    /// Dependent table of a family.
    Dep { family: String, index: usize },
    /// Already present in the destination; read, never written.
    Existing,
}

/// Validated dependency graph with topological order and depths.
#[derive(Debug)]
pub struct FamilyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    kinds: HashMap<String, NodeKind>,
    order: Vec<String>,
    depth: HashMap<String, usize>,
}

impl FamilyGraph {
    /// Build the graph of `families` and `precopy` tables.
    ///
    /// `existing` lists tables already in the destination that deps may join against.
    pub fn build(
        profile: &Profile,
        families: &[&FamilyConfig],
        precopy: &[String],
        existing: &BTreeSet<String>,
        source: &SchemaSnapshot,
    ) -> Result<Self> {
        let mut builder = Builder {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            kinds: HashMap::new(),
        };

        for table in existing {
            builder.add(table, NodeKind::Existing);
        }
        for table in precopy {
            require_table(source, table)?;
            builder.add(table, NodeKind::Precopy);
        }
        for family in families {
            builder.add(
                &family.root.table,
                NodeKind::Root {
                    family: family.name.clone(),
                },
            );
            for (index, dep) in family.deps.iter().enumerate() {
                builder.add(
                    &dep.table,
                    NodeKind::Dep {
                        family: family.name.clone(),
                        index,
                    },
                );
            }
        }

        for family in families {
            validate_root(profile, family, source)?;
            for dep in &family.deps {
                let child = require_table(source, &dep.table)?;
                if let Some(pk_mod) = &dep.pk_mod {
                    require_column(child, &pk_mod.key)?;
                }
                match &dep.kind {
                    DepKind::Join {
                        parent,
                        join,
                        filter,
                    } => {
                        builder.edge(parent, &dep.table)?;
                        let parent_table = require_table(source, parent)?;
                        check_refs(child, Some(parent_table), join)?;
                        if let Some(filter) = filter {
                            check_refs(child, Some(parent_table), filter)?;
                        }
                    }
                    DepKind::Union { sources } => {
                        for src in sources {
                            let parent_table = match src {
                                Source::Parent { table, .. } => {
                                    builder.edge(table, &dep.table)?;
                                    Some(require_table(source, table)?)
                                }
                                Source::Selection { .. } => None,
                            };
                            check_refs(child, parent_table, src.join())?;
                            if let Some(filter) = src.filter() {
                                check_refs(child, parent_table, filter)?;
                            }
                        }
                    }
                }
            }
        }

        builder.finish()
    }

    /// Tables in topological order (parents first).
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Role of a table, if it is in the graph.
    pub fn kind(&self, table: &str) -> Option<&NodeKind> {
        self.kinds.get(table)
    }

    /// Longest parent chain written in this stage above `table`.
    pub fn depth(&self, table: &str) -> usize {
        self.depth.get(table).copied().unwrap_or(0)
    }

    /// Direct parents of `table`.
    pub fn parents(&self, table: &str) -> Vec<&str> {
        let Some(&node) = self.nodes.get(table) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|p| self.graph[p].as_str())
            .collect()
    }

    /// Tables written by this stage, in topological order.
    pub fn written(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|t| self.kinds.get(t.as_str()) != Some(&NodeKind::Existing))
            .map(String::as_str)
    }
}

struct Builder {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    kinds: HashMap<String, NodeKind>,
}

impl Builder {
    fn add(&mut self, table: &str, kind: NodeKind) {
        let graph = &mut self.graph;
        self.nodes
            .entry(table.to_string())
            .or_insert_with(|| graph.add_node(table.to_string()));
        self.kinds.insert(table.to_string(), kind);
    }

    fn edge(&mut self, parent: &str, child: &str) -> Result<()> {
        let (Some(&from), Some(&to)) = (self.nodes.get(parent), self.nodes.get(child)) else {
            return Err(SliceError::Config(format!(
                "table '{}' joins against '{}', which is neither copied before it nor present in the destination",
                child, parent
            )));
        };
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    fn finish(self) -> Result<FamilyGraph> {
        let sorted = match toposort(&self.graph, None) {
            Ok(sorted) => sorted,
            Err(_) => return Err(self.cycle_error()),
        };

        let mut depth: HashMap<String, usize> = HashMap::new();
        for &node in &sorted {
            let name = &self.graph[node];
            if self.kinds.get(name) == Some(&NodeKind::Existing) {
                continue;
            }
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|p| depth.get(&self.graph[p]).map(|d| d + 1))
                .max()
                .unwrap_or(0);
            depth.insert(name.clone(), d);
        }

        let order = sorted.iter().map(|&n| self.graph[n].clone()).collect();
        Ok(FamilyGraph {
            graph: self.graph,
            nodes: self.nodes,
            kinds: self.kinds,
            order,
            depth,
        })
    }

    fn cycle_error(&self) -> SliceError {
        let mut tables = BTreeSet::new();
        for component in kosaraju_scc(&self.graph) {
            let self_loop = component.len() == 1
                && self.graph.find_edge(component[0], component[0]).is_some();
            if component.len() > 1 || self_loop {
                tables.extend(component.iter().map(|&n| self.graph[n].clone()));
            }
        }
        SliceError::GraphCycle {
            tables: tables.into_iter().collect(),
        }
    }
}

fn require_table<'a>(source: &'a SchemaSnapshot, table: &str) -> Result<&'a Table> {
    source
        .table(table)
        .ok_or_else(|| SliceError::missing_table(table))
}

fn require_column(table: &Table, column: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(SliceError::missing_column(&table.name, column))
    }
}

/// Every `d.col` must exist on the child; every `p.col` on the parent, or be `id`
/// when the parent is a selection.
fn check_refs(child: &Table, parent: Option<&Table>, expression: &str) -> Result<()> {
    let refs = alias_refs(expression);
    for column in &refs.child {
        require_column(child, column)?;
    }
    for column in &refs.parent {
        match parent {
            Some(parent) => require_column(parent, column)?,
            None if column == "id" => {}
            None => {
                return Err(SliceError::missing_column(
                    format!("selection (for {})", child.name),
                    column,
                ))
            }
        }
    }
    Ok(())
}

fn validate_root(profile: &Profile, family: &FamilyConfig, source: &SchemaSnapshot) -> Result<()> {
    let table = require_table(source, &family.root.table)?;
    require_column(table, &family.root.id_col)?;
    if let Some(join) = &family.root.join {
        check_refs(table, None, join)?;
    }
    if let Some(root) = family.root.selection.as_deref().and_then(|n| profile.root(n)) {
        let root_table = require_table(source, &root.table)?;
        require_column(root_table, &root.id_col)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::shop_snapshot;

    fn profile(deps: &str) -> Profile {
        Profile::from_yaml(&format!(
            r#"
roots:
  - name: stores
    table: store
    selector: {{ mode: list, ids: [1] }}
families:
  - name: shop
    root: {{ table: store, selection: stores }}
    deps:
{}
"#,
            deps
        ))
        .unwrap()
    }

    fn build(profile: &Profile) -> Result<FamilyGraph> {
        let families: Vec<&FamilyConfig> = profile.families.iter().collect();
        FamilyGraph::build(profile, &families, &[], &BTreeSet::new(), &shop_snapshot())
    }

    const SHOP: &str = r#"      - { table: product, parent_table: store, join: d.store_id = p.id }
      - { table: order, parent_table: store, join: d.store_id = p.id }
      - { table: order_item, parent_table: order, join: d.order_id = p.id }"#;

    #[test]
    fn test_topological_order_and_depth() {
        let graph = build(&profile(SHOP)).unwrap();
        let order = graph.order();
        let pos = |t: &str| order.iter().position(|o| o == t).unwrap();
        assert!(pos("store") < pos("order"));
        assert!(pos("order") < pos("order_item"));
        assert_eq!(graph.depth("store"), 0);
        assert_eq!(graph.depth("product"), 1);
        assert_eq!(graph.depth("order_item"), 2);
        assert_eq!(graph.parents("order_item"), vec!["order"]);
    }

    #[test]
    fn test_cycle_names_tables() {
        let deps = r#"      - { table: order, parent_table: order_item, join: d.id = p.order_id }
      - { table: order_item, parent_table: order, join: d.order_id = p.id }"#;
        match build(&profile(deps)).unwrap_err() {
            SliceError::GraphCycle { tables } => {
                assert_eq!(tables, vec!["order".to_string(), "order_item".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let deps = "      - { table: product, parent_table: product, join: d.id = p.id }";
        assert!(matches!(
            build(&profile(deps)).unwrap_err(),
            SliceError::GraphCycle { .. }
        ));
    }

    #[test]
    fn test_missing_column_in_join() {
        let deps = "      - { table: product, parent_table: store, join: d.shop_id = p.id }";
        match build(&profile(deps)).unwrap_err() {
            SliceError::SchemaMismatch { table, column } => {
                assert_eq!(table, "product");
                assert_eq!(column.as_deref(), Some("shop_id"));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_selection_source_exposes_only_id() {
        let deps = r#"      - table: product
        sources:
          - { selection: stores, join: d.store_id = p.store_id }"#;
        assert!(matches!(
            build(&profile(deps)).unwrap_err(),
            SliceError::SchemaMismatch { .. }
        ));
    }

    #[test]
    fn test_missing_table() {
        let deps = "      - { table: invoice, parent_table: store, join: d.store_id = p.id }";
        assert!(matches!(
            build(&profile(deps)).unwrap_err(),
            SliceError::SchemaMismatch { column: None, .. }
        ));
    }

    #[test]
    fn test_unknown_parent_is_config_error() {
        let deps = "      - { table: order_item, parent_table: order, join: d.order_id = p.id }";
        assert!(matches!(
            build(&profile(deps)).unwrap_err(),
            SliceError::Config(_)
        ));
    }

    #[test]
    fn test_existing_parent_gives_depth_zero() {
        let profile = profile("      - { table: order_item, parent_table: order, join: d.order_id = p.id }");
        let families: Vec<&FamilyConfig> = profile.families.iter().collect();
        let existing = BTreeSet::from(["order".to_string()]);
        let graph =
            FamilyGraph::build(&profile, &families, &[], &existing, &shop_snapshot()).unwrap();
        assert_eq!(graph.depth("order_item"), 0);
        assert_eq!(graph.kind("order"), Some(&NodeKind::Existing));
        assert!(!graph.written().any(|t| t == "order"));
    }
}
