//! Copy planning: selections, the family graph, and the Create/Load tasks that
//! materialize a stage in the destination.
//!
//! - [`selection`]: resolve root selectors into (sharded) id sets
//! - [`graph`]: dependency graph, cycle and column validation
//! - [`query`]: row-selecting SQL for roots and deps
//! - [`resolve`]: turn the graph into waves of tasks

pub mod graph;
pub mod query;
pub mod resolve;
pub mod selection;

pub use graph::{FamilyGraph, NodeKind};
pub use resolve::{resolve, CopyPlan, CopyScope, StageInput};
pub use selection::{
    bind_params, plan_root, values_query, RootSelection, SelectionSet, SelectorContext, ShardKey,
};

use serde::{Deserialize, Serialize};

/// What a task does to its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Replace the target with an unlogged table built from the query.
    CreateAsSelect,
    /// Append the query's rows to the existing target.
    Insert,
}

/// One unit of copy work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Destination table the task contributes to.
    pub table: String,
    /// Quoted, schema-qualified table written.
    pub target: String,
    pub shard: ShardKey,
    pub operation: Operation,
    pub source_query: String,
    /// Barrier group within the phase; wave N finishes before N+1 starts.
    pub wave: usize,
}

impl Task {
    /// Statements run in the task's transaction.
    pub fn statements(&self) -> Vec<String> {
        match self.operation {
            Operation::CreateAsSelect => vec![
                format!("DROP TABLE IF EXISTS {} CASCADE", self.target),
                format!(
                    "CREATE UNLOGGED TABLE {} AS {}",
                    self.target, self.source_query
                ),
            ],
            Operation::Insert => vec![format!(
                "INSERT INTO {} {}",
                self.target, self.source_query
            )],
        }
    }
}

/// Group tasks by wave, in ascending wave order.
pub fn waves(tasks: &[Task]) -> Vec<Vec<&Task>> {
    let mut grouped: std::collections::BTreeMap<usize, Vec<&Task>> = Default::default();
    for task in tasks {
        grouped.entry(task.wave).or_default().push(task);
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(operation: Operation, wave: usize) -> Task {
        Task {
            table: "order".into(),
            target: "\"stage\".\"order\"".into(),
            shard: ShardKey::Global,
            operation,
            source_query: "SELECT d.* FROM \"public\".\"order\" d".into(),
            wave,
        }
    }

    #[test]
    fn test_create_as_select_replaces_target() {
        assert_eq!(
            task(Operation::CreateAsSelect, 0).statements(),
            vec![
                "DROP TABLE IF EXISTS \"stage\".\"order\" CASCADE".to_string(),
                "CREATE UNLOGGED TABLE \"stage\".\"order\" AS SELECT d.* FROM \"public\".\"order\" d"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_insert_appends() {
        assert_eq!(
            task(Operation::Insert, 0).statements(),
            vec!["INSERT INTO \"stage\".\"order\" SELECT d.* FROM \"public\".\"order\" d".to_string()]
        );
    }

    #[test]
    fn test_waves_are_compacted_and_ordered() {
        let tasks = vec![
            task(Operation::Insert, 2),
            task(Operation::Insert, 0),
            task(Operation::Insert, 2),
        ];
        let grouped = waves(&tasks);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0][0].wave, 0);
        assert_eq!(grouped[1].len(), 2);
    }
}
