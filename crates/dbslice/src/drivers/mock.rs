//! In-memory connector used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::schema::SchemaSnapshot;
use crate::core::traits::{CatalogSource, Connector, Session};
use crate::error::{Result, SliceError};

#[derive(Default)]
struct State {
    committed: Vec<Vec<String>>,
    queries: Vec<String>,
    fail_on: Vec<String>,
    rows: Vec<(String, Vec<Vec<Option<i64>>>)>,
    affected: Vec<(String, u64)>,
    snapshots: HashMap<String, SchemaSnapshot>,
    sessions: usize,
}

/// Records every committed batch and answers queries from preset rows.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any batch containing a statement with this substring.
    pub fn fail_on(self, needle: &str) -> Self {
        self.state.lock().unwrap().fail_on.push(needle.to_string());
        self
    }

    /// Answer queries containing `needle` with `rows`.
    pub fn with_rows(self, needle: &str, rows: Vec<Vec<Option<i64>>>) -> Self {
        self.state
            .lock()
            .unwrap()
            .rows
            .push((needle.to_string(), rows));
        self
    }

    /// Report `count` affected rows for statements containing `needle`.
    pub fn affecting(self, needle: &str, count: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .affected
            .push((needle.to_string(), count));
        self
    }

    pub fn with_snapshot(self, snapshot: SchemaSnapshot) -> Self {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(snapshot.schema.clone(), snapshot);
        self
    }

    /// Committed batches in commit order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Every committed statement in commit order.
    pub fn executed(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn sessions(&self) -> usize {
        self.state.lock().unwrap().sessions
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Session>> {
        self.state.lock().unwrap().sessions += 1;
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[async_trait]
impl CatalogSource for MockConnector {
    async fn snapshot(&self, schema: &str) -> Result<SchemaSnapshot> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .get(schema)
            .cloned()
            .unwrap_or_else(|| SchemaSnapshot::empty(schema)))
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().snapshots.contains_key(schema))
    }
}

struct MockSession {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Session for MockSession {
    async fn execute_batch(&mut self, statements: &[String]) -> Result<u64> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        for statement in statements {
            if let Some(needle) = state.fail_on.iter().find(|n| statement.contains(n.as_str())) {
                return Err(SliceError::connection(
                    format!("simulated failure on '{}'", needle),
                    "mock session",
                ));
            }
        }
        let affected = statements
            .iter()
            .map(|s| {
                state
                    .affected
                    .iter()
                    .find(|(needle, _)| s.contains(needle.as_str()))
                    .map(|(_, n)| *n)
                    .unwrap_or(0)
            })
            .sum();
        state.committed.push(statements.to_vec());
        Ok(affected)
    }

    async fn query_ints(&mut self, sql: &str) -> Result<Vec<Vec<Option<i64>>>> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(sql.to_string());
        if let Some(needle) = state.fail_on.iter().find(|n| sql.contains(n.as_str())) {
            return Err(SliceError::connection(
                format!("simulated failure on '{}'", needle),
                "mock session",
            ));
        }
        Ok(state
            .rows
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}
