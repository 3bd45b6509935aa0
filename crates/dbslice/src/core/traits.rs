//! Core traits at the database boundary.
//!
//! The planner, scheduler and reconciler never touch a driver directly. They issue
//! SQL text through these traits and receive row counts, integer rows or errors:
//!
//! - [`Connector`]: opens a fresh, exclusively owned [`Session`]
//! - [`Session`]: executes statements transactionally and reads integer results
//! - [`CatalogSource`]: produces a [`SchemaSnapshot`] for a schema
//!
//! # Connection model
//!
//! Every fanout task calls [`Connector::connect`] for itself and drops the session
//! when it finishes. Nothing is pooled, so no two tasks ever share a connection or
//! a transaction.

use async_trait::async_trait;

use crate::error::Result;

use super::schema::SchemaSnapshot;

/// Opens database sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session. The caller owns it exclusively.
    async fn connect(&self) -> Result<Box<dyn Session>>;

    /// Short description of the endpoint for logs (never includes credentials).
    fn describe(&self) -> String;
}

/// A single database connection.
#[async_trait]
pub trait Session: Send {
    /// Run `statements` in order inside one transaction and commit.
    ///
    /// Returns the sum of the affected-row counts. If any statement fails the
    /// transaction is rolled back and the error returned.
    async fn execute_batch(&mut self, statements: &[String]) -> Result<u64>;

    /// Run a query whose columns are all integers (or castable to `bigint` by the
    /// query itself) and return every row.
    async fn query_ints(&mut self, sql: &str) -> Result<Vec<Vec<Option<i64>>>>;

    /// Run a single statement in its own transaction.
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.execute_batch(&[sql.to_string()]).await
    }

    /// Run a query returning one integer, e.g. `SELECT count(*) ...`.
    async fn query_scalar(&mut self, sql: &str) -> Result<Option<i64>> {
        let rows = self.query_ints(sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }
}

/// Reads catalog metadata.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Introspect a schema. A schema that does not exist yields an empty snapshot.
    async fn snapshot(&self, schema: &str) -> Result<SchemaSnapshot>;

    /// Check whether a schema exists.
    async fn schema_exists(&self, schema: &str) -> Result<bool>;
}
