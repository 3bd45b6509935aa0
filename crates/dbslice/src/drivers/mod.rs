//! Database driver implementations of the core traits.
//!
//! - [`postgres`]: PostgreSQL via tokio-postgres
//! - [`common`]: shared utilities (TLS)

pub mod common;
pub mod postgres;

#[cfg(test)]
pub(crate) mod mock;

pub use common::{SslMode, TlsBuilder};
pub use postgres::{PgConnector, PgSession};
