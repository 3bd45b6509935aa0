//! Core abstractions shared by every stage of a run.
//!
//! - [`identifier`]: identifier quoting and expression screening
//! - [`rewrite`]: schema rewriting of catalog definitions, alias reference parsing
//! - [`schema`]: catalog snapshot types
//! - [`traits`]: the database boundary (connector, session, catalog source)

pub mod identifier;
pub mod rewrite;
pub mod schema;
pub mod traits;

pub use identifier::{qualify_pg, quote_literal, quote_pg};
pub use rewrite::{alias_refs, canonical, AliasRefs, SchemaRewriter};
pub use schema::{
    Column, Constraint, ConstraintKind, ForeignKeyRef, Function, Index, PrimaryKey,
    SchemaSnapshot, Sequence, Table, Trigger,
};
pub use traits::{CatalogSource, Connector, Session};
