//! Schema reconciliation: bring the destination's structure in line with the source.
//!
//! Every phase is a pure planner. It diffs the source snapshot against a fresh
//! destination snapshot and emits waves of DDL units for the fanout scheduler, so
//! re-running a phase against an already reconciled destination plans nothing.
//!
//! | Phase              | Waves                                              |
//! |--------------------|----------------------------------------------------|
//! | Index              | primary keys, then secondary indexes               |
//! | StorageFinalize    | `SET LOGGED`                                       |
//! | Constraints        | NOT NULL + unique/check/exclusion, then FKs (serial) |
//! | Sequences          | sequences + setval, defaults, extraneous drops     |
//! | TriggersFunctions  | functions, then triggers                           |
//! | Validation         | anti-join count + `VALIDATE CONSTRAINT`            |

pub mod constraints;
pub mod index;
pub mod routines;
pub mod sequences;
pub mod storage;
pub mod validation;

use crate::config::ReconcileConfig;
use crate::core::identifier::qualify_pg;
use crate::core::rewrite::{canonical, SchemaRewriter};
use crate::core::schema::{SchemaSnapshot, Table};
use crate::error::{Result, SliceError};
use crate::fanout::Wave;
use crate::report::Phase;

/// Read-only inputs shared by the reconcile planners.
pub struct ReconcileContext<'a> {
    pub source: &'a SchemaSnapshot,
    pub dest: &'a SchemaSnapshot,
    pub options: &'a ReconcileConfig,
    rewriter: SchemaRewriter,
    normalizer: SchemaRewriter,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(
        source: &'a SchemaSnapshot,
        dest: &'a SchemaSnapshot,
        options: &'a ReconcileConfig,
    ) -> Result<Self> {
        Ok(Self {
            source,
            dest,
            options,
            rewriter: SchemaRewriter::new(&source.schema, &dest.schema)?,
            normalizer: SchemaRewriter::new(&dest.schema, &dest.schema)?,
        })
    }

    /// Source tables that exist in the destination, paired with their copy.
    pub fn tables(&self) -> impl Iterator<Item = (&'a Table, &'a Table)> + '_ {
        self.source
            .tables
            .values()
            .filter_map(move |src| self.dest.table(&src.name).map(|dst| (src, dst)))
    }

    /// Destination-qualified table name.
    pub fn target(&self, table: &str) -> Result<String> {
        qualify_pg(&self.dest.schema, table)
    }

    /// A source definition retargeted at the destination schema.
    pub fn rewrite(&self, definition: &str) -> String {
        self.rewriter.rewrite(definition)
    }

    /// A source column default retargeted at the destination schema.
    pub fn rewrite_default(&self, default: &str) -> String {
        self.rewriter.rewrite_default(default)
    }

    /// Compare a source definition with one read from the destination.
    pub fn same(&self, source: &str, dest: &str) -> bool {
        canonical(&self.rewrite(source)) == canonical(&self.normalizer.rewrite(dest))
    }

    /// Compare column defaults the way [`ReconcileContext::same`] compares definitions.
    pub fn same_default(&self, source: &str, dest: &str) -> bool {
        canonical(&self.rewrite_default(source))
            == canonical(&self.normalizer.rewrite_default(dest))
    }
}

/// Plan one reconcile phase.
pub fn plan(phase: Phase, ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    let waves = match phase {
        Phase::Index => index::plan(ctx)?,
        Phase::StorageFinalize => storage::plan(ctx)?,
        Phase::Constraints => constraints::plan(ctx)?,
        Phase::Sequences => sequences::plan(ctx)?,
        Phase::TriggersFunctions => routines::plan(ctx)?,
        Phase::Validation => validation::plan(ctx)?,
        other => {
            return Err(SliceError::config(format!(
                "{} is not a reconcile phase",
                other
            )))
        }
    };
    Ok(waves.into_iter().filter(|w| !w.units.is_empty()).collect())
}

/// Keep the units working on `table`, dropping waves left empty.
pub fn restrict(waves: Vec<Wave>, table: &str) -> Vec<Wave> {
    waves
        .into_iter()
        .filter_map(|mut wave| {
            wave.units.retain(|unit| unit.table == table);
            (!wave.units.is_empty()).then_some(wave)
        })
        .collect()
}
