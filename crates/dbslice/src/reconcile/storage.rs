//! Switch loaded tables from unlogged to logged storage.

use super::ReconcileContext;
use crate::error::Result;
use crate::fanout::{Unit, Wave};

pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    let mut units = Vec::new();
    for (src, dst) in ctx.tables() {
        if dst.unlogged {
            units.push(Unit::statements(
                &src.name,
                "set logged",
                vec![format!("ALTER TABLE {} SET LOGGED", ctx.target(&src.name)?)],
            ));
        }
    }
    Ok(vec![Wave::parallel(units)])
}
