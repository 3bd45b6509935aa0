//! Functions and triggers, replayed from source definitions.

use super::ReconcileContext;
use crate::core::identifier::quote_pg;
use crate::error::Result;
use crate::fanout::{Unit, Wave};

/// Wave 0 creates or replaces functions, wave 1 reconciles triggers per table.
pub fn plan(ctx: &ReconcileContext<'_>) -> Result<Vec<Wave>> {
    let mut functions = Vec::new();
    let mut triggers = Vec::new();

    if ctx.options.functions {
        for function in &ctx.source.functions {
            if let Some(existing) = ctx.dest.function(&function.name, &function.arguments) {
                if ctx.same(&function.definition, &existing.definition) {
                    continue;
                }
            }
            functions.push(Unit::statements(
                &function.name,
                format!("function {}", function.signature()),
                vec![
                    // Bodies may call functions created later in the same wave.
                    "SET LOCAL check_function_bodies = off".to_string(),
                    ctx.rewrite(&function.definition),
                ],
            ));
        }
    }

    if ctx.options.triggers {
        for (src, dst) in ctx.tables() {
            let target = ctx.target(&src.name)?;
            let mut statements = Vec::new();

            for trigger in &src.triggers {
                if let Some(existing) = dst.trigger(&trigger.name) {
                    if ctx.same(&trigger.definition, &existing.definition) {
                        continue;
                    }
                    statements.push(drop_trigger(&trigger.name, &target)?);
                }
                statements.push(ctx.rewrite(&trigger.definition));
            }

            if ctx.options.drop_extra_triggers {
                for extra in dst
                    .triggers
                    .iter()
                    .filter(|t| src.trigger(&t.name).is_none())
                {
                    statements.push(drop_trigger(&extra.name, &target)?);
                }
            }

            if !statements.is_empty() {
                triggers.push(Unit::statements(&src.name, "triggers", statements));
            }
        }
    }

    Ok(vec![Wave::parallel(functions), Wave::parallel(triggers)])
}

fn drop_trigger(name: &str, target: &str) -> Result<String> {
    Ok(format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_pg(name)?,
        target
    ))
}
