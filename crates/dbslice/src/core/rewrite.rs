//! Text rewrites applied to catalog definitions and profile expressions.
//!
//! Source definitions (`pg_get_indexdef`, `pg_get_constraintdef`,
//! `pg_get_triggerdef`, `pg_get_functiondef`, column defaults) name the source
//! schema. Before replaying them against the destination, every schema-qualified
//! reference is rewritten to point at the destination schema.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::identifier::strip_literals;
use crate::error::{Result, SliceError};

static ALIAS_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b([dp])\.(?:"((?:[^"]|"")+)"|([A-Za-z_][A-Za-z0-9_$]*))"#).unwrap()
});

/// Rewrites references to one schema into another.
#[derive(Debug, Clone)]
pub struct SchemaRewriter {
    bare: Regex,
    quoted: Regex,
    nextval: Regex,
    replacement: String,
}

impl SchemaRewriter {
    /// Build a rewriter from `source` to `dest`.
    pub fn new(source: &str, dest: &str) -> Result<Self> {
        let escaped = regex::escape(source);
        let quoted_src = regex::escape(&source.replace('"', "\"\""));
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| {
                SliceError::Config(format!("cannot rewrite schema {:?}: {}", source, e))
            })
        };
        Ok(Self {
            bare: compile(format!(r"\b{}\.", escaped))?,
            quoted: compile(format!(r#""{}"\."#, quoted_src))?,
            nextval: compile(format!(
                r#"nextval\('(?:(?:{}|"{}")\.)?("?[^'".]+"?)'"#,
                escaped, quoted_src
            ))?,
            replacement: format!("\"{}\".", dest.replace('"', "\"\"")),
        })
    }

    /// Rewrite every `source.` / `"source".` prefix to the destination schema.
    pub fn rewrite(&self, text: &str) -> String {
        let once = self.quoted.replace_all(text, self.replacement.as_str());
        self.bare
            .replace_all(&once, self.replacement.as_str())
            .into_owned()
    }

    /// Rewrite a column default: qualified references are moved to the destination,
    /// and unqualified `nextval('seq')` calls are qualified with it.
    pub fn rewrite_default(&self, default: &str) -> String {
        let qualified = self
            .nextval
            .replace_all(default, format!("nextval('{}$1'", self.replacement).as_str())
            .into_owned();
        // Qualified nextval calls were already moved, so only rewrite the remainder.
        if qualified != default {
            qualified
        } else {
            self.rewrite(default)
        }
    }
}

/// Whitespace-normalize a definition for equality comparison.
pub fn canonical(definition: &str) -> String {
    definition.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Column references made through a table alias in a profile expression.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AliasRefs {
    /// Columns referenced as `d.<col>` (the table being copied).
    pub child: BTreeSet<String>,
    /// Columns referenced as `p.<col>` (the parent or selection).
    pub parent: BTreeSet<String>,
}

/// Extract `d.col` and `p.col` references, ignoring text inside string literals.
///
/// Unquoted names fold to lower case the way PostgreSQL folds them.
pub fn alias_refs(expression: &str) -> AliasRefs {
    let mut refs = AliasRefs::default();
    let text = strip_literals(expression);
    for caps in ALIAS_REF.captures_iter(&text) {
        let column = match (caps.get(2), caps.get(3)) {
            (Some(quoted), _) => quoted.as_str().replace("\"\"", "\""),
            (None, Some(bare)) => bare.as_str().to_lowercase(),
            (None, None) => continue,
        };
        match &caps[1] {
            "d" => refs.child.insert(column),
            _ => refs.parent.insert(column),
        };
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_bare_and_quoted() {
        let rw = SchemaRewriter::new("public", "stage").unwrap();
        assert_eq!(
            rw.rewrite("CREATE INDEX ix ON public.orders USING btree (id)"),
            "CREATE INDEX ix ON \"stage\".orders USING btree (id)"
        );
        assert_eq!(
            rw.rewrite("REFERENCES \"public\".\"Store\"(id)"),
            "REFERENCES \"stage\".\"Store\"(id)"
        );
    }

    #[test]
    fn test_rewrite_respects_word_boundary() {
        let rw = SchemaRewriter::new("public", "stage").unwrap();
        assert_eq!(rw.rewrite("not_public.t"), "not_public.t");
    }

    #[test]
    fn test_rewrite_default_qualifies_nextval() {
        let rw = SchemaRewriter::new("public", "stage").unwrap();
        assert_eq!(
            rw.rewrite_default("nextval('order_id_seq'::regclass)"),
            "nextval('\"stage\".order_id_seq'::regclass)"
        );
        assert_eq!(
            rw.rewrite_default("nextval('public.order_id_seq'::regclass)"),
            "nextval('\"stage\".order_id_seq'::regclass)"
        );
        assert_eq!(
            rw.rewrite_default("nextval('other.seq'::regclass)"),
            "nextval('other.seq'::regclass)"
        );
        assert_eq!(rw.rewrite_default("now()"), "now()");
    }

    #[test]
    fn test_canonical() {
        assert_eq!(canonical("  CHECK ((qty >\n 0))  "), "CHECK ((qty > 0))");
    }

    #[test]
    fn test_alias_refs() {
        let refs = alias_refs("d.order_id = p.id AND d.\"Kind\" <> 'p.fake' AND d.Status = 1");
        assert_eq!(
            refs.child.into_iter().collect::<Vec<_>>(),
            vec!["Kind".to_string(), "order_id".to_string(), "status".to_string()]
        );
        assert_eq!(refs.parent.into_iter().collect::<Vec<_>>(), vec!["id".to_string()]);
    }

    #[test]
    fn test_alias_refs_ignores_other_aliases() {
        let refs = alias_refs("x.id = y.id AND dd.id = 1");
        assert!(refs.child.is_empty());
        assert!(refs.parent.is_empty());
    }
}
