//! Identifier validation and quoting for generated SQL.
//!
//! Every statement dbslice issues is assembled from text: table and column names
//! from the live catalog, schema names from the profile, and join/filter expressions
//! written by the profile author. Identifiers cannot be bound as parameters, so they
//! are validated and double-quoted here before being spliced into SQL.
//!
//! Profile expressions are passed through verbatim (they are SQL by design), but
//! they are screened for statement separators and comments so an expression can
//! never smuggle a second statement into a task.

use crate::error::{Result, SliceError};

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and identifiers
/// longer than PostgreSQL's limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SliceError::config("Identifier cannot be empty"));
    }

    if name.contains('\0') {
        return Err(SliceError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SliceError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("users")?, "\"users\"");
/// assert_eq!(quote_pg("table\"name")?, "\"table\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a table name with its schema, both quoted.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Render a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Escape `LIKE`/`ILIKE` metacharacters so `value` matches literally.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Screen a profile-authored SQL expression (join, filter, selector).
///
/// `context` names where the expression came from and is echoed in the error.
pub fn validate_expression(expression: &str, context: &str) -> Result<()> {
    if expression.trim().is_empty() {
        return Err(SliceError::Config(format!("{}: expression is empty", context)));
    }

    let outside_literals = strip_literals(expression);

    if outside_literals.contains(';') {
        return Err(SliceError::Config(format!(
            "SECURITY: {} contains a statement separator: {:?}",
            context, expression
        )));
    }

    if outside_literals.contains("--") || outside_literals.contains("/*") {
        return Err(SliceError::Config(format!(
            "SECURITY: {} contains SQL comment markers: {:?}",
            context, expression
        )));
    }

    Ok(())
}

/// Replace the contents of single-quoted literals with nothing, keeping the quotes.
pub(crate) fn strip_literals(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut in_literal = false;
    let mut chars = expression.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\'' {
            if in_literal && chars.peek() == Some(&'\'') {
                chars.next();
                continue;
            }
            in_literal = !in_literal;
            out.push(ch);
        } else if !in_literal {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("order_item").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_length_limit() {
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
        let result = validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1));
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("order").unwrap(), "\"order\"");
        assert_eq!(quote_pg("a\"b").unwrap(), "\"a\"\"b\"");
    }

    #[test]
    fn test_qualify_pg() {
        assert_eq!(qualify_pg("stage", "order").unwrap(), "\"stage\".\"order\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("x-"), "'x-'");
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("x_1%"), "x\\_1\\%");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_validate_expression_accepts_joins() {
        assert!(validate_expression("d.store_id = p.id", "join").is_ok());
        assert!(validate_expression("d.status <> 'x;y'", "where").is_ok());
        assert!(validate_expression("d.note <> 'it''s -- fine'", "where").is_ok());
    }

    #[test]
    fn test_validate_expression_rejects_injection() {
        assert!(validate_expression("d.id = p.id; DROP TABLE x", "join").is_err());
        assert!(validate_expression("d.id = p.id -- trailing", "join").is_err());
        assert!(validate_expression("   ", "join").is_err());
    }
}
