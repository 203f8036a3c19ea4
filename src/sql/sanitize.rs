//! SQL identifier and literal sanitization
//!
//! Identifiers are always quoted; field and datastore ids that end up inside
//! JSON path literals or index expressions are validated against a strict
//! character set before use.

/// PostgreSQL reserved keywords that cannot be used as unquoted identifiers
pub const POSTGRES_RESERVED_WORDS: &[&str] = &[
    "ALL",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLUMN",
    "CONSTRAINT",
    "CREATE",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DESC",
    "DISTINCT",
    "DO",
    "ELSE",
    "END",
    "EXCEPT",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FROM",
    "GRANT",
    "GROUP",
    "HAVING",
    "IN",
    "INITIALLY",
    "INTERSECT",
    "INTO",
    "LATERAL",
    "LEADING",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "NOT",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "RETURNING",
    "SELECT",
    "SESSION_USER",
    "SOME",
    "SYMMETRIC",
    "TABLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "UNION",
    "UNIQUE",
    "USER",
    "USING",
    "VARIADIC",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

/// Maximum length of ids embedded in table and sequence names
pub const MAX_KEY_LEN: usize = 63;

/// Quote a SQL identifier to make it safe for use in queries
///
/// # Example
/// ```
/// use datastore_engine::sql::quote_identifier;
///
/// let quoted = quote_identifier("item_orders");
/// assert_eq!(quoted, "\"item_orders\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a string literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a tenant or table name
///
/// Rules:
/// - Must start with a letter (a-z)
/// - Can only contain lowercase letters, numbers, and underscores
/// - Cannot be a PostgreSQL reserved word
/// - Cannot appear in `reserved`
pub fn validate_identifier(name: &str, reserved: &[&str]) -> Result<(), String> {
    if name.is_empty() {
        return Err("Identifier cannot be empty".to_string());
    }

    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !starts_with_letter || !rest_ok || name.len() > MAX_KEY_LEN {
        return Err(format!(
            "Identifier '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, numbers, and underscores.",
            name
        ));
    }

    if POSTGRES_RESERVED_WORDS.contains(&name.to_uppercase().as_str()) {
        return Err(format!(
            "Identifier '{}' is a PostgreSQL reserved keyword and cannot be used.",
            name
        ));
    }

    if reserved.contains(&name) {
        return Err(format!("Name '{}' is reserved and cannot be used.", name));
    }

    Ok(())
}

/// Validate a field, datastore or relation id
///
/// Ids are ASCII letters, digits and underscores. They are embedded in JSON
/// path literals and table names, so nothing else is accepted.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Id cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(format!("Id '{}' is longer than {} characters", key, MAX_KEY_LEN));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "Id '{}' is invalid. Only letters, numbers, and underscores are allowed.",
            key
        ));
    }
    Ok(())
}

/// Schema-qualified, quoted table reference
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Table name holding the records of a datastore
pub fn item_table(datastore_id: &str) -> String {
    format!("item_{}", datastore_id)
}

/// JSONB expression for `items.<field>.value` on a table alias
pub fn value_path(alias: &str, field_id: &str) -> String {
    format!("({}.items -> {} -> 'value')", alias, quote_literal(field_id))
}

/// Text expression for `items.<field>.value` on a table alias
pub fn text_path(alias: &str, field_id: &str) -> String {
    format!("({}.items -> {} ->> 'value')", alias, quote_literal(field_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Quoting Tests
    // =========================================================================

    #[test]
    fn test_quote_identifier_simple() {
        assert_eq!(quote_identifier("my_table"), "\"my_table\"");
        assert_eq!(quote_identifier("a"), "\"a\"");
    }

    #[test]
    fn test_quote_identifier_with_quotes() {
        assert_eq!(
            quote_identifier("table\"with\"quotes"),
            "\"table\"\"with\"\"quotes\""
        );
    }

    #[test]
    fn test_quote_identifier_reserved_keyword() {
        assert_eq!(quote_identifier("select"), "\"select\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("code"), "'code'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(quote_literal(""), "''");
    }

    // =========================================================================
    // validate_identifier Tests
    // =========================================================================

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("acme", &[]).is_ok());
        assert!(validate_identifier("tenant_123", &[]).is_ok());
        assert!(validate_identifier("x", &[]).is_ok());
    }

    #[test]
    fn test_validate_identifier_empty() {
        let result = validate_identifier("", &[]);
        assert!(result.unwrap_err().contains("cannot be empty"));
    }

    #[test]
    fn test_validate_identifier_bad_shapes() {
        assert!(validate_identifier("1tenant", &[]).is_err());
        assert!(validate_identifier("_tenant", &[]).is_err());
        assert!(validate_identifier("Tenant", &[]).is_err());
        assert!(validate_identifier("my-tenant", &[]).is_err());
        assert!(validate_identifier("my.tenant", &[]).is_err());
        assert!(validate_identifier("my tenant", &[]).is_err());
        assert!(validate_identifier(&"a".repeat(64), &[]).is_err());
    }

    #[test]
    fn test_validate_identifier_reserved_keyword() {
        let result = validate_identifier("select", &[]);
        assert!(result.unwrap_err().contains("reserved keyword"));
        assert!(validate_identifier("user", &[]).is_err());
        assert!(validate_identifier("order", &[]).is_err());
    }

    #[test]
    fn test_validate_identifier_reserved_list() {
        assert!(validate_identifier("public", &["public"]).is_err());
        assert!(validate_identifier("public", &[]).is_ok());
    }

    // =========================================================================
    // validate_key Tests
    // =========================================================================

    #[test]
    fn test_validate_key() {
        assert!(validate_key("field_01").is_ok());
        assert!(validate_key("5f1a2b3c").is_ok());
        assert!(validate_key("CamelCase").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a'b").is_err());
        assert!(validate_key("a-b").is_err());
        assert!(validate_key("a b").is_err());
        assert!(validate_key(&"k".repeat(64)).is_err());
    }

    // =========================================================================
    // Path Helper Tests
    // =========================================================================

    #[test]
    fn test_qualified_and_item_table() {
        assert_eq!(item_table("orders"), "item_orders");
        assert_eq!(qualified("acme", "item_orders"), "\"acme\".\"item_orders\"");
    }

    #[test]
    fn test_json_paths() {
        assert_eq!(value_path("t", "code"), "(t.items -> 'code' -> 'value')");
        assert_eq!(text_path("p", "name"), "(p.items -> 'name' ->> 'value')");
    }

    #[test]
    fn test_reserved_words_contains_common_keywords() {
        assert!(POSTGRES_RESERVED_WORDS.contains(&"SELECT"));
        assert!(POSTGRES_RESERVED_WORDS.contains(&"WHERE"));
        assert!(POSTGRES_RESERVED_WORDS.len() > 50);
    }
}
