//! DDL Generation for tenant schemas and datastore tables
//!
//! Generates the PostgreSQL statements backing the engine's persisted layout:
//! the per-tenant engine tables, one item table per datastore, and the
//! expression indexes over `items -> '<field>' -> 'value'`.

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::schema::Tenant;
use crate::sql::sanitize::{item_table, qualified, quote_identifier, quote_literal};

/// Namespace for deterministic index names
const INDEX_NAMESPACE: Uuid = Uuid::from_u128(0x6a1d_52f0_8c4e_4b7a_9e0d_3f21_c5b8_7e14);

/// DDL generator bound to one tenant schema
pub struct DdlGenerator<'a> {
    config: &'a EngineConfig,
    tenant: &'a Tenant,
}

impl<'a> DdlGenerator<'a> {
    pub fn new(config: &'a EngineConfig, tenant: &'a Tenant) -> Self {
        Self { config, tenant }
    }

    /// Schema-qualified reference to a table in the tenant schema
    pub fn table(&self, name: &str) -> String {
        qualified(self.tenant.as_str(), name)
    }

    /// Schema-qualified item table of a datastore
    pub fn items(&self, datastore_id: &str) -> String {
        self.table(&item_table(datastore_id))
    }

    /// Schema-qualified index reference, as needed by DROP INDEX
    pub fn index(&self, index_name: &str) -> String {
        qualified(self.tenant.as_str(), index_name)
    }

    /// Schema-qualified users reference table
    pub fn users_table(&self) -> String {
        self.table(&self.config.users_table)
    }

    /// Schema-qualified option labels reference table
    pub fn options_table(&self) -> String {
        self.table(&self.config.options_table)
    }

    pub fn generate_create_schema(&self) -> String {
        format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(self.tenant.as_str())
        )
    }

    /// Engine tables shared by every datastore of the tenant
    ///
    /// The users and options reference tables are created if missing; their
    /// content belongs to other services.
    pub fn generate_engine_tables(&self) -> Vec<String> {
        vec![
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    datastore_id TEXT PRIMARY KEY,
                    app_id TEXT NOT NULL,
                    definition JSONB NOT NULL,
                    deleted_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"#,
                self.table("datastores")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    datastore_id TEXT NOT NULL,
                    field_id TEXT NOT NULL,
                    definition JSONB NOT NULL,
                    deleted_at TIMESTAMPTZ,
                    PRIMARY KEY (datastore_id, field_id)
                )"#,
                self.table("fields")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY,
                    sequence_value BIGINT NOT NULL DEFAULT 0
                )"#,
                self.table("sequences")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    history_id TEXT PRIMARY KEY,
                    app_id TEXT NOT NULL,
                    datastore_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    history_type TEXT NOT NULL,
                    fixed_items JSONB NOT NULL,
                    changes JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    created_by TEXT NOT NULL DEFAULT ''
                )"#,
                self.table("histories")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    history_id TEXT NOT NULL,
                    app_id TEXT NOT NULL,
                    datastore_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    field_id TEXT NOT NULL,
                    field_name TEXT NOT NULL DEFAULT '',
                    old_value TEXT NOT NULL DEFAULT '',
                    new_value TEXT NOT NULL DEFAULT '',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    created_by TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (history_id, field_id)
                )"#,
                self.table("field_histories")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT PRIMARY KEY,
                    user_name TEXT NOT NULL DEFAULT ''
                )"#,
                self.users_table()
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    app_id TEXT NOT NULL,
                    option_id TEXT NOT NULL,
                    option_value TEXT NOT NULL,
                    option_label TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (app_id, option_id, option_value)
                )"#,
                self.options_table()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS histories_item_idx ON {} (datastore_id, item_id, created_at DESC)",
                self.table("histories")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS field_histories_field_idx ON {} (datastore_id, field_id, created_at DESC)",
                self.table("field_histories")
            ),
        ]
    }

    /// Generate the item table of a datastore
    ///
    /// Field values live in `items`; every other column is a fixed system
    /// column addressable by fixed conditions.
    pub fn generate_create_item_table(&self, datastore_id: &str) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                item_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                datastore_id TEXT NOT NULL,
                items JSONB NOT NULL DEFAULT '{{}}',
                owners TEXT[] NOT NULL DEFAULT '{{}}',
                status TEXT NOT NULL DEFAULT '1',
                check_type TEXT NOT NULL DEFAULT '',
                check_status TEXT NOT NULL DEFAULT '0',
                label_time TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_by TEXT NOT NULL DEFAULT '',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_by TEXT NOT NULL DEFAULT '',
                checked_at TIMESTAMPTZ,
                checked_by TEXT NOT NULL DEFAULT '',
                deleted_at TIMESTAMPTZ,
                deleted_by TEXT
            )"#,
            self.items(datastore_id)
        )
    }

    /// Indexes every item table gets regardless of query shapes
    pub fn generate_baseline_indexes(&self, datastore_id: &str) -> Vec<String> {
        let table = item_table(datastore_id);
        vec![
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (app_id, datastore_id, created_at DESC)",
                quote_identifier(&format!("{}_scope_idx", table)),
                self.items(datastore_id)
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (owners)",
                quote_identifier(&format!("{}_owners_idx", table)),
                self.items(datastore_id)
            ),
        ]
    }

    /// Generate a unique index over a combination of field values
    ///
    /// Deleted rows and rows where any of the fields is empty do not take
    /// part in the constraint.
    pub fn generate_unique_index(&self, datastore_id: &str, fields: &[String]) -> String {
        let keys: Vec<String> = fields
            .iter()
            .map(|f| format!("(items -> {} -> 'value')", quote_literal(f)))
            .collect();
        let present: Vec<String> = fields
            .iter()
            .map(|f| {
                format!(
                    "COALESCE(items -> {} ->> 'value', '') <> ''",
                    quote_literal(f)
                )
            })
            .collect();
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({}) WHERE deleted_by IS NULL AND {}",
            quote_identifier(&unique_index_name(datastore_id, fields)),
            self.items(datastore_id),
            keys.join(", "),
            present.join(" AND ")
        )
    }

    pub fn generate_drop_unique_index(&self, datastore_id: &str, fields: &[String]) -> String {
        self.generate_drop_index(&unique_index_name(datastore_id, fields))
    }

    pub fn generate_drop_index(&self, index_name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.index(index_name))
    }

    pub fn generate_drop_item_table(&self, datastore_id: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.items(datastore_id))
    }

    /// Add `field_id` with the value bound at `$1` to every record lacking it
    pub fn generate_backfill_field(&self, datastore_id: &str, field_id: &str) -> String {
        let key = quote_literal(field_id);
        format!(
            "UPDATE {} SET items = items || jsonb_build_object({}, $1::jsonb) WHERE NOT (items ? {})",
            self.items(datastore_id),
            key,
            key
        )
    }
}

/// Deterministic name of the unique index over `fields` of a datastore
pub fn unique_index_name(datastore_id: &str, fields: &[String]) -> String {
    let spec = format!("unique:{}:{}", datastore_id, fields.join(","));
    format!(
        "uq_{}",
        Uuid::new_v5(&INDEX_NAMESPACE, spec.as_bytes()).simple()
    )
}

/// Deterministic name of a query-shape index from its canonical key spec
pub fn query_index_name(key_spec: &str) -> String {
    format!(
        "ix_{}",
        Uuid::new_v5(&INDEX_NAMESPACE, key_spec.as_bytes()).simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> EngineConfig {
        EngineConfig::builder("postgres://localhost/test").build()
    }

    fn tenant() -> Tenant {
        Tenant::new("acme").unwrap()
    }

    // ==================== Engine Table Tests ====================

    #[test]
    fn test_generate_create_schema() {
        let config = default_config();
        let tenant = tenant();
        let ddl = DdlGenerator::new(&config, &tenant);
        assert_eq!(ddl.generate_create_schema(), "CREATE SCHEMA IF NOT EXISTS \"acme\"");
    }

    #[test]
    fn test_generate_engine_tables() {
        let config = default_config();
        let tenant = tenant();
        let stmts = DdlGenerator::new(&config, &tenant).generate_engine_tables();

        let all = stmts.join("\n");
        assert!(all.contains("\"acme\".\"datastores\""));
        assert!(all.contains("\"acme\".\"fields\""));
        assert!(all.contains("\"acme\".\"sequences\""));
        assert!(all.contains("sequence_value BIGINT NOT NULL DEFAULT 0"));
        assert!(all.contains("\"acme\".\"histories\""));
        assert!(all.contains("\"acme\".\"field_histories\""));
        assert!(all.contains("\"acme\".\"users\""));
        assert!(all.contains("\"acme\".\"options\""));
        assert!(stmts.iter().all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn test_generate_engine_tables_custom_reference_tables() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .users_table("accounts")
            .options_table("choices")
            .build();
        let tenant = tenant();
        let all = DdlGenerator::new(&config, &tenant)
            .generate_engine_tables()
            .join("\n");
        assert!(all.contains("\"acme\".\"accounts\""));
        assert!(all.contains("\"acme\".\"choices\""));
        assert!(!all.contains("\"acme\".\"users\""));
    }

    // ==================== Item Table Tests ====================

    #[test]
    fn test_generate_create_item_table() {
        let config = default_config();
        let tenant = tenant();
        let ddl = DdlGenerator::new(&config, &tenant).generate_create_item_table("orders");

        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"acme\".\"item_orders\""));
        assert!(ddl.contains("item_id TEXT PRIMARY KEY"));
        assert!(ddl.contains("items JSONB NOT NULL DEFAULT '{}'"));
        assert!(ddl.contains("owners TEXT[] NOT NULL DEFAULT '{}'"));
        assert!(ddl.contains("deleted_by TEXT"));
    }

    #[test]
    fn test_generate_baseline_indexes() {
        let config = default_config();
        let tenant = tenant();
        let stmts = DdlGenerator::new(&config, &tenant).generate_baseline_indexes("orders");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("\"item_orders_scope_idx\""));
        assert!(stmts[1].contains("USING GIN (owners)"));
    }

    // ==================== Unique Index Tests ====================

    #[test]
    fn test_generate_unique_index() {
        let config = default_config();
        let tenant = tenant();
        let fields = vec!["code".to_string(), "branch".to_string()];
        let ddl = DdlGenerator::new(&config, &tenant).generate_unique_index("orders", &fields);

        assert!(ddl.starts_with("CREATE UNIQUE INDEX IF NOT EXISTS \"uq_"));
        assert!(ddl.contains("ON \"acme\".\"item_orders\""));
        assert!(ddl.contains("((items -> 'code' -> 'value'), (items -> 'branch' -> 'value'))"));
        assert!(ddl.contains("WHERE deleted_by IS NULL"));
        assert!(ddl.contains("COALESCE(items -> 'code' ->> 'value', '') <> ''"));
    }

    #[test]
    fn test_unique_index_name_is_deterministic() {
        let a = unique_index_name("orders", &["code".to_string()]);
        let b = unique_index_name("orders", &["code".to_string()]);
        let c = unique_index_name("orders", &["name".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= 63);
        assert!(a.starts_with("uq_"));
    }

    #[test]
    fn test_query_index_name() {
        let name = query_index_name("orders|app_id|datastore_id|created_at:desc");
        assert!(name.starts_with("ix_"));
        assert_eq!(name.len(), 35);
    }

    #[test]
    fn test_generate_drop_statements() {
        let config = default_config();
        let tenant = tenant();
        let ddl = DdlGenerator::new(&config, &tenant);
        assert_eq!(
            ddl.generate_drop_index("ix_abc"),
            "DROP INDEX IF EXISTS \"acme\".\"ix_abc\""
        );
        assert_eq!(
            ddl.generate_drop_item_table("orders"),
            "DROP TABLE IF EXISTS \"acme\".\"item_orders\""
        );
    }

    #[test]
    fn test_generate_backfill_field() {
        let config = default_config();
        let tenant = tenant();
        let sql = DdlGenerator::new(&config, &tenant).generate_backfill_field("orders", "memo");
        assert_eq!(
            sql,
            "UPDATE \"acme\".\"item_orders\" SET items = items || jsonb_build_object('memo', $1::jsonb) WHERE NOT (items ? 'memo')"
        );
    }
}
