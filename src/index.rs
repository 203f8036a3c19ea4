//! Index lifecycle management
//!
//! Every read derives the composite index its query shape would use. The
//! manager creates it when the key count allows and, once a table holds too
//! many managed indexes, drops the least used ones first.

use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::config::IndexLimits;
use crate::error::Result;
use crate::schema::{DatastoreSchema, SortItem, SortOrder};
use crate::sql::condition::{FixedColumn, Filter, Target};
use crate::sql::ddl::{DdlGenerator, query_index_name};
use crate::sql::pipeline::{SortKey, effective_sorts};
use crate::sql::sanitize::{item_table, quote_identifier, quote_literal};

/// Prefix shared by every index this manager owns
pub const MANAGED_PREFIX: &str = "ix_";

/// One key of a composite index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Column(FixedColumn),
    Field(String),
}

impl IndexKey {
    fn expression(&self) -> String {
        match self {
            IndexKey::Column(c) => c.name().to_string(),
            IndexKey::Field(f) => format!("(items -> {} -> 'value')", quote_literal(f)),
        }
    }

    fn canonical(&self) -> String {
        match self {
            IndexKey::Column(c) => format!("c:{}", c.name()),
            IndexKey::Field(f) => format!("f:{}", f),
        }
    }
}

/// Ordered key set implied by a query shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub datastore_id: String,
    pub keys: Vec<(IndexKey, SortOrder)>,
}

impl IndexSpec {
    /// Derive the key order: scope, owners, filter targets, sort keys, created time
    pub fn derive(
        schema: &DatastoreSchema,
        filter: Option<&Filter>,
        sorts: &[SortItem],
        owner_scoped: bool,
    ) -> Self {
        let mut spec = Self {
            datastore_id: schema.id().to_string(),
            keys: Vec::new(),
        };
        spec.push(IndexKey::Column(FixedColumn::AppId), SortOrder::Ascend);
        spec.push(IndexKey::Column(FixedColumn::DatastoreId), SortOrder::Ascend);
        if owner_scoped {
            spec.push(IndexKey::Column(FixedColumn::Owners), SortOrder::Ascend);
        }
        if let Some(filter) = filter {
            for target in filter.targets() {
                match target {
                    Target::Field(f) => spec.push(IndexKey::Field(f), SortOrder::Ascend),
                    Target::Column(c) => spec.push(IndexKey::Column(c), SortOrder::Ascend),
                    // targets() expands concatenations into their fields
                    Target::Concat { .. } => {}
                }
            }
        }
        for sort in effective_sorts(sorts, schema) {
            let key = match SortKey::parse(&sort.sort_key) {
                SortKey::Column(c) => IndexKey::Column(c),
                SortKey::Field(f) => IndexKey::Field(f),
            };
            spec.push(key, sort.sort_value);
        }
        spec.push(IndexKey::Column(FixedColumn::CreatedAt), SortOrder::Descend);
        spec
    }

    fn push(&mut self, key: IndexKey, order: SortOrder) {
        if !self.keys.iter().any(|(k, _)| *k == key) {
            self.keys.push((key, order));
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn canonical(&self) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|(k, o)| {
                let dir = match o {
                    SortOrder::Ascend => "asc",
                    SortOrder::Descend => "desc",
                };
                format!("{}:{}", k.canonical(), dir)
            })
            .collect();
        format!("{}|{}", self.datastore_id, keys.join("|"))
    }

    pub fn name(&self) -> String {
        query_index_name(&self.canonical())
    }

    pub fn create_sql(&self, ddl: &DdlGenerator<'_>) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|(k, o)| match o {
                SortOrder::Ascend => k.expression(),
                SortOrder::Descend => format!("{} DESC", k.expression()),
            })
            .collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(&self.name()),
            ddl.items(&self.datastore_id),
            keys.join(", ")
        )
    }
}

/// Scan count of one managed index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUsage {
    pub name: String,
    pub scans: i64,
}

/// Chooses which managed indexes to drop before another one is created
pub trait EvictionPolicy: Send + Sync {
    fn select_victims(&self, usage: &[IndexUsage], ceiling: usize) -> Vec<String>;
}

/// Keep the most scanned indexes, leaving room for one more below the ceiling
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageRanked;

impl EvictionPolicy for UsageRanked {
    fn select_victims(&self, usage: &[IndexUsage], ceiling: usize) -> Vec<String> {
        if usage.len() < ceiling {
            return Vec::new();
        }
        let mut ranked: Vec<&IndexUsage> = usage.iter().collect();
        ranked.sort_by(|a, b| b.scans.cmp(&a.scans).then_with(|| a.name.cmp(&b.name)));
        ranked
            .into_iter()
            .skip(ceiling.saturating_sub(1))
            .map(|u| u.name.clone())
            .collect()
    }
}

/// What [`IndexManager::ensure`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Too many keys for one index
    Skipped,
    Existing,
    Created { name: String, evicted: Vec<String> },
}

pub struct IndexManager<'a> {
    limits: &'a IndexLimits,
    policy: &'a dyn EvictionPolicy,
}

impl<'a> IndexManager<'a> {
    pub fn new(limits: &'a IndexLimits, policy: &'a dyn EvictionPolicy) -> Self {
        Self { limits, policy }
    }

    /// Make sure the index for `spec` exists, evicting others if needed
    pub async fn ensure(
        &self,
        pool: &PgPool,
        ddl: &DdlGenerator<'_>,
        schema_name: &str,
        spec: &IndexSpec,
    ) -> Result<IndexOutcome> {
        if spec.len() > self.limits.max_keys {
            debug!(
                datastore_id = %spec.datastore_id,
                keys = spec.len(),
                max_keys = self.limits.max_keys,
                "query shape too wide for an index"
            );
            return Ok(IndexOutcome::Skipped);
        }

        let name = spec.name();
        let exists = sqlx::query("SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND indexname = $2")
            .bind(schema_name)
            .bind(&name)
            .fetch_optional(pool)
            .await?
            .is_some();
        if exists {
            return Ok(IndexOutcome::Existing);
        }

        let usage = self.usage(pool, schema_name, &spec.datastore_id).await?;
        let evicted = self.policy.select_victims(&usage, self.limits.ceiling);
        for victim in &evicted {
            sqlx::query(&ddl.generate_drop_index(victim))
                .execute(pool)
                .await?;
            info!(index = %victim, datastore_id = %spec.datastore_id, "evicted index");
        }

        sqlx::query(&spec.create_sql(ddl)).execute(pool).await?;
        info!(index = %name, datastore_id = %spec.datastore_id, keys = spec.len(), "created index");

        Ok(IndexOutcome::Created { name, evicted })
    }

    /// Scan counts of the managed indexes on a datastore's table
    pub async fn usage(
        &self,
        pool: &PgPool,
        schema_name: &str,
        datastore_id: &str,
    ) -> Result<Vec<IndexUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT indexrelname::text AS name, idx_scan AS scans
            FROM pg_stat_user_indexes
            WHERE schemaname = $1 AND relname = $2 AND starts_with(indexrelname::text, $3)
            "#,
        )
        .bind(schema_name)
        .bind(item_table(datastore_id))
        .bind(MANAGED_PREFIX)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(IndexUsage {
                    name: row.try_get("name")?,
                    scans: row.try_get::<Option<i64>, _>("scans")?.unwrap_or(0),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::item::{Condition, ConditionMode};
    use crate::schema::{Datastore, FieldDefinition, Tenant};
    use crate::sql::condition::compile_conditions;
    use crate::types::DataType;
    use chrono::Utc;

    fn schema(sorts: Vec<SortItem>) -> DatastoreSchema {
        let datastore = Datastore {
            datastore_id: "orders".into(),
            app_id: "app".into(),
            datastore_name: "Orders".into(),
            api_key: "orders".into(),
            sorts,
            scan_fields: vec![],
            scan_fields_connector: String::new(),
            unique_fields: vec![],
            relations: vec![],
            cascades: vec![],
            surrogate_field: None,
            soft_delete: false,
            created_at: Utc::now(),
            created_by: "u".into(),
            updated_at: Utc::now(),
            updated_by: "u".into(),
        };
        DatastoreSchema::new(
            datastore,
            vec![FieldDefinition::new("orders", "code", "Code", DataType::Text)],
        )
    }

    fn usage(n: usize) -> Vec<IndexUsage> {
        (0..n)
            .map(|i| IndexUsage {
                name: format!("ix_{:03}", i),
                scans: i as i64,
            })
            .collect()
    }

    // ===== Key derivation =====

    #[test]
    fn test_derive_key_order() {
        let filter = compile_conditions(
            &[
                Condition::dynamic("code", "text", "=", "A"),
                Condition::fixed("status", "options", "=", "1"),
                Condition::dynamic("code", "text", "<>", "B"),
            ],
            ConditionMode::And,
            false,
        )
        .unwrap();
        let spec = IndexSpec::derive(
            &schema(vec![]),
            filter.as_ref(),
            &[SortItem::descend("amount"), SortItem::ascend("code")],
            true,
        );
        let keys: Vec<String> = spec.keys.iter().map(|(k, _)| k.canonical()).collect();
        assert_eq!(
            keys,
            vec![
                "c:app_id",
                "c:datastore_id",
                "c:owners",
                "f:code",
                "c:status",
                "f:amount",
                "c:created_at",
            ]
        );
        assert_eq!(spec.keys[5].1, SortOrder::Descend);
        assert_eq!(spec.keys[6].1, SortOrder::Descend);
    }

    #[test]
    fn test_derive_uses_default_sorts() {
        let spec = IndexSpec::derive(&schema(vec![SortItem::ascend("code")]), None, &[], false);
        assert_eq!(spec.len(), 4);
        assert_eq!(spec.keys[2].0, IndexKey::Field("code".into()));
    }

    #[test]
    fn test_name_is_stable_per_shape() {
        let a = IndexSpec::derive(&schema(vec![]), None, &[SortItem::ascend("code")], false);
        let b = IndexSpec::derive(&schema(vec![]), None, &[SortItem::ascend("code")], false);
        let c = IndexSpec::derive(&schema(vec![]), None, &[SortItem::descend("code")], false);
        assert_eq!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
        assert!(a.name().starts_with(MANAGED_PREFIX));
    }

    #[test]
    fn test_create_sql() {
        let config = EngineConfig::builder("postgres://localhost/test").build();
        let tenant = Tenant::new("acme").unwrap();
        let ddl = DdlGenerator::new(&config, &tenant);
        let spec = IndexSpec::derive(&schema(vec![]), None, &[SortItem::descend("code")], false);
        let sql = spec.create_sql(&ddl);
        assert!(sql.starts_with("CREATE INDEX IF NOT EXISTS \"ix_"));
        assert!(sql.ends_with(
            "ON \"acme\".\"item_orders\" (app_id, datastore_id, (items -> 'code' -> 'value') DESC, created_at DESC)"
        ));
    }

    // ===== Eviction =====

    #[test]
    fn test_usage_ranked_below_ceiling_keeps_all() {
        assert!(UsageRanked.select_victims(&usage(51), 52).is_empty());
    }

    #[test]
    fn test_usage_ranked_evicts_least_used() {
        let victims = UsageRanked.select_victims(&usage(53), 52);
        assert_eq!(victims, vec!["ix_001".to_string(), "ix_000".to_string()]);
    }

    #[test]
    fn test_usage_ranked_at_ceiling_makes_room() {
        let victims = UsageRanked.select_victims(&usage(52), 52);
        assert_eq!(victims, vec!["ix_000".to_string()]);
    }

    #[test]
    fn test_custom_policy_is_pluggable() {
        struct DropAll;
        impl EvictionPolicy for DropAll {
            fn select_victims(&self, usage: &[IndexUsage], _ceiling: usize) -> Vec<String> {
                usage.iter().map(|u| u.name.clone()).collect()
            }
        }
        let limits = IndexLimits::default();
        let manager = IndexManager::new(&limits, &DropAll);
        assert_eq!(manager.policy.select_victims(&usage(2), 52).len(), 2);
    }
}
