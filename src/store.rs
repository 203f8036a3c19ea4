//! DatastoreEngine - Main entry point of the datastore engine
//!
//! This module provides the `DatastoreEngine` struct: schema operations on
//! datastores and fields, reads through the staged query pipeline, audited
//! transactional writes and bulk mapping uploads. Every operation is scoped
//! to a [`Tenant`] and bounded by the deadline of its operation class.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DatastoreError, Result};
use crate::history::{self, FieldHistoryEntry, HistoryEntry};
use crate::index::{EvictionPolicy, IndexManager, IndexSpec, UsageRanked};
use crate::item::{
    Actor, BatchResult, BatchStatus, BulkMappingRequest, ConditionMode, Dependents, FieldValues,
    Item, ItemsParam, RowError,
};
use crate::mutation::{Orchestrator, translate_unique_violation};
use crate::schema::{
    AddDatastoreRequest, Datastore, DatastoreSchema, FieldDefinition, ModifyDatastoreRequest,
    ModifyFieldRequest, RelationItem, Tenant, split_combo,
};
use crate::sequence::{
    SequenceAllocator, display_order_sequence_name, field_sequence_name, surrogate_sequence_name,
};
use crate::sql::condition::{Filter, FixedColumn, Operand, Target, Test, compile_conditions};
use crate::sql::ddl::DdlGenerator;
use crate::sql::formula::validate_formula;
use crate::sql::pipeline::{PipelineAssembler, row_to_item};
use crate::types::{DataType, Value};

/// Run `fut` under `deadline`, mapping expiry to [`DatastoreError::Timeout`]
async fn with_deadline<T, F>(deadline: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?deadline, "operation timed out");
            Err(DatastoreError::timeout(format!(
                "{} exceeded {:?}",
                operation, deadline
            )))
        }
    }
}

/// Dynamic-schema datastore engine over PostgreSQL
///
/// Each tenant is a PostgreSQL schema holding the metadata, sequence and
/// history tables plus one item table per datastore. The engine itself is
/// stateless apart from the pool; cloning it is cheap.
#[derive(Clone)]
pub struct DatastoreEngine {
    /// Database connection pool
    pool: PgPool,
    /// Engine configuration
    config: EngineConfig,
    /// Strategy choosing which query indexes to drop at the ceiling
    policy: Arc<dyn EvictionPolicy>,
}

impl DatastoreEngine {
    /// Create a new engine from configuration
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| DatastoreError::Connection(format!("Database connection failed: {}", e)))?;
        Ok(Self::from_pool(pool, config))
    }

    /// Create an engine sharing an existing pool
    pub fn from_pool(pool: PgPool, config: EngineConfig) -> Self {
        Self {
            pool,
            config,
            policy: Arc::new(UsageRanked),
        }
    }

    /// Replace the index eviction strategy
    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ddl<'a>(&'a self, tenant: &'a Tenant) -> DdlGenerator<'a> {
        DdlGenerator::new(&self.config, tenant)
    }

    /// Create the tenant schema and its engine tables if missing
    pub async fn ensure_tenant(&self, tenant: &Tenant) -> Result<()> {
        let ddl = self.ddl(tenant);
        sqlx::query(&ddl.generate_create_schema())
            .execute(&self.pool)
            .await?;
        for statement in ddl.generate_engine_tables() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!(tenant = %tenant, "tenant ready");
        Ok(())
    }

    // =========================================================================
    // Metadata loading
    // =========================================================================

    async fn load_datastore(
        &self,
        conn: &mut PgConnection,
        tenant: &Tenant,
        datastore_id: &str,
    ) -> Result<Datastore> {
        let sql = format!(
            "SELECT definition FROM {} WHERE datastore_id = $1 AND deleted_at IS NULL",
            self.ddl(tenant).table("datastores")
        );
        let row = sqlx::query(&sql)
            .bind(datastore_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| DatastoreError::datastore_not_found(datastore_id.to_string()))?;
        let definition: serde_json::Value = row.try_get("definition")?;
        Ok(serde_json::from_value(definition)?)
    }

    async fn load_schema(
        &self,
        conn: &mut PgConnection,
        tenant: &Tenant,
        datastore_id: &str,
    ) -> Result<DatastoreSchema> {
        let datastore = self.load_datastore(conn, tenant, datastore_id).await?;
        let sql = format!(
            "SELECT definition FROM {} WHERE datastore_id = $1 AND deleted_at IS NULL",
            self.ddl(tenant).table("fields")
        );
        let rows = sqlx::query(&sql)
            .bind(datastore_id)
            .fetch_all(&mut *conn)
            .await?;
        let fields = rows
            .iter()
            .map(|row| {
                let definition: serde_json::Value = row.try_get("definition")?;
                Ok(serde_json::from_value(definition)?)
            })
            .collect::<Result<Vec<FieldDefinition>>>()?;
        Ok(DatastoreSchema::new(datastore, fields))
    }

    /// Load a datastore schema on a pooled connection
    pub async fn schema(&self, tenant: &Tenant, datastore_id: &str) -> Result<DatastoreSchema> {
        let mut conn = self.pool.acquire().await?;
        self.load_schema(&mut conn, tenant, datastore_id).await
    }

    /// Schemas of the datastores `schema` cascades into
    async fn load_dependents(
        &self,
        conn: &mut PgConnection,
        tenant: &Tenant,
        schema: &DatastoreSchema,
    ) -> Result<BTreeMap<String, DatastoreSchema>> {
        let mut out = BTreeMap::new();
        for rule in &schema.datastore.cascades {
            if !out.contains_key(&rule.datastore_id) {
                let child = self.load_schema(conn, tenant, &rule.datastore_id).await?;
                out.insert(rule.datastore_id.clone(), child);
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Datastore Operations
    // =========================================================================

    /// Add a datastore
    ///
    /// This will:
    /// 1. Store the definition in the tenant's datastore table
    /// 2. Create the item table with its baseline indexes
    /// 3. Create a unique index per declared unique combination
    /// 4. Create the display-order sequence for its fields
    pub async fn add_datastore(
        &self,
        tenant: &Tenant,
        request: AddDatastoreRequest,
        user_id: &str,
    ) -> Result<Datastore> {
        request.validate()?;
        let ddl = self.ddl(tenant);
        let sequences = SequenceAllocator::new(tenant);
        let now = Utc::now();
        let datastore_id = request
            .datastore_id
            .unwrap_or_else(|| format!("d{}", Uuid::new_v4().simple()));
        let datastore = Datastore {
            api_key: request.api_key.unwrap_or_else(|| datastore_id.clone()),
            datastore_id,
            app_id: request.app_id,
            datastore_name: request.datastore_name,
            sorts: request.sorts,
            scan_fields: request.scan_fields,
            scan_fields_connector: request.scan_fields_connector,
            unique_fields: request.unique_fields,
            relations: request.relations,
            cascades: request.cascades,
            surrogate_field: request.surrogate_field,
            soft_delete: request.soft_delete,
            created_at: now,
            created_by: user_id.to_string(),
            updated_at: now,
            updated_by: user_id.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        let insert_sql = format!(
            r#"
            INSERT INTO {} (datastore_id, app_id, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (datastore_id) DO NOTHING
            "#,
            ddl.table("datastores")
        );
        let inserted = sqlx::query(&insert_sql)
            .bind(&datastore.datastore_id)
            .bind(&datastore.app_id)
            .bind(serde_json::to_value(&datastore)?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            return Err(DatastoreError::validation(format!(
                "datastore '{}' already exists",
                datastore.datastore_id
            )));
        }

        sqlx::query(&ddl.generate_create_item_table(&datastore.datastore_id))
            .execute(&mut *tx)
            .await?;
        for statement in ddl.generate_baseline_indexes(&datastore.datastore_id) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        for fields in datastore.unique_combos() {
            sqlx::query(&ddl.generate_unique_index(&datastore.datastore_id, &fields))
                .execute(&mut *tx)
                .await?;
        }
        sequences
            .create(&mut tx, &display_order_sequence_name(&datastore.datastore_id))
            .await?;
        tx.commit().await?;

        info!(tenant = %tenant, datastore_id = %datastore.datastore_id, "added datastore");
        Ok(datastore)
    }

    /// Modify a datastore; unique combinations are diffed against their indexes
    pub async fn modify_datastore(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        request: ModifyDatastoreRequest,
        user_id: &str,
    ) -> Result<Datastore> {
        request.validate()?;
        let ddl = self.ddl(tenant);
        let mut tx = self.pool.begin().await?;
        let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
        let mut datastore = schema.datastore.clone();
        let before: BTreeSet<Vec<String>> = datastore.unique_combos().into_iter().collect();

        if let Some(name) = request.datastore_name {
            datastore.datastore_name = name;
        }
        if let Some(api_key) = request.api_key {
            datastore.api_key = api_key;
        }
        if let Some(sorts) = request.sorts {
            datastore.sorts = sorts;
        }
        if let Some(scan_fields) = request.scan_fields {
            datastore.scan_fields = scan_fields;
        }
        if let Some(connector) = request.scan_fields_connector {
            datastore.scan_fields_connector = connector;
        }
        if let Some(unique_fields) = request.unique_fields {
            datastore.unique_fields = unique_fields;
        }
        if let Some(relations) = request.relations {
            datastore.relations = relations;
        }
        if let Some(cascades) = request.cascades {
            datastore.cascades = cascades;
        }
        if let Some(surrogate) = request.surrogate_field {
            datastore.surrogate_field = surrogate;
        }
        datastore.updated_at = Utc::now();
        datastore.updated_by = user_id.to_string();

        let after: BTreeSet<Vec<String>> = datastore.unique_combos().into_iter().collect();
        // Single unique fields keep their index even when dropped as a combination
        let field_level: BTreeSet<Vec<String>> = schema
            .fields
            .iter()
            .filter(|f| f.unique || f.field_type == DataType::Autonum)
            .map(|f| vec![f.field_id.clone()])
            .collect();
        for removed in before.difference(&after) {
            if !field_level.contains(removed) {
                sqlx::query(&ddl.generate_drop_unique_index(datastore_id, removed))
                    .execute(&mut *tx)
                    .await?;
                info!(datastore_id, fields = %removed.join(","), "dropped unique index");
            }
        }
        let empty = FieldValues::new();
        for added in after.difference(&before) {
            sqlx::query(&ddl.generate_unique_index(datastore_id, added))
                .execute(&mut *tx)
                .await
                .map_err(|e| translate_unique_violation(e, &schema, &empty))?;
            info!(datastore_id, fields = %added.join(","), "created unique index");
        }

        self.store_datastore(&mut tx, tenant, &datastore).await?;
        tx.commit().await?;
        Ok(datastore)
    }

    async fn store_datastore(
        &self,
        conn: &mut PgConnection,
        tenant: &Tenant,
        datastore: &Datastore,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET definition = $2, updated_at = NOW() WHERE datastore_id = $1",
            self.ddl(tenant).table("datastores")
        );
        sqlx::query(&sql)
            .bind(&datastore.datastore_id)
            .bind(serde_json::to_value(datastore)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Soft-delete a datastore; its table and records stay in place
    pub async fn delete_datastore(&self, tenant: &Tenant, datastore_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET deleted_at = NOW() WHERE datastore_id = $1 AND deleted_at IS NULL",
            self.ddl(tenant).table("datastores")
        );
        let result = sqlx::query(&sql)
            .bind(datastore_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::datastore_not_found(datastore_id.to_string()));
        }
        info!(tenant = %tenant, datastore_id, "deleted datastore");
        Ok(())
    }

    /// Drop a datastore's table, field metadata and sequences
    ///
    /// Works on soft-deleted datastores too.
    pub async fn hard_delete_datastore(&self, tenant: &Tenant, datastore_id: &str) -> Result<()> {
        let ddl = self.ddl(tenant);
        let sequences = SequenceAllocator::new(tenant);
        let mut tx = self.pool.begin().await?;

        let select_sql = format!(
            "SELECT definition FROM {} WHERE datastore_id = $1",
            ddl.table("datastores")
        );
        let row = sqlx::query(&select_sql)
            .bind(datastore_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatastoreError::datastore_not_found(datastore_id.to_string()))?;
        let definition: serde_json::Value = row.try_get("definition")?;
        let datastore: Datastore = serde_json::from_value(definition)?;

        sqlx::query(&ddl.generate_drop_item_table(datastore_id))
            .execute(&mut *tx)
            .await?;
        for table in ["fields", "datastores"] {
            let sql = format!("DELETE FROM {} WHERE datastore_id = $1", ddl.table(table));
            sqlx::query(&sql).bind(datastore_id).execute(&mut *tx).await?;
        }
        let removed = sequences
            .delete_prefixed(&mut tx, &format!("datastore_{}_fields_", datastore_id))
            .await?;
        if let Some(surrogate) = &datastore.surrogate_field {
            sequences
                .delete(&mut tx, &surrogate_sequence_name(datastore_id, surrogate))
                .await?;
        }
        tx.commit().await?;

        info!(tenant = %tenant, datastore_id, sequences = removed, "hard deleted datastore");
        Ok(())
    }

    /// Add a unique combination of fields
    pub async fn add_unique_key(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        fields: &[String],
        user_id: &str,
    ) -> Result<Datastore> {
        let current = self.get_datastore(tenant, datastore_id).await?;
        let combo = fields.join(",");
        if current.unique_combos().contains(&split_combo(&combo)) {
            return Ok(current);
        }
        let mut unique_fields = current.unique_fields;
        unique_fields.push(combo);
        let request = ModifyDatastoreRequest {
            unique_fields: Some(unique_fields),
            ..Default::default()
        };
        self.modify_datastore(tenant, datastore_id, request, user_id)
            .await
    }

    /// Remove a unique combination of fields
    pub async fn delete_unique_key(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        fields: &[String],
        user_id: &str,
    ) -> Result<Datastore> {
        let current = self.get_datastore(tenant, datastore_id).await?;
        let unique_fields = current
            .unique_fields
            .into_iter()
            .filter(|combo| split_combo(combo) != fields)
            .collect();
        let request = ModifyDatastoreRequest {
            unique_fields: Some(unique_fields),
            ..Default::default()
        };
        self.modify_datastore(tenant, datastore_id, request, user_id)
            .await
    }

    /// Add or replace a relation by its id
    pub async fn add_relation(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        relation: RelationItem,
        user_id: &str,
    ) -> Result<Datastore> {
        let current = self.get_datastore(tenant, datastore_id).await?;
        let mut relations: Vec<RelationItem> = current
            .relations
            .into_iter()
            .filter(|r| r.relation_id != relation.relation_id)
            .collect();
        relations.push(relation);
        let request = ModifyDatastoreRequest {
            relations: Some(relations),
            ..Default::default()
        };
        self.modify_datastore(tenant, datastore_id, request, user_id)
            .await
    }

    pub async fn delete_relation(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        relation_id: &str,
        user_id: &str,
    ) -> Result<Datastore> {
        let current = self.get_datastore(tenant, datastore_id).await?;
        if current.relation(relation_id).is_none() {
            return Err(DatastoreError::validation(format!(
                "datastore '{}' has no relation '{}'",
                datastore_id, relation_id
            )));
        }
        let relations = current
            .relations
            .into_iter()
            .filter(|r| r.relation_id != relation_id)
            .collect();
        let request = ModifyDatastoreRequest {
            relations: Some(relations),
            ..Default::default()
        };
        self.modify_datastore(tenant, datastore_id, request, user_id)
            .await
    }

    pub async fn get_datastore(&self, tenant: &Tenant, datastore_id: &str) -> Result<Datastore> {
        let mut conn = self.pool.acquire().await?;
        self.load_datastore(&mut conn, tenant, datastore_id).await
    }

    /// Live datastores of an application, oldest first
    pub async fn list_datastores(&self, tenant: &Tenant, app_id: &str) -> Result<Vec<Datastore>> {
        let sql = format!(
            "SELECT definition FROM {} WHERE app_id = $1 AND deleted_at IS NULL ORDER BY created_at, datastore_id",
            self.ddl(tenant).table("datastores")
        );
        let rows = sqlx::query(&sql).bind(app_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let definition: serde_json::Value = row.try_get("definition")?;
                Ok(serde_json::from_value(definition)?)
            })
            .collect()
    }

    // =========================================================================
    // Field Operations
    // =========================================================================

    /// Add a field to a datastore
    ///
    /// This will:
    /// 1. Assign the next display order
    /// 2. Create the autonum sequence and unique index where needed
    /// 3. Backfill existing records with the type's empty value
    pub async fn add_field(
        &self,
        tenant: &Tenant,
        mut field: FieldDefinition,
        user_id: &str,
    ) -> Result<FieldDefinition> {
        field.validate()?;
        let ddl = self.ddl(tenant);
        let sequences = SequenceAllocator::new(tenant);
        let mut tx = self.pool.begin().await?;
        let schema = self.load_schema(&mut tx, tenant, &field.datastore_id).await?;
        if schema.field(&field.field_id).is_some() {
            return Err(DatastoreError::validation(format!(
                "field '{}' already exists in datastore '{}'",
                field.field_id, field.datastore_id
            )));
        }
        if field.field_type == DataType::Function {
            validate_formula(&field.formula, field.return_type, &|id: &str| schema.field_type(id))?;
        }

        let now = Utc::now();
        field.display_order = sequences
            .allocate(&mut tx, &display_order_sequence_name(&field.datastore_id), 1)
            .await?;
        field.created_at = Some(now);
        field.created_by = user_id.to_string();
        field.updated_at = Some(now);
        field.updated_by = user_id.to_string();

        let insert_sql = format!(
            r#"
            INSERT INTO {} (datastore_id, field_id, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (datastore_id, field_id) DO UPDATE SET definition = EXCLUDED.definition, deleted_at = NULL
            "#,
            ddl.table("fields")
        );
        sqlx::query(&insert_sql)
            .bind(&field.datastore_id)
            .bind(&field.field_id)
            .bind(serde_json::to_value(&field)?)
            .execute(&mut *tx)
            .await?;

        let single = vec![field.field_id.clone()];
        match field.field_type {
            DataType::Autonum => {
                sequences
                    .create(&mut tx, &field_sequence_name(&field.datastore_id, &field.field_id))
                    .await?;
                sqlx::query(&ddl.generate_unique_index(&field.datastore_id, &single))
                    .execute(&mut *tx)
                    .await?;
            }
            DataType::Function => {}
            data_type => {
                let backfill = sqlx::query(&ddl.generate_backfill_field(&field.datastore_id, &field.field_id))
                    .bind(Value::empty(data_type).to_json())
                    .execute(&mut *tx)
                    .await?;
                debug!(field_id = %field.field_id, rows = backfill.rows_affected(), "backfilled field");
                if field.unique {
                    sqlx::query(&ddl.generate_unique_index(&field.datastore_id, &single))
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| translate_unique_violation(e, &schema, &FieldValues::new()))?;
                }
            }
        }
        tx.commit().await?;

        info!(
            tenant = %tenant,
            datastore_id = %field.datastore_id,
            field_id = %field.field_id,
            field_type = %field.field_type,
            "added field"
        );
        Ok(field)
    }

    /// Apply a partial update to a field
    pub async fn modify_field(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        field_id: &str,
        request: ModifyFieldRequest,
        user_id: &str,
    ) -> Result<FieldDefinition> {
        let ddl = self.ddl(tenant);
        let mut tx = self.pool.begin().await?;
        let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
        let current = schema.require_field(field_id)?;
        let mut next = request.apply(current);
        next.validate()?;
        if next.field_type == DataType::Function {
            validate_formula(&next.formula, next.return_type, &|id: &str| schema.field_type(id))?;
        }
        next.updated_at = Some(Utc::now());
        next.updated_by = user_id.to_string();

        let single = vec![field_id.to_string()];
        let declared = schema.datastore.unique_combos().contains(&single);
        if next.field_type != DataType::Autonum && !declared && current.unique != next.unique {
            if next.unique {
                sqlx::query(&ddl.generate_unique_index(datastore_id, &single))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| translate_unique_violation(e, &schema, &FieldValues::new()))?;
            } else {
                sqlx::query(&ddl.generate_drop_unique_index(datastore_id, &single))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let sql = format!(
            "UPDATE {} SET definition = $3 WHERE datastore_id = $1 AND field_id = $2",
            ddl.table("fields")
        );
        sqlx::query(&sql)
            .bind(datastore_id)
            .bind(field_id)
            .bind(serde_json::to_value(&next)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(tenant = %tenant, datastore_id, field_id, "modified field");
        Ok(next)
    }

    /// Soft-delete a field, dropping its unique index and autonum sequence
    pub async fn delete_field(&self, tenant: &Tenant, datastore_id: &str, field_id: &str) -> Result<()> {
        let ddl = self.ddl(tenant);
        let sequences = SequenceAllocator::new(tenant);
        let mut tx = self.pool.begin().await?;
        let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
        let field = schema.require_field(field_id)?;
        if field.is_fixed {
            return Err(DatastoreError::validation(format!(
                "field '{}' is fixed and cannot be deleted",
                field_id
            )));
        }

        let sql = format!(
            "UPDATE {} SET deleted_at = NOW() WHERE datastore_id = $1 AND field_id = $2",
            ddl.table("fields")
        );
        sqlx::query(&sql)
            .bind(datastore_id)
            .bind(field_id)
            .execute(&mut *tx)
            .await?;

        let single = vec![field_id.to_string()];
        if field.unique || field.field_type == DataType::Autonum {
            sqlx::query(&ddl.generate_drop_unique_index(datastore_id, &single))
                .execute(&mut *tx)
                .await?;
        }
        if field.field_type == DataType::Autonum {
            sequences
                .delete(&mut tx, &field_sequence_name(datastore_id, field_id))
                .await?;
        }
        tx.commit().await?;

        info!(tenant = %tenant, datastore_id, field_id, "deleted field");
        Ok(())
    }

    /// Live fields of a datastore in display order
    pub async fn list_fields(&self, tenant: &Tenant, datastore_id: &str) -> Result<Vec<FieldDefinition>> {
        Ok(self.schema(tenant, datastore_id).await?.fields)
    }

    // =========================================================================
    // Sequence Operations
    // =========================================================================

    pub async fn create_sequence(&self, tenant: &Tenant, name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant).create(&mut conn, name).await
    }

    pub async fn delete_sequence(&self, tenant: &Tenant, name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant).delete(&mut conn, name).await
    }

    pub async fn reset_sequence(&self, tenant: &Tenant, name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant).reset(&mut conn, name).await
    }

    pub async fn set_sequence_value(&self, tenant: &Tenant, name: &str, value: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant)
            .set_value(&mut conn, name, value)
            .await
    }

    pub async fn current_sequence_value(&self, tenant: &Tenant, name: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant)
            .current_value(&mut conn, name)
            .await
    }

    /// Advance a counter by `step` outside any caller transaction
    pub async fn allocate_sequence(&self, tenant: &Tenant, name: &str, step: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant)
            .allocate(&mut conn, name, step)
            .await
    }

    /// Next `auto_%010d` key of a datastore purpose
    pub async fn surrogate_key(&self, tenant: &Tenant, datastore_id: &str, purpose: &str) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        SequenceAllocator::new(tenant)
            .surrogate_key(&mut conn, datastore_id, purpose)
            .await
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Condition list and predicate tree of a read, joined by AND
    fn compile_filter(&self, param: &ItemsParam) -> Result<Option<Filter>> {
        param.check_paging()?;
        let compiled = compile_conditions(&param.conditions, param.mode, self.config.strict_conditions)?;
        let parts: Vec<Filter> = compiled.into_iter().chain(param.filter.clone()).collect();
        Ok(Filter::combine(parts, ConditionMode::And))
    }

    /// Make sure an index serves the query shape; failures only log
    async fn ensure_index(
        &self,
        ddl: &DdlGenerator<'_>,
        tenant: &Tenant,
        schema: &DatastoreSchema,
        filter: Option<&Filter>,
        param: &ItemsParam,
    ) {
        let spec = IndexSpec::derive(schema, filter, &param.sorts, !param.owners.is_empty());
        let manager = IndexManager::new(&self.config.index_limits, self.policy.as_ref());
        if let Err(e) = manager.ensure(&self.pool, ddl, tenant.as_str(), &spec).await {
            warn!(datastore_id = %schema.id(), error = %e, "index maintenance failed");
        }
    }

    async fn find_with(
        &self,
        tenant: &Tenant,
        schema: &DatastoreSchema,
        filter: Option<Filter>,
        param: &ItemsParam,
    ) -> Result<(Vec<Item>, i64)> {
        let ddl = self.ddl(tenant);
        self.ensure_index(&ddl, tenant, schema, filter.as_ref(), param)
            .await;

        let assembler = PipelineAssembler::new(&ddl, schema);
        let plan = assembler.find(filter.as_ref(), param);
        debug!(datastore_id = %schema.id(), sql = %plan.sql, "find");
        let rows = sqlx::query_with(&plan.sql, plan.params.into_arguments()?)
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>>>()?;

        let count = assembler.count(filter.as_ref(), param);
        let total: i64 = sqlx::query_scalar_with(&count.sql, count.params.into_arguments()?)
            .fetch_one(&self.pool)
            .await?;
        Ok((items, total))
    }

    /// One page of matching records and the total match count
    pub async fn find(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        param: &ItemsParam,
    ) -> Result<(Vec<Item>, i64)> {
        with_deadline(self.config.timeouts.scan, "find", async {
            let schema = self.schema(tenant, datastore_id).await?;
            let filter = self.compile_filter(param)?;
            self.find_with(tenant, &schema, filter, param).await
        })
        .await
    }

    /// A single record within the owner scope
    ///
    /// A record outside the scope is reported as not found.
    pub async fn find_one(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
        owners: &[String],
    ) -> Result<Item> {
        with_deadline(self.config.timeouts.point_read, "find_one", async {
            let schema = self.schema(tenant, datastore_id).await?;
            let ddl = self.ddl(tenant);
            let param = ItemsParam::new().owners(owners.iter().cloned());
            let filter = Filter::column(FixedColumn::ItemId, Test::Eq(Operand::Text(item_id.to_string())));
            let plan = PipelineAssembler::new(&ddl, &schema).find(Some(&filter), &param);
            let row = sqlx::query_with(&plan.sql, plan.params.into_arguments()?)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DatastoreError::not_found(item_id.to_string()))?;
            row_to_item(&row)
        })
        .await
    }

    /// Number of matching records
    pub async fn count(&self, tenant: &Tenant, datastore_id: &str, param: &ItemsParam) -> Result<i64> {
        with_deadline(self.config.timeouts.point_read, "count", async {
            let schema = self.schema(tenant, datastore_id).await?;
            let filter = self.compile_filter(param)?;
            let ddl = self.ddl(tenant);
            let plan = PipelineAssembler::new(&ddl, &schema).count(filter.as_ref(), param);
            let total: i64 = sqlx::query_scalar_with(&plan.sql, plan.params.into_arguments()?)
                .fetch_one(&self.pool)
                .await?;
            Ok(total)
        })
        .await
    }

    /// Records whose joined scan fields equal `text`
    pub async fn scan(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        text: &str,
        param: &ItemsParam,
    ) -> Result<(Vec<Item>, i64)> {
        with_deadline(self.config.timeouts.scan, "scan", async {
            let schema = self.schema(tenant, datastore_id).await?;
            if schema.datastore.scan_fields.is_empty() {
                return Err(DatastoreError::validation(format!(
                    "datastore '{}' has no scan fields",
                    datastore_id
                )));
            }
            let scan = Filter::leaf(
                Target::Concat {
                    fields: schema.datastore.scan_fields.clone(),
                    connector: schema.datastore.scan_fields_connector.clone(),
                },
                Test::Eq(Operand::Text(text.to_string())),
            );
            let parts: Vec<Filter> = self
                .compile_filter(param)?
                .into_iter()
                .chain(std::iter::once(scan))
                .collect();
            let filter = Filter::combine(parts, ConditionMode::And);
            self.find_with(tenant, &schema, filter, param).await
        })
        .await
    }

    /// Every matching record, delivered incrementally
    ///
    /// Pagination in `param` is honored when set. The whole download shares
    /// one scan deadline.
    pub fn stream_download(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        param: ItemsParam,
    ) -> BoxStream<'static, Result<Item>> {
        let engine = self.clone();
        let tenant = tenant.clone();
        let datastore_id = datastore_id.to_string();
        let deadline = tokio::time::Instant::now() + self.config.timeouts.scan;

        Box::pin(try_stream! {
            let schema = engine.schema(&tenant, &datastore_id).await?;
            let filter = engine.compile_filter(&param)?;
            let ddl = engine.ddl(&tenant);
            engine.ensure_index(&ddl, &tenant, &schema, filter.as_ref(), &param).await;

            let plan = PipelineAssembler::new(&ddl, &schema).find(filter.as_ref(), &param);
            debug!(datastore_id = %datastore_id, sql = %plan.sql, "download");
            let arguments = plan.params.into_arguments()?;
            let mut rows = sqlx::query_with(&plan.sql, arguments).fetch(&engine.pool);
            let mut delivered = 0u64;
            loop {
                let next = tokio::time::timeout_at(deadline, rows.next())
                    .await
                    .map_err(|_| DatastoreError::timeout(format!("download of '{}'", datastore_id)))?;
                match next {
                    Some(row) => {
                        delivered += 1;
                        yield row_to_item(&row?)?;
                    }
                    None => break,
                }
            }
            debug!(datastore_id = %datastore_id, delivered, "download finished");
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Insert a record and return its item id
    pub async fn insert(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        values: FieldValues,
        actor: &Actor,
    ) -> Result<String> {
        self.insert_with_dependents(tenant, datastore_id, values, &Dependents::new(), actor)
            .await
    }

    /// Insert a record together with regenerated rows of cascade targets
    pub async fn insert_with_dependents(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        values: FieldValues,
        dependents: &Dependents,
        actor: &Actor,
    ) -> Result<String> {
        with_deadline(self.config.timeouts.write, "insert", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let cascade = self.load_dependents(&mut tx, tenant, &schema).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &cascade);

            let item_id = orchestrator
                .insert(&mut tx, &schema, values, dependents)
                .await
                .inspect_err(|e| error!(datastore_id, error = %e, "insert aborted"))?;
            tx.commit().await?;
            debug!(datastore_id, item_id = %item_id, "inserted");
            Ok(item_id)
        })
        .await
    }

    /// Update fields of a record within the actor's owner scope
    pub async fn update(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
        changes: FieldValues,
        actor: &Actor,
    ) -> Result<()> {
        self.update_with_dependents(tenant, datastore_id, item_id, changes, &Dependents::new(), actor)
            .await
    }

    /// Update a record and replace the rows linked to it in cascade targets
    pub async fn update_with_dependents(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
        changes: FieldValues,
        dependents: &Dependents,
        actor: &Actor,
    ) -> Result<()> {
        with_deadline(self.config.timeouts.write, "update", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let cascade = self.load_dependents(&mut tx, tenant, &schema).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &cascade);

            orchestrator
                .update(&mut tx, &schema, item_id, changes, dependents)
                .await
                .inspect_err(|e| error!(datastore_id, item_id, error = %e, "update aborted"))?;
            tx.commit().await?;
            debug!(datastore_id, item_id, "updated");
            Ok(())
        })
        .await
    }

    /// Delete a record and the rows of its cascade targets
    pub async fn delete(&self, tenant: &Tenant, datastore_id: &str, item_id: &str, actor: &Actor) -> Result<()> {
        with_deadline(self.config.timeouts.write, "delete", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let cascade = self.load_dependents(&mut tx, tenant, &schema).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &cascade);

            orchestrator
                .delete(&mut tx, &schema, item_id)
                .await
                .inspect_err(|e| error!(datastore_id, item_id, error = %e, "delete aborted"))?;
            tx.commit().await?;
            debug!(datastore_id, item_id, "deleted");
            Ok(())
        })
        .await
    }

    /// Delete many records, one transaction per chunk
    ///
    /// Returns the number of records removed. Ids that do not exist or lie
    /// outside the owner scope are skipped. Chunks committed before a failure
    /// stay committed.
    pub async fn delete_items(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_ids: &[String],
        actor: &Actor,
    ) -> Result<u64> {
        let ddl = self.ddl(tenant);
        let sequences = SequenceAllocator::new(tenant);
        let schema = self.schema(tenant, datastore_id).await?;
        let mut removed = 0;

        for chunk in item_ids.chunks(self.config.chunk_size.max(1)) {
            removed += with_deadline(self.config.timeouts.bulk_write, "delete_items", async {
                let mut tx = self.pool.begin().await?;
                let cascade = self.load_dependents(&mut tx, tenant, &schema).await?;
                let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &cascade);
                let n = orchestrator.delete_many(&mut tx, &schema, chunk).await?;
                tx.commit().await?;
                Ok(n)
            })
            .await
            .inspect_err(|e| error!(datastore_id, error = %e, "bulk delete aborted"))?;
        }
        info!(datastore_id, requested = item_ids.len(), removed, "bulk delete finished");
        Ok(removed)
    }

    // =========================================================================
    // Ownership, status and clearing
    // =========================================================================

    /// Hand every record held by `old_owner` over to `new_owner`
    ///
    /// Other owners of a record are kept. Returns the number of records changed.
    pub async fn change_owners(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        old_owner: &str,
        new_owner: &str,
        actor: &Actor,
    ) -> Result<u64> {
        with_deadline(self.config.timeouts.bulk_write, "change_owners", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let no_cascade = BTreeMap::new();
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &no_cascade);

            let changed = orchestrator
                .change_owners(&mut tx, &schema, old_owner, new_owner)
                .await
                .inspect_err(|e| error!(datastore_id, error = %e, "owner change aborted"))?;
            tx.commit().await?;
            info!(datastore_id, old_owner, new_owner, changed, "owners changed");
            Ok(changed)
        })
        .await
    }

    /// Make `owner` the sole owner of the records matching `param`
    ///
    /// Only records within the actor's scope change; a non-empty `old_owners`
    /// narrows the change to records held by one of them.
    pub async fn change_select_owners(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        param: &ItemsParam,
        old_owners: &[String],
        owner: &str,
        actor: &Actor,
    ) -> Result<u64> {
        with_deadline(self.config.timeouts.bulk_write, "change_select_owners", async {
            let filter = self.compile_filter(param)?;
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let no_cascade = BTreeMap::new();
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &no_cascade);

            let changed = orchestrator
                .change_select_owners(&mut tx, &schema, filter.as_ref(), old_owners, owner)
                .await
                .inspect_err(|e| error!(datastore_id, error = %e, "owner change aborted"))?;
            tx.commit().await?;
            info!(datastore_id, owner, changed, "selected owners changed");
            Ok(changed)
        })
        .await
    }

    /// Make `owner` the sole owner of one record
    pub async fn change_item_owner(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
        owner: &str,
        actor: &Actor,
    ) -> Result<()> {
        with_deadline(self.config.timeouts.write, "change_item_owner", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let no_cascade = BTreeMap::new();
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &no_cascade);

            orchestrator
                .change_item_owner(&mut tx, &schema, item_id, owner)
                .await
                .inspect_err(|e| error!(datastore_id, item_id, error = %e, "owner change aborted"))?;
            tx.commit().await?;
            debug!(datastore_id, item_id, owner, "owner changed");
            Ok(())
        })
        .await
    }

    /// Set the workflow status of one record
    pub async fn change_status(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
        status: &str,
        actor: &Actor,
    ) -> Result<()> {
        with_deadline(self.config.timeouts.write, "change_status", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let no_cascade = BTreeMap::new();
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &no_cascade);

            orchestrator
                .change_status(&mut tx, &schema, item_id, status)
                .await
                .inspect_err(|e| error!(datastore_id, item_id, error = %e, "status change aborted"))?;
            tx.commit().await?;
            debug!(datastore_id, item_id, status, "status changed");
            Ok(())
        })
        .await
    }

    /// Remove every record of a datastore and restart its numbering
    ///
    /// Applies to all records regardless of the actor's owner scope. Live
    /// records are written to history and cascade to their children.
    pub async fn clear_datastore(&self, tenant: &Tenant, datastore_id: &str, actor: &Actor) -> Result<u64> {
        with_deadline(self.config.timeouts.bulk_write, "clear_datastore", async {
            let ddl = self.ddl(tenant);
            let sequences = SequenceAllocator::new(tenant);
            let mut tx = self.pool.begin().await?;
            let schema = self.load_schema(&mut tx, tenant, datastore_id).await?;
            let cascade = self.load_dependents(&mut tx, tenant, &schema).await?;
            let orchestrator = Orchestrator::new(&ddl, &sequences, actor, &cascade);

            let removed = orchestrator
                .clear(&mut tx, &schema)
                .await
                .inspect_err(|e| error!(datastore_id, error = %e, "clear aborted"))?;
            tx.commit().await?;
            info!(datastore_id, removed, "datastore cleared");
            Ok(removed)
        })
        .await
    }

    /// Import rows in batches, yielding one result per batch
    ///
    /// Row-level validation failures mark their batch failed and the upload
    /// continues with the next batch. Conflicts, overflows and store errors
    /// end the stream with the error.
    pub fn bulk_mapping_upload(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        request: BulkMappingRequest,
        actor: &Actor,
    ) -> BoxStream<'static, Result<BatchResult>> {
        let engine = self.clone();
        let tenant = tenant.clone();
        let datastore_id = datastore_id.to_string();
        let actor = actor.clone();

        Box::pin(try_stream! {
            let schema = engine.schema(&tenant, &datastore_id).await?;
            let ddl = engine.ddl(&tenant);
            let sequences = SequenceAllocator::new(&tenant);
            let batch_size = engine.config.bulk_batch_size.max(1);

            for batch in request.rows.chunks(batch_size) {
                let first_line = batch.first().map(|r| r.line).unwrap_or_default();
                let last_line = batch.last().map(|r| r.line).unwrap_or_default();

                let outcome = with_deadline(engine.config.timeouts.bulk_write, "bulk_mapping_upload", async {
                    let mut tx = engine.pool.begin().await?;
                    let cascade = engine.load_dependents(&mut tx, &tenant, &schema).await?;
                    let orchestrator = Orchestrator::new(&ddl, &sequences, &actor, &cascade);
                    let counts = orchestrator
                        .apply_batch(&mut tx, &schema, request.mode, request.policy, batch)
                        .await?;
                    tx.commit().await?;
                    Ok(counts)
                })
                .await;

                match outcome {
                    Ok((inserted, modified)) => {
                        debug!(datastore_id = %datastore_id, first_line, last_line, inserted, modified, "batch committed");
                        yield BatchResult {
                            first_line,
                            last_line,
                            inserted,
                            modified,
                            errors: Vec::new(),
                            status: BatchStatus::Success,
                        };
                    }
                    Err(e) => match (e.is_fatal_for_bulk(), batch_error(&e, first_line)) {
                        (false, Some(failures)) => {
                            warn!(datastore_id = %datastore_id, first_line, error = %e, "batch rejected");
                            let errors = failures
                                .into_iter()
                                .map(|(line, field_id, message)| RowError {
                                    first_line,
                                    last_line,
                                    current_line: line,
                                    field_name: field_id
                                        .as_deref()
                                        .and_then(|f| schema.field(f))
                                        .map(|f| f.field_name.clone())
                                        .unwrap_or_default(),
                                    field_id: field_id.unwrap_or_default(),
                                    error_msg: message,
                                })
                                .collect();
                            yield BatchResult {
                                first_line,
                                last_line,
                                inserted: 0,
                                modified: 0,
                                errors,
                                status: BatchStatus::Failed,
                            };
                        }
                        _ => {
                            error!(datastore_id = %datastore_id, first_line, error = %e, "bulk upload aborted");
                            Err::<(), _>(e)?;
                        }
                    },
                }
            }
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Operation history of one record, newest first
    pub async fn item_history(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        item_id: &str,
    ) -> Result<Vec<HistoryEntry>> {
        with_deadline(self.config.timeouts.point_read, "item_history", async {
            history::item_history(&self.pool, &self.ddl(tenant), datastore_id, item_id).await
        })
        .await
    }

    /// Every recorded change of one field, newest first
    pub async fn field_history(
        &self,
        tenant: &Tenant,
        datastore_id: &str,
        field_id: &str,
    ) -> Result<Vec<FieldHistoryEntry>> {
        with_deadline(self.config.timeouts.scan, "field_history", async {
            history::field_history(&self.pool, &self.ddl(tenant), datastore_id, field_id).await
        })
        .await
    }
}

type LineFailure = (usize, Option<String>, String);

/// Line, field and message of each failure in an error that fails only its batch
fn batch_error(err: &DatastoreError, first_line: usize) -> Option<Vec<LineFailure>> {
    match err {
        DatastoreError::RowValidation {
            line,
            field_id,
            message,
        } => Some(vec![(*line, field_id.clone(), message.clone())]),
        DatastoreError::RowFieldErrors { line, errors } => Some(
            errors
                .iter()
                .map(|(field_id, message)| (*line, Some(field_id.clone()), message.clone()))
                .collect(),
        ),
        DatastoreError::Validation(message)
        | DatastoreError::NotFound(message)
        | DatastoreError::FieldNotFound(message)
        | DatastoreError::InvalidCondition(message) => Some(vec![(first_line, None, message.clone())]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_row_validation() {
        let err = DatastoreError::row_validation(14, Some("code"), "required field is empty");
        assert_eq!(
            batch_error(&err, 10),
            Some(vec![(14, Some("code".to_string()), "required field is empty".to_string())])
        );
    }

    #[test]
    fn test_batch_error_lists_every_field() {
        let err = DatastoreError::RowFieldErrors {
            line: 12,
            errors: vec![
                ("name".to_string(), "required field is missing".to_string()),
                ("count".to_string(), "required field is empty".to_string()),
            ],
        };
        let failures = batch_error(&err, 10).unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], (12, Some("name".to_string()), "required field is missing".to_string()));
        assert_eq!(failures[1].1.as_deref(), Some("count"));
    }

    #[test]
    fn test_batch_error_plain_validation_uses_first_line() {
        let err = DatastoreError::validation("no cascade");
        assert_eq!(batch_error(&err, 10), Some(vec![(10, None, "no cascade".to_string())]));
    }

    #[test]
    fn test_batch_error_fatal_errors() {
        let conflict = DatastoreError::Conflict {
            fields: vec!["code".into()],
            values: vec!["A-1".into()],
        };
        assert!(conflict.is_fatal_for_bulk());
        assert!(batch_error(&DatastoreError::timeout("slow"), 1).is_none());
        assert!(batch_error(&DatastoreError::Sql(sqlx::Error::RowNotFound), 1).is_none());
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let result: Result<()> = with_deadline(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DatastoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result() {
        let result = with_deadline(Duration::from_secs(5), "ready", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
