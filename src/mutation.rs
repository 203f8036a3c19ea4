//! Transactional mutations
//!
//! The [`Orchestrator`] runs every write step inside a caller-supplied
//! transaction: sequence allocation, history capture, pre-write derivations,
//! the record write, cascades to dependent datastores and the history commit.
//! Any error leaves the transaction to be rolled back by its owner.

use std::collections::{BTreeMap, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use sqlx::postgres::PgDatabaseError;
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DatastoreError, Result};
use crate::history::Differ;
use crate::item::{Actor, Dependents, FieldValues, MappingMode, MappingRow, UpdatePolicy, items_json};
use crate::schema::{CascadeRule, DatastoreSchema, SelfCalculate};
use crate::sequence::{Numbering, SequenceAllocator, field_sequence_name, surrogate_sequence_name};
use crate::sql::condition::{Filter, FixedColumn, Operand, Test};
use crate::sql::ddl::{DdlGenerator, unique_index_name};
use crate::sql::params::SqlParams;
use crate::sql::pipeline::decode_items;
use crate::types::{DataType, Payload, Value, decimal_add, round_number};

static DUPLICATE_DETAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"=\((.*)\) already exists").ok());

/// Turn a unique violation into a conflict naming fields and values
///
/// `attempted` supplies the offending values; the server's error detail is
/// the fallback. Other errors pass through unchanged.
pub fn translate_unique_violation(
    err: sqlx::Error,
    schema: &DatastoreSchema,
    attempted: &FieldValues,
) -> DatastoreError {
    if !DatastoreError::is_unique_violation(&err) {
        return DatastoreError::Sql(err);
    }
    let db = err.as_database_error();
    let constraint = db
        .and_then(|db| db.constraint())
        .unwrap_or_default()
        .to_string();
    let detail = db
        .and_then(|db| db.try_downcast_ref::<PgDatabaseError>())
        .and_then(|e| e.detail())
        .unwrap_or_default()
        .to_string();

    let fields = schema
        .unique_constraints()
        .into_iter()
        .find(|fields| unique_index_name(schema.id(), fields) == constraint)
        .unwrap_or_else(|| vec![constraint.clone()]);

    let mut values: Vec<String> = fields
        .iter()
        .filter_map(|f| attempted.get(f).map(Value::to_wire))
        .collect();
    if values.len() != fields.len() {
        values = parse_duplicate_detail(&detail);
    }
    DatastoreError::Conflict { fields, values }
}

/// Values from `Key (...)=(v1, v2) already exists.`
fn parse_duplicate_detail(detail: &str) -> Vec<String> {
    DUPLICATE_DETAIL
        .as_ref()
        .and_then(|re| re.captures(detail))
        .and_then(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .split(", ")
                .map(|v| v.trim_matches('"').to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// A field-level validation failure, attributed to a line in bulk mode
struct FieldError {
    field_id: String,
    message: String,
}

impl FieldError {
    fn new(field_id: &str, message: impl Into<String>) -> Self {
        Self {
            field_id: field_id.to_string(),
            message: message.into(),
        }
    }

    fn into_error(self, line: Option<usize>) -> DatastoreError {
        match line {
            Some(line) => DatastoreError::row_validation(line, Some(&self.field_id), self.message),
            None => DatastoreError::validation(format!("field '{}': {}", self.field_id, self.message)),
        }
    }

    /// Report every failure found on one record
    fn combine(mut errors: Vec<FieldError>, line: Option<usize>) -> DatastoreError {
        if errors.len() == 1 {
            if let Some(only) = errors.pop() {
                return only.into_error(line);
            }
        }
        let pairs: Vec<(String, String)> = errors.into_iter().map(|e| (e.field_id, e.message)).collect();
        match line {
            Some(line) => DatastoreError::RowFieldErrors { line, errors: pairs },
            None => DatastoreError::validation(
                pairs
                    .iter()
                    .map(|(field_id, message)| format!("field '{}': {}", field_id, message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }
}

/// Attach a line number to plain validation errors
fn at_line(err: DatastoreError, line: usize) -> DatastoreError {
    match err {
        DatastoreError::Validation(message) | DatastoreError::NotFound(message) => {
            DatastoreError::row_validation(line, None, message)
        }
        other => other,
    }
}

/// A locked live record with its system columns
struct Located {
    item_id: String,
    items: FieldValues,
    owners: Vec<String>,
    status: String,
}

/// `owners` with `old` replaced by `new`, without duplicates
fn replace_owner(owners: &[String], old: &str, new: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(owners.len());
    for owner in owners {
        let owner = if owner == old { new } else { owner.as_str() };
        if !out.iter().any(|o| o == owner) {
            out.push(owner.to_string());
        }
    }
    out
}

/// Autonum values allocated ahead for a bulk insert, per field id
#[derive(Debug, Default)]
pub struct Preallocated(BTreeMap<String, VecDeque<String>>);

impl Preallocated {
    fn take(&mut self, field_id: &str) -> Option<String> {
        self.0.get_mut(field_id).and_then(VecDeque::pop_front)
    }
}

/// Runs mutations inside an open transaction
pub struct Orchestrator<'a> {
    ddl: &'a DdlGenerator<'a>,
    sequences: &'a SequenceAllocator,
    actor: &'a Actor,
    /// Loaded schemas of cascade targets
    dependents: &'a BTreeMap<String, DatastoreSchema>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ddl: &'a DdlGenerator<'a>,
        sequences: &'a SequenceAllocator,
        actor: &'a Actor,
        dependents: &'a BTreeMap<String, DatastoreSchema>,
    ) -> Self {
        Self {
            ddl,
            sequences,
            actor,
            dependents,
        }
    }

    // =========================================================================
    // Pre-write derivations
    // =========================================================================

    /// Type-check a payload against the schema
    ///
    /// Autonum values are discarded since the server assigns them. Numbers
    /// are rounded to the field precision.
    fn prepare(&self, schema: &DatastoreSchema, values: FieldValues) -> std::result::Result<FieldValues, FieldError> {
        let mut out = FieldValues::new();
        for (field_id, value) in values {
            let Some(field) = schema.field(&field_id) else {
                return Err(FieldError::new(&field_id, "unknown field"));
            };
            match field.field_type {
                DataType::Autonum => continue,
                DataType::Function => {
                    return Err(FieldError::new(&field_id, "computed fields are read-only"));
                }
                _ => {}
            }
            let value = if value.data_type() == field.field_type {
                value
            } else {
                let from = value.data_type();
                value.with_data_type(field.field_type).map_err(|_| {
                    FieldError::new(
                        &field_id,
                        format!("a {} value cannot be stored in a {} field", from, field.field_type),
                    )
                })?
            };
            let value = match (field.precision, value.payload()) {
                (Some(precision), Payload::Number(n)) => Value::number(round_number(*n, precision)),
                _ => value,
            };
            out.insert(field_id, value);
        }
        Ok(out)
    }

    /// Required fields must be non-empty; on insert they must also be present
    fn check_required(
        schema: &DatastoreSchema,
        values: &FieldValues,
        insert: bool,
    ) -> std::result::Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        for field in schema.fields.iter().filter(|f| f.is_required) {
            if matches!(field.field_type, DataType::Autonum | DataType::Function) {
                continue;
            }
            match values.get(&field.field_id) {
                Some(v) if v.is_empty() => {
                    errors.push(FieldError::new(&field.field_id, "required field is empty"));
                }
                None if insert => {
                    errors.push(FieldError::new(&field.field_id, "required field is missing"));
                }
                _ => {}
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Combine self-calculating number fields with their stored value
    fn apply_self_calculation(schema: &DatastoreSchema, before: &FieldValues, changes: &mut FieldValues) {
        for (field_id, value) in changes.iter_mut() {
            let Some(field) = schema.field(field_id) else { continue };
            let Some(mode) = field.self_calculate else { continue };
            let old = before.get(field_id).map(Value::as_f64).unwrap_or(0.0);
            let delta = match mode {
                SelfCalculate::Add => value.as_f64(),
                SelfCalculate::Sub => -value.as_f64(),
            };
            let sum = decimal_add(old, delta);
            *value = Value::number(match field.precision {
                Some(p) => round_number(sum, p),
                None => sum,
            });
        }
    }

    // =========================================================================
    // Record primitives
    // =========================================================================

    /// Stored items of a live record within the caller's owner scope, locked
    async fn load_for_update(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        item_id: &str,
    ) -> Result<FieldValues> {
        let mut sql = format!(
            "SELECT items FROM {} WHERE item_id = $1 AND deleted_by IS NULL",
            self.ddl.items(schema.id())
        );
        if !self.actor.owners.is_empty() {
            sql.push_str(" AND owners && $2");
        }
        sql.push_str(" FOR UPDATE");

        let mut query = sqlx::query(&sql).bind(item_id);
        if !self.actor.owners.is_empty() {
            query = query.bind(&self.actor.owners);
        }
        let row = query
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| DatastoreError::not_found(item_id.to_string()))?;
        let items: serde_json::Value = row.try_get("items")?;
        Ok(decode_items(&items).0)
    }

    /// Live records matching every filter, oldest first, locked
    ///
    /// Each non-empty entry of `scopes` keeps only records sharing at least
    /// one owner with it.
    async fn locate(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        query: &[Filter],
        scopes: &[&[String]],
    ) -> Result<Vec<Located>> {
        let mut params = SqlParams::new();
        let mut where_clause = "t.deleted_by IS NULL".to_string();
        for owners in scopes.iter().filter(|o| !o.is_empty()) {
            where_clause.push_str(&format!(" AND t.owners && {}", params.text_list(owners.to_vec())));
        }
        for filter in query {
            where_clause.push_str(&format!(" AND ({})", filter.render("t", &mut params)));
        }
        let sql = format!(
            "SELECT t.item_id, t.items, t.owners, t.status FROM {} t WHERE {} \
             ORDER BY t.created_at, t.item_id FOR UPDATE",
            self.ddl.items(schema.id()),
            where_clause
        );
        let rows = sqlx::query_with(&sql, params.into_arguments()?)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| {
                let items: serde_json::Value = row.try_get("items")?;
                Ok(Located {
                    item_id: row.try_get("item_id")?,
                    items: decode_items(&items).0,
                    owners: row.try_get("owners")?,
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }

    /// Live records matching `query` within the actor's owner scope
    async fn find_matching(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        query: &[Filter],
    ) -> Result<Vec<(String, FieldValues)>> {
        let found = self
            .locate(conn, schema, query, &[self.actor.owners.as_slice()])
            .await?;
        Ok(found.into_iter().map(|r| (r.item_id, r.items)).collect())
    }

    /// Insert one record: allocate, derive, write, stage history
    ///
    /// Returns the new item id and the values written.
    async fn insert_record(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        differ: &mut Differ,
        index: usize,
        values: FieldValues,
        line: Option<usize>,
        prealloc: &mut Preallocated,
    ) -> Result<(String, FieldValues)> {
        let mut values = self.prepare(schema, values).map_err(|e| e.into_error(line))?;
        Self::check_required(schema, &values, true).map_err(|e| FieldError::combine(e, line))?;

        for field in schema.autonum_fields() {
            let number = match prealloc.take(&field.field_id) {
                Some(number) => number,
                None => {
                    self.sequences
                        .auto_number(conn, &Numbering::for_field(field))
                        .await?
                }
            };
            values.insert(field.field_id.clone(), Value::text(DataType::Autonum, number));
        }

        if let Some(surrogate) = &schema.datastore.surrogate_field {
            if values.get(surrogate).is_none_or(Value::is_empty) {
                let key = self
                    .sequences
                    .surrogate_key(conn, schema.id(), surrogate)
                    .await?;
                let data_type = schema.field_type(surrogate).unwrap_or(DataType::Text);
                values.insert(surrogate.clone(), Value::text(data_type, key));
            }
        }

        for field in &schema.fields {
            if matches!(field.field_type, DataType::Autonum | DataType::Function) {
                continue;
            }
            values
                .entry(field.field_id.clone())
                .or_insert_with(|| Value::empty(field.field_type));
        }

        let item_id = Uuid::new_v4().to_string();
        differ.add(index, item_id.clone(), FieldValues::new());

        let sql = format!(
            r#"
            INSERT INTO {} (item_id, app_id, datastore_id, items, owners, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
            self.ddl.items(schema.id())
        );
        sqlx::query(&sql)
            .bind(&item_id)
            .bind(&schema.datastore.app_id)
            .bind(schema.id())
            .bind(items_json(&values))
            .bind(&self.actor.owners)
            .bind(&self.actor.user_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| translate_unique_violation(e, schema, &values))?;

        differ.compare(index, Some(&values));
        Ok((item_id, values))
    }

    /// Apply changes to a loaded record; returns the merged values
    async fn update_record(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        differ: &mut Differ,
        index: usize,
        item_id: &str,
        before: FieldValues,
        changes: FieldValues,
        line: Option<usize>,
    ) -> Result<FieldValues> {
        let mut changes = self.prepare(schema, changes).map_err(|e| e.into_error(line))?;
        Self::check_required(schema, &changes, false).map_err(|e| FieldError::combine(e, line))?;
        Self::apply_self_calculation(schema, &before, &mut changes);

        let mut merged = before.clone();
        merged.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        differ.add(index, item_id, before);

        let sql = format!(
            "UPDATE {} SET items = items || $1, updated_at = NOW(), updated_by = $2 \
             WHERE item_id = $3 AND deleted_by IS NULL",
            self.ddl.items(schema.id())
        );
        sqlx::query(&sql)
            .bind(items_json(&changes))
            .bind(&self.actor.user_id)
            .bind(item_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| translate_unique_violation(e, schema, &merged))?;

        differ.compare(index, Some(&changes));
        Ok(merged)
    }

    /// Remove records, softly when the datastore keeps deleted rows
    async fn remove_rows(&self, conn: &mut PgConnection, schema: &DatastoreSchema, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let table = self.ddl.items(schema.id());
        let result = if schema.datastore.soft_delete {
            let sql = format!(
                "UPDATE {} SET deleted_at = NOW(), deleted_by = $2 WHERE item_id = ANY($1) AND deleted_by IS NULL",
                table
            );
            sqlx::query(&sql)
                .bind(ids)
                .bind(&self.actor.user_id)
                .execute(&mut *conn)
                .await?
        } else {
            let sql = format!("DELETE FROM {} WHERE item_id = ANY($1)", table);
            sqlx::query(&sql).bind(ids).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Cascades
    // =========================================================================

    fn cascade_target(&self, rule: &CascadeRule) -> Result<&'a DatastoreSchema> {
        self.dependents
            .get(&rule.datastore_id)
            .ok_or_else(|| DatastoreError::datastore_not_found(rule.datastore_id.clone()))
    }

    /// Equality filters selecting the children linked to `parent`
    ///
    /// `None` when a link value is empty: such a parent has no children.
    fn link_filters(rule: &CascadeRule, child: &DatastoreSchema, parent: &FieldValues) -> Option<Vec<Filter>> {
        rule.links
            .iter()
            .map(|(parent_field, child_field)| {
                let value = parent.get(parent_field).filter(|v| !v.is_empty())?;
                let value = retag(value, child.field_type(child_field));
                Some(Filter::field(
                    child_field.clone(),
                    Test::Eq(Operand::Json(value.stored_value())),
                ))
            })
            .collect()
    }

    /// Delete the children of `parent` under one cascade rule, with history
    ///
    /// Children belong to their parent whatever their owners, so the lookup
    /// ignores the actor's owner scope.
    async fn delete_children(
        &self,
        conn: &mut PgConnection,
        rule: &CascadeRule,
        parent: &FieldValues,
    ) -> Result<u64> {
        let child = self.cascade_target(rule)?;
        let Some(filters) = Self::link_filters(rule, child, parent) else {
            return Ok(0);
        };
        let found = self.locate(conn, child, &filters, &[]).await?;
        if found.is_empty() {
            return Ok(0);
        }

        let mut differ = Differ::new(child, self.actor.user_id.clone());
        let mut ids = Vec::with_capacity(found.len());
        for (i, record) in found.into_iter().enumerate() {
            differ.add(i, record.item_id.clone(), record.items);
            differ.compare(i, None);
            ids.push(record.item_id);
        }
        let removed = self.remove_rows(conn, child, &ids).await?;
        differ.commit(conn, self.ddl).await?;
        debug!(datastore_id = %rule.datastore_id, removed, "cascade delete");
        Ok(removed)
    }

    /// Replace the children of `parent` with regenerated rows
    async fn replace_children(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        parent: &FieldValues,
        regenerated: &Dependents,
    ) -> Result<()> {
        for (datastore_id, rows) in regenerated {
            let rule = schema
                .datastore
                .cascades
                .iter()
                .find(|c| &c.datastore_id == datastore_id)
                .ok_or_else(|| {
                    DatastoreError::validation(format!(
                        "datastore '{}' declares no cascade to '{}'",
                        schema.id(),
                        datastore_id
                    ))
                })?;
            let child = self.cascade_target(rule)?;
            self.delete_children(conn, rule, parent).await?;

            let mut differ = Differ::new(child, self.actor.user_id.clone());
            let mut none = Preallocated::default();
            for (i, row) in rows.iter().enumerate() {
                let mut values = row.clone();
                for (parent_field, child_field) in &rule.links {
                    if let Some(v) = parent.get(parent_field) {
                        values.insert(child_field.clone(), retag(v, child.field_type(child_field)));
                    }
                }
                self.insert_record(conn, child, &mut differ, i, values, None, &mut none)
                    .await?;
            }
            differ.commit(conn, self.ddl).await?;
            debug!(datastore_id = %datastore_id, rows = rows.len(), "cascade regenerate");
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Insert a record and its regenerated dependents
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        values: FieldValues,
        dependents: &Dependents,
    ) -> Result<String> {
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        let (item_id, written) = self
            .insert_record(conn, schema, &mut differ, 0, values, None, &mut Preallocated::default())
            .await?;
        self.replace_children(conn, schema, &written, dependents).await?;
        differ.commit(conn, self.ddl).await?;
        Ok(item_id)
    }

    /// Update a record within the actor's owner scope
    pub async fn update(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        item_id: &str,
        changes: FieldValues,
        dependents: &Dependents,
    ) -> Result<()> {
        let before = self.load_for_update(conn, schema, item_id).await?;
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        let merged = self
            .update_record(conn, schema, &mut differ, 0, item_id, before, changes, None)
            .await?;
        self.replace_children(conn, schema, &merged, dependents).await?;
        differ.commit(conn, self.ddl).await?;
        Ok(())
    }

    /// Delete a record and its cascaded children
    pub async fn delete(&self, conn: &mut PgConnection, schema: &DatastoreSchema, item_id: &str) -> Result<()> {
        let before = self.load_for_update(conn, schema, item_id).await?;
        self.delete_loaded(conn, schema, vec![(item_id.to_string(), before)])
            .await?;
        Ok(())
    }

    /// Delete the given records that exist in scope; missing ids are skipped
    pub async fn delete_many(&self, conn: &mut PgConnection, schema: &DatastoreSchema, ids: &[String]) -> Result<u64> {
        let filter = Filter::column(FixedColumn::ItemId, Test::In(ids.to_vec()));
        let found = self.find_matching(conn, schema, &[filter]).await?;
        self.delete_loaded(conn, schema, found).await
    }

    async fn delete_loaded(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        records: Vec<(String, FieldValues)>,
    ) -> Result<u64> {
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        let mut ids = Vec::with_capacity(records.len());
        for (i, (item_id, before)) in records.iter().enumerate() {
            differ.add(i, item_id.clone(), before.clone());
            differ.compare(i, None);
            ids.push(item_id.clone());
        }
        let removed = self.remove_rows(conn, schema, &ids).await?;
        for (_, before) in &records {
            for rule in &schema.datastore.cascades {
                self.delete_children(conn, rule, before).await?;
            }
        }
        differ.commit(conn, self.ddl).await?;
        Ok(removed)
    }

    /// Write new owner lists for located records, with history
    async fn reassign(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        found: Vec<Located>,
        assign: impl Fn(&[String]) -> Vec<String>,
    ) -> Result<u64> {
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        let mut updates = Vec::new();
        for (i, record) in found.into_iter().enumerate() {
            let owners = assign(&record.owners);
            if owners == record.owners {
                continue;
            }
            differ.stage_column(
                i,
                record.item_id.clone(),
                record.items,
                "owners",
                &record.owners.join(","),
                &owners.join(","),
            );
            updates.push(serde_json::json!({ "item_id": record.item_id, "owners": owners }));
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            r#"
            UPDATE {} AS t
            SET owners = ARRAY(SELECT jsonb_array_elements_text(u.owners)), updated_at = NOW(), updated_by = $2
            FROM jsonb_to_recordset($1::jsonb) AS u(item_id text, owners jsonb)
            WHERE t.item_id = u.item_id
            "#,
            self.ddl.items(schema.id())
        );
        let result = sqlx::query(&sql)
            .bind(serde_json::Value::Array(updates))
            .bind(&self.actor.user_id)
            .execute(&mut *conn)
            .await?;
        differ.commit(conn, self.ddl).await?;
        Ok(result.rows_affected())
    }

    /// Replace `old_owner` with `new_owner` on every live record holding it
    ///
    /// Ownership transfer between groups is not limited by the actor's scope.
    pub async fn change_owners(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        old_owner: &str,
        new_owner: &str,
    ) -> Result<u64> {
        let holding = [old_owner.to_string()];
        let found = self.locate(conn, schema, &[], &[holding.as_slice()]).await?;
        self.reassign(conn, schema, found, |owners| replace_owner(owners, old_owner, new_owner))
            .await
    }

    /// Make `owner` the sole owner of the records matching `filter`
    ///
    /// A non-empty `old_owners` further limits the change to records held by
    /// one of them.
    pub async fn change_select_owners(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        filter: Option<&Filter>,
        old_owners: &[String],
        owner: &str,
    ) -> Result<u64> {
        let query: Vec<Filter> = filter.cloned().into_iter().collect();
        let found = self
            .locate(conn, schema, &query, &[self.actor.owners.as_slice(), old_owners])
            .await?;
        self.reassign(conn, schema, found, |_| vec![owner.to_string()])
            .await
    }

    /// Live record `item_id` within the actor's scope, locked
    async fn locate_one(&self, conn: &mut PgConnection, schema: &DatastoreSchema, item_id: &str) -> Result<Located> {
        let filter = Filter::column(FixedColumn::ItemId, Test::Eq(Operand::Text(item_id.to_string())));
        self.locate(conn, schema, &[filter], &[self.actor.owners.as_slice()])
            .await?
            .pop()
            .ok_or_else(|| DatastoreError::not_found(item_id.to_string()))
    }

    /// Make `owner` the sole owner of one record
    pub async fn change_item_owner(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        item_id: &str,
        owner: &str,
    ) -> Result<()> {
        let record = self.locate_one(conn, schema, item_id).await?;
        self.reassign(conn, schema, vec![record], |_| vec![owner.to_string()])
            .await?;
        Ok(())
    }

    /// Set the workflow status of one record
    pub async fn change_status(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        item_id: &str,
        status: &str,
    ) -> Result<()> {
        let record = self.locate_one(conn, schema, item_id).await?;
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        differ.stage_column(0, item_id, record.items, "status", &record.status, status);

        let sql = format!(
            "UPDATE {} SET status = $1, updated_at = NOW(), updated_by = $2 WHERE item_id = $3",
            self.ddl.items(schema.id())
        );
        sqlx::query(&sql)
            .bind(status)
            .bind(&self.actor.user_id)
            .bind(item_id)
            .execute(&mut *conn)
            .await?;
        differ.commit(conn, self.ddl).await?;
        Ok(())
    }

    /// Remove every record of a datastore and restart its numbering
    ///
    /// Live records get delete history and cascade to their children; rows
    /// are removed physically, tombstones included. Returns the number of
    /// live records removed.
    pub async fn clear(&self, conn: &mut PgConnection, schema: &DatastoreSchema) -> Result<u64> {
        let found = self.locate(conn, schema, &[], &[]).await?;
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        for (i, record) in found.iter().enumerate() {
            differ.add(i, record.item_id.clone(), record.items.clone());
            differ.compare(i, None);
        }

        let sql = format!("DELETE FROM {}", self.ddl.items(schema.id()));
        sqlx::query(&sql).execute(&mut *conn).await?;
        for record in &found {
            for rule in &schema.datastore.cascades {
                self.delete_children(conn, rule, &record.items).await?;
            }
        }

        for field in schema.fields.iter().filter(|f| f.field_type == DataType::Autonum) {
            self.sequences
                .reset(conn, &field_sequence_name(schema.id(), &field.field_id))
                .await?;
        }
        if let Some(surrogate) = &schema.datastore.surrogate_field {
            self.sequences
                .reset(conn, &surrogate_sequence_name(schema.id(), surrogate))
                .await?;
        }
        differ.commit(conn, self.ddl).await?;
        Ok(found.len() as u64)
    }

    /// Apply one bulk mapping batch; returns (inserted, modified)
    ///
    /// Row-level failures surface as [`DatastoreError::RowValidation`], or
    /// [`DatastoreError::RowFieldErrors`] when several fields fail on one line.
    pub async fn apply_batch(
        &self,
        conn: &mut PgConnection,
        schema: &DatastoreSchema,
        mode: MappingMode,
        policy: UpdatePolicy,
        rows: &[MappingRow],
    ) -> Result<(u64, u64)> {
        let mut differ = Differ::new(schema, self.actor.user_id.clone());
        let mut prealloc = Preallocated::default();
        if mode == MappingMode::Insert {
            for field in schema.autonum_fields() {
                let numbers = self
                    .sequences
                    .allocate_range(conn, &Numbering::for_field(field), rows.len() as i64)
                    .await?;
                prealloc.0.insert(field.field_id.clone(), numbers.into());
            }
        }

        let (mut inserted, mut modified) = (0u64, 0u64);
        let mut index = 0usize;
        for row in rows {
            if mode == MappingMode::Insert {
                self.insert_record(conn, schema, &mut differ, index, row.values.clone(), Some(row.line), &mut prealloc)
                    .await?;
                index += 1;
                inserted += 1;
                continue;
            }

            let query = self
                .query_filters(schema, &row.query)
                .map_err(|e| e.into_error(Some(row.line)))?;
            let found = self
                .find_matching(conn, schema, &query)
                .await
                .map_err(|e| at_line(e, row.line))?;
            let targets = match (found.len(), mode, policy) {
                (0, MappingMode::Upsert, _) => {
                    self.insert_record(conn, schema, &mut differ, index, row.values.clone(), Some(row.line), &mut prealloc)
                        .await?;
                    index += 1;
                    inserted += 1;
                    continue;
                }
                (0, _, _) => {
                    return Err(DatastoreError::row_validation(row.line, None, "no record matches the query"));
                }
                (1, _, _) | (_, _, UpdatePolicy::UpdateMany) => found,
                (_, _, UpdatePolicy::UpdateOne) => found.into_iter().take(1).collect(),
                (n, _, UpdatePolicy::Error) => {
                    return Err(DatastoreError::row_validation(
                        row.line,
                        None,
                        format!("{} records match the query", n),
                    ));
                }
            };
            for (item_id, before) in targets {
                self.update_record(conn, schema, &mut differ, index, &item_id, before, row.values.clone(), Some(row.line))
                    .await?;
                index += 1;
                modified += 1;
            }
        }

        differ.commit(conn, self.ddl).await?;
        Ok((inserted, modified))
    }

    /// Equality filters for a bulk row's match query
    fn query_filters(&self, schema: &DatastoreSchema, query: &FieldValues) -> std::result::Result<Vec<Filter>, FieldError> {
        if query.is_empty() {
            return Err(FieldError::new("", "an update row needs a match query"));
        }
        query
            .iter()
            .map(|(field_id, value)| {
                let field_type = schema
                    .field_type(field_id)
                    .ok_or_else(|| FieldError::new(field_id, "unknown field"))?;
                Ok(Filter::field(
                    field_id.clone(),
                    Test::Eq(Operand::Json(retag(value, Some(field_type)).stored_value())),
                ))
            })
            .collect()
    }
}

/// A value under another field's type, re-decoded when payloads differ
fn retag(value: &Value, data_type: Option<DataType>) -> Value {
    match data_type {
        Some(dt) if dt != value.data_type() => value
            .clone()
            .with_data_type(dt)
            .unwrap_or_else(|_| Value::from_wire(dt, &value.to_wire())),
        _ => value.clone(),
    }
}
