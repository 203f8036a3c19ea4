//! History and field-history auditing
//!
//! A [`Differ`] lives for one mutation transaction. `add` captures the
//! pre-image of a record, `compare` stages the field-level changes against the
//! post-image, and `commit` resolves display labels and bulk-inserts the
//! staged rows through the same transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};

use crate::error::{DatastoreError, Result};
use crate::item::FieldValues;
use crate::schema::{DatastoreSchema, FieldDefinition};
use crate::sql::ddl::DdlGenerator;
use crate::types::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    Insert,
    Update,
    Delete,
}

impl HistoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryType::Insert => "insert",
            HistoryType::Update => "update",
            HistoryType::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(HistoryType::Insert),
            "update" => Ok(HistoryType::Update),
            "delete" => Ok(HistoryType::Delete),
            other => Err(DatastoreError::validation(format!(
                "unknown history type '{}'",
                other
            ))),
        }
    }
}

/// A rendered field change as stored in history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub field_id: String,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
}

/// Operation-level audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub history_id: String,
    pub app_id: String,
    pub datastore_id: String,
    pub item_id: String,
    pub history_type: HistoryType,
    /// Rendered snapshot of the record the operation started from
    pub fixed_items: BTreeMap<String, String>,
    pub changes: Vec<Change>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Per-field audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldHistoryEntry {
    pub history_id: String,
    pub app_id: String,
    pub datastore_id: String,
    pub item_id: String,
    pub field_id: String,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

// ============================================================================
// Label resolution
// ============================================================================

/// User names and option labels used to render `user` and `options` values
#[derive(Debug, Clone, Default)]
pub struct DisplayLabels {
    users: HashMap<String, String>,
    /// (option group, option value) -> label
    options: HashMap<(String, String), String>,
}

impl DisplayLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.users.insert(user_id.into(), name.into());
        self
    }

    pub fn with_option(
        mut self,
        option_id: impl Into<String>,
        value: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        self.options
            .insert((option_id.into(), value.into()), label.into());
        self
    }

    /// Load the labels for the given ids from the tenant reference tables
    pub async fn load(
        conn: &mut PgConnection,
        ddl: &DdlGenerator<'_>,
        app_id: &str,
        user_ids: &BTreeSet<String>,
        option_ids: &BTreeSet<String>,
    ) -> Result<Self> {
        let mut labels = Self::new();
        if !user_ids.is_empty() {
            let sql = format!(
                "SELECT user_id, user_name FROM {} WHERE user_id = ANY($1)",
                ddl.users_table()
            );
            let rows = sqlx::query(&sql)
                .bind(user_ids.iter().cloned().collect::<Vec<_>>())
                .fetch_all(&mut *conn)
                .await?;
            for row in rows {
                labels
                    .users
                    .insert(row.try_get("user_id")?, row.try_get("user_name")?);
            }
        }
        if !option_ids.is_empty() {
            let sql = format!(
                "SELECT option_id, option_value, option_label FROM {} WHERE app_id = $1 AND option_id = ANY($2)",
                ddl.options_table()
            );
            let rows = sqlx::query(&sql)
                .bind(app_id)
                .bind(option_ids.iter().cloned().collect::<Vec<_>>())
                .fetch_all(&mut *conn)
                .await?;
            for row in rows {
                labels.options.insert(
                    (row.try_get("option_id")?, row.try_get("option_value")?),
                    row.try_get("option_label")?,
                );
            }
        }
        Ok(labels)
    }

    /// Human-readable rendering; unknown ids and values render as themselves
    pub fn render(&self, field: Option<&FieldDefinition>, value: &Value) -> String {
        match (value.data_type(), field.and_then(|f| f.option_id.as_deref())) {
            (DataType::User, _) => value
                .as_users()
                .iter()
                .map(|id| self.users.get(id).cloned().unwrap_or_else(|| id.clone()))
                .collect::<Vec<_>>()
                .join(","),
            (DataType::Options, Some(option_id)) => {
                let raw = value.to_wire();
                self.options
                    .get(&(option_id.to_string(), raw.clone()))
                    .cloned()
                    .unwrap_or(raw)
            }
            _ => value.display(),
        }
    }
}

// ============================================================================
// Differ
// ============================================================================

/// A field change before label resolution; `None` renders as empty
#[derive(Debug, Clone, PartialEq)]
pub struct StagedChange {
    pub field_id: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct StagedEntry {
    pub index: usize,
    pub item_id: String,
    pub history_type: HistoryType,
    pub fixed: FieldValues,
    pub changes: Vec<StagedChange>,
}

/// Per-transaction audit state machine
pub struct Differ {
    app_id: String,
    datastore_id: String,
    user_id: String,
    fields: BTreeMap<String, FieldDefinition>,
    before: BTreeMap<usize, (String, FieldValues)>,
    staged: Vec<StagedEntry>,
}

impl Differ {
    pub fn new(schema: &DatastoreSchema, user_id: impl Into<String>) -> Self {
        Self {
            app_id: schema.datastore.app_id.clone(),
            datastore_id: schema.id().to_string(),
            user_id: user_id.into(),
            fields: schema
                .fields
                .iter()
                .map(|f| (f.field_id.clone(), f.clone()))
                .collect(),
            before: BTreeMap::new(),
            staged: Vec::new(),
        }
    }

    /// Capture the pre-image of a record; empty for inserts
    pub fn add(&mut self, index: usize, item_id: impl Into<String>, before: FieldValues) {
        self.before.insert(index, (item_id.into(), before));
    }

    /// Stage the changes between the captured pre-image and `after`
    ///
    /// `after == None` means the record was deleted. Returns the staged
    /// history type, or `None` when nothing changed.
    pub fn compare(&mut self, index: usize, after: Option<&FieldValues>) -> Option<HistoryType> {
        let Some((item_id, before)) = self.before.remove(&index) else {
            warn!(index, "history compare without a captured record");
            return None;
        };

        let (history_type, fixed, changes) = match after {
            None => {
                let changes = before
                    .iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(fid, v)| StagedChange {
                        field_id: fid.clone(),
                        old: Some(v.clone()),
                        new: None,
                    })
                    .collect();
                (HistoryType::Delete, before, changes)
            }
            Some(after) if before.is_empty() => {
                let changes = after
                    .iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(fid, v)| StagedChange {
                        field_id: fid.clone(),
                        old: None,
                        new: Some(v.clone()),
                    })
                    .collect();
                (HistoryType::Insert, after.clone(), changes)
            }
            Some(after) => {
                let changes: Vec<StagedChange> = after
                    .iter()
                    .filter_map(|(fid, new)| {
                        let old = before
                            .get(fid)
                            .cloned()
                            .unwrap_or_else(|| Value::empty(new.data_type()));
                        (!old.same_as(new)).then(|| StagedChange {
                            field_id: fid.clone(),
                            old: (!old.is_empty()).then_some(old),
                            new: Some(new.clone()),
                        })
                    })
                    .collect();
                if changes.is_empty() {
                    return None;
                }
                (HistoryType::Update, before, changes)
            }
        };

        self.staged.push(StagedEntry {
            index,
            item_id,
            history_type,
            fixed,
            changes,
        });
        Some(history_type)
    }

    /// Stage a change to a system column such as `owners` or `status`
    ///
    /// Recorded as an update whose single change is keyed by the column
    /// name; `fixed` is the record's stored items. `None` when unchanged.
    pub fn stage_column(
        &mut self,
        index: usize,
        item_id: impl Into<String>,
        fixed: FieldValues,
        column: &str,
        old: &str,
        new: &str,
    ) -> Option<HistoryType> {
        if old == new {
            return None;
        }
        let text = |s: &str| (!s.is_empty()).then(|| Value::text(DataType::Text, s));
        self.staged.push(StagedEntry {
            index,
            item_id: item_id.into(),
            history_type: HistoryType::Update,
            fixed,
            changes: vec![StagedChange {
                field_id: column.to_string(),
                old: text(old),
                new: text(new),
            }],
        });
        Some(HistoryType::Update)
    }

    pub fn staged(&self) -> &[StagedEntry] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn field_name(&self, field_id: &str) -> String {
        self.fields
            .get(field_id)
            .map(|f| f.field_name.clone())
            .unwrap_or_else(|| field_id.to_string())
    }

    fn render(&self, labels: &DisplayLabels, field_id: &str, value: Option<&Value>) -> String {
        value
            .map(|v| labels.render(self.fields.get(field_id), v))
            .unwrap_or_default()
    }

    /// Ids whose labels are needed to render the staged entries
    fn wanted_labels(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut users = BTreeSet::new();
        let mut options = BTreeSet::new();
        let values = self.staged.iter().flat_map(|e| {
            e.fixed.iter().map(|(k, v)| (k, Some(v))).chain(
                e.changes
                    .iter()
                    .flat_map(|c| [(&c.field_id, c.old.as_ref()), (&c.field_id, c.new.as_ref())]),
            )
        });
        for (field_id, value) in values {
            let Some(value) = value else { continue };
            match value.data_type() {
                DataType::User => users.extend(value.as_users().iter().cloned()),
                DataType::Options => {
                    if let Some(option_id) =
                        self.fields.get(field_id).and_then(|f| f.option_id.clone())
                    {
                        options.insert(option_id);
                    }
                }
                _ => {}
            }
        }
        (users, options)
    }

    /// Render staged entries into history rows
    pub fn render_entries(
        &self,
        labels: &DisplayLabels,
        at: DateTime<Utc>,
        salt: &str,
    ) -> (Vec<HistoryEntry>, Vec<FieldHistoryEntry>) {
        let mut histories = Vec::with_capacity(self.staged.len());
        let mut field_histories = Vec::new();
        for entry in &self.staged {
            let history_id = history_id(at, entry.index, salt);
            let changes: Vec<Change> = entry
                .changes
                .iter()
                .map(|c| Change {
                    field_id: c.field_id.clone(),
                    field_name: self.field_name(&c.field_id),
                    old_value: self.render(labels, &c.field_id, c.old.as_ref()),
                    new_value: self.render(labels, &c.field_id, c.new.as_ref()),
                })
                .collect();
            for change in &changes {
                field_histories.push(FieldHistoryEntry {
                    history_id: history_id.clone(),
                    app_id: self.app_id.clone(),
                    datastore_id: self.datastore_id.clone(),
                    item_id: entry.item_id.clone(),
                    field_id: change.field_id.clone(),
                    field_name: change.field_name.clone(),
                    old_value: change.old_value.clone(),
                    new_value: change.new_value.clone(),
                    created_at: at,
                    created_by: self.user_id.clone(),
                });
            }
            histories.push(HistoryEntry {
                history_id,
                app_id: self.app_id.clone(),
                datastore_id: self.datastore_id.clone(),
                item_id: entry.item_id.clone(),
                history_type: entry.history_type,
                fixed_items: entry
                    .fixed
                    .iter()
                    .map(|(k, v)| (k.clone(), self.render(labels, k, Some(v))))
                    .collect(),
                changes,
                created_at: at,
                created_by: self.user_id.clone(),
            });
        }
        (histories, field_histories)
    }

    /// Persist the staged entries through the enclosing transaction
    ///
    /// Returns the number of history rows written; a no-op when nothing was staged.
    pub async fn commit(&mut self, conn: &mut PgConnection, ddl: &DdlGenerator<'_>) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let (users, options) = self.wanted_labels();
        let labels = DisplayLabels::load(conn, ddl, &self.app_id, &users, &options).await?;
        let salt = uuid::Uuid::new_v4().simple().to_string();
        // One timestamp for the operation and its field rows, taken from the
        // same clock as the time-ordered history ids
        let (histories, field_histories) = self.render_entries(&labels, Utc::now(), &salt[..8]);

        let sql = format!(
            r#"
            INSERT INTO {} (history_id, app_id, datastore_id, item_id, history_type, fixed_items, changes, created_at, created_by)
            SELECT h.history_id, h.app_id, h.datastore_id, h.item_id, h.history_type, h.fixed_items, h.changes, h.created_at, h.created_by
            FROM jsonb_to_recordset($1::jsonb) AS h(
                history_id text, app_id text, datastore_id text, item_id text,
                history_type text, fixed_items jsonb, changes jsonb, created_at timestamptz, created_by text
            )
            "#,
            ddl.table("histories")
        );
        sqlx::query(&sql)
            .bind(serde_json::to_value(&histories)?)
            .execute(&mut *conn)
            .await?;

        if !field_histories.is_empty() {
            let sql = format!(
                r#"
                INSERT INTO {} (history_id, app_id, datastore_id, item_id, field_id, field_name, old_value, new_value, created_at, created_by)
                SELECT f.history_id, f.app_id, f.datastore_id, f.item_id, f.field_id, f.field_name, f.old_value, f.new_value, f.created_at, f.created_by
                FROM jsonb_to_recordset($1::jsonb) AS f(
                    history_id text, app_id text, datastore_id text, item_id text,
                    field_id text, field_name text, old_value text, new_value text, created_at timestamptz, created_by text
                )
                "#,
                ddl.table("field_histories")
            );
            sqlx::query(&sql)
                .bind(serde_json::to_value(&field_histories)?)
                .execute(&mut *conn)
                .await?;
        }

        debug!(
            datastore_id = %self.datastore_id,
            histories = histories.len(),
            field_histories = field_histories.len(),
            "committed history"
        );
        self.staged.clear();
        Ok(histories.len())
    }
}

/// Timestamp-based history id; `salt` separates concurrent transactions
fn history_id(at: DateTime<Utc>, index: usize, salt: &str) -> String {
    format!("{}{:06}{}", at.format("%Y%m%d%H%M%S%6f"), index, salt)
}

// ============================================================================
// Queries
// ============================================================================

/// Operation history of one record, newest first
pub async fn item_history(
    pool: &PgPool,
    ddl: &DdlGenerator<'_>,
    datastore_id: &str,
    item_id: &str,
) -> Result<Vec<HistoryEntry>> {
    let sql = format!(
        r#"
        SELECT history_id, app_id, datastore_id, item_id, history_type, fixed_items, changes, created_at, created_by
        FROM {} WHERE datastore_id = $1 AND item_id = $2
        ORDER BY created_at DESC, history_id DESC
        "#,
        ddl.table("histories")
    );
    let rows = sqlx::query(&sql)
        .bind(datastore_id)
        .bind(item_id)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let history_type: String = row.try_get("history_type")?;
            let fixed_items: serde_json::Value = row.try_get("fixed_items")?;
            let changes: serde_json::Value = row.try_get("changes")?;
            Ok(HistoryEntry {
                history_id: row.try_get("history_id")?,
                app_id: row.try_get("app_id")?,
                datastore_id: row.try_get("datastore_id")?,
                item_id: row.try_get("item_id")?,
                history_type: HistoryType::parse(&history_type)?,
                fixed_items: serde_json::from_value(fixed_items)?,
                changes: serde_json::from_value(changes)?,
                created_at: row.try_get("created_at")?,
                created_by: row.try_get("created_by")?,
            })
        })
        .collect()
}

/// Every recorded change of one field across a datastore, newest first
pub async fn field_history(
    pool: &PgPool,
    ddl: &DdlGenerator<'_>,
    datastore_id: &str,
    field_id: &str,
) -> Result<Vec<FieldHistoryEntry>> {
    let sql = format!(
        r#"
        SELECT history_id, app_id, datastore_id, item_id, field_id, field_name, old_value, new_value, created_at, created_by
        FROM {} WHERE datastore_id = $1 AND field_id = $2
        ORDER BY created_at DESC, history_id DESC
        "#,
        ddl.table("field_histories")
    );
    let rows = sqlx::query(&sql)
        .bind(datastore_id)
        .bind(field_id)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(FieldHistoryEntry {
                history_id: row.try_get("history_id")?,
                app_id: row.try_get("app_id")?,
                datastore_id: row.try_get("datastore_id")?,
                item_id: row.try_get("item_id")?,
                field_id: row.try_get("field_id")?,
                field_name: row.try_get("field_name")?,
                old_value: row.try_get("old_value")?,
                new_value: row.try_get("new_value")?,
                created_at: row.try_get("created_at")?,
                created_by: row.try_get("created_by")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Datastore;
    use chrono::NaiveDate;

    fn schema() -> DatastoreSchema {
        let datastore = Datastore {
            datastore_id: "orders".into(),
            app_id: "app".into(),
            datastore_name: "Orders".into(),
            api_key: "orders".into(),
            sorts: vec![],
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
            vec![
                FieldDefinition::new("orders", "name", "Name", DataType::Text),
                FieldDefinition::new("orders", "qty", "Quantity", DataType::Number),
                FieldDefinition::new("orders", "status", "Status", DataType::Options)
                    .with_option_group("order_status"),
                FieldDefinition::new("orders", "staff", "Staff", DataType::User),
                FieldDefinition::new("orders", "due", "Due", DataType::Date),
            ],
        )
    }

    fn values(pairs: &[(&str, Value)]) -> FieldValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // ===== Compare =====

    #[test]
    fn test_compare_insert_records_non_empty_values() {
        let mut differ = Differ::new(&schema(), "u1");
        differ.add(0, "i1", FieldValues::new());
        let after = values(&[
            ("name", Value::text(DataType::Text, "Widget")),
            ("status", Value::text(DataType::Options, "")),
        ]);
        assert_eq!(differ.compare(0, Some(&after)), Some(HistoryType::Insert));

        let entry = &differ.staged()[0];
        assert_eq!(entry.changes.len(), 1);
        assert_eq!(entry.changes[0].field_id, "name");
        assert_eq!(entry.changes[0].old, None);
    }

    #[test]
    fn test_compare_update_only_changed_fields() {
        let mut differ = Differ::new(&schema(), "u1");
        let before = values(&[
            ("name", Value::text(DataType::Text, "Widget")),
            ("status", Value::text(DataType::Options, "1")),
            ("qty", Value::number(2.0)),
        ]);
        differ.add(0, "i1", before);
        let after = values(&[
            ("name", Value::text(DataType::Text, "Widget")),
            ("status", Value::text(DataType::Options, "2")),
            ("qty", Value::from_wire(DataType::Number, "2.0")),
        ]);
        assert_eq!(differ.compare(0, Some(&after)), Some(HistoryType::Update));

        let changes = &differ.staged()[0].changes;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field_id, "status");
    }

    #[test]
    fn test_compare_no_op_update_stages_nothing() {
        let mut differ = Differ::new(&schema(), "u1");
        let before = values(&[
            ("staff", Value::users(["a", "b"])),
            (
                "due",
                Value::date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()),
            ),
        ]);
        differ.add(0, "i1", before);
        let after = values(&[
            ("staff", Value::users(["b", "a"])),
            ("due", Value::from_wire(DataType::Date, "2024/05/01")),
        ]);
        assert_eq!(differ.compare(0, Some(&after)), None);
        assert!(differ.is_empty());
    }

    #[test]
    fn test_compare_update_of_absent_field() {
        let mut differ = Differ::new(&schema(), "u1");
        differ.add(0, "i1", values(&[("name", Value::text(DataType::Text, "x"))]));
        let after = values(&[
            ("due", Value::empty(DataType::Date)),
            ("qty", Value::number(5.0)),
        ]);
        differ.compare(0, Some(&after));
        let changes = &differ.staged()[0].changes;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field_id, "qty");
    }

    #[test]
    fn test_compare_delete() {
        let mut differ = Differ::new(&schema(), "u1");
        differ.add(
            3,
            "i1",
            values(&[
                ("name", Value::text(DataType::Text, "Widget")),
                ("status", Value::text(DataType::Options, "")),
            ]),
        );
        assert_eq!(differ.compare(3, None), Some(HistoryType::Delete));
        let entry = &differ.staged()[0];
        assert_eq!(entry.index, 3);
        assert_eq!(entry.changes.len(), 1);
        assert_eq!(entry.changes[0].new, None);
    }

    #[test]
    fn test_compare_without_add_is_ignored() {
        let mut differ = Differ::new(&schema(), "u1");
        assert_eq!(differ.compare(0, None), None);
        assert!(differ.is_empty());
    }

    // ===== Rendering =====

    #[test]
    fn test_labels_render_users_and_options() {
        let s = schema();
        let labels = DisplayLabels::new()
            .with_user("u1", "Alice")
            .with_option("order_status", "2", "Shipped");

        let staff = Value::users(["u1", "u9"]);
        assert_eq!(labels.render(s.field("staff"), &staff), "Alice,u9");

        let status = Value::text(DataType::Options, "2");
        assert_eq!(labels.render(s.field("status"), &status), "Shipped");
        let unknown = Value::text(DataType::Options, "7");
        assert_eq!(labels.render(s.field("status"), &unknown), "7");
    }

    #[test]
    fn test_render_entries() {
        let mut differ = Differ::new(&schema(), "editor");
        differ.add(0, "i1", values(&[("status", Value::text(DataType::Options, "1"))]));
        differ.compare(
            0,
            Some(&values(&[("status", Value::text(DataType::Options, "2"))])),
        );
        let labels = DisplayLabels::new()
            .with_option("order_status", "1", "Open")
            .with_option("order_status", "2", "Shipped");
        let at = Utc::now();
        let (histories, fields) = differ.render_entries(&labels, at, "abcd1234");

        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].history_type, HistoryType::Update);
        assert_eq!(histories[0].fixed_items["status"], "Open");
        assert_eq!(histories[0].changes[0].field_name, "Status");
        assert_eq!(histories[0].changes[0].old_value, "Open");
        assert_eq!(histories[0].changes[0].new_value, "Shipped");
        assert!(histories[0].history_id.ends_with("000000abcd1234"));

        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].history_id, histories[0].history_id);
        assert_eq!(fields[0].created_by, "editor");
    }

    #[test]
    fn test_stage_column() {
        let mut differ = Differ::new(&schema(), "admin");
        let fixed = values(&[("status", Value::text(DataType::Options, "1"))]);
        assert_eq!(differ.stage_column(0, "i1", fixed.clone(), "status", "1", "1"), None);
        assert_eq!(
            differ.stage_column(1, "i1", fixed, "owners", "g1,g2", "g3"),
            Some(HistoryType::Update)
        );

        let (histories, fields) = differ.render_entries(&DisplayLabels::new(), Utc::now(), "abcd1234");
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].changes[0].field_name, "owners");
        assert_eq!(histories[0].changes[0].old_value, "g1,g2");
        assert_eq!(histories[0].changes[0].new_value, "g3");
        assert_eq!(fields[0].field_id, "owners");
    }

    #[test]
    fn test_rendered_rows_carry_operation_time() {
        let mut differ = Differ::new(&schema(), "editor");
        differ.add(0, "i1", values(&[("status", Value::text(DataType::Options, "1"))]));
        differ.compare(
            0,
            Some(&values(&[("status", Value::text(DataType::Options, "2"))])),
        );
        let at = Utc::now() - chrono::Duration::minutes(5);
        let (histories, fields) = differ.render_entries(&DisplayLabels::new(), at, "abcd1234");

        // Both recordsets bind `created_at` instead of taking the column default
        let expected = serde_json::to_value(at).unwrap();
        let rows = serde_json::to_value(&histories).unwrap();
        assert_eq!(rows[0]["created_at"], expected);
        let rows = serde_json::to_value(&fields).unwrap();
        assert_eq!(rows[0]["created_at"], expected);
    }

    #[test]
    fn test_wanted_labels() {
        let mut differ = Differ::new(&schema(), "editor");
        differ.add(0, "i1", FieldValues::new());
        differ.compare(
            0,
            Some(&values(&[
                ("staff", Value::users(["u1", "u2"])),
                ("status", Value::text(DataType::Options, "1")),
            ])),
        );
        let (users, options) = differ.wanted_labels();
        assert_eq!(users.len(), 2);
        assert!(options.contains("order_status"));
    }

    #[test]
    fn test_history_type_serde() {
        assert_eq!(
            serde_json::to_string(&HistoryType::Delete).unwrap(),
            "\"delete\""
        );
        assert_eq!(HistoryType::parse("update").unwrap(), HistoryType::Update);
        assert!(HistoryType::parse("merge").is_err());
    }
}
