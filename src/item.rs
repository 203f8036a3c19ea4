//! Item-related types for the datastore engine
//!
//! Includes Item, the search Condition list, ItemsParam, and the bulk mapping
//! request/result types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatastoreError, Result};
use crate::schema::SortItem;
use crate::sql::condition::Filter;
use crate::types::Value;

/// Field id -> typed value
pub type FieldValues = BTreeMap<String, Value>;

/// Dependent datastore id -> regenerated rows
pub type Dependents = BTreeMap<String, Vec<FieldValues>>;

/// Projection marker for fields absent from storage
pub const MISSING: &str = "##missing##";

/// Stored `items` object: `{"<field>": {"data_type": .., "value": ..}}`
pub fn items_json(values: &FieldValues) -> serde_json::Value {
    serde_json::Value::Object(
        values
            .iter()
            .map(|(field_id, value)| (field_id.clone(), value.to_json()))
            .collect(),
    )
}

/// Who performs a mutation, and the owner groups scoping it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    /// Written on inserted rows; restricts updates and deletes when non-empty
    #[serde(default)]
    pub owners: Vec<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            owners: Vec::new(),
        }
    }

    pub fn with_owners<S: Into<String>>(mut self, owners: impl IntoIterator<Item = S>) -> Self {
        self.owners = owners.into_iter().map(Into::into).collect();
        self
    }
}

/// One record of a datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub app_id: String,
    pub datastore_id: String,
    pub items: FieldValues,
    /// Declared fields with no stored entry
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub missing: BTreeSet<String>,
    /// Display text of `user` and `options` fields: user names, option labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Relation id -> stored items of the joined records
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, Vec<FieldValues>>,
    pub owners: Vec<String>,
    pub status: String,
    pub check_type: String,
    pub check_status: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checked_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_time: Option<DateTime<Utc>>,
}

impl Item {
    pub fn get(&self, field_id: &str) -> Option<&Value> {
        self.items.get(field_id)
    }

    /// Resolved label of a field, falling back to its display rendering
    pub fn label(&self, field_id: &str) -> String {
        match self.labels.get(field_id) {
            Some(label) => label.clone(),
            None => self.items.get(field_id).map(Value::display).unwrap_or_default(),
        }
    }

    /// Wire rendering of a field, empty when absent
    pub fn wire(&self, field_id: &str) -> String {
        self.items
            .get(field_id)
            .map(Value::to_wire)
            .unwrap_or_default()
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Boolean mode shared by every condition of a list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionMode {
    #[default]
    And,
    Or,
}

/// A single search predicate as supplied by callers
///
/// `field_type` and `operator` stay strings: an unrecognised type is a caller
/// concern resolved by the compiler, not a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field_id: String,
    pub field_type: String,
    #[serde(default)]
    pub search_value: String,
    #[serde(default)]
    pub operator: String,
    /// Schema field under `items.<id>.value` rather than a system column
    pub is_dynamic: bool,
    /// `"1"` makes `search_value` a `from~to` range
    #[serde(default)]
    pub condition_type: String,
}

impl Condition {
    /// Condition on a schema field
    pub fn dynamic(
        field_id: impl Into<String>,
        field_type: impl Into<String>,
        operator: impl Into<String>,
        search_value: impl Into<String>,
    ) -> Self {
        Self {
            field_id: field_id.into(),
            field_type: field_type.into(),
            search_value: search_value.into(),
            operator: operator.into(),
            is_dynamic: true,
            condition_type: String::new(),
        }
    }

    /// Condition on a system column
    pub fn fixed(
        column: impl Into<String>,
        field_type: impl Into<String>,
        operator: impl Into<String>,
        search_value: impl Into<String>,
    ) -> Self {
        Self {
            is_dynamic: false,
            ..Self::dynamic(column, field_type, operator, search_value)
        }
    }

    /// Half-open `[from, to)` range condition on a schema field
    pub fn range(
        field_id: impl Into<String>,
        field_type: impl Into<String>,
        from: &str,
        to: &str,
    ) -> Self {
        Self {
            condition_type: RANGE_CONDITION.to_string(),
            ..Self::dynamic(field_id, field_type, "", format!("{}~{}", from, to))
        }
    }

    pub fn is_range(&self) -> bool {
        self.condition_type == RANGE_CONDITION
    }
}

/// `condition_type` marking a range condition
pub const RANGE_CONDITION: &str = "1";

/// Read parameters for find, count and download
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemsParam {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub mode: ConditionMode,
    /// Additional predicate tree, combined with the condition list by AND
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Falls back to the datastore default when empty
    #[serde(default)]
    pub sorts: Vec<SortItem>,
    /// 1-based page number; zero means the first page
    #[serde(default)]
    pub page_index: i64,
    /// Zero means no limit
    #[serde(default)]
    pub page_size: i64,
    /// Owner groups a record must share with the caller; empty means unrestricted
    #[serde(default)]
    pub owners: Vec<String>,
    /// Return stored values without joins or computed fields
    #[serde(default)]
    pub is_origin: bool,
}

impl ItemsParam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn mode(mut self, mode: ConditionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, sort: SortItem) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn page(mut self, page_index: i64, page_size: i64) -> Self {
        self.page_index = page_index;
        self.page_size = page_size;
        self
    }

    pub fn owners<S: Into<String>>(mut self, owners: impl IntoIterator<Item = S>) -> Self {
        self.owners = owners.into_iter().map(Into::into).collect();
        self
    }

    pub fn origin(mut self) -> Self {
        self.is_origin = true;
        self
    }

    /// Rows skipped before the page starts, `None` when it overflows
    pub fn offset(&self) -> Option<i64> {
        if self.page_size > 0 && self.page_index > 1 {
            (self.page_index - 1).checked_mul(self.page_size)
        } else {
            Some(0)
        }
    }

    /// Rejects paging that cannot be expressed as LIMIT/OFFSET
    pub fn check_paging(&self) -> Result<()> {
        if self.offset().is_none() {
            return Err(DatastoreError::validation(format!(
                "page {} of size {} is out of range",
                self.page_index, self.page_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Bulk mapping upload
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    Insert,
    Update,
    Upsert,
}

/// What an update does when its query matches several records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    #[default]
    Error,
    UpdateOne,
    UpdateMany,
}

/// One uploaded line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingRow {
    /// Source line number, reported back in errors
    pub line: usize,
    /// Equality match used by update and upsert
    #[serde(default)]
    pub query: FieldValues,
    pub values: FieldValues,
}

impl MappingRow {
    pub fn new(line: usize, values: FieldValues) -> Self {
        Self {
            line,
            query: FieldValues::new(),
            values,
        }
    }

    pub fn with_query(mut self, query: FieldValues) -> Self {
        self.query = query;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkMappingRequest {
    pub mode: MappingMode,
    #[serde(default)]
    pub policy: UpdatePolicy,
    pub rows: Vec<MappingRow>,
}

/// A failed line of a bulk upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub first_line: usize,
    pub last_line: usize,
    pub current_line: usize,
    #[serde(default)]
    pub field_id: String,
    #[serde(default)]
    pub field_name: String,
    pub error_msg: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Success,
    Failed,
}

/// Outcome of one bulk batch transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub first_line: usize,
    pub last_line: usize,
    pub inserted: u64,
    pub modified: u64,
    pub errors: Vec<RowError>,
    pub status: BatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_condition_constructors() {
        let c = Condition::dynamic("name", "text", "like", "Ac");
        assert!(c.is_dynamic);
        assert!(!c.is_range());

        let f = Condition::fixed("status", "options", "=", "1");
        assert!(!f.is_dynamic);

        let r = Condition::range("amount", "number", "10", "20");
        assert!(r.is_range());
        assert_eq!(r.search_value, "10~20");
    }

    #[test]
    fn test_condition_deserialize_defaults() {
        let c: Condition = serde_json::from_str(
            r#"{"field_id": "code", "field_type": "text", "is_dynamic": true}"#,
        )
        .unwrap();
        assert_eq!(c.operator, "");
        assert_eq!(c.search_value, "");
        assert_eq!(c.condition_type, "");
    }

    #[test]
    fn test_items_param_offset() {
        assert_eq!(ItemsParam::new().offset(), Some(0));
        assert_eq!(ItemsParam::new().page(1, 20).offset(), Some(0));
        assert_eq!(ItemsParam::new().page(3, 20).offset(), Some(40));
        assert_eq!(ItemsParam::new().page(3, 0).offset(), Some(0));
    }

    #[test]
    fn test_items_param_offset_overflow() {
        let param = ItemsParam::new().page(i64::MAX, 100);
        assert_eq!(param.offset(), None);
        assert!(matches!(
            param.check_paging(),
            Err(DatastoreError::Validation(msg)) if msg.contains("out of range")
        ));
        assert!(ItemsParam::new().page(i64::MAX, 1).check_paging().is_ok());
    }

    #[test]
    fn test_update_policy_serde() {
        assert_eq!(
            serde_json::to_string(&UpdatePolicy::UpdateMany).unwrap(),
            "\"update-many\""
        );
        let p: UpdatePolicy = serde_json::from_str("\"update-one\"").unwrap();
        assert_eq!(p, UpdatePolicy::UpdateOne);
        assert_eq!(
            serde_json::to_string(&BatchStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
    }

    #[test]
    fn test_items_json_shape() {
        let mut values = FieldValues::new();
        values.insert("qty".into(), Value::number(3.0));
        assert_eq!(
            items_json(&values),
            serde_json::json!({"qty": {"data_type": "number", "value": 3.0}})
        );
    }

    #[test]
    fn test_item_wire_accessor() {
        let mut items = FieldValues::new();
        items.insert("count".into(), Value::from_wire(DataType::Number, "10"));
        let item = Item {
            item_id: "i1".into(),
            app_id: "a".into(),
            datastore_id: "d".into(),
            items,
            missing: BTreeSet::new(),
            labels: BTreeMap::new(),
            relations: BTreeMap::new(),
            owners: vec![],
            status: "1".into(),
            check_type: String::new(),
            check_status: "0".into(),
            created_at: Utc::now(),
            created_by: "u".into(),
            updated_at: Utc::now(),
            updated_by: "u".into(),
            checked_at: None,
            checked_by: String::new(),
            label_time: None,
        };
        assert_eq!(item.wire("count"), "10");
        assert_eq!(item.wire("absent"), "");
    }
}
