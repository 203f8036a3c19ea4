//! Schema-related types for the datastore engine
//!
//! Includes Tenant, Datastore, FieldDefinition and their add/modify requests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatastoreError, Result};
use crate::sql::sanitize::{validate_identifier, validate_key};
use crate::types::DataType;

/// A tenant, realized as its own PostgreSQL schema
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tenant(String);

impl Tenant {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name, &[]).map_err(DatastoreError::validation)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Datastore
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascend,
    Descend,
}

/// One entry of a sort list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortItem {
    pub sort_key: String,
    pub sort_value: SortOrder,
}

impl SortItem {
    pub fn ascend(key: impl Into<String>) -> Self {
        Self {
            sort_key: key.into(),
            sort_value: SortOrder::Ascend,
        }
    }

    pub fn descend(key: impl Into<String>) -> Self {
        Self {
            sort_key: key.into(),
            sort_value: SortOrder::Descend,
        }
    }
}

/// Declarative left join to another datastore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationItem {
    pub relation_id: String,
    /// The joined datastore
    pub datastore_id: String,
    /// Joined field id -> local field id; all pairs must match
    pub fields: BTreeMap<String, String>,
}

/// Dependent rows kept in step with a parent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeRule {
    /// The dependent datastore
    pub datastore_id: String,
    /// Parent field id -> child field id
    pub links: BTreeMap<String, String>,
}

/// A logical table with a mutable field schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastore {
    pub datastore_id: String,
    pub app_id: String,
    pub datastore_name: String,
    pub api_key: String,
    /// Default sort order when a find supplies none
    #[serde(default)]
    pub sorts: Vec<SortItem>,
    #[serde(default)]
    pub scan_fields: Vec<String>,
    #[serde(default)]
    pub scan_fields_connector: String,
    /// Each entry is a comma-joined combination of field ids
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationItem>,
    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
    /// Field filled from a surrogate-key sequence when left empty on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surrogate_field: Option<String>,
    /// Mark rows deleted instead of removing them
    #[serde(default)]
    pub soft_delete: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl Datastore {
    /// Unique combinations split into field id lists
    pub fn unique_combos(&self) -> Vec<Vec<String>> {
        self.unique_fields
            .iter()
            .map(|combo| split_combo(combo))
            .filter(|fields| !fields.is_empty())
            .collect()
    }

    pub fn relation(&self, relation_id: &str) -> Option<&RelationItem> {
        self.relations.iter().find(|r| r.relation_id == relation_id)
    }
}

/// Split a comma-joined unique combination
pub fn split_combo(combo: &str) -> Vec<String> {
    combo
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Request to add a datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDatastoreRequest {
    /// Generated when absent
    pub datastore_id: Option<String>,
    pub app_id: String,
    pub datastore_name: String,
    /// Defaults to the datastore id
    pub api_key: Option<String>,
    #[serde(default)]
    pub sorts: Vec<SortItem>,
    #[serde(default)]
    pub scan_fields: Vec<String>,
    #[serde(default)]
    pub scan_fields_connector: String,
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationItem>,
    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
    pub surrogate_field: Option<String>,
    #[serde(default)]
    pub soft_delete: bool,
}

impl AddDatastoreRequest {
    pub fn new(app_id: impl Into<String>, datastore_name: impl Into<String>) -> Self {
        Self {
            datastore_id: None,
            app_id: app_id.into(),
            datastore_name: datastore_name.into(),
            api_key: None,
            sorts: Vec::new(),
            scan_fields: Vec::new(),
            scan_fields_connector: String::new(),
            unique_fields: Vec::new(),
            relations: Vec::new(),
            cascades: Vec::new(),
            surrogate_field: None,
            soft_delete: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.datastore_id = Some(id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_sorts(mut self, sorts: Vec<SortItem>) -> Self {
        self.sorts = sorts;
        self
    }

    pub fn with_unique(mut self, combo: impl Into<String>) -> Self {
        self.unique_fields.push(combo.into());
        self
    }

    pub fn with_relation(mut self, relation: RelationItem) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_cascade(mut self, cascade: CascadeRule) -> Self {
        self.cascades.push(cascade);
        self
    }

    pub fn with_scan(mut self, fields: Vec<String>, connector: impl Into<String>) -> Self {
        self.scan_fields = fields;
        self.scan_fields_connector = connector.into();
        self
    }

    pub fn with_surrogate_field(mut self, field_id: impl Into<String>) -> Self {
        self.surrogate_field = Some(field_id.into());
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Validate identifiers that end up in SQL text
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.datastore_id {
            validate_key(id).map_err(DatastoreError::validation)?;
        }
        if self.datastore_name.trim().is_empty() {
            return Err(DatastoreError::validation("datastore name cannot be empty"));
        }
        validate_references(
            &self.sorts,
            &self.unique_fields,
            &self.relations,
            &self.cascades,
        )
    }
}

/// Partial update of a datastore; `None` leaves a setting unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyDatastoreRequest {
    pub datastore_name: Option<String>,
    pub api_key: Option<String>,
    pub sorts: Option<Vec<SortItem>>,
    pub scan_fields: Option<Vec<String>>,
    pub scan_fields_connector: Option<String>,
    pub unique_fields: Option<Vec<String>>,
    pub relations: Option<Vec<RelationItem>>,
    pub cascades: Option<Vec<CascadeRule>>,
    pub surrogate_field: Option<Option<String>>,
}

impl ModifyDatastoreRequest {
    pub fn validate(&self) -> Result<()> {
        validate_references(
            self.sorts.as_deref().unwrap_or_default(),
            self.unique_fields.as_deref().unwrap_or_default(),
            self.relations.as_deref().unwrap_or_default(),
            self.cascades.as_deref().unwrap_or_default(),
        )
    }
}

fn validate_references(
    sorts: &[SortItem],
    unique_fields: &[String],
    relations: &[RelationItem],
    cascades: &[CascadeRule],
) -> Result<()> {
    let check = |key: &str| validate_key(key).map_err(DatastoreError::validation);
    for sort in sorts {
        check(&sort.sort_key)?;
    }
    for combo in unique_fields {
        for field in split_combo(combo) {
            check(&field)?;
        }
    }
    for relation in relations {
        check(&relation.relation_id)?;
        check(&relation.datastore_id)?;
        if relation.fields.is_empty() {
            return Err(DatastoreError::validation(format!(
                "relation '{}' declares no field pairs",
                relation.relation_id
            )));
        }
        for (theirs, ours) in &relation.fields {
            check(theirs)?;
            check(ours)?;
        }
    }
    for cascade in cascades {
        check(&cascade.datastore_id)?;
        if cascade.links.is_empty() {
            return Err(DatastoreError::validation(format!(
                "cascade to '{}' declares no links",
                cascade.datastore_id
            )));
        }
        for (parent, child) in &cascade.links {
            check(parent)?;
            check(child)?;
        }
    }
    Ok(())
}

// ============================================================================
// Fields
// ============================================================================

/// How a number field combines an update with the stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfCalculate {
    Add,
    Sub,
}

/// Per-datastore schema entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub field_id: String,
    pub datastore_id: String,
    pub field_name: String,
    pub field_type: DataType,
    #[serde(default)]
    pub is_required: bool,
    /// Fixed fields cannot be removed by users
    #[serde(default)]
    pub is_fixed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_datastore_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_field_id: Option<String>,
    /// Option group used to resolve labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
    #[serde(default)]
    pub display_order: i64,
    /// Autonum zero-pad width; zero means unpadded and unbounded
    #[serde(default)]
    pub display_digits: u32,
    /// Fraction digits kept for number fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Autonum prefix
    #[serde(default)]
    pub prefix: String,
    /// Result type of a function field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<DataType>,
    /// JSON formula of a function field
    #[serde(default)]
    pub formula: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_calculate: Option<SelfCalculate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: String,
}

impl FieldDefinition {
    pub fn new(
        datastore_id: impl Into<String>,
        field_id: impl Into<String>,
        field_name: impl Into<String>,
        field_type: DataType,
    ) -> Self {
        Self {
            field_id: field_id.into(),
            datastore_id: datastore_id.into(),
            field_name: field_name.into(),
            field_type,
            is_required: false,
            is_fixed: false,
            unique: false,
            lookup_datastore_id: None,
            lookup_field_id: None,
            option_id: None,
            display_order: 0,
            display_digits: 0,
            precision: None,
            prefix: String::new(),
            return_type: None,
            formula: String::new(),
            self_calculate: None,
            created_at: None,
            created_by: String::new(),
            updated_at: None,
            updated_by: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.is_fixed = true;
        self
    }

    pub fn with_option_group(mut self, option_id: impl Into<String>) -> Self {
        self.option_id = Some(option_id.into());
        self
    }

    /// Autonum numbering: `prefix` followed by the value padded to `digits`
    pub fn with_numbering(mut self, prefix: impl Into<String>, digits: u32) -> Self {
        self.prefix = prefix.into();
        self.display_digits = digits;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>, return_type: DataType) -> Self {
        self.formula = formula.into();
        self.return_type = Some(return_type);
        self
    }

    pub fn with_self_calculate(mut self, mode: SelfCalculate) -> Self {
        self.self_calculate = Some(mode);
        self
    }

    pub fn with_lookup(
        mut self,
        datastore_id: impl Into<String>,
        field_id: impl Into<String>,
    ) -> Self {
        self.lookup_datastore_id = Some(datastore_id.into());
        self.lookup_field_id = Some(field_id.into());
        self
    }

    /// The data type under which this field's values are read
    pub fn read_type(&self) -> DataType {
        match self.field_type {
            DataType::Function => self.return_type.unwrap_or(DataType::Text),
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_key(&self.field_id).map_err(DatastoreError::validation)?;
        if self.field_name.trim().is_empty() {
            return Err(DatastoreError::validation("field name cannot be empty"));
        }
        if self.self_calculate.is_some() && self.field_type != DataType::Number {
            return Err(DatastoreError::validation(format!(
                "field '{}': self calculation requires a number field",
                self.field_id
            )));
        }
        Ok(())
    }
}

/// Partial update of a field; `None` leaves a setting unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyFieldRequest {
    pub field_name: Option<String>,
    pub is_required: Option<bool>,
    pub unique: Option<bool>,
    pub option_id: Option<String>,
    pub display_digits: Option<u32>,
    pub precision: Option<u32>,
    pub prefix: Option<String>,
    pub return_type: Option<DataType>,
    pub formula: Option<String>,
    pub self_calculate: Option<Option<SelfCalculate>>,
}

impl ModifyFieldRequest {
    /// Apply to a copy of `field`
    pub fn apply(&self, field: &FieldDefinition) -> FieldDefinition {
        let mut next = field.clone();
        if let Some(name) = &self.field_name {
            next.field_name = name.clone();
        }
        if let Some(required) = self.is_required {
            next.is_required = required;
        }
        if let Some(unique) = self.unique {
            next.unique = unique;
        }
        if let Some(option_id) = &self.option_id {
            next.option_id = Some(option_id.clone());
        }
        if let Some(digits) = self.display_digits {
            next.display_digits = digits;
        }
        if let Some(precision) = self.precision {
            next.precision = Some(precision);
        }
        if let Some(prefix) = &self.prefix {
            next.prefix = prefix.clone();
        }
        if let Some(return_type) = self.return_type {
            next.return_type = Some(return_type);
        }
        if let Some(formula) = &self.formula {
            next.formula = formula.clone();
        }
        if let Some(mode) = self.self_calculate {
            next.self_calculate = mode;
        }
        next
    }
}

// ============================================================================
// Loaded schema
// ============================================================================

/// A datastore together with its live field definitions
#[derive(Debug, Clone)]
pub struct DatastoreSchema {
    pub datastore: Datastore,
    /// Non-deleted fields in display order
    pub fields: Vec<FieldDefinition>,
}

impl DatastoreSchema {
    pub fn new(datastore: Datastore, mut fields: Vec<FieldDefinition>) -> Self {
        fields.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.field_id.cmp(&b.field_id))
        });
        Self { datastore, fields }
    }

    pub fn id(&self) -> &str {
        &self.datastore.datastore_id
    }

    pub fn field(&self, field_id: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    pub fn field_type(&self, field_id: &str) -> Option<DataType> {
        self.field(field_id).map(|f| f.field_type)
    }

    pub fn require_field(&self, field_id: &str) -> Result<&FieldDefinition> {
        self.field(field_id).ok_or_else(|| {
            DatastoreError::field_not_found(format!(
                "field '{}' in datastore '{}'",
                field_id,
                self.id()
            ))
        })
    }

    pub fn autonum_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields
            .iter()
            .filter(|f| f.field_type == DataType::Autonum)
    }

    /// Every unique constraint: declared combos plus single unique fields
    pub fn unique_constraints(&self) -> Vec<Vec<String>> {
        let mut out = self.datastore.unique_combos();
        for field in &self.fields {
            let single = vec![field.field_id.clone()];
            if (field.unique || field.field_type == DataType::Autonum) && !out.contains(&single) {
                out.push(single);
            }
        }
        out
    }
}
