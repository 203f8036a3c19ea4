//! Staged read query assembly
//!
//! A find runs as one statement whose stages mirror a document aggregation
//! pipeline: filter, sort, paginate inside a `page` CTE, then relation joins,
//! label lookups and the computed projection over the page.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::error::Result;
use crate::item::{FieldValues, Item, ItemsParam, MISSING};
use crate::schema::{DatastoreSchema, FieldDefinition, SortItem, SortOrder};
use crate::sql::condition::{FixedColumn, Filter};
use crate::sql::ddl::DdlGenerator;
use crate::sql::formula::parse_formula;
use crate::sql::params::SqlParams;
use crate::sql::sanitize::{quote_literal, text_path, value_path};
use crate::types::{DataType, Value};

/// `jsonb_build_object` accepts at most 100 arguments
const OBJECT_CHUNK: usize = 40;

/// System columns selected for every item
const ITEM_COLUMNS: &str = "item_id, app_id, datastore_id, owners, status, check_type, check_status, \
     created_at, created_by, updated_at, updated_by, checked_at, checked_by, label_time";

/// A generated statement and its bound parameters
#[derive(Debug)]
pub struct QueryPlan {
    pub sql: String,
    pub params: SqlParams,
}

/// One sort key resolved against the schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Column(FixedColumn),
    Field(String),
}

impl SortKey {
    pub fn parse(key: &str) -> Self {
        match FixedColumn::parse(key) {
            Some(column) => SortKey::Column(column),
            None => SortKey::Field(key.to_string()),
        }
    }

    fn render(&self, alias: &str) -> String {
        match self {
            SortKey::Column(c) => format!("{}.{}", alias, c.name()),
            SortKey::Field(f) => value_path(alias, f),
        }
    }
}

/// Effective sort list: explicit sorts, else the datastore default
pub fn effective_sorts<'a>(param_sorts: &'a [SortItem], schema: &'a DatastoreSchema) -> &'a [SortItem] {
    if param_sorts.is_empty() {
        &schema.datastore.sorts
    } else {
        param_sorts
    }
}

/// Builds read statements for one datastore
pub struct PipelineAssembler<'a> {
    ddl: &'a DdlGenerator<'a>,
    schema: &'a DatastoreSchema,
}

impl<'a> PipelineAssembler<'a> {
    pub fn new(ddl: &'a DdlGenerator<'a>, schema: &'a DatastoreSchema) -> Self {
        Self { ddl, schema }
    }

    /// Scope, owner and filter predicates over alias `t`
    fn where_clause(&self, filter: Option<&Filter>, owners: &[String], params: &mut SqlParams) -> String {
        let mut clauses = vec![
            "t.deleted_by IS NULL".to_string(),
            format!("t.app_id = {}", params.text(self.schema.datastore.app_id.clone())),
            format!(
                "t.datastore_id = {}",
                params.text(self.schema.datastore.datastore_id.clone())
            ),
        ];
        if !owners.is_empty() {
            clauses.push(format!("t.owners && {}", params.text_list(owners.to_vec())));
        }
        if let Some(filter) = filter {
            clauses.push(format!("({})", filter.render("t", params)));
        }
        clauses.join(" AND ")
    }

    /// ORDER BY list: sorts, then newest first, then item id for stable pages
    pub fn order_by(&self, sorts: &[SortItem], alias: &str) -> String {
        let mut keys: Vec<String> = effective_sorts(sorts, self.schema)
            .iter()
            .map(|s| {
                let dir = match s.sort_value {
                    SortOrder::Ascend => "ASC",
                    SortOrder::Descend => "DESC",
                };
                format!("{} {}", SortKey::parse(&s.sort_key).render(alias), dir)
            })
            .collect();
        keys.push(format!("{}.created_at DESC", alias));
        keys.push(format!("{}.item_id DESC", alias));
        keys.join(", ")
    }

    fn pagination(param: &ItemsParam, params: &mut SqlParams) -> String {
        let mut out = String::new();
        if param.page_size > 0 {
            out.push_str(&format!(" LIMIT {}", params.int(param.page_size)));
            // Overflowing pages are rejected before a plan is built
            let offset = param.offset().unwrap_or(0);
            if offset > 0 {
                out.push_str(&format!(" OFFSET {}", params.int(offset)));
            }
        }
        out
    }

    /// Total matching records, ignoring pagination
    pub fn count(&self, filter: Option<&Filter>, param: &ItemsParam) -> QueryPlan {
        let mut params = SqlParams::new();
        let where_clause = self.where_clause(filter, &param.owners, &mut params);
        QueryPlan {
            sql: format!(
                "SELECT COUNT(*) AS total FROM {} t WHERE {}",
                self.ddl.items(self.schema.id()),
                where_clause
            ),
            params,
        }
    }

    /// The full staged find
    pub fn find(&self, filter: Option<&Filter>, param: &ItemsParam) -> QueryPlan {
        let mut params = SqlParams::new();
        let where_clause = self.where_clause(filter, &param.owners, &mut params);
        let order = self.order_by(&param.sorts, "t");
        let limit = Self::pagination(param, &mut params);
        let table = self.ddl.items(self.schema.id());

        if param.is_origin {
            return QueryPlan {
                sql: format!(
                    "SELECT {cols}, t.items AS items, '{{}}'::jsonb AS labels, '{{}}'::jsonb AS relations \
                     FROM {table} t WHERE {where_clause} ORDER BY {order}{limit}",
                    cols = prefixed_columns("t"),
                ),
                params,
            };
        }

        let page = format!(
            "SELECT t.*, ROW_NUMBER() OVER (ORDER BY {order}) AS __ord \
             FROM {table} t WHERE {where_clause} ORDER BY {order}{limit}"
        );

        let mut joins = Vec::new();
        let mut relation_pairs = Vec::new();
        for (i, relation) in self.schema.datastore.relations.iter().enumerate() {
            let alias = format!("rel_{}", i);
            let on: Vec<String> = relation
                .fields
                .iter()
                .map(|(theirs, ours)| format!("{} = {}", value_path("r", theirs), value_path("p", ours)))
                .collect();
            joins.push(format!(
                "LEFT JOIN LATERAL (SELECT COALESCE(jsonb_agg(r.items ORDER BY r.created_at, r.item_id), '[]'::jsonb) AS matched \
                 FROM {} r WHERE r.deleted_by IS NULL AND {}) {} ON TRUE",
                self.ddl.items(&relation.datastore_id),
                on.join(" AND "),
                alias
            ));
            relation_pairs.push((quote_literal(&relation.relation_id), format!("{}.matched", alias)));
        }

        let mut item_pairs = Vec::new();
        let mut label_pairs = Vec::new();
        for field in &self.schema.fields {
            item_pairs.push((quote_literal(&field.field_id), self.project_field(field, &mut params)));
            if let Some(label) = self.label_expr(field, &mut params) {
                label_pairs.push((quote_literal(&field.field_id), label));
            }
        }

        let sql = format!(
            "WITH page AS ({page}) SELECT {cols}, {items} AS items, jsonb_strip_nulls({labels}) AS labels, {relations} AS relations \
             FROM page p {joins} ORDER BY p.__ord",
            cols = prefixed_columns("p"),
            items = build_object(&item_pairs),
            labels = build_object(&label_pairs),
            relations = build_object(&relation_pairs),
            joins = joins.join(" "),
        );
        QueryPlan { sql, params }
    }

    /// Stored entry of a field, its computed value, or the missing marker
    fn project_field(&self, field: &FieldDefinition, params: &mut SqlParams) -> String {
        if field.field_type == DataType::Function {
            let data_type = quote_literal(field.read_type().as_str());
            // Formulas are validated on write; a broken one reads as empty
            let value = match parse_formula(&field.formula) {
                Ok(Some(expr)) => format!("COALESCE({}, 'null'::jsonb)", expr.render_value("p", params)),
                _ => "'\"\"'::jsonb".to_string(),
            };
            return format!("jsonb_build_object('data_type', {}, 'value', {})", data_type, value);
        }
        format!(
            "COALESCE(p.items -> {}, {}::jsonb)",
            quote_literal(&field.field_id),
            quote_literal(&serde_json::Value::from(MISSING).to_string())
        )
    }

    /// Label lookup for user and options fields
    fn label_expr(&self, field: &FieldDefinition, params: &mut SqlParams) -> Option<String> {
        match field.field_type {
            DataType::User => {
                let v = value_path("p", &field.field_id);
                Some(format!(
                    "(SELECT string_agg(COALESCE(NULLIF(u.user_name, ''), x.id), ',' ORDER BY x.ord) \
                     FROM jsonb_array_elements_text(CASE WHEN jsonb_typeof({v}) = 'array' THEN {v} ELSE '[]'::jsonb END) \
                     WITH ORDINALITY AS x(id, ord) LEFT JOIN {users} u ON u.user_id = x.id)",
                    v = v,
                    users = self.ddl.users_table(),
                ))
            }
            DataType::Options => {
                let option_id = field.option_id.clone()?;
                Some(format!(
                    "(SELECT o.option_label FROM {} o WHERE o.app_id = p.app_id AND o.option_id = {} \
                     AND o.option_value = {} LIMIT 1)",
                    self.ddl.options_table(),
                    params.text(option_id),
                    text_path("p", &field.field_id)
                ))
            }
            _ => None,
        }
    }
}

fn prefixed_columns(alias: &str) -> String {
    ITEM_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `jsonb_build_object` over key/value pairs, chunked and merged with `||`
fn build_object(pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return "'{}'::jsonb".to_string();
    }
    let chunks: Vec<String> = pairs
        .chunks(OBJECT_CHUNK)
        .map(|chunk| {
            let args: Vec<String> = chunk.iter().map(|(k, v)| format!("{}, {}", k, v)).collect();
            format!("jsonb_build_object({})", args.join(", "))
        })
        .collect();
    if chunks.len() == 1 {
        chunks.concat()
    } else {
        format!("({})", chunks.join(" || "))
    }
}

// ============================================================================
// Row decoding
// ============================================================================

/// Decode a projected `items` object, separating missing-marker entries
pub fn decode_items(json: &serde_json::Value) -> (FieldValues, BTreeSet<String>) {
    let mut items = FieldValues::new();
    let mut missing = BTreeSet::new();
    if let Some(map) = json.as_object() {
        for (field_id, entry) in map {
            if entry.as_str() == Some(MISSING) {
                missing.insert(field_id.clone());
            } else {
                items.insert(field_id.clone(), Value::from_json(entry));
            }
        }
    }
    (items, missing)
}

fn decode_relations(json: &serde_json::Value) -> BTreeMap<String, Vec<FieldValues>> {
    let mut out = BTreeMap::new();
    if let Some(map) = json.as_object() {
        for (relation_id, rows) in map {
            let decoded = rows
                .as_array()
                .map(|rows| rows.iter().map(|r| decode_items(r).0).collect())
                .unwrap_or_default();
            out.insert(relation_id.clone(), decoded);
        }
    }
    out
}

fn decode_labels(json: &serde_json::Value) -> BTreeMap<String, String> {
    json.as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a row produced by [`PipelineAssembler::find`]
pub fn row_to_item(row: &PgRow) -> Result<Item> {
    let items_json: serde_json::Value = row.try_get("items")?;
    let labels_json: serde_json::Value = row.try_get("labels")?;
    let relations_json: serde_json::Value = row.try_get("relations")?;
    let (items, missing) = decode_items(&items_json);

    Ok(Item {
        item_id: row.try_get("item_id")?,
        app_id: row.try_get("app_id")?,
        datastore_id: row.try_get("datastore_id")?,
        items,
        missing,
        labels: decode_labels(&labels_json),
        relations: decode_relations(&relations_json),
        owners: row.try_get("owners")?,
        status: row.try_get("status")?,
        check_type: row.try_get("check_type")?,
        check_status: row.try_get("check_status")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
        checked_at: row.try_get("checked_at")?,
        checked_by: row.try_get("checked_by")?,
        label_time: row.try_get("label_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::item::{Condition, ConditionMode};
    use crate::schema::{Datastore, RelationItem, Tenant};
    use crate::sql::condition::compile_conditions;
    use chrono::Utc;

    fn schema(sorts: Vec<SortItem>, relations: Vec<RelationItem>) -> DatastoreSchema {
        let datastore = Datastore {
            datastore_id: "orders".into(),
            app_id: "app".into(),
            datastore_name: "Orders".into(),
            api_key: "orders".into(),
            sorts,
            scan_fields: vec![],
            scan_fields_connector: String::new(),
            unique_fields: vec![],
            relations,
            cascades: vec![],
            surrogate_field: None,
            soft_delete: false,
            created_at: Utc::now(),
            created_by: "u".into(),
            updated_at: Utc::now(),
            updated_by: "u".into(),
        };
        let fields = vec![
            FieldDefinition::new("orders", "code", "Code", DataType::Text),
            FieldDefinition::new("orders", "qty", "Qty", DataType::Number),
            FieldDefinition::new("orders", "state", "State", DataType::Options)
                .with_option_group("order_state"),
            FieldDefinition::new("orders", "staff", "Staff", DataType::User),
            FieldDefinition::new("orders", "double", "Double", DataType::Function)
                .with_formula(r#"{"$multiply": ["$items.qty.value", 2]}"#, DataType::Number),
        ];
        DatastoreSchema::new(datastore, fields)
    }

    fn with_ddl<F: FnOnce(&DdlGenerator<'_>)>(f: F) {
        let config = EngineConfig::builder("postgres://localhost/test").build();
        let tenant = Tenant::new("acme").unwrap();
        let ddl = DdlGenerator::new(&config, &tenant);
        f(&ddl);
    }

    // ===== Sort stage =====

    #[test]
    fn test_order_by_falls_back_to_datastore_default() {
        with_ddl(|ddl| {
            let s = schema(vec![SortItem::ascend("code")], vec![]);
            let assembler = PipelineAssembler::new(ddl, &s);
            assert_eq!(
                assembler.order_by(&[], "t"),
                "(t.items -> 'code' -> 'value') ASC, t.created_at DESC, t.item_id DESC"
            );
            assert_eq!(
                assembler.order_by(&[SortItem::descend("updated_at")], "t"),
                "t.updated_at DESC, t.created_at DESC, t.item_id DESC"
            );
        });
    }

    #[test]
    fn test_sort_key_parse() {
        assert_eq!(SortKey::parse("created_by"), SortKey::Column(FixedColumn::CreatedBy));
        assert_eq!(SortKey::parse("code"), SortKey::Field("code".into()));
    }

    // ===== Count =====

    #[test]
    fn test_count_plan() {
        with_ddl(|ddl| {
            let s = schema(vec![], vec![]);
            let assembler = PipelineAssembler::new(ddl, &s);
            let filter = compile_conditions(
                &[Condition::dynamic("code", "text", "=", "A")],
                ConditionMode::And,
                false,
            )
            .unwrap();
            let plan = assembler.count(filter.as_ref(), &ItemsParam::new().owners(["g1"]));
            assert_eq!(
                plan.sql,
                "SELECT COUNT(*) AS total FROM \"acme\".\"item_orders\" t WHERE t.deleted_by IS NULL \
                 AND t.app_id = $1::text AND t.datastore_id = $2::text AND t.owners && $3::text[] \
                 AND ((t.items -> 'code' -> 'value') = $4::jsonb)"
            );
            assert_eq!(plan.params.len(), 4);
        });
    }

    // ===== Find =====

    #[test]
    fn test_find_pagination() {
        with_ddl(|ddl| {
            let s = schema(vec![], vec![]);
            let assembler = PipelineAssembler::new(ddl, &s);
            let plan = assembler.find(None, &ItemsParam::new().page(3, 20));
            assert!(plan.sql.contains(" LIMIT $3::bigint OFFSET $4::bigint)"));

            let unbounded = assembler.find(None, &ItemsParam::new());
            assert!(!unbounded.sql.contains("LIMIT"));
        });
    }

    #[test]
    fn test_find_projection_and_labels() {
        with_ddl(|ddl| {
            let s = schema(vec![], vec![]);
            let plan = PipelineAssembler::new(ddl, &s).find(None, &ItemsParam::new());

            assert!(plan.sql.starts_with("WITH page AS (SELECT t.*, ROW_NUMBER() OVER"));
            assert!(plan.sql.contains("'code', COALESCE(p.items -> 'code', '\"##missing##\"'::jsonb)"));
            assert!(plan.sql.contains("jsonb_build_object('data_type', 'number', 'value', COALESCE(to_jsonb("));
            assert!(plan.sql.contains("FROM \"acme\".\"options\" o WHERE o.app_id = p.app_id"));
            assert!(plan.sql.contains("LEFT JOIN \"acme\".\"users\" u ON u.user_id = x.id"));
            assert!(plan.sql.ends_with("ORDER BY p.__ord"));
        });
    }

    #[test]
    fn test_find_relation_join() {
        with_ddl(|ddl| {
            let mut fields = BTreeMap::new();
            fields.insert("customer_code".to_string(), "customer".to_string());
            let s = schema(
                vec![],
                vec![RelationItem {
                    relation_id: "cust".into(),
                    datastore_id: "customers".into(),
                    fields,
                }],
            );
            let plan = PipelineAssembler::new(ddl, &s).find(None, &ItemsParam::new());
            assert!(plan.sql.contains(
                "FROM \"acme\".\"item_customers\" r WHERE r.deleted_by IS NULL AND \
                 (r.items -> 'customer_code' -> 'value') = (p.items -> 'customer' -> 'value')) rel_0 ON TRUE"
            ));
            assert!(plan.sql.contains("jsonb_build_object('cust', rel_0.matched) AS relations"));
        });
    }

    #[test]
    fn test_find_origin_skips_joins() {
        with_ddl(|ddl| {
            let s = schema(vec![], vec![]);
            let plan = PipelineAssembler::new(ddl, &s).find(None, &ItemsParam::new().origin());
            assert!(!plan.sql.contains("WITH page"));
            assert!(!plan.sql.contains("LATERAL"));
            assert!(plan.sql.contains("t.items AS items"));
        });
    }

    #[test]
    fn test_build_object_chunks() {
        let pairs: Vec<(String, String)> = (0..85)
            .map(|i| (format!("'f{}'", i), "'1'::jsonb".to_string()))
            .collect();
        let sql = build_object(&pairs);
        assert_eq!(sql.matches("jsonb_build_object(").count(), 3);
        assert!(sql.starts_with("(jsonb_build_object('f0'"));
        assert_eq!(build_object(&[]), "'{}'::jsonb");
    }

    // ===== Decoding =====

    #[test]
    fn test_decode_items_separates_missing() {
        let json = serde_json::json!({
            "code": {"data_type": "text", "value": "A-1"},
            "qty": {"data_type": "number", "value": 3},
            "memo": MISSING,
        });
        let (items, missing) = decode_items(&json);
        assert_eq!(items.len(), 2);
        assert_eq!(items["qty"].as_f64(), 3.0);
        assert!(missing.contains("memo"));
        assert!(!items.contains_key("memo"));
    }

    #[test]
    fn test_decode_relations_and_labels() {
        let rel = serde_json::json!({"cust": [{"name": {"data_type": "text", "value": "Acme"}}]});
        let decoded = decode_relations(&rel);
        assert_eq!(decoded["cust"][0]["name"].to_wire(), "Acme");

        let labels = decode_labels(&serde_json::json!({"state": "Open", "staff": null}));
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["state"], "Open");
    }
}
