//! Condition compilation
//!
//! Turns the caller's flat [`Condition`] list into a [`Filter`] predicate tree
//! and renders filters to SQL WHERE fragments over the `items` JSONB column.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DatastoreError, Result};
use crate::item::{Condition, ConditionMode};
use crate::sql::params::{SqlParam, SqlParams};
use crate::sql::sanitize::{quote_literal, text_path, value_path};
use crate::types::{DataType, Value};

// ============================================================================
// Predicate tree
// ============================================================================

/// System columns addressable by fixed conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedColumn {
    ItemId,
    AppId,
    DatastoreId,
    Owners,
    Status,
    CheckType,
    CheckStatus,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    UpdatedBy,
    CheckedAt,
    CheckedBy,
    LabelTime,
}

/// Storage type of a fixed column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    TextList,
    Time,
}

impl FixedColumn {
    pub const ALL: [FixedColumn; 14] = [
        FixedColumn::ItemId,
        FixedColumn::AppId,
        FixedColumn::DatastoreId,
        FixedColumn::Owners,
        FixedColumn::Status,
        FixedColumn::CheckType,
        FixedColumn::CheckStatus,
        FixedColumn::CreatedAt,
        FixedColumn::CreatedBy,
        FixedColumn::UpdatedAt,
        FixedColumn::UpdatedBy,
        FixedColumn::CheckedAt,
        FixedColumn::CheckedBy,
        FixedColumn::LabelTime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FixedColumn::ItemId => "item_id",
            FixedColumn::AppId => "app_id",
            FixedColumn::DatastoreId => "datastore_id",
            FixedColumn::Owners => "owners",
            FixedColumn::Status => "status",
            FixedColumn::CheckType => "check_type",
            FixedColumn::CheckStatus => "check_status",
            FixedColumn::CreatedAt => "created_at",
            FixedColumn::CreatedBy => "created_by",
            FixedColumn::UpdatedAt => "updated_at",
            FixedColumn::UpdatedBy => "updated_by",
            FixedColumn::CheckedAt => "checked_at",
            FixedColumn::CheckedBy => "checked_by",
            FixedColumn::LabelTime => "label_time",
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            FixedColumn::Owners => ColumnKind::TextList,
            FixedColumn::CreatedAt
            | FixedColumn::UpdatedAt
            | FixedColumn::CheckedAt
            | FixedColumn::LabelTime => ColumnKind::Time,
            _ => ColumnKind::Text,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// What a predicate reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// `items.<id>.value`
    Field(String),
    Column(FixedColumn),
    /// Scan fields joined by a connector
    Concat {
        fields: Vec<String>,
        connector: String,
    },
}

/// A comparison operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Json(serde_json::Value),
    Text(String),
    Time(DateTime<Utc>),
}

impl Operand {
    fn bind(&self, params: &mut SqlParams) -> String {
        params.push(match self {
            Operand::Json(v) => SqlParam::Json(v.clone()),
            Operand::Text(v) => SqlParam::Text(v.clone()),
            Operand::Time(v) => SqlParam::Time(*v),
        })
    }

    /// `jsonb_typeof` a stored value must have to be ordered against this operand
    fn json_type(&self) -> Option<&'static str> {
        match self {
            Operand::Json(serde_json::Value::Number(_)) => Some("number"),
            Operand::Json(serde_json::Value::String(_)) => Some("string"),
            _ => None,
        }
    }
}

/// The test applied to a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Test {
    Eq(Operand),
    /// Also matches records where the target is absent
    Ne(Operand),
    Gt(Operand),
    Gte(Operand),
    Lt(Operand),
    Lte(Operand),
    /// POSIX regular expression on the text form
    Matches(String),
    /// Scalar membership
    In(Vec<String>),
    /// List target holds the element
    Contains(String),
    NotContains(String),
    /// List target shares at least one element
    Overlaps(Vec<String>),
    /// Present and not an empty list
    NonEmptyList,
    /// Absent or an empty list
    EmptyList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub target: Target,
    pub test: Test,
}

/// Boolean tree over leaf predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Leaf(Predicate),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn leaf(target: Target, test: Test) -> Self {
        Filter::Leaf(Predicate { target, test })
    }

    pub fn field(field_id: impl Into<String>, test: Test) -> Self {
        Self::leaf(Target::Field(field_id.into()), test)
    }

    pub fn column(column: FixedColumn, test: Test) -> Self {
        Self::leaf(Target::Column(column), test)
    }

    /// Combine under `mode`, flattening single-child groups
    pub fn combine(mut children: Vec<Filter>, mode: ConditionMode) -> Option<Filter> {
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(match mode {
                ConditionMode::And => Filter::And(children),
                ConditionMode::Or => Filter::Or(children),
            }),
        }
    }

    /// Targets in first-reference order, without duplicates
    pub fn targets(&self) -> Vec<Target> {
        let mut out = Vec::new();
        self.collect_targets(&mut out);
        out
    }

    fn collect_targets(&self, out: &mut Vec<Target>) {
        match self {
            Filter::Leaf(p) => {
                let found: Vec<Target> = match &p.target {
                    Target::Concat { fields, .. } => {
                        fields.iter().map(|f| Target::Field(f.clone())).collect()
                    }
                    other => vec![other.clone()],
                };
                for t in found {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
            Filter::And(children) | Filter::Or(children) => {
                for child in children {
                    child.collect_targets(out);
                }
            }
        }
    }

    /// Render as a SQL boolean expression over the table alias
    pub fn render(&self, alias: &str, params: &mut SqlParams) -> String {
        match self {
            Filter::Leaf(p) => render_predicate(p, alias, params),
            Filter::And(children) if children.is_empty() => "TRUE".to_string(),
            Filter::Or(children) if children.is_empty() => "FALSE".to_string(),
            Filter::And(children) => join_children(children, " AND ", alias, params),
            Filter::Or(children) => join_children(children, " OR ", alias, params),
        }
    }
}

fn join_children(children: &[Filter], sep: &str, alias: &str, params: &mut SqlParams) -> String {
    let parts: Vec<String> = children
        .iter()
        .map(|c| format!("({})", c.render(alias, params)))
        .collect();
    parts.join(sep)
}

/// Ordered comparison of a stored value
///
/// JSONB orders values of different types against each other, so legacy
/// strings or nulls in a number field would otherwise satisfy `>` or `<`.
fn compare_ordered(v: &str, op: &str, operand: &Operand, params: &mut SqlParams) -> String {
    let bound = operand.bind(params);
    match operand.json_type() {
        Some(kind) => format!("(jsonb_typeof({v}) = '{kind}' AND {v} {op} {bound})"),
        None => format!("{v} {op} {bound}"),
    }
}

const NON_EMPTY_LIST: &str = "NOT IN ('[]'::jsonb, '\"[]\"'::jsonb, '\"\"'::jsonb, 'null'::jsonb)";

fn render_predicate(p: &Predicate, alias: &str, params: &mut SqlParams) -> String {
    match &p.target {
        Target::Field(field_id) => {
            let v = value_path(alias, field_id);
            match &p.test {
                Test::Eq(o) => format!("{} = {}", v, o.bind(params)),
                Test::Ne(o) => format!("{} IS DISTINCT FROM {}", v, o.bind(params)),
                Test::Gt(o) => compare_ordered(&v, ">", o, params),
                Test::Gte(o) => compare_ordered(&v, ">=", o, params),
                Test::Lt(o) => compare_ordered(&v, "<", o, params),
                Test::Lte(o) => compare_ordered(&v, "<=", o, params),
                Test::Matches(re) => {
                    format!("{} ~ {}", text_path(alias, field_id), params.text(re.clone()))
                }
                Test::In(list) => format!(
                    "{} = ANY({})",
                    text_path(alias, field_id),
                    params.text_list(list.clone())
                ),
                Test::Contains(s) => format!("COALESCE({} ? {}, FALSE)", v, params.text(s.clone())),
                Test::NotContains(s) => {
                    format!("NOT COALESCE({} ? {}, FALSE)", v, params.text(s.clone()))
                }
                Test::Overlaps(list) => format!(
                    "COALESCE({} ?| {}, FALSE)",
                    v,
                    params.text_list(list.clone())
                ),
                Test::NonEmptyList => format!("COALESCE({} {}, FALSE)", v, NON_EMPTY_LIST),
                Test::EmptyList => format!("NOT COALESCE({} {}, FALSE)", v, NON_EMPTY_LIST),
            }
        }
        Target::Column(column) => {
            let c = format!("{}.{}", alias, column.name());
            let list_column = column.kind() == ColumnKind::TextList;
            match &p.test {
                Test::Eq(o) => format!("{} = {}", c, o.bind(params)),
                Test::Ne(o) => format!("{} IS DISTINCT FROM {}", c, o.bind(params)),
                Test::Gt(o) => format!("{} > {}", c, o.bind(params)),
                Test::Gte(o) => format!("{} >= {}", c, o.bind(params)),
                Test::Lt(o) => format!("{} < {}", c, o.bind(params)),
                Test::Lte(o) => format!("{} <= {}", c, o.bind(params)),
                Test::Matches(re) => format!("{}::text ~ {}", c, params.text(re.clone())),
                Test::In(list) | Test::Overlaps(list) if list_column => {
                    format!("{} && {}", c, params.text_list(list.clone()))
                }
                Test::In(list) | Test::Overlaps(list) => {
                    format!("{} = ANY({})", c, params.text_list(list.clone()))
                }
                Test::Contains(s) if list_column => {
                    format!("{} = ANY({})", params.text(s.clone()), c)
                }
                Test::Contains(s) => format!("{} = {}", c, params.text(s.clone())),
                Test::NotContains(s) if list_column => {
                    format!("NOT ({} = ANY({}))", params.text(s.clone()), c)
                }
                Test::NotContains(s) => format!("{} IS DISTINCT FROM {}", c, params.text(s.clone())),
                Test::NonEmptyList => format!("COALESCE(cardinality({}) > 0, FALSE)", c),
                Test::EmptyList => format!("COALESCE(cardinality({}) = 0, TRUE)", c),
            }
        }
        Target::Concat { fields, connector } => {
            let parts: Vec<String> = fields.iter().map(|f| text_path(alias, f)).collect();
            let joined = format!("concat_ws({}, {})", quote_literal(connector), parts.join(", "));
            match &p.test {
                Test::Matches(re) => format!("{} ~ {}", joined, params.text(re.clone())),
                Test::Eq(Operand::Text(s)) => format!("{} = {}", joined, params.text(s.clone())),
                other => {
                    warn!(test = ?other, "unsupported test on concatenated scan fields");
                    "FALSE".to_string()
                }
            }
        }
    }
}

// ============================================================================
// Condition list compilation
// ============================================================================

const OP_LIKE: &str = "like";
const OP_NE: &str = "<>";
const OP_IN: &str = "in";

/// Compile a condition list under one shared boolean mode
///
/// Returns `None` when no condition produced a predicate. With `strict`, an
/// unknown field type is an error; otherwise it is skipped with a warning.
pub fn compile_conditions(
    conditions: &[Condition],
    mode: ConditionMode,
    strict: bool,
) -> Result<Option<Filter>> {
    let mut compiled = Vec::with_capacity(conditions.len());
    for condition in conditions {
        let filter = if condition.is_dynamic {
            compile_dynamic(condition)?
        } else {
            compile_fixed(condition)?
        };
        match filter {
            Some(f) => compiled.push(f),
            None if strict => {
                return Err(DatastoreError::invalid_condition(format!(
                    "field '{}' has unsupported type '{}'",
                    condition.field_id, condition.field_type
                )));
            }
            None => {
                warn!(
                    field_id = %condition.field_id,
                    field_type = %condition.field_type,
                    dynamic = condition.is_dynamic,
                    "condition skipped: unsupported field type"
                );
            }
        }
    }
    Ok(Filter::combine(compiled, mode))
}

fn compile_dynamic(c: &Condition) -> Result<Option<Filter>> {
    crate::sql::sanitize::validate_key(&c.field_id).map_err(DatastoreError::invalid_condition)?;
    let Ok(data_type) = c.field_type.parse::<DataType>() else {
        return Ok(None);
    };
    let field = || Target::Field(c.field_id.clone());
    let text = || Operand::Json(serde_json::Value::String(c.search_value.clone()));

    let filter = match data_type {
        DataType::Text | DataType::Textarea | DataType::Autonum | DataType::Lookup => {
            let test = match c.operator.as_str() {
                OP_LIKE => Test::Matches(regex::escape(&c.search_value)),
                OP_NE => Test::Ne(text()),
                _ => Test::Eq(text()),
            };
            Filter::leaf(field(), test)
        }
        DataType::Switch => {
            let value = Value::from_wire(DataType::Switch, &c.search_value);
            Filter::leaf(field(), Test::Eq(Operand::Json(value.stored_value())))
        }
        DataType::File => {
            let test = if c.search_value == "true" {
                Test::NonEmptyList
            } else {
                Test::EmptyList
            };
            Filter::leaf(field(), test)
        }
        DataType::Options => {
            let test = match c.operator.as_str() {
                OP_IN => Test::In(split_list(&c.search_value)),
                OP_NE => Test::Ne(text()),
                _ => Test::Eq(text()),
            };
            Filter::leaf(field(), test)
        }
        DataType::User => {
            let test = match c.operator.as_str() {
                OP_IN => Test::Overlaps(split_list(&c.search_value)),
                OP_NE => Test::NotContains(c.search_value.clone()),
                _ => Test::Contains(c.search_value.clone()),
            };
            Filter::leaf(field(), test)
        }
        DataType::Number | DataType::Date | DataType::Time => {
            let typed = |s: &str| Operand::Json(Value::from_wire(data_type, s).stored_value());
            if c.is_range() {
                return Ok(range_filter(field(), &c.search_value, typed));
            }
            Filter::leaf(field(), ordered_test(&c.operator, typed(c.search_value.as_str())))
        }
        DataType::Function => return Ok(None),
    };
    Ok(Some(filter))
}

fn compile_fixed(c: &Condition) -> Result<Option<Filter>> {
    let column = FixedColumn::parse(&c.field_id).ok_or_else(|| {
        DatastoreError::invalid_condition(format!("unknown system column '{}'", c.field_id))
    })?;
    let is_time = column.kind() == ColumnKind::Time;
    let is_list = column.kind() == ColumnKind::TextList;
    let text = || Operand::Text(c.search_value.clone());
    let target = || Target::Column(column);

    let filter = match c.field_type.as_str() {
        "datetime" => {
            if !is_time {
                return Err(DatastoreError::invalid_condition(format!(
                    "column '{}' is not a timestamp",
                    c.field_id
                )));
            }
            if c.is_range() {
                return Ok(range_filter(target(), &c.search_value, |s| {
                    Operand::Time(day_start(parse_day(s)))
                }));
            }
            day_filter(column, &c.operator, parse_day(&c.search_value))
        }
        _ if is_time => {
            return Err(DatastoreError::invalid_condition(format!(
                "timestamp column '{}' requires the datetime type",
                c.field_id
            )));
        }
        "options" | "type" | "user" | "group" => {
            let test = match (c.operator.as_str(), is_list) {
                (OP_IN, _) => Test::In(split_list(&c.search_value)),
                (OP_NE, true) => Test::NotContains(c.search_value.clone()),
                (OP_NE, false) => Test::Ne(text()),
                (_, true) => Test::Contains(c.search_value.clone()),
                (_, false) => Test::Eq(text()),
            };
            Filter::leaf(target(), test)
        }
        "check" => Filter::leaf(target(), Test::Eq(text())),
        "text" if !is_list => {
            let test = match c.operator.as_str() {
                OP_LIKE => Test::Matches(regex::escape(&c.search_value)),
                OP_NE => Test::Ne(text()),
                _ => Test::Eq(text()),
            };
            Filter::leaf(target(), test)
        }
        _ => return Ok(None),
    };
    Ok(Some(filter))
}

fn ordered_test(operator: &str, operand: Operand) -> Test {
    match operator {
        ">" => Test::Gt(operand),
        ">=" => Test::Gte(operand),
        "<" => Test::Lt(operand),
        "<=" => Test::Lte(operand),
        OP_NE => Test::Ne(operand),
        _ => Test::Eq(operand),
    }
}

/// `from~to` as a half-open interval; an empty side leaves that bound open
fn range_filter(target: Target, spec: &str, typed: impl Fn(&str) -> Operand) -> Option<Filter> {
    let (from, to) = spec.split_once('~').unwrap_or((spec, ""));
    let mut bounds = Vec::new();
    if !from.trim().is_empty() {
        bounds.push(Filter::leaf(target.clone(), Test::Gte(typed(from.trim()))));
    }
    if !to.trim().is_empty() {
        bounds.push(Filter::leaf(target, Test::Lt(typed(to.trim()))));
    }
    Filter::combine(bounds, ConditionMode::And)
}

/// Day-granularity comparison on a timestamp column
fn day_filter(column: FixedColumn, operator: &str, day: NaiveDate) -> Filter {
    let start = Operand::Time(day_start(day));
    let next = Operand::Time(day_start(day) + Duration::days(1));
    let target = Target::Column(column);
    match operator {
        ">" => Filter::leaf(target, Test::Gte(next)),
        ">=" => Filter::leaf(target, Test::Gte(start)),
        "<" => Filter::leaf(target, Test::Lt(start)),
        "<=" => Filter::leaf(target, Test::Lt(next)),
        OP_NE => Filter::Or(vec![
            Filter::leaf(target.clone(), Test::Lt(start)),
            Filter::leaf(target, Test::Gte(next)),
        ]),
        _ => Filter::And(vec![
            Filter::leaf(target.clone(), Test::Gte(start)),
            Filter::leaf(target, Test::Lt(next)),
        ]),
    }
}

fn parse_day(s: &str) -> NaiveDate {
    crate::types::parse_date(s).unwrap_or_else(crate::types::zero_date)
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(filter: &Filter) -> (String, Vec<SqlParam>) {
        let mut params = SqlParams::new();
        let sql = filter.render("t", &mut params);
        (sql, params.values().to_vec())
    }

    fn compile_one(c: Condition) -> Option<Filter> {
        compile_conditions(&[c], ConditionMode::And, false).unwrap()
    }

    // ==================== Text-like Fields ====================

    #[test]
    fn test_text_like_is_escaped_regex() {
        let f = compile_one(Condition::dynamic("name", "text", "like", "a.c(")).unwrap();
        let (sql, params) = render(&f);
        assert_eq!(sql, "(t.items -> 'name' ->> 'value') ~ $1::text");
        assert_eq!(params, vec![SqlParam::Text("a\\.c\\(".into())]);
    }

    #[test]
    fn test_text_not_equal_matches_absent() {
        let f = compile_one(Condition::dynamic("name", "textarea", "<>", "x")).unwrap();
        let (sql, params) = render(&f);
        assert_eq!(sql, "(t.items -> 'name' -> 'value') IS DISTINCT FROM $1::jsonb");
        assert_eq!(params, vec![SqlParam::Json(json!("x"))]);
    }

    #[test]
    fn test_autonum_and_lookup_default_to_equal() {
        for ty in ["autonum", "lookup", "text"] {
            let f = compile_one(Condition::dynamic("code", ty, "=", "A-0001")).unwrap();
            let (sql, _) = render(&f);
            assert_eq!(sql, "(t.items -> 'code' -> 'value') = $1::jsonb");
        }
    }

    // ==================== Options / User ====================

    #[test]
    fn test_options_in_splits_on_comma() {
        let f = compile_one(Condition::dynamic("status", "options", "in", "a, b,,c")).unwrap();
        let (sql, params) = render(&f);
        assert_eq!(sql, "(t.items -> 'status' ->> 'value') = ANY($1::text[])");
        assert_eq!(
            params,
            vec![SqlParam::TextList(vec!["a".into(), "b".into(), "c".into()])]
        );
    }

    #[test]
    fn test_user_membership_tests() {
        let eq = compile_one(Condition::dynamic("assignee", "user", "=", "u1")).unwrap();
        assert_eq!(
            render(&eq).0,
            "COALESCE((t.items -> 'assignee' -> 'value') ? $1::text, FALSE)"
        );

        let ne = compile_one(Condition::dynamic("assignee", "user", "<>", "u1")).unwrap();
        assert_eq!(
            render(&ne).0,
            "NOT COALESCE((t.items -> 'assignee' -> 'value') ? $1::text, FALSE)"
        );

        let any = compile_one(Condition::dynamic("assignee", "user", "in", "u1,u2")).unwrap();
        assert_eq!(
            render(&any).0,
            "COALESCE((t.items -> 'assignee' -> 'value') ?| $1::text[], FALSE)"
        );
    }

    // ==================== Switch / File ====================

    #[test]
    fn test_switch_compares_boolean() {
        let f = compile_one(Condition::dynamic("active", "switch", "=", "true")).unwrap();
        let (_, params) = render(&f);
        assert_eq!(params, vec![SqlParam::Json(json!(true))]);
    }

    #[test]
    fn test_file_attachment_presence() {
        let has = compile_one(Condition::dynamic("docs", "file", "=", "true")).unwrap();
        assert!(matches!(&has, Filter::Leaf(p) if p.test == Test::NonEmptyList));
        let none = compile_one(Condition::dynamic("docs", "file", "=", "false")).unwrap();
        let (sql, _) = render(&none);
        assert!(sql.starts_with("NOT COALESCE((t.items -> 'docs' -> 'value') NOT IN"));
    }

    // ==================== Ordered Types ====================

    #[test]
    fn test_number_operators() {
        for op in [">", ">=", "<", "<="] {
            let f = compile_one(Condition::dynamic("amount", "number", op, "10")).unwrap();
            let (sql, params) = render(&f);
            assert_eq!(
                sql,
                format!(
                    "(jsonb_typeof((t.items -> 'amount' -> 'value')) = 'number' AND (t.items -> 'amount' -> 'value') {} $1::jsonb)",
                    op
                )
            );
            assert_eq!(params, vec![SqlParam::Json(json!(10.0))]);
        }

        let eq = compile_one(Condition::dynamic("amount", "number", "=", "10")).unwrap();
        assert_eq!(render(&eq).0, "(t.items -> 'amount' -> 'value') = $1::jsonb");
    }

    #[test]
    fn test_ordered_comparison_ignores_other_json_types() {
        // A legacy "" or null in a number field must not satisfy `<`
        let f = compile_one(Condition::dynamic("amount", "number", "<", "5")).unwrap();
        let (sql, _) = render(&f);
        assert!(sql.starts_with("(jsonb_typeof((t.items -> 'amount' -> 'value')) = 'number' AND"));

        let d = compile_one(Condition::dynamic("due", "date", ">", "2024-01-01")).unwrap();
        assert!(render(&d).0.contains("= 'string' AND"));
    }

    #[test]
    fn test_number_malformed_value_defaults_to_zero() {
        let f = compile_one(Condition::dynamic("amount", "number", ">", "abc")).unwrap();
        assert_eq!(render(&f).1, vec![SqlParam::Json(json!(0.0))]);
    }

    #[test]
    fn test_date_range_is_half_open() {
        let f = compile_one(Condition::range("due", "date", "2024-01-01", "2024-02-01")).unwrap();
        let (sql, params) = render(&f);
        assert_eq!(
            sql,
            "((jsonb_typeof((t.items -> 'due' -> 'value')) = 'string' AND (t.items -> 'due' -> 'value') >= $1::jsonb)) \
             AND ((jsonb_typeof((t.items -> 'due' -> 'value')) = 'string' AND (t.items -> 'due' -> 'value') < $2::jsonb))"
        );
        assert_eq!(
            params,
            vec![
                SqlParam::Json(json!("2024-01-01")),
                SqlParam::Json(json!("2024-02-01"))
            ]
        );
    }

    #[test]
    fn test_range_with_open_side() {
        let f = compile_one(Condition::range("amount", "number", "5", "")).unwrap();
        assert!(matches!(&f, Filter::Leaf(p) if matches!(p.test, Test::Gte(_))));
    }

    #[test]
    fn test_empty_date_uses_zero_sentinel() {
        let f = compile_one(Condition::dynamic("due", "date", "=", "")).unwrap();
        assert_eq!(render(&f).1, vec![SqlParam::Json(json!("0001-01-01"))]);
    }

    // ==================== Fixed Columns ====================

    #[test]
    fn test_fixed_status_in() {
        let f = compile_one(Condition::fixed("status", "options", "in", "1,2")).unwrap();
        assert_eq!(render(&f).0, "t.status = ANY($1::text[])");
    }

    #[test]
    fn test_fixed_owners_use_array_operators() {
        let eq = compile_one(Condition::fixed("owners", "group", "=", "g1")).unwrap();
        assert_eq!(render(&eq).0, "$1::text = ANY(t.owners)");
        let any = compile_one(Condition::fixed("owners", "group", "in", "g1,g2")).unwrap();
        assert_eq!(render(&any).0, "t.owners && $1::text[]");
    }

    #[test]
    fn test_fixed_datetime_day_granularity() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let start = day_start(day);
        let next = start + Duration::days(1);

        let eq = compile_one(Condition::fixed("created_at", "datetime", "=", "2024-05-10")).unwrap();
        let (sql, params) = render(&eq);
        assert_eq!(
            sql,
            "(t.created_at >= $1::timestamptz) AND (t.created_at < $2::timestamptz)"
        );
        assert_eq!(params, vec![SqlParam::Time(start), SqlParam::Time(next)]);

        let gt = compile_one(Condition::fixed("created_at", "datetime", ">", "2024-05-10")).unwrap();
        assert_eq!(render(&gt).1, vec![SqlParam::Time(next)]);

        let lte = compile_one(Condition::fixed("updated_at", "datetime", "<=", "2024-05-10")).unwrap();
        assert_eq!(render(&lte).0, "t.updated_at < $1::timestamptz");

        let ne = compile_one(Condition::fixed("created_at", "datetime", "<>", "2024-05-10")).unwrap();
        assert_eq!(
            render(&ne).0,
            "(t.created_at < $1::timestamptz) OR (t.created_at >= $2::timestamptz)"
        );
    }

    #[test]
    fn test_fixed_type_mismatch_is_rejected() {
        let r = compile_conditions(
            &[Condition::fixed("status", "datetime", "=", "2024-01-01")],
            ConditionMode::And,
            false,
        );
        assert!(r.is_err());
        let r = compile_conditions(
            &[Condition::fixed("created_at", "options", "=", "x")],
            ConditionMode::And,
            false,
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_unknown_fixed_column_is_rejected() {
        let r = compile_conditions(
            &[Condition::fixed("password", "text", "=", "x")],
            ConditionMode::And,
            false,
        );
        assert!(matches!(r, Err(DatastoreError::InvalidCondition(_))));
    }

    // ==================== Modes and Unknown Types ====================

    #[test]
    fn test_mode_combines_all_conditions() {
        let conditions = vec![
            Condition::dynamic("a", "text", "=", "1"),
            Condition::dynamic("b", "text", "=", "2"),
        ];
        let and = compile_conditions(&conditions, ConditionMode::And, false)
            .unwrap()
            .unwrap();
        assert!(matches!(&and, Filter::And(c) if c.len() == 2));
        let or = compile_conditions(&conditions, ConditionMode::Or, false)
            .unwrap()
            .unwrap();
        let (sql, _) = render(&or);
        assert_eq!(
            sql,
            "((t.items -> 'a' -> 'value') = $1::jsonb) OR ((t.items -> 'b' -> 'value') = $2::jsonb)"
        );
    }

    #[test]
    fn test_unknown_type_skipped_when_permissive() {
        let conditions = vec![
            Condition::dynamic("a", "txet", "=", "1"),
            Condition::dynamic("b", "text", "=", "2"),
        ];
        let f = compile_conditions(&conditions, ConditionMode::And, false)
            .unwrap()
            .unwrap();
        assert!(matches!(&f, Filter::Leaf(p) if p.target == Target::Field("b".into())));

        let only_unknown = compile_conditions(&conditions[..1], ConditionMode::And, false).unwrap();
        assert!(only_unknown.is_none());
    }

    #[test]
    fn test_unknown_type_rejected_when_strict() {
        let r = compile_conditions(
            &[Condition::dynamic("a", "txet", "=", "1")],
            ConditionMode::And,
            true,
        );
        assert!(matches!(r, Err(DatastoreError::InvalidCondition(_))));
    }

    #[test]
    fn test_dynamic_field_id_is_validated() {
        let r = compile_conditions(
            &[Condition::dynamic("a' OR '1'='1", "text", "=", "1")],
            ConditionMode::And,
            false,
        );
        assert!(r.is_err());
    }

    // ==================== Tree Helpers ====================

    #[test]
    fn test_nested_tree_renders_groups() {
        let tree = Filter::Or(vec![
            Filter::And(vec![
                Filter::field("a", Test::Eq(Operand::Json(json!("1")))),
                Filter::field("b", Test::Eq(Operand::Json(json!("2")))),
            ]),
            Filter::column(FixedColumn::Status, Test::Eq(Operand::Text("9".into()))),
        ]);
        let (sql, params) = render(&tree);
        assert_eq!(
            sql,
            "(((t.items -> 'a' -> 'value') = $1::jsonb) AND ((t.items -> 'b' -> 'value') = $2::jsonb)) OR (t.status = $3::text)"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_empty_groups() {
        assert_eq!(render(&Filter::And(vec![])).0, "TRUE");
        assert_eq!(render(&Filter::Or(vec![])).0, "FALSE");
    }

    #[test]
    fn test_targets_dedup_in_order() {
        let tree = Filter::And(vec![
            Filter::field("b", Test::NonEmptyList),
            Filter::field("a", Test::NonEmptyList),
            Filter::field("b", Test::EmptyList),
            Filter::leaf(
                Target::Concat {
                    fields: vec!["a".into(), "c".into()],
                    connector: "-".into(),
                },
                Test::Eq(Operand::Text("x".into())),
            ),
        ]);
        assert_eq!(
            tree.targets(),
            vec![
                Target::Field("b".into()),
                Target::Field("a".into()),
                Target::Field("c".into())
            ]
        );
    }

    #[test]
    fn test_concat_scan_render() {
        let f = Filter::leaf(
            Target::Concat {
                fields: vec!["a".into(), "b".into()],
                connector: "-".into(),
            },
            Test::Eq(Operand::Text("x-y".into())),
        );
        assert_eq!(
            render(&f).0,
            "concat_ws('-', (t.items -> 'a' ->> 'value'), (t.items -> 'b' ->> 'value')) = $1::text"
        );
    }

    #[test]
    fn test_filter_serde_round_trip() {
        let tree = Filter::And(vec![Filter::field("a", Test::In(vec!["x".into()]))]);
        let json = serde_json::to_string(&tree).unwrap();
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }
}
