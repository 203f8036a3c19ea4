//! Formula expressions for `function` fields
//!
//! A formula is a JSON expression tree in the operator style of document-store
//! aggregation (`{"$cond": {...}}`, `{"$add": [...]}`, `"$items.<id>.value"`).
//! It is parsed once, type-checked against the field's return type, and
//! rendered to a SQL expression yielding JSONB.

use serde_json::{Map, Value as Json};

use crate::error::{DatastoreError, Result};
use crate::sql::params::SqlParams;
use crate::sql::sanitize::{validate_key, value_path};
use crate::types::{DataType, PayloadKind};

const FIELD_PREFIX: &str = "$items.";
const FIELD_SUFFIX: &str = ".value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }
}

/// Parsed formula expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    Literal(Json),
    Concat(Vec<Expr>),
    Arith(ArithOp, Vec<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// `CASE WHEN .. THEN .. ELSE default END`
    Cond {
        branches: Vec<(Expr, Expr)>,
        default: Box<Expr>,
    },
    IfNull(Box<Expr>, Box<Expr>),
}

/// Parse a formula; an empty or blank formula yields `None`
pub fn parse_formula(formula: &str) -> Result<Option<Expr>> {
    if formula.trim().is_empty() {
        return Ok(None);
    }
    let json: Json = serde_json::from_str(formula)
        .map_err(|e| DatastoreError::invalid_formula(format!("not valid JSON: {}", e)))?;
    parse_expr(&json).map(Some)
}

fn parse_expr(json: &Json) -> Result<Expr> {
    match json {
        Json::String(s) if s.starts_with('$') => parse_field_ref(s),
        Json::Object(map) => parse_operator(map),
        Json::Array(_) => Err(DatastoreError::invalid_formula(
            "arrays are only allowed as operator arguments",
        )),
        literal => Ok(Expr::Literal(literal.clone())),
    }
}

fn parse_field_ref(s: &str) -> Result<Expr> {
    let field_id = s
        .strip_prefix(FIELD_PREFIX)
        .and_then(|rest| rest.strip_suffix(FIELD_SUFFIX))
        .ok_or_else(|| {
            DatastoreError::invalid_formula(format!(
                "field reference '{}' must look like $items.<id>.value",
                s
            ))
        })?;
    validate_key(field_id).map_err(DatastoreError::invalid_formula)?;
    Ok(Expr::Field(field_id.to_string()))
}

fn parse_operator(map: &Map<String, Json>) -> Result<Expr> {
    let mut entries = map.iter();
    let (op, arg) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(DatastoreError::invalid_formula(
                "an operator object must have exactly one key",
            ));
        }
    };

    match op.as_str() {
        "$concat" => Ok(Expr::Concat(parse_args(op, arg, 1)?)),
        "$add" => Ok(Expr::Arith(ArithOp::Add, parse_args(op, arg, 2)?)),
        "$multiply" => Ok(Expr::Arith(ArithOp::Multiply, parse_args(op, arg, 2)?)),
        "$subtract" => Ok(Expr::Arith(ArithOp::Subtract, parse_exact(op, arg, 2)?)),
        "$divide" => Ok(Expr::Arith(ArithOp::Divide, parse_exact(op, arg, 2)?)),
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let cmp = match op.as_str() {
                "$eq" => CmpOp::Eq,
                "$ne" => CmpOp::Ne,
                "$gt" => CmpOp::Gt,
                "$gte" => CmpOp::Gte,
                "$lt" => CmpOp::Lt,
                _ => CmpOp::Lte,
            };
            let mut args = parse_exact(op, arg, 2)?.into_iter();
            match (args.next(), args.next()) {
                (Some(a), Some(b)) => Ok(Expr::Compare(cmp, Box::new(a), Box::new(b))),
                _ => Err(DatastoreError::invalid_formula(format!("{} needs 2 arguments", op))),
            }
        }
        "$and" => Ok(Expr::And(parse_args(op, arg, 1)?)),
        "$or" => Ok(Expr::Or(parse_args(op, arg, 1)?)),
        "$not" => {
            let inner = match arg {
                Json::Array(items) if items.len() == 1 => parse_expr(&items[0])?,
                Json::Array(_) => {
                    return Err(DatastoreError::invalid_formula("$not takes one argument"));
                }
                other => parse_expr(other)?,
            };
            Ok(Expr::Not(Box::new(inner)))
        }
        "$ifNull" => {
            let mut args = parse_exact(op, arg, 2)?.into_iter();
            match (args.next(), args.next()) {
                (Some(a), Some(b)) => Ok(Expr::IfNull(Box::new(a), Box::new(b))),
                _ => Err(DatastoreError::invalid_formula("$ifNull needs 2 arguments")),
            }
        }
        "$cond" => parse_cond(arg),
        "$switch" => parse_switch(arg),
        other => Err(DatastoreError::invalid_formula(format!(
            "unknown operator '{}'",
            other
        ))),
    }
}

fn parse_args(op: &str, arg: &Json, min: usize) -> Result<Vec<Expr>> {
    let items = arg.as_array().ok_or_else(|| {
        DatastoreError::invalid_formula(format!("{} expects an argument array", op))
    })?;
    if items.len() < min {
        return Err(DatastoreError::invalid_formula(format!(
            "{} needs at least {} arguments",
            op, min
        )));
    }
    items.iter().map(parse_expr).collect()
}

fn parse_exact(op: &str, arg: &Json, n: usize) -> Result<Vec<Expr>> {
    let args = parse_args(op, arg, n)?;
    if args.len() != n {
        return Err(DatastoreError::invalid_formula(format!(
            "{} needs exactly {} arguments",
            op, n
        )));
    }
    Ok(args)
}

fn parse_cond(arg: &Json) -> Result<Expr> {
    let (cond, then, otherwise) = match arg {
        Json::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Json::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
            (Some(c), Some(t), Some(e)) => (c, t, e),
            _ => return Err(DatastoreError::invalid_formula("$cond needs if, then and else")),
        },
        _ => return Err(DatastoreError::invalid_formula("$cond needs if, then and else")),
    };
    Ok(Expr::Cond {
        branches: vec![(parse_expr(cond)?, parse_expr(then)?)],
        default: Box::new(parse_expr(otherwise)?),
    })
}

fn parse_switch(arg: &Json) -> Result<Expr> {
    let branches = arg
        .get("branches")
        .and_then(Json::as_array)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| DatastoreError::invalid_formula("$switch needs a non-empty branches array"))?;
    let branches = branches
        .iter()
        .map(|b| match (b.get("case"), b.get("then")) {
            (Some(c), Some(t)) => Ok((parse_expr(c)?, parse_expr(t)?)),
            _ => Err(DatastoreError::invalid_formula(
                "each $switch branch needs case and then",
            )),
        })
        .collect::<Result<Vec<_>>>()?;
    let default = match arg.get("default") {
        Some(d) => parse_expr(d)?,
        None => Expr::Literal(Json::Null),
    };
    Ok(Expr::Cond {
        branches,
        default: Box::new(default),
    })
}

impl Expr {
    /// Field ids referenced anywhere in the expression
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field(f) => {
                if !out.contains(&f.as_str()) {
                    out.push(f);
                }
            }
            Expr::Literal(_) => {}
            Expr::Concat(xs) | Expr::Arith(_, xs) | Expr::And(xs) | Expr::Or(xs) => {
                xs.iter().for_each(|x| x.collect_fields(out));
            }
            Expr::Compare(_, a, b) | Expr::IfNull(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Expr::Not(x) => x.collect_fields(out),
            Expr::Cond { branches, default } => {
                for (c, t) in branches {
                    c.collect_fields(out);
                    t.collect_fields(out);
                }
                default.collect_fields(out);
            }
        }
    }

    /// Statically known payload kind of the result, if any
    pub fn result_kind(&self, field_type: &dyn Fn(&str) -> Option<DataType>) -> Option<PayloadKind> {
        match self {
            Expr::Field(f) => field_type(f).map(|dt| dt.payload_kind()),
            Expr::Literal(Json::String(_)) => Some(PayloadKind::Text),
            Expr::Literal(Json::Number(_)) => Some(PayloadKind::Number),
            Expr::Literal(Json::Bool(_)) => Some(PayloadKind::Switch),
            Expr::Literal(_) => None,
            Expr::Concat(_) => Some(PayloadKind::Text),
            Expr::Arith(..) => Some(PayloadKind::Number),
            Expr::Compare(..) | Expr::And(_) | Expr::Or(_) | Expr::Not(_) => {
                Some(PayloadKind::Switch)
            }
            Expr::IfNull(a, b) => a.result_kind(field_type).or_else(|| b.result_kind(field_type)),
            Expr::Cond { branches, default } => {
                let mut kinds = branches
                    .iter()
                    .map(|(_, t)| t)
                    .chain(std::iter::once(default.as_ref()))
                    .filter_map(|e| e.result_kind(field_type));
                let first = kinds.next()?;
                kinds.all(|k| k == first).then_some(first)
            }
        }
    }

    fn is_boolean(&self) -> bool {
        matches!(
            self,
            Expr::Compare(..) | Expr::And(_) | Expr::Or(_) | Expr::Not(_)
        )
    }

    /// Render as a SQL expression of type JSONB
    pub fn render_value(&self, alias: &str, params: &mut SqlParams) -> String {
        match self {
            Expr::Field(f) => value_path(alias, f),
            Expr::Literal(v) => params.json(v.clone()),
            Expr::Concat(xs) => {
                let parts: Vec<String> = xs
                    .iter()
                    .map(|x| format!("({} #>> '{{}}')", x.render_value(alias, params)))
                    .collect();
                format!("to_jsonb(concat({}))", parts.join(", "))
            }
            Expr::Arith(op, xs) => {
                let nums: Vec<String> = xs
                    .iter()
                    .map(|x| numeric(&x.render_value(alias, params)))
                    .collect();
                let body = match op {
                    ArithOp::Add => nums.join(" + "),
                    ArithOp::Multiply => nums.join(" * "),
                    ArithOp::Subtract => nums.join(" - "),
                    ArithOp::Divide => match nums.as_slice() {
                        [a, b] => format!("{} / NULLIF({}, 0)", a, b),
                        _ => nums.join(" / "),
                    },
                };
                format!("to_jsonb({})", body)
            }
            Expr::Compare(..) | Expr::And(_) | Expr::Or(_) | Expr::Not(_) => {
                format!("to_jsonb({})", self.render_bool(alias, params))
            }
            Expr::IfNull(a, b) => format!(
                "COALESCE(NULLIF({}, 'null'::jsonb), {})",
                a.render_value(alias, params),
                b.render_value(alias, params)
            ),
            Expr::Cond { branches, default } => {
                let mut sql = String::from("CASE");
                for (cond, then) in branches {
                    let c = cond.render_bool(alias, params);
                    let t = then.render_value(alias, params);
                    sql.push_str(&format!(" WHEN {} THEN {}", c, t));
                }
                sql.push_str(&format!(" ELSE {} END", default.render_value(alias, params)));
                sql
            }
        }
    }

    /// Render as a SQL boolean expression
    pub fn render_bool(&self, alias: &str, params: &mut SqlParams) -> String {
        match self {
            Expr::Compare(op, a, b) => format!(
                "COALESCE({} {} {}, FALSE)",
                a.render_value(alias, params),
                op.sql(),
                b.render_value(alias, params)
            ),
            Expr::And(xs) => {
                let parts: Vec<String> = xs
                    .iter()
                    .map(|x| format!("({})", x.render_bool(alias, params)))
                    .collect();
                parts.join(" AND ")
            }
            Expr::Or(xs) => {
                let parts: Vec<String> = xs
                    .iter()
                    .map(|x| format!("({})", x.render_bool(alias, params)))
                    .collect();
                parts.join(" OR ")
            }
            Expr::Not(x) => format!("NOT ({})", x.render_bool(alias, params)),
            other if other.is_boolean() => other.render_bool(alias, params),
            other => format!(
                "COALESCE({} = 'true'::jsonb, FALSE)",
                other.render_value(alias, params)
            ),
        }
    }
}

fn numeric(jsonb: &str) -> String {
    format!(
        "(CASE WHEN jsonb_typeof({0}) = 'number' THEN ({0})::numeric ELSE 0 END)",
        jsonb
    )
}

/// Check a function field's formula against its return type and schema
pub fn validate_formula(
    formula: &str,
    return_type: Option<DataType>,
    field_type: &dyn Fn(&str) -> Option<DataType>,
) -> Result<Option<Expr>> {
    let Some(expr) = parse_formula(formula)? else {
        return Ok(None);
    };
    for field in expr.fields() {
        if field_type(field).is_none() {
            return Err(DatastoreError::validation(format!(
                "formula references unknown field '{}'",
                field
            )));
        }
    }
    if let (Some(expected), Some(actual)) = (return_type, expr.result_kind(field_type)) {
        if expected.payload_kind() != actual {
            return Err(DatastoreError::validation(format!(
                "formula result type mismatch: return type '{}' but formula yields {:?}",
                expected, actual
            )));
        }
    }
    Ok(Some(expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(f: &str) -> Option<DataType> {
        match f {
            "price" | "qty" => Some(DataType::Number),
            "name" | "status" => Some(DataType::Text),
            _ => None,
        }
    }

    #[test]
    fn test_empty_formula() {
        assert_eq!(parse_formula("").unwrap(), None);
        assert_eq!(parse_formula("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_field_reference() {
        let e = parse_formula(r#""$items.price.value""#).unwrap().unwrap();
        assert_eq!(e, Expr::Field("price".into()));
        assert!(parse_formula(r#""$items.price""#).is_err());
        assert!(parse_formula(r#""$items.a'b.value""#).is_err());
    }

    #[test]
    fn test_parse_nested_cond() {
        let formula = json!({
            "$cond": {
                "if": {"$gt": ["$items.qty.value", 10]},
                "then": "bulk",
                "else": {"$cond": [{"$eq": ["$items.qty.value", 0]}, "none", "few"]}
            }
        })
        .to_string();
        let e = parse_formula(&formula).unwrap().unwrap();
        match e {
            Expr::Cond { branches, default } => {
                assert_eq!(branches.len(), 1);
                assert!(matches!(*default, Expr::Cond { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_switch() {
        let formula = json!({
            "$switch": {
                "branches": [
                    {"case": {"$eq": ["$items.status.value", "a"]}, "then": "A"},
                    {"case": {"$eq": ["$items.status.value", "b"]}, "then": "B"}
                ],
                "default": "?"
            }
        })
        .to_string();
        let e = parse_formula(&formula).unwrap().unwrap();
        assert!(matches!(e, Expr::Cond { ref branches, .. } if branches.len() == 2));
        assert_eq!(e.fields(), vec!["status"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_formula("{not json").is_err());
        assert!(parse_formula(r#"{"$add": [1]}"#).is_err());
        assert!(parse_formula(r#"{"$subtract": [1, 2, 3]}"#).is_err());
        assert!(parse_formula(r#"{"$pow": [1, 2]}"#).is_err());
        assert!(parse_formula(r#"{"$add": [1, 2], "$concat": ["a"]}"#).is_err());
        assert!(parse_formula(r#"{"$cond": {"if": true}}"#).is_err());
        assert!(parse_formula("[1, 2]").is_err());
    }

    #[test]
    fn test_result_kinds() {
        let add = parse_formula(r#"{"$multiply": ["$items.price.value", "$items.qty.value"]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(add.result_kind(&schema), Some(PayloadKind::Number));

        let concat = parse_formula(r#"{"$concat": ["$items.name.value", "-x"]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(concat.result_kind(&schema), Some(PayloadKind::Text));

        let mixed = parse_formula(r#"{"$cond": [true, "a", 1]}"#).unwrap().unwrap();
        assert_eq!(mixed.result_kind(&schema), None);
    }

    #[test]
    fn test_validate_formula_type_mismatch() {
        let formula = r#"{"$concat": ["$items.name.value", "!"]}"#;
        assert!(validate_formula(formula, Some(DataType::Text), &schema).is_ok());
        let err = validate_formula(formula, Some(DataType::Number), &schema).unwrap_err();
        assert!(err.to_string().contains("formula result type mismatch"));
    }

    #[test]
    fn test_validate_formula_unknown_field() {
        let formula = r#"{"$add": ["$items.ghost.value", 1]}"#;
        assert!(validate_formula(formula, Some(DataType::Number), &schema).is_err());
    }

    #[test]
    fn test_render_arithmetic() {
        let e = parse_formula(r#"{"$divide": ["$items.price.value", 2]}"#)
            .unwrap()
            .unwrap();
        let mut params = SqlParams::new();
        let sql = e.render_value("p", &mut params);
        assert_eq!(
            sql,
            "to_jsonb((CASE WHEN jsonb_typeof((p.items -> 'price' -> 'value')) = 'number' THEN ((p.items -> 'price' -> 'value'))::numeric ELSE 0 END) / NULLIF((CASE WHEN jsonb_typeof($1::jsonb) = 'number' THEN ($1::jsonb)::numeric ELSE 0 END), 0))"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_render_cond_and_concat() {
        let e = parse_formula(
            r#"{"$cond": [{"$gte": ["$items.qty.value", 10]}, {"$concat": ["$items.name.value", "+"]}, ""]}"#,
        )
        .unwrap()
        .unwrap();
        let mut params = SqlParams::new();
        let sql = e.render_value("p", &mut params);
        assert_eq!(
            sql,
            "CASE WHEN COALESCE((p.items -> 'qty' -> 'value') >= $1::jsonb, FALSE) THEN to_jsonb(concat(((p.items -> 'name' -> 'value') #>> '{}'), ($2::jsonb #>> '{}'))) ELSE $3::jsonb END"
        );
    }

    #[test]
    fn test_render_boolean_as_value() {
        let e = parse_formula(r#"{"$not": {"$eq": ["$items.name.value", "x"]}}"#)
            .unwrap()
            .unwrap();
        let mut params = SqlParams::new();
        assert_eq!(
            e.render_value("p", &mut params),
            "to_jsonb(NOT (COALESCE((p.items -> 'name' -> 'value') = $1::jsonb, FALSE)))"
        );
    }
}
