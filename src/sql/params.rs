//! Positional parameter collection for generated SQL

use chrono::{DateTime, Utc};
use sqlx::Arguments;
use sqlx::postgres::PgArguments;

/// A value bound to a `$n` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Json(serde_json::Value),
    Text(String),
    TextList(Vec<String>),
    Int(i64),
    Time(DateTime<Utc>),
}

/// Collects parameters while SQL text is generated
///
/// Each `push` returns the placeholder, already cast to the parameter's type.
#[derive(Debug, Default, Clone)]
pub struct SqlParams {
    values: Vec<SqlParam>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, param: SqlParam) -> String {
        let cast = match &param {
            SqlParam::Json(_) => "jsonb",
            SqlParam::Text(_) => "text",
            SqlParam::TextList(_) => "text[]",
            SqlParam::Int(_) => "bigint",
            SqlParam::Time(_) => "timestamptz",
        };
        self.values.push(param);
        format!("${}::{}", self.values.len(), cast)
    }

    pub fn json(&mut self, value: serde_json::Value) -> String {
        self.push(SqlParam::Json(value))
    }

    pub fn text(&mut self, value: impl Into<String>) -> String {
        self.push(SqlParam::Text(value.into()))
    }

    pub fn text_list(&mut self, values: Vec<String>) -> String {
        self.push(SqlParam::TextList(values))
    }

    pub fn int(&mut self, value: i64) -> String {
        self.push(SqlParam::Int(value))
    }

    pub fn time(&mut self, value: DateTime<Utc>) -> String {
        self.push(SqlParam::Time(value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SqlParam] {
        &self.values
    }

    /// Encode into arguments for `sqlx::query_with` and friends
    pub fn into_arguments(self) -> Result<PgArguments, sqlx::Error> {
        let mut args = PgArguments::default();
        for value in self.values {
            match value {
                SqlParam::Json(v) => args.add(v),
                SqlParam::Text(v) => args.add(v),
                SqlParam::TextList(v) => args.add(v),
                SqlParam::Int(v) => args.add(v),
                SqlParam::Time(v) => args.add(v),
            }
            .map_err(sqlx::Error::Encode)?;
        }
        Ok(args)
    }
}
