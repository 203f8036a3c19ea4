//! Value codec
//!
//! Every field value is a `(DataType, Payload)` pair. Conversions between the
//! wire form (strings), the stored form (JSON under `items.<id>`) and the typed
//! payload go through the per-type [`Codec`] returned by [`DataType::codec`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DatastoreError, Result};

/// Stored and wire date format
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Stored rendering of the zero date
pub const ZERO_DATE_STR: &str = "0001-01-01";

/// The zero-date sentinel used for absent dates
pub fn zero_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or_default()
}

// ============================================================================
// Data types
// ============================================================================

/// Field kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Textarea,
    Number,
    Date,
    Time,
    /// Boolean
    Switch,
    /// Reference into an option group
    Options,
    /// List of user ids
    User,
    /// List of `{name, url}` attachments
    File,
    /// Value copied from another datastore
    Lookup,
    /// Computed by a formula on read
    Function,
    /// Sequence-backed number
    Autonum,
}

/// Shape of the payload carried by a data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Number,
    Date,
    Switch,
    Users,
    Files,
}

impl DataType {
    pub const ALL: [DataType; 12] = [
        DataType::Text,
        DataType::Textarea,
        DataType::Number,
        DataType::Date,
        DataType::Time,
        DataType::Switch,
        DataType::Options,
        DataType::User,
        DataType::File,
        DataType::Lookup,
        DataType::Function,
        DataType::Autonum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Textarea => "textarea",
            DataType::Number => "number",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::Switch => "switch",
            DataType::Options => "options",
            DataType::User => "user",
            DataType::File => "file",
            DataType::Lookup => "lookup",
            DataType::Function => "function",
            DataType::Autonum => "autonum",
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.codec().kind
    }

    /// The conversion table entry for this type
    pub fn codec(&self) -> &'static Codec {
        match self {
            DataType::Text
            | DataType::Textarea
            | DataType::Time
            | DataType::Options
            | DataType::Lookup
            | DataType::Function
            | DataType::Autonum => &TEXT_CODEC,
            DataType::Number => &NUMBER_CODEC,
            DataType::Date => &DATE_CODEC,
            DataType::Switch => &SWITCH_CODEC,
            DataType::User => &USER_CODEC,
            DataType::File => &FILE_CODEC,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = DatastoreError;

    fn from_str(s: &str) -> Result<Self> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| DatastoreError::validation(format!("unknown data type '{}'", s)))
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// An attachment reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub url: String,
}

/// Typed value content
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Switch(bool),
    Users(Vec<String>),
    Files(Vec<FileRef>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::Number(_) => PayloadKind::Number,
            Payload::Date(_) => PayloadKind::Date,
            Payload::Switch(_) => PayloadKind::Switch,
            Payload::Users(_) => PayloadKind::Users,
            Payload::Files(_) => PayloadKind::Files,
        }
    }
}

// ============================================================================
// Codec table
// ============================================================================

/// Conversion, comparison and default functions for one payload kind
pub struct Codec {
    pub kind: PayloadKind,
    /// Wire string to payload; malformed input falls back to the empty payload
    pub decode: fn(&str) -> Payload,
    /// Wire string to payload; malformed input is an error
    pub decode_strict: fn(&str) -> std::result::Result<Payload, String>,
    /// Payload to wire string
    pub encode: fn(&Payload) -> String,
    /// Stored JSON to payload, tolerant of historical data
    pub from_stored: fn(&serde_json::Value) -> Payload,
    /// Payload to stored JSON
    pub to_stored: fn(&Payload) -> serde_json::Value,
    pub empty: fn() -> Payload,
    pub is_empty: fn(&Payload) -> bool,
    /// Typed equality used by the history differ
    pub equal: fn(&Payload, &Payload) -> bool,
    /// Human-readable rendering without label resolution
    pub display: fn(&Payload) -> String,
}

static TEXT_CODEC: Codec = Codec {
    kind: PayloadKind::Text,
    decode: |s| Payload::Text(s.to_string()),
    decode_strict: |s| Ok(Payload::Text(s.to_string())),
    encode: encode_text,
    from_stored: |v| Payload::Text(json_to_text(v)),
    to_stored: |p| serde_json::Value::String(encode_text(p)),
    empty: || Payload::Text(String::new()),
    is_empty: |p| matches!(p, Payload::Text(s) if s.is_empty()),
    equal: |a, b| encode_text(a) == encode_text(b),
    display: encode_text,
};

static NUMBER_CODEC: Codec = Codec {
    kind: PayloadKind::Number,
    decode: |s| Payload::Number(s.trim().parse().unwrap_or(0.0)),
    decode_strict: |s| {
        s.trim()
            .parse::<f64>()
            .map(Payload::Number)
            .map_err(|_| format!("'{}' is not a number", s))
    },
    encode: |p| format_number(as_number(p)),
    from_stored: |v| Payload::Number(json_to_number(v)),
    to_stored: |p| {
        serde_json::Number::from_f64(as_number(p))
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::from(0))
    },
    empty: || Payload::Number(0.0),
    is_empty: |_| false,
    equal: |a, b| as_number(a) == as_number(b),
    display: |p| format_number(as_number(p)),
};

static DATE_CODEC: Codec = Codec {
    kind: PayloadKind::Date,
    decode: |s| Payload::Date(parse_date(s).unwrap_or_else(zero_date)),
    decode_strict: |s| {
        if s.trim().is_empty() {
            return Ok(Payload::Date(zero_date()));
        }
        parse_date(s)
            .map(Payload::Date)
            .ok_or_else(|| format!("'{}' is not a date", s))
    },
    encode: display_date,
    from_stored: |v| {
        Payload::Date(
            v.as_str()
                .and_then(parse_date)
                .unwrap_or_else(zero_date),
        )
    },
    to_stored: |p| serde_json::Value::String(as_date(p).format(DATE_FORMAT).to_string()),
    empty: || Payload::Date(zero_date()),
    is_empty: |p| as_date(p) == zero_date(),
    equal: |a, b| as_date(a) == as_date(b),
    display: display_date,
};

static SWITCH_CODEC: Codec = Codec {
    kind: PayloadKind::Switch,
    decode: |s| Payload::Switch(parse_bool(s).unwrap_or(false)),
    decode_strict: |s| {
        parse_bool(s)
            .map(Payload::Switch)
            .ok_or_else(|| format!("'{}' is not a boolean", s))
    },
    encode: |p| as_bool(p).to_string(),
    from_stored: |v| match v {
        serde_json::Value::Bool(b) => Payload::Switch(*b),
        serde_json::Value::String(s) => Payload::Switch(parse_bool(s).unwrap_or(false)),
        _ => Payload::Switch(false),
    },
    to_stored: |p| serde_json::Value::Bool(as_bool(p)),
    empty: || Payload::Switch(false),
    is_empty: |_| false,
    equal: |a, b| as_bool(a) == as_bool(b),
    display: |p| as_bool(p).to_string(),
};

static USER_CODEC: Codec = Codec {
    kind: PayloadKind::Users,
    decode: |s| Payload::Users(split_users(s)),
    decode_strict: |s| Ok(Payload::Users(split_users(s))),
    encode: |p| as_users(p).join(","),
    from_stored: |v| match v {
        serde_json::Value::Array(items) => Payload::Users(
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
        ),
        serde_json::Value::String(s) => Payload::Users(split_users(s)),
        _ => Payload::Users(Vec::new()),
    },
    to_stored: |p| serde_json::Value::from(as_users(p).to_vec()),
    empty: || Payload::Users(Vec::new()),
    is_empty: |p| {
        let users = as_users(p);
        users.is_empty() || (users.len() == 1 && users[0].is_empty())
    },
    equal: |a, b| {
        let a: BTreeSet<&String> = as_users(a).iter().collect();
        let b: BTreeSet<&String> = as_users(b).iter().collect();
        a == b
    },
    display: |p| as_users(p).join(","),
};

static FILE_CODEC: Codec = Codec {
    kind: PayloadKind::Files,
    decode: |s| Payload::Files(parse_files(s).unwrap_or_default()),
    decode_strict: |s| {
        if s.trim().is_empty() {
            return Ok(Payload::Files(Vec::new()));
        }
        parse_files(s)
            .map(Payload::Files)
            .ok_or_else(|| format!("'{}' is not a file list", s))
    },
    encode: |p| serde_json::to_string(as_files(p)).unwrap_or_else(|_| "[]".to_string()),
    from_stored: |v| match v {
        serde_json::Value::String(s) => Payload::Files(parse_files(s).unwrap_or_default()),
        other => Payload::Files(serde_json::from_value(other.clone()).unwrap_or_default()),
    },
    to_stored: |p| serde_json::to_value(as_files(p)).unwrap_or_else(|_| serde_json::json!([])),
    empty: || Payload::Files(Vec::new()),
    is_empty: |_| false,
    equal: |a, b| {
        let a: BTreeSet<&FileRef> = as_files(a).iter().collect();
        let b: BTreeSet<&FileRef> = as_files(b).iter().collect();
        a == b
    },
    display: |p| {
        as_files(p)
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    },
};

// Accessors used by the codec table. A payload of the wrong kind reads as the
// kind's empty value, so a codec never panics on mismatched input.

fn as_number(p: &Payload) -> f64 {
    match p {
        Payload::Number(n) => *n,
        Payload::Text(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn as_date(p: &Payload) -> NaiveDate {
    match p {
        Payload::Date(d) => *d,
        Payload::Text(s) => parse_date(s).unwrap_or_else(zero_date),
        _ => zero_date(),
    }
}

fn as_bool(p: &Payload) -> bool {
    match p {
        Payload::Switch(b) => *b,
        Payload::Text(s) => parse_bool(s).unwrap_or(false),
        _ => false,
    }
}

fn as_users(p: &Payload) -> &[String] {
    match p {
        Payload::Users(u) => u,
        _ => &[],
    }
}

fn as_files(p: &Payload) -> &[FileRef] {
    match p {
        Payload::Files(f) => f,
        _ => &[],
    }
}

fn encode_text(p: &Payload) -> String {
    match p {
        Payload::Text(s) => s.clone(),
        Payload::Number(n) => format_number(*n),
        Payload::Date(_) => display_date(p),
        Payload::Switch(b) => b.to_string(),
        Payload::Users(u) => u.join(","),
        Payload::Files(f) => serde_json::to_string(f).unwrap_or_default(),
    }
}

fn display_date(p: &Payload) -> String {
    let d = as_date(p);
    if d == zero_date() {
        String::new()
    } else {
        d.format(DATE_FORMAT).to_string()
    }
}

fn json_to_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_number(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Render a number without a trailing `.0` for integral values
pub fn format_number(n: f64) -> String {
    format!("{}", n)
}

/// Parse a date in `YYYY-MM-DD`, `YYYY/MM/DD` or RFC 3339 form
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn split_users(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_files(s: &str) -> Option<Vec<FileRef>> {
    if s.trim().is_empty() {
        return Some(Vec::new());
    }
    serde_json::from_str(s).ok()
}

/// Round a number to `precision` fractional digits using decimal arithmetic
pub fn round_number(n: f64, precision: u32) -> f64 {
    Decimal::from_f64(n)
        .map(|d| d.round_dp(precision))
        .and_then(|d| d.to_f64())
        .unwrap_or(n)
}

/// Add two numbers in decimal arithmetic so `0.1 + 0.2` stays `0.3`
pub fn decimal_add(a: f64, b: f64) -> f64 {
    match (Decimal::from_f64(a), Decimal::from_f64(b)) {
        (Some(x), Some(y)) => x
            .checked_add(y)
            .and_then(|sum| sum.to_f64())
            .unwrap_or(a + b),
        _ => a + b,
    }
}

// ============================================================================
// Value
// ============================================================================

/// A typed field value whose payload always matches its data type
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    data_type: DataType,
    payload: Payload,
}

impl Value {
    /// Pair a data type with a payload, rejecting mismatched shapes
    pub fn new(data_type: DataType, payload: Payload) -> Result<Self> {
        if data_type.payload_kind() != payload.kind() {
            return Err(DatastoreError::validation(format!(
                "payload {:?} does not match data type '{}'",
                payload.kind(),
                data_type
            )));
        }
        Ok(Self { data_type, payload })
    }

    pub fn text(data_type: DataType, s: impl Into<String>) -> Self {
        let s = s.into();
        match data_type.payload_kind() {
            PayloadKind::Text => Self {
                data_type,
                payload: Payload::Text(s),
            },
            _ => Self::from_wire(data_type, &s),
        }
    }

    pub fn number(n: f64) -> Self {
        Self {
            data_type: DataType::Number,
            payload: Payload::Number(n),
        }
    }

    pub fn date(d: NaiveDate) -> Self {
        Self {
            data_type: DataType::Date,
            payload: Payload::Date(d),
        }
    }

    pub fn switch(b: bool) -> Self {
        Self {
            data_type: DataType::Switch,
            payload: Payload::Switch(b),
        }
    }

    pub fn users<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self {
            data_type: DataType::User,
            payload: Payload::Users(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn files(files: Vec<FileRef>) -> Self {
        Self {
            data_type: DataType::File,
            payload: Payload::Files(files),
        }
    }

    /// The empty value of a data type
    pub fn empty(data_type: DataType) -> Self {
        Self {
            data_type,
            payload: (data_type.codec().empty)(),
        }
    }

    /// Decode a wire string, defaulting malformed numbers and dates to zero values
    pub fn from_wire(data_type: DataType, s: &str) -> Self {
        Self {
            data_type,
            payload: (data_type.codec().decode)(s),
        }
    }

    /// Decode a wire string, failing on malformed input
    pub fn from_wire_strict(data_type: DataType, s: &str) -> Result<Self> {
        let payload = (data_type.codec().decode_strict)(s).map_err(DatastoreError::validation)?;
        Ok(Self { data_type, payload })
    }

    /// Decode the stored `{data_type, value}` shape
    ///
    /// Unknown or missing `data_type` tags read as text so old rows stay readable.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let data_type = json
            .get("data_type")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse().ok())
            .unwrap_or(DataType::Text);
        let raw = json.get("value").unwrap_or(&serde_json::Value::Null);
        Self {
            data_type,
            payload: (data_type.codec().from_stored)(raw),
        }
    }

    /// Encode to the stored `{data_type, value}` shape
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "data_type": self.data_type.as_str(),
            "value": self.stored_value(),
        })
    }

    /// Encode only the stored value
    pub fn stored_value(&self) -> serde_json::Value {
        (self.data_type.codec().to_stored)(&self.payload)
    }

    pub fn to_wire(&self) -> String {
        (self.data_type.codec().encode)(&self.payload)
    }

    pub fn display(&self) -> String {
        (self.data_type.codec().display)(&self.payload)
    }

    pub fn is_empty(&self) -> bool {
        (self.data_type.codec().is_empty)(&self.payload)
    }

    /// Typed equality; values of different data types are never equal
    pub fn same_as(&self, other: &Value) -> bool {
        self.data_type.payload_kind() == other.data_type.payload_kind()
            && (self.data_type.codec().equal)(&self.payload, &other.payload)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_f64(&self) -> f64 {
        as_number(&self.payload)
    }

    pub fn as_users(&self) -> &[String] {
        as_users(&self.payload)
    }

    pub fn as_files(&self) -> &[FileRef] {
        as_files(&self.payload)
    }

    /// Retag a value under another data type of the same payload kind
    pub fn with_data_type(self, data_type: DataType) -> Result<Self> {
        Self::new(data_type, self.payload)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if !raw.is_object() {
            return Err(D::Error::custom("value must be a {data_type, value} object"));
        }
        Ok(Value::from_json(&raw))
    }
}
