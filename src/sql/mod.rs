//! SQL generation for the datastore engine
//!
//! Condition compilation, formula rendering, staged read queries, DDL and
//! identifier sanitization.

pub mod condition;
pub mod ddl;
pub mod formula;
pub mod params;
pub mod pipeline;
pub mod sanitize;

pub use condition::{Filter, FixedColumn, Operand, Target, Test, compile_conditions};
pub use ddl::DdlGenerator;
pub use params::SqlParams;
pub use pipeline::{PipelineAssembler, QueryPlan};
pub use sanitize::{POSTGRES_RESERVED_WORDS, quote_identifier, validate_identifier};
