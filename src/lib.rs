//! # datastore-engine
//!
//! A dynamic-schema datastore engine over PostgreSQL.
//!
//! Datastores are logical tables whose field schema changes at runtime. Each
//! record keeps its field values in a JSONB `items` object of
//! `{"<field>": {"data_type": .., "value": ..}}` entries, so adding or removing
//! a field never rewrites a table definition.
//!
//! ## Features
//!
//! - **Typed Values**: One codec table per data type for wire, stored and display forms
//! - **Condition Compiler**: Flat condition lists and arbitrary AND/OR predicate trees
//! - **Staged Reads**: Paging, relation joins, user/option labels and computed fields in one query
//! - **Index Lifecycle**: Query-shape indexes created on demand and evicted by usage
//! - **Sequences**: Atomic counters behind zero-padded auto numbers, with overflow rollback
//! - **Audit Trail**: Operation and field-level history written in the mutation transaction
//! - **Bulk Upload**: Batched insert/update/upsert with per-batch results as a stream
//! - **Ownership**: Owner-group scoping, audited ownership transfer and status changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datastore_engine::{
//!     Actor, AddDatastoreRequest, Condition, DataType, DatastoreEngine, EngineConfig,
//!     FieldDefinition, FieldValues, ItemsParam, Tenant, Value,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder("postgres://localhost/mydb").build();
//!     let engine = DatastoreEngine::new(config).await?;
//!
//!     let tenant = Tenant::new("acme")?;
//!     engine.ensure_tenant(&tenant).await?;
//!
//!     // A datastore with an auto-numbered code
//!     engine
//!         .add_datastore(&tenant, AddDatastoreRequest::new("sales", "Orders").with_id("orders"), "admin")
//!         .await?;
//!     engine
//!         .add_field(&tenant, FieldDefinition::new("orders", "code", "Code", DataType::Autonum).with_numbering("A-", 4), "admin")
//!         .await?;
//!     engine
//!         .add_field(&tenant, FieldDefinition::new("orders", "name", "Name", DataType::Text).required(), "admin")
//!         .await?;
//!
//!     // Insert a record; `code` is assigned by the server
//!     let mut values = FieldValues::new();
//!     values.insert("name".into(), Value::text(DataType::Text, "Acme"));
//!     let item_id = engine.insert(&tenant, "orders", values, &Actor::new("u1")).await?;
//!
//!     // Query records
//!     let (items, total) = engine
//!         .find(
//!             &tenant,
//!             "orders",
//!             &ItemsParam::new()
//!                 .condition(Condition::dynamic("name", "text", "like", "Ac"))
//!                 .page(1, 20),
//!         )
//!         .await?;
//!     println!("{} of {} records, first id {}", items.len(), total, item_id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The engine is configured using `EngineConfig`:
//!
//! ```rust
//! use std::time::Duration;
//! use datastore_engine::EngineConfig;
//!
//! let config = EngineConfig::builder("postgres://localhost/mydb")
//!     .max_connections(20)                        // Pool size
//!     .scan_timeout(Duration::from_secs(300))     // Paged finds and downloads
//!     .bulk_batch_size(500)                       // Rows per bulk upload transaction
//!     .strict_conditions(true)                    // Reject unknown condition field types
//!     .build();
//! ```
//!
//! ## Multi-Tenancy
//!
//! Each [`Tenant`] is a PostgreSQL schema holding its datastore metadata,
//! sequences, history tables and one item table per datastore. Every engine
//! operation names the tenant it works on.

pub mod config;
pub mod error;
pub mod history;
pub mod index;
pub mod item;
pub mod mutation;
pub mod schema;
pub mod sequence;
pub mod sql;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{EngineConfig, EngineConfigBuilder, IndexLimits, Timeouts};
pub use error::{DatastoreError, Result};
pub use history::{Change, FieldHistoryEntry, HistoryEntry, HistoryType};
pub use index::{EvictionPolicy, IndexUsage, UsageRanked};
pub use item::{
    Actor, BatchResult, BatchStatus, BulkMappingRequest, Condition, ConditionMode, Dependents,
    FieldValues, Item, ItemsParam, MappingMode, MappingRow, RowError, UpdatePolicy,
};
pub use schema::{
    AddDatastoreRequest, CascadeRule, Datastore, DatastoreSchema, FieldDefinition,
    ModifyDatastoreRequest, ModifyFieldRequest, RelationItem, SelfCalculate, SortItem, SortOrder,
    Tenant,
};
pub use store::DatastoreEngine;
pub use types::{DataType, FileRef, Value};

// Re-export SQL utilities for advanced users
pub use sql::condition::{Filter, Operand, Target, Test, compile_conditions};
pub use sql::ddl::DdlGenerator;
pub use sql::sanitize::{quote_identifier, validate_identifier};
