//! Sequence allocation
//!
//! Named counters in the tenant's `sequences` table, advanced with a single
//! atomic upsert. Every call takes a connection so the same code serves both a
//! pooled connection and an open transaction (`&mut *tx`).

use sqlx::{PgConnection, Row};
use tracing::{debug, info};

use crate::error::{DatastoreError, Result};
use crate::schema::{FieldDefinition, Tenant};
use crate::sql::sanitize::qualified;

/// Width of generated surrogate keys
const SURROGATE_DIGITS: usize = 10;

/// Counter backing an autonum field
pub fn field_sequence_name(datastore_id: &str, field_id: &str) -> String {
    format!("datastore_{}_fields_{}_auto", datastore_id, field_id)
}

/// Counter assigning field display order
pub fn display_order_sequence_name(datastore_id: &str) -> String {
    format!("datastore_{}_fields__displayorder", datastore_id)
}

/// Counter behind surrogate keys of a datastore
pub fn surrogate_sequence_name(datastore_id: &str, purpose: &str) -> String {
    format!("{}_{}_auto", datastore_id, purpose)
}

/// Autonum numbering of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Numbering {
    pub sequence: String,
    pub prefix: String,
    /// Zero means unpadded and unbounded
    pub digits: u32,
}

impl Numbering {
    pub fn for_field(field: &FieldDefinition) -> Self {
        Self {
            sequence: field_sequence_name(&field.datastore_id, &field.field_id),
            prefix: field.prefix.clone(),
            digits: field.display_digits,
        }
    }

    pub fn overflows(&self, value: i64) -> bool {
        self.digits != 0 && value.to_string().len() > self.digits as usize
    }

    pub fn format(&self, value: i64) -> String {
        format!(
            "{}{:0width$}",
            self.prefix,
            value,
            width = self.digits as usize
        )
    }
}

/// Allocator over one tenant's sequence table
#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    table: String,
}

impl SequenceAllocator {
    pub fn new(tenant: &Tenant) -> Self {
        Self {
            table: qualified(tenant.as_str(), "sequences"),
        }
    }

    /// Advance `name` by `step` and return the new high-water mark
    ///
    /// A missing counter starts from zero.
    pub async fn allocate(&self, conn: &mut PgConnection, name: &str, step: i64) -> Result<i64> {
        let sql = format!(
            r#"
            INSERT INTO {} AS s (name, sequence_value) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET sequence_value = s.sequence_value + EXCLUDED.sequence_value
            RETURNING sequence_value
            "#,
            self.table
        );
        let value: i64 = sqlx::query_scalar(&sql)
            .bind(name)
            .bind(step)
            .fetch_one(&mut *conn)
            .await?;
        debug!(sequence = %name, step, value, "allocated");
        Ok(value)
    }

    /// Allocate one number and format it; an overflow is undone before failing
    pub async fn auto_number(&self, conn: &mut PgConnection, numbering: &Numbering) -> Result<String> {
        let mut range = self.allocate_range(conn, numbering, 1).await?;
        range
            .pop()
            .ok_or_else(|| DatastoreError::validation("empty sequence allocation"))
    }

    /// Allocate `step` consecutive numbers in one round trip
    pub async fn allocate_range(
        &self,
        conn: &mut PgConnection,
        numbering: &Numbering,
        step: i64,
    ) -> Result<Vec<String>> {
        if step <= 0 {
            return Ok(Vec::new());
        }
        let high = self.allocate(conn, &numbering.sequence, step).await?;
        if numbering.overflows(high) {
            self.allocate(conn, &numbering.sequence, -step).await?;
            return Err(DatastoreError::Overflow {
                sequence: numbering.sequence.clone(),
                digits: numbering.digits,
            });
        }
        Ok((high - step + 1..=high).map(|n| numbering.format(n)).collect())
    }

    /// Collision-free key `auto_%010d` from `<datastore>_<purpose>_auto`
    pub async fn surrogate_key(
        &self,
        conn: &mut PgConnection,
        datastore_id: &str,
        purpose: &str,
    ) -> Result<String> {
        let value = self
            .allocate(conn, &surrogate_sequence_name(datastore_id, purpose), 1)
            .await?;
        Ok(format!("auto_{:0width$}", value, width = SURROGATE_DIGITS))
    }

    /// Create a counter at zero; an existing counter is left alone
    pub async fn create(&self, conn: &mut PgConnection, name: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (name, sequence_value) VALUES ($1, 0) ON CONFLICT (name) DO NOTHING",
            self.table
        );
        sqlx::query(&sql).bind(name).execute(&mut *conn).await?;
        info!(sequence = %name, "created sequence");
        Ok(())
    }

    pub async fn delete(&self, conn: &mut PgConnection, name: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE name = $1", self.table);
        sqlx::query(&sql).bind(name).execute(&mut *conn).await?;
        info!(sequence = %name, "deleted sequence");
        Ok(())
    }

    /// Delete every counter whose name starts with `prefix`
    pub async fn delete_prefixed(&self, conn: &mut PgConnection, prefix: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE starts_with(name, $1)", self.table);
        let result = sqlx::query(&sql).bind(prefix).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn reset(&self, conn: &mut PgConnection, name: &str) -> Result<()> {
        self.set_value(conn, name, 0).await
    }

    pub async fn set_value(&self, conn: &mut PgConnection, name: &str, value: i64) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (name, sequence_value) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET sequence_value = EXCLUDED.sequence_value
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Current value, `None` when the counter does not exist
    pub async fn current_value(&self, conn: &mut PgConnection, name: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT sequence_value FROM {} WHERE name = $1", self.table);
        let row = sqlx::query(&sql).bind(name).fetch_optional(&mut *conn).await?;
        Ok(match row {
            Some(row) => Some(row.try_get("sequence_value")?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_sequence_names() {
        assert_eq!(field_sequence_name("ds1", "no"), "datastore_ds1_fields_no_auto");
        assert_eq!(
            display_order_sequence_name("ds1"),
            "datastore_ds1_fields__displayorder"
        );
        assert_eq!(surrogate_sequence_name("ds1", "keiyakuno"), "ds1_keiyakuno_auto");
    }

    #[test]
    fn test_numbering_format() {
        let n = Numbering {
            sequence: "s".into(),
            prefix: "A-".into(),
            digits: 4,
        };
        assert_eq!(n.format(1), "A-0001");
        assert_eq!(n.format(9999), "A-9999");

        let unpadded = Numbering {
            sequence: "s".into(),
            prefix: String::new(),
            digits: 0,
        };
        assert_eq!(unpadded.format(42), "42");
    }

    #[test]
    fn test_numbering_overflow() {
        let n = Numbering {
            sequence: "s".into(),
            prefix: "A-".into(),
            digits: 2,
        };
        assert!(!n.overflows(99));
        assert!(n.overflows(100));

        let unbounded = Numbering {
            digits: 0,
            ..n
        };
        assert!(!unbounded.overflows(i64::MAX));
    }

    #[test]
    fn test_numbering_for_field() {
        let field = FieldDefinition::new("orders", "no", "No", DataType::Autonum)
            .with_numbering("INV", 6);
        let n = Numbering::for_field(&field);
        assert_eq!(n.sequence, "datastore_orders_fields_no_auto");
        assert_eq!(n.format(12), "INV000012");
    }
}
