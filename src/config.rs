//! Configuration for DatastoreEngine
//!
//! Provides a builder pattern for configuring the engine.

use std::time::Duration;

/// Deadlines applied to each class of operation
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Single record lookups and counts (default: 30s)
    pub point_read: Duration,
    /// Paged finds and full-collection downloads (default: 10min)
    pub scan: Duration,
    /// Single-record write transactions (default: 2min)
    pub write: Duration,
    /// Bulk upload and bulk delete transactions (default: 5min)
    pub bulk_write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            point_read: Duration::from_secs(30),
            scan: Duration::from_secs(600),
            write: Duration::from_secs(120),
            bulk_write: Duration::from_secs(300),
        }
    }
}

/// Limits enforced by the index lifecycle manager
#[derive(Debug, Clone)]
pub struct IndexLimits {
    /// Query shapes with more keys than this never get an index (default: 31)
    pub max_keys: usize,
    /// Living index count per collection before eviction starts (default: 52)
    pub ceiling: usize,
}

impl Default for IndexLimits {
    fn default() -> Self {
        Self {
            max_keys: 31,
            ceiling: 52,
        }
    }
}

/// Configuration for the datastore engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Maximum pool connections (default: 10)
    pub max_connections: u32,
    /// Reference table holding user display names (default: "users")
    pub users_table: String,
    /// Reference table holding option labels (default: "options")
    pub options_table: String,
    /// Operation deadlines
    pub timeouts: Timeouts,
    /// Index lifecycle limits
    pub index_limits: IndexLimits,
    /// Rows per bulk mapping transaction (default: 500)
    pub bulk_batch_size: usize,
    /// Rows per bulk delete transaction (default: 2000)
    pub chunk_size: usize,
    /// Reject conditions with unknown field types instead of skipping them (default: false)
    pub strict_conditions: bool,
}

impl EngineConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(database_url)
    }
}

/// Builder for EngineConfig
#[derive(Debug)]
pub struct EngineConfigBuilder {
    database_url: String,
    max_connections: u32,
    users_table: String,
    options_table: String,
    timeouts: Timeouts,
    index_limits: IndexLimits,
    bulk_batch_size: usize,
    chunk_size: usize,
    strict_conditions: bool,
}

impl EngineConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            users_table: "users".to_string(),
            options_table: "options".to_string(),
            timeouts: Timeouts::default(),
            index_limits: IndexLimits::default(),
            bulk_batch_size: 500,
            chunk_size: 2000,
            strict_conditions: false,
        }
    }

    /// Set the maximum number of pooled connections
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the user display-name reference table
    pub fn users_table(mut self, name: impl Into<String>) -> Self {
        self.users_table = name.into();
        self
    }

    /// Set the option label reference table
    pub fn options_table(mut self, name: impl Into<String>) -> Self {
        self.options_table = name.into();
        self
    }

    pub fn point_read_timeout(mut self, d: Duration) -> Self {
        self.timeouts.point_read = d;
        self
    }

    pub fn scan_timeout(mut self, d: Duration) -> Self {
        self.timeouts.scan = d;
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.timeouts.write = d;
        self
    }

    pub fn bulk_write_timeout(mut self, d: Duration) -> Self {
        self.timeouts.bulk_write = d;
        self
    }

    /// Set the maximum number of keys in an auto-created index
    pub fn index_key_limit(mut self, n: usize) -> Self {
        self.index_limits.max_keys = n;
        self
    }

    /// Set the index count at which least-used indexes are evicted
    pub fn index_ceiling(mut self, n: usize) -> Self {
        self.index_limits.ceiling = n;
        self
    }

    /// Rows per bulk mapping batch; zero is raised to one
    pub fn bulk_batch_size(mut self, n: usize) -> Self {
        self.bulk_batch_size = n.max(1);
        self
    }

    /// Rows per bulk delete chunk; zero is raised to one
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Fail on unknown condition field types instead of skipping them
    pub fn strict_conditions(mut self, enabled: bool) -> Self {
        self.strict_conditions = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            database_url: self.database_url,
            max_connections: self.max_connections,
            users_table: self.users_table,
            options_table: self.options_table,
            timeouts: self.timeouts,
            index_limits: self.index_limits,
            bulk_batch_size: self.bulk_batch_size,
            chunk_size: self.chunk_size,
            strict_conditions: self.strict_conditions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Default Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = EngineConfig::builder("postgres://localhost/test").build();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.users_table, "users");
        assert_eq!(config.options_table, "options");
        assert_eq!(config.bulk_batch_size, 500);
        assert_eq!(config.chunk_size, 2000);
        assert!(!config.strict_conditions);
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.point_read, Duration::from_secs(30));
        assert_eq!(t.scan, Duration::from_secs(600));
        assert_eq!(t.write, Duration::from_secs(120));
        assert_eq!(t.bulk_write, Duration::from_secs(300));
    }

    #[test]
    fn test_default_index_limits() {
        let limits = IndexLimits::default();
        assert_eq!(limits.max_keys, 31);
        assert_eq!(limits.ceiling, 52);
    }

    // =========================================================================
    // Builder Tests
    // =========================================================================

    #[test]
    fn test_custom_tables() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .users_table("members")
            .options_table(String::from("choice_labels"))
            .build();

        assert_eq!(config.users_table, "members");
        assert_eq!(config.options_table, "choice_labels");
    }

    #[test]
    fn test_custom_timeouts() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .point_read_timeout(Duration::from_secs(5))
            .scan_timeout(Duration::from_secs(60))
            .write_timeout(Duration::from_secs(10))
            .bulk_write_timeout(Duration::from_secs(90))
            .build();

        assert_eq!(config.timeouts.point_read, Duration::from_secs(5));
        assert_eq!(config.timeouts.scan, Duration::from_secs(60));
        assert_eq!(config.timeouts.write, Duration::from_secs(10));
        assert_eq!(config.timeouts.bulk_write, Duration::from_secs(90));
    }

    #[test]
    fn test_batch_sizes_never_zero() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .bulk_batch_size(0)
            .chunk_size(0)
            .build();

        assert_eq!(config.bulk_batch_size, 1);
        assert_eq!(config.chunk_size, 1);
    }

    #[test]
    fn test_full_custom_config() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .max_connections(4)
            .index_key_limit(8)
            .index_ceiling(12)
            .strict_conditions(true)
            .build();

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.index_limits.max_keys, 8);
        assert_eq!(config.index_limits.ceiling, 12);
        assert!(config.strict_conditions);
    }

    #[test]
    fn test_builder_debug() {
        let builder = EngineConfig::builder("postgres://localhost/test");
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("EngineConfigBuilder"));
    }
}
