// ============================================================================
// Configuration
// ============================================================================
//
// Plain structs with defaults filled in by `provide_defaults`. `from_env`
// reads the same settings from environment variables:
//
//   SCYLLA_NODES          comma separated host:port list
//   SCYLLA_KEYSPACE       keyspace holding every table
//   EVENT_TABLE_PREFIX    event tables are named <prefix><namespace>
//   REPO_TABLE_NAME       table used by the entity repository
//
// ============================================================================

pub const DEFAULT_NODE: &str = "127.0.0.1:9042";
pub const DEFAULT_KEYSPACE: &str = "eventhorizon";
pub const DEFAULT_TABLE_PREFIX: &str = "events_";
pub const DEFAULT_REPO_TABLE: &str = "entities";
pub const DEFAULT_ID_ATTRIBUTE: &str = "ID";

#[derive(Clone, Debug, Default)]
pub struct ScyllaConfig {
    pub nodes: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u32,
}

impl ScyllaConfig {
    pub fn provide_defaults(&mut self) {
        if self.nodes.is_empty() {
            self.nodes.push(DEFAULT_NODE.to_string());
        }
        if self.keyspace.is_empty() {
            self.keyspace = DEFAULT_KEYSPACE.to_string();
        }
        if self.replication_factor == 0 {
            self.replication_factor = 1;
        }
    }
}

/// Config for the entity repository.
#[derive(Clone, Debug, Default)]
pub struct RepoConfig {
    pub table_name: String,
    /// Attribute holding the entity identifier (the partition key).
    pub id_attribute: String,
}

impl RepoConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        let mut config = Self {
            table_name: table_name.into(),
            ..Default::default()
        };
        config.provide_defaults();
        config
    }

    pub fn provide_defaults(&mut self) {
        if self.table_name.is_empty() {
            self.table_name = DEFAULT_REPO_TABLE.to_string();
        }
        if self.id_attribute.is_empty() {
            self.id_attribute = DEFAULT_ID_ATTRIBUTE.to_string();
        }
    }
}

/// Config for the event store.
#[derive(Clone, Debug, Default)]
pub struct EventStoreConfig {
    pub table_prefix: String,
}

impl EventStoreConfig {
    pub fn new(table_prefix: impl Into<String>) -> Self {
        let mut config = Self {
            table_prefix: table_prefix.into(),
        };
        config.provide_defaults();
        config
    }

    pub fn provide_defaults(&mut self) {
        if self.table_prefix.is_empty() {
            self.table_prefix = DEFAULT_TABLE_PREFIX.to_string();
        }
    }
}

/// Everything the binary needs, loaded in one go.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub scylla: ScyllaConfig,
    pub repo: RepoConfig,
    pub event_store: EventStoreConfig,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; `from_env` uses the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(nodes) = lookup("SCYLLA_NODES") {
            settings.scylla.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(keyspace) = lookup("SCYLLA_KEYSPACE") {
            settings.scylla.keyspace = keyspace;
        }
        if let Some(factor) = lookup("SCYLLA_REPLICATION_FACTOR") {
            settings.scylla.replication_factor = factor.parse().map_err(|e| {
                anyhow::anyhow!("SCYLLA_REPLICATION_FACTOR must be a number: {e}")
            })?;
        }
        if let Some(prefix) = lookup("EVENT_TABLE_PREFIX") {
            settings.event_store.table_prefix = prefix;
        }
        if let Some(table) = lookup("REPO_TABLE_NAME") {
            settings.repo.table_name = table;
        }

        settings.scylla.provide_defaults();
        settings.repo.provide_defaults();
        settings.event_store.provide_defaults();
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(settings.scylla.nodes, vec![DEFAULT_NODE.to_string()]);
        assert_eq!(settings.scylla.keyspace, DEFAULT_KEYSPACE);
        assert_eq!(settings.scylla.replication_factor, 1);
        assert_eq!(settings.event_store.table_prefix, DEFAULT_TABLE_PREFIX);
        assert_eq!(settings.repo.table_name, DEFAULT_REPO_TABLE);
        assert_eq!(settings.repo.id_attribute, DEFAULT_ID_ATTRIBUTE);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCYLLA_NODES", "10.0.0.1:9042, 10.0.0.2:9042"),
            ("SCYLLA_KEYSPACE", "tenants"),
            ("EVENT_TABLE_PREFIX", "es_"),
            ("REPO_TABLE_NAME", "customers"),
        ]);
        let settings = Settings::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.scylla.nodes, vec!["10.0.0.1:9042", "10.0.0.2:9042"]);
        assert_eq!(settings.scylla.keyspace, "tenants");
        assert_eq!(settings.event_store.table_prefix, "es_");
        assert_eq!(settings.repo.table_name, "customers");
        assert_eq!(settings.repo.id_attribute, DEFAULT_ID_ATTRIBUTE);
    }

    #[test]
    fn test_bad_replication_factor() {
        let result = Settings::from_lookup(|key| {
            (key == "SCYLLA_REPLICATION_FACTOR").then(|| "three".to_string())
        });
        assert!(result.is_err());
    }
}
