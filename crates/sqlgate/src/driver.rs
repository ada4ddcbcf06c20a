//! Driver registry
//!
//! Maps driver identifiers (`"postgres"`, `"mysql"`, ...) to connection
//! factories. Identifiers are case-insensitive.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};

/// Registry of available drivers
///
/// [`DriverRegistry::with_defaults`] holds the backends compiled into the
/// crate; custom transports are added with [`DriverRegistry::register`].
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ConnectionFactory>>,
}

impl DriverRegistry {
    /// Create an empty driver registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Create a registry with every backend enabled at compile time
    #[allow(unused_mut)]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "postgres")]
        {
            let pg: Arc<dyn ConnectionFactory> = Arc::new(crate::postgres::PgConnectionFactory);
            registry.register("postgres", Arc::clone(&pg));
            registry.register("postgresql", pg);
        }

        #[cfg(feature = "mysql")]
        {
            let mysql: Arc<dyn ConnectionFactory> = Arc::new(crate::mysql::MySqlConnectionFactory);
            registry.register("mysql", Arc::clone(&mysql));
            registry.register("mariadb", mysql);
        }

        registry
    }

    /// Register a driver factory under an identifier
    pub fn register(&mut self, name: &str, factory: Arc<dyn ConnectionFactory>) {
        self.drivers.insert(name.to_lowercase(), factory);
    }

    /// Get a driver factory by identifier
    pub fn get(&self, name: &str) -> Result<Arc<dyn ConnectionFactory>> {
        self.drivers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown driver '{}' (registered: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    /// Registered identifiers, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check if a driver is registered
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(&name.to_lowercase())
    }

    /// Number of registered identifiers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
