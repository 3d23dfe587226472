//! Connection settings for the durable backend.

/// Where the durable backend lives.
///
/// Holds a full PostgreSQL URL. Deciding where the URL comes from (flag,
/// environment, config file) is the binary's job; this type only carries
/// the result and derives the related URLs from it.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
}

impl DbConfig {
    /// URL assumed when nothing is configured at all.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/drover";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Last path segment of the URL, i.e. the database name.
    pub fn database_name(&self) -> Option<&str> {
        let (_, name) = self.database_url.rsplit_once('/')?;
        (!name.is_empty()).then_some(name)
    }

    /// Same server, `postgres` database.
    ///
    /// `CREATE DATABASE` cannot run from a connection to the database it is
    /// creating, so setup connects here first.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rsplit_once('/') {
            Some((server, _)) => format!("{server}/postgres"),
            None => self.database_url.clone(),
        }
    }
}
