//! Connection-related data models.
//!
//! This module defines the registered connection descriptor and the dialect
//! detection that selects an adapter for it.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    /// Includes MariaDB
    MySql,
    Sqlite,
}

impl Dialect {
    /// Select a dialect from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Stable lowercase identifier, used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parse the identifier produced by [`Dialect::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        Self::from_scheme(value)
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Check that a connection URL names a supported dialect and is well formed.
///
/// Server dialects must name a host. SQLite URLs must name a file path or
/// `:memory:`.
pub fn parse_connection_url(url: &str) -> DbResult<Dialect> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(DbError::invalid_url("URL cannot be empty"));
    }

    let scheme = trimmed
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| DbError::invalid_url("URL has no scheme"))?;
    let dialect = Dialect::from_scheme(scheme)
        .ok_or_else(|| DbError::invalid_url(format!("unsupported scheme '{}'", scheme)))?;

    match dialect {
        Dialect::Sqlite => {
            let rest = trimmed[scheme.len() + 1..].trim_start_matches("//");
            let path = rest.split('?').next().unwrap_or_default();
            if path.is_empty() {
                return Err(DbError::invalid_url("SQLite URL must name a database file"));
            }
        }
        Dialect::Postgres | Dialect::MySql => {
            let parsed = Url::parse(trimmed).map_err(|e| DbError::invalid_url(e.to_string()))?;
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err(DbError::invalid_url(format!(
                    "{} URL must include a host",
                    dialect.display_name()
                )));
            }
        }
    }

    Ok(dialect)
}

/// Replace the password in a URL with `****`.
pub fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if let Some(colon_pos) = url[scheme_end..at_pos].rfind(':') {
            let colon_pos = scheme_end + colon_pos;
            return format!("{}****{}", &url[..colon_pos + 1], &url[at_pos..]);
        }
    }
    url.to_string()
}

/// A registered database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub name: String,
    /// Contains credentials - never log, never serialize
    #[serde(skip_serializing, default)]
    pub url: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub dialect: Dialect,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionDescriptor {
    /// Build a new active descriptor with a fresh id.
    pub fn new(input: NewConnection) -> DbResult<Self> {
        let name = validate_name(&input.name)?;
        let dialect = parse_connection_url(&input.url)?;
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            url: input.url.trim().to_string(),
            description: input.description,
            is_active: true,
            dialect,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply an update, validating changed fields.
    ///
    /// Returns true when the URL changed.
    pub fn apply(&mut self, update: ConnectionUpdate) -> DbResult<bool> {
        let mut url_changed = false;
        if let Some(name) = update.name {
            self.name = validate_name(&name)?;
        }
        if let Some(url) = update.url {
            let url = url.trim().to_string();
            self.dialect = parse_connection_url(&url)?;
            url_changed = url != self.url;
            self.url = url;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
        self.updated_at = Utc::now();
        Ok(url_changed)
    }

    /// Get a display-safe version of the URL (credentials masked).
    pub fn masked_url(&self) -> String {
        mask_url(&self.url)
    }
}

fn validate_name(name: &str) -> DbResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DbError::invalid_input("Connection name cannot be empty"));
    }
    Ok(trimmed.to_string())
}

/// Input for registering a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewConnection {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewConnection {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update of a registered connection. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `Some(None)` clears the description
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
}
