//! Configuration and schema-mode selection.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Where the DCC XSD is taken from when validating a document.
/// - Offline: the bundled schema copy configured through [`Config::schema_path`].
/// - Online: the schema advertised by the document's `xsi:schemaLocation`,
///   fetched once per validation call.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use dcc_core::config::SchemaMode;
///
/// let mode = SchemaMode::from_str("online")?;
/// assert_eq!(mode, SchemaMode::Online);
/// # Ok::<(), dcc_core::config::SchemaModeParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMode {
    Online,
    Offline,
}

/// Error returned when parsing a [`SchemaMode`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaModeParseError {
    #[error("invalid schema mode: {input}")]
    Invalid { input: String },
}

impl FromStr for SchemaMode {
    type Err = SchemaModeParseError;
    fn from_str(mode: &str) -> Result<SchemaMode, SchemaModeParseError> {
        match mode.to_ascii_lowercase().as_str() {
            "online" => Ok(SchemaMode::Online),
            "offline" => Ok(SchemaMode::Offline),
            _ => Err(SchemaModeParseError::Invalid {
                input: mode.to_string(),
            }),
        }
    }
}

impl SchemaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaMode::Online => "online",
            SchemaMode::Offline => "offline",
        }
    }

    pub fn from_online_flag(online: bool) -> Self {
        if online {
            SchemaMode::Online
        } else {
            SchemaMode::Offline
        }
    }
}

/// Configuration shared by loading, schema validation and trust checks.
///
/// # Examples
/// ```rust
/// use dcc_core::config::Config;
///
/// let config = Config::new("path/to/dcc.xsd");
/// assert_eq!(config.schema_path().to_str(), Some("path/to/dcc.xsd"));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    schema_path: PathBuf,
    schema_mode: SchemaMode,
    http_timeout: Duration,
    user_agent: String,
    verification_time: Option<DateTime<Utc>>,
}

impl Config {
    pub fn new(schema_path: impl Into<PathBuf>) -> Self {
        Self {
            schema_path: schema_path.into(),
            ..Self::default()
        }
    }

    /// Mode used by [`crate::dcc::Dcc::verify_default_schema`].
    pub fn with_schema_mode(mut self, mode: SchemaMode) -> Self {
        self.schema_mode = mode;
        self
    }

    /// Upper bound for every single network attempt (schema, DCC, CRL).
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Pin the instant certificate validity and revocation are judged at.
    pub fn with_verification_time(mut self, time: DateTime<Utc>) -> Self {
        self.verification_time = Some(time);
        self
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }

    pub fn schema_mode(&self) -> SchemaMode {
        self.schema_mode
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn verification_time(&self) -> Option<DateTime<Utc>> {
        self.verification_time
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_path: PathBuf::from("./assets/schemas/dcc.xsd"),
            schema_mode: SchemaMode::Offline,
            http_timeout: Duration::from_secs(30),
            user_agent: format!("dcc-core/{}", env!("CARGO_PKG_VERSION")),
            verification_time: None,
        }
    }
}
