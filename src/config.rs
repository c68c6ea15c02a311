//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables,
//! plus the optional validation-rules file.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to load rules file {path}: {source}")]
    RulesFile {
        path: PathBuf,
        #[source]
        source: ::config::ConfigError,
    },
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Engine configuration: where the canonical database lives and where
/// sandboxes and reports go.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Directory a request's `databasePath` must resolve into; `None` means
    /// the canonical database's own directory
    pub database_root: Option<PathBuf>,
    /// `None` places sandboxes in the system temp directory
    pub sandbox_dir: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub placeholder_sigil: char,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/forms.sqlite"),
            database_root: None,
            sandbox_dir: None,
            report_dir: None,
            placeholder_sigil: '$',
        }
    }
}

impl EngineConfig {
    /// Directory requested databases must live under
    pub fn database_root(&self) -> PathBuf {
        match &self.database_root {
            Some(root) => root.clone(),
            None => match self.database_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }

    /// Resolve a requested database path against the root. Relative paths
    /// are taken from the root. `None` when the path, once symlinks and `..`
    /// are resolved, lands outside the root or its directory does not exist.
    /// The file itself may be missing.
    pub fn resolve_database_path(&self, requested: &str) -> Option<PathBuf> {
        let root = self.database_root().canonicalize().ok()?;
        let candidate = root.join(requested);

        let resolved = match candidate.canonicalize() {
            Ok(path) => path,
            Err(_) => {
                let name = match candidate.components().next_back()? {
                    std::path::Component::Normal(name) => name.to_owned(),
                    _ => return None,
                };
                candidate.parent()?.canonicalize().ok()?.join(name)
            }
        };
        resolved.starts_with(&root).then_some(resolved)
    }
}

/// A `(table, column)` pair whose values must be unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueRule {
    pub table: String,
    pub column: String,
}

/// A logical parent/child relationship checked for orphans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRule {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// Rules used by the constraint validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub unique_rules: Vec<UniqueRule>,
    pub orphan_rules: Vec<OrphanRule>,
    /// Fields that must hold an integer or boolean
    pub flag_fields: Vec<String>,
    pub include_schema_unique_indexes: bool,
    pub include_schema_foreign_keys: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        let unique = |table: &str, column: &str| UniqueRule {
            table: table.to_string(),
            column: column.to_string(),
        };
        let orphan = |child: &str, child_col: &str, parent: &str, parent_col: &str| OrphanRule {
            child_table: child.to_string(),
            child_column: child_col.to_string(),
            parent_table: parent.to_string(),
            parent_column: parent_col.to_string(),
        };

        Self {
            unique_rules: vec![
                unique("categories", "slug"),
                unique("forms", "slug"),
                unique("field_types", "key"),
            ],
            orphan_rules: vec![
                orphan("form_pages", "form_id", "forms", "id"),
                orphan("form_fields", "form_id", "forms", "id"),
                orphan("form_fields", "page_id", "form_pages", "id"),
                orphan("option_sets", "form_id", "forms", "id"),
                orphan("option_items", "option_set_id", "option_sets", "id"),
                orphan("logic_rules", "form_id", "forms", "id"),
            ],
            flag_fields: [
                "position",
                "priority",
                "required",
                "read_only",
                "visible_by_default",
                "enabled",
                "has_options",
                "allows_multiple",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            include_schema_unique_indexes: true,
            include_schema_foreign_keys: true,
        }
    }
}

impl ValidationRules {
    /// Load rules from a TOML/JSON/YAML file; the format follows the extension.
    /// Missing keys fall back to the built-in defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize::<ValidationRules>())
            .map_err(|source| ConfigError::RulesFile {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub engine: EngineConfig,
    pub rules: ValidationRules,
    pub log_format: LogFormat,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        // DATABASE_PATH wins; DATABASE_URL (sqlite://...) is accepted as well
        let database_path = match (std::env::var("DATABASE_PATH"), std::env::var("DATABASE_URL")) {
            (Ok(path), _) => PathBuf::from(path),
            (Err(_), Ok(url)) => Self::parse_database_url(&url)?,
            _ => EngineConfig::default().database_path,
        };

        let placeholder_sigil = match std::env::var("PLACEHOLDER_SIGIL") {
            Ok(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if !c.is_alphanumeric() => c,
                    _ => {
                        return Err(ConfigError::InvalidValue(format!(
                            "PLACEHOLDER_SIGIL must be a single non-alphanumeric character, got '{}'",
                            s
                        )))
                    }
                }
            }
            Err(_) => EngineConfig::default().placeholder_sigil,
        };

        let engine = EngineConfig {
            database_path,
            database_root: std::env::var("DATABASE_ROOT").ok().map(PathBuf::from),
            sandbox_dir: std::env::var("SANDBOX_DIR").ok().map(PathBuf::from),
            report_dir: std::env::var("REPORT_DIR").ok().map(PathBuf::from),
            placeholder_sigil,
        };

        let rules = match std::env::var("RULES_FILE") {
            Ok(path) => ValidationRules::from_file(Path::new(&path))?,
            Err(_) => ValidationRules::default(),
        };

        let log_format = match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Ok(Self {
            server,
            cors,
            engine,
            rules,
            log_format,
        })
    }

    /// Parse a DATABASE_URL of the form `sqlite:///abs/path` or `sqlite://rel/path`
    fn parse_database_url(url: &str) -> Result<PathBuf, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid DATABASE_URL format (expected sqlite://...)".to_string())
        })?;

        if parsed.scheme() != "sqlite" {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme '{}' (expected sqlite)",
                parsed.scheme()
            )));
        }

        // sqlite://relative/file.db parses "relative" as the host
        let path = match parsed.host_str() {
            Some(host) if !host.is_empty() => format!("{}{}", host, parsed.path()),
            _ => parsed.path().to_string(),
        };

        if path.is_empty() || path == "/" {
            return Err(ConfigError::InvalidValue(
                "DATABASE_URL does not name a database file".to_string(),
            ));
        }

        Ok(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_default_rules_cover_form_tables() {
        let rules = ValidationRules::default();
        assert_eq!(rules.unique_rules.len(), 3);
        assert_eq!(rules.orphan_rules.len(), 6);
        assert!(rules.flag_fields.iter().any(|f| f == "position"));
        assert!(rules.include_schema_foreign_keys);
    }

    #[test]
    fn test_requested_database_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dbs");
        std::fs::create_dir_all(root.join("tenants")).unwrap();
        std::fs::write(root.join("forms.sqlite"), b"").unwrap();
        std::fs::write(dir.path().join("secret.sqlite"), b"").unwrap();
        let config = EngineConfig {
            database_path: root.join("forms.sqlite"),
            ..EngineConfig::default()
        };
        let root = root.canonicalize().unwrap();

        assert_eq!(config.resolve_database_path("forms.sqlite"), Some(root.join("forms.sqlite")));
        assert_eq!(
            config.resolve_database_path("tenants/new.sqlite"),
            Some(root.join("tenants/new.sqlite"))
        );
        assert_eq!(config.resolve_database_path("../secret.sqlite"), None);
        assert_eq!(
            config.resolve_database_path(dir.path().join("secret.sqlite").to_str().unwrap()),
            None
        );
        assert_eq!(config.resolve_database_path("/etc/passwd"), None);
        assert_eq!(config.resolve_database_path("missing_dir/forms.sqlite"), None);
    }

    #[test]
    fn test_parse_database_url() {
        assert_eq!(
            Settings::parse_database_url("sqlite:///var/data/forms.sqlite").unwrap(),
            PathBuf::from("/var/data/forms.sqlite")
        );
        assert_eq!(
            Settings::parse_database_url("sqlite://data/forms.sqlite").unwrap(),
            PathBuf::from("data/forms.sqlite")
        );
        assert!(Settings::parse_database_url("postgres://localhost/db").is_err());
        assert!(Settings::parse_database_url("not a url").is_err());
    }

    #[test]
    fn test_rules_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"unique_rules": [{{"table": "users", "column": "email"}}], "flag_fields": ["is_active"]}}"#
        )
        .unwrap();

        let rules = ValidationRules::from_file(file.path()).unwrap();
        assert_eq!(
            rules.unique_rules,
            vec![UniqueRule {
                table: "users".to_string(),
                column: "email".to_string()
            }]
        );
        assert_eq!(rules.flag_fields, vec!["is_active".to_string()]);
        // untouched keys keep their defaults
        assert_eq!(rules.orphan_rules.len(), 6);
    }
}
