use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Database engines with a native analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[serde(alias = "postgres")]
    PostgreSQL,
    MySQL,
    SQLite,
    ClickHouse,
    #[serde(alias = "mssql")]
    SqlServer,
    DuckDB,
}

impl Engine {
    pub const ALL: [Engine; 6] = [
        Engine::PostgreSQL,
        Engine::MySQL,
        Engine::SQLite,
        Engine::ClickHouse,
        Engine::SqlServer,
        Engine::DuckDB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::PostgreSQL => "postgresql",
            Engine::MySQL => "mysql",
            Engine::SQLite => "sqlite",
            Engine::ClickHouse => "clickhouse",
            Engine::SqlServer => "sqlserver",
            Engine::DuckDB => "duckdb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Engine::PostgreSQL),
            "mysql" => Ok(Engine::MySQL),
            "sqlite" => Ok(Engine::SQLite),
            "clickhouse" => Ok(Engine::ClickHouse),
            "sqlserver" | "mssql" => Ok(Engine::SqlServer),
            "duckdb" => Ok(Engine::DuckDB),
            other => Err(Error::Config(format!("unsupported engine: {other}"))),
        }
    }
}

/// A database server that managed databases are created on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub engine: Engine,
    pub uri: String,
}

/// How the analyzer reaches its database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub engine: Engine,
    /// Connection URI for an operator-provided database. May contain `${VAR}`.
    #[serde(default)]
    pub uri: Option<String>,
    /// Create a throwaway database per migration set instead of using `uri`.
    #[serde(default)]
    pub managed: bool,
    /// Run analysis in a WebAssembly module instead of a live server.
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
}

impl DatabaseConfig {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            uri: None,
            managed: false,
            sandbox: None,
        }
    }

    pub fn managed(engine: Engine) -> Self {
        Self {
            managed: true,
            ..Self::new(engine)
        }
    }

    pub fn with_uri(engine: Engine, uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::new(engine)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// `file://` or `https://` location of the module.
    pub url: String,
    /// Expected hex sha256 of the module. Loading without one logs a warning.
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<Server>,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dbprobe")
            .join("dbprobe.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Base server URI for `engine`, if one is configured.
    pub fn server_uri(&self, engine: Engine) -> Option<&str> {
        server_uri(&self.servers, engine)
    }
}

pub fn server_uri(servers: &[Server], engine: Engine) -> Option<&str> {
    servers
        .iter()
        .find(|s| s.engine == engine)
        .map(|s| s.uri.as_str())
        .filter(|uri| !uri.trim().is_empty())
}

/// Expands `${VAR}` references in connection URIs.
///
/// Variables come from the process environment unless an explicit table was
/// supplied. Unknown variables expand to the empty string.
#[derive(Debug, Clone, Default)]
pub struct Replacer {
    vars: Option<HashMap<String, String>>,
}

impl Replacer {
    pub fn from_env() -> Self {
        Self { vars: None }
    }

    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self { vars: Some(vars) }
    }

    pub fn replace(&self, s: &str) -> String {
        static VAR: OnceLock<Regex> = OnceLock::new();
        let re = VAR.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
        re.replace_all(s, |caps: &Captures| self.lookup(&caps[1]))
            .into_owned()
    }

    fn lookup(&self, name: &str) -> String {
        match &self.vars {
            Some(vars) => vars.get(name).cloned().unwrap_or_default(),
            None => std::env::var(name).unwrap_or_default(),
        }
    }
}

/// Debug switches read from `DBPROBE_DEBUG`, a comma-separated list of
/// `key=value` pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugOptions {
    /// `databases=managed`: refuse to open operator-configured databases.
    pub only_managed_databases: bool,
}

impl DebugOptions {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("DBPROBE_DEBUG").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        let mut opts = Self::default();
        for pair in value.split(',') {
            let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
            if key.trim() == "databases" && val.trim() == "managed" {
                opts.only_managed_databases = true;
            }
        }
        opts
    }
}
