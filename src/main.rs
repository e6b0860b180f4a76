use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dbprobe::{
    Analyzer, AnalyzerContext, AnalyzerRegistry, Config, DatabaseConfig, Engine, ManagedClient,
};

/// Ask a real database what a SQL query returns and binds
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the result columns and parameters of a query as JSON
    Analyze {
        #[command(flatten)]
        target: Target,

        /// The query to analyze
        #[arg(long)]
        query: String,
    },
    /// Print the tables, columns and enums the migrations produce as JSON
    Introspect {
        #[command(flatten)]
        target: Target,

        /// Schemas to read back (engine default when omitted)
        #[arg(long = "schema-name")]
        schema_names: Vec<String>,
    },
}

#[derive(Args)]
struct Target {
    /// Database engine (postgresql, mysql, sqlite, clickhouse, sqlserver, duckdb)
    #[arg(long)]
    engine: Option<Engine>,

    /// Migration files, applied in order
    #[arg(long = "schema")]
    schema: Vec<PathBuf>,

    /// Connection URI of an existing database; may reference ${VARS}
    #[arg(long)]
    uri: Option<String>,

    /// Provision a throwaway database for the migrations
    #[arg(long)]
    managed: bool,

    /// Config file (defaults to <config dir>/dbprobe/dbprobe.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Target {
    fn config(&self) -> Result<Config> {
        let path = self.config.clone().or_else(|| {
            let default = Config::get_config_path();
            default.exists().then_some(default)
        });
        let mut config = match (path, self.engine) {
            (Some(path), _) => Config::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            (None, Some(engine)) => Config {
                servers: vec![],
                database: DatabaseConfig::new(engine),
            },
            (None, None) => anyhow::bail!("--engine is required without a config file"),
        };

        if let Some(engine) = self.engine {
            if engine != config.database.engine {
                config.database = DatabaseConfig::new(engine);
            }
        }
        if let Some(uri) = &self.uri {
            config.database.uri = Some(uri.clone());
        }
        config.database.managed |= self.managed;
        Ok(config)
    }

    fn migrations(&self) -> Result<Vec<String>> {
        self.schema.iter().map(|p| read_migration(p)).collect()
    }
}

fn read_migration(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn analyzer(config: &Config) -> Result<(Box<dyn Analyzer>, Option<Arc<ManagedClient>>)> {
    let client = (!config.servers.is_empty()).then(|| Arc::new(ManagedClient::new(config.servers.clone())));
    let ctx = AnalyzerContext::from_env(client.clone());
    let analyzer = AnalyzerRegistry::new().create(config, &ctx)?;
    Ok((analyzer, client))
}

async fn run(command: Command) -> Result<()> {
    let (target, work) = match command {
        Command::Analyze { target, query } => (target, Work::Analyze(query)),
        Command::Introspect {
            target,
            schema_names,
        } => (target, Work::Introspect(schema_names)),
    };

    let config = target.config()?;
    let migrations = target.migrations()?;
    let (analyzer, client) = analyzer(&config)?;
    tracing::debug!(engine = %config.database.engine, managed = config.database.managed, "analyzer ready");

    let output = match work {
        Work::Analyze(query) => analyzer
            .analyze(&0usize, &query, &migrations, None)
            .await
            .map(|a| serde_json::to_string_pretty(&a)),
        Work::Introspect(names) => match analyzer.ensure_conn(&migrations).await {
            Ok(()) => analyzer
                .introspect_schema(&names)
                .await
                .map(|c| serde_json::to_string_pretty(&c)),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = analyzer.close().await {
        tracing::warn!(error = %e, "closing analyzer failed");
    }
    if let Some(client) = client {
        client.close().await;
    }

    let rendered = output.map_err(describe_failure)?;
    println!("{}", rendered?);
    Ok(())
}

/// SQL failures are reported with their class and source offset.
fn describe_failure(err: dbprobe::Error) -> anyhow::Error {
    match err.as_sql() {
        Some(sql) => anyhow::anyhow!("{} error at byte {}: {sql}", sql.category(), sql.location),
        None => err.into(),
    }
}

enum Work {
    Analyze(String),
    Introspect(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbprobe::SqlError;

    #[test]
    fn test_sql_failure_names_category_and_offset() {
        let err = dbprobe::Error::Sql(SqlError::new("42P01", "relation \"users\" does not exist", 31));
        assert_eq!(
            describe_failure(err).to_string(),
            "semantic error at byte 31: 42P01: relation \"users\" does not exist"
        );

        let err = dbprobe::Error::Sql(SqlError::new("1064", "mysql: syntax", 0));
        assert_eq!(describe_failure(err).to_string(), "database error at byte 0: 1064: mysql: syntax");

        let err = describe_failure(dbprobe::Error::NotConnected);
        assert_eq!(err.to_string(), "database connection not initialized");
    }
}
