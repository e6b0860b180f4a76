//! Engine analyzers: ask a live (or sandboxed) database what a query returns
//! and what it binds.

mod cached;
mod clickhouse;
mod duckdb;
mod memo;
mod mysql;
mod placeholders;
mod postgresql;
mod sqlite;
mod sqlserver;

pub use cached::CachedAnalyzer;
pub use clickhouse::ClickHouseAnalyzer;
pub use duckdb::DuckDbAnalyzer;
pub use memo::Memo;
pub use mysql::MysqlAnalyzer;
pub use placeholders::{
    find_placeholders, is_select, replace_placeholders, rewrite_placeholders, Placeholder, Rewritten,
};
pub use postgresql::{rewrite_type, PostgresAnalyzer};
pub use sqlite::SqliteAnalyzer;
pub use sqlserver::SqlServerAnalyzer;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::{Analysis, Node, ParamNames, SchemaCatalog};
use crate::cache::CacheDirs;
use crate::config::{Config, DatabaseConfig, DebugOptions, Engine, Replacer};
use crate::db::{CreateDatabaseRequest, ManagedClient};
use crate::error::{Error, Result};
use crate::sandbox::SandboxAnalyzer;

/// The capability every engine analyzer provides.
///
/// Calls on one instance are serialized internally. Dropping a returned future
/// cancels the in-flight database call.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis>;

    /// Release the connection. Closing twice is a no-op; managed databases
    /// are left in place.
    async fn close(&self) -> Result<()>;

    /// Connect (and migrate, where the engine does so itself) without analyzing.
    async fn ensure_conn(&self, _migrations: &[String]) -> Result<()> {
        Err(Error::Unsupported("ensure_conn"))
    }

    /// Result column names for `query`. Requires an established connection.
    async fn column_names(&self, _query: &str) -> Result<Vec<String>> {
        Err(Error::Unsupported("column_names"))
    }

    /// Read tables, columns and enums for `schemas` back from the database.
    async fn introspect_schema(&self, _schemas: &[String]) -> Result<SchemaCatalog> {
        Err(Error::Unsupported("introspect_schema"))
    }
}

/// Services shared by every analyzer in a process.
#[derive(Clone, Default)]
pub struct AnalyzerContext {
    pub client: Option<Arc<ManagedClient>>,
    pub replacer: Replacer,
    pub debug: DebugOptions,
    pub cache: Option<CacheDirs>,
}

impl AnalyzerContext {
    pub fn from_env(client: Option<Arc<ManagedClient>>) -> Self {
        let cache = match CacheDirs::from_env() {
            Ok(dirs) => Some(dirs),
            Err(e) => {
                tracing::warn!(error = %e, "analysis cache disabled");
                None
            }
        };
        Self {
            client,
            replacer: Replacer::from_env(),
            debug: DebugOptions::from_env(),
            cache,
        }
    }

    /// URI of an operator-configured database, with `${VAR}` expanded.
    pub fn static_uri(&self, db: &DatabaseConfig) -> Result<String> {
        if self.debug.only_managed_databases {
            return Err(Error::ManagedOnly);
        }
        let uri = self.replacer.replace(db.uri.as_deref().unwrap_or_default());
        if uri.trim().is_empty() {
            return Err(Error::Config(format!(
                "{}: database uri is empty (is the environment variable set?)",
                db.engine
            )));
        }
        Ok(uri)
    }

    /// Provision (or reuse) the managed database for `migrations`.
    pub async fn managed_uri(&self, engine: Engine, migrations: &[String]) -> Result<String> {
        let client = self.client.as_ref().ok_or_else(|| {
            Error::Config(format!("managed {engine} databases require configured servers"))
        })?;
        let resp = client
            .create_database(&CreateDatabaseRequest {
                engine,
                migrations: migrations.to_vec(),
                prefix: None,
            })
            .await?;
        Ok(resp.uri)
    }

    /// Managed or static URI, depending on `db.managed`.
    pub async fn resolve_uri(&self, db: &DatabaseConfig, migrations: &[String]) -> Result<String> {
        if db.managed {
            self.managed_uri(db.engine, migrations).await
        } else {
            self.static_uri(db)
        }
    }
}

pub type Constructor = fn(&DatabaseConfig, &AnalyzerContext) -> Result<Box<dyn Analyzer>>;

/// Maps each engine to the constructor of its analyzer.
pub struct AnalyzerRegistry {
    constructors: HashMap<Engine, Constructor>,
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(Engine::PostgreSQL, |db, ctx| {
            Ok(Box::new(PostgresAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry.register(Engine::MySQL, |db, ctx| {
            Ok(Box::new(MysqlAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry.register(Engine::SQLite, |db, ctx| {
            Ok(Box::new(SqliteAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry.register(Engine::ClickHouse, |db, ctx| {
            Ok(Box::new(ClickHouseAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry.register(Engine::SqlServer, |db, ctx| {
            Ok(Box::new(SqlServerAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry.register(Engine::DuckDB, |db, ctx| {
            Ok(Box::new(DuckDbAnalyzer::new(db.clone(), ctx.clone())))
        });
        registry
    }

    pub fn register(&mut self, engine: Engine, constructor: Constructor) {
        self.constructors.insert(engine, constructor);
    }

    pub fn supports(&self, engine: Engine) -> bool {
        self.constructors.contains_key(&engine)
    }

    /// Build the analyzer for `config.database`.
    ///
    /// A configured sandbox module replaces the PostgreSQL analyzer. Managed
    /// databases get their analyses persisted when a cache root is available.
    pub fn create(&self, config: &Config, ctx: &AnalyzerContext) -> Result<Box<dyn Analyzer>> {
        let db = &config.database;
        let analyzer: Box<dyn Analyzer> = match (&db.sandbox, db.engine) {
            (Some(sandbox), Engine::PostgreSQL) => {
                let cache = match &ctx.cache {
                    Some(cache) => cache.clone(),
                    None => CacheDirs::from_env()?,
                };
                Box::new(SandboxAnalyzer::new(sandbox.clone(), cache))
            }
            (Some(_), engine) => {
                return Err(Error::Config(format!(
                    "sandboxed analysis is only available for postgresql, not {engine}"
                )))
            }
            (None, engine) => {
                let constructor = self
                    .constructors
                    .get(&engine)
                    .ok_or_else(|| Error::Config(format!("no analyzer registered for {engine}")))?;
                constructor(db, ctx)?
            }
        };

        match (&ctx.cache, db.managed) {
            (Some(cache), true) => Ok(Box::new(CachedAnalyzer::new(analyzer, config, cache.clone())?)),
            _ => Ok(analyzer),
        }
    }
}

/// Disarmable callback that fires if the owning future is dropped early.
pub(crate) struct OnCancel<F: FnOnce()> {
    callback: Option<F>,
}

impl<F: FnOnce()> OnCancel<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.callback = None;
    }
}

impl<F: FnOnce()> Drop for OnCancel<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

/// Run blocking driver work on the blocking pool. `on_cancel` runs if the
/// caller stops waiting before the work completes.
pub(crate) async fn run_blocking<T, W, C>(work: W, on_cancel: C) -> Result<T>
where
    T: Send + 'static,
    W: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce() + Send,
{
    let guard = OnCancel::new(on_cancel);
    let joined = tokio::task::spawn_blocking(work).await;
    guard.disarm();
    joined.map_err(|e| Error::Aborted(format!("blocking task: {e}")))?
}

/// A connection taken out of its slot for one request.
///
/// The slot stays locked and empty while the request runs. If the request
/// future is dropped mid-protocol the connection is dropped with it, so the
/// next caller reconnects instead of reading a half-finished response.
pub(crate) struct Checkout<'a, C> {
    slot: tokio::sync::MutexGuard<'a, Option<C>>,
    conn: C,
}

impl<'a, C> Checkout<'a, C> {
    pub(crate) fn take(mut slot: tokio::sync::MutexGuard<'a, Option<C>>) -> Result<Self> {
        let conn = slot.take().ok_or(Error::NotConnected)?;
        Ok(Self { slot, conn })
    }

    pub(crate) fn conn(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Puts the connection back unless `outcome` shows it is broken, in which
    /// case it is handed back to be closed.
    pub(crate) fn finish<T>(self, outcome: &Result<T>) -> Option<C> {
        let Self { mut slot, conn } = self;
        match outcome {
            Err(e) if e.is_connection() => Some(conn),
            _ => {
                *slot = Some(conn);
                None
            }
        }
    }
}

/// Migrations worth executing: blank statements are skipped.
pub(crate) fn statements(migrations: &[String]) -> impl Iterator<Item = &str> {
    migrations
        .iter()
        .map(String::as_str)
        .filter(|m| !m.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn config(db: DatabaseConfig) -> Config {
        Config {
            servers: vec![],
            database: db,
        }
    }

    #[test]
    fn test_registry_covers_all_engines() {
        let registry = AnalyzerRegistry::new();
        for engine in Engine::ALL {
            assert!(registry.supports(engine));
        }
    }

    #[test]
    fn test_registry_rejects_sandbox_for_other_engines() {
        let mut db = DatabaseConfig::new(Engine::MySQL);
        db.sandbox = Some(crate::config::SandboxConfig {
            url: "file:///nope.wasm".into(),
            sha256: None,
        });
        let err = AnalyzerRegistry::new()
            .create(&config(db), &AnalyzerContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_static_uri_expands_vars() {
        let ctx = AnalyzerContext {
            replacer: Replacer::with_vars(HashMap::from([("PORT".to_string(), "5433".to_string())])),
            ..AnalyzerContext::default()
        };
        let db = DatabaseConfig::with_uri(Engine::PostgreSQL, "postgres://localhost:${PORT}/app");
        assert_eq!(ctx.static_uri(&db).unwrap(), "postgres://localhost:5433/app");
    }

    #[test]
    fn test_static_uri_disabled_for_managed_only() {
        let ctx = AnalyzerContext {
            debug: DebugOptions {
                only_managed_databases: true,
            },
            ..AnalyzerContext::default()
        };
        let db = DatabaseConfig::with_uri(Engine::MySQL, "mysql://localhost/app");
        assert!(matches!(ctx.static_uri(&db), Err(Error::ManagedOnly)));
    }

    #[test]
    fn test_static_uri_empty_after_expansion() {
        let ctx = AnalyzerContext {
            replacer: Replacer::with_vars(HashMap::new()),
            ..AnalyzerContext::default()
        };
        let db = DatabaseConfig::with_uri(Engine::MySQL, "${DATABASE_URL}");
        assert!(matches!(ctx.static_uri(&db), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_managed_uri_requires_client() {
        let ctx = AnalyzerContext::default();
        let err = ctx.managed_uri(Engine::PostgreSQL, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_run_blocking_cancel_fires_callback() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let fut = run_blocking(
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(1)
            },
            move || flag.store(true, Ordering::SeqCst),
        );
        let res = tokio::time::timeout(Duration::from_millis(20), fut).await;
        assert!(res.is_err());
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_blocking_completes_without_cancel() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let value = run_blocking(|| Ok(5), move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(!cancelled.load(Ordering::SeqCst));
    }

    struct Conn(Arc<AtomicBool>);

    impl Drop for Conn {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_checkout_returns_healthy_connection() {
        let dropped = Arc::new(AtomicBool::new(false));
        let slot = tokio::sync::Mutex::new(Some(Conn(dropped.clone())));

        let checkout = Checkout::take(slot.lock().await).unwrap();
        let sql_error: Result<()> = Err(Error::Sql(crate::error::SqlError::new("42601", "syntax", 0)));
        assert!(checkout.finish(&sql_error).is_none());
        assert!(slot.lock().await.is_some());

        let checkout = Checkout::take(slot.lock().await).unwrap();
        let broken = checkout.finish(&Err::<(), _>(Error::Connection("reset by peer".into())));
        assert!(broken.is_some());
        assert!(slot.lock().await.is_none());
        drop(broken);
        assert!(dropped.load(Ordering::SeqCst));

        assert!(matches!(Checkout::take(slot.lock().await), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_checkout_dropped_mid_request_discards_connection() {
        let dropped = Arc::new(AtomicBool::new(false));
        let slot = tokio::sync::Mutex::new(Some(Conn(dropped.clone())));

        let request = async {
            let checkout = Checkout::take(slot.lock().await)?;
            std::future::pending::<()>().await;
            Ok::<_, Error>(checkout.finish(&Ok(())).is_none())
        };
        let res = tokio::time::timeout(Duration::from_millis(20), request).await;
        assert!(res.is_err());

        assert!(dropped.load(Ordering::SeqCst));
        assert!(slot.lock().await.is_none());
    }

    #[test]
    fn test_statements_skip_blank() {
        let migrations = vec!["CREATE TABLE a (id int)".to_string(), "  \n".to_string()];
        assert_eq!(statements(&migrations).count(), 1);
    }
}
