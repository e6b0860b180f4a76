use async_trait::async_trait;
use duckdb::{Connection, InterruptHandle};
use sqlparser::dialect::DuckDbDialect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{is_select, replace_placeholders, run_blocking, statements, Analyzer, AnalyzerContext};
use crate::analysis::{Analysis, Column, Node, ParamNames, Parameter};
use crate::config::DatabaseConfig;
use crate::error::{self, Error, Result};

const MEMORY: &str = ":memory:";

struct Described {
    /// (name, type, nullable) as reported by `DESCRIBE`
    columns: Vec<(String, String, bool)>,
    param_count: usize,
}

/// DuckDB analyzer. Prepare validates the statement and counts its
/// parameters; `DESCRIBE` of the query reports the result columns.
pub struct DuckDbAnalyzer {
    db: DatabaseConfig,
    ctx: AnalyzerContext,
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<Mutex<Option<Arc<InterruptHandle>>>>,
}

impl DuckDbAnalyzer {
    pub fn new(db: DatabaseConfig, ctx: AnalyzerContext) -> Self {
        Self {
            db,
            ctx,
            conn: Arc::new(Mutex::new(None)),
            interrupt: Arc::new(Mutex::new(None)),
        }
    }

    /// Managed databases live in memory; an empty URI means the same.
    fn uri(&self) -> Result<String> {
        if self.db.managed {
            return Ok(MEMORY.into());
        }
        if self.ctx.debug.only_managed_databases {
            return Err(Error::ManagedOnly);
        }
        let uri = self.ctx.replacer.replace(self.db.uri.as_deref().unwrap_or_default());
        Ok(if uri.trim().is_empty() { MEMORY.into() } else { uri })
    }

    async fn with_conn<T, W>(&self, migrations: Option<Vec<String>>, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let uri = match migrations {
            Some(_) => Some(self.uri()),
            None => None,
        };
        let conn = self.conn.clone();
        let interrupt = self.interrupt.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let on_cancel = {
            let interrupt = self.interrupt.clone();
            let cancelled = cancelled.clone();
            move || {
                cancelled.store(true, Ordering::SeqCst);
                if let Ok(guard) = interrupt.lock() {
                    if let Some(handle) = guard.as_ref() {
                        tracing::debug!("interrupting duckdb");
                        handle.interrupt();
                    }
                }
            }
        };
        run_blocking(
            move || {
                let mut guard = conn.lock().map_err(|_| Error::Aborted("duckdb connection".into()))?;
                if guard.is_none() {
                    let (Some(uri), Some(migrations)) = (uri, migrations) else {
                        return Err(Error::NotConnected);
                    };
                    *guard = Some(open(&uri?, &migrations, &interrupt, &cancelled)?);
                }
                match guard.as_ref() {
                    Some(conn) => work(conn),
                    None => Err(Error::NotConnected),
                }
            },
            on_cancel,
        )
        .await
    }
}

/// Opens the database and applies migrations. The interrupt handle is
/// published before migrating so a slow migration can be cancelled too.
fn open(
    uri: &str,
    migrations: &[String],
    interrupt: &Mutex<Option<Arc<InterruptHandle>>>,
    cancelled: &AtomicBool,
) -> Result<Connection> {
    let in_memory = uri == MEMORY;
    let conn = if in_memory {
        Connection::open_in_memory()
    } else {
        Connection::open(uri)
    }
    .map_err(|e| Error::Connection(format!("failed to open duckdb database: {e}")))?;
    tracing::debug!(uri, "opened duckdb database");
    if let Ok(mut handle) = interrupt.lock() {
        *handle = Some(conn.interrupt_handle());
    }
    // Cancelled before the handle existed.
    if cancelled.load(Ordering::SeqCst) {
        return Err(Error::Aborted("duckdb migration".into()));
    }

    if in_memory {
        for m in statements(migrations) {
            conn.execute_batch(m)
                .map_err(|e| Error::provision(uri, format!("migration failed: {e}")))?;
        }
    }
    Ok(conn)
}

fn describe(conn: &Connection, pos: usize, query: &str) -> Result<Described> {
    let param_count = conn
        .prepare(query)
        .map_err(|e| error::from_duckdb(&pos, &e))?
        .parameter_count();

    let columns = if is_select(query) {
        describe_columns(conn, &replace_placeholders(&DuckDbDialect {}, query))
            .map_err(|e| error::from_duckdb(&pos, &e))?
    } else {
        vec![]
    };

    Ok(Described {
        columns,
        param_count,
    })
}

fn describe_columns(conn: &Connection, query: &str) -> duckdb::Result<Vec<(String, String, bool)>> {
    let query = query.trim().trim_end_matches(';');
    let mut stmt = conn.prepare(&format!("DESCRIBE {query}"))?;
    let rows = stmt.query_map([], |row| {
        let nullable: String = row.get(2)?;
        Ok((row.get(0)?, row.get(1)?, !nullable.eq_ignore_ascii_case("no")))
    })?;
    rows.collect()
}

/// Strips `[]` suffixes, returning the element type and array depth.
fn parse_type(data_type: &str) -> (&str, u32) {
    let mut base = data_type;
    let mut dims = 0;
    while let Some(trimmed) = base.strip_suffix("[]") {
        base = trimmed;
        dims += 1;
    }
    (base, dims)
}

#[async_trait]
impl Analyzer for DuckDbAnalyzer {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let pos = node.pos();
        let owned = query.to_string();
        let described = self
            .with_conn(Some(migrations.to_vec()), move |conn| describe(conn, pos, &owned))
            .await?;

        let columns = described
            .columns
            .into_iter()
            .map(|(name, data_type, nullable)| {
                let (base, dims) = parse_type(&data_type);
                Column::new(name, base).not_null(!nullable).array_dims(dims)
            })
            .collect();
        let params = (1..=described.param_count as u32)
            .map(|n| Parameter::new(n, "any", params))
            .collect();
        Ok(Analysis { columns, params })
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        let interrupt = self.interrupt.clone();
        run_blocking(
            move || {
                if let Ok(mut handle) = interrupt.lock() {
                    handle.take();
                }
                if let Ok(mut guard) = conn.lock() {
                    guard.take();
                }
                Ok(())
            },
            || {},
        )
        .await
    }

    async fn ensure_conn(&self, migrations: &[String]) -> Result<()> {
        self.with_conn(Some(migrations.to_vec()), |_| Ok(())).await
    }

    async fn column_names(&self, query: &str) -> Result<Vec<String>> {
        let query = replace_placeholders(&DuckDbDialect {}, query);
        self.with_conn(None, move |conn| {
            let columns = describe_columns(conn, &query).map_err(|e| error::from_duckdb(&0usize, &e))?;
            Ok(columns.into_iter().map(|(name, _, _)| name).collect())
        })
        .await
    }
}
