use async_trait::async_trait;
use rusqlite::{Connection, InterruptHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{run_blocking, statements, Analyzer, AnalyzerContext};
use crate::analysis::{
    Analysis, CatalogColumn, Column, Identifier, Node, ParamNames, Parameter, SchemaCatalog,
};
use crate::config::DatabaseConfig;
use crate::error::{self, Error, Result};

/// Column facts read from `PRAGMA table_info`, keyed by column name.
type TableInfo = HashMap<String, bool>;

struct State {
    conn: Connection,
    /// (database, table) -> column not-null flags
    tables: HashMap<(String, String), TableInfo>,
}

/// Where to open the database and whether migrations must be applied to it.
#[derive(Debug, Clone)]
struct Target {
    uri: String,
    migrate: bool,
}

struct Described {
    columns: Vec<Column>,
    bind_names: Vec<Option<String>>,
}

/// SQLite analyzer. Uses the embedded engine's prepare API, which reports
/// declared types, origin tables and bind parameters without executing.
pub struct SqliteAnalyzer {
    db: DatabaseConfig,
    ctx: AnalyzerContext,
    state: Arc<Mutex<Option<State>>>,
    interrupt: Arc<Mutex<Option<InterruptHandle>>>,
}

impl SqliteAnalyzer {
    pub fn new(db: DatabaseConfig, ctx: AnalyzerContext) -> Self {
        Self {
            db,
            ctx,
            state: Arc::new(Mutex::new(None)),
            interrupt: Arc::new(Mutex::new(None)),
        }
    }

    fn target(&self) -> Result<Target> {
        if self.db.managed {
            return Ok(Target {
                uri: ":memory:".into(),
                migrate: true,
            });
        }
        if self.ctx.debug.only_managed_databases {
            return Err(Error::ManagedOnly);
        }
        let uri = self.ctx.replacer.replace(self.db.uri.as_deref().unwrap_or_default());
        let migrate = is_in_memory(&uri);
        Ok(Target { uri, migrate })
    }

    /// Runs `work` against the (lazily opened) connection on the blocking pool.
    async fn with_state<T, W>(&self, migrations: Option<Vec<String>>, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&mut State) -> Result<T> + Send + 'static,
    {
        let target = match migrations {
            Some(_) => Some(self.target()),
            None => None,
        };
        let state = self.state.clone();
        let interrupt = self.interrupt.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let on_cancel = {
            let interrupt = self.interrupt.clone();
            let cancelled = cancelled.clone();
            move || {
                cancelled.store(true, Ordering::SeqCst);
                if let Ok(guard) = interrupt.lock() {
                    if let Some(handle) = guard.as_ref() {
                        handle.interrupt();
                    }
                }
            }
        };

        run_blocking(
            move || {
                let mut guard = state.lock().map_err(|_| Error::Aborted("sqlite connection".into()))?;
                if guard.is_none() {
                    let (Some(target), Some(migrations)) = (target, migrations) else {
                        return Err(Error::NotConnected);
                    };
                    let conn = open(&target?, &migrations, &interrupt, &cancelled)?;
                    *guard = Some(State {
                        conn,
                        tables: HashMap::new(),
                    });
                }
                match guard.as_mut() {
                    Some(state) => work(state),
                    None => Err(Error::NotConnected),
                }
            },
            on_cancel,
        )
        .await
    }
}

/// Opens the database and applies migrations. The interrupt handle is
/// published first so cancellation reaches a migration as well.
fn open(
    target: &Target,
    migrations: &[String],
    interrupt: &Mutex<Option<InterruptHandle>>,
    cancelled: &AtomicBool,
) -> Result<Connection> {
    let conn = if target.uri.is_empty() {
        Connection::open_in_memory()
    } else {
        Connection::open(&target.uri)
    }
    .map_err(|e| Error::Connection(format!("failed to open sqlite database: {e}")))?;
    tracing::debug!(uri = %target.uri, migrate = target.migrate, "opened sqlite database");
    if let Ok(mut handle) = interrupt.lock() {
        *handle = Some(conn.get_interrupt_handle());
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(Error::Aborted("sqlite migration".into()));
    }

    if target.migrate {
        for m in statements(migrations) {
            conn.execute_batch(m)
                .map_err(|e| Error::provision(&target.uri, format!("migration failed: {e}")))?;
        }
    }
    Ok(conn)
}

fn describe(state: &mut State, pos: usize, query: &str) -> Result<Described> {
    let State { conn, tables } = state;
    let stmt = conn.prepare(query).map_err(|e| error::from_sqlite(&pos, &e))?;

    let decl_types: Vec<Option<String>> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().map(str::to_string))
        .collect();

    let mut columns = Vec::with_capacity(decl_types.len());
    for (meta, decl) in stmt.columns_with_metadata().iter().zip(decl_types) {
        let mut column = Column::new(meta.name(), normalize_type(decl.as_deref().unwrap_or("")));
        if let Some(origin) = meta.origin_name() {
            column.original_name = origin.to_string();
        }
        if let Some(table) = meta.table_name() {
            let database = meta.database_name().unwrap_or("main").to_string();
            let key = (database.clone(), table.to_string());
            if !tables.contains_key(&key) {
                let info = table_info(conn, &database, table).map_err(|e| error::from_sqlite(&pos, &e))?;
                tables.insert(key.clone(), info);
            }
            column.not_null = tables
                .get(&key)
                .and_then(|info| info.get(&column.original_name))
                .copied()
                .unwrap_or(false);
            column.table = Some(Identifier {
                schema: database,
                name: table.to_string(),
            });
        }
        columns.push(column);
    }

    let bind_names = (1..=stmt.parameter_count())
        .map(|i| {
            stmt.parameter_name(i)
                .map(|name| name.trim_start_matches(['?', ':', '@', '$']).to_string())
                .filter(|name| !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit()))
        })
        .collect();

    Ok(Described {
        columns,
        bind_names,
    })
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Not-null flags for the columns of `table`. An `INTEGER PRIMARY KEY` is the
/// rowid and can never be null.
fn table_info(conn: &Connection, database: &str, table: &str) -> rusqlite::Result<TableInfo> {
    let sql = format!("PRAGMA {}.table_info({})", quote(database), quote(table));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let data_type: String = row.get(2)?;
        let not_null: bool = row.get(3)?;
        let pk: i64 = row.get(5)?;
        Ok((name, not_null || (pk > 0 && data_type.eq_ignore_ascii_case("integer"))))
    })?;
    rows.collect()
}

fn introspect(conn: &Connection) -> rusqlite::Result<SchemaCatalog> {
    let mut catalog = SchemaCatalog::new("main");
    catalog.search_path = vec!["main".into()];
    let schema = catalog.schema_mut("main");

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for name in names {
        let mut pragma = conn.prepare(&format!("PRAGMA main.table_info({})", quote(&name)))?;
        let columns = pragma
            .query_map([], |row| {
                let data_type: String = row.get(2)?;
                Ok(CatalogColumn {
                    name: row.get(1)?,
                    data_type: normalize_type(&data_type),
                    not_null: row.get(3)?,
                    is_primary_key: row.get::<_, i64>(5)? > 0,
                    ..CatalogColumn::default()
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        schema.table_mut(&name).columns = columns;
    }
    Ok(catalog)
}

#[async_trait]
impl Analyzer for SqliteAnalyzer {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let pos = node.pos();
        let query = query.to_string();
        let described = self
            .with_state(Some(migrations.to_vec()), move |state| describe(state, pos, &query))
            .await?;

        let params = described
            .bind_names
            .into_iter()
            .enumerate()
            .map(|(i, bind_name)| {
                let mut param = Parameter::new(i as u32 + 1, "any", params);
                if param.column.name.is_empty() {
                    param.column.name = bind_name.unwrap_or_default();
                }
                param
            })
            .collect();

        Ok(Analysis {
            columns: described.columns,
            params,
        })
    }

    async fn close(&self) -> Result<()> {
        let state = self.state.clone();
        let interrupt = self.interrupt.clone();
        run_blocking(
            move || {
                if let Ok(mut handle) = interrupt.lock() {
                    handle.take();
                }
                if let Ok(mut guard) = state.lock() {
                    guard.take();
                }
                Ok(())
            },
            || {},
        )
        .await
    }

    async fn ensure_conn(&self, migrations: &[String]) -> Result<()> {
        self.with_state(Some(migrations.to_vec()), |_| Ok(())).await
    }

    async fn column_names(&self, query: &str) -> Result<Vec<String>> {
        let query = query.to_string();
        self.with_state(None, move |state| {
            let stmt = state
                .conn
                .prepare(&query)
                .map_err(|e| error::from_sqlite(&0usize, &e))?;
            Ok(stmt.column_names().into_iter().map(str::to_string).collect())
        })
        .await
    }

    async fn introspect_schema(&self, _schemas: &[String]) -> Result<SchemaCatalog> {
        self.with_state(None, |state| {
            introspect(&state.conn).map_err(|e| error::from_sqlite(&0usize, &e))
        })
        .await
    }
}

fn is_in_memory(uri: &str) -> bool {
    uri.is_empty() || uri == ":memory:" || uri.contains("mode=memory")
}

/// Maps a declared column type onto its SQLite affinity name.
pub fn normalize_type(decl: &str) -> String {
    if decl.is_empty() {
        return "any".into();
    }
    let lower = decl.to_ascii_lowercase();
    let affinity = if lower.contains("int") {
        "integer"
    } else if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        "text"
    } else if lower.contains("blob") {
        "blob"
    } else if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        "real"
    } else if lower.contains("bool") {
        "boolean"
    } else if lower.contains("date") || lower.contains("time") {
        "datetime"
    } else {
        return lower;
    };
    affinity.to_string()
}
