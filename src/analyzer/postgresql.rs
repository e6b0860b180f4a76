use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use super::{Analyzer, AnalyzerContext, Memo};
use crate::analysis::{
    Analysis, CatalogColumn, Column, Identifier, Node, ParamNames, Parameter, SchemaCatalog,
};
use crate::config::DatabaseConfig;
use crate::db::create_pool;
use crate::error::{self, Error, Result};

const COLUMN_QUERY: &str = "
SELECT
    pg_catalog.format_type(pg_attribute.atttypid, pg_attribute.atttypmod) AS data_type,
    pg_attribute.attnotnull AS not_null,
    pg_attribute.attndims::int4 AS array_dims
FROM pg_catalog.pg_attribute
WHERE attrelid = $1 AND attnum = $2";

const TABLE_QUERY: &str = "
SELECT
    pg_class.relname AS table_name,
    pg_namespace.nspname AS schema_name
FROM pg_catalog.pg_class
JOIN pg_catalog.pg_namespace ON pg_namespace.oid = pg_class.relnamespace
WHERE pg_class.oid = $1";

const FORMAT_QUERY: &str = "SELECT pg_catalog.format_type($1, $2)";

const INTROSPECT_TABLES_QUERY: &str = "
SELECT
    n.nspname AS schema_name,
    c.relname AS table_name,
    a.attname AS column_name,
    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
    a.attnotnull AS not_null,
    a.attndims::int4 AS array_dims,
    COALESCE(
        (SELECT true FROM pg_catalog.pg_index i
         WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)),
        false
    ) AS is_primary_key
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
WHERE c.relkind IN ('r', 'v', 'p')
    AND a.attnum > 0
    AND NOT a.attisdropped
    AND n.nspname::text = ANY($1)
ORDER BY n.nspname, c.relname, a.attnum";

const INTROSPECT_ENUMS_QUERY: &str = "
SELECT
    n.nspname AS schema_name,
    t.typname AS type_name,
    e.enumlabel AS enum_value
FROM pg_catalog.pg_type t
JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
JOIN pg_catalog.pg_enum e ON e.enumtypid = t.oid
WHERE t.typtype = 'e' AND n.nspname::text = ANY($1)
ORDER BY n.nspname, t.typname, e.enumsortorder";

#[derive(Debug, Clone)]
struct PgColumn {
    data_type: String,
    not_null: bool,
    array_dims: u32,
}

/// PostgreSQL analyzer: prepares the query over the extended protocol and
/// resolves each described field against the system catalog.
pub struct PostgresAnalyzer {
    db: DatabaseConfig,
    ctx: AnalyzerContext,
    pool: Mutex<Option<Pool>>,
    columns: Memo<(u32, i16), PgColumn>,
    tables: Memo<u32, Identifier>,
    formats: Memo<(u32, i32), String>,
}

impl PostgresAnalyzer {
    pub fn new(db: DatabaseConfig, ctx: AnalyzerContext) -> Self {
        Self {
            db,
            ctx,
            pool: Mutex::new(None),
            columns: Memo::new(),
            tables: Memo::new(),
            formats: Memo::new(),
        }
    }

    async fn pool(&self, migrations: &[String]) -> Result<Pool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let uri = self.ctx.resolve_uri(&self.db, migrations).await?;
        let pool = create_pool(&uri)?;
        tracing::debug!(managed = self.db.managed, "postgres analyzer pool created");
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn connected(&self) -> Result<Pool> {
        self.pool.lock().await.clone().ok_or(Error::NotConnected)
    }

    async fn checkout(pool: &Pool) -> Result<deadpool_postgres::Object> {
        pool.get()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    /// Forget the pool and everything learned through it.
    async fn reset(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close();
        }
        self.columns.clear();
        self.tables.clear();
        self.formats.clear();
    }

    async fn column_info(
        &self,
        lookup: &dyn CatalogLookup,
        node: &dyn Node,
        table_oid: u32,
        attnum: i16,
    ) -> Result<PgColumn> {
        self.columns
            .get_or_try_insert((table_oid, attnum), || lookup.column(node, table_oid, attnum))
            .await
    }

    async fn table_info(&self, lookup: &dyn CatalogLookup, node: &dyn Node, table_oid: u32) -> Result<Identifier> {
        self.tables
            .get_or_try_insert(table_oid, || lookup.table(node, table_oid))
            .await
    }

    async fn format_type(&self, lookup: &dyn CatalogLookup, node: &dyn Node, oid: u32, modifier: i32) -> Result<String> {
        self.formats
            .get_or_try_insert((oid, modifier), || lookup.format_type(node, oid, modifier))
            .await
    }

    async fn describe(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let pool = self.pool(migrations).await?;
        let client = Self::checkout(&pool).await?;

        // Dropping the statement closes it on the server.
        let stmt = client
            .prepare(query)
            .await
            .map_err(|e| error::from_postgres(node, &e))?;

        let fields: Vec<Field> = stmt
            .columns()
            .iter()
            .map(|c| Field {
                name: c.name().to_string(),
                table_oid: c.table_oid(),
                column_id: c.column_id(),
                type_oid: c.type_().oid(),
            })
            .collect();
        let param_oids: Vec<u32> = stmt.params().iter().map(|t| t.oid()).collect();
        let client: &Client = &client;
        self.resolve(client, node, &fields, &param_oids, params).await
    }

    /// Turns described fields and parameter types into an analysis, asking
    /// the catalog only about what the memos do not know yet.
    async fn resolve(
        &self,
        lookup: &dyn CatalogLookup,
        node: &dyn Node,
        fields: &[Field],
        param_oids: &[u32],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let mut result = Analysis::default();
        for field in fields {
            let column = match (field.table_oid, field.column_id) {
                (Some(table_oid), Some(attnum)) if table_oid > 0 => {
                    let col = self.column_info(lookup, node, table_oid, attnum).await?;
                    let table = self.table_info(lookup, node, table_oid).await?;
                    let (data_type, dims) = parse_type(&col.data_type);
                    Column::new(&field.name, data_type)
                        .not_null(col.not_null)
                        .array_dims(dims.max(col.array_dims))
                        .table(Some(table))
                }
                _ => {
                    let formatted = self.format_type(lookup, node, field.type_oid, -1).await?;
                    let (data_type, dims) = parse_type(&formatted);
                    Column::new(&field.name, data_type).array_dims(dims)
                }
            };
            result.columns.push(column);
        }

        for (i, oid) in param_oids.iter().enumerate() {
            let formatted = self.format_type(lookup, node, *oid, -1).await?;
            let (data_type, dims) = parse_type(&formatted);
            let mut param = Parameter::new(i as u32 + 1, data_type, params);
            param.column = param.column.array_dims(dims);
            result.params.push(param);
        }

        Ok(result)
    }
}

/// A result field as the server describes it.
#[derive(Debug, Clone)]
struct Field {
    name: String,
    table_oid: Option<u32>,
    column_id: Option<i16>,
    type_oid: u32,
}

/// The system catalog queries a description is resolved with.
#[async_trait]
trait CatalogLookup: Send + Sync {
    async fn column(&self, node: &dyn Node, table_oid: u32, attnum: i16) -> Result<PgColumn>;
    async fn table(&self, node: &dyn Node, table_oid: u32) -> Result<Identifier>;
    async fn format_type(&self, node: &dyn Node, oid: u32, modifier: i32) -> Result<String>;
}

#[async_trait]
impl CatalogLookup for Client {
    async fn column(&self, node: &dyn Node, table_oid: u32, attnum: i16) -> Result<PgColumn> {
        let row = self
            .query_one(COLUMN_QUERY, &[&table_oid, &attnum])
            .await
            .map_err(|e| error::from_postgres(node, &e))?;
        Ok(PgColumn {
            data_type: row.try_get("data_type").map_err(|e| error::from_postgres(node, &e))?,
            not_null: row.try_get("not_null").map_err(|e| error::from_postgres(node, &e))?,
            array_dims: row
                .try_get::<_, i32>("array_dims")
                .map_err(|e| error::from_postgres(node, &e))?
                .max(0) as u32,
        })
    }

    async fn table(&self, node: &dyn Node, table_oid: u32) -> Result<Identifier> {
        let row = self
            .query_one(TABLE_QUERY, &[&table_oid])
            .await
            .map_err(|e| error::from_postgres(node, &e))?;
        Ok(Identifier {
            schema: row.try_get("schema_name").map_err(|e| error::from_postgres(node, &e))?,
            name: row.try_get("table_name").map_err(|e| error::from_postgres(node, &e))?,
        })
    }

    async fn format_type(&self, node: &dyn Node, oid: u32, modifier: i32) -> Result<String> {
        let row = self
            .query_one(FORMAT_QUERY, &[&oid, &modifier])
            .await
            .map_err(|e| error::from_postgres(node, &e))?;
        let formatted: Option<String> = row.try_get(0).map_err(|e| error::from_postgres(node, &e))?;
        Ok(formatted.unwrap_or_else(|| "???".to_string()))
    }
}

#[async_trait]
impl Analyzer for PostgresAnalyzer {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let result = self.describe(node, query, migrations, params).await;
        if let Err(e) = &result {
            if e.is_connection() {
                tracing::debug!(error = %e, "discarding postgres connection");
                self.reset().await;
            }
        }
        result
    }

    async fn close(&self) -> Result<()> {
        self.reset().await;
        Ok(())
    }

    async fn ensure_conn(&self, migrations: &[String]) -> Result<()> {
        self.pool(migrations).await.map(|_| ())
    }

    async fn column_names(&self, query: &str) -> Result<Vec<String>> {
        let pool = self.connected().await?;
        let client = Self::checkout(&pool).await?;
        let stmt = client
            .prepare(query)
            .await
            .map_err(|e| error::from_postgres(&0usize, &e))?;
        Ok(stmt.columns().iter().map(|c| c.name().to_string()).collect())
    }

    async fn introspect_schema(&self, schemas: &[String]) -> Result<SchemaCatalog> {
        let pool = self.connected().await?;
        let client = Self::checkout(&pool).await?;
        let node = 0usize;

        let rows = client
            .query(INTROSPECT_TABLES_QUERY, &[&schemas])
            .await
            .map_err(|e| error::from_postgres(&node, &e))?;
        let enum_rows = client
            .query(INTROSPECT_ENUMS_QUERY, &[&schemas])
            .await
            .map_err(|e| error::from_postgres(&node, &e))?;

        let mut catalog = SchemaCatalog::new("public");
        catalog.search_path = schemas.to_vec();
        for name in schemas {
            catalog.schema_mut(name);
        }

        for row in rows {
            let get = |col: &str| -> Result<String> {
                row.try_get(col).map_err(|e| error::from_postgres(&node, &e))
            };
            let schema = get("schema_name")?;
            let table = get("table_name")?;
            let (data_type, dims) = parse_type(&get("data_type")?);
            let array_dims = row
                .try_get::<_, i32>("array_dims")
                .map_err(|e| error::from_postgres(&node, &e))?
                .max(0) as u32;
            let dims = dims.max(array_dims);
            let column = CatalogColumn {
                name: get("column_name")?,
                data_type,
                not_null: row.try_get("not_null").map_err(|e| error::from_postgres(&node, &e))?,
                is_array: dims > 0,
                array_dims: dims,
                is_primary_key: row
                    .try_get("is_primary_key")
                    .map_err(|e| error::from_postgres(&node, &e))?,
            };
            catalog.schema_mut(&schema).table_mut(&table).columns.push(column);
        }

        for row in enum_rows {
            let get = |col: &str| -> Result<String> {
                row.try_get(col).map_err(|e| error::from_postgres(&node, &e))
            };
            let schema = get("schema_name")?;
            let name = get("type_name")?;
            let value = get("enum_value")?;
            catalog.schema_mut(&schema).enum_mut(&name).values.push(value);
        }

        Ok(catalog)
    }
}

/// Canonical catalog names for the verbose spellings `format_type` produces.
pub fn rewrite_type(dt: &str) -> String {
    if dt.starts_with("character(") {
        return "pg_catalog.bpchar".into();
    }
    if dt.starts_with("character varying") {
        return "pg_catalog.varchar".into();
    }
    if dt.starts_with("bit varying") {
        return "pg_catalog.varbit".into();
    }
    if dt.starts_with("bit(") {
        return "pg_catalog.bit".into();
    }
    match dt {
        "bpchar" => "pg_catalog.bpchar",
        "timestamp without time zone" => "pg_catalog.timestamp",
        "timestamp with time zone" => "pg_catalog.timestamptz",
        "time without time zone" => "pg_catalog.time",
        "time with time zone" => "pg_catalog.timetz",
        other => other,
    }
    .to_string()
}

/// Strips `[]` suffixes, returning the rewritten element type and the number
/// of array dimensions.
pub fn parse_type(dt: &str) -> (String, u32) {
    let mut base = dt;
    let mut dims = 0;
    while let Some(trimmed) = base.strip_suffix("[]") {
        base = trimmed;
        dims += 1;
    }
    (rewrite_type(base), dims)
}
