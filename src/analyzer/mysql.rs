use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use sqlparser::dialect::MySqlDialect;
use tokio::sync::Mutex;

use super::{is_select, replace_placeholders, Analyzer, AnalyzerContext};
use crate::analysis::{Analysis, Column, Identifier, Node, ParamNames, Parameter};
use crate::config::DatabaseConfig;
use crate::db::create_mysql_pool;
use crate::error::{self, Error, Result};

/// MySQL analyzer. `COM_STMT_PREPARE` returns column and parameter metadata
/// without executing anything.
pub struct MysqlAnalyzer {
    db: DatabaseConfig,
    ctx: AnalyzerContext,
    pool: Mutex<Option<mysql_async::Pool>>,
}

impl MysqlAnalyzer {
    pub fn new(db: DatabaseConfig, ctx: AnalyzerContext) -> Self {
        Self {
            db,
            ctx,
            pool: Mutex::new(None),
        }
    }

    async fn pool(&self, migrations: &[String]) -> Result<mysql_async::Pool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let uri = self.ctx.resolve_uri(&self.db, migrations).await?;
        let pool = create_mysql_pool(&uri)?;
        tracing::debug!(managed = self.db.managed, "mysql analyzer pool created");
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn conn(pool: &mysql_async::Pool) -> Result<mysql_async::Conn> {
        pool.get_conn()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn reset(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            if let Err(e) = pool.disconnect().await {
                tracing::debug!(error = %e, "mysql pool disconnect");
            }
        }
    }

    async fn describe(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let pool = self.pool(migrations).await?;
        let mut conn = Self::conn(&pool).await?;

        let stmt = conn
            .prep(query)
            .await
            .map_err(|e| error::from_mysql(node, &e))?;

        let mut columns: Vec<Column> = stmt.columns().iter().map(to_column).collect();
        let param_meta: Vec<Column> = stmt.params().iter().map(to_column).collect();
        let num_params = stmt.num_params() as usize;

        if let Err(e) = conn.close(stmt).await {
            tracing::debug!(error = %e, "closing mysql statement");
        }

        if columns.is_empty() && is_select(query) {
            columns = wrapped_columns(&mut conn, node, query).await?;
        }

        let params = if param_meta.len() == num_params {
            param_meta
                .into_iter()
                .enumerate()
                .map(|(i, meta)| {
                    let mut param = Parameter::new(i as u32 + 1, meta.data_type, params);
                    param.column.unsigned = meta.unsigned;
                    param.column.length = meta.length;
                    param
                })
                .collect()
        } else {
            (1..=num_params as u32)
                .map(|n| Parameter::new(n, "any", params))
                .collect()
        };

        Ok(Analysis { columns, params })
    }
}

/// Columns of `SELECT * FROM (q) LIMIT 0`, for statements whose prepare
/// response carried no result metadata.
async fn wrapped_columns(
    conn: &mut mysql_async::Conn,
    node: &dyn Node,
    query: &str,
) -> Result<Vec<Column>> {
    let sql = limit_zero(&replace_placeholders(&MySqlDialect {}, query));
    let mut result = conn
        .query_iter(sql)
        .await
        .map_err(|e| error::from_mysql(node, &e))?;
    let columns = result.columns_ref().iter().map(to_column).collect();
    result
        .drop_result()
        .await
        .map_err(|e| error::from_mysql(node, &e))?;
    Ok(columns)
}

fn limit_zero(query: &str) -> String {
    let inner = query.trim().trim_end_matches(';').trim_end();
    format!("SELECT * FROM ({inner}) AS _wrapper LIMIT 0")
}

fn to_column(meta: &mysql_async::Column) -> Column {
    let flags = meta.flags();
    let mut column = Column::new(
        meta.name_str(),
        type_name(meta.column_type(), flags, meta.character_set()),
    )
    .not_null(flags.contains(ColumnFlags::NOT_NULL_FLAG));

    let original = meta.org_name_str();
    if !original.is_empty() {
        column.original_name = original.into_owned();
    }
    let table = meta.org_table_str();
    if !table.is_empty() {
        column.table = Some(Identifier {
            schema: meta.schema_str().into_owned(),
            name: table.into_owned(),
        });
    }
    column.unsigned = flags.contains(ColumnFlags::UNSIGNED_FLAG);
    column.length = Some(meta.column_length()).filter(|len| *len > 0);
    column
}

const BINARY_CHARSET: u16 = 63;

/// Lowercase SQL type name for a protocol column type.
fn type_name(ty: ColumnType, flags: ColumnFlags, charset: u16) -> &'static str {
    let binary = charset == BINARY_CHARSET;
    if flags.contains(ColumnFlags::ENUM_FLAG) {
        return "enum";
    }
    if flags.contains(ColumnFlags::SET_FLAG) {
        return "set";
    }
    match ty {
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
        ColumnType::MYSQL_TYPE_TINY => "tinyint",
        ColumnType::MYSQL_TYPE_SHORT => "smallint",
        ColumnType::MYSQL_TYPE_INT24 => "mediumint",
        ColumnType::MYSQL_TYPE_LONG => "int",
        ColumnType::MYSQL_TYPE_LONGLONG => "bigint",
        ColumnType::MYSQL_TYPE_FLOAT => "float",
        ColumnType::MYSQL_TYPE_DOUBLE => "double",
        ColumnType::MYSQL_TYPE_NULL => "null",
        ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => "timestamp",
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => "date",
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => "time",
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_DATETIME2 => "datetime",
        ColumnType::MYSQL_TYPE_YEAR => "year",
        ColumnType::MYSQL_TYPE_BIT => "bit",
        ColumnType::MYSQL_TYPE_JSON => "json",
        ColumnType::MYSQL_TYPE_ENUM => "enum",
        ColumnType::MYSQL_TYPE_SET => "set",
        ColumnType::MYSQL_TYPE_GEOMETRY => "geometry",
        ColumnType::MYSQL_TYPE_VARCHAR => "varchar",
        ColumnType::MYSQL_TYPE_VAR_STRING if binary => "varbinary",
        ColumnType::MYSQL_TYPE_VAR_STRING => "varchar",
        ColumnType::MYSQL_TYPE_STRING if binary => "binary",
        ColumnType::MYSQL_TYPE_STRING => "char",
        ColumnType::MYSQL_TYPE_TINY_BLOB if binary => "tinyblob",
        ColumnType::MYSQL_TYPE_TINY_BLOB => "tinytext",
        ColumnType::MYSQL_TYPE_MEDIUM_BLOB if binary => "mediumblob",
        ColumnType::MYSQL_TYPE_MEDIUM_BLOB => "mediumtext",
        ColumnType::MYSQL_TYPE_LONG_BLOB if binary => "longblob",
        ColumnType::MYSQL_TYPE_LONG_BLOB => "longtext",
        ColumnType::MYSQL_TYPE_BLOB if binary => "blob",
        ColumnType::MYSQL_TYPE_BLOB => "text",
        _ => "any",
    }
}

#[async_trait]
impl Analyzer for MysqlAnalyzer {
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
                tracing::debug!(error = %e, "discarding mysql connection");
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
        let pool = self.pool.lock().await.clone().ok_or(Error::NotConnected)?;
        let mut conn = Self::conn(&pool).await?;
        let stmt = conn
            .prep(query)
            .await
            .map_err(|e| error::from_mysql(&0usize, &e))?;
        let names = stmt
            .columns()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        if let Err(e) = conn.close(stmt).await {
            tracing::debug!(error = %e, "closing mysql statement");
        }
        Ok(names)
    }
}
