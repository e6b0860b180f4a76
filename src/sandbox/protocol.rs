//! JSON messages exchanged with a sandboxed analyzer module.

use serde::{Deserialize, Serialize};

use crate::analysis::{Analysis, Column, Identifier, ParamNames, Parameter};
use crate::analyzer::rewrite_type;
use crate::error::{locate, Error, Result, SqlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Init,
    Prepare,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Init => "init",
            RequestKind::Prepare => "prepare",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub migrations: Vec<String>,
    pub query: String,
}

impl Request {
    pub fn init(migrations: Vec<String>) -> Self {
        Self {
            kind: RequestKind::Init,
            migrations,
            query: String::new(),
        }
    }

    pub fn prepare(query: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Prepare,
            migrations: vec![],
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub error: Option<ErrorResponse>,
    #[serde(default)]
    pub prepare: Option<PrepareResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// 1-based character position within the query, 0 when unknown
    #[serde(default)]
    pub position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PrepareResult {
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub params: Vec<ParameterInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub data_type_oid: u32,
    pub not_null: bool,
    pub is_array: bool,
    pub array_dims: u32,
    pub table_oid: u32,
    pub table_name: String,
    pub table_schema: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParameterInfo {
    pub number: u32,
    pub data_type: String,
    pub data_type_oid: u32,
    pub is_array: bool,
    pub array_dims: u32,
}

impl Response {
    pub fn parse(stdout: &[u8], stderr: &[u8]) -> Result<Self> {
        serde_json::from_slice(stdout).map_err(|e| {
            tracing::debug!(
                stdout = %String::from_utf8_lossy(stdout),
                stderr = %String::from_utf8_lossy(stderr),
                "unparseable sandbox response"
            );
            Error::Sandbox(format!("parse response: {e}"))
        })
    }

    /// The result of a `prepare` request. Module errors become SQL errors
    /// positioned relative to `node_pos`.
    pub fn into_prepare(self, node_pos: usize) -> Result<PrepareResult> {
        if !self.success {
            return Err(match self.error {
                Some(err) => Error::Sql(SqlError::new(
                    err.code,
                    err.message,
                    locate(node_pos, Some(err.position).filter(|p| *p > 0), 1),
                )),
                None => Error::Sandbox("prepare failed".into()),
            });
        }
        self.prepare
            .ok_or_else(|| Error::Sandbox("prepare result missing".into()))
    }

    /// Checks an `init` response. A failed init means the migrations did not apply.
    pub fn into_init(self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        Err(match self.error {
            Some(err) if err.code.is_empty() => Error::provision("sandbox", err.message),
            Some(err) => Error::provision("sandbox", format!("{}: {}", err.code, err.message)),
            None => Error::provision("sandbox", "initialization failed"),
        })
    }
}

impl PrepareResult {
    pub fn into_analysis(self, names: Option<&dyn ParamNames>) -> Analysis {
        let columns = self
            .columns
            .into_iter()
            .map(|col| {
                let table = (!col.table_name.is_empty()).then(|| Identifier {
                    schema: col.table_schema,
                    name: col.table_name,
                });
                let mut column = Column::new(col.name, rewrite_type(&col.data_type))
                    .not_null(col.not_null)
                    .array_dims(col.array_dims)
                    .table(table);
                column.is_array |= col.is_array;
                column
            })
            .collect();

        let params = self
            .params
            .into_iter()
            .map(|p| {
                let mut param = Parameter::new(p.number, rewrite_type(&p.data_type), names);
                param.column = param.column.array_dims(p.array_dims);
                param.column.is_array |= p.is_array;
                param
            })
            .collect();

        Analysis { columns, params }
    }
}
