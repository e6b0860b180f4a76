//! Normalized analysis results shared by every engine analyzer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Column and parameter types for one analyzed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub columns: Vec<Column>,
    pub params: Vec<Parameter>,
}

/// A schema-qualified table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub schema: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Display name as reported for the result set.
    pub name: String,
    /// Engine-reported name before aliasing.
    pub original_name: String,
    /// Canonical type name for the engine.
    pub data_type: String,
    pub not_null: bool,
    pub is_array: bool,
    pub array_dims: u32,
    /// Base table, when the engine can trace the column back to one.
    pub table: Option<Identifier>,
    #[serde(default)]
    pub unsigned: bool,
    #[serde(default)]
    pub length: Option<u32>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            name,
            data_type: data_type.into(),
            ..Self::default()
        }
    }

    pub fn not_null(mut self, not_null: bool) -> Self {
        self.not_null = not_null;
        self
    }

    /// Sets the array depth. A positive depth always marks the column as an array.
    pub fn array_dims(mut self, dims: u32) -> Self {
        self.array_dims = dims;
        self.is_array = self.is_array || dims > 0;
        self
    }

    pub fn table(mut self, table: Option<Identifier>) -> Self {
        self.table = table;
        self
    }
}

/// A positional query parameter. `number` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub number: u32,
    pub column: Column,
}

impl Parameter {
    /// A nullable parameter of the given type, named through `names` when available.
    pub fn new(number: u32, data_type: impl Into<String>, names: Option<&dyn ParamNames>) -> Self {
        let name = names
            .and_then(|n| n.name_for(number as usize))
            .unwrap_or_default();
        Self {
            number,
            column: Column {
                name,
                data_type: data_type.into(),
                ..Column::default()
            },
        }
    }
}

/// The part of a parsed statement the analyzers need: its byte offset in the source.
pub trait Node: Send + Sync {
    fn pos(&self) -> usize;
}

impl Node for usize {
    fn pos(&self) -> usize {
        *self
    }
}

/// Maps 1-based parameter ordinals to the names used in the query source.
pub trait ParamNames: Send + Sync {
    fn name_for(&self, ordinal: usize) -> Option<String>;
}

/// A simple ordinal-to-name table.
#[derive(Debug, Clone, Default)]
pub struct NamedParams {
    names: HashMap<usize, String>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ordinal: usize, name: impl Into<String>) {
        self.names.insert(ordinal, name.into());
    }
}

impl FromIterator<(usize, String)> for NamedParams {
    fn from_iter<I: IntoIterator<Item = (usize, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

impl ParamNames for NamedParams {
    fn name_for(&self, ordinal: usize) -> Option<String> {
        self.names.get(&ordinal).cloned()
    }
}

/// Tables, columns and enums read back from a live database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub default_schema: String,
    pub search_path: Vec<String>,
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub tables: Vec<Table>,
    pub enums: Vec<Enum>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub rel: Identifier,
    pub columns: Vec<CatalogColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub is_array: bool,
    pub array_dims: u32,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    pub values: Vec<String>,
}

impl SchemaCatalog {
    pub fn new(default_schema: impl Into<String>) -> Self {
        Self {
            default_schema: default_schema.into(),
            ..Self::default()
        }
    }

    /// Returns the schema with `name`, creating it if needed.
    pub fn schema_mut(&mut self, name: &str) -> &mut Schema {
        let idx = match self.schemas.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.schemas.push(Schema {
                    name: name.to_string(),
                    ..Schema::default()
                });
                self.schemas.len() - 1
            }
        };
        &mut self.schemas[idx]
    }
}

impl Schema {
    /// Returns the table with `name`, creating it if needed.
    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        let idx = match self.tables.iter().position(|t| t.rel.name == name) {
            Some(idx) => idx,
            None => {
                self.tables.push(Table {
                    rel: Identifier {
                        schema: self.name.clone(),
                        name: name.to_string(),
                    },
                    columns: vec![],
                });
                self.tables.len() - 1
            }
        };
        &mut self.tables[idx]
    }

    pub fn enum_mut(&mut self, name: &str) -> &mut Enum {
        let idx = match self.enums.iter().position(|e| e.name == name) {
            Some(idx) => idx,
            None => {
                self.enums.push(Enum {
                    name: name.to_string(),
                    values: vec![],
                });
                self.enums.len() - 1
            }
        };
        &mut self.enums[idx]
    }
}
