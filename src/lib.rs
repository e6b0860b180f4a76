pub mod analysis;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod sandbox;

pub use analysis::{Analysis, Column, Identifier, NamedParams, Node, ParamNames, Parameter, SchemaCatalog};
pub use analyzer::{Analyzer, AnalyzerContext, AnalyzerRegistry};
pub use config::{Config, DatabaseConfig, Engine};
pub use db::ManagedClient;
pub use error::{Error, ErrorCategory, Result, SqlError};
