//! Analyses persisted on disk, keyed by everything that can change them.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use super::Analyzer;
use crate::analysis::{Analysis, Node, ParamNames, SchemaCatalog};
use crate::cache::CacheDirs;
use crate::config::Config;
use crate::error::Result;

/// Wraps an analyzer so that repeat analyses of a managed database are read
/// back from `query_analysis/` instead of asking the engine again.
///
/// Only managed databases are cached: their schema is fully determined by the
/// migrations, which are part of the key. Any cache failure degrades to a
/// live analysis.
pub struct CachedAnalyzer {
    inner: Box<dyn Analyzer>,
    managed: bool,
    config_json: String,
    cache: CacheDirs,
}

impl CachedAnalyzer {
    pub fn new(inner: Box<dyn Analyzer>, config: &Config, cache: CacheDirs) -> Result<Self> {
        Ok(Self {
            inner,
            managed: config.database.managed,
            config_json: serde_json::to_string(config)?,
            cache,
        })
    }

    fn key(&self, query: &str, migrations: &[String]) -> String {
        let mut hasher = Sha256::new();
        for part in [env!("CARGO_PKG_VERSION"), self.config_json.as_str()]
            .into_iter()
            .chain(migrations.iter().map(String::as_str))
            .chain([query])
        {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.cache.analysis_dir()?.join(format!("{key}.json")))
    }

    async fn load(&self, key: &str) -> Result<Option<Analysis>> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, key: &str, analysis: &Analysis) -> Result<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension(format!("json.{}", std::process::id()));
        tokio::fs::write(&tmp, serde_json::to_vec(analysis)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl Analyzer for CachedAnalyzer {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        if !self.managed {
            return self.inner.analyze(node, query, migrations, params).await;
        }

        let key = self.key(query, migrations);
        match self.load(&key).await {
            Ok(Some(analysis)) => {
                tracing::debug!(key = %key, "analysis cache hit");
                return Ok(analysis);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "reading cached analysis failed"),
        }

        let analysis = self.inner.analyze(node, query, migrations, params).await?;
        if let Err(e) = self.store(&key, &analysis).await {
            tracing::warn!(key = %key, error = %e, "saving analysis to disk failed");
        }
        Ok(analysis)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn ensure_conn(&self, migrations: &[String]) -> Result<()> {
        self.inner.ensure_conn(migrations).await
    }

    async fn column_names(&self, query: &str) -> Result<Vec<String>> {
        self.inner.column_names(query).await
    }

    async fn introspect_schema(&self, schemas: &[String]) -> Result<SchemaCatalog> {
        self.inner.introspect_schema(schemas).await
    }
}
