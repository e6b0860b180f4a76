//! PostgreSQL analysis inside a WebAssembly module instead of a live server.
//!
//! The module is fetched from the configured URL, checked against its pinned
//! sha256, compiled once and then fed `init`/`prepare` requests.

mod loader;
mod protocol;
mod runtime;

pub use loader::{sha256_hex, VerifiedModule};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::analysis::{Analysis, Node, ParamNames};
use crate::analyzer::{run_blocking, Analyzer};
use crate::cache::CacheDirs;
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use protocol::Request;
use runtime::{Cancelled, Runtime, Session};

pub struct SandboxAnalyzer {
    config: SandboxConfig,
    cache: CacheDirs,
    runtime: tokio::sync::Mutex<Option<Arc<Runtime>>>,
    session: Arc<Mutex<Option<Session>>>,
}

impl SandboxAnalyzer {
    pub fn new(config: SandboxConfig, cache: CacheDirs) -> Self {
        Self {
            config,
            cache,
            runtime: tokio::sync::Mutex::new(None),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// The compiled module, loading and verifying it on first use.
    async fn runtime(&self) -> Result<Arc<Runtime>> {
        let mut guard = self.runtime.lock().await;
        if let Some(runtime) = guard.as_ref() {
            return Ok(runtime.clone());
        }

        let module = loader::load(&self.config, &self.cache).await?;
        tracing::info!(url = %self.config.url, sha256 = %module.sha256, "compiling sandbox module");
        let runtime = run_blocking(move || Runtime::new(&module.bytes).map(Arc::new), || {}).await?;
        *guard = Some(runtime.clone());
        Ok(runtime)
    }
}

#[async_trait]
impl Analyzer for SandboxAnalyzer {
    async fn analyze(
        &self,
        node: &dyn Node,
        query: &str,
        migrations: &[String],
        params: Option<&dyn ParamNames>,
    ) -> Result<Analysis> {
        let runtime = self.runtime().await?;
        let session = self.session.clone();
        let migrations = migrations.to_vec();
        let request = Request::prepare(query);
        let cancelled = Cancelled::default();
        let on_cancel = {
            let runtime = runtime.clone();
            let cancelled = cancelled.clone();
            move || {
                cancelled.cancel();
                runtime.interrupt();
            }
        };

        let response = run_blocking(
            move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| Error::Aborted("sandbox session".into()))?;
                let stale = guard.as_ref().map_or(true, |s| s.migrations != migrations);
                if stale {
                    guard.take();
                    *guard = Some(Session::start(&runtime, migrations, &cancelled)?);
                }
                let Some(active) = guard.as_mut() else {
                    return Err(Error::NotConnected);
                };
                let response = active.call(&request, &cancelled);
                if response.is_err() {
                    // A trapped instance is unusable; start over next time.
                    guard.take();
                }
                response
            },
            on_cancel,
        )
        .await?;

        Ok(response.into_prepare(node.pos())?.into_analysis(params))
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.clone();
        run_blocking(
            move || {
                if let Ok(mut guard) = session.lock() {
                    guard.take();
                }
                Ok(())
            },
            || {},
        )
        .await?;
        self.runtime.lock().await.take();
        Ok(())
    }

    async fn ensure_conn(&self, _migrations: &[String]) -> Result<()> {
        self.runtime().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::runtime::tests::{command_module, exported_module};
    use super::*;
    use std::time::Duration;

    const OK: &str = r#"{"success":true,"prepare":{"columns":[{"name":"id","data_type":"int4","not_null":true,"table_name":"t","table_schema":"public"}],"params":[{"number":1,"data_type":"text"}]}}"#;

    fn analyzer(dir: &std::path::Path, wat: &str, sha256: Option<String>) -> SandboxAnalyzer {
        let path = dir.join("analyzer.wat");
        std::fs::write(&path, wat).unwrap();
        let config = SandboxConfig {
            url: format!("file://{}", path.display()),
            sha256,
        };
        SandboxAnalyzer::new(config, CacheDirs::new(dir.join("cache")))
    }

    async fn instantiations(analyzer: &SandboxAnalyzer) -> usize {
        analyzer.runtime.lock().await.as_ref().unwrap().instantiations()
    }

    #[tokio::test]
    async fn test_analyze_through_exported_query() {
        let tmp = tempfile::tempdir().unwrap();
        let analyzer = analyzer(tmp.path(), &exported_module(OK), None);
        let result = analyzer
            .analyze(&0usize, "SELECT id FROM t WHERE name = $1", &[], None)
            .await
            .unwrap();
        assert_eq!(result.columns[0].name, "id");
        assert_eq!(result.columns[0].data_type, "int4");
        assert!(result.columns[0].not_null);
        assert_eq!(result.params[0].column.data_type, "text");
        analyzer.close().await.unwrap();
        analyzer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_module() {
        let tmp = tempfile::tempdir().unwrap();
        let analyzer = analyzer(tmp.path(), &command_module(OK), None);
        let result = analyzer.analyze(&0usize, "SELECT id FROM t", &[], None).await.unwrap();
        assert_eq!(result.columns.len(), 1);
    }

    #[tokio::test]
    async fn test_error_response_is_positioned() {
        let tmp = tempfile::tempdir().unwrap();
        let failing = r#"{"success":false,"error":{"code":"42703","message":"column \"x\" does not exist","position":8}}"#;
        let analyzer = analyzer(tmp.path(), &exported_module(failing), None);
        let err = analyzer
            .analyze(&50usize, "SELECT x FROM t", &[], None)
            .await
            .unwrap_err();
        let sql = err.as_sql().unwrap();
        assert_eq!(sql.code, "42703");
        assert_eq!(sql.location, 57);
    }

    #[tokio::test]
    async fn test_reinitializes_only_when_migrations_change() {
        let tmp = tempfile::tempdir().unwrap();
        let analyzer = analyzer(tmp.path(), &exported_module(OK), None);
        let v1 = vec!["CREATE TABLE t (id int)".to_string()];
        let v2 = vec!["CREATE TABLE t (id int)".to_string(), "ALTER TABLE t ADD name text".to_string()];

        analyzer.analyze(&0usize, "SELECT 1", &v1, None).await.unwrap();
        analyzer.analyze(&0usize, "SELECT 2", &v1, None).await.unwrap();
        assert_eq!(instantiations(&analyzer).await, 1);

        analyzer.analyze(&0usize, "SELECT 1", &v2, None).await.unwrap();
        assert_eq!(instantiations(&analyzer).await, 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_module() {
        let tmp = tempfile::tempdir().unwrap();
        let spinning = r#"(module (func (export "_start") (loop $spin (br $spin))))"#;
        let analyzer = analyzer(tmp.path(), spinning, None);

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            analyzer.analyze(&0usize, "SELECT 1", &[], None),
        )
        .await;
        assert!(result.is_err());

        // The interrupted instance releases the session promptly.
        tokio::time::timeout(Duration::from_secs(10), analyzer.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_instantiates() {
        let tmp = tempfile::tempdir().unwrap();
        let analyzer = analyzer(tmp.path(), &exported_module(OK), Some("ab".repeat(32)));
        let err = analyzer.analyze(&0usize, "SELECT 1", &[], None).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(analyzer.runtime.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_pinned_module_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let wat = exported_module(OK);
        let analyzer = analyzer(tmp.path(), &wat, Some(sha256_hex(wat.as_bytes())));
        analyzer.ensure_conn(&[]).await.unwrap();
        assert_eq!(instantiations(&analyzer).await, 0);
    }
}
