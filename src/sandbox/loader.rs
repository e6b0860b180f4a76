//! Fetching and verifying sandbox modules.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::cache::CacheDirs;
use crate::config::SandboxConfig;
use crate::error::{Error, Result};

const MODULE_FILE: &str = "analyzer.wasm";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A module whose bytes have been checked against the configured checksum
/// (or logged, when none is configured).
#[derive(Debug, Clone)]
pub struct VerifiedModule {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

/// Returns the module bytes for `config`.
///
/// Pinned modules are served from `plugins/<sha256>/` when present. A
/// checksum mismatch is fatal and the bytes are discarded.
pub async fn load(config: &SandboxConfig, cache: &CacheDirs) -> Result<VerifiedModule> {
    let expected = config
        .sha256
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());

    if let Some(expected) = &expected {
        if let Some(bytes) = read_cached(cache, expected).await {
            tracing::debug!(sha256 = %expected, "sandbox module served from cache");
            return Ok(VerifiedModule {
                bytes,
                sha256: expected.clone(),
            });
        }
    }

    let bytes = fetch(&config.url).await?;
    let actual = sha256_hex(&bytes);

    match &expected {
        Some(expected) if *expected != actual => {
            return Err(Error::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Some(_) => {
            if let Err(e) = write_cached(cache, &actual, &bytes).await {
                tracing::warn!(error = %e, "caching sandbox module failed");
            }
        }
        None => {
            tracing::warn!(
                url = %config.url,
                sha256 = %actual,
                "sandbox module has no sha256 configured; pin it to verify future loads"
            );
        }
    }

    Ok(VerifiedModule {
        bytes,
        sha256: actual,
    })
}

fn cached_path(cache: &CacheDirs, sha256: &str) -> Result<PathBuf> {
    Ok(cache.plugins_dir()?.join(sha256).join(MODULE_FILE))
}

/// Cached bytes for `sha256`, if present and intact.
async fn read_cached(cache: &CacheDirs, sha256: &str) -> Option<Vec<u8>> {
    let path = cached_path(cache, sha256).ok()?;
    let bytes = tokio::fs::read(&path).await.ok()?;
    if sha256_hex(&bytes) != sha256 {
        tracing::warn!(path = %path.display(), "ignoring corrupt cached sandbox module");
        return None;
    }
    Some(bytes)
}

async fn write_cached(cache: &CacheDirs, sha256: &str, bytes: &[u8]) -> Result<()> {
    let path = cached_path(cache, sha256)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, bytes).await?;
    Ok(())
}

async fn fetch(url: &str) -> Result<Vec<u8>> {
    if let Some(path) = url.strip_prefix("file://") {
        return tokio::fs::read(path)
            .await
            .map_err(|e| Error::Sandbox(format!("open {path}: {e}")));
    }
    if !url.starts_with("https://") {
        return Err(Error::Config(format!("unsupported sandbox module url: {url}")));
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("dbprobe/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Connection(e.to_string()))?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Connection(format!("fetch {url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Connection(format!("fetch {url}: {}", resp.status())));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Connection(format!("fetch {url}: {e}")))?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_file(dir: &std::path::Path, contents: &[u8]) -> String {
        let path = dir.join("module.wat");
        std::fs::write(&path, contents).unwrap();
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            url: module_file(tmp.path(), b"(module)"),
            sha256: Some("00".repeat(32)),
        };
        let err = load(&config, &CacheDirs::new(tmp.path().join("cache")))
            .await
            .unwrap_err();
        match err {
            Error::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, "00".repeat(32));
                assert_eq!(actual, sha256_hex(b"(module)"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was cached.
        assert!(!tmp.path().join("cache/plugins").join("00".repeat(32)).exists());
    }

    #[tokio::test]
    async fn test_pinned_module_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let sha = sha256_hex(b"(module)");
        let cache = CacheDirs::new(tmp.path().join("cache"));
        let config = SandboxConfig {
            url: module_file(tmp.path(), b"(module)"),
            sha256: Some(sha.to_uppercase()),
        };
        let module = load(&config, &cache).await.unwrap();
        assert_eq!(module.sha256, sha);
        assert!(cached_path(&cache, &sha).unwrap().is_file());

        // The source can disappear once cached.
        std::fs::remove_file(tmp.path().join("module.wat")).unwrap();
        let again = load(&config, &cache).await.unwrap();
        assert_eq!(again.bytes, b"(module)");
    }

    #[tokio::test]
    async fn test_unpinned_module_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            url: module_file(tmp.path(), b"(module)"),
            sha256: None,
        };
        let module = load(&config, &CacheDirs::new(tmp.path())).await.unwrap();
        assert_eq!(module.sha256, sha256_hex(b"(module)"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            url: "http://example.com/analyzer.wasm".into(),
            sha256: None,
        };
        assert!(matches!(
            load(&config, &CacheDirs::new(tmp.path())).await,
            Err(Error::Config(_))
        ));
    }
}
