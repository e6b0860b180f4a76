//! On-disk cache locations.
//!
//! The root is `$DBPROBE_CACHE` when set, otherwise `dbprobe` under the
//! platform cache directory. Verified sandbox modules live in `plugins/`,
//! persisted analyses in `query_analysis/`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirs {
    root: PathBuf,
}

impl CacheDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self> {
        if let Ok(dir) = std::env::var("DBPROBE_CACHE") {
            if !dir.is_empty() {
                return Ok(Self::new(dir));
            }
        }
        let base = dirs::cache_dir()
            .ok_or_else(|| Error::Config("unable to determine a cache directory".into()))?;
        Ok(Self::new(base.join("dbprobe")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins_dir(&self) -> Result<PathBuf> {
        self.ensure("plugins")
    }

    pub fn analysis_dir(&self) -> Result<PathBuf> {
        self.ensure("query_analysis")
    }

    fn ensure(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdirectories_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = CacheDirs::new(tmp.path());
        let plugins = dirs.plugins_dir().unwrap();
        let analysis = dirs.analysis_dir().unwrap();
        assert!(plugins.is_dir());
        assert!(analysis.is_dir());
        assert_eq!(plugins, tmp.path().join("plugins"));
        assert_eq!(analysis, tmp.path().join("query_analysis"));
    }
}
