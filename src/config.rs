use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::util::env::{env_opt, env_parse};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_DEVICE_BATCH_SIZE: usize = 200;
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Run parameters for one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Directory holding the four input files.
    pub data_dir: PathBuf,
    /// Device reports handed to the device importer per batch.
    pub device_batch_size: usize,
    /// Rows per bulk INSERT statement.
    pub insert_batch_size: usize,
    /// In-flight batch limit for both the wave runner and the stream reader.
    pub concurrency: usize,
    pub max_connections: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            device_batch_size: DEFAULT_DEVICE_BATCH_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ImportConfig {
    /// Defaults overridden by `IMPORT_*` / `DB_MAX_CONNS` env vars.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env_opt("IMPORT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            device_batch_size: env_parse("IMPORT_DEVICE_BATCH_SIZE", defaults.device_batch_size),
            insert_batch_size: env_parse("IMPORT_INSERT_BATCH_SIZE", defaults.insert_batch_size),
            concurrency: env_parse("IMPORT_CONCURRENCY", defaults.concurrency),
            max_connections: env_parse("DB_MAX_CONNS", defaults.max_connections),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_batch_size == 0 {
            bail!("device batch size must be at least 1");
        }
        if self.insert_batch_size == 0 {
            bail!("insert batch size must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("max connections must be at least 1");
        }
        Ok(())
    }

    pub fn files(&self) -> DataFiles {
        DataFiles::new(&self.data_dir)
    }
}

/// Input file locations under the data directory.
#[derive(Debug, Clone)]
pub struct DataFiles {
    pub extensions: PathBuf,
    pub extensions_by_platform: PathBuf,
    pub summary: PathBuf,
    pub device_reports: PathBuf,
}

impl DataFiles {
    pub fn new(dir: &Path) -> Self {
        Self {
            extensions: dir.join("extensions.json"),
            extensions_by_platform: dir.join("extensions_by_platform.json"),
            summary: dir.join("summary.json"),
            device_reports: dir.join("device_reports.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ImportConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut cfg = ImportConfig::default();
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ImportConfig::default();
        cfg.device_batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ImportConfig::default();
        cfg.insert_batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn files_resolve_under_data_dir() {
        let files = DataFiles::new(Path::new("/tmp/dump"));
        assert_eq!(files.extensions, Path::new("/tmp/dump/extensions.json"));
        assert_eq!(files.device_reports, Path::new("/tmp/dump/device_reports.json"));
        assert_eq!(
            files.extensions_by_platform,
            Path::new("/tmp/dump/extensions_by_platform.json")
        );
        assert_eq!(files.summary, Path::new("/tmp/dump/summary.json"));
    }
}
