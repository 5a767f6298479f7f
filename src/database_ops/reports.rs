//! Shapes of the reference input files. Device reports stay as raw
//! `serde_json::Value`s; see `device_import` for how they are read.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// One entry of `extensions.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionEntry {
    pub name: String,
    /// Rendered coverage text, e.g. `<span>95.0</span>`.
    #[serde(default)]
    pub coverage: Option<Value>,
    #[serde(default)]
    pub coverage_unsupported: Option<Value>,
    #[serde(default)]
    pub features_url: Option<String>,
    #[serde(default)]
    pub properties_url: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// One entry of a platform list in `extensions_by_platform.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformCoverageEntry {
    pub name: String,
    #[serde(default)]
    pub coverage: Option<Value>,
    #[serde(default)]
    pub coverage_unsupported: Option<Value>,
}

/// `extensions_by_platform.json`: platform name -> coverage entries.
pub type ExtensionsByPlatform = HashMap<String, Vec<PlatformCoverageEntry>>;

/// `summary.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeSummary {
    #[serde(default)]
    pub scrape_date: Option<String>,
    #[serde(default)]
    pub total_extensions: i64,
    #[serde(default)]
    pub total_reports: i64,
    #[serde(default)]
    pub platforms: Vec<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}
