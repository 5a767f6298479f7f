//! Reference data import: extensions, coverage, and the run summary.
//!
//! The three reference files are small, so they are read whole. Extensions
//! are upserted first because every other table keys off their ids; the
//! resulting name -> id map is handed to the device import.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::config::{DataFiles, ImportConfig};
use crate::database_ops::batching::{chunk, run_in_waves};
use crate::database_ops::db::{rows_per_statement, BulkRow, ConflictPolicy, Db};
use crate::database_ops::reports::{
    ExtensionEntry, ExtensionsByPlatform, PlatformCoverageEntry, ScrapeSummary,
};
use crate::database_ops::rows::{CoverageRow, ExtensionRow, ScrapeMetaRow};
use crate::normalization::platform::Platform;
use crate::normalization::sanitize::{parse_coverage_value, sanitize_text};

/// Extension name -> `extensions.id`.
pub type ExtensionIdMap = HashMap<String, i64>;

#[derive(Debug, Clone, Default)]
pub struct ReferenceImportSummary {
    pub extensions_in_file: usize,
    pub extensions_upserted: usize,
    /// Ids that were not echoed by the upsert and had to be looked up.
    pub ids_resolved_by_lookup: usize,
    pub coverage_rows_written: u64,
    pub coverage_skipped_unknown: usize,
    pub platform_rows_written: u64,
    pub platform_skipped_unknown: usize,
    pub platforms_imported: Vec<&'static str>,
}

pub struct ReferenceImport {
    pub extension_ids: ExtensionIdMap,
    pub summary: ReferenceImportSummary,
}

/// The three small reference files, fully loaded.
pub struct ReferenceData {
    pub extensions: Vec<ExtensionEntry>,
    pub by_platform: ExtensionsByPlatform,
    pub summary: ScrapeSummary,
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

pub async fn load_reference_data(files: &DataFiles) -> Result<ReferenceData> {
    Ok(ReferenceData {
        extensions: read_json(&files.extensions).await?,
        by_platform: read_json(&files.extensions_by_platform).await?,
        summary: read_json(&files.summary).await?,
    })
}

#[instrument(skip_all)]
pub async fn import_reference(db: &Db, config: &ImportConfig) -> Result<ReferenceImport> {
    let data = load_reference_data(&config.files()).await?;
    import_reference_data(db, config, &data).await
}

/// Upsert extensions, then coverage rows, then one `scrape_meta` row.
pub async fn import_reference_data(
    db: &Db,
    config: &ImportConfig,
    data: &ReferenceData,
) -> Result<ReferenceImport> {
    let mut summary = ReferenceImportSummary {
        extensions_in_file: data.extensions.len(),
        ..Default::default()
    };
    info!(
        extensions = data.extensions.len(),
        platforms = data.by_platform.len(),
        total_reports = data.summary.total_reports,
        "reference files loaded"
    );

    let rows = extension_rows(&data.extensions);
    summary.extensions_upserted = rows.len();
    let (extension_ids, recovered) = upsert_extensions(db, config, rows).await?;
    summary.ids_resolved_by_lookup = recovered;
    info!(mapped = extension_ids.len(), recovered, "extension ids mapped");

    let (all_rows, skipped) =
        all_platform_coverage_rows(&data.extensions, &extension_ids, data.summary.total_reports);
    summary.coverage_skipped_unknown = skipped;
    summary.coverage_rows_written = insert_coverage(db, config, "coverage:all", all_rows).await?;

    for platform in Platform::KNOWN {
        let Some(entries) = data.by_platform.get(platform.as_str()) else {
            continue;
        };
        if entries.is_empty() {
            continue;
        }
        let (rows, skipped) = platform_coverage_rows(platform, entries, &extension_ids);
        summary.platform_skipped_unknown += skipped;
        if rows.is_empty() {
            continue;
        }
        let label = format!("coverage:{platform}");
        summary.platform_rows_written += insert_coverage(db, config, &label, rows).await?;
        summary.platforms_imported.push(platform.as_str());
    }

    let meta = scrape_meta_row(&data.summary);
    db.bulk_insert(std::slice::from_ref(&meta), ConflictPolicy::Reject)
        .await
        .context("insert scrape_meta")?;

    info!(
        extensions = summary.extensions_upserted,
        coverage_rows = summary.coverage_rows_written,
        platform_rows = summary.platform_rows_written,
        platforms = ?summary.platforms_imported,
        "reference import complete"
    );
    Ok(ReferenceImport {
        extension_ids,
        summary,
    })
}

/// Sanitized, de-duplicated extension rows. A repeated name keeps its first
/// position but takes the values of the last occurrence.
pub fn extension_rows(entries: &[ExtensionEntry]) -> Vec<ExtensionRow> {
    let mut out: Vec<ExtensionRow> = Vec::with_capacity(entries.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let name = sanitize_text(Some(&entry.name));
        if name.is_empty() {
            continue;
        }
        let row = ExtensionRow {
            name: name.clone(),
            date_added: parse_date_added(entry.date.as_deref()),
            has_features: entry.features_url.is_some(),
            has_properties: entry.properties_url.is_some(),
        };
        match index.get(&name) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(name, out.len());
                out.push(row);
            }
        }
    }
    out
}

/// `YYYY-MM-DD`, optionally followed by a time part.
pub fn parse_date_added(raw: Option<&str>) -> Option<NaiveDate> {
    let t = raw?.trim();
    let day = t.get(..10).unwrap_or(t);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Devices implied by a coverage percentage of `total_reports`.
pub fn device_count(percent: f64, total_reports: i64) -> i64 {
    (percent / 100.0 * total_reports as f64).round() as i64
}

/// Aggregate ("all") coverage rows; returns the rows and how many entries were
/// skipped because their extension has no id.
pub fn all_platform_coverage_rows(
    entries: &[ExtensionEntry],
    ids: &ExtensionIdMap,
    total_reports: i64,
) -> (Vec<CoverageRow>, usize) {
    let mut rows = Vec::with_capacity(entries.len());
    let mut seen = HashSet::with_capacity(entries.len());
    let mut skipped = 0;
    for entry in entries {
        let Some(&extension_id) = ids.get(&sanitize_text(Some(&entry.name))) else {
            skipped += 1;
            continue;
        };
        // first write wins, same as the conflict policy
        if !seen.insert(extension_id) {
            continue;
        }
        let percent = parse_coverage_value(entry.coverage.as_ref());
        rows.push(CoverageRow {
            extension_id,
            platform: Platform::All.as_str(),
            coverage_percent: round2(percent),
            device_count: device_count(percent, total_reports),
            total_devices: total_reports,
        });
    }
    (rows, skipped)
}

/// Per-platform coverage rows. Device and total counts are not derived per
/// platform and stay zero.
pub fn platform_coverage_rows(
    platform: Platform,
    entries: &[PlatformCoverageEntry],
    ids: &ExtensionIdMap,
) -> (Vec<CoverageRow>, usize) {
    let mut rows = Vec::with_capacity(entries.len());
    let mut seen = HashSet::with_capacity(entries.len());
    let mut skipped = 0;
    for entry in entries {
        let Some(&extension_id) = ids.get(&sanitize_text(Some(&entry.name))) else {
            skipped += 1;
            continue;
        };
        if !seen.insert(extension_id) {
            continue;
        }
        rows.push(CoverageRow {
            extension_id,
            platform: platform.as_str(),
            coverage_percent: round2(parse_coverage_value(entry.coverage.as_ref())),
            device_count: 0,
            total_devices: 0,
        });
    }
    (rows, skipped)
}

pub fn scrape_meta_row(summary: &ScrapeSummary) -> ScrapeMetaRow {
    ScrapeMetaRow {
        scrape_date: summary.scrape_date.clone(),
        total_extensions: summary.total_extensions,
        total_reports: summary.total_reports,
        platforms: serde_json::Value::Array(summary.platforms.clone()),
        source: summary.source.clone(),
        license: summary.license.clone(),
    }
}

async fn upsert_extensions(
    db: &Db,
    config: &ImportConfig,
    rows: Vec<ExtensionRow>,
) -> Result<(ExtensionIdMap, usize)> {
    let batches = chunk(rows, rows_per_statement::<ExtensionRow>(config.insert_batch_size));
    let waves = run_in_waves("extensions", batches, config.concurrency, |batch| async move {
        // DO UPDATE returns a row for conflicting names too.
        let returned: Vec<(i64, String)> = db
            .bulk_insert_returning(&batch, ConflictPolicy::UpdateAll, "id, name")
            .await?;
        Ok::<_, anyhow::Error>((batch, returned))
    })
    .await
    .context("upsert extensions")?;

    let mut ids = ExtensionIdMap::new();
    let mut missing: Vec<String> = Vec::new();
    for (batch, returned) in waves {
        ids.extend(returned.into_iter().map(|(id, name)| (name, id)));
        missing.extend(
            batch
                .into_iter()
                .filter(|row| !ids.contains_key(&row.name))
                .map(|row| row.name),
        );
    }

    let recovered = if missing.is_empty() {
        0
    } else {
        warn!(
            missing = missing.len(),
            "extension upsert did not echo every id; resolving by name"
        );
        let found = fetch_extension_ids(db, &missing).await?;
        let n = found.len();
        ids.extend(found);
        n
    };
    Ok((ids, recovered))
}

async fn fetch_extension_ids(db: &Db, names: &[String]) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM extensions WHERE name = ANY($1)")
        .persistent(false)
        .bind(names)
        .fetch_all(&db.pool)
        .await
        .context("look up extension ids")?;
    Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
}

async fn insert_coverage(
    db: &Db,
    config: &ImportConfig,
    label: &str,
    rows: Vec<CoverageRow>,
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let batches = chunk(rows, rows_per_statement::<CoverageRow>(config.insert_batch_size));
    let written = run_in_waves(label, batches, config.concurrency, |batch| async move {
        db.bulk_insert(&batch, ConflictPolicy::Ignore).await
    })
    .await
    .with_context(|| format!("insert {} rows ({label})", CoverageRow::TABLE))?;
    Ok(written.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, coverage: &str, features: bool, properties: bool) -> ExtensionEntry {
        ExtensionEntry {
            name: name.to_string(),
            coverage: Some(json!(coverage)),
            coverage_unsupported: None,
            features_url: features.then(|| "f".to_string()),
            properties_url: properties.then(|| "p".to_string()),
            date: Some("2020-01-01".to_string()),
        }
    }

    #[test]
    fn extension_flags_follow_urls() {
        let rows = extension_rows(&[entry("VK_KHR_swapchain", "<span>95.0</span>", false, true)]);
        assert_eq!(
            rows,
            vec![ExtensionRow {
                name: "VK_KHR_swapchain".into(),
                date_added: NaiveDate::from_ymd_opt(2020, 1, 1),
                has_features: false,
                has_properties: true,
            }]
        );
    }

    #[test]
    fn duplicate_extension_names_keep_latest_values() {
        let rows = extension_rows(&[
            entry("VK_A", "", false, false),
            entry("VK_B", "", false, false),
            entry(" VK_A\u{1} ", "", true, true),
            entry("  ", "", true, true),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "VK_A");
        assert!(rows[0].has_features && rows[0].has_properties);
        assert_eq!(rows[1].name, "VK_B");
    }

    #[test]
    fn date_parsing_is_lenient() {
        assert_eq!(parse_date_added(Some("2021-06-30")), NaiveDate::from_ymd_opt(2021, 6, 30));
        assert_eq!(
            parse_date_added(Some("2021-06-30T12:00:00Z")),
            NaiveDate::from_ymd_opt(2021, 6, 30)
        );
        assert_eq!(parse_date_added(Some("yesterday")), None);
        assert_eq!(parse_date_added(None), None);
    }

    #[test]
    fn all_platform_coverage_derives_device_counts() {
        let ids: ExtensionIdMap = [("VK_KHR_swapchain".to_string(), 7)].into();
        let (rows, skipped) = all_platform_coverage_rows(
            &[
                entry("VK_KHR_swapchain", "<span>95.0</span>", false, true),
                entry("VK_UNKNOWN", "<span>10.0</span>", false, false),
            ],
            &ids,
            1000,
        );
        assert_eq!(skipped, 1);
        assert_eq!(
            rows,
            vec![CoverageRow {
                extension_id: 7,
                platform: "all",
                coverage_percent: 95.0,
                device_count: 950,
                total_devices: 1000,
            }]
        );
    }

    #[test]
    fn device_count_rounds_to_nearest() {
        assert_eq!(device_count(33.333, 1000), 333);
        assert_eq!(device_count(0.05, 1000), 1);
        assert_eq!(device_count(0.0, 1000), 0);
        assert_eq!(device_count(50.0, 0), 0);
    }

    #[test]
    fn platform_coverage_counts_stay_zero() {
        // Device and total counts are not derived per platform.
        let ids: ExtensionIdMap = [("VK_KHR_swapchain".to_string(), 3)].into();
        let entries = vec![
            PlatformCoverageEntry {
                name: "VK_KHR_swapchain".into(),
                coverage: Some(json!("<b>99.456</b>")),
                coverage_unsupported: None,
            },
            PlatformCoverageEntry {
                name: "VK_KHR_swapchain".into(),
                coverage: Some(json!("<b>1.0</b>")),
                coverage_unsupported: None,
            },
            PlatformCoverageEntry {
                name: "VK_MISSING".into(),
                coverage: None,
                coverage_unsupported: None,
            },
        ];
        let (rows, skipped) = platform_coverage_rows(Platform::Android, &entries, &ids);
        assert_eq!(skipped, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].platform, "android");
        assert_eq!(rows[0].coverage_percent, 99.46);
        assert_eq!(rows[0].device_count, 0);
        assert_eq!(rows[0].total_devices, 0);
    }

    #[test]
    fn scrape_meta_copies_summary() {
        let summary = ScrapeSummary {
            scrape_date: Some("2024-05-01".into()),
            total_extensions: 12,
            total_reports: 1000,
            platforms: vec![json!("windows")],
            source: Some("gpuinfo".into()),
            license: Some("CC".into()),
        };
        let row = scrape_meta_row(&summary);
        assert_eq!(row.total_reports, 1000);
        assert_eq!(row.platforms, json!(["windows"]));
        assert_eq!(row.source.as_deref(), Some("gpuinfo"));
    }
}
