//! Device report import.
//!
//! Each streamed batch of raw reports is transformed into one device row plus
//! six dependent row sets. Devices are inserted first (insert-or-ignore on
//! `report_id`) to learn their surrogate ids; dependent rows are then re-keyed
//! and written concurrently, each set independently of the others.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::config::ImportConfig;
use crate::database_ops::db::{
    rows_per_statement, BulkWriteOutcome, ConflictPolicy, Db, TableOutcomes,
};
use crate::database_ops::reference_import::ExtensionIdMap;
use crate::database_ops::rows::{
    CoreFeaturesRow, CorePropertiesRow, DeviceExtensionRow, DeviceLimitsRow, DeviceRow,
    ExtendedFeatureRow, ExtendedPropertyRow,
};
use crate::database_ops::stream_reader::{stream_json_array, StreamOptions, StreamStats};
use crate::normalization::platform::{
    classify_platform, device_type_name, vulkan_version_text, CoreVersion,
};
use crate::normalization::sanitize::{sanitize_text, sanitize_value};

/// Everything derived from one report, still keyed by its report id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRows {
    pub device: DeviceRow,
    /// `(extension_id, spec_version)`, unique per extension.
    pub extensions: Vec<(i64, i64)>,
    /// Extension links dropped because the name has no id.
    pub unknown_extensions: usize,
    pub limits: Option<LimitsBlob>,
    pub core_features: Vec<(&'static str, Value)>,
    pub core_properties: Vec<(&'static str, Value)>,
    /// `(extension, feature, supported)`
    pub extended_features: Vec<(String, String, bool)>,
    /// `(extension, property, value)`
    pub extended_properties: Vec<(String, String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitsBlob {
    pub limits: Option<Value>,
    pub sparse_properties: Option<Value>,
    pub subgroup_properties: Option<Value>,
}

impl ReportRows {
    pub fn report_id(&self) -> i64 {
        self.device.report_id
    }
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_u64().map(|u| u as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// JSON booleans, numbers (non-zero is true) and `"true"`/`"1"` strings.
fn as_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        _ => false,
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

/// The array at `key`, or an empty slice when absent. Anything else is malformed.
fn array_at<'v>(parent: Option<&'v Value>, key: &str) -> Result<&'v [Value]> {
    match parent.and_then(|p| p.get(key)) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => bail!("`{key}` must be an array, got {}", kind(other)),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text_or(primary: Option<&Value>, fallback: impl FnOnce() -> String) -> String {
    let text = sanitize_value(primary);
    if text.is_empty() {
        fallback()
    } else {
        text
    }
}

/// Derive every row for one raw report.
pub fn transform_report(report: &Value, extension_ids: &ExtensionIdMap) -> Result<ReportRows> {
    if !report.is_object() {
        bail!("report must be an object, got {}", kind(report));
    }
    let report_id = as_int(report.get("_report_id")).context("missing numeric `_report_id`")?;
    let props = report.get("properties");
    let env = report.get("environment");
    let prop = |key: &str| props.and_then(|p| p.get(key));
    let env_field = |key: &str| env.and_then(|e| e.get(key));

    let device_type = match prop("deviceType") {
        Some(Value::Number(n)) => device_type_name(n.as_i64().unwrap_or(0)).to_string(),
        Some(Value::String(s)) => sanitize_text(Some(s)),
        _ => device_type_name(0).to_string(),
    };
    let api_version_raw = as_int(prop("apiVersion"));
    let driver_version_raw = as_int(prop("driverVersion"));
    let api_version = text_or(prop("apiVersionText"), || match api_version_raw {
        Some(v) => vulkan_version_text(v),
        None => sanitize_value(prop("apiVersion")),
    });
    let driver_version = text_or(prop("driverVersionText"), || {
        sanitize_value(prop("driverVersion"))
    });

    let device = DeviceRow {
        report_id,
        device_name: sanitize_value(prop("deviceName")),
        device_type,
        api_version,
        driver_version,
        api_version_raw,
        driver_version_raw,
        vendor_id: as_int(prop("vendorID")),
        pci_device_id: as_int(prop("deviceID")),
        platform: classify_platform(as_int(env_field("ostype")).unwrap_or(-1)).as_str(),
        os_name: sanitize_value(env_field("name")),
        os_version: sanitize_value(env_field("version")),
        os_arch: sanitize_value(env_field("architecture")),
        submitter: sanitize_value(env_field("submitter")),
    };

    let mut extensions = Vec::new();
    let mut linked = HashSet::new();
    let mut unknown_extensions = 0;
    for ext in array_at(Some(report), "extensions")? {
        let name = sanitize_value(ext.get("extensionName"));
        match extension_ids.get(&name) {
            Some(&id) => {
                if linked.insert(id) {
                    extensions.push((id, as_int(ext.get("specVersion")).unwrap_or(0)));
                }
            }
            None => unknown_extensions += 1,
        }
    }

    let limits = LimitsBlob {
        limits: non_null(prop("limits")),
        sparse_properties: non_null(prop("sparseProperties")),
        subgroup_properties: non_null(prop("subgroupProperties")),
    };
    let limits = (limits.limits.is_some()
        || limits.sparse_properties.is_some()
        || limits.subgroup_properties.is_some())
    .then_some(limits);

    let mut core_features = Vec::new();
    let mut core_properties = Vec::new();
    for version in CoreVersion::ALL {
        let Some(block) = report.get(version.as_str()).filter(|b| b.is_object()) else {
            continue;
        };
        if let Some(features) = non_null(block.get("features")) {
            core_features.push((version.as_str(), features));
        }
        if let Some(properties) = non_null(block.get("properties")) {
            core_properties.push((version.as_str(), properties));
        }
    }

    let extended = report.get("extended");
    let mut extended_features = Vec::new();
    let mut seen = HashSet::new();
    for f in array_at(extended, "devicefeatures2")? {
        let extension = sanitize_value(f.get("extension"));
        let feature = sanitize_value(f.get("name"));
        if feature.is_empty() || !seen.insert((extension.clone(), feature.clone())) {
            continue;
        }
        extended_features.push((extension, feature, as_flag(f.get("supported"))));
    }

    let mut extended_properties = Vec::new();
    let mut seen = HashSet::new();
    for p in array_at(extended, "deviceproperties2")? {
        let extension = sanitize_value(p.get("extension"));
        let property = sanitize_value(p.get("name"));
        if property.is_empty() || !seen.insert((extension.clone(), property.clone())) {
            continue;
        }
        let value = p.get("value").cloned().unwrap_or(Value::Null);
        extended_properties.push((extension, property, value));
    }

    Ok(ReportRows {
        device,
        extensions,
        unknown_extensions,
        limits,
        core_features,
        core_properties,
        extended_features,
        extended_properties,
    })
}

/// Dependent rows for a batch, re-keyed to device ids.
#[derive(Debug, Default)]
pub struct DependentRows {
    pub extensions: Vec<DeviceExtensionRow>,
    pub limits: Vec<DeviceLimitsRow>,
    pub core_features: Vec<CoreFeaturesRow>,
    pub core_properties: Vec<CorePropertiesRow>,
    pub extended_features: Vec<ExtendedFeatureRow>,
    pub extended_properties: Vec<ExtendedPropertyRow>,
}

impl DependentRows {
    /// Re-key `reports` with `device_ids` (report id -> device id). Reports
    /// without an id (not inserted) contribute nothing.
    pub fn rekey(reports: Vec<ReportRows>, device_ids: &HashMap<i64, i64>) -> Self {
        let mut out = Self::default();
        for report in reports {
            let Some(&device_id) = device_ids.get(&report.report_id()) else {
                continue;
            };
            out.extensions.extend(report.extensions.into_iter().map(
                |(extension_id, spec_version)| DeviceExtensionRow {
                    device_id,
                    extension_id,
                    spec_version,
                },
            ));
            if let Some(l) = report.limits {
                out.limits.push(DeviceLimitsRow {
                    device_id,
                    limits: l.limits,
                    sparse_properties: l.sparse_properties,
                    subgroup_properties: l.subgroup_properties,
                });
            }
            out.core_features.extend(report.core_features.into_iter().map(
                |(version, features)| CoreFeaturesRow {
                    device_id,
                    version,
                    features,
                },
            ));
            out.core_properties.extend(report.core_properties.into_iter().map(
                |(version, properties)| CorePropertiesRow {
                    device_id,
                    version,
                    properties,
                },
            ));
            out.extended_features.extend(report.extended_features.into_iter().map(
                |(extension, feature, supported)| ExtendedFeatureRow {
                    device_id,
                    extension,
                    feature,
                    supported,
                },
            ));
            out.extended_properties.extend(report.extended_properties.into_iter().map(
                |(extension, property, value)| ExtendedPropertyRow {
                    device_id,
                    extension,
                    property,
                    value,
                },
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceImportStats {
    pub reports_seen: u64,
    /// Devices newly written.
    pub imported: u64,
    /// Reports repeating a report id earlier in the same batch.
    pub duplicates_in_batch: u64,
    /// Reports whose id was already in `devices`.
    pub already_present: u64,
    pub transform_errors: u64,
    pub batches_failed: u64,
    /// Transform errors plus every device of a failed batch.
    pub errors: u64,
    pub unknown_extension_links: u64,
    pub outcomes: TableOutcomes,
}

/// Processes streamed batches against one extension map. Counters are shared
/// by every in-flight batch.
pub struct DeviceImporter<'a> {
    db: &'a Db,
    extension_ids: &'a ExtensionIdMap,
    insert_batch_size: usize,
    stats: Mutex<DeviceImportStats>,
}

impl<'a> DeviceImporter<'a> {
    pub fn new(db: &'a Db, extension_ids: &'a ExtensionIdMap, insert_batch_size: usize) -> Self {
        Self {
            db,
            extension_ids,
            insert_batch_size,
            stats: Mutex::new(DeviceImportStats::default()),
        }
    }

    fn with_stats<T>(&self, f: impl FnOnce(&mut DeviceImportStats) -> T) -> T {
        let mut guard = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn stats(&self) -> DeviceImportStats {
        self.with_stats(|s| s.clone())
    }

    pub fn into_stats(self) -> DeviceImportStats {
        self.stats.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Import one batch. Failures are counted rather than returned so a bad
    /// batch never stops the stream.
    pub async fn import_batch(&self, reports: Vec<Value>) -> Result<()> {
        let total = reports.len() as u64;
        let mut transformed = Vec::with_capacity(reports.len());
        let mut transform_errors = 0u64;
        let mut duplicates = 0u64;
        let mut unknown_links = 0u64;
        let mut ids = HashSet::with_capacity(reports.len());
        for (i, report) in reports.iter().enumerate() {
            match transform_report(report, self.extension_ids) {
                Ok(rows) => {
                    if !ids.insert(rows.report_id()) {
                        duplicates += 1;
                        continue;
                    }
                    unknown_links += rows.unknown_extensions as u64;
                    transformed.push(rows);
                }
                Err(e) => {
                    transform_errors += 1;
                    debug!(index = i, error = %format!("{e:#}"), "skipping report");
                }
            }
        }
        drop(reports);
        if transform_errors > 0 {
            warn!(skipped = transform_errors, batch_size = total, "reports failed to transform");
        }

        let devices: Vec<DeviceRow> = transformed.iter().map(|r| r.device.clone()).collect();
        // One statement per batch unless the bind limit forces a split.
        let written = insert_devices(self.db, &devices, devices.len()).await;
        let mut device_outcome = BulkWriteOutcome::new("devices");
        device_outcome.attempted = devices.len() as u64;
        device_outcome.inserted = written.ids.len() as u64;
        if let Some(e) = &written.error {
            warn!(devices = written.failed, error = %format!("{e:#}"), "device insert failed; dependent rows for those devices skipped");
            device_outcome.record_failure(written.failed, e);
        }
        let device_ids = written.ids;

        let dependents = DependentRows::rekey(transformed, &device_ids);
        let outcomes = self.write_dependents(&dependents).await;

        for o in outcomes.iter().filter(|o| o.failed > 0) {
            warn!(table = o.table, failed = o.failed, error = ?o.first_error, "dependent rows skipped");
        }
        let imported = device_ids.len() as u64;
        self.with_stats(|s| {
            s.reports_seen += total;
            s.imported += imported;
            s.already_present += (devices.len() as u64)
                .saturating_sub(imported)
                .saturating_sub(written.failed);
            s.transform_errors += transform_errors;
            s.duplicates_in_batch += duplicates;
            s.unknown_extension_links += unknown_links;
            if written.failed > 0 {
                s.batches_failed += 1;
            }
            s.errors += transform_errors + written.failed;
            s.outcomes.add(&device_outcome);
            for o in &outcomes {
                s.outcomes.add(o);
            }
        });
        debug!(imported, duplicates, transform_errors, "batch imported");
        Ok(())
    }

    async fn write_dependents(&self, rows: &DependentRows) -> [BulkWriteOutcome; 6] {
        let (db, n, policy) = (self.db, self.insert_batch_size, ConflictPolicy::Ignore);
        let (extensions, limits, core_features, core_properties, ext_features, ext_properties) = tokio::join!(
            db.bulk_insert_chunked(&rows.extensions, policy, n),
            db.bulk_insert_chunked(&rows.limits, policy, n),
            db.bulk_insert_chunked(&rows.core_features, policy, n),
            db.bulk_insert_chunked(&rows.core_properties, policy, n),
            db.bulk_insert_chunked(&rows.extended_features, policy, n),
            db.bulk_insert_chunked(&rows.extended_properties, policy, n),
        );
        [
            extensions,
            limits,
            core_features,
            core_properties,
            ext_features,
            ext_properties,
        ]
    }
}

/// Result of inserting one batch of devices.
#[derive(Debug, Default)]
pub struct DeviceInsert {
    /// report id -> device id for every row written.
    pub ids: HashMap<i64, i64>,
    /// Rows in statements that failed.
    pub failed: u64,
    pub error: Option<anyhow::Error>,
}

/// Insert-or-ignore `devices`, at most `rows_per_stmt` rows per statement.
///
/// A failed statement does not discard ids already returned by earlier ones:
/// those devices are committed and still need their dependent rows.
pub async fn insert_devices(db: &Db, devices: &[DeviceRow], rows_per_stmt: usize) -> DeviceInsert {
    let mut out = DeviceInsert::default();
    for part in devices.chunks(rows_per_statement::<DeviceRow>(rows_per_stmt)) {
        match db
            .bulk_insert_returning::<_, (i64, i64)>(part, ConflictPolicy::Ignore, "id, report_id")
            .await
        {
            Ok(rows) => out
                .ids
                .extend(rows.into_iter().map(|(id, report_id)| (report_id, id))),
            Err(e) => {
                out.failed += part.len() as u64;
                if out.error.is_none() {
                    out.error = Some(e);
                }
            }
        }
    }
    out
}

pub struct DeviceImport {
    pub stats: DeviceImportStats,
    pub stream: StreamStats,
}

/// Stream `device_reports.json` through a [`DeviceImporter`].
#[instrument(skip_all)]
pub async fn import_devices(
    db: &Db,
    config: &ImportConfig,
    extension_ids: &ExtensionIdMap,
) -> Result<DeviceImport> {
    let path = config.files().device_reports;
    let importer = DeviceImporter::new(db, extension_ids, config.insert_batch_size);
    let opts = StreamOptions::new(config.device_batch_size, config.concurrency);
    info!(path = %path.display(), batch_size = opts.batch_size, concurrency = opts.concurrency, "streaming device reports");

    let stream = {
        let importer = &importer;
        stream_json_array(&path, opts, move |batch: Vec<Value>| importer.import_batch(batch))
            .await
            .context("device import")?
    };
    let stats = importer.into_stats();
    info!(
        processed = stream.processed,
        imported = stats.imported,
        already_present = stats.already_present,
        duplicates_in_batch = stats.duplicates_in_batch,
        errors = stats.errors,
        "device import complete"
    );
    Ok(DeviceImport { stats, stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> ExtensionIdMap {
        [
            ("VK_KHR_swapchain".to_string(), 1),
            ("VK_KHR_maintenance1".to_string(), 2),
        ]
        .into()
    }

    fn full_report() -> Value {
        json!({
            "_report_id": 4242,
            "properties": {
                "deviceName": "  GeForce RTX\u{0001} 3080 ",
                "deviceType": 2,
                "apiVersion": 4206797,
                "apiVersionText": "1.3.205",
                "driverVersion": 2229993472u64,
                "driverVersionText": "531.68.0.0",
                "vendorID": 4318,
                "deviceID": 8710,
                "limits": {"maxImageDimension2D": 32768},
                "sparseProperties": {"residencyStandard2DBlockShape": true},
                "subgroupProperties": null
            },
            "environment": {
                "ostype": 0,
                "name": "Windows 11",
                "version": "10.0.22621",
                "architecture": "x86_64",
                "submitter": "someone"
            },
            "extensions": [
                {"extensionName": "VK_KHR_swapchain", "specVersion": 70},
                {"extensionName": "VK_KHR_swapchain", "specVersion": 69},
                {"extensionName": "VK_VENDOR_unknown", "specVersion": 1},
                {"extensionName": "VK_KHR_maintenance1", "specVersion": 2}
            ],
            "core11": {"features": {"multiview": true}, "properties": {"maxMultiviewViewCount": 32}},
            "core13": {"features": {"dynamicRendering": true}},
            "extended": {
                "devicefeatures2": [
                    {"extension": "VK_EXT_mesh_shader", "name": "meshShader", "supported": true},
                    {"extension": "VK_EXT_mesh_shader", "name": "taskShader", "supported": 0},
                    {"extension": "VK_EXT_mesh_shader", "name": "meshShader", "supported": false}
                ],
                "deviceproperties2": [
                    {"extension": "VK_KHR_driver_properties", "name": "driverID", "value": 4},
                    {"extension": "VK_KHR_driver_properties", "name": "conformanceVersion", "value": [1, 3, 5, 0]}
                ]
            }
        })
    }

    #[test]
    fn full_report_derives_every_row_set() {
        let rows = transform_report(&full_report(), &ids()).unwrap();
        let d = &rows.device;
        assert_eq!(d.report_id, 4242);
        assert_eq!(d.device_name, "GeForce RTX 3080");
        assert_eq!(d.device_type, "DISCRETE_GPU");
        assert_eq!(d.api_version, "1.3.205");
        assert_eq!(d.driver_version, "531.68.0.0");
        assert_eq!(d.api_version_raw, Some(4206797));
        assert_eq!(d.driver_version_raw, Some(2229993472));
        assert_eq!(d.vendor_id, Some(4318));
        assert_eq!(d.pci_device_id, Some(8710));
        assert_eq!(d.platform, "windows");
        assert_eq!(d.os_name, "Windows 11");
        assert_eq!(d.os_arch, "x86_64");

        // repeated link keeps the first spec version, unknown names are dropped
        assert_eq!(rows.extensions, vec![(1, 70), (2, 2)]);
        assert_eq!(rows.unknown_extensions, 1);

        let limits = rows.limits.as_ref().unwrap();
        assert_eq!(limits.limits, Some(json!({"maxImageDimension2D": 32768})));
        assert!(limits.subgroup_properties.is_none());

        assert_eq!(
            rows.core_features,
            vec![
                ("core11", json!({"multiview": true})),
                ("core13", json!({"dynamicRendering": true})),
            ]
        );
        assert_eq!(rows.core_properties, vec![("core11", json!({"maxMultiviewViewCount": 32}))]);

        assert_eq!(
            rows.extended_features,
            vec![
                ("VK_EXT_mesh_shader".into(), "meshShader".into(), true),
                ("VK_EXT_mesh_shader".into(), "taskShader".into(), false),
            ]
        );
        assert_eq!(rows.extended_properties[1].2, json!([1, 3, 5, 0]));
    }

    #[test]
    fn minimal_report_uses_fallbacks() {
        let report = json!({
            "_report_id": "17",
            "properties": {"deviceName": "llvmpipe", "apiVersion": 4206797, "driverVersion": 1},
            "environment": {"ostype": 99}
        });
        let rows = transform_report(&report, &ids()).unwrap();
        assert_eq!(rows.report_id(), 17);
        assert_eq!(rows.device.api_version, "1.3.205");
        assert_eq!(rows.device.driver_version, "1");
        assert_eq!(rows.device.device_type, "OTHER");
        assert_eq!(rows.device.platform, "linux");
        assert_eq!(rows.device.submitter, "");
        assert!(rows.extensions.is_empty());
        assert!(rows.limits.is_none());
        assert!(rows.core_features.is_empty());
        assert!(rows.extended_properties.is_empty());
    }

    #[test]
    fn string_device_type_passes_through() {
        let report = json!({"_report_id": 1, "properties": {"deviceType": " INTEGRATED_GPU\n"}});
        let rows = transform_report(&report, &ids()).unwrap();
        assert_eq!(rows.device.device_type, "INTEGRATED_GPU");
    }

    #[test]
    fn malformed_reports_are_errors() {
        let ids = ids();
        assert!(transform_report(&json!([1, 2]), &ids).is_err());
        assert!(transform_report(&json!({"properties": {}}), &ids).is_err());
        assert!(transform_report(&json!({"_report_id": "abc"}), &ids).is_err());
        let err = transform_report(&json!({"_report_id": 1, "extensions": "VK_KHR_swapchain"}), &ids)
            .unwrap_err();
        assert!(err.to_string().contains("`extensions` must be an array"));
    }

    #[test]
    fn lenient_flags() {
        assert!(as_flag(Some(&json!(true))));
        assert!(as_flag(Some(&json!(1))));
        assert!(as_flag(Some(&json!("true"))));
        assert!(!as_flag(Some(&json!(0))));
        assert!(!as_flag(Some(&json!("no"))));
        assert!(!as_flag(None));
    }

    #[test]
    fn rekey_drops_reports_without_device_ids() {
        let ids = ids();
        let first = transform_report(&full_report(), &ids).unwrap();
        let mut second_json = full_report();
        second_json["_report_id"] = json!(5000);
        let second = transform_report(&second_json, &ids).unwrap();

        let device_ids: HashMap<i64, i64> = [(4242, 9)].into();
        let rows = DependentRows::rekey(vec![first, second], &device_ids);

        assert_eq!(
            rows.extensions,
            vec![
                DeviceExtensionRow { device_id: 9, extension_id: 1, spec_version: 70 },
                DeviceExtensionRow { device_id: 9, extension_id: 2, spec_version: 2 },
            ]
        );
        assert_eq!(rows.limits.len(), 1);
        assert_eq!(rows.core_features.len(), 2);
        assert_eq!(rows.core_properties.len(), 1);
        assert_eq!(rows.extended_features.len(), 2);
        assert_eq!(rows.extended_properties.len(), 2);
        assert!(rows.extended_properties.iter().all(|r| r.device_id == 9));
    }
}
