//! Runs the two import phases in order and reports on the whole run.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ImportConfig;
use crate::database_ops::db::Db;
use crate::database_ops::device_import::{import_devices, DeviceImportStats};
use crate::database_ops::reference_import::{import_reference, ReferenceImportSummary};
use crate::database_ops::stream_reader::StreamStats;

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub reference: ReferenceImportSummary,
    pub devices: DeviceImportStats,
    pub stream: StreamStats,
    pub elapsed: Duration,
}

impl ImportSummary {
    /// Log the final counters, with a warning for every table that lost rows.
    pub fn log(&self) {
        for outcome in self.devices.outcomes.iter() {
            if outcome.failed > 0 {
                warn!(
                    table = outcome.table,
                    failed = outcome.failed,
                    first_error = outcome.first_error.as_deref().unwrap_or(""),
                    "table had failed rows"
                );
            } else {
                info!(%outcome, "table written");
            }
        }
        let elapsed = format!("{:.1}s", self.elapsed.as_secs_f64());
        info!(
            extensions = self.reference.extensions_upserted,
            coverage_rows = self.reference.coverage_rows_written + self.reference.platform_rows_written,
            processed = self.stream.processed,
            imported = self.devices.imported,
            already_present = self.devices.already_present,
            duplicates_in_batch = self.devices.duplicates_in_batch,
            unknown_extension_links = self.devices.unknown_extension_links,
            errors = self.devices.errors,
            elapsed = %elapsed,
            "import finished"
        );
    }
}

/// Reference data first (its id map is required by every device batch), then
/// the device stream. Either phase failing aborts the run.
pub async fn run_import(db: &Db, config: &ImportConfig) -> Result<ImportSummary> {
    config.validate()?;
    let started = Instant::now();
    info!(data_dir = %config.data_dir.display(), "starting import");

    let reference = import_reference(db, config)
        .await
        .context("reference import")?;
    let devices = import_devices(db, config, &reference.extension_ids)
        .await
        .context("device import")?;

    Ok(ImportSummary {
        reference: reference.summary,
        devices: devices.stats,
        stream: devices.stream,
        elapsed: started.elapsed(),
    })
}
