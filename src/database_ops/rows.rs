//! Row shapes for every table the importer writes, bound through [`BulkRow`].

use chrono::NaiveDate;
use serde_json::Value;
use sqlx::{query_builder::Separated, Postgres};

use super::db::BulkRow;

type Binds<'b, 'args> = Separated<'b, 'args, Postgres, &'static str>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionRow {
    pub name: String,
    pub date_added: Option<NaiveDate>,
    pub has_features: bool,
    pub has_properties: bool,
}

impl BulkRow for ExtensionRow {
    const TABLE: &'static str = "extensions";
    const COLUMNS: &'static [&'static str] =
        &["name", "date_added", "has_features", "has_properties"];
    const CONFLICT_TARGET: &'static [&'static str] = &["name"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(&self.name)
            .push_bind(self.date_added)
            .push_bind(self.has_features)
            .push_bind(self.has_properties);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRow {
    pub extension_id: i64,
    pub platform: &'static str,
    pub coverage_percent: f64,
    pub device_count: i64,
    pub total_devices: i64,
}

impl BulkRow for CoverageRow {
    const TABLE: &'static str = "extension_coverage";
    const COLUMNS: &'static [&'static str] = &[
        "extension_id",
        "platform",
        "coverage_percent",
        "device_count",
        "total_devices",
    ];
    const CONFLICT_TARGET: &'static [&'static str] = &["extension_id", "platform"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.extension_id)
            .push_bind(self.platform)
            .push_bind(self.coverage_percent)
            .push_bind(self.device_count)
            .push_bind(self.total_devices);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeMetaRow {
    pub scrape_date: Option<String>,
    pub total_extensions: i64,
    pub total_reports: i64,
    pub platforms: Value,
    pub source: Option<String>,
    pub license: Option<String>,
}

impl BulkRow for ScrapeMetaRow {
    const TABLE: &'static str = "scrape_meta";
    const COLUMNS: &'static [&'static str] = &[
        "scrape_date",
        "total_extensions",
        "total_reports",
        "platforms",
        "source",
        "license",
    ];
    const CONFLICT_TARGET: &'static [&'static str] = &[];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.scrape_date.as_deref())
            .push_bind(self.total_extensions)
            .push_bind(self.total_reports)
            .push_bind(&self.platforms)
            .push_bind(self.source.as_deref())
            .push_bind(self.license.as_deref());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    pub report_id: i64,
    pub device_name: String,
    pub device_type: String,
    pub api_version: String,
    pub driver_version: String,
    pub api_version_raw: Option<i64>,
    pub driver_version_raw: Option<i64>,
    pub vendor_id: Option<i64>,
    pub pci_device_id: Option<i64>,
    pub platform: &'static str,
    pub os_name: String,
    pub os_version: String,
    pub os_arch: String,
    pub submitter: String,
}

impl BulkRow for DeviceRow {
    const TABLE: &'static str = "devices";
    const COLUMNS: &'static [&'static str] = &[
        "report_id",
        "device_name",
        "device_type",
        "api_version",
        "driver_version",
        "api_version_raw",
        "driver_version_raw",
        "vendor_id",
        "pci_device_id",
        "platform",
        "os_name",
        "os_version",
        "os_arch",
        "submitter",
    ];
    const CONFLICT_TARGET: &'static [&'static str] = &["report_id"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.report_id)
            .push_bind(&self.device_name)
            .push_bind(&self.device_type)
            .push_bind(&self.api_version)
            .push_bind(&self.driver_version)
            .push_bind(self.api_version_raw)
            .push_bind(self.driver_version_raw)
            .push_bind(self.vendor_id)
            .push_bind(self.pci_device_id)
            .push_bind(self.platform)
            .push_bind(&self.os_name)
            .push_bind(&self.os_version)
            .push_bind(&self.os_arch)
            .push_bind(&self.submitter);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceExtensionRow {
    pub device_id: i64,
    pub extension_id: i64,
    pub spec_version: i64,
}

impl BulkRow for DeviceExtensionRow {
    const TABLE: &'static str = "device_extensions";
    const COLUMNS: &'static [&'static str] = &["device_id", "extension_id", "spec_version"];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id", "extension_id"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(self.extension_id)
            .push_bind(self.spec_version);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLimitsRow {
    pub device_id: i64,
    pub limits: Option<Value>,
    pub sparse_properties: Option<Value>,
    pub subgroup_properties: Option<Value>,
}

impl BulkRow for DeviceLimitsRow {
    const TABLE: &'static str = "device_limits";
    const COLUMNS: &'static [&'static str] = &[
        "device_id",
        "limits",
        "sparse_properties",
        "subgroup_properties",
    ];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(self.limits.as_ref())
            .push_bind(self.sparse_properties.as_ref())
            .push_bind(self.subgroup_properties.as_ref());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreFeaturesRow {
    pub device_id: i64,
    pub version: &'static str,
    pub features: Value,
}

impl BulkRow for CoreFeaturesRow {
    const TABLE: &'static str = "device_core_features";
    const COLUMNS: &'static [&'static str] = &["device_id", "version", "features"];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id", "version"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(self.version)
            .push_bind(&self.features);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorePropertiesRow {
    pub device_id: i64,
    pub version: &'static str,
    pub properties: Value,
}

impl BulkRow for CorePropertiesRow {
    const TABLE: &'static str = "device_core_properties";
    const COLUMNS: &'static [&'static str] = &["device_id", "version", "properties"];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id", "version"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(self.version)
            .push_bind(&self.properties);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedFeatureRow {
    pub device_id: i64,
    pub extension: String,
    pub feature: String,
    pub supported: bool,
}

impl BulkRow for ExtendedFeatureRow {
    const TABLE: &'static str = "device_extended_features";
    const COLUMNS: &'static [&'static str] = &["device_id", "extension", "feature", "supported"];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id", "extension", "feature"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(&self.extension)
            .push_bind(&self.feature)
            .push_bind(self.supported);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedPropertyRow {
    pub device_id: i64,
    pub extension: String,
    pub property: String,
    pub value: Value,
}

impl BulkRow for ExtendedPropertyRow {
    const TABLE: &'static str = "device_extended_properties";
    const COLUMNS: &'static [&'static str] = &["device_id", "extension", "property", "value"];
    const CONFLICT_TARGET: &'static [&'static str] = &["device_id", "extension", "property"];

    fn push_binds<'args>(&'args self, b: &mut Binds<'_, 'args>) {
        b.push_bind(self.device_id)
            .push_bind(&self.extension)
            .push_bind(&self.property)
            .push_bind(&self.value);
    }
}
