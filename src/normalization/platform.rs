use std::fmt;

/// Platform bucket a report or coverage row belongs to.
///
/// `All` is only used for aggregate coverage rows; reports are always
/// classified into one of the five concrete platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    All,
    Windows,
    Linux,
    Android,
    Macos,
    Ios,
}

impl Platform {
    /// The concrete platforms, in the order per-platform coverage is imported.
    pub const KNOWN: [Platform; 5] = [
        Platform::Windows,
        Platform::Linux,
        Platform::Android,
        Platform::Macos,
        Platform::Ios,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::All => "all",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Android => "android",
            Platform::Macos => "macos",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map the report's numeric OS type to a platform. Unknown codes fall back to Linux.
pub fn classify_platform(os_type: i64) -> Platform {
    match os_type {
        0 => Platform::Windows,
        1 => Platform::Linux,
        2 => Platform::Android,
        3 => Platform::Macos,
        4 => Platform::Ios,
        _ => Platform::Linux,
    }
}

/// Core API blocks carried by a report (`core11` .. `core14`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreVersion {
    Core11,
    Core12,
    Core13,
    Core14,
}

impl CoreVersion {
    pub const ALL: [CoreVersion; 4] = [
        CoreVersion::Core11,
        CoreVersion::Core12,
        CoreVersion::Core13,
        CoreVersion::Core14,
    ];

    /// Key of the block in the report and value of the `version` column.
    pub fn as_str(self) -> &'static str {
        match self {
            CoreVersion::Core11 => "core11",
            CoreVersion::Core12 => "core12",
            CoreVersion::Core13 => "core13",
            CoreVersion::Core14 => "core14",
        }
    }
}

/// Human-readable name for `VkPhysicalDeviceType` codes.
pub fn device_type_name(code: i64) -> &'static str {
    match code {
        1 => "INTEGRATED_GPU",
        2 => "DISCRETE_GPU",
        3 => "VIRTUAL_GPU",
        4 => "CPU",
        _ => "OTHER",
    }
}

/// Render a packed Vulkan version (`VK_MAKE_API_VERSION`) as `major.minor.patch`.
pub fn vulkan_version_text(packed: i64) -> String {
    let v = packed as u32;
    format!("{}.{}.{}", (v >> 22) & 0x7f, (v >> 12) & 0x3ff, v & 0xfff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_os_codes_map_to_platforms() {
        assert_eq!(classify_platform(0), Platform::Windows);
        assert_eq!(classify_platform(1), Platform::Linux);
        assert_eq!(classify_platform(2), Platform::Android);
        assert_eq!(classify_platform(3), Platform::Macos);
        assert_eq!(classify_platform(4), Platform::Ios);
    }

    #[test]
    fn unknown_os_codes_default_to_linux() {
        assert_eq!(classify_platform(99), Platform::Linux);
        assert_eq!(classify_platform(-1), Platform::Linux);
    }

    #[test]
    fn platform_names_match_column_values() {
        let names: Vec<&str> = Platform::KNOWN.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, ["windows", "linux", "android", "macos", "ios"]);
        assert_eq!(Platform::All.to_string(), "all");
    }

    #[test]
    fn decodes_packed_api_version() {
        // VK_API_VERSION_1_3 with patch 238
        let packed = (1 << 22) | (3 << 12) | 238;
        assert_eq!(vulkan_version_text(packed), "1.3.238");
        assert_eq!(vulkan_version_text(0), "0.0.0");
    }

    #[test]
    fn device_type_codes() {
        assert_eq!(device_type_name(2), "DISCRETE_GPU");
        assert_eq!(device_type_name(0), "OTHER");
        assert_eq!(device_type_name(42), "OTHER");
    }
}
