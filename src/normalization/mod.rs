pub mod platform;
pub mod sanitize;

pub use platform::{classify_platform, CoreVersion, Platform};
pub use sanitize::{parse_coverage, sanitize_text};
