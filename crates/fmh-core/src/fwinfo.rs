//! Firmware-info blob carried by the firmware descriptor section.
//!
//! Plain `KEY=VALUE` lines:
//!
//! ```text
//! FW_VERSION=1.2.345
//! FW_DATE=Oct 18 2026
//! FW_BUILDTIME=10:15:00
//! FW_DESC=WARNING : UNOFFICIAL BUILD!!
//! FW_PRODUCTID=7
//! FW_PRODUCTNAME=Widget
//! OEM_VENDOR=acme
//! ```

use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use crate::config::{GlobalConfig, ReleaseOverrides};
use crate::format::{ERASED_BYTE, Version};

/// Default `FW_DATE` layout, day padded with a space (`Mar  5 2026`).
pub const DATE_FORMAT: &str = "%b %e %Y";
/// Default `FW_BUILDTIME` layout.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Description used when the build environment provides none.
pub const UNOFFICIAL_BUILD_DESC: &str = "WARNING : UNOFFICIAL BUILD!! ";

/// Name of the build-number file looked up in the output directory.
pub const BUILD_NUMBER_FILE: &str = "BUILDNO";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: Version,
    pub build_no: u32,
    pub date: String,
    pub build_time: String,
    pub description: String,
    pub product_id: Option<u32>,
    pub product_name: Option<String>,
    /// `OEM_<key>=<value>` lines, in output order.
    pub oem: Vec<(String, String)>,
}

impl FirmwareInfo {
    /// Assemble the blob contents for one build.
    ///
    /// Date and time fall back to the local clock.
    pub fn for_build(
        global: &GlobalConfig,
        version: Version,
        build_no: u32,
        overrides: &ReleaseOverrides,
    ) -> Self {
        let now = chrono::Local::now();
        Self {
            version,
            build_no,
            date: overrides
                .date
                .clone()
                .unwrap_or_else(|| now.format(DATE_FORMAT).to_string()),
            build_time: overrides
                .build_time
                .clone()
                .unwrap_or_else(|| now.format(TIME_FORMAT).to_string()),
            description: overrides
                .description
                .clone()
                .unwrap_or_else(|| UNOFFICIAL_BUILD_DESC.to_string()),
            product_id: global.product_id.filter(|id| *id != 0),
            product_name: global.product_name.clone(),
            oem: global
                .oem_keys
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(
            out,
            "FW_VERSION={}.{}.{}",
            self.version.major, self.version.minor, self.build_no
        );
        let _ = writeln!(out, "FW_DATE={}", self.date);
        let _ = writeln!(out, "FW_BUILDTIME={}", self.build_time);
        let _ = writeln!(out, "FW_DESC={}", self.description);
        if let Some(id) = self.product_id {
            let _ = writeln!(out, "FW_PRODUCTID={id}");
        }
        if let Some(name) = &self.product_name {
            let _ = writeln!(out, "FW_PRODUCTNAME={name}");
        }
        for (key, value) in &self.oem {
            let _ = writeln!(out, "OEM_{key}={value}");
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.render().into_bytes()
    }

    /// Best-effort decode of a blob read back from an image.
    ///
    /// Unknown keys are ignored, missing ones keep their defaults.
    pub fn parse(data: &[u8]) -> Self {
        let mut info = Self::default();
        for (key, value) in parse_fields(data) {
            match key.as_str() {
                "FW_VERSION" => {
                    let mut parts = value.split('.').map(|p| p.trim().parse::<u32>().ok());
                    let major = parts.next().flatten().unwrap_or(0);
                    let minor = parts.next().flatten().unwrap_or(0);
                    info.version = Version::new(major as u8, minor as u8);
                    info.build_no = parts.next().flatten().unwrap_or(0);
                }
                "FW_DATE" => info.date = value,
                "FW_BUILDTIME" => info.build_time = value,
                "FW_DESC" => info.description = value,
                "FW_PRODUCTID" => info.product_id = value.trim().parse().ok(),
                "FW_PRODUCTNAME" => info.product_name = Some(value),
                other => {
                    if let Some(oem_key) = other.strip_prefix("OEM_") {
                        info.oem.push((oem_key.to_string(), value));
                    }
                }
            }
        }
        info
    }
}

/// Split a blob into `(key, value)` pairs, stopping at erased or NUL bytes.
pub fn parse_fields(data: &[u8]) -> Vec<(String, String)> {
    let end = data
        .iter()
        .position(|&b| b == ERASED_BYTE || b == 0)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end])
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// Build number from configuration, else from `<dir>/BUILDNO`, else 0.
pub fn resolve_build_number(configured: Option<u32>, dir: Option<&Path>) -> u32 {
    if let Some(no) = configured.filter(|no| *no != 0) {
        return no;
    }
    let Some(dir) = dir else {
        warn!("No build number configured and no output directory to read BUILDNO from");
        return 0;
    };
    let path = dir.join(BUILD_NUMBER_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => match text.split_whitespace().next().and_then(|w| w.parse().ok()) {
            Some(no) => no,
            None => {
                warn!(path = %path.display(), "Unable to get the build number of firmware");
                0
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read the build number file");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FirmwareInfo {
        FirmwareInfo {
            version: Version::new(3, 14),
            build_no: 159,
            date: "Oct 18 2026".into(),
            build_time: "10:15:00".into(),
            description: "Release".into(),
            product_id: Some(7),
            product_name: Some("Widget".into()),
            oem: vec![("VENDOR".into(), "acme".into())],
        }
    }

    #[test]
    fn test_render_order() {
        let text = sample().render();
        let keys: Vec<_> = text.lines().map(|l| l.split('=').next().unwrap()).collect();
        assert_eq!(
            keys,
            [
                "FW_VERSION",
                "FW_DATE",
                "FW_BUILDTIME",
                "FW_DESC",
                "FW_PRODUCTID",
                "FW_PRODUCTNAME",
                "OEM_VENDOR"
            ]
        );
        assert!(text.starts_with("FW_VERSION=3.14.159\n"));
    }

    #[test]
    fn test_parse_back() {
        let info = sample();
        let mut blob = info.to_bytes();
        blob.extend_from_slice(&[0xFF; 32]);
        assert_eq!(FirmwareInfo::parse(&blob), info);
    }

    #[test]
    fn test_defaults_for_build() {
        let global = GlobalConfig {
            output: "rom.ima".into(),
            product_id: Some(0),
            ..Default::default()
        };
        let info = FirmwareInfo::for_build(
            &global,
            Version::new(1, 0),
            0,
            &ReleaseOverrides::default(),
        );
        assert_eq!(info.description, UNOFFICIAL_BUILD_DESC);
        assert_eq!(info.product_id, None);
        assert!(!info.date.is_empty());
        assert!(info.render().contains("FW_DESC=WARNING : UNOFFICIAL BUILD!! \n"));
    }

    #[test]
    fn test_date_layout() {
        let at = chrono::NaiveDate::from_ymd_opt(2026, 3, 5)
            .unwrap()
            .and_hms_opt(7, 4, 9)
            .unwrap();
        assert_eq!(at.format(DATE_FORMAT).to_string(), "Mar  5 2026");
        assert_eq!(at.format(TIME_FORMAT).to_string(), "07:04:09");
    }

    #[test]
    fn test_parse_fields_stops_at_erased() {
        let fields = parse_fields(b"A=1\nB=2\n\xFFC=3\n");
        assert_eq!(
            fields,
            [("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_build_number_resolution() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_build_number(Some(42), Some(dir.path())), 42);
        assert_eq!(resolve_build_number(None, Some(dir.path())), 0);

        std::fs::write(dir.path().join(BUILD_NUMBER_FILE), "1234\n").unwrap();
        assert_eq!(resolve_build_number(None, Some(dir.path())), 1234);
        assert_eq!(resolve_build_number(Some(0), Some(dir.path())), 1234);

        std::fs::write(dir.path().join(BUILD_NUMBER_FILE), "garbage").unwrap();
        assert_eq!(resolve_build_number(None, Some(dir.path())), 0);
    }
}
