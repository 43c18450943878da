// ============================================
// Provisioner - manifest.rs
// ============================================
// The driver manifest: which drivers to install on which hardware.
//
// A manifest is a JSON file next to the EXE:
//
//   {
//     "version": "1.4",
//     "systemTiers":     [ { "model": "X1", "cpu": "Intel", "drivers": [...] } ],
//     "peripheralTiers": [ { "model": "X1", "cpu": "Intel", "drivers": [...] } ],
//     "commonDrivers":   [ { "name": "...", "type": "exe", ... } ]
//   }
//
// Older manifests use PascalCase names (SystemDrivers, InstallCmd, ...).
// Both spellings are accepted. They also tend to write `null` for unused
// fields, which is read as the field's empty value.
//
// This module also holds the hardware matcher, which picks at most one
// system tier and one peripheral tier for the detected machine.
// ============================================

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

// ============================================
// DATA STRUCTURES
// ============================================

/// Root of the manifest file. Immutable once loaded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, alias = "ManifestVersion", deserialize_with = "null_as_default")]
    pub version: String,

    /// Chipset, serial IO and other board-level drivers, one tier per machine type
    #[serde(default, alias = "SystemDrivers", deserialize_with = "null_as_default")]
    pub system_tiers: Vec<Tier>,

    /// Hardware-specific peripheral drivers (printers, scanners, ...)
    #[serde(default, alias = "PeripheralDrivers", deserialize_with = "null_as_default")]
    pub peripheral_tiers: Vec<Tier>,

    /// Drivers installed on every supported machine
    #[serde(default, alias = "CommonDrivers", deserialize_with = "null_as_default")]
    pub common_drivers: Vec<Driver>,
}

/// One hardware configuration's driver set, keyed by (model, cpu).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    /// Compared case-insensitively for equality with the detected model
    #[serde(default, alias = "Model", deserialize_with = "null_as_default")]
    pub model: String,

    /// Must appear (case-insensitively) inside the detected CPU name
    #[serde(default, alias = "Cpu", deserialize_with = "null_as_default")]
    pub cpu: String,

    #[serde(default, alias = "DisplayName")]
    pub display_name: Option<String>,

    /// Informational only, never used for matching
    #[serde(default, alias = "Os")]
    pub os: Option<String>,

    #[serde(default, alias = "Drivers", deserialize_with = "null_as_default")]
    pub drivers: Vec<Driver>,
}

impl Tier {
    /// Name used in logs and in the `inspect` output
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{} / {}", self.model, self.cpu),
        }
    }

    /// The matching predicate: exact model (ignoring case) and the tier's
    /// CPU string contained in the detected CPU name (ignoring case).
    pub fn matches(&self, model: &str, cpu: &str) -> bool {
        self.model.to_lowercase() == model.to_lowercase()
            && cpu.to_lowercase().contains(&self.cpu.to_lowercase())
    }
}

/// One installation step.
///
/// `kind` stays a plain string here. It is parsed into a mechanism only
/// when the driver is dispatched, so an unknown type fails that one driver
/// instead of the whole manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    #[serde(default, alias = "Name", deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(rename = "type", alias = "Type", default, deserialize_with = "null_as_default")]
    pub kind: String,

    /// Relative to the application directory
    #[serde(default, alias = "Path", deserialize_with = "null_as_default")]
    pub path: String,

    /// Command template with `{path}` and `{dir}` placeholders
    #[serde(default, alias = "InstallCmd", deserialize_with = "null_as_default")]
    pub install_cmd: String,

    /// Carried for manifest compatibility; never invoked
    #[serde(default, alias = "UninstallCmd", deserialize_with = "null_as_default")]
    pub uninstall_cmd: String,

    #[serde(default, alias = "RebootRequired", deserialize_with = "null_as_default")]
    pub reboot_required: bool,
}

/// `null` reads as the type's default, same as a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================
// LOADING
// ============================================

impl Manifest {
    /// Load a manifest from a UTF-8 JSON file.
    pub fn load(path: &Path) -> Result<Manifest> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Manifest::from_json(&json)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Manifest> {
        Ok(serde_json::from_str(json)?)
    }

    /// Total number of drivers across every tier and the common list
    pub fn driver_count(&self) -> usize {
        let tiers = self.system_tiers.iter().chain(self.peripheral_tiers.iter());
        tiers.map(|t| t.drivers.len()).sum::<usize>() + self.common_drivers.len()
    }
}

// ============================================
// HARDWARE MATCHER
// ============================================

/// Result of matching detected hardware against a manifest.
/// `system` being `None` means the hardware is not supported.
#[derive(Debug, Clone, Copy)]
pub struct TierMatch<'a> {
    pub system: Option<&'a Tier>,
    pub peripheral: Option<&'a Tier>,
}

/// Select at most one system tier and one peripheral tier.
/// Tiers are scanned in manifest order and the first match wins.
pub fn match_tiers<'a>(manifest: &'a Manifest, model: &str, cpu: &str) -> TierMatch<'a> {
    TierMatch {
        system: manifest.system_tiers.iter().find(|t| t.matches(model, cpu)),
        peripheral: manifest.peripheral_tiers.iter().find(|t| t.matches(model, cpu)),
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(model: &str, cpu: &str) -> Tier {
        Tier {
            model: model.to_string(),
            cpu: cpu.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let t = tier("X1", "intel");
        assert!(t.matches("x1", "Intel(R) Core(TM) i7-8650U"));
        assert!(!t.matches("X1 Carbon", "Intel(R) Core(TM) i7-8650U"));
    }

    #[test]
    fn test_cpu_is_substring_of_detected_name_not_reverse() {
        let t = tier("X1", "Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz");
        // The detected name is shorter than the manifest value, so no match
        assert!(!t.matches("X1", "Intel"));

        let short = tier("X1", "i7");
        assert!(short.matches("X1", "Intel(R) Core(TM) i7-8650U"));
    }

    #[test]
    fn test_first_match_wins() {
        let mut first = tier("X1", "Intel");
        first.display_name = Some("first".into());
        let mut second = tier("X1", "Core");
        second.display_name = Some("second".into());

        let manifest = Manifest {
            system_tiers: vec![first, second],
            ..Default::default()
        };

        let found = match_tiers(&manifest, "X1", "Intel(R) Core(TM) i5");
        assert_eq!(found.system.map(Tier::label).as_deref(), Some("first"));
        assert!(found.peripheral.is_none());
    }

    #[test]
    fn test_no_system_tier_is_unsupported() {
        let manifest = Manifest {
            system_tiers: vec![tier("X1", "Intel")],
            peripheral_tiers: vec![tier("X2", "AMD")],
            ..Default::default()
        };

        let found = match_tiers(&manifest, "X2", "AMD Ryzen 5");
        assert!(found.system.is_none());
        assert!(found.peripheral.is_some());
    }

    #[test]
    fn test_parse_camel_case_manifest() {
        let json = r#"{
            "version": "2.0",
            "systemTiers": [{
                "model": "X1",
                "cpu": "Intel",
                "displayName": "X1 Intel",
                "drivers": [{
                    "name": "Chipset",
                    "type": "exe",
                    "path": "drivers\\chipset\\setup.exe",
                    "installCmd": "\"{path}\" -s",
                    "rebootRequired": true
                }]
            }]
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.version, "2.0");
        assert_eq!(manifest.system_tiers.len(), 1);
        assert!(manifest.peripheral_tiers.is_empty());
        assert!(manifest.common_drivers.is_empty());

        let driver = &manifest.system_tiers[0].drivers[0];
        assert_eq!(driver.kind, "exe");
        assert_eq!(driver.install_cmd, "\"{path}\" -s");
        assert!(driver.reboot_required);
        assert_eq!(driver.uninstall_cmd, "");
    }

    #[test]
    fn test_parse_pascal_case_manifest() {
        let json = r#"{
            "ManifestVersion": "1.0",
            "SystemDrivers": [{
                "Model": "T100",
                "Cpu": "Celeron",
                "Os": "Win10",
                "Drivers": [{ "Name": "LAN", "Type": "inf", "Path": "lan\\lan.inf",
                              "InstallCmd": "pnputil /add-driver {path} /install",
                              "UninstallCmd": "", "RebootRequired": false }]
            }],
            "PeripheralDrivers": [],
            "CommonDrivers": [{ "Name": "Tools", "Type": "copy", "Path": "tools",
                                "InstallCmd": "C:\\Tools" }]
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.version, "1.0");
        assert_eq!(manifest.system_tiers[0].os.as_deref(), Some("Win10"));
        assert_eq!(manifest.system_tiers[0].drivers[0].kind, "inf");
        assert_eq!(manifest.common_drivers[0].install_cmd, "C:\\Tools");
        assert_eq!(manifest.driver_count(), 2);
    }

    #[test]
    fn test_null_fields_read_as_empty() {
        let json = r#"{
            "ManifestVersion": null,
            "SystemDrivers": [{
                "Model": "T100", "Cpu": "Celeron", "DisplayName": null, "Os": null,
                "Drivers": [{ "Name": "LAN", "Type": "inf", "Path": "lan\\lan.inf",
                              "InstallCmd": "pnputil /add-driver {path} /install",
                              "UninstallCmd": null, "RebootRequired": null }]
            }],
            "PeripheralDrivers": null,
            "CommonDrivers": null
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.version, "");
        assert!(manifest.peripheral_tiers.is_empty());
        assert!(manifest.common_drivers.is_empty());

        let tier = &manifest.system_tiers[0];
        assert_eq!(tier.display_name, None);
        assert_eq!(tier.label(), "T100 / Celeron");
        assert_eq!(tier.drivers[0].uninstall_cmd, "");
        assert!(!tier.drivers[0].reboot_required);
        assert_eq!(manifest.driver_count(), 1);
    }

    #[test]
    fn test_demo_manifest_parses() {
        let manifest = Manifest::from_json(include_str!("../demos/manifest.json")).unwrap();
        assert_eq!(manifest.driver_count(), 8);

        let found = match_tiers(&manifest, "x1", "Intel(R) Core(TM) i5-7300U");
        assert_eq!(found.system.map(Tier::label).as_deref(), Some("X1 (Intel)"));
        assert!(found.peripheral.is_some());
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Manifest::load(Path::new("does-not-exist/manifest.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("manifest.json"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, r#"{ "version": "3", "commonDrivers": [] }"#).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.version, "3");
        assert_eq!(manifest.driver_count(), 0);
    }
}
