// ============================================
// Provisioner - settings.rs
// ============================================
// Optional settings file, provisioner.toml, stored next to the EXE:
//
//   USB Drive/
//   ├── provisioner.exe
//   ├── provisioner.toml      # optional, every key has a default
//   ├── manifest.json
//   └── drivers/
//       ├── chipset/
//       └── lan/
//
// Example provisioner.toml:
//
//   manifest = "manifest.json"
//   log_file = "provisioner.log"
//   hive_key = "DefaultUserTemp"
//   default_user_hive = 'C:\Users\Default\NTUSER.DAT'
//   unload_delay_ms = 1000
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::display_scale::{self, HiveSettings};

pub const SETTINGS_FILE: &str = "provisioner.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Manifest path, relative to the app directory unless absolute
    pub manifest: PathBuf,
    /// Log file path, relative to the app directory unless absolute
    pub log_file: PathBuf,
    /// Name of the temporary key the default user hive is loaded under (in HKU)
    pub hive_key: String,
    /// Override for the default user's NTUSER.DAT
    pub default_user_hive: Option<PathBuf>,
    pub unload_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            manifest: PathBuf::from("manifest.json"),
            log_file: PathBuf::from("provisioner.log"),
            hive_key: "DefaultUserTemp".to_string(),
            default_user_hive: None,
            unload_delay_ms: 1000,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse settings {}", path.display()))
    }

    pub fn manifest_path(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.manifest)
    }

    pub fn log_path(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.log_file)
    }

    pub fn hive(&self) -> HiveSettings {
        HiveSettings {
            mount_key: format!("HKU\\{}", self.hive_key),
            default_user_hive: self
                .default_user_hive
                .clone()
                .unwrap_or_else(display_scale::default_user_hive_path),
            unload_delay: Duration::from_millis(self.unload_delay_ms),
        }
    }
}

// ============================================
// PATH HELPERS
// ============================================

/// Get the directory where provisioner.exe is located.
///
/// Driver paths in the manifest are relative to this folder, no matter
/// what the current working directory is.
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            return strip_verbatim_prefix(parent);
        }
    }
    tracing::warn!("Could not determine EXE directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Strip the \\?\ prefix that canonicalize adds on Windows
fn strip_verbatim_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_prefix(r"\\?\") {
        Some(rest) => PathBuf::from(rest),
        None => path.to_path_buf(),
    }
}
