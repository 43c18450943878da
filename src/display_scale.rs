// ============================================
// Provisioner - display_scale.rs
// ============================================
// The "displayscale" driver type: sets Windows display scaling.
//
// Scaling is stored per user, so it has to be written twice:
//
//   1. Current user  - HKCU\Control Panel\Desktop (live registry)
//   2. Default user  - the template profile new accounts are copied from.
//                      It has no live registry handle, so its NTUSER.DAT
//                      is loaded under a temporary key, edited, and
//                      unloaded again:
//
//        reg load   HKU\DefaultUserTemp  C:\Users\Default\NTUSER.DAT
//        reg add    HKU\DefaultUserTemp\Control Panel\Desktop ...
//        reg unload HKU\DefaultUserTemp
//
// The unload MUST happen even if editing failed, otherwise the profile
// file stays locked and new users can't be created. MountedHive below
// unloads in its Drop impl, so every exit path is covered.
//
// Registry values written (REG_DWORD):
//   Control Panel\Desktop                 LogPixels      = DPI value
//   Control Panel\Desktop                 Win8DpiScaling = 1
//   Control Panel\Desktop\WindowMetrics   AppliedDPI     = DPI value
// ============================================

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::installer::{MechanismError, Outcome};
use crate::process::{self, Invocation, ProcessRunner};

const REG: &str = "reg.exe";

/// Percent -> LogPixels value
const DPI_TABLE: &[(u32, u32)] = &[
    (100, 96),
    (125, 120),
    (150, 144),
    (175, 140),
    (200, 192),
    (225, 216),
    (250, 240),
    (300, 288),
    (350, 336),
    (400, 384),
    (450, 432),
    (500, 480),
];

/// Only one hive may be mounted under the temporary key at a time
static HIVE_LOCK: Mutex<()> = Mutex::new(());

// ============================================
// SETTINGS
// ============================================

/// Where the default user profile lives and how to mount it
#[derive(Debug, Clone)]
pub struct HiveSettings {
    /// Temporary mount point, e.g. HKU\DefaultUserTemp
    pub mount_key: String,
    /// The default user's NTUSER.DAT
    pub default_user_hive: PathBuf,
    /// Pause before unloading so open registry handles are released
    pub unload_delay: Duration,
}

impl Default for HiveSettings {
    fn default() -> Self {
        HiveSettings {
            mount_key: "HKU\\DefaultUserTemp".to_string(),
            default_user_hive: default_user_hive_path(),
            unload_delay: Duration::from_millis(1000),
        }
    }
}

/// %SystemDrive%\Users\Default\NTUSER.DAT
pub fn default_user_hive_path() -> PathBuf {
    let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
    PathBuf::from(format!("{}\\Users\\Default\\NTUSER.DAT", drive))
}

// ============================================
// DPI LOOKUP
// ============================================

/// Map a scaling percentage to its LogPixels value.
/// Percentages missing from the table are used as-is.
pub fn dpi_for_percent(percent: u32) -> u32 {
    match DPI_TABLE.iter().find(|(p, _)| *p == percent) {
        Some((_, dpi)) => *dpi,
        None => {
            warn!(
                "Display scale {}% is not in the DPI table, using {} unchanged",
                percent, percent
            );
            percent
        }
    }
}

/// Parse the percentage carried in installCmd ("150" or "150%")
pub fn parse_percent(command: &str) -> Result<u32, MechanismError> {
    command
        .trim()
        .trim_end_matches('%')
        .trim()
        .parse::<u32>()
        .map_err(|_| MechanismError::InvalidScale(command.trim().to_string()))
}

// ============================================
// PROVISIONING
// ============================================

/// Apply a display scale to the current user and the default user.
pub fn apply(
    runner: &dyn ProcessRunner,
    settings: &HiveSettings,
    command: &str,
) -> Result<Outcome, MechanismError> {
    let percent = parse_percent(command)?;
    let dpi = dpi_for_percent(percent);
    info!("Setting display scale to {}% (DPI value {})", percent, dpi);

    info!("Applying display scale to the current user");
    write_scale_values(runner, "HKCU", dpi)?;

    info!("Applying display scale to the default user profile");
    let hive = MountedHive::load(runner, settings)?;
    write_scale_values(runner, &hive.settings.mount_key, dpi)?;
    drop(hive);

    info!("Display scale {}% applied", percent);
    Ok(Outcome::Success)
}

/// Write LogPixels, Win8DpiScaling and AppliedDPI under `root`.
///
/// A value that can't be written is a warning (the key may not exist yet
/// in a fresh profile). Failing to run reg.exe at all is an error.
fn write_scale_values(
    runner: &dyn ProcessRunner,
    root: &str,
    dpi: u32,
) -> Result<(), MechanismError> {
    let desktop = format!("{}\\Control Panel\\Desktop", root);
    let metrics = format!("{}\\WindowMetrics", desktop);

    let values = [
        (desktop.as_str(), "LogPixels", dpi),
        (desktop.as_str(), "Win8DpiScaling", 1),
        (metrics.as_str(), "AppliedDPI", dpi),
    ];

    for (key, name, data) in values {
        let invocation = Invocation::new(
            REG,
            format!("add \"{}\" /v {} /t REG_DWORD /d {} /f", key, name, data),
        );
        let output = runner
            .run(&invocation)
            .map_err(|e| MechanismError::launch(&invocation, e))?;

        if !output.success() {
            warn!(
                "Could not set {} under {} (exit code {}): {}",
                name,
                key,
                output.code,
                output.stderr.trim()
            );
        }
    }

    Ok(())
}

// ============================================
// HIVE MOUNT GUARD
// ============================================

/// A loaded default-user hive. Unloaded when dropped.
struct MountedHive<'a> {
    runner: &'a dyn ProcessRunner,
    settings: &'a HiveSettings,
    _lock: MutexGuard<'static, ()>,
}

impl<'a> MountedHive<'a> {
    fn load(
        runner: &'a dyn ProcessRunner,
        settings: &'a HiveSettings,
    ) -> Result<MountedHive<'a>, MechanismError> {
        let lock = HIVE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let hive = &settings.default_user_hive;

        if !hive.exists() {
            return Err(MechanismError::HiveLoad {
                hive: hive.clone(),
                message: "hive file not found".to_string(),
            });
        }

        let invocation = Invocation::new(
            REG,
            format!("load {} {}", settings.mount_key, process::quote(hive)),
        );
        info!("Loading default user hive: {}", invocation);

        let output = runner.run(&invocation).map_err(|e| MechanismError::HiveLoad {
            hive: hive.clone(),
            message: e.to_string(),
        })?;

        if !output.success() {
            return Err(MechanismError::HiveLoad {
                hive: hive.clone(),
                message: format!("reg load exited with code {}: {}", output.code, output.stderr.trim()),
            });
        }

        Ok(MountedHive {
            runner,
            settings,
            _lock: lock,
        })
    }
}

impl Drop for MountedHive<'_> {
    fn drop(&mut self) {
        thread::sleep(self.settings.unload_delay);

        let key = &self.settings.mount_key;
        let invocation = Invocation::new(REG, format!("unload {}", key));

        match self.runner.run(&invocation) {
            Ok(output) if output.success() => info!("Unloaded default user hive from {}", key),
            Ok(output) => error!(
                "Failed to unload {} (exit code {}): {}. The default user profile may remain locked",
                key,
                output.code,
                output.stderr.trim()
            ),
            Err(e) => error!(
                "Failed to run reg unload for {}: {}. The default user profile may remain locked",
                key, e
            ),
        }
    }
}

// ============================================
// TESTS
// ============================================
