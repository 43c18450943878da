// ============================================
// Provisioner - installer.rs
// ============================================
// The install dispatcher: turns one manifest driver into one concrete
// action on the machine and reports how it went.
//
// Supported driver types:
//   exe          - run an installer; program and arguments split from installCmd
//   msi          - msiexec.exe with installCmd as arguments
//   inf          - pnputil.exe with installCmd as arguments
//   cmd          - cmd.exe /c installCmd
//   copy         - copy the driver folder to the folder named by installCmd
//   shortcut     - create a .lnk at installCmd pointing at the driver path
//   registry     - reg import the .reg file at the driver path
//   displayscale - set the DPI for the current and the default user
//
// Errors never escape a single driver. Whatever happens, install()
// returns an Outcome and the pipeline moves on.
// ============================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{error, info, warn};

use crate::display_scale::{self, HiveSettings};
use crate::file_ops::{self, ShortcutCreator};
use crate::manifest::Driver;
use crate::process::{self, Invocation, ProcessRunner, EXIT_REBOOT_REQUIRED};

const MSIEXEC: &str = "msiexec.exe";
const PNPUTIL: &str = "pnputil.exe";
const CMD: &str = "cmd.exe";
const REG: &str = "reg.exe";

// ============================================
// MECHANISMS
// ============================================

/// How a driver gets installed. Selected only by the driver's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Exe,
    Msi,
    Inf,
    Cmd,
    Copy,
    Shortcut,
    Registry,
    DisplayScale,
}

impl FromStr for Mechanism {
    type Err = MechanismError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exe" => Ok(Mechanism::Exe),
            "msi" => Ok(Mechanism::Msi),
            "inf" => Ok(Mechanism::Inf),
            "cmd" => Ok(Mechanism::Cmd),
            "copy" => Ok(Mechanism::Copy),
            "shortcut" => Ok(Mechanism::Shortcut),
            "registry" => Ok(Mechanism::Registry),
            "displayscale" => Ok(Mechanism::DisplayScale),
            _ => Err(MechanismError::UnsupportedType(s.to_string())),
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mechanism::Exe => "exe",
            Mechanism::Msi => "msi",
            Mechanism::Inf => "inf",
            Mechanism::Cmd => "cmd",
            Mechanism::Copy => "copy",
            Mechanism::Shortcut => "shortcut",
            Mechanism::Registry => "registry",
            Mechanism::DisplayScale => "displayscale",
        };
        f.write_str(name)
    }
}

// ============================================
// ERRORS AND OUTCOMES
// ============================================

/// Why a single driver could not be handled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MechanismError {
    #[error("driver type '{0}' is not supported")]
    UnsupportedType(String),

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("invalid display scale '{0}', expected a whole percentage")]
    InvalidScale(String),

    #[error("failed to load default user hive {}: {message}", .hive.display())]
    HiveLoad { hive: PathBuf, message: String },

    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("failed to create shortcut {}: {message}", .link.display())]
    Shortcut { link: PathBuf, message: String },

    #[error("{action} {}: {message}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("{0}")]
    Invocation(String),
}

impl MechanismError {
    pub(crate) fn io(action: &'static str, path: &Path, err: std::io::Error) -> Self {
        MechanismError::Io {
            action,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn launch(invocation: &Invocation, err: std::io::Error) -> Self {
        MechanismError::Launch {
            program: invocation.program.clone(),
            message: err.to_string(),
        }
    }
}

/// Terminal result of installing one driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RebootRequired,
    Failed(i32),
    MechanismError(MechanismError),
}

impl Outcome {
    /// 0 is success, 3010 is success pending a restart, anything else failed
    pub fn from_exit_code(code: i32) -> Outcome {
        match code {
            0 => Outcome::Success,
            EXIT_REBOOT_REQUIRED => Outcome::RebootRequired,
            other => Outcome::Failed(other),
        }
    }

    /// True when the installation ran to completion (possibly needing a reboot)
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::RebootRequired)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("ok"),
            Outcome::RebootRequired => f.write_str("ok (reboot required)"),
            Outcome::Failed(code) => write!(f, "failed (exit code {})", code),
            Outcome::MechanismError(e) => write!(f, "error: {}", e),
        }
    }
}

// ============================================
// RESOLVED DRIVERS
// ============================================

/// A driver whose path has been made absolute and whose command has had
/// its placeholders filled in. Built once per run; the manifest itself is
/// never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDriver {
    pub name: String,
    pub kind: String,
    /// Absolute driver path
    pub path: PathBuf,
    /// Directory containing `path`; also the working directory for launches
    pub dir: PathBuf,
    /// installCmd with `{path}` and `{dir}` substituted
    pub command: String,
    pub reboot_required: bool,
}

impl ResolvedDriver {
    pub fn resolve(driver: &Driver, app_dir: &Path) -> ResolvedDriver {
        let path = app_dir.join(&driver.path);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| app_dir.to_path_buf());
        let command = driver
            .install_cmd
            .replace("{path}", &path.display().to_string())
            .replace("{dir}", &dir.display().to_string());

        ResolvedDriver {
            name: driver.name.clone(),
            kind: driver.kind.clone(),
            path,
            dir,
            command,
            reboot_required: driver.reboot_required,
        }
    }

    /// File name shown in status messages
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

// ============================================
// COMMAND PARSING
// ============================================

/// Split an `exe` command into (program, arguments).
///
/// `"C:\a b\x.exe" /silent` -> (`C:\a b\x.exe`, `/silent`)
/// `setup.exe /q`           -> (`setup.exe`, `/q`)
/// `setup.exe`              -> (`setup.exe`, ``)
pub fn split_exe_command(command: &str) -> (String, String) {
    let command = command.trim();

    if let Some(rest) = command.strip_prefix('"') {
        return match rest.find('"') {
            Some(end) => (rest[..end].to_string(), rest[end + 1..].trim().to_string()),
            // Unterminated quote: everything after it is the program
            None => (rest.to_string(), String::new()),
        };
    }

    match command.find(' ') {
        Some(space) => (
            command[..space].to_string(),
            command[space + 1..].trim().to_string(),
        ),
        None => (command.to_string(), String::new()),
    }
}

/// Remove every literal occurrence of a program's own name from a command,
/// so `msiexec /i x.msi` and `/i x.msi` both end up as `/i x.msi`.
fn strip_program_token(command: &str, program: &str) -> String {
    let bare = program.trim_end_matches(".exe");
    command.replace(program, "").replace(bare, "").trim().to_string()
}

/// Build the process invocation for the four launch mechanisms.
/// Returns None for mechanisms that don't launch a program directly.
pub fn build_invocation(mechanism: Mechanism, command: &str) -> Option<Invocation> {
    let (program, args) = match mechanism {
        Mechanism::Exe => split_exe_command(command),
        Mechanism::Msi => (MSIEXEC.to_string(), strip_program_token(command, MSIEXEC)),
        Mechanism::Inf => (PNPUTIL.to_string(), strip_program_token(command, PNPUTIL)),
        Mechanism::Cmd => match command.strip_prefix(CMD) {
            Some(rest) => (CMD.to_string(), rest.trim().to_string()),
            None => (CMD.to_string(), format!("/c {}", command)),
        },
        _ => return None,
    };
    Some(Invocation::new(program, args))
}

// ============================================
// DISPATCHER
// ============================================

/// Installs drivers one at a time using the host's tools.
pub struct Installer<'a> {
    runner: &'a dyn ProcessRunner,
    shortcuts: &'a dyn ShortcutCreator,
    hive: &'a HiveSettings,
}

impl<'a> Installer<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        shortcuts: &'a dyn ShortcutCreator,
        hive: &'a HiveSettings,
    ) -> Self {
        Installer {
            runner,
            shortcuts,
            hive,
        }
    }

    /// Install one driver. Never fails; every problem becomes an Outcome.
    pub fn install(&self, driver: &ResolvedDriver) -> Outcome {
        info!("Starting installation: {}", driver.name);

        let outcome = match self.dispatch(driver) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::MechanismError(e),
        };

        match &outcome {
            Outcome::Success => info!("Completed installation: {}", driver.name),
            Outcome::RebootRequired => warn!(
                "Reboot required for {}. Exit code {}",
                driver.name, EXIT_REBOOT_REQUIRED
            ),
            Outcome::Failed(code) => error!(
                "Installation failed for {} with exit code {}",
                driver.name, code
            ),
            Outcome::MechanismError(e) => error!(
                "Error installing {} (type '{}'): {}",
                driver.name, driver.kind, e
            ),
        }

        outcome
    }

    fn dispatch(&self, driver: &ResolvedDriver) -> Result<Outcome, MechanismError> {
        let mechanism: Mechanism = driver.kind.parse()?;

        match mechanism {
            Mechanism::Copy => {
                let destination = target_from_command(mechanism, &driver.command)?;
                file_ops::copy_folder(&driver.path, destination)?;
                Ok(Outcome::Success)
            }
            Mechanism::Shortcut => {
                let link = target_from_command(mechanism, &driver.command)?;
                self.shortcuts.create_shortcut(&driver.path, link, &driver.name)?;
                Ok(Outcome::Success)
            }
            Mechanism::Registry => self.import_registry_file(&driver.path),
            Mechanism::DisplayScale => {
                display_scale::apply(self.runner, self.hive, &driver.command)
            }
            Mechanism::Exe | Mechanism::Msi | Mechanism::Inf | Mechanism::Cmd => {
                let invocation = build_invocation(mechanism, &driver.command)
                    .ok_or_else(|| MechanismError::Invocation(format!("no program for {}", mechanism)))?
                    .in_dir(&driver.dir);
                self.launch(&invocation)
            }
        }
    }

    /// Run a program, log what it printed and map its exit code.
    fn launch(&self, invocation: &Invocation) -> Result<Outcome, MechanismError> {
        info!("Executing: {}", invocation);
        if let Some(dir) = &invocation.working_dir {
            info!("Working directory: {}", dir.display());
        }

        let output = self
            .runner
            .run(invocation)
            .map_err(|e| MechanismError::launch(invocation, e))?;

        info!("Process exited with code: {}", output.code);
        if !output.stdout.trim().is_empty() {
            info!("Output: {}", output.stdout.trim_end());
        }
        if !output.stderr.trim().is_empty() {
            error!("Error output: {}", output.stderr.trim_end());
        }

        Ok(Outcome::from_exit_code(output.code))
    }

    fn import_registry_file(&self, file: &Path) -> Result<Outcome, MechanismError> {
        info!("Merging registry file: {}", file.display());

        let metadata = std::fs::metadata(file)
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| MechanismError::SourceNotFound(file.to_path_buf()))?;
        info!("Registry file found. Size: {} bytes", metadata.len());

        let invocation = Invocation::new(REG, format!("import {}", process::quote(file)));
        self.launch(&invocation)
    }
}

/// The copy destination or shortcut link named by installCmd.
/// A blank command would resolve against the current directory.
fn target_from_command(mechanism: Mechanism, command: &str) -> Result<&Path, MechanismError> {
    let target = command.trim();
    if target.is_empty() {
        return Err(MechanismError::Invocation(format!(
            "{} driver has no target path in installCmd",
            mechanism
        )));
    }
    Ok(Path::new(target))
}

// ============================================
// TESTS
// ============================================
