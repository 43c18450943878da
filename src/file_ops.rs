// ============================================
// Provisioner - file_ops.rs
// ============================================
// File-based driver types:
//   copy     - recursive folder copy (walkdir)
//   shortcut - .lnk creation through the Windows Script Host
// ============================================

use std::fs;
use std::path::Path;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::installer::MechanismError;
use crate::process::{Invocation, ProcessRunner};

// ============================================
// FOLDER COPY
// ============================================

/// Copy the tree under `source` into `destination`.
///
/// The destination is created as needed and existing files are
/// overwritten. Nothing is rolled back if a copy fails halfway.
/// Returns the number of files copied.
pub fn copy_folder(source: &Path, destination: &Path) -> Result<usize, MechanismError> {
    info!(
        "Copying folder from: {} to: {}",
        source.display(),
        destination.display()
    );

    if !source.is_dir() {
        return Err(MechanismError::SourceNotFound(source.to_path_buf()));
    }
    if destination.as_os_str().is_empty() {
        return Err(MechanismError::Invocation("copy destination is empty".to_string()));
    }

    if !destination.exists() {
        info!("Creating destination directory: {}", destination.display());
    }
    fs::create_dir_all(destination)
        .map_err(|e| MechanismError::io("failed to create", destination, e))?;

    let mut copied = 0;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| MechanismError::Io {
            action: "failed to read",
            path: e.path().unwrap_or(source).to_path_buf(),
            message: e.to_string(),
        })?;

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| MechanismError::Invocation(e.to_string()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            debug!("Copying subdirectory: {}", relative.display());
            fs::create_dir_all(&target)
                .map_err(|e| MechanismError::io("failed to create", &target, e))?;
        } else {
            debug!("Copying file: {}", relative.display());
            fs::copy(entry.path(), &target)
                .map_err(|e| MechanismError::io("failed to copy to", &target, e))?;
            copied += 1;
        }
    }

    info!(
        "Successfully copied {} files to {}",
        copied,
        destination.display()
    );
    Ok(copied)
}

// ============================================
// SHORTCUTS
// ============================================

/// Creates shell links (.lnk files).
pub trait ShortcutCreator {
    /// Create `link` pointing at `target`, working directory set to the
    /// target's folder.
    fn create_shortcut(
        &self,
        target: &Path,
        link: &Path,
        description: &str,
    ) -> Result<(), MechanismError>;
}

/// Creates shortcuts with WScript.Shell from a PowerShell one-liner.
pub struct ShellShortcuts<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> ShellShortcuts<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        ShellShortcuts { runner }
    }
}

/// Quote a value as a PowerShell single-quoted string that survives the
/// surrounding `-Command "..."` argument.
///
/// Single quotes (including the typographic ones PowerShell also accepts)
/// are doubled. Double quotes are backslash-escaped for the command line
/// parser, along with any backslashes directly in front of them.
fn ps_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');

    let mut backslashes = 0;
    for c in value.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                out.push(c);
                continue;
            }
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes + 1));
                out.push('"');
            }
            '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => {
                out.push(c);
                out.push(c);
            }
            _ => out.push(c),
        }
        backslashes = 0;
    }

    out.push('\'');
    out
}

/// The PowerShell script that saves one shortcut
pub fn shortcut_script(target: &Path, link: &Path, description: &str) -> String {
    let working_dir = target
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    format!(
        "$s = New-Object -ComObject WScript.Shell; \
         $l = $s.CreateShortcut({}); \
         $l.TargetPath = {}; \
         $l.WorkingDirectory = {}; \
         $l.Description = {}; \
         $l.Save()",
        ps_literal(&link.display().to_string()),
        ps_literal(&target.display().to_string()),
        ps_literal(&working_dir),
        ps_literal(description),
    )
}

impl ShortcutCreator for ShellShortcuts<'_> {
    fn create_shortcut(
        &self,
        target: &Path,
        link: &Path,
        description: &str,
    ) -> Result<(), MechanismError> {
        info!(
            "Creating shortcut at: {} -> Target: {}",
            link.display(),
            target.display()
        );

        if let Some(dir) = link.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                info!("Creating shortcut directory: {}", dir.display());
            }
            fs::create_dir_all(dir).map_err(|e| MechanismError::io("failed to create", dir, e))?;
        }

        let invocation = Invocation::new(
            "powershell.exe",
            format!(
                "-NoProfile -NonInteractive -ExecutionPolicy Bypass -Command \"{}\"",
                shortcut_script(target, link, description)
            ),
        );

        let output = self.runner.run(&invocation).map_err(|e| MechanismError::Shortcut {
            link: link.to_path_buf(),
            message: e.to_string(),
        })?;

        if !output.success() {
            return Err(MechanismError::Shortcut {
                link: link.to_path_buf(),
                message: format!("exit code {}: {}", output.code, output.stderr.trim()),
            });
        }

        info!("Successfully created shortcut: {}", link.display());
        Ok(())
    }
}

// ============================================
// TESTS
// ============================================
