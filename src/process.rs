// ============================================
// Provisioner - process.rs
// ============================================
// Running external programs.
//
// Every external tool the provisioner uses (setup.exe installers,
// msiexec, pnputil, cmd, reg, powershell) is started through the
// ProcessRunner trait. The real implementation wraps std::process::Command;
// tests swap in a fake that records invocations and returns scripted
// exit codes.
// ============================================

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Hide the console window of launched programs
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Exit code installers use for "succeeded, restart needed"
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;

// ============================================
// INVOCATION
// ============================================

/// A program to launch plus its raw argument string.
///
/// Arguments are kept as one string, exactly as written in the manifest,
/// because Windows installers parse their own command line and are picky
/// about quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: String,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: impl Into<String>) -> Self {
        Invocation {
            program: program.into(),
            args: args.into(),
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.program)
        } else {
            write!(f, "{} {}", self.program, self.args)
        }
    }
}

/// Everything a finished process left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

// ============================================
// RUNNER
// ============================================

/// Starts a program, waits for it to exit and returns its captured output.
pub trait ProcessRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput>;
}

/// Runs programs on the host with std::process::Command.
///
/// Both pipes are drained by `Command::output()` while the child runs,
/// so installers that print a lot of text cannot block on a full pipe.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        #[cfg(windows)]
        {
            if !invocation.args.is_empty() {
                command.raw_arg(&invocation.args);
            }
            command.creation_flags(CREATE_NO_WINDOW);
        }

        #[cfg(not(windows))]
        {
            command.args(invocation.args.split_whitespace());
        }

        let output = command.output()?;

        Ok(ProcessOutput {
            // None only when killed by a signal (non-Windows)
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Wrap a path in double quotes for a raw Windows command line
pub fn quote(path: &std::path::Path) -> String {
    format!("\"{}\"", path.display())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("msiexec.exe", "/i app.msi /qn");
        assert_eq!(inv.to_string(), "msiexec.exe /i app.msi /qn");

        let bare = Invocation::new("setup.exe", "");
        assert_eq!(bare.to_string(), "setup.exe");
    }

    #[test]
    fn test_quote() {
        let path = std::path::Path::new(r"C:\a b\x.reg");
        assert_eq!(quote(path), r#""C:\a b\x.reg""#);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_output_and_code() {
        let runner = SystemRunner;
        let out = runner
            .run(&Invocation::new("sh", "-c exit 0"))
            .expect("sh should be available");
        assert!(out.success());

        let missing = runner.run(&Invocation::new("definitely-not-a-real-program-xyz", ""));
        assert!(missing.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_drains_large_output_on_both_pipes() {
        // Arguments are split on whitespace here, so the script uses ${IFS}
        let script = "head${IFS}-c${IFS}1000000${IFS}/dev/zero;\
                      head${IFS}-c${IFS}1000000${IFS}/dev/zero>&2";
        let out = SystemRunner
            .run(&Invocation::new("sh", format!("-c {}", script)))
            .expect("sh should be available");

        assert_eq!(out.code, 0);
        assert_eq!(out.stdout.len(), 1_000_000);
        assert_eq!(out.stderr.len(), 1_000_000);
    }
}
