// ============================================
// Provisioner - hardware.rs
// ============================================
// Detects which machine we're running on: the system model
// (Win32_ComputerSystem.Model) and the CPU name (Win32_Processor.Name).
//
// Detection never fails. An unknown model or CPU simply won't match any
// manifest tier, which the pipeline reports as unsupported hardware.
// ============================================

use std::fmt;

use tracing::{info, warn};

use crate::process::{Invocation, ProcessRunner};

/// The two strings the manifest is matched against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareIdentity {
    pub model: String,
    pub cpu: String,
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model '{}', CPU '{}'", self.model, self.cpu)
    }
}

/// Anything that can tell us the model and CPU
pub trait HardwareSource {
    fn detect(&self) -> HardwareIdentity;
}

/// Values given on the command line (--model / --cpu)
#[derive(Debug, Clone)]
pub struct FixedHardware(pub HardwareIdentity);

impl HardwareSource for FixedHardware {
    fn detect(&self) -> HardwareIdentity {
        self.0.clone()
    }
}

/// Queries WMI through PowerShell's Get-CimInstance
pub struct WmiHardwareSource<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> WmiHardwareSource<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        WmiHardwareSource { runner }
    }

    /// First instance's property, or an empty string
    fn query(&self, class: &str, property: &str) -> String {
        let script = format!(
            "(Get-CimInstance -ClassName {} | Select-Object -First 1).{}",
            class, property
        );
        let invocation = Invocation::new(
            "powershell.exe",
            format!("-NoProfile -NonInteractive -Command \"{}\"", script),
        );

        match self.runner.run(&invocation) {
            Ok(output) if output.success() => first_line(&output.stdout),
            Ok(output) => {
                warn!(
                    "WMI query {}.{} failed (exit code {}): {}",
                    class,
                    property,
                    output.code,
                    output.stderr.trim()
                );
                String::new()
            }
            Err(e) => {
                warn!("Failed to run PowerShell for {}.{}: {}", class, property, e);
                String::new()
            }
        }
    }
}

impl HardwareSource for WmiHardwareSource<'_> {
    fn detect(&self) -> HardwareIdentity {
        let identity = HardwareIdentity {
            model: self.query("Win32_ComputerSystem", "Model"),
            cpu: self.query("Win32_Processor", "Name"),
        };
        info!("Model: {}", identity.model);
        info!("CPU: {}", identity.cpu);
        identity
    }
}

fn first_line(stdout: &str) -> String {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::tests::FakeRunner;
    use crate::process::ProcessOutput;
    use std::io;

    struct Answers;

    impl ProcessRunner for Answers {
        fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
            let stdout = if invocation.args.contains("Win32_ComputerSystem") {
                "\r\nX1 Carbon  \r\n"
            } else {
                "Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz\r\n"
            };
            Ok(ProcessOutput {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_wmi_detection_trims_output() {
        let identity = WmiHardwareSource::new(&Answers).detect();
        assert_eq!(identity.model, "X1 Carbon");
        assert_eq!(identity.cpu, "Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz");
    }

    #[test]
    fn test_failed_query_yields_empty_strings() {
        let runner = FakeRunner::with_codes(&[1, 1]);
        let identity = WmiHardwareSource::new(&runner).detect();
        assert_eq!(identity, HardwareIdentity::default());
    }
}
