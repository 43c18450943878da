// ============================================
// Provisioner - pipeline.rs
// ============================================
// The installation pipeline. The program flow is:
//
// 1. Match the detected hardware against the manifest
//    - no system tier  -> "unsupported hardware", nothing is installed
// 2. Install the system tier's drivers       (chipset, serial IO, ...)
// 3. Install the common drivers              (every supported machine)
// 4. Install the peripheral tier's drivers   (if a tier matched)
//
// Drivers run one at a time, in manifest order. msiexec and the default
// user hive mount can't be shared, so nothing runs in parallel.
//
// One driver failing never stops the run. Each result is recorded in
// the report and the next driver starts.
// ============================================

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::hardware::HardwareIdentity;
use crate::installer::{Installer, MechanismError, Outcome, ResolvedDriver};
use crate::manifest::{self, Driver, Manifest, Tier};

/// Progress added once when installation starts
pub const START_WEIGHT: u32 = 1;
/// Progress added after each driver
pub const DRIVER_WEIGHT: u32 = 2;

// ============================================
// PROGRESS SINK
// ============================================

/// Receives progress updates. The CLI draws a progress bar from these;
/// headless callers can use NullSink.
pub trait ProgressSink {
    /// Called once with the maximum progress value before anything runs
    fn begin(&mut self, _total: u32) {}

    /// Add `increment` to the progress and show `status`
    fn report(&mut self, increment: u32, status: &str);
}

/// Ignores every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _increment: u32, _status: &str) {}
}

// ============================================
// PLAN
// ============================================

/// Which list a driver came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    System,
    Common,
    Peripheral,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::System => f.write_str("system"),
            Stage::Common => f.write_str("common"),
            Stage::Peripheral => f.write_str("peripheral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDriver {
    pub stage: Stage,
    pub driver: ResolvedDriver,
}

/// The ordered list of drivers to install on this machine.
///
/// Driver paths are resolved against the app directory exactly once,
/// here. The manifest is left untouched.
#[derive(Debug, Clone)]
pub struct Plan {
    pub hardware: HardwareIdentity,
    pub system_tier: Option<String>,
    pub peripheral_tier: Option<String>,
    pub drivers: Vec<PlannedDriver>,
}

impl Plan {
    pub fn prepare(manifest: &Manifest, hardware: &HardwareIdentity, app_dir: &Path) -> Plan {
        let found = manifest::match_tiers(manifest, &hardware.model, &hardware.cpu);

        match found.system {
            Some(tier) => log_tier("system", tier, hardware),
            None => {
                warn!("No system drivers found for {}", hardware);
                warn!("This hardware is NOT SUPPORTED. Installation will be skipped.");
            }
        }
        match found.peripheral {
            Some(tier) => log_tier("peripheral", tier, hardware),
            None => info!("No peripheral drivers found for {}", hardware),
        }

        let mut drivers = Vec::new();
        if let Some(tier) = found.system {
            drivers.extend(resolve_all(Stage::System, &tier.drivers, app_dir));
            drivers.extend(resolve_all(Stage::Common, &manifest.common_drivers, app_dir));
            if let Some(peripheral) = found.peripheral {
                drivers.extend(resolve_all(Stage::Peripheral, &peripheral.drivers, app_dir));
            }
        }

        Plan {
            hardware: hardware.clone(),
            system_tier: found.system.map(Tier::label),
            peripheral_tier: found.peripheral.map(Tier::label),
            drivers,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.system_tier.is_some()
    }

    /// Progress value reached when every driver has been processed
    pub fn max_progress(&self) -> u32 {
        START_WEIGHT + DRIVER_WEIGHT * self.drivers.len() as u32
    }
}

fn log_tier(kind: &str, tier: &Tier, hardware: &HardwareIdentity) {
    info!("Found {} drivers ({}) for {}", kind, tier.label(), hardware);
    for driver in &tier.drivers {
        info!("{} driver: {}", kind, driver.name);
    }
}

fn resolve_all<'a>(
    stage: Stage,
    drivers: &'a [Driver],
    app_dir: &'a Path,
) -> impl Iterator<Item = PlannedDriver> + 'a {
    drivers.iter().map(move |d| PlannedDriver {
        stage,
        driver: ResolvedDriver::resolve(d, app_dir),
    })
}

// ============================================
// RESULTS
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverResult {
    pub stage: Stage,
    pub name: String,
    pub outcome: Outcome,
    /// The manifest says this driver needs a restart
    pub reboot_flagged: bool,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub run_id: Uuid,
    pub results: Vec<DriverResult>,
}

impl Report {
    pub fn failures(&self) -> impl Iterator<Item = &DriverResult> {
        self.results.iter().filter(|r| !r.outcome.is_completed())
    }

    /// A restart is needed if any installer said so (3010) or the manifest
    /// flags a driver that completed
    pub fn reboot_needed(&self) -> bool {
        self.results.iter().any(|r| {
            r.outcome == Outcome::RebootRequired || (r.reboot_flagged && r.outcome.is_completed())
        })
    }
}

#[derive(Debug, Clone)]
pub enum PipelineResult {
    /// No system tier matched; nothing was installed
    UnsupportedHardware(HardwareIdentity),
    /// Every planned driver was attempted
    Completed(Report),
}

// ============================================
// EXECUTION
// ============================================

/// Match, plan and install in one go.
pub fn run(
    manifest: &Manifest,
    hardware: &HardwareIdentity,
    app_dir: &Path,
    installer: &Installer<'_>,
    sink: &mut dyn ProgressSink,
) -> PipelineResult {
    let plan = Plan::prepare(manifest, hardware, app_dir);
    execute(&plan, installer, sink)
}

/// Install every driver of a prepared plan, in order.
pub fn execute(plan: &Plan, installer: &Installer<'_>, sink: &mut dyn ProgressSink) -> PipelineResult {
    if !plan.is_supported() {
        error!(
            "Cannot install drivers: hardware not supported ({})",
            plan.hardware
        );
        sink.report(0, "Installation aborted: Unsupported hardware");
        return PipelineResult::UnsupportedHardware(plan.hardware.clone());
    }

    let run_id = Uuid::new_v4();
    let span = info_span!("run", id = %run_id);
    let _guard = span.enter();

    info!("Installing {} drivers for {}", plan.drivers.len(), plan.hardware);
    sink.begin(plan.max_progress());
    sink.report(START_WEIGHT, "Starting installation");

    let mut results = Vec::with_capacity(plan.drivers.len());
    let mut current_stage = None;

    for planned in &plan.drivers {
        if current_stage != Some(planned.stage) {
            info!("=== Installing {} drivers ===", planned.stage);
            current_stage = Some(planned.stage);
        }

        let driver = &planned.driver;
        info!(
            "Preparing to install {} driver: {} path: {}",
            planned.stage,
            driver.name,
            driver.path.display()
        );
        sink.report(
            0,
            &format!(
                "Installing {} driver [{}]: {}",
                planned.stage,
                driver.name,
                driver.file_name()
            ),
        );

        let outcome = install_isolated(installer, driver);

        sink.report(
            DRIVER_WEIGHT,
            &format!("{} driver [{}]: {}", planned.stage, driver.name, outcome),
        );
        results.push(DriverResult {
            stage: planned.stage,
            name: driver.name.clone(),
            outcome,
            reboot_flagged: driver.reboot_required,
        });
    }

    let report = Report { run_id, results };
    let failed = report.failures().count();
    if failed == 0 {
        info!("All drivers installed");
        sink.report(0, "All drivers installed");
    } else {
        warn!("{} of {} drivers failed", failed, report.results.len());
        sink.report(0, &format!("Installation finished with {} failure(s), see log", failed));
    }
    if report.reboot_needed() {
        warn!("A restart is required to finish installation");
    }

    PipelineResult::Completed(report)
}

/// Run one driver, turning a panic inside the installer into an outcome
fn install_isolated(installer: &Installer<'_>, driver: &ResolvedDriver) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| installer.install(driver))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Installer for {} panicked: {}", driver.name, message);
            Outcome::MechanismError(MechanismError::Invocation(format!(
                "installer panicked: {}",
                message
            )))
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display_scale::HiveSettings;
    use crate::installer::tests::{FakeRunner, FakeShortcuts};
    use crate::process::{Invocation, ProcessOutput, ProcessRunner};
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        total: u32,
        progress: u32,
        statuses: Vec<String>,
    }

    impl ProgressSink for RecordingSink {
        fn begin(&mut self, total: u32) {
            self.total = total;
        }

        fn report(&mut self, increment: u32, status: &str) {
            self.progress += increment;
            self.statuses.push(status.to_string());
        }
    }

    fn driver(name: &str, kind: &str, cmd: &str) -> Driver {
        Driver {
            name: name.to_string(),
            kind: kind.to_string(),
            path: format!("drivers/{}/setup.exe", name),
            install_cmd: cmd.to_string(),
            ..Default::default()
        }
    }

    fn tier(model: &str, cpu: &str, drivers: Vec<Driver>) -> Tier {
        Tier {
            model: model.to_string(),
            cpu: cpu.to_string(),
            drivers,
            ..Default::default()
        }
    }

    fn hive() -> HiveSettings {
        HiveSettings {
            unload_delay: Duration::ZERO,
            ..HiveSettings::default()
        }
    }

    fn x1() -> HardwareIdentity {
        HardwareIdentity {
            model: "X1".into(),
            cpu: "Intel(R) Core(TM) i7".into(),
        }
    }

    #[test]
    fn test_end_to_end_continues_after_failure() {
        let manifest = Manifest {
            system_tiers: vec![tier(
                "X1",
                "Intel",
                vec![
                    driver("chipset", "exe", "\"{path}\" -s"),
                    driver("serialio", "cmd", "install.bat"),
                ],
            )],
            ..Default::default()
        };

        let runner = FakeRunner::with_codes(&[1603, 0]);
        let shortcuts = FakeShortcuts::default();
        let settings = hive();
        let installer = Installer::new(&runner, &shortcuts, &settings);
        let mut sink = RecordingSink::default();

        let result = run(&manifest, &x1(), Path::new("/app"), &installer, &mut sink);
        let PipelineResult::Completed(report) = result else {
            panic!("expected a completed run");
        };

        assert_eq!(
            runner.programs(),
            vec!["/app/drivers/chipset/setup.exe".to_string(), "cmd.exe".to_string()]
        );
        assert_eq!(report.results[0].outcome, Outcome::Failed(1603));
        assert_eq!(report.results[1].outcome, Outcome::Success);
        assert_eq!(report.failures().count(), 1);

        assert_eq!(sink.total, 5);
        assert_eq!(sink.progress, 5);
        assert!(sink.statuses.last().unwrap().contains("1 failure"));
    }

    #[test]
    fn test_unsupported_hardware_installs_nothing() {
        let manifest = Manifest {
            system_tiers: vec![tier("X1", "AMD", vec![driver("chipset", "exe", "{path}")])],
            common_drivers: vec![driver("tools", "exe", "{path}")],
            peripheral_tiers: vec![tier("X1", "Intel", vec![driver("printer", "exe", "{path}")])],
            ..Default::default()
        };

        let runner = FakeRunner::default();
        let shortcuts = FakeShortcuts::default();
        let settings = hive();
        let installer = Installer::new(&runner, &shortcuts, &settings);
        let mut sink = RecordingSink::default();

        let result = run(&manifest, &x1(), Path::new("/app"), &installer, &mut sink);
        assert!(matches!(result, PipelineResult::UnsupportedHardware(_)));
        assert!(runner.calls.borrow().is_empty());
        assert_eq!(sink.progress, 0);
    }

    #[test]
    fn test_stage_order_system_common_peripheral() {
        let manifest = Manifest {
            peripheral_tiers: vec![tier("X1", "Core", vec![driver("printer", "exe", "p.exe")])],
            common_drivers: vec![driver("tools", "exe", "t.exe"), driver("viewer", "exe", "v.exe")],
            system_tiers: vec![tier("X1", "Intel", vec![driver("chipset", "exe", "c.exe")])],
            ..Default::default()
        };

        let plan = Plan::prepare(&manifest, &x1(), Path::new("/app"));
        let order: Vec<_> = plan
            .drivers
            .iter()
            .map(|p| (p.stage, p.driver.name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Stage::System, "chipset"),
                (Stage::Common, "tools"),
                (Stage::Common, "viewer"),
                (Stage::Peripheral, "printer"),
            ]
        );
        assert_eq!(plan.max_progress(), 9);

        // Resolving the plan leaves the manifest as it was
        assert_eq!(manifest.common_drivers[0].path, "drivers/tools/setup.exe");
    }

    #[test]
    fn test_missing_peripheral_tier_is_fine() {
        let manifest = Manifest {
            system_tiers: vec![tier("X1", "Intel", vec![driver("chipset", "exe", "c.exe")])],
            ..Default::default()
        };

        let plan = Plan::prepare(&manifest, &x1(), Path::new("/app"));
        assert!(plan.is_supported());
        assert!(plan.peripheral_tier.is_none());
        assert_eq!(plan.drivers.len(), 1);
    }

    #[test]
    fn test_reboot_required_counts_as_completed() {
        let manifest = Manifest {
            system_tiers: vec![tier(
                "X1",
                "Intel",
                vec![driver("gpu", "exe", "g.exe"), driver("bogus", "zip", "")],
            )],
            ..Default::default()
        };

        let runner = FakeRunner::with_codes(&[3010]);
        let shortcuts = FakeShortcuts::default();
        let settings = hive();
        let installer = Installer::new(&runner, &shortcuts, &settings);

        let PipelineResult::Completed(report) =
            run(&manifest, &x1(), Path::new("/app"), &installer, &mut NullSink)
        else {
            panic!("expected a completed run");
        };

        assert_eq!(report.results[0].outcome, Outcome::RebootRequired);
        assert!(report.reboot_needed());
        let failed: Vec<_> = report.failures().map(|r| r.name.as_str()).collect();
        assert_eq!(failed, vec!["bogus"]);
    }

    struct PanicOnce {
        inner: FakeRunner,
    }

    impl ProcessRunner for PanicOnce {
        fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
            if self.inner.calls.borrow().is_empty() {
                self.inner.calls.borrow_mut().push(invocation.clone());
                panic!("installer exploded");
            }
            self.inner.run(invocation)
        }
    }

    #[test]
    fn test_panic_in_one_driver_does_not_stop_the_run() {
        let manifest = Manifest {
            system_tiers: vec![tier(
                "X1",
                "Intel",
                vec![driver("first", "exe", "a.exe"), driver("second", "exe", "b.exe")],
            )],
            ..Default::default()
        };

        let runner = PanicOnce {
            inner: FakeRunner::default(),
        };
        let shortcuts = FakeShortcuts::default();
        let settings = hive();
        let installer = Installer::new(&runner, &shortcuts, &settings);

        let PipelineResult::Completed(report) =
            run(&manifest, &x1(), Path::new("/app"), &installer, &mut NullSink)
        else {
            panic!("expected a completed run");
        };

        assert!(matches!(
            report.results[0].outcome,
            Outcome::MechanismError(MechanismError::Invocation(_))
        ));
        assert_eq!(report.results[1].outcome, Outcome::Success);
    }
}
