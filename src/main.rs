// ============================================
// Provisioner - main.rs
// ============================================
// Entry point. Installs drivers on a freshly imaged machine.
//
// The program flow is:
// 1. Load provisioner.toml (optional) and set up logging
// 2. Load manifest.json from next to the EXE
// 3. Detect the machine's model and CPU
// 4. `inspect`: show what would be installed
//    `install`: run the installation pipeline with a progress bar
//
// Exit codes:
//   0 - finished (individual drivers may still have failed, see the log)
//   1 - setup error (bad settings, missing manifest, ...)
//   2 - this hardware is not in the manifest
// ============================================

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod display_scale;
mod file_ops;
mod hardware;
mod installer;
mod manifest;
mod pipeline;
mod process;
mod settings;

use hardware::{FixedHardware, HardwareIdentity, HardwareSource, WmiHardwareSource};
use installer::Installer;
use manifest::Manifest;
use pipeline::{NullSink, PipelineResult, Plan, ProgressSink};
use process::SystemRunner;
use settings::{Settings, SETTINGS_FILE};

const EXIT_FAILURE: u8 = 1;
const EXIT_UNSUPPORTED: u8 = 2;

// ============================================
// COMMAND LINE
// ============================================

#[derive(Debug, Parser)]
#[command(
    name = "provisioner",
    version,
    about = "Install drivers on a freshly imaged machine from a manifest"
)]
struct Cli {
    /// Settings file (default: provisioner.toml next to the EXE).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Manifest file (default: from settings, relative to the EXE).
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Use this model instead of asking WMI.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Use this CPU name instead of asking WMI.
    #[arg(long, global = true)]
    cpu: Option<String>,

    /// Show debug output on the console.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect the hardware and show the drivers that would be installed.
    Inspect,
    /// Install every driver for this machine.
    Install {
        /// Don't draw a progress bar.
        #[arg(long, default_value_t = false)]
        no_progress: bool,
    },
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let app_dir = settings::get_app_directory();
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(|| app_dir.join(SETTINGS_FILE));
    let settings = Settings::load_or_default(&settings_path)?;

    let bar = match cli.command {
        Commands::Install { no_progress: false } => progress_bar(),
        _ => ProgressBar::hidden(),
    };
    init_logging(&settings.log_path(&app_dir), cli.verbose, ConsoleWriter::new(bar.clone()))?;
    info!("Provisioner v{}", env!("CARGO_PKG_VERSION"));
    info!("App directory: {}", app_dir.display());

    let manifest_path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| settings.manifest_path(&app_dir));
    let manifest = Manifest::load(&manifest_path)?;
    info!(
        "Loaded manifest version '{}' from {} ({} drivers)",
        manifest.version,
        manifest_path.display(),
        manifest.driver_count()
    );

    let runner = SystemRunner;
    let hardware = detect_hardware(&cli, &runner);

    match cli.command {
        Commands::Inspect => {
            let plan = Plan::prepare(&manifest, &hardware, &app_dir);
            print_plan(&manifest, &plan);
            Ok(if plan.is_supported() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_UNSUPPORTED)
            })
        }
        Commands::Install { no_progress } => {
            let hive = settings.hive();
            let shortcuts = file_ops::ShellShortcuts::new(&runner);
            let installer = Installer::new(&runner, &shortcuts, &hive);

            let result = if no_progress {
                pipeline::run(&manifest, &hardware, &app_dir, &installer, &mut NullSink)
            } else {
                let mut sink = ConsoleSink { bar };
                let result = pipeline::run(&manifest, &hardware, &app_dir, &installer, &mut sink);
                sink.finish();
                result
            };

            Ok(print_result(&result))
        }
    }
}

/// WMI detection, with --model / --cpu taking precedence
fn detect_hardware(cli: &Cli, runner: &SystemRunner) -> HardwareIdentity {
    let source: Box<dyn HardwareSource + '_> = match (&cli.model, &cli.cpu) {
        (Some(model), Some(cpu)) => Box::new(FixedHardware(HardwareIdentity {
            model: model.clone(),
            cpu: cpu.clone(),
        })),
        _ => Box::new(WmiHardwareSource::new(runner)),
    };

    let mut hardware = source.detect();
    if let Some(model) = &cli.model {
        hardware.model = model.clone();
    }
    if let Some(cpu) = &cli.cpu {
        hardware.cpu = cpu.clone();
    }
    info!("Detected {}", hardware);
    hardware
}

// ============================================
// LOGGING
// ============================================

/// Log to the console and to a plain-text log file next to the EXE.
///
/// The file gets everything at PROVISIONER_LOG level (default info).
/// The console only shows warnings unless --verbose is given, and is
/// written through `console` so lines don't tear the progress bar.
fn init_logging(log_path: &Path, verbose: bool, console: ConsoleWriter) -> Result<()> {
    let file_filter =
        EnvFilter::try_from_env("PROVISIONER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(console)
                .with_filter(console_level),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(file_filter),
        )
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}

// ============================================
// CONSOLE OUTPUT
// ============================================

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}/{len:3} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Stderr writer for the console log layer. The bar is cleared while a
/// line is written and redrawn afterwards.
#[derive(Clone)]
struct ConsoleWriter {
    bar: ProgressBar,
}

impl ConsoleWriter {
    fn new(bar: ProgressBar) -> Self {
        ConsoleWriter { bar }
    }
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bar.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.bar.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Progress bar on the terminal
struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    fn finish(&self) {
        self.bar.finish();
    }
}

impl ProgressSink for ConsoleSink {
    fn begin(&mut self, total: u32) {
        self.bar.set_length(u64::from(total));
    }

    fn report(&mut self, increment: u32, status: &str) {
        self.bar.inc(u64::from(increment));
        self.bar.set_message(status.to_string());
    }
}

fn print_plan(manifest: &Manifest, plan: &Plan) {
    println!("Model:           {}", plan.hardware.model);
    println!("CPU:             {}", plan.hardware.cpu);
    println!("Manifest:        version {}", manifest.version);
    println!(
        "System tier:     {}",
        plan.system_tier.as_deref().unwrap_or("NONE (hardware not supported)")
    );
    println!(
        "Peripheral tier: {}",
        plan.peripheral_tier.as_deref().unwrap_or("none")
    );

    if !plan.is_supported() {
        return;
    }

    println!();
    println!("Installation order:");
    for (index, planned) in plan.drivers.iter().enumerate() {
        println!(
            "  {:>2}. [{}] {} ({}) {}",
            index + 1,
            planned.stage,
            planned.driver.name,
            planned.driver.kind,
            planned.driver.path.display()
        );
    }
}

fn print_result(result: &PipelineResult) -> ExitCode {
    match result {
        PipelineResult::UnsupportedHardware(hardware) => {
            eprintln!("Installation aborted: unsupported hardware ({})", hardware);
            ExitCode::from(EXIT_UNSUPPORTED)
        }
        PipelineResult::Completed(report) => {
            println!("Run {}", report.run_id);
            for r in &report.results {
                println!("  [{}] {:<32} {}", r.stage, r.name, r.outcome);
            }

            let failed = report.failures().count();
            if failed == 0 {
                println!("All drivers installed successfully!");
            } else {
                println!("{} driver(s) failed, see the log for details", failed);
            }
            if report.reboot_needed() {
                println!("A restart is required to finish installation.");
            }
            ExitCode::SUCCESS
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_writer_passes_lines_through_hidden_bar() {
        let bar = ProgressBar::hidden();
        let mut writer = ConsoleWriter::new(bar.clone()).make_writer();
        writer.write_all(b"WARN something\n").unwrap();
        writer.flush().unwrap();
        assert!(bar.is_hidden());
    }

    #[test]
    fn test_cli_parses_global_flags_and_commands() {
        let cli = Cli::parse_from(["provisioner", "install", "--no-progress"]);
        assert!(matches!(cli.command, Commands::Install { no_progress: true }));

        let cli = Cli::parse_from(["provisioner", "--model", "X1", "inspect"]);
        assert!(matches!(cli.command, Commands::Inspect));
        assert_eq!(cli.model.as_deref(), Some("X1"));
    }
}
