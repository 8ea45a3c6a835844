use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod emulator;
mod lock;
mod paths;
mod pipeline;
mod process;
mod reconcile;
mod toolchain;
mod worker;

use cli::{BuildArgs, Command, ConfigArgs, ReconcileArgs, RootArgs, RunArgs};
use config::{default_config_path, load_config, write_config, AppConfig};
use emulator::{EmulatorFlags, LaunchRequest};
use paths::{normalize_path, BuildPaths};
use pipeline::BuildRequest;
use reconcile::{purge, reconcile, ArtifactKind, Disposition};
use worker::BuildWorker;

fn main() -> Result<ExitCode> {
    let args = RootArgs::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    match args.command {
        Command::Build(build) => cmd_build(&config_path, build),
        Command::Run(run) => cmd_run(&config_path, run),
        Command::Reconcile(reconcile) => cmd_reconcile(reconcile),
        Command::Config(config) => cmd_config(&config_path, config).map(|()| ExitCode::SUCCESS),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_build(config_path: &Path, args: BuildArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path);
    apply_build_overrides(&mut config, &args);
    let request = build_request(&config, &args.source);

    let worker = BuildWorker::new();
    let handle = worker.submit_build(request)?;
    let report = handle
        .join()
        .map_err(|_| anyhow!("build worker panicked"))?;
    tracing::debug!(states = ?report.states, "build states");

    if args.save_config {
        write_config(config_path, &config)?;
    }

    println!("{}", worker.status());
    if let Some(kind) = report.outcome.failure_kind() {
        eprintln!("failure: {kind}");
    }
    if let Some(detail) = report.outcome.detail() {
        eprintln!("{detail}");
    }
    if let Some(log_path) = &report.log_path {
        eprintln!("log: {}", log_path.display());
    }
    Ok(exit_code(report.outcome.is_success()))
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path);
    apply_build_overrides(&mut config, &args.build);
    apply_run_overrides(&mut config, &args);

    let paths = BuildPaths::new(&args.build.source, &config.working_dir, &config.logs_dir)?;
    let request = LaunchRequest {
        emulator: config.emulator.clone(),
        disk_image: paths.image_path(),
        system_disk: config.system_disk.clone(),
        rom_path: config.rom_path.clone(),
        machine: config.machine.clone(),
        flags: EmulatorFlags {
            windowed: config.windowed,
            software_video: config.software_video,
            ui_active: config.ui_active,
            skip_intro: config.skip_intro,
            resolution: Some(config.resolution.clone()).filter(|value| !value.trim().is_empty()),
        },
        working_dir: paths.working_dir().to_path_buf(),
        log_path: paths.log_path(),
    };
    let fallback = (!args.no_build).then(|| build_request(&config, &args.build.source));

    let worker = BuildWorker::new();
    let handle = worker.submit_run(request, fallback)?;
    let outcome = handle
        .join()
        .map_err(|_| anyhow!("run worker panicked"))??;

    if args.build.save_config {
        write_config(config_path, &config)?;
    }

    println!("{}", worker.status());
    if let Some(kind) = outcome.failure_kind() {
        eprintln!("failure: {kind}");
    }
    if let Some(detail) = outcome.detail() {
        eprintln!("{detail}");
    }
    Ok(exit_code(outcome.is_success()))
}

fn cmd_reconcile(args: ReconcileArgs) -> Result<ExitCode> {
    let kind: ArtifactKind = args.kind.parse()?;
    let working_dir = normalize_path(&args.workdir)?;
    let source_dir = normalize_path(&args.source_dir)?;
    let base = args.base.to_uppercase();

    if args.purge {
        let actions = purge(&working_dir, &source_dir, &base, kind);
        if actions.is_empty() {
            println!("nothing to purge");
        }
        for action in &actions {
            println!("{action}");
        }
        return Ok(exit_code(actions.iter().all(|action| {
            !matches!(action.disposition, Disposition::Failed { .. })
        })));
    }

    let report = reconcile(&working_dir, &source_dir, &base, kind);
    for action in &report.actions {
        println!("{action}");
    }
    if report.artifact_present() {
        println!("canonical: {}", report.canonical.display());
    } else {
        eprintln!("no {} candidates for {base}", kind.extension());
    }
    Ok(exit_code(
        report.artifact_present() && report.failures().next().is_none(),
    ))
}

fn cmd_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    if args.path {
        println!("{}", config_path.display());
        return Ok(());
    }
    let config = load_config(config_path);
    if args.init {
        write_config(config_path, &config)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }
    let text = serde_json::to_string_pretty(&config).context("serialize config")?;
    println!("{text}");
    Ok(())
}

fn apply_build_overrides(config: &mut AppConfig, args: &BuildArgs) {
    if let Some(workdir) = &args.workdir {
        config.working_dir = workdir.clone();
    }
    if let Some(assembler) = &args.assembler {
        config.assembler = assembler.clone();
    }
    if let Some(packager) = &args.packager {
        config.packager = packager.clone();
    }
    if let Some(format) = &args.format {
        config.disk_format = format.clone();
    }
    if let Some(logs_dir) = &args.logs_dir {
        config.logs_dir = logs_dir.clone();
    }
}

fn apply_run_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(emulator) = &args.emulator {
        config.emulator = emulator.clone();
    }
    if let Some(system_disk) = &args.system_disk {
        config.system_disk = system_disk.clone();
    }
    if let Some(rom_path) = &args.rom_path {
        config.rom_path = rom_path.clone();
    }
    if let Some(machine) = &args.machine {
        config.machine = machine.clone();
    }
    if let Some(windowed) = args.windowed() {
        config.windowed = windowed;
    }
    if let Some(software_video) = args.software_video() {
        config.software_video = software_video;
    }
    if let Some(ui_active) = args.ui_active() {
        config.ui_active = ui_active;
    }
    if let Some(skip_intro) = args.skip_intro() {
        config.skip_intro = skip_intro;
    }
    if let Some(resolution) = &args.resolution {
        config.resolution = resolution.clone();
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn build_request(config: &AppConfig, source: &Path) -> BuildRequest {
    BuildRequest {
        source: source.to_path_buf(),
        working_dir: config.working_dir.clone(),
        assembler: config.assembler.clone(),
        packager: config.packager.clone(),
        disk_format: Some(config.disk_format.clone()),
        logs_dir: config.logs_dir.clone(),
        extra_env: toolchain::toolchain_env(&config.assembler),
    }
}
