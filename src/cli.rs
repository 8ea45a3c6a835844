//! CLI argument parsing for the assemble/package/run workflow.
//!
//! Every value here is optional and overrides the persisted configuration for
//! one invocation; resolution against the config happens in `main`.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "asmtodsk",
    version,
    about = "Assemble Z80 sources into CP/M disk images and boot them in MAME",
    after_help = "Examples:\n  asmtodsk build --source ~/src/hello.asm\n  asmtodsk run --source ~/src/hello.asm --resolution 1024x768\n  asmtodsk reconcile --workdir ~/Desktop --source-dir ~/src --base HELLO --kind com\n  asmtodsk config --init",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Config file to read (and write with --save-config)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log pipeline progress to stderr
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assemble and package one source file
    Build(BuildArgs),
    /// Boot the disk image in the emulator, building it first if missing
    Run(RunArgs),
    /// Collapse stray artifacts into the canonical name
    Reconcile(ReconcileArgs),
    /// Show or initialize the configuration file
    Config(ConfigArgs),
}

/// Inputs shared by `build` and `run`.
#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Z80 assembly source file
    #[arg(long, value_name = "ASM")]
    pub source: PathBuf,

    /// Directory the .COM and .DSK are written to
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Assembler executable (z80asm)
    #[arg(long, value_name = "PATH")]
    pub assembler: Option<PathBuf>,

    /// Disk packager executable (z88dk-appmake)
    #[arg(long, value_name = "PATH")]
    pub packager: Option<PathBuf>,

    /// Packager disk format identifier
    #[arg(long, value_name = "ID")]
    pub format: Option<String>,

    /// Directory for per-build logs
    #[arg(long, value_name = "DIR")]
    pub logs_dir: Option<PathBuf>,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Emulator executable (mame)
    #[arg(long, value_name = "PATH")]
    pub emulator: Option<PathBuf>,

    /// Boot disk placed in drive 1
    #[arg(long, value_name = "PATH")]
    pub system_disk: Option<PathBuf>,

    /// Emulator ROM directory
    #[arg(long, value_name = "DIR")]
    pub rom_path: Option<PathBuf>,

    /// Emulated machine driver
    #[arg(long, value_name = "ID")]
    pub machine: Option<String>,

    /// Run windowed
    #[arg(long, overrides_with = "no_window")]
    pub window: bool,

    /// Run full screen
    #[arg(long, overrides_with = "window")]
    pub no_window: bool,

    /// Use software video rendering
    #[arg(long, overrides_with = "no_soft_video")]
    pub soft_video: bool,

    /// Use the default video backend
    #[arg(long, overrides_with = "soft_video")]
    pub no_soft_video: bool,

    /// Start with the emulator UI active
    #[arg(long, overrides_with = "no_ui_active")]
    pub ui_active: bool,

    /// Start with emulated keyboard input active
    #[arg(long, overrides_with = "ui_active")]
    pub no_ui_active: bool,

    /// Skip the machine info screen
    #[arg(long, overrides_with = "no_skip_intro")]
    pub skip_intro: bool,

    /// Show the machine info screen
    #[arg(long, overrides_with = "skip_intro")]
    pub no_skip_intro: bool,

    /// Window resolution as WxH
    #[arg(long, value_name = "WxH")]
    pub resolution: Option<String>,

    /// Fail instead of building when the disk image is missing
    #[arg(long)]
    pub no_build: bool,
}

impl RunArgs {
    /// Windowed override, if either flag was given.
    pub fn windowed(&self) -> Option<bool> {
        toggle(self.window, self.no_window)
    }

    pub fn software_video(&self) -> Option<bool> {
        toggle(self.soft_video, self.no_soft_video)
    }

    pub fn ui_active(&self) -> Option<bool> {
        toggle(self.ui_active, self.no_ui_active)
    }

    pub fn skip_intro(&self) -> Option<bool> {
        toggle(self.skip_intro, self.no_skip_intro)
    }
}

/// Resolve a `--flag`/`--no-flag` pair; clap keeps only the last one given.
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Directory the canonical artifact belongs in
    #[arg(long, value_name = "DIR")]
    pub workdir: PathBuf,

    /// Secondary directory to scan (usually the source directory)
    #[arg(long, value_name = "DIR")]
    pub source_dir: PathBuf,

    /// Base identifier, e.g. HELLO
    #[arg(long, value_name = "NAME")]
    pub base: String,

    /// Artifact kind: com or dsk
    #[arg(long, value_name = "KIND", default_value = "com")]
    pub kind: String,

    /// Delete every candidate instead of collapsing them
    #[arg(long)]
    pub purge: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    pub init: bool,

    /// Print only the config file path
    #[arg(long, conflicts_with = "init")]
    pub path: bool,
}
