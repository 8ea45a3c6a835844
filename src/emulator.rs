//! Emulator launch against a packaged disk image.
//!
//! The adapter only checks its inputs, assembles the flag list and runs the
//! emulator once through the logged process runner. A missing disk image may
//! trigger one build first.
use crate::pipeline::{run_build, BuildOutcome, BuildRequest, FailureKind, StageFailure};
use crate::process::{run_logged, BuildLog, ProcessOutput};
use crate::reconcile::{locate, ArtifactKind};
use crate::toolchain::runtime_dir_env;
use anyhow::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+x\d+$").expect("regex for WxH resolution"));

/// Presentation flags, each either passed or omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmulatorFlags {
    pub windowed: bool,
    pub software_video: bool,
    pub ui_active: bool,
    pub skip_intro: bool,
    /// `WxH`; anything else is dropped.
    pub resolution: Option<String>,
}

/// Inputs for one emulator session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub emulator: PathBuf,
    pub disk_image: PathBuf,
    pub system_disk: PathBuf,
    pub rom_path: PathBuf,
    pub machine: String,
    pub flags: EmulatorFlags,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Result of a launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(ProcessOutput),
    FailedSystemDiskMissing { path: PathBuf },
    FailedImageMissing { expected: PathBuf },
    /// The fallback build ran and did not succeed.
    FailedBuild(BuildOutcome),
    FailedEmulator(StageFailure),
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Exited(_) => None,
            Self::FailedSystemDiskMissing { .. } => Some(FailureKind::EmulatorSystemDiskMissing),
            Self::FailedImageMissing { .. } => Some(FailureKind::ArtifactNotProduced),
            Self::FailedBuild(outcome) => outcome.failure_kind(),
            Self::FailedEmulator(failure) => Some(failure.kind),
        }
    }

    pub fn status_line(&self) -> String {
        match self {
            Self::Exited(_) => "Emulator exited normally.".to_string(),
            Self::FailedSystemDiskMissing { path } => {
                format!("Error: system disk not found: {}", path.display())
            }
            Self::FailedImageMissing { .. } => "Error: disk image missing. Build first.".to_string(),
            Self::FailedBuild(outcome) => outcome.status_line(),
            Self::FailedEmulator(failure) => {
                format!("Run failed: emulator exited with code {}", failure.exit_code)
            }
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Exited(output) => {
                let text = output.captured.trim_end();
                (!text.is_empty()).then(|| text.to_string())
            }
            Self::FailedSystemDiskMissing { .. } => None,
            Self::FailedImageMissing { expected } => {
                Some(format!("expected {}", expected.display()))
            }
            Self::FailedBuild(outcome) => outcome.detail(),
            Self::FailedEmulator(failure) => Some(failure.diagnostic.clone()),
        }
    }
}

/// `{emulator} [flags] -rompath {roms} {machine} -flop1 {system} -flop2 {image}`
pub fn emulator_argv(request: &LaunchRequest, image: &Path) -> Vec<String> {
    let flags = &request.flags;
    let mut argv = vec![request.emulator.display().to_string()];
    if flags.software_video {
        argv.extend(["-video".to_string(), "soft".to_string()]);
    }
    argv.push(if flags.windowed { "-window" } else { "-nowindow" }.to_string());
    if flags.ui_active {
        argv.push("-ui_active".to_string());
    }
    if flags.skip_intro {
        argv.push("-skip_gameinfo".to_string());
    }
    if let Some(resolution) = flags.resolution.as_deref().map(str::trim) {
        if RESOLUTION.is_match(resolution) {
            argv.extend(["-resolution".to_string(), resolution.to_string()]);
        } else if !resolution.is_empty() {
            tracing::warn!(resolution, "ignoring resolution that is not WxH");
        }
    }
    argv.extend([
        "-rompath".to_string(),
        request.rom_path.display().to_string(),
        request.machine.clone(),
        "-flop1".to_string(),
        request.system_disk.display().to_string(),
        "-flop2".to_string(),
        image.display().to_string(),
    ]);
    argv
}

/// Launch the emulator, building once first when the image is missing and a
/// build request is supplied.
pub fn launch(
    request: &LaunchRequest,
    fallback_build: Option<&BuildRequest>,
) -> Result<LaunchOutcome> {
    if !request.system_disk.is_file() {
        return Ok(LaunchOutcome::FailedSystemDiskMissing {
            path: request.system_disk.clone(),
        });
    }

    let image = match find_image(&request.disk_image) {
        Some(image) => image,
        None => {
            let Some(build) = fallback_build else {
                return Ok(LaunchOutcome::FailedImageMissing {
                    expected: request.disk_image.clone(),
                });
            };
            tracing::info!(image = %request.disk_image.display(), "disk image missing; building first");
            match run_build(build).outcome {
                BuildOutcome::Succeeded { image, .. } => image,
                outcome => return Ok(LaunchOutcome::FailedBuild(outcome)),
            }
        }
    };

    let mut log = BuildLog::open(&request.log_path)?;
    let argv = emulator_argv(request, &image);
    let output = run_logged(&mut log, &argv, &request.working_dir, &runtime_dir_env());
    if output.success() {
        log.line("Emulator exited normally.")?;
        return Ok(LaunchOutcome::Exited(output));
    }
    Ok(LaunchOutcome::FailedEmulator(StageFailure::from_output(
        "emulator",
        &output,
        log.path(),
    )))
}

fn find_image(expected: &Path) -> Option<PathBuf> {
    if expected.is_file() {
        return Some(expected.to_path_buf());
    }
    let dir = expected.parent()?;
    let base = expected.file_stem()?.to_str()?;
    locate(dir, base, ArtifactKind::DiskImage)
}
