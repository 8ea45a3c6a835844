//! Assemble-then-package orchestration for one source file.
//!
//! A build walks a fixed sequence of states and ends in exactly one outcome.
//! Tool failures and missing artifacts are outcomes, not errors; anything else
//! that goes wrong is caught here and reported as an unexpected failure.
use crate::config::DEFAULT_DISK_FORMAT;
use crate::lock::WorkdirLock;
use crate::paths::{normalize_path, BuildPaths};
use crate::process::{run_logged, BuildLog, ProcessOutput};
use crate::reconcile::{locate, purge, reconcile, ArtifactKind, Disposition};
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Everything a build needs, fixed at submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub source: PathBuf,
    pub working_dir: PathBuf,
    pub assembler: PathBuf,
    pub packager: PathBuf,
    /// Packager disk format; blank or absent uses the default.
    pub disk_format: Option<String>,
    pub logs_dir: PathBuf,
    /// Extra environment for both tool invocations.
    pub extra_env: Vec<(String, String)>,
}

/// States of one build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Validating,
    Assembling,
    ReconcilingBinary,
    Packaging,
    ReconcilingAfterPackaging,
    Done,
}

impl BuildState {
    /// Short progress label for status displays.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Validating => "Checking source...",
            Self::Assembling => "Assembling...",
            Self::ReconcilingBinary | Self::ReconcilingAfterPackaging => "Tidying outputs...",
            Self::Packaging => "Packaging disk image...",
            Self::Done => "Done",
        }
    }
}

/// Failure taxonomy shared by the build and the emulator launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SourceNotFound,
    ToolLaunchFailed,
    ToolExitedNonZero,
    ArtifactNotProduced,
    EmulatorSystemDiskMissing,
    WorkingDirectoryBusy,
    UnclassifiedFault,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceNotFound => write!(f, "source_not_found"),
            Self::ToolLaunchFailed => write!(f, "tool_launch_failed"),
            Self::ToolExitedNonZero => write!(f, "tool_exited_non_zero"),
            Self::ArtifactNotProduced => write!(f, "artifact_not_produced"),
            Self::EmulatorSystemDiskMissing => write!(f, "emulator_system_disk_missing"),
            Self::WorkingDirectoryBusy => write!(f, "working_directory_busy"),
            Self::UnclassifiedFault => write!(f, "unclassified_fault"),
        }
    }
}

/// Why an external tool stage failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub exit_code: i32,
    pub diagnostic: String,
}

impl StageFailure {
    /// Build from a tool result, synthesizing a message when the tool was silent.
    pub fn from_output(tool: &str, output: &ProcessOutput, log_path: &Path) -> Self {
        let kind = if output.launched {
            FailureKind::ToolExitedNonZero
        } else {
            FailureKind::ToolLaunchFailed
        };
        let diagnostic = if output.captured.trim().is_empty() {
            format!(
                "{tool} exited with code {}; see {}",
                output.exit_code,
                log_path.display()
            )
        } else {
            output.captured.trim_end().to_string()
        };
        Self {
            kind,
            exit_code: output.exit_code,
            diagnostic,
        }
    }
}

/// Terminal result of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded { binary: PathBuf, image: PathBuf },
    FailedSourceNotFound { source: PathBuf },
    /// Another build holds the working directory lock.
    FailedWorkingDirBusy { working_dir: PathBuf },
    FailedAssembly(StageFailure),
    FailedMissingArtifact { expected: PathBuf },
    FailedPackaging(StageFailure),
    FailedUnexpectedError { classification: String, message: String },
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Succeeded { .. } => None,
            Self::FailedSourceNotFound { .. } => Some(FailureKind::SourceNotFound),
            Self::FailedWorkingDirBusy { .. } => Some(FailureKind::WorkingDirectoryBusy),
            Self::FailedAssembly(failure) | Self::FailedPackaging(failure) => Some(failure.kind),
            Self::FailedMissingArtifact { .. } => Some(FailureKind::ArtifactNotProduced),
            Self::FailedUnexpectedError { .. } => Some(FailureKind::UnclassifiedFault),
        }
    }

    /// One-line status for display.
    pub fn status_line(&self) -> String {
        match self {
            Self::Succeeded { image, .. } => format!("Build OK: {}", file_name(image)),
            Self::FailedSourceNotFound { .. } => "Error: source .asm not found.".to_string(),
            Self::FailedWorkingDirBusy { .. } => {
                "Error: another build is using the working directory.".to_string()
            }
            Self::FailedAssembly(failure) => {
                format!("Build failed: assembler exited with code {}", failure.exit_code)
            }
            Self::FailedMissingArtifact { expected } => {
                format!("Error: {} not produced.", file_name(expected))
            }
            Self::FailedPackaging(failure) => {
                format!("Build failed: packager exited with code {}", failure.exit_code)
            }
            Self::FailedUnexpectedError { message, .. } => format!("Build failed: {message}"),
        }
    }

    /// Full diagnostic text, when there is more to say than the status line.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Succeeded { binary, image } => Some(format!(
                "binary: {}\nimage: {}",
                binary.display(),
                image.display()
            )),
            Self::FailedSourceNotFound { source } => Some(source.display().to_string()),
            Self::FailedWorkingDirBusy { working_dir } => Some(working_dir.display().to_string()),
            Self::FailedAssembly(failure) | Self::FailedPackaging(failure) => {
                Some(failure.diagnostic.clone())
            }
            Self::FailedMissingArtifact { expected } => {
                Some(format!("expected {}", expected.display()))
            }
            Self::FailedUnexpectedError { classification, .. } => {
                Some(format!("classification: {classification}"))
            }
        }
    }
}

/// Outcome plus the trail of states and the log written along the way.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub log_path: Option<PathBuf>,
    pub states: Vec<BuildState>,
}

/// Run one build without progress reporting.
pub fn run_build(request: &BuildRequest) -> BuildReport {
    run_build_observed(request, &mut |_| {})
}

/// Run one build, reporting each state entered to `observer`.
pub fn run_build_observed(
    request: &BuildRequest,
    observer: &mut dyn FnMut(BuildState),
) -> BuildReport {
    let mut tracker = StateTracker {
        states: vec![BuildState::Idle],
        observer,
    };
    let mut log = None;

    let outcome = match execute(request, &mut tracker, &mut log) {
        Ok(outcome) => outcome,
        Err(err) => {
            let classification = classify_error(&err);
            let message = format!("{err:#}");
            if let Some(log) = log.as_mut() {
                log.line_best_effort(&format!("error: [{classification}] {message}"));
            }
            BuildOutcome::FailedUnexpectedError {
                classification,
                message,
            }
        }
    };
    tracker.enter(BuildState::Done);

    if outcome.is_success() {
        tracing::info!(status = %outcome.status_line(), "build finished");
    } else {
        tracing::warn!(
            kind = %outcome.failure_kind().unwrap_or(FailureKind::UnclassifiedFault),
            status = %outcome.status_line(),
            "build failed"
        );
    }

    BuildReport {
        outcome,
        log_path: log.map(|log| log.path().to_path_buf()),
        states: tracker.states,
    }
}

/// `{assembler} -v -b {source} -o{output}`
pub fn assembler_argv(assembler: &Path, source: &Path, output_name: &str) -> Vec<String> {
    vec![
        assembler.display().to_string(),
        "-v".to_string(),
        "-b".to_string(),
        source.display().to_string(),
        format!("-o{output_name}"),
    ]
}

/// `{packager} +cpmdisk -f {format} -b {binary} -o {image}`
pub fn packager_argv(
    packager: &Path,
    format: &str,
    binary_name: &str,
    image_name: &str,
) -> Vec<String> {
    vec![
        packager.display().to_string(),
        "+cpmdisk".to_string(),
        "-f".to_string(),
        format.to_string(),
        "-b".to_string(),
        binary_name.to_string(),
        "-o".to_string(),
        image_name.to_string(),
    ]
}

struct StateTracker<'a> {
    states: Vec<BuildState>,
    observer: &'a mut dyn FnMut(BuildState),
}

impl StateTracker<'_> {
    fn enter(&mut self, state: BuildState) {
        tracing::info!(state = ?state, "build state");
        self.states.push(state);
        (self.observer)(state);
    }
}

fn execute(
    request: &BuildRequest,
    tracker: &mut StateTracker<'_>,
    log_slot: &mut Option<BuildLog>,
) -> Result<BuildOutcome> {
    tracker.enter(BuildState::Validating);
    let source = normalize_path(&request.source)?;
    if !source.is_file() {
        // Header only: nothing ran for this attempt. A source whose name
        // yields no base identifier has no log to write to.
        if let Ok(paths) = BuildPaths::new(&source, &request.working_dir, &request.logs_dir) {
            *log_slot = Some(BuildLog::open(&paths.log_path())?);
        }
        return Ok(BuildOutcome::FailedSourceNotFound { source });
    }
    let paths = BuildPaths::new(&source, &request.working_dir, &request.logs_dir)?;

    let working_dir = paths.working_dir();
    let source_dir = paths.source_dir();
    let base = paths.base();
    fs::create_dir_all(working_dir)
        .with_context(|| format!("create working directory {}", working_dir.display()))?;
    let log = log_slot.insert(BuildLog::open(&paths.log_path())?);
    let Some(_lock) = WorkdirLock::try_acquire(working_dir)? else {
        log.line(&format!(
            "error: {} is in use by another build",
            working_dir.display()
        ))?;
        return Ok(BuildOutcome::FailedWorkingDirBusy {
            working_dir: working_dir.to_path_buf(),
        });
    };
    log.line(&format!("Building {}", paths.source().display()))?;

    tracker.enter(BuildState::Assembling);
    for action in purge(working_dir, source_dir, base, ArtifactKind::Binary) {
        tracing::debug!(action = %action, "purged stale output");
        if matches!(action.disposition, Disposition::Failed { .. }) {
            log.line(&format!("warning: {action}"))?;
        }
    }
    let binary_name = paths.artifact_name(ArtifactKind::Binary);
    let assembled = run_logged(
        log,
        &assembler_argv(&request.assembler, paths.source(), &binary_name),
        working_dir,
        &request.extra_env,
    );
    if !assembled.success() {
        let failure = StageFailure::from_output("assembler", &assembled, log.path());
        log.line(&format!(
            "error: assembler exited with code {}",
            assembled.exit_code
        ))?;
        return Ok(BuildOutcome::FailedAssembly(failure));
    }

    tracker.enter(BuildState::ReconcilingBinary);
    let report = reconcile(working_dir, source_dir, base, ArtifactKind::Binary);
    for action in report.failures() {
        log.line(&format!("warning: {action}"))?;
    }
    if !report.artifact_present() {
        log.line(&format!("error: {binary_name} not produced"))?;
        return Ok(BuildOutcome::FailedMissingArtifact {
            expected: report.canonical,
        });
    }

    tracker.enter(BuildState::Packaging);
    // A leftover image would otherwise pass for this run's output.
    for action in purge(working_dir, working_dir, base, ArtifactKind::DiskImage) {
        tracing::debug!(action = %action, "purged stale image");
        if matches!(action.disposition, Disposition::Failed { .. }) {
            log.line(&format!("warning: {action}"))?;
        }
    }
    let format = request
        .disk_format
        .as_deref()
        .map(str::trim)
        .filter(|format| !format.is_empty())
        .unwrap_or(DEFAULT_DISK_FORMAT);
    let image_name = paths.artifact_name(ArtifactKind::DiskImage);
    let packaged = run_logged(
        log,
        &packager_argv(&request.packager, format, &binary_name, &image_name),
        working_dir,
        &request.extra_env,
    );
    if !packaged.success() {
        let failure = StageFailure::from_output("packager", &packaged, log.path());
        log.line(&format!(
            "error: packager exited with code {}",
            packaged.exit_code
        ))?;
        return Ok(BuildOutcome::FailedPackaging(failure));
    }

    tracker.enter(BuildState::ReconcilingAfterPackaging);
    let report = reconcile(working_dir, source_dir, base, ArtifactKind::Binary);
    for action in report.failures() {
        log.line(&format!("warning: {action}"))?;
    }
    if !report.artifact_present() {
        log.line(&format!("error: {binary_name} missing after packaging"))?;
        return Ok(BuildOutcome::FailedMissingArtifact {
            expected: report.canonical,
        });
    }
    let Some(image) = locate(working_dir, base, ArtifactKind::DiskImage) else {
        log.line(&format!("error: {image_name} not produced"))?;
        return Ok(BuildOutcome::FailedMissingArtifact {
            expected: paths.image_path(),
        });
    };

    log.line(&format!(
        "Build OK: {} + {}",
        file_name(&report.canonical),
        file_name(&image)
    ))?;
    Ok(BuildOutcome::Succeeded {
        binary: report.canonical,
        image,
    })
}

fn classify_error(err: &anyhow::Error) -> String {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<io::Error>())
        .map(|io_err| format!("io::{:?}", io_err.kind()))
        .unwrap_or_else(|| "error".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(all(test, unix))]
#[path = "pipeline_tests.rs"]
mod tests;
