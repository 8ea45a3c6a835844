use super::*;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    src_dir: PathBuf,
    work_dir: PathBuf,
    logs_dir: PathBuf,
    tools_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("temp root");
        let src_dir = root.path().join("src");
        let work_dir = root.path().join("work");
        let logs_dir = root.path().join("logs");
        let tools_dir = root.path().join("tools");
        fs::create_dir_all(&src_dir).expect("create src");
        fs::create_dir_all(&tools_dir).expect("create tools");
        Self {
            _root: root,
            src_dir,
            work_dir,
            logs_dir,
            tools_dir,
        }
    }

    fn source(&self) -> PathBuf {
        let path = self.src_dir.join("HELLO.asm");
        fs::write(&path, "\torg 100h\n\tret\n").expect("write source");
        path
    }

    fn tool(&self, name: &str, body: &str) -> PathBuf {
        let path = self.tools_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod tool");
        path
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.tools_dir.join(name)
    }

    fn request(&self, source: PathBuf, assembler: PathBuf, packager: PathBuf) -> BuildRequest {
        BuildRequest {
            source,
            working_dir: self.work_dir.clone(),
            assembler,
            packager,
            disk_format: None,
            logs_dir: self.logs_dir.clone(),
            extra_env: Vec::new(),
        }
    }

    fn log_text(&self) -> String {
        fs::read_to_string(self.logs_dir.join("HELLO_build.log")).expect("read log")
    }
}

/// Assembler that writes a lowercase `hello.com` next to the source.
const ASSEMBLE_INTO_SOURCE_DIR: &str =
    "echo \"assembling $3\"\nprintf 'COM' > \"$(dirname \"$3\")/hello.com\"";
/// Packager that writes `HELLO.dsk` into its working directory.
const PACKAGE_INTO_CWD: &str = "test \"$5\" = HELLO.COM || exit 9\nprintf 'DSK' > HELLO.dsk";

fn command_lines(log: &str) -> Vec<&str> {
    log.lines().filter(|line| line.starts_with("$ ")).collect()
}

#[test]
fn assembles_and_packages_into_working_dir() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", PACKAGE_INTO_CWD);

    let report = run_build(&fx.request(source, assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::Succeeded {
            binary: fx.work_dir.join("HELLO.COM"),
            image: fx.work_dir.join("HELLO.dsk"),
        }
    );
    assert!(!fx.src_dir.join("hello.com").exists());
    assert_eq!(
        report.states,
        vec![
            BuildState::Idle,
            BuildState::Validating,
            BuildState::Assembling,
            BuildState::ReconcilingBinary,
            BuildState::Packaging,
            BuildState::ReconcilingAfterPackaging,
            BuildState::Done,
        ]
    );
    let log = fx.log_text();
    assert_eq!(command_lines(&log).len(), 2);
    assert!(log.contains("-oHELLO.COM"));
    assert!(log.contains("+cpmdisk -f einstein -b HELLO.COM -o HELLO.DSK"));
    assert!(log.trim_end().ends_with("Build OK: HELLO.COM + HELLO.dsk"));
    assert_eq!(report.log_path, Some(fx.logs_dir.join("HELLO_build.log")));
}

#[test]
fn assembler_failure_stops_before_packaging() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", "echo 'syntax error line 2'\nexit 2");
    let ran = fx.marker("packager-ran");
    let packager = fx.tool("appmake", &format!("touch '{}'", ran.display()));

    let report = run_build(&fx.request(source, assembler.clone(), packager.clone()));

    let BuildOutcome::FailedAssembly(failure) = &report.outcome else {
        panic!("expected assembly failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.exit_code, 2);
    assert_eq!(failure.kind, FailureKind::ToolExitedNonZero);
    assert_eq!(failure.diagnostic, "syntax error line 2");
    assert!(!ran.exists());
    let log = fx.log_text();
    let commands = command_lines(&log);
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains(&assembler.display().to_string()));
    assert!(!log.contains(&packager.display().to_string()));
    assert_eq!(report.states.last(), Some(&BuildState::Done));
    assert!(!report.states.contains(&BuildState::Packaging));
}

#[test]
fn silent_failure_gets_synthesized_diagnostic() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", "exit 4");
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(source, assembler, packager));

    let BuildOutcome::FailedAssembly(failure) = &report.outcome else {
        panic!("expected assembly failure, got {:?}", report.outcome);
    };
    assert!(failure.diagnostic.contains("exited with code 4"));
    assert!(failure.diagnostic.contains("HELLO_build.log"));
}

#[test]
fn missing_binary_after_clean_exit_skips_packager() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", "echo 'nothing to do'");
    let ran = fx.marker("packager-ran");
    let packager = fx.tool("appmake", &format!("touch '{}'", ran.display()));

    let report = run_build(&fx.request(source, assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::FailedMissingArtifact {
            expected: fx.work_dir.join("HELLO.COM"),
        }
    );
    assert_eq!(
        report.outcome.failure_kind(),
        Some(FailureKind::ArtifactNotProduced)
    );
    assert!(!ran.exists());
}

#[test]
fn stale_binary_is_purged_before_assembling() {
    let fx = Fixture::new();
    let source = fx.source();
    fs::create_dir_all(&fx.work_dir).expect("create work");
    fs::write(fx.work_dir.join("HELLO.COM"), "stale").expect("write stale");
    fs::write(fx.src_dir.join("Hello.com"), "stale").expect("write stale");
    let assembler = fx.tool("z80asm", "exit 0");
    let packager = fx.tool("appmake", PACKAGE_INTO_CWD);

    let report = run_build(&fx.request(source, assembler, packager));

    assert!(matches!(
        report.outcome,
        BuildOutcome::FailedMissingArtifact { .. }
    ));
    assert!(!fx.work_dir.join("HELLO.COM").exists());
    assert!(!fx.src_dir.join("Hello.com").exists());
}

#[test]
fn missing_source_short_circuits_with_header_only_log() {
    let fx = Fixture::new();
    let ran = fx.marker("assembler-ran");
    let assembler = fx.tool("z80asm", &format!("touch '{}'", ran.display()));
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(fx.src_dir.join("HELLO.asm"), assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::FailedSourceNotFound {
            source: fx.src_dir.join("HELLO.asm"),
        }
    );
    assert_eq!(
        report.outcome.failure_kind(),
        Some(FailureKind::SourceNotFound)
    );
    assert!(!ran.exists());
    let log = fx.log_text();
    assert_eq!(log.lines().count(), 1);
    assert!(command_lines(&log).is_empty());
    assert_eq!(
        report.states,
        vec![BuildState::Idle, BuildState::Validating, BuildState::Done]
    );
}

#[test]
fn packager_failure_reports_its_output() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", "echo 'unknown disk format' >&2\nexit 1");

    let report = run_build(&fx.request(source, assembler, packager));

    let BuildOutcome::FailedPackaging(failure) = &report.outcome else {
        panic!("expected packaging failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.diagnostic, "unknown disk format");
    assert!(fx.work_dir.join("HELLO.COM").is_file());
}

#[test]
fn unstartable_assembler_is_a_launch_failure() {
    let fx = Fixture::new();
    let source = fx.source();
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(source, fx.tools_dir.join("absent"), packager));

    let BuildOutcome::FailedAssembly(failure) = &report.outcome else {
        panic!("expected assembly failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.kind, FailureKind::ToolLaunchFailed);
    assert_eq!(failure.exit_code, 1);
    assert!(failure.diagnostic.starts_with("failed to start"));
}

#[test]
fn blank_disk_format_uses_default() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", "test \"$3\" = einstein || exit 7\nprintf 'DSK' > HELLO.DSK");
    let mut request = fx.request(source, assembler, packager);
    request.disk_format = Some("   ".to_string());

    let report = run_build(&request);

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
}

#[test]
fn duplicate_binary_from_packager_is_collapsed() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", "printf 'COPY' > hello.com\nprintf 'DSK' > HELLO.DSK");

    let report = run_build(&fx.request(source, assembler, packager));

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert!(!fx.work_dir.join("hello.com").exists());
    let kept = fs::read_to_string(fx.work_dir.join("HELLO.COM")).expect("read binary");
    assert_eq!(kept, "COM");
}

#[test]
fn missing_disk_image_is_reported() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(source, assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::FailedMissingArtifact {
            expected: fx.work_dir.join("HELLO.DSK"),
        }
    );
}

#[test]
fn extra_env_reaches_both_tools() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool(
        "z80asm",
        &format!("test \"$ZCCCFG\" = /opt/z88dk/lib/config || exit 5\n{ASSEMBLE_INTO_SOURCE_DIR}"),
    );
    let packager = fx.tool(
        "appmake",
        &format!("test \"$ZCCCFG\" = /opt/z88dk/lib/config || exit 5\n{PACKAGE_INTO_CWD}"),
    );
    let mut request = fx.request(source, assembler, packager);
    request.extra_env = vec![("ZCCCFG".to_string(), "/opt/z88dk/lib/config".to_string())];

    let report = run_build(&request);

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
}

#[test]
fn observer_sees_every_state_after_idle() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", "exit 3");
    let packager = fx.tool("appmake", "exit 0");
    let mut seen = Vec::new();

    let report = run_build_observed(&fx.request(source, assembler, packager), &mut |state| {
        seen.push(state)
    });

    assert_eq!(seen, report.states[1..].to_vec());
}

#[test]
fn unwritable_log_location_is_an_unexpected_error() {
    let fx = Fixture::new();
    let source = fx.source();
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", PACKAGE_INTO_CWD);
    let blocker = fx.tools_dir.join("not-a-dir");
    fs::write(&blocker, "file").expect("write blocker");
    let mut request = fx.request(source, assembler, packager);
    request.logs_dir = blocker.join("logs");

    let report = run_build(&request);

    let BuildOutcome::FailedUnexpectedError { classification, .. } = &report.outcome else {
        panic!("expected unexpected error, got {:?}", report.outcome);
    };
    assert!(classification.starts_with("io::"));
    assert_eq!(report.log_path, None);
}

#[test]
fn stale_image_is_not_reported_as_fresh_output() {
    let fx = Fixture::new();
    let source = fx.source();
    fs::create_dir_all(&fx.work_dir).expect("create work");
    fs::write(fx.work_dir.join("HELLO.DSK"), "last week's image").expect("write stale image");
    fs::write(fx.work_dir.join("hello.dsk"), "older still").expect("write stale image");
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(source, assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::FailedMissingArtifact {
            expected: fx.work_dir.join("HELLO.DSK"),
        }
    );
    assert!(!fx.work_dir.join("HELLO.DSK").exists());
    assert!(!fx.work_dir.join("hello.dsk").exists());
}

#[test]
fn rebuild_replaces_previous_image() {
    let fx = Fixture::new();
    let source = fx.source();
    fs::create_dir_all(&fx.work_dir).expect("create work");
    fs::write(fx.work_dir.join("HELLO.DSK"), "old").expect("write old image");
    let assembler = fx.tool("z80asm", ASSEMBLE_INTO_SOURCE_DIR);
    let packager = fx.tool("appmake", PACKAGE_INTO_CWD);

    let report = run_build(&fx.request(source, assembler, packager));

    assert_eq!(
        report.outcome,
        BuildOutcome::Succeeded {
            binary: fx.work_dir.join("HELLO.COM"),
            image: fx.work_dir.join("HELLO.dsk"),
        }
    );
    assert!(!fx.work_dir.join("HELLO.DSK").exists());
}

#[test]
fn held_working_directory_rejects_the_build() {
    let fx = Fixture::new();
    let source = fx.source();
    fs::create_dir_all(&fx.work_dir).expect("create work");
    fs::write(fx.work_dir.join("HELLO.COM"), "in progress").expect("write binary");
    let ran = fx.marker("assembler-ran");
    let assembler = fx.tool("z80asm", &format!("touch '{}'", ran.display()));
    let packager = fx.tool("appmake", "exit 0");
    let held = WorkdirLock::try_acquire(&fx.work_dir)
        .expect("lock work dir")
        .expect("lock is free");

    let report = run_build(&fx.request(source.clone(), assembler.clone(), packager.clone()));

    assert_eq!(
        report.outcome,
        BuildOutcome::FailedWorkingDirBusy {
            working_dir: fx.work_dir.clone(),
        }
    );
    assert_eq!(
        report.outcome.failure_kind(),
        Some(FailureKind::WorkingDirectoryBusy)
    );
    assert!(!ran.exists());
    assert!(fx.work_dir.join("HELLO.COM").is_file());
    assert!(fx.log_text().contains("in use by another build"));

    drop(held);
    let report = run_build(&fx.request(source, assembler, packager));
    assert!(ran.exists());
    assert!(!matches!(
        report.outcome,
        BuildOutcome::FailedWorkingDirBusy { .. }
    ));
}

#[test]
fn missing_source_with_non_utf8_name_is_not_found() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let fx = Fixture::new();
    let source = fx.src_dir.join(OsStr::from_bytes(b"\xffhello.asm"));
    let assembler = fx.tool("z80asm", "exit 0");
    let packager = fx.tool("appmake", "exit 0");

    let report = run_build(&fx.request(source.clone(), assembler, packager));

    assert_eq!(report.outcome, BuildOutcome::FailedSourceNotFound { source });
    assert_eq!(report.log_path, None);
}
