//! Subprocess execution with a streaming, append-only build log.
//!
//! Every invoked command is recorded as a `$ ...` line and its merged
//! stdout/stderr is written to the log line by line as it arrives, so the log
//! reflects progress even if the tool or this process dies mid-run.
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Application label written into each session header.
pub const LOG_HEADER_LABEL: &str = concat!("asmtodsk v", env!("CARGO_PKG_VERSION"));

/// Append-only log for one base identifier.
#[derive(Debug)]
pub struct BuildLog {
    path: PathBuf,
    file: File,
}

impl BuildLog {
    /// Open (or create) the log and write the session header line.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open build log {}", path.display()))?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
        };
        let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
        log.line(&format!("[{stamp}] {LOG_HEADER_LABEL}"))?;
        Ok(log)
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, adding the newline if missing.
    pub fn line(&mut self, text: &str) -> Result<()> {
        self.write_raw(text)?;
        if !text.ends_with('\n') {
            self.write_raw("\n")?;
        }
        self.file.flush().context("flush build log")?;
        Ok(())
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .with_context(|| format!("write build log {}", self.path.display()))
    }

    /// Append a line, reporting write failures through tracing only.
    pub(crate) fn line_best_effort(&mut self, text: &str) {
        if let Err(err) = self.line(text) {
            tracing::warn!(log = %self.path.display(), error = %format!("{err:#}"), "build log write failed");
        }
    }
}

/// Exit code and merged output of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub captured: String,
    /// False when the program could not be started at all.
    pub launched: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `argv` in `cwd`, streaming merged output into the log.
///
/// Never fails: a non-zero exit is returned as-is and a tool that cannot be
/// started at all reports exit code 1 with a diagnostic in `captured`.
pub fn run_logged(
    log: &mut BuildLog,
    argv: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> ProcessOutput {
    log.line_best_effort(&format!("$ {}", shell_words::join(argv)));

    let Some((program, args)) = argv.split_first() else {
        return launch_failure(log, "<empty>", "no command given");
    };

    match spawn_and_stream(log, program, args, cwd, env) {
        Ok(output) => {
            tracing::info!(
                program = %program,
                exit_code = output.exit_code,
                captured_bytes = output.captured.len(),
                "tool invocation complete"
            );
            output
        }
        Err(err) => launch_failure(log, program, &err.to_string()),
    }
}

fn spawn_and_stream(
    log: &mut BuildLog,
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> io::Result<ProcessOutput> {
    // stdout and stderr share one pipe so ordering is whatever the tool wrote.
    let (reader, writer) = io::pipe()?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn()?;
    // Drop the parent's copies of the write end so EOF arrives on exit.
    drop(cmd);

    // The read end is consumed and closed here, so a child still writing
    // after a read error gets EPIPE instead of blocking the wait below.
    let captured = stream_into_log(BufReader::new(reader), log, program);

    let status = child.wait()?;
    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        captured,
        launched: true,
    })
}

/// Copy lines from `reader` into the log until EOF or a read error.
fn stream_into_log<R: BufRead>(mut reader: R, log: &mut BuildLog, program: &str) -> String {
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(program, error = %err, "output stream read failed");
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        captured.push_str(&text);
        log.line_best_effort(&text);
    }
    captured
}

fn launch_failure(log: &mut BuildLog, program: &str, reason: &str) -> ProcessOutput {
    let message = format!("failed to start {program}: {reason}");
    tracing::warn!(program, reason, "tool launch failed");
    log.line_best_effort(&message);
    ProcessOutput {
        exit_code: 1,
        captured: message,
        launched: false,
    }
}
