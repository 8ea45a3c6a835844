//! Artifact reconciliation across the working and source directories.
//!
//! Toolchains disagree about where they write outputs and in which letter case.
//! After each stage exactly one artifact should survive, at the canonical
//! uppercase name inside the working directory. Filesystem failures are kept
//! per candidate so a single locked file does not abort the pass.
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Stage artifacts produced by the toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// CP/M executable emitted by the assembler.
    Binary,
    /// Disk image emitted by the packager.
    DiskImage,
}

impl ArtifactKind {
    /// Canonical (uppercase) extension for the artifact.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Binary => "COM",
            Self::DiskImage => "DSK",
        }
    }

    /// Canonical file name for a base identifier.
    pub fn canonical_name(self, base: &str) -> String {
        format!("{}.{}", base.to_uppercase(), self.extension())
    }

    fn matches(self, file_name: &str, base: &str) -> bool {
        file_name.to_lowercase() == self.canonical_name(base).to_lowercase()
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "com" | "binary" => Ok(Self::Binary),
            "dsk" | "image" => Ok(Self::DiskImage),
            other => Err(anyhow::anyhow!("unknown artifact kind {other:?}")),
        }
    }
}

/// What happened to one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Already at the canonical path and left in place.
    Kept,
    /// Moved to the canonical path.
    Relocated { to: PathBuf },
    /// Removed as a duplicate.
    Deleted,
    /// The move or delete failed; the file may still exist.
    Failed { reason: String },
}

/// Per-candidate entry in a reconciliation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAction {
    pub path: PathBuf,
    pub disposition: Disposition,
}

impl fmt::Display for CandidateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.disposition {
            Disposition::Kept => write!(f, "kept {}", self.path.display()),
            Disposition::Relocated { to } => {
                write!(f, "moved {} -> {}", self.path.display(), to.display())
            }
            Disposition::Deleted => write!(f, "deleted {}", self.path.display()),
            Disposition::Failed { reason } => {
                write!(f, "failed {}: {reason}", self.path.display())
            }
        }
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Canonical path, whether or not a file ended up there.
    pub canonical: PathBuf,
    pub actions: Vec<CandidateAction>,
}

impl ReconcileReport {
    /// True when the canonical artifact exists after the pass.
    pub fn artifact_present(&self) -> bool {
        self.canonical.is_file()
    }

    /// Candidates whose move or delete failed.
    pub fn failures(&self) -> impl Iterator<Item = &CandidateAction> {
        self.actions
            .iter()
            .filter(|action| matches!(action.disposition, Disposition::Failed { .. }))
    }
}

/// Collapse all case/location variants of `{base}.{ext}` into the canonical
/// file inside `working_dir`.
///
/// The canonical file wins if it is already present; otherwise the most
/// recently modified candidate is moved there. Everything else is deleted.
pub fn reconcile(
    working_dir: &Path,
    secondary_dir: &Path,
    base: &str,
    kind: ArtifactKind,
) -> ReconcileReport {
    let canonical = working_dir.join(kind.canonical_name(base));
    let candidates = scan_dirs(working_dir, secondary_dir, base, kind);

    let keep = if candidates.contains(&canonical) {
        Some(canonical.clone())
    } else {
        candidates
            .iter()
            .max_by_key(|path| modified_time(path))
            .cloned()
    };

    let mut actions = Vec::with_capacity(candidates.len());
    if let Some(keep) = &keep {
        let disposition = if *keep == canonical {
            Disposition::Kept
        } else {
            match relocate(keep, &canonical) {
                Ok(()) => Disposition::Relocated {
                    to: canonical.clone(),
                },
                Err(err) => Disposition::Failed {
                    reason: format!("{err:#}"),
                },
            }
        };
        actions.push(CandidateAction {
            path: keep.clone(),
            disposition,
        });
    }

    for candidate in &candidates {
        if Some(candidate) == keep.as_ref() || *candidate == canonical {
            continue;
        }
        actions.push(CandidateAction {
            path: candidate.clone(),
            disposition: remove_candidate(candidate),
        });
    }

    tracing::info!(
        base,
        extension = kind.extension(),
        candidates = candidates.len(),
        present = canonical.is_file(),
        "reconciled artifact"
    );

    ReconcileReport { canonical, actions }
}

/// Delete every variant of `{base}.{ext}` in both directories.
///
/// Used before the assembler runs so a stale output from an earlier build can
/// never be mistaken for a fresh one.
pub fn purge(
    working_dir: &Path,
    secondary_dir: &Path,
    base: &str,
    kind: ArtifactKind,
) -> Vec<CandidateAction> {
    scan_dirs(working_dir, secondary_dir, base, kind)
        .into_iter()
        .map(|path| {
            let disposition = remove_candidate(&path);
            CandidateAction { path, disposition }
        })
        .collect()
}

/// Find the artifact in a single directory, preferring the canonical spelling.
pub fn locate(dir: &Path, base: &str, kind: ArtifactKind) -> Option<PathBuf> {
    let canonical = dir.join(kind.canonical_name(base));
    let candidates = candidates_in(dir, base, kind);
    if candidates.contains(&canonical) {
        return Some(canonical);
    }
    candidates.into_iter().next()
}

fn scan_dirs(
    working_dir: &Path,
    secondary_dir: &Path,
    base: &str,
    kind: ArtifactKind,
) -> Vec<PathBuf> {
    let mut candidates = candidates_in(working_dir, base, kind);
    if !same_dir(working_dir, secondary_dir) {
        candidates.extend(candidates_in(secondary_dir, base, kind));
    }
    candidates
}

fn candidates_in(dir: &Path, base: &str, kind: ArtifactKind) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(dir = %dir.display(), error = %err, "skip unreadable directory");
            return Vec::new();
        }
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| kind.matches(name, base))
        })
        .map(|entry| dir.join(entry.file_name()))
        .filter(|path| path.is_file())
        .collect();
    found.sort();
    found
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn relocate(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| format!("move {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("remove {}", from.display()))?;
    Ok(())
}

fn remove_candidate(path: &Path) -> Disposition {
    match fs::remove_file(path) {
        Ok(()) => Disposition::Deleted,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Disposition::Deleted,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to delete artifact variant");
            Disposition::Failed {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn write_with_age(path: &Path, contents: &str, secs_ago: u64) {
        fs::write(path, contents).expect("write candidate");
        let file = File::options()
            .write(true)
            .open(path)
            .expect("open candidate");
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .expect("set mtime");
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| {
                entry
                    .expect("entry")
                    .file_name()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn moves_lowercase_variant_from_source_dir() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        write_with_age(&src.path().join("hello.com"), "fresh", 0);

        let report = reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(report.canonical, work.path().join("HELLO.COM"));
        assert!(report.artifact_present());
        assert_eq!(listing(work.path()), vec!["HELLO.COM"]);
        assert!(listing(src.path()).is_empty());
        assert_eq!(
            report.actions[0].disposition,
            Disposition::Relocated {
                to: work.path().join("HELLO.COM")
            }
        );
    }

    #[test]
    fn canonical_file_wins_even_when_older() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        write_with_age(&work.path().join("HELLO.COM"), "canonical", 600);
        write_with_age(&work.path().join("hello.com"), "newer", 0);
        write_with_age(&src.path().join("Hello.Com"), "newest", 0);

        let report = reconcile(work.path(), src.path(), "hello", ArtifactKind::Binary);

        assert_eq!(listing(work.path()), vec!["HELLO.COM"]);
        assert!(listing(src.path()).is_empty());
        let kept = fs::read_to_string(&report.canonical).expect("read canonical");
        assert_eq!(kept, "canonical");
        assert_eq!(report.actions.len(), 3);
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn newest_candidate_wins_without_canonical() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        write_with_age(&work.path().join("hello.com"), "old", 300);
        write_with_age(&src.path().join("hello.COM"), "new", 5);

        let report = reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(listing(work.path()), vec!["HELLO.COM"]);
        assert!(listing(src.path()).is_empty());
        let kept = fs::read_to_string(&report.canonical).expect("read canonical");
        assert_eq!(kept, "new");
    }

    #[test]
    fn zero_candidates_returns_absent_canonical_path() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        fs::write(src.path().join("hello.asm"), "org 100h").expect("write source");

        let report = reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(report.canonical, work.path().join("HELLO.COM"));
        assert!(!report.artifact_present());
        assert!(report.actions.is_empty());
        assert_eq!(listing(src.path()), vec!["hello.asm"]);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        write_with_age(&work.path().join("hello.com"), "a", 10);
        write_with_age(&src.path().join("HELLO.com"), "b", 20);

        reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);
        let first = (listing(work.path()), listing(src.path()));
        let second = reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(first, (listing(work.path()), listing(src.path())));
        assert_eq!(
            second.actions,
            vec![CandidateAction {
                path: work.path().join("HELLO.COM"),
                disposition: Disposition::Kept,
            }]
        );
    }

    #[test]
    fn missing_directories_yield_no_candidates() {
        let work = tempfile::tempdir().expect("work dir");
        let missing = work.path().join("does-not-exist");

        let report = reconcile(&missing, &missing, "HELLO", ArtifactKind::Binary);

        assert!(report.actions.is_empty());
        assert!(!report.artifact_present());
    }

    #[test]
    fn same_directory_is_scanned_once() {
        let work = tempfile::tempdir().expect("work dir");
        write_with_age(&work.path().join("hello.com"), "old", 100);
        write_with_age(&work.path().join("Hello.Com"), "new", 1);

        let report = reconcile(work.path(), work.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(listing(work.path()), vec!["HELLO.COM"]);
        assert_eq!(report.actions.len(), 2);
        let kept = fs::read_to_string(&report.canonical).expect("read canonical");
        assert_eq!(kept, "new");
    }

    #[test]
    fn failed_move_is_reported_per_candidate() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        // A directory squatting on the canonical name blocks the move.
        fs::create_dir(work.path().join("HELLO.COM")).expect("create blocker");
        write_with_age(&src.path().join("hello.com"), "x", 0);

        let report = reconcile(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert!(!report.artifact_present());
        assert_eq!(report.failures().count(), 1);
        assert!(src.path().join("hello.com").is_file());
    }

    #[test]
    fn purge_removes_only_matching_variants() {
        let work = tempfile::tempdir().expect("work dir");
        let src = tempfile::tempdir().expect("src dir");
        fs::write(work.path().join("HELLO.COM"), "stale").expect("write");
        fs::write(src.path().join("hello.com"), "stale").expect("write");
        fs::write(src.path().join("hello.asm"), "src").expect("write");
        fs::write(work.path().join("OTHER.COM"), "keep").expect("write");

        let actions = purge(work.path(), src.path(), "HELLO", ArtifactKind::Binary);

        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|action| action.disposition == Disposition::Deleted));
        assert_eq!(listing(work.path()), vec!["OTHER.COM"]);
        assert_eq!(listing(src.path()), vec!["hello.asm"]);
    }

    #[test]
    fn locate_prefers_canonical_spelling() {
        let work = tempfile::tempdir().expect("work dir");
        fs::write(work.path().join("HELLO.dsk"), "img").expect("write");

        let found = locate(work.path(), "HELLO", ArtifactKind::DiskImage);

        assert_eq!(found, Some(work.path().join("HELLO.dsk")));
        assert_eq!(locate(work.path(), "OTHER", ArtifactKind::DiskImage), None);
    }
}
