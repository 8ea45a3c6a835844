//! Typed paths for a single build.
//!
//! Every output name of a run is derived from the source file stem, so the
//! derivation lives in one place and the stages never disagree about names.
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::reconcile::ArtifactKind;

/// Convenience wrapper for locating the artifacts of one build.
#[derive(Debug, Clone)]
pub struct BuildPaths {
    source: PathBuf,
    working_dir: PathBuf,
    logs_dir: PathBuf,
    base: String,
}

impl BuildPaths {
    /// Derive the build layout for a source file and working directory.
    pub fn new(source: &Path, working_dir: &Path, logs_dir: &Path) -> Result<Self> {
        let source = normalize_path(source)?;
        let base = base_identifier(&source)?;
        Ok(Self {
            source,
            working_dir: normalize_path(working_dir)?,
            logs_dir: normalize_path(logs_dir)?,
            base,
        })
    }

    /// Return the normalized source path.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Return the directory holding the source file.
    pub fn source_dir(&self) -> &Path {
        self.source.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Return the working directory outputs are written to.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Return the uppercase base identifier shared by all artifacts.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Return the canonical file name for an artifact kind.
    pub fn artifact_name(&self, kind: ArtifactKind) -> String {
        kind.canonical_name(&self.base)
    }

    /// Return the expected `{W}/{BASE}.DSK` path.
    pub fn image_path(&self) -> PathBuf {
        self.working_dir.join(self.artifact_name(ArtifactKind::DiskImage))
    }

    /// Return the `{logs}/{BASE}_build.log` path.
    pub fn log_path(&self) -> PathBuf {
        self.logs_dir.join(format!("{}_build.log", self.base))
    }
}

/// Uppercase file stem of a source path.
pub fn base_identifier(source: &Path) -> Result<String> {
    let stem = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| anyhow!("cannot derive base name from {}", source.display()))?;
    Ok(stem.to_uppercase())
}

/// Expand `~` and make the path absolute without touching the filesystem.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = env::current_dir().context("resolve current directory")?;
    Ok(cwd.join(expanded))
}

/// Expand a leading `~` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
