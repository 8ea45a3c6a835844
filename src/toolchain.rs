//! Tool discovery and environment augmentation for external tools.
use std::env;
use std::path::{Path, PathBuf};

/// Resolve a tool on `PATH`, falling back to a platform default location.
pub fn find_tool(name: &str, fallback: &Path) -> PathBuf {
    which::which(name).unwrap_or_else(|_| fallback.to_path_buf())
}

/// Extra variables for a bundled z88dk tree.
///
/// When the assembler lives in `<root>/bin` and `<root>/lib/config` exists,
/// the toolchain needs `ZCCCFG` and `Z80_OZFILES` pointing into that tree.
pub fn toolchain_env(assembler: &Path) -> Vec<(String, String)> {
    let Some(bin_dir) = assembler.parent() else {
        return Vec::new();
    };
    if bin_dir.file_name().and_then(|name| name.to_str()) != Some("bin") {
        return Vec::new();
    }
    let Some(root) = bin_dir.parent() else {
        return Vec::new();
    };
    let lib = root.join("lib");
    let config = lib.join("config");
    if !config.is_dir() {
        return Vec::new();
    }
    tracing::debug!(root = %root.display(), "bundled toolchain detected");
    vec![
        ("ZCCCFG".to_string(), config.display().to_string()),
        (
            "Z80_OZFILES".to_string(),
            format!("{}{}", lib.display(), std::path::MAIN_SEPARATOR),
        ),
    ]
}

/// Ensure the emulator sees a usable `XDG_RUNTIME_DIR` on Linux.
///
/// Returns the variable to add, or nothing when the environment already has one.
pub fn runtime_dir_env() -> Vec<(String, String)> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }
    if env::var_os("XDG_RUNTIME_DIR").is_some_and(|value| !value.is_empty()) {
        return Vec::new();
    }
    match fallback_runtime_dir() {
        Some(dir) => vec![("XDG_RUNTIME_DIR".to_string(), dir.display().to_string())],
        None => Vec::new(),
    }
}

#[cfg(unix)]
fn fallback_runtime_dir() -> Option<PathBuf> {
    use std::os::unix::fs::DirBuilderExt;

    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    let per_user = PathBuf::from(format!("/run/user/{uid}"));
    if per_user.is_dir() {
        return Some(per_user);
    }
    let user = env::var("USER").unwrap_or_else(|_| "user".to_string());
    let tmp = PathBuf::from(format!("/tmp/runtime-{user}"));
    match std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&tmp)
    {
        Ok(()) => Some(tmp),
        Err(err) => {
            tracing::warn!(dir = %tmp.display(), error = %err, "cannot create runtime dir");
            None
        }
    }
}

#[cfg(not(unix))]
fn fallback_runtime_dir() -> Option<PathBuf> {
    None
}
