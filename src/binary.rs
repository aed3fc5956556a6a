//! Locating the `mongod` executable.

use crate::config::expand_path;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(windows)]
pub const SERVER_BINARY: &str = "mongod.exe";
#[cfg(not(windows))]
pub const SERVER_BINARY: &str = "mongod";

/// Resolves the server binary from `configured`, or from `PATH` when absent.
pub fn resolve(configured: Option<&Path>) -> Result<PathBuf> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    resolve_in(configured, std::env::split_paths(&search_path))
}

/// Same as `resolve`, searching `dirs` in order instead of `PATH`.
pub fn resolve_in<I>(configured: Option<&Path>, dirs: I) -> Result<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    if let Some(path) = configured {
        let expanded = absolutize(&expand_path(path))?;
        if !is_executable(&expanded) {
            return Err(Error::Configuration(format!(
                "Invalid mongod binary {}",
                expanded.display()
            )));
        }
        debug!(target: "mongod_sandbox::binary", path = %expanded.display(), "Using configured binary");
        return Ok(expanded);
    }

    let mut searched = Vec::new();
    for dir in dirs {
        let dir = absolutize(&dir)?;
        let candidate = dir.join(SERVER_BINARY);
        if is_executable(&candidate) {
            debug!(target: "mongod_sandbox::binary", path = %candidate.display(), "Found binary on search path");
            return Ok(candidate);
        }
        searched.push(dir);
    }
    Err(Error::BinaryNotFound { searched })
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
