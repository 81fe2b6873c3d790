//! Discovery of shells installed on the host.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use protocol::ShellInfo;

/// Shell registry file on Unix hosts.
const SHELLS_FILE: &str = "/etc/shells";

/// Shells looked up on `PATH` in addition to the registry file.
#[cfg(unix)]
const COMMON_SHELLS: &[&str] = &["bash", "zsh", "fish", "sh", "dash", "ksh", "tcsh", "nu", "pwsh"];

#[cfg(windows)]
const COMMON_SHELLS: &[&str] = &["pwsh", "powershell", "cmd", "bash", "wsl"];

/// Every shell found on the host, without duplicates.
pub fn available_shells() -> Vec<ShellInfo> {
    let listed = std::fs::read_to_string(SHELLS_FILE)
        .map(|contents| parse_shells_file(&contents))
        .unwrap_or_default();
    let on_path = COMMON_SHELLS.iter().filter_map(|name| which::which(name).ok());
    collect(listed.into_iter().chain(on_path))
}

/// Absolute paths listed in an `/etc/shells`-style file.
fn parse_shells_file(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .filter(|path| path.is_absolute())
        .collect()
}

fn collect(paths: impl Iterator<Item = PathBuf>) -> Vec<ShellInfo> {
    let mut seen = HashSet::new();
    paths
        .filter(|path| path.is_file())
        .filter(|path| seen.insert(path.clone()))
        .filter_map(|path| shell_info(&path))
        .collect()
}

fn shell_info(path: &Path) -> Option<ShellInfo> {
    let name = path.file_stem()?.to_string_lossy().into_owned();
    Some(ShellInfo {
        name,
        path: path.to_string_lossy().into_owned(),
    })
}
