//! Which executable runs for each BLAST program.
//!
//! An environment variable naming an executable wins over the bare program
//! name, which is left to the OS executable search. Per-query choices go
//! through `BlastQuery::with_executable` instead.

use std::path::{Path, PathBuf};

pub const DEFAULT_BLASTP_BIN: &str = "blastp";
pub const DEFAULT_BLASTN_BIN: &str = "blastn";
pub const BLASTP_ENV_BIN: &str = "BLASTPIPE_BLASTP_BIN";
pub const BLASTN_ENV_BIN: &str = "BLASTPIPE_BLASTN_BIN";

fn configured_value(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

fn configured(env_var: &str) -> Option<String> {
    let raw = std::env::var(env_var).ok();
    configured_value(raw.as_deref()).map(str::to_string)
}

/// `env_var` when set to a non-blank value, otherwise `default_bin`.
pub fn resolve_tool_executable(env_var: &str, default_bin: &str) -> String {
    configured(env_var).unwrap_or_else(|| default_bin.to_string())
}

/// Where the executable for `default_bin` comes from, for display.
pub fn active_resolution_label(env_var: &str, default_bin: &str) -> String {
    resolution_label(env_var, configured(env_var).as_deref(), default_bin)
}

fn resolution_label(env_var: &str, configured: Option<&str>, default_bin: &str) -> String {
    match configured {
        Some(value) => format!("{env_var}: {value}"),
        None => format!("PATH lookup: {default_bin}"),
    }
}

fn has_path_separator(value: &str) -> bool {
    value.contains(std::path::MAIN_SEPARATOR) || value.contains('/')
}

fn is_executable_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Where `program` would be found, for diagnostics. Launching does not
/// depend on this.
pub fn resolve_executable_path(program: &str) -> Option<PathBuf> {
    let trimmed = program.trim();
    if trimmed.is_empty() {
        return None;
    }
    if has_path_separator(trimmed) {
        let candidate = PathBuf::from(trimmed);
        return is_executable_file(&candidate).then_some(candidate);
    }
    let path_var = std::env::var_os("PATH")?;
    for entry in std::env::split_paths(&path_var) {
        let candidate = entry.join(trimmed);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}
