use std::path::{Path, PathBuf};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Platform folder name used under the bundled tools directory.
pub fn platform_dir_name(os: &str) -> &'static str {
    match os {
        "windows" => "windows",
        "macos" | "mac" => "mac",
        _ => "linux",
    }
}

pub fn bundled_adb_path(tools_dir: &Path, os: &str) -> PathBuf {
    let binary = if os == "windows" { "adb.exe" } else { "adb" };
    tools_dir.join(platform_dir_name(os)).join(binary)
}

/// True when a shell reported the program as missing rather than running it.
pub fn output_reports_missing_program(output: &str) -> bool {
    let lowered = output.to_lowercase();
    lowered.contains("command not found")
        || lowered.contains(": not found")
        || lowered.contains("is not recognized")
        || lowered.contains("no such file or directory")
}

/// Where the bridge program came from; logged once at context construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdbSource {
    Environment,
    Config,
    SystemPath,
    Bundled,
}

/// Resolution order: `$ADB_PATH` naming an adb binary, the configured path, `adb` on PATH when
/// the probe does not report it missing, then the bundled copy for this platform.
pub fn resolve_adb_program<F>(
    env_adb_path: Option<&str>,
    configured_path: &str,
    tools_dir: &str,
    os: &str,
    probe_path_adb: F,
) -> (String, AdbSource)
where
    F: FnOnce() -> bool,
{
    if let Some(env_path) = env_adb_path.map(normalize_command_path) {
        let names_adb = Path::new(&env_path)
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("adb"))
            .unwrap_or(false);
        if names_adb {
            return (env_path, AdbSource::Environment);
        }
    }

    let configured = normalize_command_path(configured_path);
    if !configured.is_empty() {
        return (configured, AdbSource::Config);
    }

    if probe_path_adb() {
        return ("adb".to_string(), AdbSource::SystemPath);
    }

    let tools_dir = normalize_command_path(tools_dir);
    let base = if tools_dir.is_empty() {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        PathBuf::from(tools_dir)
    };
    (
        bundled_adb_path(&base, os).to_string_lossy().to_string(),
        AdbSource::Bundled,
    )
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the resolved path".to_string());
    }
    Ok(())
}
