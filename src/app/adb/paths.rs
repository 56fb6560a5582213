pub const DEVICE_TMP_DIR: &str = "/data/local/tmp";

pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device_path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device_path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.contains('\0') {
        return Err("device_path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device_path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device_path must not contain '..' segments".to_string());
    }
    Ok(())
}

/// Scratch file under the device tmp dir. Characters outside `[A-Za-z0-9._-]` become `_`.
pub fn device_tmp_path(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{DEVICE_TMP_DIR}/{safe}")
}

/// Host-side file name for a per-process dump log; `:` is not allowed in Windows file names.
pub fn sanitize_file_component(value: &str) -> String {
    value.replace(':', "_")
}
