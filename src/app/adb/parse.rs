use regex::Regex;

use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = tokens[1].to_string();
            let mut model = None;
            let mut product = None;
            let mut device = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial,
                state,
                model,
                product,
                device,
                transport_id,
            })
        })
        .collect()
}

/// `None` for empty or error text, so callers can apply their fallback level.
pub fn parse_sdk_version(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("Error") {
        return None;
    }
    trimmed.parse::<u32>().ok()
}

/// Packages from `pm list packages` output, `package:` prefix stripped.
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("package:"))
        .map(|payload| match payload.rsplit_once('=') {
            Some((_, package)) => package.trim(),
            None => payload.trim(),
        })
        .filter(|package| !package.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_version_name(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some((_, tail)) = trimmed.split_once("versionName=") {
            let value = tail.trim().trim_matches(['"', '\'']);
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub fn parse_apk_path(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("package:"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}

/// Value of `key:` from `dumpsys battery`.
pub fn parse_battery_field(output: &str, key: &str) -> Option<f64> {
    let prefix = format!("{key}:");
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .and_then(|value| value.trim().parse::<f64>().ok())
}

/// `WxH` from the first line of `wm size`, e.g. `Physical size: 1080x2400`.
pub fn parse_wm_size(output: &str) -> Option<String> {
    let first = output.lines().find(|line| !line.trim().is_empty())?;
    let value = match first.split_once(": ") {
        Some((_, value)) => value.trim(),
        None => first.trim(),
    };
    let (width, height) = value.split_once('x')?;
    if width.trim().parse::<u32>().is_ok() && height.trim().parse::<u32>().is_ok() {
        Some(value.to_string())
    } else {
        None
    }
}

/// Available space in GB from the `Available` column of the first emulated-storage `df` row.
/// Bare numbers are 1K blocks.
pub fn parse_available_storage_gb(df_output: &str) -> Option<f64> {
    let row = df_output
        .lines()
        .filter(|line| line.contains("emulated"))
        .find(|line| !line.contains("denied"))?;
    let available = row.split_whitespace().nth(3)?;
    let re = Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([KMG]?)").ok()?;
    let caps = re.captures(available)?;
    let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let size = match caps.get(2).map(|unit| unit.as_str()) {
        Some("G") => value,
        Some("M") => value / 1024.0,
        _ => value / (1024.0 * 1024.0),
    };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adb_devices_output() {
        let output = "List of devices attached\n0123456789ABCDEF\tdevice product:sdk_gphone64_arm64 model:Pixel_7 device:emu64a transport_id:1\nemulator-5554\tunauthorized transport_id:2\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].serial, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, "device");
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[1].state, "unauthorized");
    }

    #[test]
    fn sdk_version_rejects_error_text() {
        assert_eq!(parse_sdk_version("33\r\n"), Some(33));
        assert_eq!(parse_sdk_version(""), None);
        assert_eq!(parse_sdk_version("Error: device offline"), None);
    }

    #[test]
    fn parses_third_party_packages() {
        let output = "package:com.example.app\r\npackage:/data/app/base.apk=com.other\nnoise\n";
        assert_eq!(parse_package_list(output), vec!["com.example.app", "com.other"]);
    }

    #[test]
    fn parses_version_and_apk_path() {
        assert_eq!(
            parse_version_name("    versionCode=12 minSdk=23\n    versionName=22.1.0\n").as_deref(),
            Some("22.1.0")
        );
        assert_eq!(
            parse_apk_path("package:/data/app/com.example-1/base.apk\n").as_deref(),
            Some("/data/app/com.example-1/base.apk")
        );
        assert_eq!(parse_apk_path(""), None);
    }

    #[test]
    fn parses_battery_fields() {
        let output = "AC powered: false\n  level: 87\n  temperature: 315\n";
        assert_eq!(parse_battery_field(output, "level"), Some(87.0));
        assert_eq!(parse_battery_field(output, "temperature"), Some(315.0));
        assert_eq!(parse_battery_field(output, "voltage"), None);
    }

    #[test]
    fn parses_wm_size() {
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400\nOverride size: 720x1600\n").as_deref(),
            Some("1080x2400")
        );
        assert_eq!(parse_wm_size("Can't connect to window manager"), None);
    }

    #[test]
    fn parses_available_storage_units() {
        let header = "Filesystem 1K-blocks Used Available Use% Mounted on\n";
        let gb = format!("{header}/dev/fuse 115G 20G 95G 18% /storage/emulated\n");
        assert_eq!(parse_available_storage_gb(&gb), Some(95.0));
        let mb = format!("{header}/data/media 1000M 0 512M 0% /storage/emulated\n");
        assert_eq!(parse_available_storage_gb(&mb), Some(0.5));
        let blocks = format!("{header}/data/media 4194304 0 2097152 0% /storage/emulated\n");
        assert_eq!(parse_available_storage_gb(&blocks), Some(2.0));
        assert_eq!(parse_available_storage_gb(header), None);
    }
}
