use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::app::adb::install::{resolve_metadata, InstallRequest, PackageMetadataResolver};
use crate::app::adb::runner::quote_arg;
use crate::app::adb::session::{execute_with_retry, RunOptions};
use crate::app::artifact::resolve_artifact;
use crate::app::context::ToolContext;
use crate::app::error::{new_trace_id, AppError};
use crate::app::ios::ports::PortLease;
use crate::app::models::{
    AppInfo, CommandResult, DeviceInfo, FailureReason, InstallErrorCode, InstallOutcome,
    InstallStatus, UninstallStatus,
};

const COMPLETE_MARKER: &str = "Complete";
const WDA_BUNDLE_ID: &str = "com.facebook.WebDriverAgentRunner.xctrunner";
pub const WDA_DEVICE_PORT: u16 = 8100;

/// Product identifier → (marketing name, screen size).
const PRODUCT_TYPES: &[(&str, &str, &str)] = &[
    ("iPhone8,1", "iPhone 6s", "750x1334"),
    ("iPhone8,2", "iPhone 6s Plus", "1080x1920"),
    ("iPhone8,4", "iPhone SE (GSM)", "640x1136"),
    ("iPhone9,1", "iPhone 7", "750x1334"),
    ("iPhone9,2", "iPhone 7 Plus", "1080x1920"),
    ("iPhone9,3", "iPhone 7", "750x1334"),
    ("iPhone9,4", "iPhone 7 Plus", "1080x1920"),
    ("iPhone10,1", "iPhone 8", "750x1334"),
    ("iPhone10,2", "iPhone 8 Plus", "1080x1920"),
    ("iPhone10,3", "iPhone X Global", "1125x2436"),
    ("iPhone10,4", "iPhone 8", "750x1334"),
    ("iPhone10,5", "iPhone 8 Plus", "1080x1920"),
    ("iPhone10,6", "iPhone X GSM", "1125x2436"),
    ("iPhone11,2", "iPhone XS", "1125x2436"),
    ("iPhone11,4", "iPhone XS Max", "1242x2688"),
    ("iPhone11,6", "iPhone XS Max Global", "1242x2688"),
    ("iPhone11,8", "iPhone XR", "828x1792"),
    ("iPhone12,1", "iPhone 11", "828x1792"),
    ("iPhone12,3", "iPhone 11 Pro", "1125x2436"),
    ("iPhone12,5", "iPhone 11 Pro Max", "1242x2688"),
    ("iPhone12,8", "iPhone SE 2nd Gen", "750x1334"),
    ("iPhone13,1", "iPhone 12 Mini", "1080x2340"),
    ("iPhone13,2", "iPhone 12", "1170x2532"),
    ("iPhone13,3", "iPhone 12 Pro", "1170x2532"),
    ("iPhone13,4", "iPhone 12 Pro Max", "1284x2778"),
    ("iPhone14,2", "iPhone 13 Pro", "1170x2532"),
    ("iPhone14,3", "iPhone 13 Pro Max", "1284x2778"),
    ("iPhone14,4", "iPhone 13 Mini", "1080x2340"),
    ("iPhone14,5", "iPhone 13", "1170x2532"),
    ("iPad7,5", "iPad 6th Gen (WiFi)", "1536x2048"),
    ("iPad7,11", "iPad 7th Gen 10.2-inch (WiFi)", "1620x2160"),
    ("iPad8,1", "iPad Pro 11 inch 3rd Gen (WiFi)", "1668x2388"),
    ("iPad11,6", "iPad 8th Gen (WiFi)", "1620x2160"),
    ("iPad12,1", "iPad 9th Gen (WiFi)", "1620x2160"),
    ("iPad13,1", "iPad Air 4th Gen (WiFi)", "1640x2360"),
    ("iPad14,1", "iPad mini 6th Gen (WiFi)", "1488x2266"),
];

pub fn product_model(product_type: &str) -> Option<(&'static str, &'static str)> {
    PRODUCT_TYPES
        .iter()
        .find(|(id, _, _)| *id == product_type)
        .map(|(_, model, size)| (*model, *size))
}

pub fn brand_for_product(product_type: &str) -> &'static str {
    ["iPhone", "iPad", "iPod"]
        .into_iter()
        .find(|brand| product_type.contains(*brand))
        .unwrap_or("")
}

/// Value of `Key: value` in `info` output.
pub fn parse_info_field(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == key).then(|| value.trim().to_string())
    })
}

/// Udids from `idevice_id -l`; a missing tool yields nothing.
pub fn parse_udid_list(output: &str) -> Vec<String> {
    if output.contains("not found") {
        return Vec::new();
    }
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IosApp {
    pub bundle_id: String,
    pub name: String,
    pub version: String,
}

/// Rows of `applist`: `<bundle id> <display name...> <version>`.
pub fn parse_applist(output: &str) -> Vec<IosApp> {
    output
        .lines()
        .filter_map(|line| {
            let items: Vec<&str> = line.split_whitespace().collect();
            let (bundle_id, rest) = items.split_first()?;
            let (version, name) = match rest.split_last() {
                Some((version, name)) if !name.is_empty() => (*version, name.join(" ")),
                Some((name, _)) => ("", name.to_string()),
                None => ("", String::new()),
            };
            Some(IosApp {
                bundle_id: bundle_id.to_string(),
                name,
                version: version.to_string(),
            })
        })
        .collect()
}

/// Install output counts as successful only when one line is exactly `Complete`.
pub fn install_completed(output: &str) -> bool {
    output.lines().any(|line| line.trim() == COMPLETE_MARKER)
}

pub fn list_ios_devices(context: &ToolContext) -> Result<Vec<String>, AppError> {
    let command_line = format!("{} -l", quote_arg(&context.idevice_id_program));
    let result = execute_with_retry(context, &command_line, RunOptions::default())?;
    Ok(parse_udid_list(&result.text))
}

/// Handle bound to one iOS device udid, driving the device-management CLI.
pub struct IosSession {
    context: Arc<ToolContext>,
    udid: String,
}

impl std::fmt::Debug for IosSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IosSession")
            .field("udid", &self.udid)
            .finish_non_exhaustive()
    }
}

impl IosSession {
    pub fn new(context: Arc<ToolContext>, udid: impl Into<String>) -> Self {
        Self {
            context,
            udid: udid.into(),
        }
    }

    pub fn first_attached(context: Arc<ToolContext>) -> Result<Self, AppError> {
        let udid = list_ios_devices(&context)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found("No iOS device attached", new_trace_id()))?;
        Ok(Self::new(context, udid))
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn build_command_line(&self, sub: &str, args: &[&str]) -> String {
        let mut parts = vec![
            quote_arg(&self.context.tidevice_program),
            "--udid".to_string(),
            quote_arg(&self.udid),
            sub.to_string(),
        ];
        parts.extend(args.iter().map(|arg| quote_arg(arg)));
        parts.join(" ")
    }

    pub fn run_with(
        &self,
        sub: &str,
        args: &[&str],
        options: RunOptions,
    ) -> Result<CommandResult, AppError> {
        execute_with_retry(&self.context, &self.build_command_line(sub, args), options)
    }

    pub fn run(&self, sub: &str, args: &[&str]) -> Result<String, AppError> {
        let result = self.run_with(sub, args, RunOptions::default())?;
        if result.timed_out {
            return Err(AppError::timeout(result.text, new_trace_id()));
        }
        Ok(result.text)
    }

    pub fn device_info(&self) -> Result<DeviceInfo, AppError> {
        let output = self.run("info", &[])?;
        let product_type = parse_info_field(&output, "ProductType").unwrap_or_default();
        let os_version = parse_info_field(&output, "ProductVersion").unwrap_or_default();
        let cpu_abi = parse_info_field(&output, "CPUArchitecture").unwrap_or_default();
        let (model, display) = match product_model(&product_type) {
            Some((model, size)) => (model.to_string(), Some(size.to_string())),
            None => (product_type.clone(), None),
        };
        Ok(DeviceInfo {
            serial: self.udid.clone(),
            os_type: "iOS".to_string(),
            sdk_version: os_version.clone(),
            rom_version: os_version.clone(),
            os_version,
            brand: brand_for_product(&product_type).to_string(),
            model,
            cpu_abi,
            cpu_hardware: String::new(),
            display,
        })
    }

    pub fn installed_apps(&self) -> Result<Vec<IosApp>, AppError> {
        Ok(parse_applist(&self.run("applist", &[])?))
    }

    fn find_app(&self, bundle_id: &str) -> Option<IosApp> {
        match self.installed_apps() {
            Ok(apps) => apps.into_iter().find(|app| app.bundle_id == bundle_id),
            Err(err) => {
                warn!(udid = %self.udid, bundle_id, error = %err, "applist failed");
                None
            }
        }
    }

    pub fn app_version(&self, bundle_id: &str) -> Option<String> {
        self.find_app(bundle_id)
            .map(|app| app.version)
            .filter(|version| !version.is_empty())
    }

    pub fn app_name(&self, bundle_id: &str) -> Option<String> {
        self.find_app(bundle_id).map(|app| app.name)
    }

    pub fn third_party_packages(&self) -> Result<Vec<String>, AppError> {
        Ok(self
            .installed_apps()?
            .into_iter()
            .map(|app| app.bundle_id)
            .collect())
    }

    /// Installs an .ipa from a local path or URL; removes the installed copy first unless
    /// over-installing.
    pub fn install_package(
        &self,
        request: &InstallRequest,
        resolver: &dyn PackageMetadataResolver,
    ) -> InstallOutcome {
        let trace_id = new_trace_id();
        let started = Instant::now();
        let download_dir = self.context.config.download_dir();
        let artifact = match resolve_artifact(&request.source, &download_dir, &trace_id) {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(trace_id = %trace_id, source = %request.source, error = %err, "artifact unavailable");
                return InstallOutcome {
                    app_info: request.app_info.clone().unwrap_or_default(),
                    status: InstallStatus::Failure(FailureReason::ArtifactUnavailable(err.error)),
                    raw_output: String::new(),
                    attempts: 0,
                };
            }
        };
        let app_info: AppInfo = match &request.app_info {
            Some(info) => info.clone(),
            None => resolve_metadata(resolver, &artifact, &trace_id),
        };
        if let Some(installed) = self.app_version(&app_info.app_id) {
            info!(
                trace_id = %trace_id,
                bundle_id = %app_info.app_id,
                installed = %installed,
                incoming = %app_info.version,
                "app already on device"
            );
        }

        let options = RunOptions::timeout(self.context.config.command.install_timeout());
        if !request.over_install && !app_info.app_id.is_empty() {
            if let Err(err) = self.run_with("uninstall", &[&app_info.app_id], options) {
                warn!(trace_id = %trace_id, error = %err, "pre-install uninstall failed");
            }
        }
        let path = artifact.path_str();
        let (raw_output, status) = match self.run_with("install", &[&path], options) {
            Ok(result) if result.timed_out => (result.text, InstallStatus::TimedOut),
            Ok(result) if install_completed(&result.text) => (result.text, InstallStatus::Success),
            Ok(result) => {
                let detail = result.text.lines().last().unwrap_or_default().trim().to_string();
                let status = InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::Unknown(detail)));
                (result.text, status)
            }
            Err(err) => (
                err.error.clone(),
                InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::Unknown(err.error))),
            ),
        };
        artifact.cleanup();
        info!(
            trace_id = %trace_id,
            udid = %self.udid,
            status = ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "install finished"
        );
        InstallOutcome {
            app_info,
            status,
            raw_output,
            attempts: 1,
        }
    }

    pub fn uninstall_package(&self, bundle_id: &str) -> UninstallStatus {
        let options = RunOptions::timeout(self.context.config.command.uninstall_timeout());
        match self.run_with("uninstall", &[bundle_id], options) {
            Ok(result) if result.timed_out => UninstallStatus::TimedOut,
            Ok(result) if result.text.contains(COMPLETE_MARKER) => UninstallStatus::Success,
            Ok(result) => UninstallStatus::Failure(result.text.trim().to_string()),
            Err(err) => UninstallStatus::Failure(err.error),
        }
    }

    /// Uninstalls every third-party app; returns how many were removed.
    pub fn clear_third_party_packages(&self) -> Result<usize, AppError> {
        let removed = self
            .third_party_packages()?
            .iter()
            .filter(|bundle_id| self.uninstall_package(bundle_id) == UninstallStatus::Success)
            .count();
        Ok(removed)
    }

    pub fn kill_app(&self, bundle_id: &str) -> Result<(), AppError> {
        self.run("kill", &[bundle_id]).map(|_| ())
    }

    pub fn screenshot(&self, local: &Path) -> Result<PathBuf, AppError> {
        let target = local.to_string_lossy().to_string();
        let output = self.run("screenshot", &[&target])?;
        if !local.is_file() {
            return Err(AppError::system(
                format!("Screenshot not written: {}", output.trim()),
                new_trace_id(),
            ));
        }
        Ok(local.to_path_buf())
    }

    pub fn reboot(&self) -> Result<(), AppError> {
        let command_line = format!(
            "{} restart -u {}",
            quote_arg(&self.context.idevicediagnostics_program),
            quote_arg(&self.udid)
        );
        execute_with_retry(&self.context, &command_line, RunOptions::default()).map(|_| ())
    }

    fn domain_json(&self, domain: &str) -> Option<Value> {
        let output = match self.run("info", &["--domain", domain, "--json"]) {
            Ok(output) => output,
            Err(err) => {
                warn!(udid = %self.udid, domain, error = %err, "info domain query failed");
                return None;
            }
        };
        match serde_json::from_str(output.trim()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(udid = %self.udid, domain, error = %err, "info domain is not json");
                None
            }
        }
    }

    pub fn battery_level(&self) -> Option<u32> {
        self.domain_json("com.apple.mobile.battery")?
            .get("BatteryCurrentCapacity")?
            .as_u64()
            .map(|level| level as u32)
    }

    /// Free data partition space in GB (10^9 bytes).
    pub fn available_storage_gb(&self) -> Option<f64> {
        let bytes = self
            .domain_json("com.apple.disk_usage")?
            .get("AmountDataAvailable")?
            .as_f64()?;
        Some(bytes / 1_000_000_000.0)
    }

    /// Takes a local port from the context's pool, blocking until one is free.
    pub fn acquire_port(&self) -> PortLease {
        self.context.port_pool().acquire()
    }

    fn relay_options(&self) -> RunOptions {
        RunOptions::timeout(Duration::from_secs(self.context.config.ios.relay_timeout_secs))
            .with_retries(1)
    }

    /// Forwards `lease.port()` on the host to `device_port`. Blocks for the relay's lifetime.
    pub fn relay(&self, lease: &PortLease, device_port: u16) -> Result<CommandResult, AppError> {
        let local = lease.port().to_string();
        let remote = device_port.to_string();
        info!(udid = %self.udid, local = %local, remote = %remote, "relay starting");
        let command_line = format!(
            "{} -u {} relay {local} {remote}",
            quote_arg(&self.context.tidevice_program),
            quote_arg(&self.udid)
        );
        execute_with_retry(&self.context, &command_line, self.relay_options())
    }

    /// Launches WebDriverAgent with its USB port bound to `lease.port()`. Blocks while it runs.
    pub fn wda_proxy(&self, lease: &PortLease) -> Result<CommandResult, AppError> {
        info!(udid = %self.udid, port = lease.port(), "wda proxy starting");
        let command_line = format!(
            "{} -u {} xctest -B {WDA_BUNDLE_ID} -e USB_PORT:{}",
            quote_arg(&self.context.tidevice_program),
            quote_arg(&self.udid),
            lease.port()
        );
        execute_with_retry(&self.context, &command_line, self.relay_options())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::KitConfig;
    use crate::app::error::ERR_NOT_FOUND;
    use crate::app::testing::{context_with, context_with_config, timed_out, ScriptedExecutor};
    use std::fs;

    const INFO: &str = "DeviceName:      QA iPhone
ProductVersion:  15.4.1
ProductType:     iPhone13,2
CPUArchitecture: arm64e
UniqueDeviceID:  00008101-000A1
";

    const APPLIST: &str = "com.example.app Example App 2.3.1
com.example.tools Tools 1.0
";

    fn ios(executor: &Arc<ScriptedExecutor>) -> IosSession {
        IosSession::new(context_with(executor.clone()), "UDID1")
    }

    #[test]
    fn lists_udids_unless_tool_missing() {
        assert_eq!(parse_udid_list("UDID1\nUDID2\n\n"), ["UDID1", "UDID2"]);
        assert!(parse_udid_list("sh: idevice_id: command not found").is_empty());

        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("idevice_id -l", "UDID9\n");
        let session = IosSession::first_attached(context_with(executor.clone())).expect("session");
        assert_eq!(session.udid(), "UDID9");

        let empty = Arc::new(ScriptedExecutor::new());
        let err = IosSession::first_attached(context_with(empty)).unwrap_err();
        assert_eq!(err.code, ERR_NOT_FOUND);
    }

    #[test]
    fn device_info_maps_product_type() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("tidevice --udid UDID1 info", INFO);
        let info = ios(&executor).device_info().expect("info");
        assert_eq!(info.os_type, "iOS");
        assert_eq!(info.os_version, "15.4.1");
        assert_eq!(info.brand, "iPhone");
        assert_eq!(info.model, "iPhone 12");
        assert_eq!(info.display.as_deref(), Some("1170x2532"));
        assert_eq!(info.cpu_abi, "arm64e");
        assert_eq!(brand_for_product("iPad13,1"), "iPad");
        assert_eq!(brand_for_product("AppleTV5,3"), "");
    }

    #[test]
    fn applist_rows_keep_multiword_names() {
        let apps = parse_applist(APPLIST);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "Example App");
        assert_eq!(apps[0].version, "2.3.1");

        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("applist", APPLIST);
        let session = ios(&executor);
        assert_eq!(session.app_version("com.example.tools").as_deref(), Some("1.0"));
        assert_eq!(session.app_name("com.example.app").as_deref(), Some("Example App"));
        assert_eq!(session.app_version("com.absent"), None);
        assert_eq!(
            session.third_party_packages().expect("packages"),
            ["com.example.app", "com.example.tools"]
        );
    }

    fn ipa_request(dir: &Path) -> InstallRequest {
        let ipa = dir.join("app.ipa");
        fs::write(&ipa, b"PK").expect("write");
        let mut request = InstallRequest::new(ipa.to_string_lossy().to_string());
        request.app_info = Some(AppInfo {
            app_id: "com.example.app".to_string(),
            version: "2.4.0".to_string(),
            ..AppInfo::default()
        });
        request
    }

    fn no_resolver(_: &Path) -> Result<AppInfo, AppError> {
        Err(AppError::dependency("unused", "t"))
    }

    #[test]
    fn install_requires_exact_complete_line() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("install", "Copying 'app.ipa'\nInstalling\nComplete\n");
        executor.on("uninstall", "Complete");
        let session = ios(&executor);
        let mut request = ipa_request(tmp.path());
        request.over_install = false;

        let outcome = session.install_package(&request, &no_resolver);
        assert!(outcome.is_success());
        assert_eq!(outcome.app_info.app_id, "com.example.app");
        assert_eq!(executor.count("uninstall com.example.app"), 1);

        executor.on("install", "Installing ... Complete with warnings\nInstall failed: ApplicationVerificationFailed");
        let outcome = session.install_package(&ipa_request(tmp.path()), &no_resolver);
        assert_eq!(
            outcome.status,
            InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::Unknown(
                "Install failed: ApplicationVerificationFailed".to_string()
            )))
        );
        assert_eq!(executor.count("uninstall com.example.app"), 1);
    }

    #[test]
    fn install_timeout_is_distinct() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on_sequence(" install ", vec![timed_out("tidevice install")]);
        let outcome = ios(&executor).install_package(&ipa_request(tmp.path()), &no_resolver);
        assert_eq!(outcome.status, InstallStatus::TimedOut);
    }

    #[test]
    fn uninstall_checks_complete_marker() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("uninstall com.example.app", "Uninstalling 'com.example.app'\nComplete");
        executor.on("uninstall com.other", "ApplicationNotFound");
        let session = ios(&executor);
        assert_eq!(session.uninstall_package("com.example.app"), UninstallStatus::Success);
        assert_eq!(
            session.uninstall_package("com.other"),
            UninstallStatus::Failure("ApplicationNotFound".to_string())
        );
    }

    #[test]
    fn battery_and_storage_from_json_domains() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("com.apple.mobile.battery", r#"{"BatteryCurrentCapacity": 87, "BatteryIsCharging": false}"#);
        executor.on("com.apple.disk_usage", r#"{"AmountDataAvailable": 52000000000}"#);
        let session = ios(&executor);
        assert_eq!(session.battery_level(), Some(87));
        assert_eq!(session.available_storage_gb(), Some(52.0));

        executor.on("com.apple.mobile.battery", "ERROR: device locked");
        assert_eq!(session.battery_level(), None);
    }

    #[test]
    fn relay_uses_leased_port() {
        let mut config = KitConfig::default();
        config.ios.port_range_start = 12000;
        config.ios.port_range_end = 12010;
        let executor = Arc::new(ScriptedExecutor::new());
        let session = IosSession::new(context_with_config(executor.clone(), config), "UDID1");

        let lease = session.acquire_port();
        assert_eq!(lease.port(), 12000);
        session.relay(&lease, WDA_DEVICE_PORT).expect("relay");
        session.wda_proxy(&session.acquire_port()).expect("wda");
        assert_eq!(executor.count("tidevice -u UDID1 relay 12000 8100"), 1);
        assert_eq!(
            executor.count("xctest -B com.facebook.WebDriverAgentRunner.xctrunner -e USB_PORT:12005"),
            1
        );
        drop(lease);
        assert_eq!(session.context().port_pool().available(), 2);
    }

    #[test]
    fn reboot_goes_through_diagnostics() {
        let executor = Arc::new(ScriptedExecutor::new());
        ios(&executor).reboot().expect("reboot");
        assert_eq!(executor.count("idevicediagnostics restart -u UDID1"), 1);
    }
}
