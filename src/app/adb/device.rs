use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::app::adb::parse::{
    parse_apk_path, parse_available_storage_gb, parse_battery_field, parse_package_list,
    parse_version_name, parse_wm_size,
};
use crate::app::adb::paths::{device_tmp_path, validate_device_path};
use crate::app::adb::session::{DeviceSession, RunOptions};
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::{AppInfo, DeviceInfo};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const UI_DUMP_MARKER: &str = "UI hierchary dumped to";
const CAPTURE_ATTEMPTS: u32 = 3;
const DEFAULT_BATTERY_LEVEL: f64 = 100.0;
const DEFAULT_BATTERY_CELSIUS: f64 = 20.0;
const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

impl DeviceSession {
    pub fn android_version(&self) -> String {
        self.get_property("ro.build.version.release", true)
    }

    pub fn product_brand(&self) -> String {
        self.get_property("ro.product.brand", true)
    }

    pub fn product_model(&self) -> String {
        self.get_property("ro.product.model", true)
    }

    pub fn product_rom(&self) -> String {
        self.get_property("ro.build.display.id", true)
    }

    pub fn screen_size(&self) -> String {
        self.get_property("ro.product.screensize", true)
    }

    pub fn cpu_abi(&self) -> String {
        if self.sdk_version() >= self.context().config.device.abi_list_sdk_threshold {
            self.get_property("ro.product.cpu.abilist", true)
        } else {
            self.get_property("ro.product.cpu.abi", true)
        }
    }

    pub fn cpu_hardware(&self) -> String {
        self.get_property("ro.hardware", true)
    }

    /// Physical resolution `WxH`, `None` when `wm size` does not report one.
    pub fn wm_size(&self) -> Option<String> {
        if let Err(err) = self.shell("wm size reset") {
            warn!(serial = %self.serial(), error = %err, "wm size reset failed");
        }
        self.shell("wm size")
            .ok()
            .and_then(|output| parse_wm_size(&output))
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial().to_string(),
            os_type: "Android".to_string(),
            os_version: self.android_version(),
            sdk_version: self.sdk_version().to_string(),
            brand: self.product_brand(),
            model: self.product_model(),
            rom_version: self.product_rom(),
            cpu_abi: self.cpu_abi(),
            cpu_hardware: self.cpu_hardware(),
            display: self.wm_size(),
        }
    }

    pub fn push_file(&self, local: &str, remote: &str) -> Result<String, AppError> {
        let options = RunOptions::timeout(self.context().config.command.push_timeout());
        let mut output = String::new();
        for attempt in 1..=CAPTURE_ATTEMPTS {
            output = self.run_text("push", &[local, remote], options)?;
            if !output.contains("No such file or directory") {
                return Ok(output);
            }
            warn!(serial = %self.serial(), local, attempt, "push source not found");
        }
        Ok(output)
    }

    pub fn pull_file(&self, remote: &str, local: &str) -> Result<String, AppError> {
        let options = RunOptions::timeout(self.context().config.command.transfer_timeout());
        let output = self.run_text("pull", &[remote, local], options)?;
        if output.contains("failed to copy") {
            warn!(serial = %self.serial(), remote, "failed to pull file");
        }
        Ok(output)
    }

    pub fn bugreport(&self, save_path: &str) -> Result<String, AppError> {
        let options = RunOptions::timeout(self.context().config.command.transfer_timeout());
        self.run_text("bugreport", &[save_path], options)
    }

    pub fn path_exists(&self, path: &str) -> bool {
        match self.shell(&format!("ls -l {path}")) {
            Ok(output) => !output.trim().is_empty() && !output.contains("No such file or directory"),
            Err(_) => false,
        }
    }

    pub fn delete_path(&self, path: &str, recursive: bool) -> Result<(), AppError> {
        validate_device_path(path).map_err(|msg| AppError::validation(msg, new_trace_id()))?;
        let flag = if recursive { "rm -R" } else { "rm" };
        self.shell(&format!("{flag} {path}")).map(|_| ())
    }

    pub fn mkdir(&self, path: &str) -> Result<(), AppError> {
        validate_device_path(path).map_err(|msg| AppError::validation(msg, new_trace_id()))?;
        self.shell(&format!("mkdir {path}")).map(|_| ())
    }

    /// Forwards a host TCP port to a device port or socket (`port_type` e.g. `localabstract`).
    pub fn forward(&self, host_port: u16, device_port: &str, port_type: &str) -> Result<(), AppError> {
        let local = format!("tcp:{host_port}");
        let remote = format!("{port_type}:{device_port}");
        self.run("forward", &[&local, &remote]).map(|_| ())
    }

    pub fn reboot(&self, mode: Option<&str>) -> Result<(), AppError> {
        match mode {
            Some(mode) => self.run("reboot", &[mode]),
            None => self.run("reboot", &[]),
        }
        .map(|_| ())
    }

    pub fn force_stop(&self, package: &str) -> Result<String, AppError> {
        self.shell_with(
            &format!("am force-stop {package}"),
            RunOptions::timeout(FORCE_STOP_TIMEOUT),
        )
    }

    pub fn clear_data(&self, package: &str) -> Result<String, AppError> {
        self.shell(&format!("pm clear {package}"))
    }

    pub fn tap(&self, x: f64, y: f64) -> Result<(), AppError> {
        self.shell(&format!("input tap {} {}", x.round() as i64, y.round() as i64))
            .map(|_| ())
    }

    /// Clears the focused field, then types `text`.
    pub fn input_text(&self, text: &str) -> Result<String, AppError> {
        self.shell("input keyevent KEYCODE_MOVE_END")?;
        let deletes = vec!["KEYCODE_DEL"; 250].join(" ");
        self.shell(&format!("input keyevent --longpress {deletes}"))?;
        self.shell(&format!("input text {text}"))
    }

    pub fn set_http_proxy(&self, proxy: &str) -> Result<(), AppError> {
        self.shell(&format!("settings put global http_proxy {proxy}"))
            .map(|_| ())
    }

    pub fn clear_http_proxy(&self) -> Result<(), AppError> {
        self.shell("settings put global http_proxy :0").map(|_| ())
    }

    /// Switches to manual brightness and applies `value`.
    pub fn set_screen_brightness(&self, value: u32) -> Result<(), AppError> {
        self.shell("settings put system screen_brightness_mode 0")?;
        self.shell(&format!("settings put system screen_brightness {value}"))
            .map(|_| ())
    }

    pub fn wifi_connected(&self) -> bool {
        self.shell("ip -f inet addr")
            .map(|output| output.contains("wlan0"))
            .unwrap_or(false)
    }

    pub fn battery_level(&self) -> f64 {
        self.shell("dumpsys battery")
            .ok()
            .and_then(|output| parse_battery_field(&output, "level"))
            .unwrap_or(DEFAULT_BATTERY_LEVEL)
    }

    /// Battery temperature in degrees Celsius (`dumpsys battery` reports tenths).
    pub fn battery_temperature(&self) -> f64 {
        self.shell("dumpsys battery")
            .ok()
            .and_then(|output| parse_battery_field(&output, "temperature"))
            .map(|tenths| tenths / 10.0)
            .unwrap_or(DEFAULT_BATTERY_CELSIUS)
    }

    pub fn available_storage_gb(&self) -> f64 {
        self.shell("df")
            .ok()
            .and_then(|output| parse_available_storage_gb(&output))
            .unwrap_or(0.0)
    }

    /// True when the window manager is unreachable, the usual symptom of a system ANR.
    pub fn check_anr(&self) -> bool {
        self.shell("wm size")
            .map(|output| output.contains("Can't connect to window manager; is the system running?"))
            .unwrap_or(false)
    }

    pub fn installed_packages(&self) -> Result<Vec<String>, AppError> {
        Ok(parse_package_list(&self.shell("pm list packages -3")?))
    }

    pub fn is_app_installed(&self, package: &str) -> Result<bool, AppError> {
        Ok(self
            .installed_packages()?
            .iter()
            .any(|installed| installed == package))
    }

    pub fn app_version(&self, package: &str) -> Option<String> {
        self.shell(&format!("pm dump {package}"))
            .ok()
            .and_then(|output| parse_version_name(&output))
    }

    pub fn apk_path(&self, package: &str) -> Option<String> {
        self.shell(&format!("pm path {package}"))
            .ok()
            .and_then(|output| parse_apk_path(&output))
    }

    /// Launches the main activity; optionally force-stops first and waits for the process.
    pub fn app_start(&self, app: &AppInfo, stop_first: bool, wait: bool) -> Result<(), AppError> {
        if stop_first {
            self.force_stop(&app.app_id)?;
        }
        self.shell(&format!(
            "am start -a android.intent.action.MAIN -c android.intent.category.LAUNCHER -n {}/{}",
            app.app_id, app.main_activity
        ))?;
        if wait {
            self.app_wait(&app.app_id, Duration::from_secs(20), false);
        }
        Ok(())
    }

    /// Captures the screen to a local PNG via `exec-out screencap -p`.
    pub fn screenshot(&self, local: &Path) -> Result<PathBuf, AppError> {
        let trace_id = new_trace_id();
        let started = Instant::now();
        let target = local.to_string_lossy().to_string();
        for attempt in 1..=CAPTURE_ATTEMPTS {
            if let Err(err) = self.run("exec-out", &["screencap", "-p", ">", &target]) {
                warn!(trace_id = %trace_id, attempt, error = %err, "screencap failed");
                continue;
            }
            if is_png(local) {
                info!(
                    trace_id = %trace_id,
                    serial = %self.serial(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "screenshot captured"
                );
                return Ok(local.to_path_buf());
            }
            warn!(trace_id = %trace_id, attempt, "screencap produced no PNG");
        }
        Err(AppError::system(
            format!("Screenshot failed after {CAPTURE_ATTEMPTS} attempts"),
            &trace_id,
        ))
    }

    /// Current UI hierarchy as XML. Streams through `exec-out` first and falls back to dumping on
    /// the device and pulling the file.
    pub fn dump_ui(&self) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let started = Instant::now();
        for attempt in 1..=CAPTURE_ATTEMPTS {
            match self.run("exec-out", &["uiautomator", "dump", "/dev/tty"]) {
                Ok(output) => {
                    if let Some((xml, _)) = output.split_once(UI_DUMP_MARKER) {
                        info!(
                            trace_id = %trace_id,
                            serial = %self.serial(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "ui hierarchy dumped"
                        );
                        return Ok(xml.trim().to_string());
                    }
                }
                Err(err) => warn!(trace_id = %trace_id, attempt, error = %err, "ui dump failed"),
            }
        }
        self.dump_ui_via_file(&trace_id)
    }

    fn dump_ui_via_file(&self, trace_id: &str) -> Result<String, AppError> {
        let remote = device_tmp_path(&format!("uidump-{}.xml", self.serial()));
        let output = self.shell(&format!("uiautomator dump {remote}"))?;
        if !output.contains(UI_DUMP_MARKER) {
            return Err(AppError::system("uiautomator dump did not complete", trace_id));
        }
        let local_dir = tempfile::tempdir()
            .map_err(|err| AppError::system(format!("Failed to create temp dir: {err}"), trace_id))?;
        let local = local_dir.path().join("uidump.xml");
        self.pull_file(&remote, &local.to_string_lossy())?;
        if let Err(err) = self.delete_path(&remote, false) {
            warn!(trace_id = %trace_id, error = %err, "failed to remove device ui dump");
        }
        std::fs::read_to_string(&local)
            .map_err(|err| AppError::system(format!("Failed to read ui dump: {err}"), trace_id))
    }
}

fn is_png(path: &Path) -> bool {
    std::fs::read(path)
        .map(|bytes| bytes.starts_with(&PNG_SIGNATURE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{context_with, ScriptedExecutor};
    use std::sync::Arc;

    fn session(executor: &Arc<ScriptedExecutor>) -> DeviceSession {
        DeviceSession::new(context_with(executor.clone()), "SERIAL1")
    }

    #[test]
    fn device_info_aggregates_properties() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("getprop ro.build.version.release", "13");
        executor.on("getprop ro.build.version.sdk", "33");
        executor.on("getprop ro.product.brand", "google");
        executor.on("getprop ro.product.model", "Pixel 7");
        executor.on("getprop ro.product.cpu.abilist", "arm64-v8a,armeabi-v7a");
        executor.on("getprop ro.product.cpu.abi", "armeabi");
        executor.on("shell \"wm size\"", "Physical size: 1080x2400\n");
        let info = session(&executor).device_info();
        assert_eq!(info.os_type, "Android");
        assert_eq!(info.sdk_version, "33");
        assert_eq!(info.model, "Pixel 7");
        assert_eq!(info.cpu_abi, "arm64-v8a,armeabi-v7a");
        assert_eq!(info.display.as_deref(), Some("1080x2400"));
    }

    #[test]
    fn old_devices_read_single_abi() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("getprop ro.build.version.sdk", "19");
        executor.on("getprop ro.product.cpu.abi", "armeabi-v7a");
        assert_eq!(session(&executor).cpu_abi(), "armeabi-v7a");
    }

    #[test]
    fn battery_defaults_when_unreadable() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("dumpsys battery", "Error: closed");
        let unreadable = session(&executor);
        assert_eq!(unreadable.battery_level(), 100.0);
        assert_eq!(unreadable.battery_temperature(), 20.0);

        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("dumpsys battery", "  level: 64\n  temperature: 305\n");
        let charged = session(&executor);
        assert_eq!(charged.battery_level(), 64.0);
        assert_eq!(charged.battery_temperature(), 30.5);
    }

    #[test]
    fn push_retries_while_source_missing() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("push", "adb: error: cannot stat 'x': No such file or directory");
        let output = session(&executor).push_file("x", "/sdcard/x").expect("push");
        assert!(output.contains("No such file"));
        assert_eq!(executor.count(" push "), 3);
    }

    #[test]
    fn ui_dump_strips_marker() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on(
            "exec-out uiautomator dump /dev/tty",
            "<?xml version='1.0'?><hierarchy rotation=\"0\"></hierarchy>UI hierchary dumped to: /dev/tty\n",
        );
        let xml = session(&executor).dump_ui().expect("xml");
        assert_eq!(xml, "<?xml version='1.0'?><hierarchy rotation=\"0\"></hierarchy>");
    }

    #[test]
    fn anr_detection() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on(
            "wm size",
            "Can't connect to window manager; is the system running?",
        );
        assert!(session(&executor).check_anr());
    }

    #[test]
    fn delete_rejects_unsafe_paths() {
        let executor = Arc::new(ScriptedExecutor::new());
        let device = session(&executor);
        assert!(device.delete_path("/sdcard/../system", true).is_err());
        assert!(device.delete_path("/", true).is_err());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn png_signature_check() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let good = tmp.path().join("good.png");
        std::fs::write(&good, [&PNG_SIGNATURE[..], b"rest"].concat()).expect("write");
        let bad = tmp.path().join("bad.png");
        std::fs::write(&bad, b"error: device offline").expect("write");
        assert!(is_png(&good));
        assert!(!is_png(&bad));
        assert!(!is_png(&tmp.path().join("missing.png")));
    }
}
