use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::parse::{parse_adb_devices, parse_sdk_version};
use crate::app::adb::runner::quote_arg;
use crate::app::context::ToolContext;
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::CommandResult;

pub const PROXY_SERVER_PORT: u16 = 5037;

/// Per-call overrides; unset fields use the context defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub retry_count: Option<u32>,
}

impl RunOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            retry_count: None,
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

/// Handle bound to one device serial. All bridge commands for that device are routed through it.
pub struct DeviceSession {
    context: Arc<ToolContext>,
    serial: String,
    proxy_host: Option<String>,
    property_cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.serial)
            .field("proxy_host", &self.proxy_host)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(context: Arc<ToolContext>, serial: impl Into<String>) -> Self {
        Self {
            context,
            serial: serial.into(),
            proxy_host: None,
            property_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_proxy(
        context: Arc<ToolContext>,
        serial: impl Into<String>,
        proxy_host: impl Into<String>,
    ) -> Self {
        let proxy_host = proxy_host.into();
        let mut session = Self::new(context, serial);
        session.proxy_host = Some(proxy_host).filter(|host| !host.trim().is_empty());
        session
    }

    /// Binds to the first device in `device` state.
    pub fn first_attached(
        context: Arc<ToolContext>,
        proxy_host: Option<&str>,
    ) -> Result<Self, AppError> {
        let trace_id = new_trace_id();
        let serials = list_attached(&context, proxy_host, &trace_id)?;
        let Some(serial) = serials.into_iter().next() else {
            return Err(AppError::not_found("No attached device", &trace_id));
        };
        info!(trace_id = %trace_id, serial = %serial, "bound to first attached device");
        Ok(match proxy_host {
            Some(host) => Self::with_proxy(context, serial, host),
            None => Self::new(context, serial),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn proxy_host(&self) -> Option<&str> {
        self.proxy_host.as_deref()
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn build_command_line(&self, cmd: &str, args: &[&str]) -> String {
        compose_command_line(
            &self.context.adb_program,
            self.proxy_host.as_deref(),
            Some(&self.serial),
            cmd,
            args,
        )
    }

    /// Runs a bridge command, retrying only while the executor yields no result at all.
    pub fn run_with(
        &self,
        cmd: &str,
        args: &[&str],
        options: RunOptions,
    ) -> Result<CommandResult, AppError> {
        let command_line = self.build_command_line(cmd, args);
        execute_with_retry(&self.context, &command_line, options)
    }

    /// Text of a bridge command; a timeout surfaces as `ERR_TIMEOUT`.
    pub fn run(&self, cmd: &str, args: &[&str]) -> Result<String, AppError> {
        self.run_text(cmd, args, RunOptions::default())
    }

    pub fn run_text(&self, cmd: &str, args: &[&str], options: RunOptions) -> Result<String, AppError> {
        let result = self.run_with(cmd, args, options)?;
        if result.timed_out {
            return Err(AppError::timeout(result.text, new_trace_id()));
        }
        Ok(result.text)
    }

    pub fn shell(&self, command: &str) -> Result<String, AppError> {
        self.run("shell", &[command])
    }

    pub fn shell_with(&self, command: &str, options: RunOptions) -> Result<String, AppError> {
        self.run_text("shell", &[command], options)
    }

    pub fn list_devices(&self) -> Result<Vec<String>, AppError> {
        list_attached(&self.context, self.proxy_host.as_deref(), &new_trace_id())
    }

    /// Liveness gate for install/uninstall. A bridge that cannot list devices counts as offline.
    pub fn is_connected(&self) -> bool {
        match self.list_devices() {
            Ok(serials) => serials.iter().any(|serial| serial == &self.serial),
            Err(err) => {
                warn!(serial = %self.serial, error = %err, "device listing failed");
                false
            }
        }
    }

    /// Reads a system property, consulting the cache first when `use_cache` is set. Failures
    /// cache an empty string so an unavailable property is not re-queried.
    pub fn get_property(&self, name: &str, use_cache: bool) -> String {
        if use_cache {
            if let Ok(cache) = self.property_cache.lock() {
                if let Some(value) = cache.get(name) {
                    return value.clone();
                }
            }
        }
        let value = match self.shell(&format!("getprop {name}")) {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                debug!(serial = %self.serial, property = name, error = %err, "getprop failed");
                String::new()
            }
        };
        if let Ok(mut cache) = self.property_cache.lock() {
            cache.insert(name.to_string(), value.clone());
        }
        value
    }

    pub fn sdk_version(&self) -> u32 {
        let raw = self.get_property("ro.build.version.sdk", true);
        parse_sdk_version(&raw).unwrap_or(self.context.config.device.fallback_sdk)
    }

    pub fn is_legacy_sdk(&self) -> bool {
        self.sdk_version() < self.context.legacy_sdk_threshold()
    }
}

pub fn compose_command_line(
    program: &str,
    proxy_host: Option<&str>,
    serial: Option<&str>,
    cmd: &str,
    args: &[&str],
) -> String {
    let mut parts = vec![quote_arg(program)];
    if let Some(host) = proxy_host {
        parts.push("-H".to_string());
        parts.push(host.to_string());
        parts.push("-P".to_string());
        parts.push(PROXY_SERVER_PORT.to_string());
    }
    if let Some(serial) = serial.filter(|serial| !serial.is_empty()) {
        parts.push("-s".to_string());
        parts.push(serial.to_string());
    }
    parts.push(cmd.to_string());
    parts.extend(args.iter().map(|arg| quote_arg(arg)));
    parts.join(" ")
}

pub(crate) fn execute_with_retry(
    context: &ToolContext,
    command_line: &str,
    options: RunOptions,
) -> Result<CommandResult, AppError> {
    let timeout = options.timeout.unwrap_or_else(|| context.default_timeout());
    let attempts = options.retry_count.unwrap_or_else(|| context.retry_count()).max(1);
    for attempt in 1..=attempts {
        if let Some(result) = context.executor().execute(command_line, timeout) {
            return Ok(result);
        }
        warn!(command = command_line, attempt, attempts, "command produced no result");
    }
    Err(AppError::transport(
        format!("No result from '{command_line}' after {attempts} attempts"),
        new_trace_id(),
    ))
}

/// Serials in `device` state, as reported by `devices`.
pub fn list_attached(
    context: &ToolContext,
    proxy_host: Option<&str>,
    trace_id: &str,
) -> Result<Vec<String>, AppError> {
    let command_line = compose_command_line(&context.adb_program, proxy_host, None, "devices", &[]);
    let result = execute_with_retry(context, &command_line, RunOptions::default())
        .map_err(|err| AppError::transport(err.error, trace_id))?;
    Ok(parse_adb_devices(&result.text)
        .into_iter()
        .filter(|device| device.state == "device")
        .map(|device| device.serial)
        .collect())
}

/// False when the bridge daemon is down or did not acknowledge.
pub fn check_server_normal(context: &ToolContext) -> bool {
    let command_line = compose_command_line(&context.adb_program, None, None, "devices", &[]);
    let Some(result) = context
        .executor()
        .execute(&command_line, context.default_timeout())
    else {
        debug!("device list is empty or unavailable");
        return true;
    };
    if result.text.contains("daemon not running.") {
        warn!("adb daemon not running");
        return false;
    }
    if result.text.contains("adb server didn't ACK") {
        warn!("adb server didn't ACK; port 5037 may be occupied");
        return false;
    }
    true
}

/// Restarts the bridge server when `check_server_normal` reports it unhealthy.
pub fn recover_server(context: &ToolContext) -> bool {
    if check_server_normal(context) {
        return false;
    }
    let timeout = context.default_timeout();
    for cmd in ["kill-server", "start-server"] {
        let command_line = compose_command_line(&context.adb_program, None, None, cmd, &[]);
        if context.executor().execute(&command_line, timeout).is_none() {
            warn!(command = %command_line, "server recovery step produced no result");
        }
    }
    info!("adb server restarted");
    true
}
