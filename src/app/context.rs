use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::locator::{
    normalize_command_path, output_reports_missing_program, resolve_adb_program,
    validate_adb_program,
};
use crate::app::adb::runner::{CommandExecutor, SystemExecutor};
use crate::app::config::KitConfig;
use crate::app::ios::ports::PortPool;

const ADB_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tool paths, host OS and the shared executor, resolved once and handed to every session.
pub struct ToolContext {
    pub config: KitConfig,
    pub adb_program: String,
    pub tidevice_program: String,
    pub idevice_id_program: String,
    pub idevicediagnostics_program: String,
    pub os_name: String,
    executor: Arc<dyn CommandExecutor>,
    port_pool: Arc<PortPool>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("adb_program", &self.adb_program)
            .field("tidevice_program", &self.tidevice_program)
            .field("os_name", &self.os_name)
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    pub fn new(config: KitConfig) -> Self {
        Self::with_executor(config, Arc::new(SystemExecutor))
    }

    pub fn with_executor(config: KitConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let os_name = std::env::consts::OS.to_string();
        let env_adb = std::env::var("ADB_PATH").ok();
        let (adb_program, source) = resolve_adb_program(
            env_adb.as_deref(),
            &config.tools.adb_path,
            &config.tools.bundled_tools_dir,
            &os_name,
            || {
                executor
                    .execute("adb devices", ADB_PROBE_TIMEOUT)
                    .map(|result| !output_reports_missing_program(&result.text))
                    .unwrap_or(false)
            },
        );
        if let Err(reason) = validate_adb_program(&adb_program) {
            warn!(adb = %adb_program, reason = %reason, "resolved adb program looks unusable");
        }
        info!(adb = %adb_program, source = ?source, os = %os_name, "tool context ready");
        Self::with_adb_program(config, executor, adb_program)
    }

    /// Skips resolution; used when the caller already knows the bridge program.
    pub fn with_adb_program(
        config: KitConfig,
        executor: Arc<dyn CommandExecutor>,
        adb_program: impl Into<String>,
    ) -> Self {
        let tools = &config.tools;
        let tidevice_program = or_default(&tools.tidevice_path, "tidevice");
        let idevice_id_program = or_default(&tools.idevice_id_path, "idevice_id");
        let idevicediagnostics_program =
            or_default(&tools.idevicediagnostics_path, "idevicediagnostics");
        Self {
            adb_program: adb_program.into(),
            tidevice_program,
            idevice_id_program,
            idevicediagnostics_program,
            os_name: std::env::consts::OS.to_string(),
            executor,
            port_pool: Arc::new(PortPool::from_settings(&config.ios)),
            config,
        }
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    /// Relay and proxy ports shared by every iOS session built on this context.
    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.port_pool
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.command.default_timeout()
    }

    pub fn retry_count(&self) -> u32 {
        self.config.command.retry_count
    }

    pub fn legacy_sdk_threshold(&self) -> u32 {
        self.config.device.legacy_sdk_threshold
    }
}

fn or_default(configured: &str, fallback: &str) -> String {
    let normalized = normalize_command_path(configured);
    if normalized.is_empty() {
        fallback.to_string()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::ScriptedExecutor;

    #[test]
    fn configured_adb_path_skips_probe() {
        let mut config = KitConfig::default();
        config.tools.adb_path = "\"/opt/sdk/platform-tools/adb\"".to_string();
        let executor = Arc::new(ScriptedExecutor::new());
        let context = ToolContext::with_executor(config, executor.clone());
        if std::env::var("ADB_PATH").is_err() {
            assert_eq!(context.adb_program, "/opt/sdk/platform-tools/adb");
            assert!(executor.calls().is_empty());
        }
        assert_eq!(context.tidevice_program, "tidevice");
    }

    #[test]
    fn blank_tool_paths_use_defaults() {
        let mut config = KitConfig::default();
        config.tools.tidevice_path = "  ".to_string();
        let context =
            ToolContext::with_adb_program(config, Arc::new(ScriptedExecutor::new()), "adb");
        assert_eq!(context.tidevice_program, "tidevice");
        assert_eq!(context.idevice_id_program, "idevice_id");
        assert_eq!(context.default_timeout(), Duration::from_secs(60));
    }
}
