use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use crate::app::adb::session::{DeviceSession, RunOptions};
use crate::app::artifact::{resolve_artifact, ResolvedArtifact};
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::{
    AppInfo, FailureReason, InstallErrorCode, InstallOutcome, InstallStatus, Recovery,
    UninstallStatus,
};

#[cfg(test)]
mod tests;

/// Every attempt uses a distinct flag pair, so three is the most the plan can ever need.
pub const MAX_INSTALL_ATTEMPTS: usize = 3;

const SUCCESS_MARKER: &str = "Success";

/// Turns a local package path into its `AppInfo`. Called at most once per entry point.
pub trait PackageMetadataResolver {
    fn resolve(&self, artifact: &Path) -> Result<AppInfo, AppError>;
}

impl<F> PackageMetadataResolver for F
where
    F: Fn(&Path) -> Result<AppInfo, AppError>,
{
    fn resolve(&self, artifact: &Path) -> Result<AppInfo, AppError> {
        self(artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Local path or http(s) URL.
    pub source: String,
    /// Skips the resolver when the caller already knows the package.
    pub app_info: Option<AppInfo>,
    pub over_install: bool,
    pub downgrade: bool,
}

impl InstallRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            app_info: None,
            over_install: true,
            downgrade: false,
        }
    }
}

/// Flags for one `install` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallAttempt {
    pub over_install: bool,
    pub downgrade: bool,
}

impl InstallAttempt {
    pub fn args<'a>(&self, path: &'a str) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(4);
        if self.over_install {
            args.push("-r");
        }
        args.push("-t");
        if self.downgrade {
            args.push("-d");
        }
        args.push(path);
        args
    }
}

/// Result of one attempt, before the final verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStep {
    Offline,
    Succeeded(String),
    Terminal(InstallErrorCode, String),
    Retry(InstallAttempt, String),
    Settle { text: String, timed_out: bool },
}

/// Transition table for one attempt's output. `tried` holds the attempts already made; a
/// recovery that would repeat one of them settles instead.
pub fn next_step(
    attempt: InstallAttempt,
    text: &str,
    timed_out: bool,
    tried: &[InstallAttempt],
) -> AttemptStep {
    let settle = || AttemptStep::Settle {
        text: text.to_string(),
        timed_out,
    };
    if timed_out {
        return settle();
    }
    let Some(code) = InstallErrorCode::from_output(text) else {
        return settle();
    };
    let retry_with = |next: InstallAttempt| {
        if tried.contains(&next) {
            settle()
        } else {
            AttemptStep::Retry(next, text.to_string())
        }
    };
    match code.recovery() {
        Recovery::TreatAsSuccess if !attempt.over_install && !attempt.downgrade => {
            retry_with(InstallAttempt {
                over_install: false,
                downgrade: true,
            })
        }
        Recovery::TreatAsSuccess => AttemptStep::Succeeded(text.to_string()),
        Recovery::Terminal => AttemptStep::Terminal(code, text.to_string()),
        Recovery::ForceReinstall => retry_with(InstallAttempt {
            over_install: false,
            downgrade: false,
        }),
        Recovery::SilentReinstall | Recovery::Report => settle(),
    }
}

impl DeviceSession {
    /// Installs a package from a local path or URL, walking the bounded recovery plan.
    pub fn install_package(
        &self,
        request: &InstallRequest,
        resolver: &dyn PackageMetadataResolver,
    ) -> InstallOutcome {
        let trace_id = new_trace_id();
        let started = Instant::now();
        let download_dir = self.context().config.download_dir();
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
        let app_info = match &request.app_info {
            Some(info) => info.clone(),
            None => resolve_metadata(resolver, &artifact, &trace_id),
        };
        let installed = (!app_info.app_id.is_empty())
            .then(|| self.app_version(&app_info.app_id))
            .flatten();
        if let Some(installed) = installed {
            info!(
                trace_id = %trace_id,
                package = %app_info.app_id,
                installed = %installed,
                incoming = %app_info.version,
                "package already on device"
            );
        }

        let outcome = self.run_install_plan(request, &artifact, app_info, &trace_id);
        if outcome.is_success() {
            artifact.cleanup();
        }
        info!(
            trace_id = %trace_id,
            serial = %self.serial(),
            status = ?outcome.status,
            attempts = outcome.attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "install finished"
        );
        outcome
    }

    fn run_install_plan(
        &self,
        request: &InstallRequest,
        artifact: &ResolvedArtifact,
        app_info: AppInfo,
        trace_id: &str,
    ) -> InstallOutcome {
        let path = artifact.path_str();
        let mut attempt = InstallAttempt {
            over_install: request.over_install,
            downgrade: request.downgrade,
        };
        let mut tried: Vec<InstallAttempt> = Vec::with_capacity(MAX_INSTALL_ATTEMPTS);
        let outcome = |status: InstallStatus, raw_output: String, attempts: usize| InstallOutcome {
            app_info: app_info.clone(),
            status,
            raw_output,
            attempts: attempts as u8,
        };

        loop {
            if !attempt.over_install && !app_info.app_id.is_empty() {
                let status = self.uninstall_package(&app_info.app_id);
                info!(trace_id = %trace_id, package = %app_info.app_id, status = ?status, "uninstalled before install");
            }
            tried.push(attempt);
            let step = self.install_attempt(&path, attempt, &tried, trace_id);
            match step {
                AttemptStep::Offline => {
                    return outcome(
                        InstallStatus::Failure(FailureReason::DeviceOffline),
                        String::new(),
                        tried.len(),
                    );
                }
                AttemptStep::Succeeded(text) => {
                    return outcome(InstallStatus::Success, text, tried.len());
                }
                AttemptStep::Terminal(code, text) => {
                    warn!(trace_id = %trace_id, token = code.token(), cause = code.description(), "install failed terminally");
                    return outcome(
                        InstallStatus::Failure(FailureReason::Tool(code)),
                        text,
                        tried.len(),
                    );
                }
                AttemptStep::Retry(next, text)
                    if next.downgrade && !attempt.over_install && app_info.app_id.is_empty() =>
                {
                    warn!(trace_id = %trace_id, "package exists but its id is unknown; no uninstall ran, downgrade retry skipped");
                    let status = self.settle_install(&app_info, &text, false, trace_id);
                    return outcome(status, text, tried.len());
                }
                AttemptStep::Retry(next, _) if tried.len() < MAX_INSTALL_ATTEMPTS => {
                    info!(trace_id = %trace_id, from = ?attempt, to = ?next, "retrying install with narrowed options");
                    attempt = next;
                }
                AttemptStep::Retry(_, text) => {
                    let status = self.settle_install(&app_info, &text, false, trace_id);
                    return outcome(status, text, tried.len());
                }
                AttemptStep::Settle { text, timed_out } => {
                    let status = self.settle_install(&app_info, &text, timed_out, trace_id);
                    return outcome(status, text, tried.len());
                }
            }
        }
    }

    /// One `install` call including the silent `install-multiple` fallback.
    fn install_attempt(
        &self,
        path: &str,
        attempt: InstallAttempt,
        tried: &[InstallAttempt],
        trace_id: &str,
    ) -> AttemptStep {
        if !self.is_connected() {
            warn!(trace_id = %trace_id, serial = %self.serial(), "device offline; install skipped");
            return AttemptStep::Offline;
        }
        let options =
            RunOptions::timeout(self.context().config.command.install_timeout()).with_retries(1);
        let (text, timed_out) = run_capturing(self, "install", &attempt.args(path), options);
        info!(trace_id = %trace_id, attempt = ?attempt, output = %text.trim(), "install attempt");

        let code = InstallErrorCode::from_output(&text);
        if !timed_out && code.as_ref().map(InstallErrorCode::recovery) == Some(Recovery::SilentReinstall) {
            let (text, timed_out) = run_capturing(self, "install-multiple", &["-r", path], options);
            info!(trace_id = %trace_id, output = %text.trim(), "silent install attempt");
            if !timed_out
                && (text.contains(SUCCESS_MARKER)
                    || text.contains(InstallErrorCode::AlreadyExists.token()))
            {
                return AttemptStep::Succeeded(text);
            }
            return next_step(attempt, &text, timed_out, tried);
        }
        next_step(attempt, &text, timed_out, tried)
    }

    /// Final verdict once no further attempt will be made.
    fn settle_install(
        &self,
        app_info: &AppInfo,
        text: &str,
        timed_out: bool,
        trace_id: &str,
    ) -> InstallStatus {
        if !timed_out && text.contains(SUCCESS_MARKER) {
            return InstallStatus::Success;
        }
        if timed_out {
            warn!(trace_id = %trace_id, "install timed out");
            return InstallStatus::TimedOut;
        }
        if !app_info.app_id.is_empty() && self.is_app_installed(&app_info.app_id).unwrap_or(false) {
            info!(trace_id = %trace_id, package = %app_info.app_id, "install reported failure but package is present");
            return InstallStatus::Success;
        }
        let code = InstallErrorCode::from_output(text)
            .unwrap_or_else(|| InstallErrorCode::Unknown(text.trim().to_string()));
        warn!(trace_id = %trace_id, token = code.token(), cause = code.description(), "install failed");
        InstallStatus::Failure(FailureReason::Tool(code))
    }

    /// Removes a package. Offline devices and absent packages short-circuit before any tool call.
    pub fn uninstall_package(&self, package: &str) -> UninstallStatus {
        if !self.is_connected() {
            return UninstallStatus::Offline;
        }
        match self.is_app_installed(package) {
            Ok(true) => {}
            Ok(false) => {
                info!(serial = %self.serial(), package, "package not installed; uninstall skipped");
                return UninstallStatus::NotInstalled;
            }
            Err(err) => return UninstallStatus::Failure(err.error),
        }
        let options = RunOptions::timeout(self.context().config.command.uninstall_timeout());
        let (text, timed_out) = run_capturing(self, "uninstall", &[package], options);
        if timed_out {
            return UninstallStatus::TimedOut;
        }
        if text.contains(SUCCESS_MARKER) {
            UninstallStatus::Success
        } else {
            UninstallStatus::Failure(text.trim().to_string())
        }
    }

    /// Uninstalls the package contained in an artifact; the resolver names the package.
    pub fn uninstall_artifact(
        &self,
        source: &str,
        resolver: &dyn PackageMetadataResolver,
    ) -> (AppInfo, UninstallStatus) {
        let trace_id = new_trace_id();
        let download_dir = self.context().config.download_dir();
        let artifact = match resolve_artifact(source, &download_dir, &trace_id) {
            Ok(artifact) => artifact,
            Err(err) => return (AppInfo::default(), UninstallStatus::Failure(err.error)),
        };
        let app_info = resolve_metadata(resolver, &artifact, &trace_id);
        artifact.cleanup();
        if app_info.app_id.is_empty() {
            return (
                app_info,
                UninstallStatus::Failure("Package id could not be resolved".to_string()),
            );
        }
        let status = self.uninstall_package(&app_info.app_id);
        (app_info, status)
    }
}

pub(crate) fn resolve_metadata(
    resolver: &dyn PackageMetadataResolver,
    artifact: &ResolvedArtifact,
    trace_id: &str,
) -> AppInfo {
    match resolver.resolve(&artifact.path) {
        Ok(info) => info,
        Err(err) => {
            warn!(trace_id = %trace_id, path = %artifact.path.display(), error = %err, "metadata resolver failed");
            AppInfo::default()
        }
    }
}

/// Runs a bridge command and folds transport errors into text so the caller can classify.
fn run_capturing(
    session: &DeviceSession,
    cmd: &str,
    args: &[&str],
    options: RunOptions,
) -> (String, bool) {
    match session.run_with(cmd, args, options) {
        Ok(result) => (result.text, result.timed_out),
        Err(err) => (err.error, false),
    }
}
