use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use crate::app::models::InstallErrorCode;
use crate::app::testing::{context_with, ok, timed_out, ScriptedExecutor};

const PACKAGE: &str = "com.example.app";
const ONLINE: &str = "List of devices attached\nSERIAL1\tdevice\n";

struct Fixture {
    _dir: TempDir,
    apk: String,
    executor: Arc<ScriptedExecutor>,
    session: DeviceSession,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tmp");
    let apk = dir.path().join("app.apk");
    std::fs::write(&apk, b"PK\x03\x04").expect("apk");
    let executor = Arc::new(ScriptedExecutor::new());
    executor.on("devices", ONLINE);
    let session = DeviceSession::new(context_with(executor.clone()), "SERIAL1");
    Fixture {
        apk: apk.to_string_lossy().to_string(),
        _dir: dir,
        executor,
        session,
    }
}

fn known_app() -> AppInfo {
    AppInfo {
        app_id: PACKAGE.to_string(),
        version: "2.0.0".to_string(),
        ..AppInfo::default()
    }
}

fn request(fx: &Fixture, over_install: bool) -> InstallRequest {
    InstallRequest {
        source: fx.apk.clone(),
        app_info: Some(known_app()),
        over_install,
        downgrade: false,
    }
}

fn no_resolver(_: &Path) -> Result<AppInfo, AppError> {
    panic!("resolver must not run when app_info is supplied")
}

fn install_calls(fx: &Fixture) -> Vec<String> {
    fx.executor
        .calls()
        .into_iter()
        .filter(|call| call.contains(" install "))
        .collect()
}

#[test]
fn older_sdk_is_terminal_without_retry() {
    let fx = fixture();
    fx.executor.on(" install ", "Failure [INSTALL_FAILED_OLDER_SDK]");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);

    assert_eq!(
        outcome.status,
        InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::OlderSdk))
    );
    assert_eq!(outcome.attempts, 1);
    assert_eq!(install_calls(&fx).len(), 1);
    assert_eq!(fx.executor.count("install-multiple"), 0);
    assert_eq!(fx.executor.count("pm list packages"), 0);
}

#[test]
fn offline_device_short_circuits() {
    let fx = fixture();
    fx.executor.on("devices", "List of devices attached\nOTHER\tdevice\n");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);

    assert_eq!(outcome.status, InstallStatus::Failure(FailureReason::DeviceOffline));
    assert!(install_calls(&fx).is_empty());
    assert_eq!(fx.session.uninstall_package(PACKAGE), UninstallStatus::Offline);
    assert_eq!(fx.executor.count("uninstall"), 0);
}

#[test]
fn already_exists_on_over_install_is_success() {
    let fx = fixture();
    fx.executor
        .on(" install ", "Failure [INSTALL_FAILED_ALREADY_EXISTS: Attempt to re-install]");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::Success);
    assert_eq!(outcome.attempts, 1);
}

#[test]
fn downgrade_rejection_forces_uninstall_then_install() {
    let fx = fixture();
    fx.executor.on_sequence(
        " install ",
        vec![ok("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]"), ok("Success")],
    );
    fx.executor.on("pm list packages -3", "package:com.example.app\n");
    fx.executor.on("uninstall com.example.app", "Success");

    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::Success);
    assert_eq!(outcome.attempts, 2);

    let installs = install_calls(&fx);
    assert_eq!(installs.len(), 2);
    assert!(installs[0].contains("install -r -t"));
    assert!(installs[1].contains("install -t"));
    assert!(!installs[1].contains("-r"));
    assert_eq!(fx.executor.count("uninstall com.example.app"), 1);
}

#[test]
fn already_exists_after_uninstall_retries_with_downgrade() {
    let fx = fixture();
    fx.executor.on_sequence(
        " install ",
        vec![ok("Failure [INSTALL_FAILED_ALREADY_EXISTS]"), ok("Success")],
    );
    let outcome = fx.session.install_package(&request(&fx, false), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::Success);
    let installs = install_calls(&fx);
    assert_eq!(installs.len(), 2);
    assert!(!installs[0].contains("-d"));
    assert!(installs[1].contains("install -t -d"));
}

#[test]
fn already_exists_without_package_id_does_not_retry_with_downgrade() {
    let fx = fixture();
    fx.executor.on(" install ", "Failure [INSTALL_FAILED_ALREADY_EXISTS]");
    let unknown = InstallRequest {
        app_info: Some(AppInfo::default()),
        ..request(&fx, false)
    };
    let outcome = fx.session.install_package(&unknown, &no_resolver);

    assert_eq!(
        outcome.status,
        InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::AlreadyExists))
    );
    assert_eq!(outcome.attempts, 1);
    let installs = install_calls(&fx);
    assert_eq!(installs.len(), 1);
    assert!(!installs[0].contains("-d"));
    assert_eq!(fx.executor.count("uninstall"), 0);
}

#[test]
fn user_cancel_falls_back_to_install_multiple() {
    let fx = fixture();
    fx.executor.on(" install ", "Failure [INSTALL_CANCELED_BY_USER]");
    fx.executor.on("install-multiple -r", "Success");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::Success);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(fx.executor.count("install-multiple -r"), 1);
}

#[test]
fn timeout_is_reported_distinctly() {
    let fx = fixture();
    fx.executor.on_sequence(" install ", vec![timed_out("adb install")]);
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::TimedOut);
    assert_eq!(fx.executor.count("pm list packages"), 0);
}

#[test]
fn reported_failure_with_package_present_is_success() {
    let fx = fixture();
    fx.executor.on(" install ", "Failure [INSTALL_FAILED_INTERNAL_ERROR]");
    fx.executor.on("pm list packages -3", "package:com.example.app\n");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(outcome.status, InstallStatus::Success);
}

#[test]
fn reported_failure_is_classified() {
    let fx = fixture();
    fx.executor.on(" install ", "Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]");
    fx.executor.on("pm list packages -3", "package:com.other\n");
    let outcome = fx.session.install_package(&request(&fx, true), &no_resolver);
    assert_eq!(
        outcome.status,
        InstallStatus::Failure(FailureReason::Tool(InstallErrorCode::InsufficientStorage))
    );
    assert_eq!(outcome.raw_output, "Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]");
}

#[test]
fn resolver_runs_once_and_failures_default() {
    let fx = fixture();
    fx.executor.on(" install ", "Success");
    let calls = AtomicUsize::new(0);
    let failing = |_: &Path| -> Result<AppInfo, AppError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::dependency("no aapt", "t"))
    };
    let mut req = request(&fx, true);
    req.app_info = None;
    let outcome = fx.session.install_package(&req, &failing);
    assert_eq!(outcome.status, InstallStatus::Success);
    assert_eq!(outcome.app_info, AppInfo::default());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_artifact_fails_before_device_calls() {
    let fx = fixture();
    let mut req = request(&fx, true);
    req.source = "/no/such/app.apk".to_string();
    let outcome = fx.session.install_package(&req, &no_resolver);
    assert!(matches!(
        outcome.status,
        InstallStatus::Failure(FailureReason::ArtifactUnavailable(_))
    ));
    assert!(fx.executor.calls().is_empty());
}

#[test]
fn uninstall_skips_absent_packages() {
    let fx = fixture();
    fx.executor.on("pm list packages -3", "package:com.other\n");
    assert_eq!(fx.session.uninstall_package(PACKAGE), UninstallStatus::NotInstalled);
    assert_eq!(fx.executor.count("uninstall"), 0);
}

#[test]
fn uninstall_requires_success_marker() {
    let fx = fixture();
    fx.executor.on("pm list packages -3", "package:com.example.app\n");
    fx.executor.on("uninstall com.example.app", "Failure [DELETE_FAILED_INTERNAL_ERROR]");
    assert_eq!(
        fx.session.uninstall_package(PACKAGE),
        UninstallStatus::Failure("Failure [DELETE_FAILED_INTERNAL_ERROR]".to_string())
    );

    fx.executor.on("uninstall com.example.app", "Success");
    assert_eq!(fx.session.uninstall_package(PACKAGE), UninstallStatus::Success);
}

#[test]
fn uninstall_artifact_uses_resolved_package() {
    let fx = fixture();
    fx.executor.on("pm list packages -3", "package:com.example.app\n");
    fx.executor.on("uninstall com.example.app", "Success");
    let resolver = |_: &Path| -> Result<AppInfo, AppError> { Ok(known_app()) };
    let (info, status) = fx.session.uninstall_artifact(&fx.apk, &resolver);
    assert_eq!(info.app_id, PACKAGE);
    assert_eq!(status, UninstallStatus::Success);
}

#[test]
fn recovery_plan_is_bounded_for_every_token() {
    let starts = [
        InstallAttempt { over_install: true, downgrade: false },
        InstallAttempt { over_install: false, downgrade: false },
        InstallAttempt { over_install: true, downgrade: true },
        InstallAttempt { over_install: false, downgrade: true },
    ];
    let mut tokens: Vec<String> = vec![
        "INSTALL_FAILED_ALREADY_EXISTS",
        "INSTALL_FAILED_VERSION_DOWNGRADE",
        "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES",
        "INSTALL_PARSE_FAILED_UNEXPECTED_EXCEPTION",
        "INSTALL_FAILED_NO_MATCHING_ABIS",
        "INSTALL_CANCELED_BY_USER",
        "INSTALL_FAILED_INSUFFICIENT_STORAGE",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    tokens.push("INSTALL_FAILED_SOMETHING_NEW".to_string());

    for start in starts {
        for token in &tokens {
            let text = format!("Failure [{token}]");
            let mut tried = vec![start];
            let mut attempt = start;
            loop {
                match next_step(attempt, &text, false, &tried) {
                    AttemptStep::Retry(next, _) => {
                        assert!(!tried.contains(&next), "{token} repeated {next:?}");
                        tried.push(next);
                        attempt = next;
                    }
                    _ => break,
                }
                assert!(tried.len() <= MAX_INSTALL_ATTEMPTS, "{token} from {start:?}");
            }
        }
    }
}

#[test]
fn transition_table_matches_recovery_policy() {
    let over = InstallAttempt { over_install: true, downgrade: false };
    let fresh = InstallAttempt { over_install: false, downgrade: false };
    let downgrade = InstallAttempt { over_install: false, downgrade: true };

    assert_eq!(
        next_step(over, "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]", false, &[over]),
        AttemptStep::Retry(fresh, "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]".to_string())
    );
    assert!(matches!(
        next_step(fresh, "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]", false, &[over, fresh]),
        AttemptStep::Settle { .. }
    ));
    assert_eq!(
        next_step(fresh, "Failure [INSTALL_FAILED_ALREADY_EXISTS]", false, &[fresh]),
        AttemptStep::Retry(downgrade, "Failure [INSTALL_FAILED_ALREADY_EXISTS]".to_string())
    );
    assert!(matches!(
        next_step(over, "Failure [INSTALL_FAILED_NO_MATCHING_ABIS]", false, &[over]),
        AttemptStep::Terminal(InstallErrorCode::NoMatchingAbis, _)
    ));
    assert!(matches!(
        next_step(over, "Success", false, &[over]),
        AttemptStep::Settle { timed_out: false, .. }
    ));
}
