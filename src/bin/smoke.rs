use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use mdevice_lib::app::adb::install::InstallRequest;
use mdevice_lib::app::adb::session::{check_server_normal, recover_server};
use mdevice_lib::app::error::AppError;
use mdevice_lib::app::models::AppInfo;
use mdevice_lib::app::ui_tree::parse_ui_nodes;
use mdevice_lib::{init_logging, load_config, DeviceSession, ToolContext};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    proxy_host: Option<String>,
    out_dir: Option<PathBuf>,
    packages: Vec<String>,
    with_ui: bool,
    apk_source: Option<String>,
    apk_package: Option<String>,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: String,
    out_dir: String,
    artifacts: HashMap<String, String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

const USAGE: &str = "Usage: cargo run --bin smoke -- [--serial SERIAL] [--proxy HOST] [--out DIR] [--package PKG]... [--with-ui] [--apk PATH_OR_URL --apk-package PKG]\n";

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        serial: std::env::var("ANDROID_SERIAL")
            .ok()
            .filter(|s| !s.trim().is_empty()),
        proxy_host: None,
        out_dir: None,
        packages: Vec::new(),
        with_ui: false,
        apk_source: None,
        apk_package: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| {
            it.next()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--serial" => args.serial = Some(value("--serial")?),
            "--proxy" => args.proxy_host = Some(value("--proxy")?),
            "--out" => args.out_dir = Some(PathBuf::from(value("--out")?)),
            "--package" => args.packages.push(value("--package")?),
            "--with-ui" => args.with_ui = true,
            "--apk" => args.apk_source = Some(value("--apk")?),
            "--apk-package" => args.apk_package = Some(value("--apk-package")?),
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    if args.apk_source.is_some() && args.apk_package.is_none() {
        return Err("--apk requires --apk-package".to_string());
    }
    Ok(args)
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<Option<String>, AppError>,
{
    let start = Instant::now();
    let (status, detail, error_code, error) = match f() {
        Ok(detail) => ("pass", detail, None, None),
        Err(err) => ("fail", None, Some(err.code), Some(err.error)),
    };
    checks.push(SmokeCheck {
        name,
        status,
        duration_ms: start.elapsed().as_millis(),
        detail,
        error_code,
        error,
    });
    status == "pass"
}

fn to_json<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);

    let trace_id = Uuid::new_v4().to_string();
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("mdevice_smoke_{trace_id}"));
        p
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let context = Arc::new(ToolContext::new(config));
    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut checks: Vec<SmokeCheck> = Vec::new();

    let server_ok = run_check(&mut checks, "adb_server", || {
        if check_server_normal(&context) || recover_server(&context) {
            Ok(None)
        } else {
            Err(AppError::dependency("adb server unavailable", &trace_id))
        }
    });

    let session = if !server_ok {
        None
    } else {
        let proxy = args.proxy_host.as_deref();
        let mut picked = None;
        run_check(&mut checks, "select_device", || {
            let session = match &args.serial {
                Some(serial) => DeviceSession::with_proxy(
                    Arc::clone(&context),
                    serial.clone(),
                    proxy.unwrap_or_default(),
                ),
                None => DeviceSession::first_attached(Arc::clone(&context), proxy)?,
            };
            if !session.is_connected() {
                return Err(AppError::offline(
                    format!("{} is not online", session.serial()),
                    &trace_id,
                ));
            }
            let serial = session.serial().to_string();
            picked = Some(session);
            Ok(Some(serial))
        });
        picked
    };

    if let Some(session) = &session {
        run_check(&mut checks, "device_info", || {
            Ok(to_json(&session.device_info()))
        });
        run_check(&mut checks, "process_list", || {
            let processes = session.list_processes()?;
            Ok(Some(format!("{} processes", processes.len())))
        });
        run_check(&mut checks, "foreground_app", || {
            Ok(to_json(&session.foreground_app()?))
        });

        let packages: Vec<&str> = args.packages.iter().map(String::as_str).collect();
        run_check(&mut checks, "cpu_sample", || {
            let sample = session.sample_cpu(&packages)?;
            Ok(to_json(&sample))
        });
        for package in &packages {
            run_check(&mut checks, "memory_sample", || {
                Ok(to_json(&session.sample_memory(package)?))
            });
        }

        let screenshot = out_dir.join("screenshot.png");
        if run_check(&mut checks, "screenshot", || {
            session.screenshot(&screenshot).map(|_| None)
        }) {
            artifacts.insert("screenshot".to_string(), screenshot.display().to_string());
        }

        if args.with_ui {
            let dump = out_dir.join("ui_dump.xml");
            if run_check(&mut checks, "ui_dump", || {
                let xml = session.dump_ui()?;
                let nodes = parse_ui_nodes(&xml)
                    .map_err(|err| AppError::validation(err, &trace_id))?;
                fs::write(&dump, &xml)
                    .map_err(|err| AppError::system(err.to_string(), &trace_id))?;
                Ok(Some(format!("{} nodes", nodes.len())))
            }) {
                artifacts.insert("ui_dump".to_string(), dump.display().to_string());
            }
        }

        if let (Some(source), Some(package)) = (&args.apk_source, &args.apk_package) {
            run_check(&mut checks, "install", || {
                let mut request = InstallRequest::new(source.clone());
                request.app_info = Some(AppInfo {
                    app_id: package.clone(),
                    ..AppInfo::default()
                });
                let unresolved = |_: &Path| -> Result<AppInfo, AppError> {
                    Err(AppError::dependency("no metadata resolver", "smoke"))
                };
                let outcome = session.install_package(&request, &unresolved);
                if outcome.is_success() {
                    Ok(to_json(&outcome.status))
                } else {
                    Err(AppError::dependency(
                        format!("{:?}: {}", outcome.status, outcome.raw_output.trim()),
                        &trace_id,
                    ))
                }
            });
        }
    }

    let status = if checks.iter().any(|check| check.status == "fail") {
        "fail"
    } else {
        "pass"
    };
    let summary = SmokeSummary {
        tool: "mdevice-smoke",
        status,
        trace_id,
        serial: session.as_ref().map(|s| s.serial().to_string()),
        adb_program: context.adb_program.clone(),
        out_dir: out_dir.display().to_string(),
        artifacts,
        checks,
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("Failed to serialize summary: {err}"),
    }
    if status != "pass" {
        std::process::exit(1);
    }
}
