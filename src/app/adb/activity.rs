use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::app::adb::session::DeviceSession;
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::ForegroundApp;

const FOREGROUND_TRIES: u32 = 3;
const FOREGROUND_DELAY: Duration = Duration::from_millis(300);

/// Focused window from `dumpsys window windows`.
pub fn parse_focused_window(output: &str) -> Option<ForegroundApp> {
    let re = Regex::new(r"mCurrentFocus=Window\{.*\s+(?P<package>[^\s]+)/(?P<activity>[^\s]+)\}").ok()?;
    let caps = re.captures(output)?;
    Some(ForegroundApp {
        package: caps["package"].to_string(),
        activity: caps["activity"].to_string(),
        pid: None,
    })
}

/// Last `ACTIVITY pkg/act ... pid=N` record of `dumpsys activity top`; the newest entry wins.
pub fn parse_activity_records(output: &str) -> Option<ForegroundApp> {
    let re =
        Regex::new(r"ACTIVITY (?P<package>[^\s]+)/(?P<activity>[^/\s]+) \w+ pid=(?P<pid>\d+)").ok()?;
    re.captures_iter(output)
        .last()
        .map(|caps| ForegroundApp {
            package: caps["package"].to_string(),
            activity: caps["activity"].to_string(),
            pid: caps["pid"].parse().ok(),
        })
}

/// Activity name from the first `ACTIVITY` line of `dumpsys activity top`.
pub fn parse_top_activity_name(output: &str) -> Option<String> {
    let line = output.lines().find(|line| line.contains("ACTIVITY"))?;
    let line = line.trim();
    let component = line.split_whitespace().nth(1)?;
    let name = if line.contains('.') {
        component.replace('/', "")
    } else {
        component.split('/').nth(1)?.to_string()
    };
    Some(name).filter(|name| !name.is_empty())
}

/// Activity class of the most recent `MOVE_TO_FOREGROUND` event in `dumpsys usagestats`.
pub fn parse_usagestats_activity(output: &str) -> Option<String> {
    let line = output
        .lines()
        .filter(|line| line.contains("MOVE_TO_FOREGROUND"))
        .last()?;
    let (_, tail) = line.trim().split_once("class=")?;
    let name = tail.split_whitespace().next()?;
    Some(name.to_string()).filter(|name| !name.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivitySource {
    ActivityTop,
    UsageStats,
}

impl DeviceSession {
    /// Foreground app from the focused window, falling back to the activity stack. Both sources
    /// missing is `ERR_NOT_FOUND` after a few short retries; callers may retry further.
    pub fn foreground_app(&self) -> Result<ForegroundApp, AppError> {
        let trace_id = new_trace_id();
        for attempt in 1..=FOREGROUND_TRIES {
            if let Some(app) = self.foreground_app_once()? {
                return Ok(app);
            }
            debug!(trace_id = %trace_id, serial = %self.serial(), attempt, "no focused app yet");
            if attempt < FOREGROUND_TRIES {
                std::thread::sleep(FOREGROUND_DELAY);
            }
        }
        Err(AppError::not_found("Couldn't get focused app", &trace_id))
    }

    fn foreground_app_once(&self) -> Result<Option<ForegroundApp>, AppError> {
        let windows = self.shell("dumpsys window windows")?;
        if let Some(app) = parse_focused_window(&windows) {
            return Ok(Some(app));
        }
        let top = self.shell("dumpsys activity top")?;
        Ok(parse_activity_records(&top))
    }

    /// Below the legacy threshold the activity stack is consulted first, usage stats second; at or
    /// above it the order flips.
    pub fn current_activity(&self) -> Option<String> {
        let order = if self.is_legacy_sdk() {
            [ActivitySource::ActivityTop, ActivitySource::UsageStats]
        } else {
            [ActivitySource::UsageStats, ActivitySource::ActivityTop]
        };
        order
            .into_iter()
            .find_map(|source| self.activity_from(source))
    }

    fn activity_from(&self, source: ActivitySource) -> Option<String> {
        let (command, parse): (&str, fn(&str) -> Option<String>) = match source {
            ActivitySource::ActivityTop => ("dumpsys activity top", parse_top_activity_name),
            ActivitySource::UsageStats => ("dumpsys usagestats", parse_usagestats_activity),
        };
        match self.shell(command) {
            Ok(output) => parse(&output),
            Err(err) => {
                warn!(serial = %self.serial(), source = ?source, error = %err, "activity lookup failed");
                None
            }
        }
    }

    /// Waits for `package` to run (or be in front when `front` is set) and returns its pid, 0 on
    /// timeout.
    pub fn app_wait(&self, package: &str, timeout: Duration, front: bool) -> i32 {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            let ready = if front {
                self.foreground_app()
                    .map(|app| app.package == package)
                    .unwrap_or(false)
            } else {
                self.running_apps()
                    .map(|apps| apps.iter().any(|app| app == package))
                    .unwrap_or(false)
            };
            if ready {
                return self.package_pid(package).ok().flatten().unwrap_or(0);
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        0
    }
}
