use chrono::{DateTime, Local};
use regex::Regex;
use tracing::{debug, warn};

use crate::app::adb::session::DeviceSession;
use crate::app::error::AppError;
use crate::app::models::{CpuSample, PackageCpu};
use crate::app::perf::dump_log::DumpLog;

const DEFAULT_CPU_COLUMN: usize = 2;
const DEFAULT_UID_COLUMN: usize = 8;
const CPU_HEADER_LABELS: [&str; 2] = ["CPU]", "CPU%"];
const TOP_BATCH: &str = "top -b -n 1 -d 1";
const TOP_PLAIN: &str = "top -n 1 -d 1";

/// Device-wide summary grammar of `top`, picked by OS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSchema {
    /// `User 5%, System 3%, IOW 0%, IRQ 0%`
    Legacy,
    /// `800%cpu 56%user 1%nice 46%sys 685%idle 0%iow 10%irq 2%sirq 0%host`
    Modern,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct DeviceCpu {
    user: f64,
    nice: f64,
    system: f64,
    idle: f64,
    io_wait: f64,
    irq: f64,
}

impl CpuSchema {
    pub fn for_sdk(sdk: u32, legacy_threshold: u32) -> Self {
        if sdk < legacy_threshold {
            CpuSchema::Legacy
        } else {
            CpuSchema::Modern
        }
    }

    fn parse_summary(&self, text: &str) -> DeviceCpu {
        match self {
            CpuSchema::Legacy => parse_legacy_summary(text),
            CpuSchema::Modern => parse_modern_summary(text),
        }
        .unwrap_or_default()
    }
}

fn capture_values(re: &str, text: &str) -> Option<Vec<f64>> {
    let re = Regex::new(re).ok()?;
    let caps = re.captures(text)?;
    caps.iter()
        .skip(1)
        .map(|group| group.and_then(|value| value.as_str().parse::<f64>().ok()))
        .collect()
}

fn parse_legacy_summary(text: &str) -> Option<DeviceCpu> {
    let values = capture_values(r"User (\d+)%, System (\d+)%, IOW (\d+)%, IRQ (\d+)%", text)?;
    Some(DeviceCpu {
        user: values[0],
        system: values[1],
        io_wait: values[2],
        irq: values[3],
        ..DeviceCpu::default()
    })
}

fn parse_modern_summary(text: &str) -> Option<DeviceCpu> {
    let values = capture_values(
        r"(\d+)%cpu\s+(\d+)%user\s+(\d+)%nice\s+(\d+)%sys\s+(\d+)%idle\s+(\d+)%iow\s+(\d+)%irq\s+(\d+)%sirq\s+(\d+)%host",
        text,
    )?;
    Some(DeviceCpu {
        user: values[1],
        nice: values[2],
        system: values[3],
        idle: values[4],
        io_wait: values[5],
        irq: values[6],
    })
}

/// Index of the CPU% column, located by a header token of `CPU%` or `[%CPU]`.
pub fn cpu_column_index(text: &str) -> usize {
    let Ok(splitter) = Regex::new(r"\[%|\s+") else {
        return DEFAULT_CPU_COLUMN;
    };
    for line in text.lines().map(str::trim) {
        for label in CPU_HEADER_LABELS {
            if !line.contains(label) {
                continue;
            }
            if let Some(index) = splitter.split(line).position(|item| item == label) {
                return index;
            }
        }
    }
    DEFAULT_CPU_COLUMN
}

/// Index of the exact `UID` or `USER` header token.
pub fn uid_column_index(text: &str) -> usize {
    for line in text.lines() {
        let label = if line.contains("UID") {
            "UID"
        } else if line.contains("USER") {
            "USER"
        } else {
            continue;
        };
        if let Some(index) = line.split_whitespace().position(|item| item == label) {
            return index;
        }
    }
    DEFAULT_UID_COLUMN
}

fn percent_value(token: &str) -> Option<f64> {
    token.replace('%', "").parse::<f64>().ok()
}

/// First row whose last field is exactly `package` and whose pid is positive.
pub fn parse_package_cpu(text: &str, package: &str) -> PackageCpu {
    let cpu_index = cpu_column_index(text);
    let uid_index = uid_column_index(text);
    let mut entry = PackageCpu {
        package: package.to_string(),
        pid: None,
        uid: None,
        process_cpu_percent: None,
        uid_cpu_percent: None,
    };
    for line in text.lines().filter(|line| line.contains(package)) {
        let items: Vec<&str> = line.split_whitespace().collect();
        if items.last() != Some(&package) {
            continue;
        }
        let pid = items.first().and_then(|pid| pid.parse::<i32>().ok()).unwrap_or(0);
        if pid > 0 {
            entry.pid = Some(pid);
            entry.process_cpu_percent = items.get(cpu_index).and_then(|token| percent_value(token));
            entry.uid = items.get(uid_index).map(|uid| uid.to_string());
        }
        break;
    }
    entry
}

/// Sum of CPU% over every row whose uid column equals `uid`.
pub fn uid_cpu_percent(text: &str, uid: &str) -> f64 {
    let cpu_index = cpu_column_index(text);
    let uid_index = uid_column_index(text);
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<&str>>())
        .filter(|items| items.get(uid_index) == Some(&uid))
        .filter_map(|items| items.get(cpu_index).and_then(|token| percent_value(token)))
        .sum()
}

/// Builds one sample from raw `top` output. Pure: the same text and timestamp give the same
/// sample.
pub fn parse_cpu_sample(
    text: &str,
    packages: &[&str],
    schema: CpuSchema,
    taken_at: DateTime<Local>,
) -> CpuSample {
    let text = text.replace('\r', "");
    let device = schema.parse_summary(&text);
    let per_process: Vec<PackageCpu> = packages
        .iter()
        .map(|package| {
            let mut entry = parse_package_cpu(&text, package);
            entry.uid_cpu_percent = entry.uid.as_deref().map(|uid| uid_cpu_percent(&text, uid));
            entry
        })
        .collect();
    let total_process_cpu_percent = per_process
        .iter()
        .filter_map(|entry| entry.process_cpu_percent)
        .sum();
    CpuSample {
        timestamp_taken: taken_at,
        per_process,
        device_user_percent: device.user,
        device_system_percent: device.system,
        device_nice_percent: device.nice,
        device_idle_percent: device.idle,
        device_io_wait_percent: device.io_wait,
        device_irq_percent: device.irq,
        device_cpu_percent: device.user + device.system,
        total_process_cpu_percent,
    }
}

impl DeviceSession {
    /// Raw `top` snapshot; falls back to the non-batch form on devices that reject `-b`.
    pub fn top_snapshot(&self) -> Result<String, AppError> {
        let output = self.shell(TOP_BATCH)?;
        if output.contains("Invalid argument \"-b\"") {
            debug!(serial = %self.serial(), "top -b not supported");
            return self.shell(TOP_PLAIN);
        }
        Ok(output)
    }

    /// One CPU sample for `packages`. The raw dump is appended to the device's rolling top log.
    pub fn sample_cpu(&self, packages: &[&str]) -> Result<CpuSample, AppError> {
        if packages.is_empty() {
            warn!(serial = %self.serial(), "cpu sample requested without packages");
        }
        let output = self.top_snapshot()?;
        let taken_at = Local::now();
        let config = &self.context().config;
        DumpLog::cpu(&config.dump_dir(), self.serial(), config.max_dump_file_bytes())
            .append_best_effort("top info", &output, taken_at);
        let schema = CpuSchema::for_sdk(self.sdk_version(), self.context().legacy_sdk_threshold());
        Ok(parse_cpu_sample(&output, packages, schema, taken_at))
    }

    /// Packages' share of the whole device as a percentage, `None` without a device summary.
    pub fn app_cpu_share(&self, packages: &[&str]) -> Result<Option<f64>, AppError> {
        Ok(self.sample_cpu(packages)?.app_cpu_share_percent())
    }
}
