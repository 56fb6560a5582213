use chrono::Local;
use regex::Regex;
use tracing::debug;

use crate::app::adb::session::DeviceSession;
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::{round2, MemorySample};
use crate::app::perf::dump_log::DumpLog;

fn capture_kb(pattern: &str, text: &str) -> Option<f64> {
    let re = Regex::new(pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse::<f64>().ok()
}

fn kb_to_mb(kb: f64) -> f64 {
    round2(kb / 1024.0)
}

/// Heap Alloc column of the last `TOTAL` table row (the one without a `:` label).
fn total_alloc_heap_kb(text: &str) -> Option<f64> {
    text.lines()
        .filter(|line| line.contains("TOTAL") && !line.contains(':'))
        .filter_map(|line| {
            let items: Vec<&str> = line.split_whitespace().collect();
            let index = items.len().checked_sub(2)?;
            items[index].parse::<f64>().ok()
        })
        .last()
}

/// Parses `dumpsys meminfo <process>`. Missing rows stay at zero.
pub fn parse_memory_sample(text: &str) -> MemorySample {
    let mut sample = MemorySample::default();
    if let Some(caps) = Regex::new(r"\*\* MEMINFO in pid (\d+) \[(\S+)] \*\*")
        .ok()
        .and_then(|re| re.captures(text))
    {
        sample.pid = caps[1].parse().unwrap_or_default();
        sample.process_name = caps[2].to_string();
    }
    let field = |pattern: &str| capture_kb(pattern, text).map(kb_to_mb).unwrap_or_default();
    sample.total_pss_mb = field(r"TOTAL(?:\s+PSS:)?\s+(\d+)");
    sample.java_heap_mb = field(r"Java Heap:\s+(\d+)");
    sample.native_heap_mb = field(r"Native Heap:\s+(\d+)");
    sample.system_mb = field(r"System:\s+(\d+)");
    sample.total_alloc_heap_mb = total_alloc_heap_kb(text).map(kb_to_mb).unwrap_or_default();
    sample
}

impl DeviceSession {
    /// Memory of the package's main process, located through the process table.
    pub fn sample_memory(&self, package: &str) -> Result<MemorySample, AppError> {
        let Some(pid) = self.package_pid(package)? else {
            return Err(AppError::not_found(
                format!("Process of {package} is not running"),
                new_trace_id(),
            ));
        };
        debug!(serial = %self.serial(), package, pid, "sampling memory");
        self.sample_memory_for(&pid.to_string(), package)
    }

    /// `target` is a pid or process name; `label` names the dump file.
    pub fn sample_memory_for(&self, target: &str, label: &str) -> Result<MemorySample, AppError> {
        let output = self.shell(&format!("dumpsys meminfo {target}"))?;
        let config = &self.context().config;
        DumpLog::memory(&config.dump_dir(), label, config.max_dump_file_bytes()).append_best_effort(
            "dumpsys meminfo package info",
            &output,
            Local::now(),
        );
        Ok(parse_memory_sample(&output))
    }
}
