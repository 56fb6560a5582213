use std::collections::HashSet;

use tracing::debug;

use crate::app::adb::parse::parse_package_list;
use crate::app::adb::session::DeviceSession;
use crate::app::error::AppError;
use crate::app::models::ProcessEntry;

/// Column layout of a process listing, chosen from its header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLayout {
    /// toolbox `ps`: `USER PID PPID VSZ RSS WCHAN ADDR S NAME`.
    Standard,
    /// busybox-style `ps`: header starts with `PID`.
    Alternate,
}

impl ProcessLayout {
    pub fn detect(header: &str) -> Self {
        if header.trim_start().starts_with("PID") {
            ProcessLayout::Alternate
        } else {
            ProcessLayout::Standard
        }
    }
}

pub fn parse_process_list(output: &str) -> Vec<ProcessEntry> {
    let normalized = output.replace('\r', "");
    let mut lines = normalized.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let layout = ProcessLayout::detect(header);
    lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let items: Vec<&str> = line.split_whitespace().collect();
            let entry = match layout {
                ProcessLayout::Standard => parse_standard_row(&items),
                ProcessLayout::Alternate => parse_alternate_row(&items),
            };
            if entry.is_none() {
                debug!(row = line, "unparseable process row");
            }
            entry
        })
        .collect()
}

fn parse_standard_row(items: &[&str]) -> Option<ProcessEntry> {
    // Eight columns means the WCHAN or ADDR column was blank; the name shifts left by one.
    let name = match items.len() {
        0..=7 => return None,
        8 => items[7],
        _ => items[8],
    };
    Some(ProcessEntry {
        uid: items[0].to_string(),
        pid: items[1].parse().ok()?,
        ppid: items[2].parse().ok()?,
        name: name.to_string(),
        status: items[items.len() - 2].to_string(),
    })
}

fn parse_alternate_row(items: &[&str]) -> Option<ProcessEntry> {
    let mut idx = 4;
    let mut cmd = *items.get(idx)?;
    // Some builds emit a one-letter state column before the command.
    if cmd.chars().count() == 1 {
        idx += 1;
        cmd = items.get(idx)?;
    }
    idx += 1;
    if cmd.starts_with('{') && cmd.ends_with('}') {
        cmd = items.get(idx)?;
    }
    let ppid = if items[1].chars().all(|ch| ch.is_ascii_digit()) {
        items[1].parse().unwrap_or(0)
    } else {
        0
    };
    Some(ProcessEntry {
        pid: items[0].parse().ok()?,
        uid: items[1].to_string(),
        ppid,
        name: cmd.to_string(),
        status: items[items.len() - 2].to_string(),
    })
}

impl DeviceSession {
    /// Fresh process table; `ps -A` from the legacy threshold on, plain `ps` below it.
    pub fn list_processes(&self) -> Result<Vec<ProcessEntry>, AppError> {
        let command = if self.is_legacy_sdk() { "ps" } else { "ps -A" };
        let output = self.shell(command)?;
        Ok(parse_process_list(&output))
    }

    pub fn process_pids(&self, process_name: &str) -> Result<Vec<i32>, AppError> {
        Ok(self
            .list_processes()?
            .into_iter()
            .filter(|entry| entry.name == process_name)
            .map(|entry| entry.pid)
            .collect())
    }

    /// Pid of the package's main process, if it is running.
    pub fn package_pid(&self, package: &str) -> Result<Option<i32>, AppError> {
        Ok(self.process_pids(package)?.into_iter().next())
    }

    pub fn is_process_running(&self, process_name: &str) -> Result<bool, AppError> {
        Ok(!self.process_pids(process_name)?.is_empty())
    }

    /// Kills every process with this exact name; returns how many were signalled.
    pub fn kill_processes(&self, process_name: &str) -> Result<usize, AppError> {
        let pids = self.process_pids(process_name)?;
        if !pids.is_empty() {
            let joined: Vec<String> = pids.iter().map(i32::to_string).collect();
            self.shell(&format!("kill {}", joined.join(" ")))?;
        }
        Ok(pids.len())
    }

    /// Installed packages that currently have a process with the same name.
    pub fn running_apps(&self) -> Result<Vec<String>, AppError> {
        let packages = parse_package_list(&self.shell("pm list packages")?);
        let running: HashSet<String> = self
            .list_processes()?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        let mut apps: Vec<String> = packages
            .into_iter()
            .filter(|package| running.contains(package))
            .collect();
        apps.sort();
        apps.dedup();
        Ok(apps)
    }
}
