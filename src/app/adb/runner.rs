use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::models::CommandResult;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_millis(300);
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs one shell command line to completion or timeout.
///
/// `None` means the command never produced a result (spawn or poll failure); sessions retry on it.
/// Everything else, non-zero exits and timeouts included, comes back in-band.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command_line: &str, timeout: Duration) -> Option<CommandResult>;
}

/// Executes through the platform shell with stderr merged into stdout. Each call gets its own
/// process group so a timeout takes down every descendant, not only the shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, command_line: &str, timeout: Duration) -> Option<CommandResult> {
        let started = Instant::now();
        let mut child = match spawn_shell(command_line) {
            Ok(child) => child,
            Err(err) => {
                warn!(command = command_line, error = %err, "failed to spawn command");
                return None;
            }
        };

        // Both pipes are drained off-thread; a chatty child would otherwise block on a full
        // pipe buffer and look like a timeout.
        let (tx, rx) = mpsc::channel::<(u8, Vec<u8>)>();
        if let Some(stdout) = child.stdout.take() {
            spawn_drain(0, stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(1, stderr, tx.clone());
        }
        drop(tx);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        terminate_tree(&mut child);
                        let _ = collect_output(&rx, DRAIN_GRACE);
                        warn!(
                            command = command_line,
                            timeout_secs = timeout.as_secs(),
                            "command timed out; process group terminated"
                        );
                        return Some(CommandResult::timed_out(command_line, timeout.as_secs()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    warn!(command = command_line, error = %err, "failed to poll command");
                    terminate_tree(&mut child);
                    return None;
                }
            }
        };

        // A daemonised grandchild may keep the pipe open; never wait past the caller's budget.
        let remaining = timeout.saturating_sub(started.elapsed()).max(DRAIN_GRACE);
        let text = collect_output(&rx, remaining);
        debug!(
            command = command_line,
            exit_code = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        Some(CommandResult {
            text,
            succeeded: status.success(),
            timed_out: false,
        })
    }
}

/// Wraps an argument in double quotes when it contains whitespace or shell specials, escaping them.
pub fn quote_arg(arg: &str) -> String {
    let already_quoted = arg.len() >= 2
        && ((arg.starts_with('"') && arg.ends_with('"') && !arg[1..arg.len() - 1].contains('"'))
            || (arg.starts_with('\'') && arg.ends_with('\'')));
    if already_quoted {
        return arg.to_string();
    }
    let needs_quotes = arg
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '$' | '`'));
    if !needs_quotes {
        return arg.to_string();
    }
    format!("\"{}\"", escape_for_double_quotes(arg))
}

/// Characters the host shell still interprets inside `"..."`.
#[cfg(unix)]
fn escape_for_double_quotes(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len() + 4);
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `cmd` only needs embedded quotes doubled.
#[cfg(windows)]
fn escape_for_double_quotes(arg: &str) -> String {
    arg.replace('"', "\"\"")
}

#[cfg(unix)]
fn spawn_shell(command_line: &str) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;

    Command::new("sh")
        .arg("-c")
        .arg(format!("exec 2>&1\n{command_line}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
}

#[cfg(windows)]
fn spawn_shell(command_line: &str) -> std::io::Result<Child> {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    Command::new("cmd")
        .arg("/C")
        .raw_arg(format!("{command_line} 2>&1"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .creation_flags(CREATE_NEW_PROCESS_GROUP)
        .spawn()
}

#[cfg(unix)]
fn terminate_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return;
    };
    // SAFETY: signalling a process group we created; no memory is shared with the callee.
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let grace = Instant::now();
    while grace.elapsed() < KILL_GRACE {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    // Descendants may ignore SIGTERM or outlive the leader.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(windows)]
fn terminate_tree(child: &mut Child) {
    let _ = Command::new("taskkill")
        .args(["/PID", &child.id().to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_drain<R: Read + Send + 'static>(slot: u8, mut reader: R, tx: mpsc::Sender<(u8, Vec<u8>)>) {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        let _ = tx.send((slot, buffer));
    });
}

fn collect_output(rx: &mpsc::Receiver<(u8, Vec<u8>)>, budget: Duration) -> String {
    let deadline = Instant::now() + budget;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok((0, bytes)) => stdout = bytes,
            Ok((_, bytes)) => stderr = bytes,
            Err(_) => break,
        }
    }
    stdout.extend_from_slice(&stderr);
    String::from_utf8_lossy(&stdout).to_string()
}
