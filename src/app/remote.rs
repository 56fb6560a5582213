use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::app::adb::session::DeviceSession;
use crate::app::config::{RemoteEnvVar, RemoteSettings};
use crate::app::error::{new_trace_id, AppError};

const REQUEST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemoteExecRequest<'a> {
    pub command: &'a str,
    pub timeout: f64,
    pub env: &'a str,
    pub env_vars: &'a [RemoteEnvVar],
}

/// 200..=207; some agents answer `201 Created` or `202 Accepted`.
pub fn is_accepted_status(status: u16) -> bool {
    (200..=207).contains(&status)
}

pub fn exec_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/exec")
}

/// HTTP client for the host-side agent that runs commands next to a proxied device.
pub struct RemoteAgent {
    url: String,
    settings: RemoteSettings,
    client: reqwest::blocking::Client,
}

impl RemoteAgent {
    pub fn new(host: &str, settings: &RemoteSettings) -> Result<Self, AppError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|err| AppError::dependency(format!("HTTP client unavailable: {err}"), new_trace_id()))?;
        Ok(Self {
            url: exec_url(host, settings.agent_port),
            settings: settings.clone(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts the command; the agent's JSON reply is returned as-is (`Null` for an empty body).
    pub fn exec(&self, command: &str, timeout: Duration) -> Result<Value, AppError> {
        let trace_id = new_trace_id();
        let body = RemoteExecRequest {
            command,
            timeout: timeout.as_secs_f64(),
            env: &self.settings.env,
            env_vars: &self.settings.env_vars,
        };
        let mut last_error = String::new();
        for attempt in 1..=REQUEST_ATTEMPTS {
            match self.post_once(&body) {
                Ok(value) => {
                    info!(trace_id = %trace_id, url = %self.url, command, "remote command accepted");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, url = %self.url, attempt, error = %err, "remote command failed");
                    last_error = err;
                }
            }
        }
        Err(AppError::transport(
            format!("POST {} failed: {last_error}", self.url),
            trace_id,
        ))
    }

    fn post_once(&self, body: &RemoteExecRequest<'_>) -> Result<Value, String> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        if !is_accepted_status(status) {
            return Err(format!("status {status}"));
        }
        let text = response.text().map_err(|err| err.to_string())?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

impl DeviceSession {
    /// Runs `command` through the agent on this session's proxy host.
    pub fn exec_remote_command(&self, command: &str, timeout: Duration) -> Result<Value, AppError> {
        let Some(host) = self.proxy_host() else {
            return Err(AppError::validation(
                "Remote execution requires a proxy host",
                new_trace_id(),
            ));
        };
        RemoteAgent::new(host, &self.context().config.remote)?.exec(command, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::{ERR_TRANSPORT, ERR_VALIDATION};
    use crate::app::testing::{context_with, ScriptedExecutor};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn serve_once(status_line: &'static str, body: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = stream.read(&mut buf).expect("read");
                request.extend_from_slice(&buf[..read]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|line| {
                            line.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|value| value.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length || read == 0 {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write");
            String::from_utf8_lossy(&request).to_string()
        });
        (port, handle)
    }

    #[test]
    fn status_window_and_url() {
        assert!(is_accepted_status(200));
        assert!(is_accepted_status(207));
        assert!(!is_accepted_status(208));
        assert!(!is_accepted_status(404));
        assert_eq!(exec_url("10.0.0.8", 6821), "http://10.0.0.8:6821/exec");
    }

    #[test]
    fn request_body_carries_environment() {
        let settings = RemoteSettings::default();
        let body = RemoteExecRequest {
            command: "ls",
            timeout: 20.0,
            env: &settings.env,
            env_vars: &settings.env_vars,
        };
        let json = serde_json::to_value(&body).expect("json");
        assert_eq!(json["command"], "ls");
        assert_eq!(json["timeout"], 20.0);
        assert_eq!(json["env"], "base");
        assert_eq!(json["env_vars"][0]["env_name"], "JAVA_HOME");
    }

    #[test]
    fn posts_to_agent_and_returns_reply() {
        let (port, server) = serve_once("HTTP/1.1 200 OK", r#"{"code":0,"output":"done"}"#);
        let settings = RemoteSettings {
            agent_port: port,
            ..RemoteSettings::default()
        };
        let agent = RemoteAgent::new("127.0.0.1", &settings).expect("agent");
        let reply = agent.exec("echo done", Duration::from_secs(5)).expect("reply");
        assert_eq!(reply["output"], "done");
        let request = server.join().expect("server");
        assert!(request.starts_with("POST /exec"));
        assert!(request.contains("\"command\":\"echo done\""));
    }

    #[test]
    fn unreachable_agent_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let settings = RemoteSettings {
            agent_port: port,
            request_timeout_secs: 2,
            ..RemoteSettings::default()
        };
        let agent = RemoteAgent::new("127.0.0.1", &settings).expect("agent");
        let err = agent.exec("ls", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code, ERR_TRANSPORT);
    }

    #[test]
    fn session_without_proxy_is_rejected() {
        let session = DeviceSession::new(context_with(Arc::new(ScriptedExecutor::new())), "SERIAL1");
        let err = session
            .exec_remote_command("ls", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.code, ERR_VALIDATION);
    }
}
