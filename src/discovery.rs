use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{debug, info};

use crate::conversation::workspace_id_for_uri;
use crate::rpc::{
    CancelToken, Endpoint, HttpRpcClient, MAX_PROBE_RESPONSE_BYTES, METHOD_PROBE, RpcTransport,
    loopback_agent,
};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(20);
const LOOPBACK_PREFIX: &str = "127.0.0.1:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProcess {
    pub pid: u32,
    pub csrf_token: String,
    pub workspace_id: Option<String>,
}

#[derive(Clone)]
pub struct Connection {
    pub endpoint: Endpoint,
    pub rpc: Arc<dyn RpcTransport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

pub trait Locator: Send {
    fn locate(&self, workspace_hint: Option<&str>, cancel: &CancelToken) -> Option<Connection>;
}

pub fn is_language_server_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("language_server") && lower.contains("antigravity")
}

pub fn extract_flag(line: &str, name: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        let Some(rest) = token.strip_prefix(name) else {
            continue;
        };
        if rest.is_empty() {
            return tokens.next().map(str::to_string);
        }
        if let Some(value) = rest.strip_prefix('=') {
            return (!value.is_empty()).then(|| value.to_string());
        }
    }
    None
}

pub fn parse_process_line(line: &str) -> Option<ServerProcess> {
    let trimmed = line.trim();
    let pid = trimmed.split_whitespace().next()?.parse::<u32>().ok()?;
    let csrf_token = extract_flag(trimmed, "--csrf_token")?;
    Some(ServerProcess {
        pid,
        csrf_token,
        workspace_id: extract_flag(trimmed, "--workspace_id"),
    })
}

pub fn candidate_processes(ps_output: &str, workspace_uri: Option<&str>) -> Vec<ServerProcess> {
    let mut processes: Vec<ServerProcess> = ps_output
        .lines()
        .filter(|line| is_language_server_line(line))
        .filter_map(parse_process_line)
        .collect();

    if let Some(uri) = workspace_uri.filter(|uri| !uri.trim().is_empty()) {
        let expected = workspace_id_for_uri(uri);
        if let Some(index) = processes
            .iter()
            .position(|process| process.workspace_id.as_deref() == Some(expected.as_str()))
        {
            let matched = processes.remove(index);
            processes.insert(0, matched);
        }
    }
    processes
}

pub fn parse_listening_ports(lsof_output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in lsof_output.lines() {
        let Some(start) = line.find(LOOPBACK_PREFIX) else {
            continue;
        };
        let rest = &line[start + LOOPBACK_PREFIX.len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let terminated = rest[digits.len()..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace);
        if !terminated {
            continue;
        }
        if let Ok(port) = digits.parse::<u16>()
            && !ports.contains(&port)
        {
            ports.push(port);
        }
    }
    ports
}

pub fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn `{program}`"))?;

    let mut stdout = child
        .stdout
        .take()
        .with_context(|| format!("`{program}` stdout was not captured"))?;
    let reader = thread::spawn(move || {
        let mut output = Vec::new();
        let _ = stdout.read_to_end(&mut output);
        output
    });

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for `{program}`"))?
        {
            break status;
        }
        if cancel.is_cancelled() || started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            if cancel.is_cancelled() {
                bail!("`{program}` cancelled");
            }
            bail!("`{program}` timed out after {}s", timeout.as_secs_f32());
        }
        thread::sleep(COMMAND_POLL_INTERVAL);
    };

    let output = reader.join().unwrap_or_default();
    // lsof exits 1 when nothing matches; callers treat empty output as "none"
    if !status.success() && output.is_empty() {
        bail!("`{program}` exited with {status}");
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

pub struct ProcessLocator {
    agent: ureq::Agent,
}

impl Default for ProcessLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLocator {
    pub fn new() -> Self {
        Self {
            agent: loopback_agent(),
        }
    }

    fn listening_ports(&self, pid: u32, cancel: &CancelToken) -> Vec<u16> {
        let pid = pid.to_string();
        let args = ["-nP", "-iTCP", "-sTCP:LISTEN", "-a", "-p", pid.as_str()];
        match run_command("lsof", &args, COMMAND_TIMEOUT, cancel) {
            Ok(output) => parse_listening_ports(&output),
            Err(err) => {
                debug!(pid, error = %err, "lsof failed");
                Vec::new()
            }
        }
    }

    fn probe(
        &self,
        process: &ServerProcess,
        port: u16,
        use_tls: bool,
        cancel: &CancelToken,
    ) -> Option<HttpRpcClient> {
        let client = HttpRpcClient::new(
            Endpoint {
                pid: process.pid,
                port,
                csrf_token: process.csrf_token.clone(),
                use_tls,
            },
            self.agent.clone(),
        );
        let payload = json!({
            "metadata": {
                "ideName": "antigravity",
                "extensionName": "antigravity",
                "ideVersion": "unknown",
                "locale": "en"
            }
        });
        match client.call_with_limit(
            METHOD_PROBE,
            &payload,
            PROBE_TIMEOUT,
            MAX_PROBE_RESPONSE_BYTES,
            cancel,
        ) {
            Ok(_) => Some(client),
            Err(err) => {
                debug!(port, use_tls, class = err.class(), error = %err, "probe failed");
                None
            }
        }
    }
}

impl Locator for ProcessLocator {
    fn locate(&self, workspace_hint: Option<&str>, cancel: &CancelToken) -> Option<Connection> {
        if cfg!(windows) {
            return None;
        }

        let ps_output = match run_command(
            "ps",
            &["-ax", "-o", "pid=,command="],
            COMMAND_TIMEOUT,
            cancel,
        ) {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, "ps failed");
                return None;
            }
        };

        let candidates = candidate_processes(&ps_output, workspace_hint);
        if candidates.is_empty() {
            debug!("no language server process found");
            return None;
        }

        for process in &candidates {
            for port in self.listening_ports(process.pid, cancel) {
                for use_tls in [true, false] {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    if let Some(client) = self.probe(process, port, use_tls, cancel) {
                        let endpoint = client.endpoint().clone();
                        info!(pid = endpoint.pid, port, use_tls, "language server discovered");
                        return Some(Connection {
                            endpoint,
                            rpc: Arc::new(client),
                        });
                    }
                }
            }
        }
        None
    }
}
