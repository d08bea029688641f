//! Engine driven through a child process and its REST controller.
//!
//! # Responsibilities
//! - Spawn and kill the engine process
//! - Report Starting/Started/Stopping/Stopped on a status channel
//! - Capture process output as log lines
//! - Load profiles, select proxies and read traffic totals over HTTP
//!
//! # Controller API
//! ```text
//! GET  /version                 readiness probe
//! PUT  /configs?force=true      {"path": "..."}   load profile
//! PUT  /proxies/{group}         {"name": "..."}   select proxy (non-2xx = rejected)
//! GET  /connections             {"uploadTotal", "downloadTotal", ...}
//! ```
//!
//! # Design Decisions
//! - Process exit, from any cause, is the only path to `Stopped`
//! - Readiness is probed with exponential backoff until a deadline
//! - Traffic speed is the delta of controller totals between two polls

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use url::Url;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError, EngineResult};
use crate::events::{Bandwidth, LogLevel, LogLine, ProcessStatus, Traffic};
use crate::resilience::backoff::calculate_backoff;

const READY_BASE_DELAY_MS: u64 = 100;
const READY_MAX_DELAY_MS: u64 = 2_000;

/// Engine output waiting to be drained by the log poller.
#[derive(Debug)]
struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn drain(&mut self) -> Vec<LogLine> {
        self.lines.drain(..).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Totals {
    up: u64,
    down: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionTotals {
    upload_total: u64,
    download_total: u64,
}

#[derive(Debug, Deserialize)]
struct ControllerMessage {
    message: String,
}

/// `Engine` implementation for engines exposing an external controller.
pub struct ControllerEngine {
    config: EngineConfig,
    base_url: Url,
    client: reqwest::Client,
    status_tx: watch::Sender<ProcessStatus>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    logs: Arc<Mutex<LogBuffer>>,
    last_totals: Mutex<Option<(Instant, Totals)>>,
}

impl ControllerEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let base_url = Url::parse(&config.controller_url)?;
        if base_url.cannot_be_a_base() {
            return Err(EngineError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }

        let (status_tx, _) = watch::channel(ProcessStatus::Stopped);
        let logs = Arc::new(Mutex::new(LogBuffer::new(config.log_buffer_lines)));

        Ok(Self {
            base_url,
            client: reqwest::Client::builder().no_proxy().build()?,
            status_tx,
            kill_tx: Mutex::new(None),
            logs,
            last_totals: Mutex::new(None),
            config,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.secret {
            Some(secret) if !secret.is_empty() => builder.bearer_auth(secret),
            _ => builder,
        }
    }

    fn ensure_running(&self) -> EngineResult<()> {
        match *self.status_tx.borrow() {
            ProcessStatus::Started | ProcessStatus::Starting => Ok(()),
            _ => Err(EngineError::NotRunning),
        }
    }

    async fn wait_ready(&self) -> EngineResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.ready_timeout_secs);
        let mut attempt = 0;

        loop {
            if *self.status_tx.borrow() == ProcessStatus::Stopped {
                return Err(EngineError::NotRunning);
            }

            match self.request(Method::GET, self.endpoint(&["version"])).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "Controller not ready yet");
                }
                Err(e) => tracing::debug!(error = %e, "Controller not reachable yet"),
            }

            attempt += 1;
            if Instant::now() >= deadline {
                return Err(EngineError::NotReady(self.config.ready_timeout_secs));
            }
            tokio::time::sleep(calculate_backoff(attempt, READY_BASE_DELAY_MS, READY_MAX_DELAY_MS)).await;
        }
    }

    fn kill(&self) -> bool {
        let kill_tx = self.kill_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match kill_tx {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    async fn fetch_totals(&self) -> EngineResult<Totals> {
        self.ensure_running()?;
        let totals: ConnectionTotals = self
            .request(Method::GET, self.endpoint(&["connections"]))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Totals {
            up: totals.upload_total,
            down: totals.download_total,
        })
    }
}

#[async_trait]
impl Engine for ControllerEngine {
    async fn start(&self) -> EngineResult<()> {
        if *self.status_tx.borrow() != ProcessStatus::Stopped {
            tracing::debug!("Engine already running");
            return Ok(());
        }
        self.status_tx.send_replace(ProcessStatus::Starting);
        *self.last_totals.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %self.config.command, error = %e, "Failed to spawn engine");
                self.status_tx.send_replace(ProcessStatus::Stopped);
                return Err(e.into());
            }
        };
        tracing::info!(command = %self.config.command, pid = ?child.id(), "Engine process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_output(stdout, self.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_output(stderr, self.logs.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(kill_tx);
        tokio::spawn(supervise(child, kill_rx, self.status_tx.clone()));

        if let Err(e) = self.wait_ready().await {
            tracing::error!(error = %e, "Engine controller did not become ready");
            self.kill();
            return Err(e);
        }

        self.status_tx.send_if_modified(|status| {
            if *status == ProcessStatus::Starting {
                *status = ProcessStatus::Started;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        if self.kill() {
            self.status_tx.send_if_modified(|status| {
                if *status == ProcessStatus::Stopped {
                    false
                } else {
                    *status = ProcessStatus::Stopping;
                    true
                }
            });
            tracing::info!("Engine stop requested");
        }
        Ok(())
    }

    fn current_status(&self) -> ProcessStatus {
        *self.status_tx.borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    async fn load_profile(&self, path: &Path) -> EngineResult<()> {
        self.ensure_running()?;
        let mut url = self.endpoint(&["configs"]);
        url.query_pairs_mut().append_pair("force", "true");

        let response = self
            .request(Method::PUT, url)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ControllerMessage>(&body)
            .map(|m| m.message)
            .unwrap_or_else(|_| format!("controller returned {status}"));
        Err(EngineError::Load(message))
    }

    async fn set_selected_proxy(&self, group: &str, proxy: &str) -> EngineResult<bool> {
        self.ensure_running()?;
        let response = self
            .request(Method::PUT, self.endpoint(&["proxies", group]))
            .json(&serde_json::json!({ "name": proxy }))
            .send()
            .await?;

        let accepted = response.status().is_success();
        if !accepted {
            tracing::debug!(group = %group, proxy = %proxy, status = %response.status(), "Proxy selection rejected");
        }
        Ok(accepted)
    }

    async fn poll_traffic(&self) -> EngineResult<Traffic> {
        let totals = self.fetch_totals().await?;
        let now = Instant::now();
        let previous = self
            .last_totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((now, totals));

        Ok(match previous {
            Some((at, prev)) => {
                let secs = now.duration_since(at).as_secs_f64().max(0.001);
                Traffic {
                    up: (totals.up.saturating_sub(prev.up) as f64 / secs) as u64,
                    down: (totals.down.saturating_sub(prev.down) as f64 / secs) as u64,
                }
            }
            None => Traffic::default(),
        })
    }

    async fn poll_bandwidth(&self) -> EngineResult<Bandwidth> {
        let totals = self.fetch_totals().await?;
        Ok(Bandwidth {
            total: totals.up.saturating_add(totals.down),
        })
    }

    async fn poll_logs(&self) -> EngineResult<Vec<LogLine>> {
        self.ensure_running()?;
        Ok(self.logs.lock().unwrap_or_else(PoisonError::into_inner).drain())
    }
}

async fn supervise(mut child: Child, kill_rx: oneshot::Receiver<()>, status_tx: watch::Sender<ProcessStatus>) {
    tokio::select! {
        exit = child.wait() => match exit {
            Ok(code) => tracing::warn!(status = %code, "Engine process exited"),
            Err(e) => tracing::error!(error = %e, "Failed to wait for engine process"),
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "Failed to kill engine process");
            }
            tracing::info!("Engine process killed");
        }
    }
    status_tx.send_replace(ProcessStatus::Stopped);
}

async fn capture_output<R: AsyncRead + Unpin>(reader: R, logs: Arc<Mutex<LogBuffer>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        logs.lock().unwrap_or_else(PoisonError::into_inner).push(parse_log_line(&line));
    }
}

/// Parse `time="…" level=info msg="…"` style output; anything else is kept
/// verbatim at info level.
fn parse_log_line(raw: &str) -> LogLine {
    let level = raw
        .split_whitespace()
        .find_map(|token| token.strip_prefix("level="))
        .map(|value| match value.trim_matches('"') {
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" | "fatal" | "panic" => LogLevel::Error,
            "silent" => LogLevel::Silent,
            _ => LogLevel::Info,
        })
        .unwrap_or(LogLevel::Info);

    let message = raw
        .find("msg=\"")
        .map(|start| quoted_value(&raw[start + 5..]))
        .unwrap_or_else(|| raw.to_string());

    LogLine { level, message }
}

/// Unescape a quoted value up to its closing quote. An unterminated value
/// runs to the end of the line.
fn quoted_value(rest: &str) -> String {
    let mut value = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(escaped) => value.push(escaped),
                None => value.push('\\'),
            },
            _ => value.push(c),
        }
    }
    value
}
