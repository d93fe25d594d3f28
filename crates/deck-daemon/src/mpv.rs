/// mpv control-socket client.
///
/// Every call is one-shot: connect, write one JSON line, read until the reply
/// carrying our `request_id` arrives (mpv may interleave unsolicited event
/// lines), close.  The whole exchange is bounded by a hard timeout.
///
/// mpv is assumed to fail silently and often.  Property reads therefore never
/// return an error: a failed read yields a `PropertyReply` holding the typed
/// default for that property and `QueryStatus::Failed`.  Callers must treat
/// such a value as unknown and never write it into the State Store.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Key in `af-metadata/meter` carrying the overall RMS level in dBFS.
pub const METER_RMS_KEY: &str = "lavfi.astats.Overall.RMS_level";

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("mpv socket not found at {0}")]
    SocketMissing(PathBuf),
    #[error("mpv IPC timeout after {0:?}")]
    Timeout(Duration),
    #[error("malformed mpv reply: {0}")]
    Malformed(String),
    #[error("mpv error: {0}")]
    Player(String),
    #[error("mpv IPC I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    Success,
    Failed(String),
}

/// Result of a property read.  `value` is always usable; `status` says
/// whether it is real.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyReply {
    pub value: Value,
    pub status: QueryStatus,
}

impl PropertyReply {
    pub fn success(value: Value) -> Self {
        Self {
            value,
            status: QueryStatus::Success,
        }
    }

    pub fn failed(name: &str, reason: impl Into<String>) -> Self {
        Self {
            value: typed_default(name),
            status: QueryStatus::Failed(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            QueryStatus::Success => None,
            QueryStatus::Failed(reason) => Some(reason),
        }
    }

    /// The value, but only if the query succeeded.
    pub fn known(&self) -> Option<&Value> {
        self.is_success().then_some(&self.value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.known()?.as_bool()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.known()?.as_f64()
    }

    /// Non-empty string value of a successful query.
    pub fn as_str(&self) -> Option<&str> {
        self.known()?.as_str().filter(|s| !s.trim().is_empty())
    }
}

/// Fallback value reported for `name` when mpv cannot be asked.
pub fn typed_default(name: &str) -> Value {
    match name {
        "filename" | "path" | "media-title" => json!(""),
        "volume" => json!(100),
        "time-pos" | "duration" | "percent-pos" | "playback-time" | "time-remaining" => json!(0.0),
        "pause" | "idle-active" | "eof-reached" | "core-idle" | "mute" => json!(false),
        "playlist" => json!([]),
        "af-metadata/meter" => json!({}),
        _ => Value::Null,
    }
}

/// The seam between the engine and the external player.
#[async_trait]
pub trait PlayerControl: Send + Sync {
    /// Send one command, e.g. `["loadfile", "/x.mp3", "replace"]`, and return
    /// the reply's `data` field.
    async fn send_command(&self, command: Value) -> Result<Value, IpcError>;

    async fn get_property(&self, name: &str) -> PropertyReply {
        match self.send_command(json!(["get_property", name])).await {
            Ok(Value::Null) => PropertyReply::failed(name, "property returned null"),
            Ok(data) => PropertyReply::success(data),
            Err(e) => {
                debug!("mpv: get_property {} failed: {}", name, e);
                PropertyReply::failed(name, e.to_string())
            }
        }
    }

    async fn load_file(&self, path: &Path) -> Result<(), IpcError> {
        let path = path.to_string_lossy();
        self.send_command(json!(["loadfile", path, "replace"])).await?;
        Ok(())
    }

    async fn set_pause(&self, paused: bool) -> Result<(), IpcError> {
        self.send_command(json!(["set_property", "pause", paused]))
            .await?;
        Ok(())
    }

    async fn cycle_pause(&self) -> Result<(), IpcError> {
        self.send_command(json!(["cycle", "pause"])).await?;
        Ok(())
    }

    async fn set_volume(&self, volume: u8) -> Result<(), IpcError> {
        self.send_command(json!(["set_property", "volume", volume.min(100)]))
            .await?;
        Ok(())
    }

    async fn seek_to(&self, secs: f64) -> Result<(), IpcError> {
        self.send_command(json!(["seek", secs, "absolute"])).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), IpcError> {
        self.send_command(json!(["stop"])).await?;
        Ok(())
    }

    /// Install the lavfi astats filter so `af-metadata/meter` reports RMS
    /// levels.  Replaces any previous filter graph, so safe to repeat.
    async fn install_meter_filter(&self) {
        let filter = json!([{
            "name": "lavfi",
            "label": "meter",
            "params": { "graph": "astats=metadata=1:reset=1" }
        }]);
        match self.send_command(json!(["set_property", "af", filter])).await {
            Ok(_) => debug!("mpv: astats meter filter installed"),
            Err(e) => debug!("mpv: failed to set astats filter: {}", e),
        }
    }
}

/// Parse the overall RMS level out of an `af-metadata/meter` value.
pub fn meter_rms_db(meter: &Value) -> Option<f64> {
    let raw = meter.get(METER_RMS_KEY)?;
    match raw {
        Value::String(s) => match s.trim() {
            "-inf" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        },
        other => other.as_f64(),
    }
}

// ── unix-socket client ────────────────────────────────────────────────────────

pub struct MpvClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl MpvClient {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    async fn exchange(&self, req_id: u64, line: &str) -> Result<Value, IpcError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut buf = String::new();
        loop {
            buf.clear();
            if reader.read_line(&mut buf).await? == 0 {
                return Err(IpcError::Malformed(
                    "connection closed before reply".to_string(),
                ));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let val: Value = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::Malformed(format!("{}: {}", e, trimmed)))?;

            match val.get("request_id").and_then(Value::as_u64) {
                Some(id) if id == req_id => return parse_reply(val),
                Some(id) => debug!("mpv: skipping reply for req={}", id),
                None => debug!("mpv: skipping event {}", trimmed),
            }
        }
    }
}

/// Interpret one reply envelope: `{"data": ..}` or `{"error": ..}`.
fn parse_reply(mut val: Value) -> Result<Value, IpcError> {
    match val.get("error").and_then(Value::as_str) {
        None | Some("success") => {}
        Some(err) => return Err(IpcError::Player(err.to_string())),
    }
    if !val.is_object() {
        return Err(IpcError::Malformed(val.to_string()));
    }
    Ok(val.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}

#[async_trait]
impl PlayerControl for MpvClient {
    async fn send_command(&self, command: Value) -> Result<Value, IpcError> {
        if !self.socket_path.exists() {
            return Err(IpcError::SocketMissing(self.socket_path.clone()));
        }
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut line = serde_json::to_string(&msg).map_err(|e| IpcError::Malformed(e.to_string()))?;
        line.push('\n');

        debug!("mpv: send req={} {}", req_id, line.trim());
        tokio::time::timeout(self.timeout, self.exchange(req_id, &line))
            .await
            .map_err(|_| IpcError::Timeout(self.timeout))?
    }
}

// ── optional child process ────────────────────────────────────────────────────

/// An idle mpv we launched ourselves (`[mpv] spawn = true`).
pub struct MpvProcess {
    child: Option<tokio::process::Child>,
}

impl MpvProcess {
    pub async fn spawn(binary: &str, socket_path: &Path, volume: u8) -> anyhow::Result<Self> {
        let _ = tokio::fs::remove_file(socket_path).await;

        info!("mpv: spawning {} with socket {:?}", binary, socket_path);
        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(deck_proto::platform::mpv_socket_arg(socket_path))
            .arg(format!("--volume={}", volume.min(100)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        for _ in 0..50 {
            if socket_path.exists() {
                return Ok(Self { child: Some(child) });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("mpv IPC socket did not appear at {:?}", socket_path)
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("mpv: failed to kill child: {}", e);
            }
        }
    }
}
