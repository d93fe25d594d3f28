//! Scripted stand-ins for mpv and the remote store.

use crate::mpv::{IpcError, PlayerControl};
use crate::remote::RemoteStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory mpv.  Property reads come from a table that tests script
/// directly; commands are recorded and applied to the table the way mpv would.
#[derive(Default)]
pub struct FakePlayer {
    properties: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<Value>>,
    offline: AtomicBool,
    /// Number of upcoming `pause=false` writes mpv will silently ignore.
    sticky_pause: AtomicU32,
}

impl FakePlayer {
    pub fn new() -> Self {
        let player = Self::default();
        player.set("pause", json!(true));
        player.set("volume", json!(100.0));
        player.set("idle-active", json!(true));
        player.set("eof-reached", json!(false));
        player.set("playlist", json!([]));
        player
    }

    pub fn set(&self, name: &str, value: Value) {
        self.failing.lock().unwrap().remove(name);
        self.properties
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) {
        self.properties.lock().unwrap().remove(name);
    }

    /// Make reads of `name` fail with `reason` until the next `set`.
    pub fn fail(&self, name: &str, reason: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(name.to_string(), reason.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn ignore_unpause(&self, times: u32) {
        self.sticky_pause.store(times, Ordering::SeqCst);
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties.lock().unwrap().get(name).cloned()
    }

    /// Every command except property reads, in order.
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    /// Volume values written through `set_property volume`.
    pub fn volume_writes(&self) -> Vec<u64> {
        self.commands()
            .iter()
            .filter(|c| c[0] == "set_property" && c[1] == "volume")
            .filter_map(|c| c[2].as_u64())
            .collect()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.commands().iter().filter(|c| c[0] == verb).count()
    }
}

#[async_trait]
impl PlayerControl for FakePlayer {
    async fn send_command(&self, command: Value) -> Result<Value, IpcError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IpcError::SocketMissing("/fake/mpv.sock".into()));
        }
        let verb = command[0].as_str().unwrap_or_default().to_string();
        if verb == "get_property" {
            let name = command[1].as_str().unwrap_or_default();
            if let Some(reason) = self.failing.lock().unwrap().get(name) {
                return Err(IpcError::Player(reason.clone()));
            }
            return self
                .properties
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| IpcError::Player("property unavailable".into()));
        }

        self.commands.lock().unwrap().push(command.clone());
        match verb.as_str() {
            "loadfile" => {
                let path = command[1].as_str().unwrap_or_default().to_string();
                let name = Path::new(&path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                self.set("path", json!(path));
                self.set("filename", json!(name));
                self.set("idle-active", json!(false));
                self.set("eof-reached", json!(false));
                self.set("time-pos", json!(0.0));
                self.remove("duration");
            }
            "set_property" => {
                let name = command[1].as_str().unwrap_or_default();
                if name == "pause"
                    && command[2] == json!(false)
                    && self.sticky_pause.load(Ordering::SeqCst) > 0
                {
                    self.sticky_pause.fetch_sub(1, Ordering::SeqCst);
                } else {
                    self.set(name, command[2].clone());
                }
            }
            "cycle" => {
                let paused = self
                    .property("pause")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.set("pause", json!(!paused));
            }
            "stop" => {
                self.remove("filename");
                self.remove("path");
                self.set("idle-active", json!(true));
            }
            _ => {}
        }
        Ok(Value::Null)
    }
}

/// In-memory NAS.
#[derive(Default)]
pub struct FakeRemote {
    files: Mutex<Vec<String>>,
    unreachable: bool,
    failures: Mutex<HashMap<String, String>>,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl FakeRemote {
    pub fn with_files(files: &[&str]) -> Self {
        Self {
            files: Mutex::new(files.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn set_files(&self, files: &[&str]) {
        *self.files.lock().unwrap() = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn fail_fetch(&self, filename: &str, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), reason.to_string());
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn content(filename: &str) -> Vec<u8> {
        format!("fake audio for {}", filename).into_bytes()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        if self.unreachable {
            anyhow::bail!("remote unreachable");
        }
        Ok(self.files.lock().unwrap().clone())
    }

    async fn fetch(&self, filename: &str, dest: &Path) -> Result<(), String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failures.lock().unwrap().get(filename) {
            return Err(reason.clone());
        }
        if self.unreachable || !self.files.lock().unwrap().iter().any(|f| f == filename) {
            return Err(format!("{} not found on remote", filename));
        }
        tokio::fs::write(dest, Self::content(filename))
            .await
            .map_err(|e| e.to_string())
    }

    async fn size(&self, filename: &str) -> anyhow::Result<u64> {
        if self.unreachable {
            anyhow::bail!("remote unreachable");
        }
        Ok(Self::content(filename).len() as u64)
    }

    async fn sync_all(&self, cache_dir: &Path) -> Result<(), String> {
        if self.unreachable {
            return Err("remote unreachable".to_string());
        }
        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| e.to_string())?;
        let files = self.files.lock().unwrap().clone();
        for filename in files {
            let dest = cache_dir.join(&filename);
            if !dest.is_file() {
                tokio::fs::write(&dest, Self::content(&filename))
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}
