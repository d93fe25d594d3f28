/// Remote file service (the NAS behind rclone) and the catalog built on it.
use async_trait::async_trait;
use deck_proto::config::RemoteConfig;
use deck_proto::platform::has_audio_extension;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Black-box remote storage.  May fail at any time; no partial resume.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<String>>;

    /// Copy `filename` to `dest`.  The error is a single human-readable reason.
    async fn fetch(&self, filename: &str, dest: &Path) -> Result<(), String>;

    async fn size(&self, filename: &str) -> anyhow::Result<u64>;

    /// Copy every audio file the remote holds into `cache_dir`, skipping files
    /// already there.  The error is a single human-readable reason.
    async fn sync_all(&self, cache_dir: &Path) -> Result<(), String>;
}

// ── rclone ────────────────────────────────────────────────────────────────────

pub struct RcloneRemote {
    binary: String,
    remote: String,
    extensions: Vec<String>,
    command_timeout: Duration,
}

impl RcloneRemote {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            binary: config.rclone_binary.clone(),
            remote: config.remote.trim_end_matches('/').to_string(),
            extensions: config.extensions.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs.max(1)),
        }
    }

    fn remote_path(&self, filename: &str) -> String {
        format!("{}/{}", self.remote, filename)
    }

    async fn run_captured(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!("rclone {:?}", args);
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(&self.binary).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("rclone {} timed out", args[0]))??;

        if !output.status.success() {
            anyhow::bail!(
                "rclone {} failed: {}",
                args[0],
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteStore for RcloneRemote {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let stdout = self
            .run_captured(&["lsf", "--files-only", &self.remote])
            .await?;
        Ok(filter_audio(stdout.lines().map(str::to_string), &self.extensions))
    }

    async fn fetch(&self, filename: &str, dest: &Path) -> Result<(), String> {
        let src = self.remote_path(filename);
        info!("rclone: copying {} → {:?}", src, dest);
        let output = Command::new(&self.binary)
            .arg("copyto")
            .arg(&src)
            .arg(dest)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run rclone: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "rclone copyto {} failed: {}",
                filename,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn size(&self, filename: &str) -> anyhow::Result<u64> {
        let stdout = self
            .run_captured(&["size", "--json", &self.remote_path(filename)])
            .await?;
        parse_size_json(&stdout)
    }

    async fn sync_all(&self, cache_dir: &Path) -> Result<(), String> {
        let args = sync_args(&self.remote, cache_dir, &self.extensions);
        info!("rclone: syncing {} → {:?}", self.remote, cache_dir);
        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run rclone: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "rclone copy failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// `rclone copy` arguments for a full remote-to-cache sync.
fn sync_args(remote: &str, cache_dir: &Path, extensions: &[String]) -> Vec<String> {
    let mut args = vec![
        "copy".to_string(),
        remote.to_string(),
        cache_dir.to_string_lossy().into_owned(),
        "--ignore-case".to_string(),
    ];
    for ext in extensions {
        args.push("--include".to_string());
        args.push(format!("*.{}", ext.trim_start_matches('.')));
    }
    args
}

fn parse_size_json(stdout: &str) -> anyhow::Result<u64> {
    let val: serde_json::Value = serde_json::from_str(stdout.trim())?;
    val.get("bytes")
        .and_then(|b| b.as_u64())
        .ok_or_else(|| anyhow::anyhow!("rclone size: no bytes field"))
}

fn filter_audio(names: impl Iterator<Item = String>, extensions: &[String]) -> Vec<String> {
    let mut files: Vec<String> = names
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && has_audio_extension(n, extensions))
        .collect();
    files.sort();
    files.dedup();
    files
}

// ── catalog ───────────────────────────────────────────────────────────────────

/// Audio files already present in the cache directory, sorted.
pub fn list_local_cache(dir: &Path, extensions: &[String]) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!("cache dir {:?} unreadable: {}", dir, e);
            return Vec::new();
        }
    };
    let names = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string));
    filter_audio(names, extensions)
}

/// Ordered list of playable filenames.  Re-fetched for every decision since
/// the remote may change between calls.
pub struct Catalog {
    remote: std::sync::Arc<dyn RemoteStore>,
    cache_dir: PathBuf,
    extensions: Vec<String>,
}

impl Catalog {
    pub fn new(
        remote: std::sync::Arc<dyn RemoteStore>,
        cache_dir: PathBuf,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            remote,
            cache_dir,
            extensions,
        }
    }

    /// Remote listing, falling back to the local cache when the remote is
    /// unreachable or empty.
    pub async fn snapshot(&self) -> Vec<String> {
        match self.remote.list().await {
            Ok(files) if !files.is_empty() => return files,
            Ok(_) => debug!("catalog: remote listing empty, using local cache"),
            Err(e) => warn!("catalog: remote listing failed, using local cache: {}", e),
        }
        list_local_cache(&self.cache_dir, &self.extensions)
    }

    /// Case-insensitive substring search; an empty query returns everything.
    pub async fn search(&self, query: &str) -> Vec<String> {
        let files = self.snapshot().await;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return files;
        }
        files
            .into_iter()
            .filter(|f| f.to_lowercase().contains(&query))
            .collect()
    }
}
