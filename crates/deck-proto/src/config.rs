use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fade: FadeConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "platform::mpv_socket_path")]
    pub socket_path: PathBuf,
    /// Hard per-call timeout for the control socket.  Values above 2000 are
    /// clamped by `ipc_timeout()`.
    #[serde(default = "default_ipc_timeout_ms")]
    pub ipc_timeout_ms: u64,
    /// Launch an idle mpv ourselves instead of attaching to a running one.
    #[serde(default)]
    pub spawn: bool,
    #[serde(default = "default_mpv_binary")]
    pub binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// rclone remote path holding the catalog, e.g. `nas:music`.
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_rclone_binary")]
    pub rclone_binary: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Upper bound for list/size calls.  Fetches are unbounded.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_ms: u64,
    #[serde(default)]
    pub auto_cache_next: bool,
    #[serde(default = "default_auto_cache_interval_secs")]
    pub auto_cache_interval_secs: u64,
}

/// Cadences and thresholds for the poller, clock and end-of-track detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_clock_interval_ms")]
    pub clock_interval_ms: u64,
    /// Consecutive unchanged-position ticks before a track without duration
    /// counts as finished.
    #[serde(default = "default_stable_ticks")]
    pub stable_ticks: u32,
    #[serde(default = "default_near_end_percent")]
    pub near_end_percent: f64,
    #[serde(default = "default_complete_percent")]
    pub complete_percent: f64,
    #[serde(default = "default_silence_db")]
    pub silence_db: f64,
    #[serde(default = "default_silence_ticks")]
    pub silence_ticks: u32,
    #[serde(default = "default_silence_min_position_secs")]
    pub silence_min_position_secs: f64,
    /// Ticks after a track change during which mpv's eof/idle flags are ignored.
    #[serde(default = "default_grace_ticks")]
    pub grace_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FadeConfig {
    #[serde(default = "default_fade_steps")]
    pub steps: u32,
    #[serde(default = "default_fade_in_ms")]
    pub fade_in_ms: u64,
    #[serde(default = "default_fade_out_ms")]
    pub fade_out_ms: u64,
    #[serde(default = "default_true")]
    pub fade_out_on_manual_advance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_display_ms")]
    pub display_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    #[serde(default = "default_timeline_file")]
    pub file: PathBuf,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            socket_path: platform::mpv_socket_path(),
            ipc_timeout_ms: default_ipc_timeout_ms(),
            spawn: false,
            binary: default_mpv_binary(),
        }
    }
}

impl MpvConfig {
    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms.clamp(1, 2000))
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            rclone_binary: default_rclone_binary(),
            extensions: default_extensions(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            progress_poll_ms: default_progress_poll_ms(),
            auto_cache_next: false,
            auto_cache_interval_secs: default_auto_cache_interval_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            clock_interval_ms: default_clock_interval_ms(),
            stable_ticks: default_stable_ticks(),
            near_end_percent: default_near_end_percent(),
            complete_percent: default_complete_percent(),
            silence_db: default_silence_db(),
            silence_ticks: default_silence_ticks(),
            silence_min_position_secs: default_silence_min_position_secs(),
            grace_ticks: default_grace_ticks(),
        }
    }
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            steps: default_fade_steps(),
            fade_in_ms: default_fade_in_ms(),
            fade_out_ms: default_fade_out_ms(),
            fade_out_on_manual_advance: true,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            display_ms: default_display_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            file: default_timeline_file(),
            max_events: default_max_events(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ipc_timeout_ms() -> u64 {
    2000
}

fn default_mpv_binary() -> String {
    "mpv".to_string()
}

fn default_remote() -> String {
    "nas:music".to_string()
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

fn default_extensions() -> Vec<String> {
    platform::AUDIO_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    platform::cache_dir().join("audio")
}

fn default_progress_poll_ms() -> u64 {
    500
}

fn default_auto_cache_interval_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_clock_interval_ms() -> u64 {
    100
}

fn default_stable_ticks() -> u32 {
    10
}

fn default_near_end_percent() -> f64 {
    95.0
}

fn default_complete_percent() -> f64 {
    99.9
}

fn default_silence_db() -> f64 {
    -60.0
}

fn default_silence_ticks() -> u32 {
    6
}

fn default_silence_min_position_secs() -> f64 {
    5.0
}

fn default_grace_ticks() -> u32 {
    2
}

fn default_fade_steps() -> u32 {
    20
}

fn default_fade_in_ms() -> u64 {
    1500
}

fn default_fade_out_ms() -> u64 {
    600
}

fn default_cooldown_ms() -> u64 {
    500
}

fn default_display_ms() -> u64 {
    3000
}

fn default_max_pending() -> usize {
    8
}

fn default_timeline_file() -> PathBuf {
    platform::data_dir().join("timeline.json")
}

fn default_max_events() -> usize {
    100
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
