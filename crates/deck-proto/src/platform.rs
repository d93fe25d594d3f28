use std::path::PathBuf;

const APP_DIR: &str = "deck";

/// Default mpv IPC socket.  Matches the `--input-ipc-server` argument used
/// when the daemon spawns mpv itself.
pub fn mpv_socket_path() -> PathBuf {
    std::env::temp_dir().join("deck-mpv.sock")
}

pub fn mpv_socket_arg(path: &std::path::Path) -> String {
    format!("--input-ipc-server={}", path.display())
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/deck/ (XDG layout on every unix, including macOS)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join(APP_DIR)
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
}

pub fn cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join(APP_DIR)
}

/// Audio extensions considered playable when listing a directory or remote.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "aac", "m4a", "wav", "mp4"];

/// True when `name` ends with one of `extensions` (case-insensitive).
pub fn has_audio_extension(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    match lower.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext)),
        _ => false,
    }
}
