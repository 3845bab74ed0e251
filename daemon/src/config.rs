use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::event::DaemonEvent;
use crate::hotkey::{BindingParseError, HotkeyBinding};
use crate::keys::ModifierState;
use crate::overlay::Appearance;

pub const MIN_OPACITY_PERCENT: u8 = 5;
pub const MAX_OPACITY_PERCENT: u8 = 90;
pub const DEFAULT_OPACITY_PERCENT: u8 = 30;
pub const DEFAULT_HOTKEY: &str = "ctrl+b";
pub const DEFAULT_OVERLAY_COLOR: &str = "#1B5E20";
pub const DEFAULT_OVERLAY_RGB: (u8, u8, u8) = (0x1B, 0x5E, 0x20);

/// Root configuration structure, deserialized from `<config dir>/PawGate/config.toml`.
///
/// Values are kept as written; [`Settings::resolve`] validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Lock/unlock combination, e.g. `"ctrl+shift+l"`.
    #[serde(default)]
    pub hotkey: Option<String>,
    /// Overlay opacity in percent.  Clamped to [5, 90].
    #[serde(default = "default_opacity")]
    pub overlay_opacity: i64,
    #[serde(default = "default_notifications")]
    pub notifications_enabled: bool,
    /// Overlay colour as `#RRGGBB`.
    #[serde(default = "default_overlay_color")]
    pub overlay_color: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hotkey: Some(DEFAULT_HOTKEY.to_string()),
            overlay_opacity: i64::from(DEFAULT_OPACITY_PERCENT),
            notifications_enabled: true,
            overlay_color: DEFAULT_OVERLAY_COLOR.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no hotkey configured")]
    MissingHotkey,

    #[error("hotkey '{value}' is malformed: {source}")]
    MalformedHotkey {
        value: String,
        #[source]
        source: BindingParseError,
    },
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `None` once registration of the configured binding has failed.
    pub hotkey: Option<HotkeyBinding>,
    pub appearance: Appearance,
    pub notifications_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hotkey: Some(default_binding()),
            appearance: Appearance::default(),
            notifications_enabled: true,
        }
    }
}

impl Settings {
    /// Validates `config`.  A missing or malformed hotkey falls back to
    /// [`DEFAULT_HOTKEY`] and the problem is returned alongside for logging.
    pub fn resolve(config: &Config) -> (Self, Option<ConfigError>) {
        let (hotkey, problem) = match config.hotkey.as_deref().map(str::trim) {
            None | Some("") => (default_binding(), Some(ConfigError::MissingHotkey)),
            Some(raw) => match raw.parse::<HotkeyBinding>() {
                Ok(binding) => (binding, None),
                Err(source) => (
                    default_binding(),
                    Some(ConfigError::MalformedHotkey { value: raw.to_string(), source }),
                ),
            },
        };

        let color = parse_color(&config.overlay_color).unwrap_or_else(|| {
            warn!(value = %config.overlay_color, "invalid overlay colour; using default");
            DEFAULT_OVERLAY_RGB
        });

        let settings = Self {
            hotkey: Some(hotkey),
            appearance: Appearance {
                opacity_percent: clamp_opacity(config.overlay_opacity),
                color,
            },
            notifications_enabled: config.notifications_enabled,
        };
        (settings, problem)
    }
}

/// The built-in Ctrl+B binding.
pub const fn default_binding() -> HotkeyBinding {
    HotkeyBinding::new(
        ModifierState { ctrl: true, alt: false, shift: false, win: false },
        'B' as u32,
    )
}

pub fn clamp_opacity(percent: i64) -> u8 {
    percent.clamp(i64::from(MIN_OPACITY_PERCENT), i64::from(MAX_OPACITY_PERCENT)) as u8
}

/// Parses `#RRGGBB` (the `#` is optional).
pub fn parse_color(value: &str) -> Option<(u8, u8, u8)> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

/// Loads the config file at `path`.  If the file does not exist, writes the
/// defaults there for the user to edit and returns `Config::default()`.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        let config = Config::default();
        match save_config(path, &config) {
            Ok(()) => info!(path = %path.display(), "wrote default config"),
            Err(e) => warn!(error = %format!("{e:#}"), "could not write default config; using defaults"),
        }
        return Ok(config);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!(path = %path.display(), "config path has no parent directory");
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        error!(dir = %watch_dir.display(), error = %e, "failed to create config directory");
        return;
    }
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!(dir = %watch_dir.display(), error = %e, "failed to watch config directory");
        return;
    }
    info!(path = %path.display(), "watching config file");

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %format!("{e:#}"), "failed to reload config; keeping current settings"),
            }
        }
    }
}

fn default_opacity() -> i64 {
    i64::from(DEFAULT_OPACITY_PERCENT)
}

fn default_notifications() -> bool {
    true
}

fn default_overlay_color() -> String {
    DEFAULT_OVERLAY_COLOR.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn config_default_values() {
        let c = Config::default();
        assert_eq!(c.hotkey.as_deref(), Some(DEFAULT_HOTKEY));
        assert_eq!(c.overlay_opacity, 30);
        assert!(c.notifications_enabled);
        assert_eq!(c.overlay_color, DEFAULT_OVERLAY_COLOR);
    }

    #[test]
    fn default_binding_matches_default_hotkey_string() {
        assert_eq!(DEFAULT_HOTKEY.parse::<HotkeyBinding>().unwrap(), default_binding());
    }

    #[test]
    fn default_config_resolves_cleanly() {
        let (settings, problem) = Settings::resolve(&Config::default());
        assert!(problem.is_none());
        assert_eq!(settings, Settings::default());
    }

    // ── opacity ───────────────────────────────────────────────────────────────

    #[test]
    fn opacity_above_max_is_clamped() {
        let config = Config { overlay_opacity: 150, ..Config::default() };
        let (settings, _) = Settings::resolve(&config);
        assert_eq!(settings.appearance.opacity_percent, MAX_OPACITY_PERCENT);
    }

    #[test]
    fn opacity_below_min_is_clamped() {
        assert_eq!(clamp_opacity(0), MIN_OPACITY_PERCENT);
        assert_eq!(clamp_opacity(-40), MIN_OPACITY_PERCENT);
    }

    #[test]
    fn opacity_at_exact_min_and_max() {
        assert_eq!(clamp_opacity(5), 5);
        assert_eq!(clamp_opacity(90), 90);
        assert_eq!(clamp_opacity(55), 55);
    }

    // ── hotkey ────────────────────────────────────────────────────────────────

    #[test]
    fn absent_hotkey_falls_back_to_default() {
        let config = Config { hotkey: None, ..Config::default() };
        let (settings, problem) = Settings::resolve(&config);
        assert!(matches!(problem, Some(ConfigError::MissingHotkey)));
        assert_eq!(settings.hotkey, Some(default_binding()));
    }

    #[test]
    fn blank_hotkey_counts_as_missing() {
        let config = Config { hotkey: Some("   ".into()), ..Config::default() };
        let (_, problem) = Settings::resolve(&config);
        assert!(matches!(problem, Some(ConfigError::MissingHotkey)));
    }

    #[test]
    fn malformed_hotkey_falls_back_to_default() {
        let config = Config { hotkey: Some("ctrl+nonsense".into()), ..Config::default() };
        let (settings, problem) = Settings::resolve(&config);
        match problem {
            Some(ConfigError::MalformedHotkey { value, source }) => {
                assert_eq!(value, "ctrl+nonsense");
                assert_eq!(source, BindingParseError::UnknownKey("nonsense".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(settings.hotkey, Some(default_binding()));
    }

    #[test]
    fn valid_hotkey_is_used() {
        let config = Config { hotkey: Some("ctrl+shift+l".into()), ..Config::default() };
        let (settings, problem) = Settings::resolve(&config);
        assert!(problem.is_none());
        assert_eq!(settings.hotkey.unwrap().to_string(), "Ctrl+Shift+L");
    }

    // ── colour ────────────────────────────────────────────────────────────────

    #[test]
    fn parse_color_accepts_hex_with_or_without_hash() {
        assert_eq!(parse_color("#1B5E20"), Some((0x1B, 0x5E, 0x20)));
        assert_eq!(parse_color("ff8800"), Some((0xFF, 0x88, 0x00)));
    }

    #[test]
    fn parse_color_rejects_garbage() {
        for bad in ["", "#12345", "#1234567", "#GGGGGG", "green", "#1B5E2é"] {
            assert_eq!(parse_color(bad), None, "accepted {bad:?}");
        }
    }

    #[test]
    fn invalid_color_falls_back_to_forest_green() {
        let config = Config { overlay_color: "not-a-colour".into(), ..Config::default() };
        let (settings, _) = Settings::resolve(&config);
        assert_eq!(settings.appearance.color, DEFAULT_OVERLAY_RGB);
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config.hotkey.as_deref(), Some(DEFAULT_HOTKEY));
        assert_eq!(config.overlay_opacity, 30);
    }

    #[test]
    fn load_or_default_writes_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PawGate").join("config.toml");
        load_or_default(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("hotkey = \"ctrl+b\""), "got {written}");
        let reloaded = load_or_default(&path).unwrap();
        assert_eq!(reloaded.hotkey.as_deref(), Some(DEFAULT_HOTKEY));
        assert_eq!(reloaded.overlay_opacity, 30);
        assert_eq!(reloaded.overlay_color, DEFAULT_OVERLAY_COLOR);
    }

    #[test]
    fn load_or_default_survives_unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let config = load_or_default(&blocker.join("config.toml")).unwrap();
        assert_eq!(config.hotkey.as_deref(), Some(DEFAULT_HOTKEY));
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let (_dir, path) = write_config(
            r##"
hotkey = "ctrl+alt+k"
overlay_opacity = 45
notifications_enabled = false
overlay_color = "#336699"
"##,
        );
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.hotkey.as_deref(), Some("ctrl+alt+k"));
        assert_eq!(config.overlay_opacity, 45);
        assert!(!config.notifications_enabled);
        assert_eq!(config.overlay_color, "#336699");
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let (_dir, path) = write_config("overlay_opacity = 60\n");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.overlay_opacity, 60);
        assert!(config.notifications_enabled);
        assert_eq!(config.overlay_color, DEFAULT_OVERLAY_COLOR);
        // A file without a hotkey key is a missing hotkey, not the default.
        assert!(config.hotkey.is_none());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not valid toml ][[[");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn out_of_range_opacity_in_file_is_clamped() {
        let (_dir, path) = write_config("hotkey = \"ctrl+b\"\noverlay_opacity = 150\n");
        let (settings, problem) = Settings::resolve(&load_or_default(&path).unwrap());
        assert!(problem.is_none());
        assert_eq!(settings.appearance.opacity_percent, 90);
    }
}
