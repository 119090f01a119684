// Settings. Grounded on
// `src/server/config.rs`'s layering pattern (`WprsdArgs::load_config`:
// default, overlaid by config file, overlaid by CLI args), but using
// `clap::Parser` instead of the teacher's `bpaf` (the teacher's current
// backends derive from `clap`; `bpaf` is the stale arg parser — see
// DESIGN.md) and a plain `key=value` config file instead of `ron`, since
// the wire format here is explicitly simple lines, not a serde format.

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;

use crate::prelude::*;

const DEFAULT_CONFIG_FILE: &str = "/etc/guacamole/xorg.conf";

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Captures an X11 display and publishes frames to a display sink.")]
pub struct Args {
    /// X display string, e.g. `:0`. Defaults to `$DISPLAY`.
    #[arg(long)]
    pub display: Option<String>,

    /// Output width; 0 matches the capture width.
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height; 0 matches the capture height.
    #[arg(long)]
    pub height: Option<u32>,

    /// Target frames per second.
    #[arg(long)]
    pub fps: Option<u32>,

    /// Forces the GetImage fallback even if MIT-SHM is available.
    #[arg(long)]
    pub disable_xshm: bool,

    /// Overrides the config file path (`$GUAC_XORG_CONFIG` otherwise).
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub display: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub disable_xshm: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display: None,
            width: 0,
            height: 0,
            fps: 30,
            disable_xshm: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PartialSettings {
    display: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    disable_xshm: Option<bool>,
}

impl PartialSettings {
    /// Overlays `self` onto `base`: fields `self` set win, everything else
    /// keeps `base`'s value.
    fn merge_over(self, base: Settings) -> Settings {
        Settings {
            display: self.display.or(base.display),
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            fps: self.fps.unwrap_or(base.fps),
            disable_xshm: self.disable_xshm.unwrap_or(base.disable_xshm),
        }
    }
}

fn config_file_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(PathBuf::from)
        .or_else(|| env::var_os("GUAC_XORG_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Parses `key=value` lines: `#`/`;` comments, blank lines, and
/// surrounding whitespace around keys/values are all ignored.
fn parse_key_value(contents: &str) -> PartialSettings {
    let mut settings = PartialSettings::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "display" => settings.display = Some(value.to_string()),
            "width" => settings.width = value.parse().ok(),
            "height" => settings.height = value.parse().ok(),
            "fps" => settings.fps = value.parse().ok(),
            other => warn!(key = other, "unrecognised config file key; ignoring"),
        }
    }
    settings
}

fn read_config_file(path: &Path) -> PartialSettings {
    match fs::read_to_string(path) {
        Ok(contents) => parse_key_value(&contents),
        Err(err) => {
            debug!(?path, ?err, "config file not read; falling back to env/args/defaults");
            PartialSettings::default()
        }
    }
}

/// `GUAC_XORG_DISABLE_XSHM`-style boolean: any non-empty, non-`"0"` value
/// counts as set.
fn bool_env_is_set(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

fn env_settings() -> PartialSettings {
    PartialSettings {
        display: env::var("GUAC_XORG_DISPLAY").ok(),
        width: env::var("GUAC_XORG_WIDTH").ok().and_then(|v| v.parse().ok()),
        height: env::var("GUAC_XORG_HEIGHT").ok().and_then(|v| v.parse().ok()),
        fps: env::var("GUAC_XORG_FPS").ok().and_then(|v| v.parse().ok()),
        disable_xshm: None,
    }
}

/// `GUAC_XORG_DISABLE_XSHM` is consumed independently of the
/// display/width/height/fps layering since it isn't part of the
/// configuration-surface table, only an environment switch.
pub fn disable_xshm_from_env() -> bool {
    env::var("GUAC_XORG_DISABLE_XSHM")
        .map(|v| bool_env_is_set(&v))
        .unwrap_or(false)
}

impl Args {
    /// Builds the effective [`Settings`]: built-in default, overlaid by the
    /// config file, overlaid by environment variables, overlaid by
    /// explicit CLI args, applied outside-in.
    pub fn load(self) -> Settings {
        let file_path = config_file_path(self.config_file.as_deref());
        let mut settings = read_config_file(&file_path).merge_over(Settings::default());
        settings = env_settings().merge_over(settings);

        let cli = PartialSettings {
            display: self.display,
            width: self.width,
            height: self.height,
            fps: self.fps,
            disable_xshm: self.disable_xshm.then_some(true),
        };
        settings = cli.merge_over(settings);

        if disable_xshm_from_env() {
            settings.disable_xshm = true;
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parser_ignores_comments_and_blank_lines() {
        let parsed = parse_key_value("# comment\n; also comment\n\nwidth=800\nheight=600\n");
        assert_eq!(parsed.width, Some(800));
        assert_eq!(parsed.height, Some(600));
    }

    #[test]
    fn key_value_parser_tolerates_whitespace() {
        let parsed = parse_key_value("  fps = 24  \n");
        assert_eq!(parsed.fps, Some(24));
    }

    #[test]
    fn defaults_survive_when_nothing_overrides() {
        let settings = PartialSettings::default().merge_over(Settings::default());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let base = Settings::default();
        let file = PartialSettings {
            width: Some(640),
            height: Some(480),
            ..Default::default()
        }
        .merge_over(base);
        let cli = PartialSettings {
            width: Some(1920),
            ..Default::default()
        };
        let merged = cli.merge_over(file);
        assert_eq!(merged.width, 1920);
        assert_eq!(merged.height, 480);
    }

    #[test]
    fn disable_xshm_env_treats_zero_and_empty_as_unset() {
        assert!(!bool_env_is_set("0"));
        assert!(!bool_env_is_set(""));
        assert!(bool_env_is_set("1"));
        assert!(bool_env_is_set("true"));
    }
}
