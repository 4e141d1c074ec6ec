//! Configuration file loading for CLI defaults.
//!
//! The file holds `key = value` lines; strings are double-quoted and `#` starts
//! a comment. Command-line flags override file values.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use segfetch_core::EngineSettings;

/// Values read from the config file; unset keys keep engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory that receives finished files.
    pub destination_root: Option<PathBuf>,
    /// Directory for segment temp files.
    pub temp_root: Option<PathBuf>,
    /// State database path.
    pub database: Option<PathBuf>,
    /// Downloads admitted at the same time.
    pub max_concurrent_downloads: Option<u32>,
    /// Segments per download.
    pub max_segments_per_download: Option<u32>,
    /// Planner floor on segment size in bytes.
    pub min_segment_size: Option<u64>,
    /// Attempts per segment before a download fails.
    pub max_attempts: Option<u32>,
    /// Only download on unmetered links.
    pub wifi_only: Option<bool>,
    /// Progress tick period in milliseconds.
    pub progress_interval_ms: Option<u64>,
    /// Per-observer delivery timeout in milliseconds.
    pub observer_timeout_ms: Option<u64>,
    /// Pause/cancel acknowledgment timeout in milliseconds.
    pub cancel_ack_timeout_ms: Option<u64>,
}

impl FileConfig {
    /// Copies every set value onto `settings`.
    pub fn apply(&self, settings: &mut EngineSettings) {
        if let Some(root) = &self.destination_root {
            settings.destination_root.clone_from(root);
        }
        if let Some(temp) = &self.temp_root {
            settings.temp_root = Some(temp.clone());
        }
        if let Some(value) = self.max_concurrent_downloads {
            settings.max_concurrent_downloads = value;
        }
        if let Some(value) = self.max_segments_per_download {
            settings.max_segments_per_download = value;
        }
        if let Some(value) = self.min_segment_size {
            settings.min_segment_size = value;
        }
        if let Some(value) = self.max_attempts {
            settings.max_attempts = value;
        }
        if let Some(value) = self.wifi_only {
            settings.wifi_only = value;
        }
        if let Some(value) = self.progress_interval_ms {
            settings.progress_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.observer_timeout_ms {
            settings.observer_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.cancel_ack_timeout_ms {
            settings.cancel_ack_timeout = Duration::from_millis(value);
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/segfetch/config.toml`
/// 2. `$HOME/.config/segfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("segfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("segfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the default config file if it exists.
pub fn load_default_file_config() -> Result<Option<FileConfig>> {
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

/// Loads and parses a config file.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "destination_root" => {
                cfg.destination_root =
                    Some(parse_string_literal(value).with_context(context)?.into());
            }
            "temp_root" => {
                cfg.temp_root = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "database" => {
                cfg.database = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "max_concurrent_downloads" => {
                cfg.max_concurrent_downloads =
                    Some(parse_integer_u32(value).with_context(context)?);
            }
            "max_segments_per_download" => {
                cfg.max_segments_per_download =
                    Some(parse_integer_u32(value).with_context(context)?);
            }
            "min_segment_size" => {
                cfg.min_segment_size = Some(parse_integer_u64(value).with_context(context)?);
            }
            "max_attempts" => {
                cfg.max_attempts = Some(parse_integer_u32(value).with_context(context)?);
            }
            "wifi_only" => {
                cfg.wifi_only = Some(parse_boolean(value).with_context(context)?);
            }
            "progress_interval_ms" => {
                cfg.progress_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "observer_timeout_ms" => {
                cfg.observer_timeout_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "cancel_ack_timeout_ms" => {
                cfg.cancel_ack_timeout_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }

    let mut check = EngineSettings::default();
    cfg.apply(&mut check);
    check.validate().context("Invalid configuration value")?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_integer_u32(raw_value: &str) -> Result<u32> {
    let value = parse_integer_u64(raw_value)?;
    u32::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u32"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
            # engine
            destination_root = "/data/videos"
            max_concurrent_downloads = 2   # be gentle
            wifi_only = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.destination_root, Some(PathBuf::from("/data/videos")));
        assert_eq!(cfg.max_concurrent_downloads, Some(2));
        assert_eq!(cfg.wifi_only, Some(true));
        assert_eq!(cfg.max_segments_per_download, None);
    }

    #[test]
    fn test_apply_overrides_only_set_values() {
        let cfg = FileConfig {
            max_segments_per_download: Some(8),
            progress_interval_ms: Some(1000),
            ..FileConfig::default()
        };
        let mut settings = EngineSettings::default();
        cfg.apply(&mut settings);

        assert_eq!(settings.max_segments_per_download, 8);
        assert_eq!(settings.progress_interval, Duration::from_secs(1));
        assert_eq!(settings.max_concurrent_downloads, 3);
    }

    #[test]
    fn test_parse_config_rejects_unknown_key() {
        let err = parse_config_str("color = \"blue\"").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_value() {
        let err = parse_config_str("max_segments_per_download = 64").unwrap_err();
        assert!(format!("{err:#}").contains("max_segments_per_download"));
    }

    #[test]
    fn test_parse_config_rejects_bad_syntax() {
        assert!(parse_config_str("max_attempts").is_err());
        assert!(parse_config_str("destination_root = /no/quotes").is_err());
        assert!(parse_config_str("wifi_only = yes").is_err());
        assert!(parse_config_str("min_segment_size = -1").is_err());
    }

    #[test]
    fn test_hash_inside_string_is_not_a_comment() {
        let cfg = parse_config_str("temp_root = \"/tmp/#partial\"").unwrap();
        assert_eq!(cfg.temp_root, Some(PathBuf::from("/tmp/#partial")));
    }
}
