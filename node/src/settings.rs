use anyhow::Result;
use config::{Config, File as ConfigFile};
use dirsvc_handle_table::{ArenaLimits, TableLimits};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/dirsvc.toml";
const DEFAULT_SEARCH_CHUNK: usize = 64;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

/// Daemon configuration: optional TOML file, overridden by `DIRSVC_*`
/// environment variables, overridden by command-line flags.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,

    // Handle table
    pub limits: TableLimits,

    // Dispatch
    pub search_chunk_size: usize,

    // Diagnostics
    pub stats_interval_secs: u64,
    pub stats_enabled: bool,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("DIRSVC"));
        let config = builder.build()?;

        let handle_defaults = ArenaLimits::default();
        let handles = ArenaLimits::new(
            get_u32_value(
                &config,
                &["HANDLE_SLOTS_PER_SEGMENT", "handles.slots_per_segment"],
                handle_defaults.slots_per_segment,
            )?,
            get_u32_value(
                &config,
                &["HANDLE_MAX_SEGMENTS", "handles.max_segments"],
                handle_defaults.max_segments,
            )?,
        );

        let token_defaults = TableLimits::default().continuations;
        let continuations = ArenaLimits::new(
            get_u32_value(
                &config,
                &[
                    "CONTINUATION_SLOTS_PER_SEGMENT",
                    "continuations.slots_per_segment",
                ],
                token_defaults.slots_per_segment,
            )?,
            get_u32_value(
                &config,
                &["CONTINUATION_MAX_SEGMENTS", "continuations.max_segments"],
                token_defaults.max_segments,
            )?,
        );

        let client_high_water = get_usize_value(
            &config,
            &["CLIENT_HIGH_WATER", "handles.client_high_water"],
            TableLimits::default().client_high_water,
        )?;

        Ok(Self {
            config_path: resolved_path,
            limits: TableLimits {
                handles,
                continuations,
                client_high_water,
            },
            search_chunk_size: get_usize_value(
                &config,
                &["SEARCH_CHUNK_SIZE", "dispatch.search_chunk_size"],
                DEFAULT_SEARCH_CHUNK,
            )?,
            stats_interval_secs: get_u64_value(
                &config,
                &["STATS_INTERVAL_SECS", "diagnostics.stats_interval_secs"],
                DEFAULT_STATS_INTERVAL_SECS,
            )?,
            stats_enabled: get_bool_value(&config, &["STATS_ENABLED", "diagnostics.enabled"], true),
            log_level: get_string_value(&config, &["LOG_LEVEL", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["LOG_FORMAT", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.search_chunk_size == 0 {
            anyhow::bail!("SEARCH_CHUNK_SIZE must be greater than zero");
        }
        if self.stats_interval_secs == 0 {
            anyhow::bail!("STATS_INTERVAL_SECS must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "LOG_FORMAT must be 'pretty' or 'json', got '{}'",
                self.log_format
            );
        }
        Ok(())
    }

    pub fn source(&self) -> &str {
        self.config_path
            .as_deref()
            .and_then(Path::to_str)
            .unwrap_or("<defaults>")
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_u64_value(config: &Config, keys: &[&str], default: u64) -> Result<u64> {
    for key in keys {
        if let Ok(value) = config.get_int(key) {
            return u64::try_from(value)
                .map_err(|_| anyhow::anyhow!("{key} must not be negative, got {value}"));
        }
        if let Some(raw) = get_string_value(config, &[*key]) {
            return raw
                .parse::<u64>()
                .map_err(|err| anyhow::anyhow!("{key} is not a valid number ('{raw}'): {err}"));
        }
    }
    Ok(default)
}

fn get_u32_value(config: &Config, keys: &[&str], default: u32) -> Result<u32> {
    let value = get_u64_value(config, keys, default.into())?;
    u32::try_from(value)
        .map_err(|_| anyhow::anyhow!("{} = {value} is out of range (max {})", keys[0], u32::MAX))
}

fn get_usize_value(config: &Config, keys: &[&str], default: usize) -> Result<usize> {
    let value = get_u64_value(config, keys, u64::try_from(default).unwrap_or(u64::MAX))?;
    usize::try_from(value)
        .map_err(|_| anyhow::anyhow!("{} = {value} is out of range (max {})", keys[0], usize::MAX))
}
