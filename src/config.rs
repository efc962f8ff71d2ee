use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_MAX_EVENTS, DEFAULT_JOIN_TIMEOUT_MS,
    DEFAULT_MAX_RECURSION_DEPTH, SECTOR_SIZE, TOOL_VERSION,
};
use crate::filter::Filter;
use crate::preprocess::PreprocessContext;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Everything the engine needs to run. The CLI only fills this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub source_path: Option<PathBuf>,
    /// Directory receiving the event store and run metadata.
    pub output_path: PathBuf,
    pub is_image: bool,
    /// Image offset in sectors.
    pub image_offset: u64,
    /// Image offset in bytes; wins over `image_offset` when set.
    pub image_offset_bytes: Option<u64>,
    pub recursive: bool,
    pub file_filter: Option<PathBuf>,
    pub worker_count: usize,
    pub buffer_size: u64,
    pub single_threaded: bool,
    pub debug: bool,
    pub filter_expression: String,
    pub parse_shadow_stores: bool,
    /// One-based store numbers; all stores when unset.
    pub shadow_store_selection: Option<Vec<u32>>,
    pub timezone_name: String,
    /// Capacity of each bounded queue; derived from the worker count when unset.
    pub queue_capacity: Option<usize>,
    pub flush_max_events: usize,
    pub max_recursion_depth: usize,
    pub join_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_path: None,
            output_path: PathBuf::from("timeline"),
            is_image: false,
            image_offset: 0,
            image_offset_bytes: None,
            recursive: false,
            file_filter: None,
            worker_count: num_cpus::get().max(1),
            buffer_size: DEFAULT_BUFFER_SIZE,
            single_threaded: false,
            debug: false,
            filter_expression: String::new(),
            parse_shadow_stores: false,
            shadow_store_selection: None,
            timezone_name: "UTC".to_string(),
            queue_capacity: None,
            flush_max_events: DEFAULT_FLUSH_MAX_EVENTS,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn image_byte_offset(&self) -> u64 {
        self.image_offset_bytes
            .unwrap_or_else(|| self.image_offset.saturating_mul(SECTOR_SIZE))
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EngineConfig,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Wrap a config built in code; the hash covers its YAML form.
    pub fn from_config(config: EngineConfig) -> Self {
        let config_hash = serde_yaml::to_string(&config)
            .map(|text| hash_bytes(text.as_bytes()))
            .unwrap_or_default();
        Self {
            config,
            config_hash,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p).with_context(|| format!("reading config {}", p.display()))?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let config: EngineConfig = serde_yaml::from_slice(&bytes).context("parsing config")?;
    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Timezone used to interpret naive timestamps found in evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneSpec {
    #[default]
    Utc,
    Local,
    Named(Tz),
}

impl TimeZoneSpec {
    /// Accepts IANA names, `UTC` and `local` (case-insensitive).
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("utc") {
            return Ok(TimeZoneSpec::Utc);
        }
        if name.eq_ignore_ascii_case("local") {
            return Ok(TimeZoneSpec::Local);
        }
        name.parse::<Tz>()
            .map(TimeZoneSpec::Named)
            .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            TimeZoneSpec::Utc => "UTC",
            TimeZoneSpec::Local => "local",
            TimeZoneSpec::Named(tz) => tz.name(),
        }
    }

    /// Convert a wall-clock time in this zone to UTC. Ambiguous times take
    /// the earlier instant; times skipped by a DST gap are read as UTC.
    pub fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        let converted = match self {
            TimeZoneSpec::Utc => return naive.and_utc(),
            TimeZoneSpec::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            TimeZoneSpec::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        };
        converted.unwrap_or_else(|| naive.and_utc())
    }
}

/// Immutable state shared by every component of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub zone: TimeZoneSpec,
    pub preprocess: PreprocessContext,
    pub filter: Filter,
    pub max_recursion_depth: usize,
    pub tool_version: &'static str,
    pub source_path: PathBuf,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            zone: TimeZoneSpec::Utc,
            preprocess: PreprocessContext::default(),
            filter: Filter::default(),
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            tool_version: TOOL_VERSION,
            source_path: PathBuf::new(),
        }
    }
}
