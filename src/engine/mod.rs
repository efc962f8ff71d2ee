//! # Engine
//!
//! Validates the configuration, runs preprocessing once, then drives
//! collection, dispatch and storage either on the calling thread
//! (sequential) or as independent tasks joined through bounded queues
//! (parallel).

mod run;
mod shutdown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{LoadedConfig, RunContext, TimeZoneSpec};
use crate::constants::TOOL_VERSION;
use crate::evidence::{
    CollectionSource, EvidenceError, ImageBackend, ImageVolume, PathFilter, RawImageBackend,
    ShadowStoreSelection,
};
use crate::filter::Filter;
use crate::pipeline::workers::DispatchStats;
use crate::plugins::{Registry, RegistryError};
use crate::preprocess::{
    DirectorySource, PreprocessContext, PreprocessPlugin, PreprocessSource, VolumeSource,
    default_plugins, run_preprocess,
};
use crate::storage::jsonl::JsonlStore;
use crate::storage::{EventStore, RunMetadata, StorageError};
use crate::util;

pub use run::RunningEngine;
pub use shutdown::{InterruptAction, ShutdownHandle};

use shutdown::EngineShared;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad configuration option: {0}")]
    BadConfigOption(String),
    #[error("unable to open source {path}: {reason}")]
    UnableToOpenSource { path: String, reason: String },
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("collection failed: {0}")]
    Collection(#[from] EvidenceError),
    #[error("plugin registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("run terminated by interrupt")]
    Interrupted,
    #[error("unable to spawn {task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Validating,
    Preprocessing,
    /// Which stages are still active.
    Running {
        collecting: bool,
        dispatching: bool,
        storing: bool,
    },
    Draining,
    Stopped,
    Error,
}

/// Totals of one run, logged as `run_summary` when it ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub items_collected: u64,
    pub dispatch: DispatchStats,
    pub events_stored: u64,
    pub batches_flushed: u64,
    pub workers_lost: u64,
    pub interrupted: bool,
}

impl RunStats {
    pub fn log_summary(&self) {
        info!(
            "run_summary items_collected={} items_processed={} events_produced={} events_filtered={} \
             events_stored={} batches={} not_applicable={} plugin_failures={} recursion_limited={} \
             unreadable={} workers_lost={} interrupted={}",
            self.items_collected,
            self.dispatch.items_processed,
            self.dispatch.events_produced,
            self.dispatch.events_filtered,
            self.events_stored,
            self.batches_flushed,
            self.dispatch.not_applicable,
            self.dispatch.plugin_failures,
            self.dispatch.recursion_limited,
            self.dispatch.unreadable_items,
            self.workers_lost,
            self.interrupted
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    File,
    Directory,
    Image,
}

/// A configuration that passed validation.
struct RunPlan {
    source: PathBuf,
    kind: SourceKind,
    output_dir: PathBuf,
    configured_zone: TimeZoneSpec,
    filter: Filter,
    path_filter: Option<PathFilter>,
    shadow_stores: ShadowStoreSelection,
}

/// Everything a started run needs, handed to [`RunningEngine`].
pub(crate) struct PreparedRun {
    pub(crate) loaded: LoadedConfig,
    pub(crate) run: Arc<RunContext>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) source: CollectionSource,
    pub(crate) path_filter: Option<PathFilter>,
    pub(crate) shadow_stores: ShadowStoreSelection,
    pub(crate) volume: Option<Arc<dyn ImageVolume>>,
    pub(crate) store: Box<dyn EventStore>,
    pub(crate) metadata: RunMetadata,
}

pub struct Engine {
    loaded: LoadedConfig,
    registry: Option<Registry>,
    image_backend: Arc<dyn ImageBackend>,
    preprocessors: Vec<Arc<dyn PreprocessPlugin>>,
    store: Option<Box<dyn EventStore>>,
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(loaded: LoadedConfig) -> Self {
        Self {
            loaded,
            registry: None,
            image_backend: Arc::new(RawImageBackend),
            preprocessors: default_plugins(),
            store: None,
            shared: Arc::new(EngineShared::new()),
        }
    }

    /// Use `registry` instead of the built-in plugins.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_image_backend(mut self, backend: Arc<dyn ImageBackend>) -> Self {
        self.image_backend = backend;
        self
    }

    pub fn with_preprocessors(mut self, plugins: Vec<Arc<dyn PreprocessPlugin>>) -> Self {
        self.preprocessors = plugins;
        self
    }

    /// Persist into `store` instead of a JSONL store in the output directory.
    pub fn with_store(mut self, store: Box<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &LoadedConfig {
        &self.loaded
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    /// Validate, preprocess and start every stage.
    pub fn start(self) -> Result<RunningEngine, EngineError> {
        let shared = self.shared.clone();
        let result = self.prepare().and_then(|prepared| RunningEngine::start(prepared, shared.clone()));
        if let Err(err) = &result {
            warn!("engine failed to start: {err}");
            shared.set_state(EngineState::Error);
        }
        result
    }

    /// Start and join.
    pub fn run(self) -> Result<RunStats, EngineError> {
        self.start()?.join()
    }

    fn prepare(mut self) -> Result<PreparedRun, EngineError> {
        self.shared.set_state(EngineState::Validating);
        let plan = validate(&self.loaded)?;
        let config = &self.loaded.config;

        let registry = match self.registry.take() {
            Some(registry) => registry,
            None => Registry::builtin()?,
        };

        let volume = match plan.kind {
            SourceKind::Image => {
                let offset = config.image_byte_offset();
                let volume = self
                    .image_backend
                    .open(&plan.source, offset)
                    .map_err(|err| unable_to_open(&plan.source, err))?;
                info!(
                    "opened image {} backend={} offset={offset}",
                    plan.source.display(),
                    self.image_backend.name()
                );
                Some(volume)
            }
            _ => None,
        };

        let preprocessed = plan.kind != SourceKind::File;
        let preprocess = if preprocessed {
            self.shared.set_state(EngineState::Preprocessing);
            let source: Box<dyn PreprocessSource> = match &volume {
                Some(volume) => Box::new(VolumeSource::new(volume.clone())),
                None => Box::new(
                    DirectorySource::open(&plan.source)
                        .map_err(|err| unable_to_open(&plan.source, err))?,
                ),
            };
            run_preprocess(&self.preprocessors, source.as_ref())
        } else {
            PreprocessContext::default()
        };

        let zone = resolve_zone(preprocess.time_zone.as_deref(), plan.configured_zone);
        let filter = apply_os_preset(plan.filter, &preprocess)?;

        let registry = registry.filtered(&filter);
        if registry.is_empty() {
            warn!("no plugin matches filter {:?}", filter.as_str());
        } else {
            info!("plugins selected count={}", registry.len());
        }

        let source = match plan.kind {
            SourceKind::File => CollectionSource::File(plan.source.clone()),
            SourceKind::Directory => CollectionSource::Directory(plan.source.clone()),
            SourceKind::Image => CollectionSource::Image {
                path: plan.source.clone(),
                offset: config.image_byte_offset(),
            },
        };

        let workers = if config.single_threaded {
            None
        } else if source.is_single_file() {
            Some(1)
        } else {
            Some(config.worker_count)
        };
        let metadata = RunMetadata {
            version: TOOL_VERSION.to_string(),
            configured_zone: plan.configured_zone.name().to_string(),
            detected_zone: preprocess.time_zone.clone(),
            zone: zone.name().to_string(),
            file_processed: plan.source.display().to_string(),
            output_file: plan.output_dir.display().to_string(),
            buffer_size: config.buffer_size,
            time_of_run: Utc::now(),
            parsers: registry.listing(),
            preprocess: preprocessed,
            recursive: config.recursive,
            debug: config.debug,
            vss_parsing: plan.shadow_stores != ShadowStoreSelection::Skip,
            vss_stores: config.shadow_store_selection.clone(),
            filter: filter.as_str().to_string(),
            file_filter: config.file_filter.as_ref().map(|p| p.display().to_string()),
            os_detected: preprocess.guessed_os.as_str().to_string(),
            hostname: preprocess.hostname.clone(),
            method: if config.is_image {
                "image processed".to_string()
            } else {
                "OS collection".to_string()
            },
            image_offset: config.is_image.then(|| config.image_byte_offset()),
            runtime: if config.single_threaded {
                "single threaded".to_string()
            } else {
                "multi threaded".to_string()
            },
            workers,
            config_hash: self.loaded.config_hash.clone(),
        };

        let store = match self.store.take() {
            Some(store) => store,
            None => Box::new(JsonlStore::create(&plan.output_dir)?),
        };

        let run = RunContext {
            zone,
            preprocess,
            filter,
            max_recursion_depth: config.max_recursion_depth,
            tool_version: TOOL_VERSION,
            source_path: plan.source.clone(),
        };

        Ok(PreparedRun {
            run: Arc::new(run),
            registry: Arc::new(registry),
            source,
            path_filter: plan.path_filter,
            shadow_stores: plan.shadow_stores,
            volume,
            store,
            metadata,
            loaded: self.loaded,
        })
    }
}

fn bad_option(message: impl Into<String>) -> EngineError {
    EngineError::BadConfigOption(message.into())
}

fn unable_to_open(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::UnableToOpenSource {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Check the configuration before anything is opened or spawned.
fn validate(loaded: &LoadedConfig) -> Result<RunPlan, EngineError> {
    let config = &loaded.config;

    let source = config
        .source_path
        .clone()
        .ok_or_else(|| bad_option("source path is not set"))?;
    let source_meta = std::fs::metadata(&source)
        .map_err(|err| bad_option(format!("source {} does not exist: {err}", source.display())))?;

    let kind = if config.is_image {
        if source_meta.is_dir() {
            return Err(bad_option(format!(
                "image source {} is a directory",
                source.display()
            )));
        }
        SourceKind::Image
    } else if source_meta.is_dir() {
        if !config.recursive {
            return Err(bad_option(format!(
                "source {} is a directory, has to be a file unless recursive processing is enabled",
                source.display()
            )));
        }
        SourceKind::Directory
    } else {
        SourceKind::File
    };

    if config.worker_count == 0 {
        return Err(bad_option("worker count must be at least 1"));
    }
    if config.buffer_size == 0 {
        return Err(bad_option("buffer size must be greater than 0"));
    }
    if config.flush_max_events == 0 {
        return Err(bad_option("flush_max_events must be greater than 0"));
    }
    if config.queue_capacity == Some(0) {
        return Err(bad_option("queue capacity must be greater than 0"));
    }

    util::ensure_output_dir(&config.output_path).map_err(|err| bad_option(err.to_string()))?;

    let configured_zone = match TimeZoneSpec::parse(&config.timezone_name) {
        Ok(zone) => zone,
        Err(err) => {
            warn!("{err}, falling back to UTC");
            TimeZoneSpec::Utc
        }
    };

    let filter = Filter::parse(&config.filter_expression)
        .map_err(|err| bad_option(format!("invalid filter expression: {err}")))?;

    let path_filter = match &config.file_filter {
        Some(path) => {
            if !path.is_file() {
                return Err(bad_option(format!(
                    "file filter {} does not exist",
                    path.display()
                )));
            }
            let filter = PathFilter::from_file(path)
                .map_err(|err| bad_option(format!("file filter {}: {err}", path.display())))?;
            info!("targeted collection with {}", filter.describe());
            Some(filter)
        }
        None => None,
    };

    let shadow_stores = match (&config.shadow_store_selection, config.parse_shadow_stores) {
        (Some(selection), _) if selection.contains(&0) => {
            return Err(bad_option("shadow store numbers start at 1"));
        }
        (_, false) => {
            if config.shadow_store_selection.is_some() {
                warn!("shadow store selection ignored, shadow store parsing is disabled");
            }
            ShadowStoreSelection::Skip
        }
        (Some(selection), true) => ShadowStoreSelection::Selected(selection.clone()),
        (None, true) => ShadowStoreSelection::All,
    };
    if shadow_stores != ShadowStoreSelection::Skip && kind != SourceKind::Image {
        warn!("shadow stores are only read from images");
    }

    Ok(RunPlan {
        source,
        kind,
        output_dir: config.output_path.clone(),
        configured_zone,
        filter,
        path_filter,
        shadow_stores,
    })
}

/// Detected zone when it names a known zone, else the configured one.
fn resolve_zone(detected: Option<&str>, configured: TimeZoneSpec) -> TimeZoneSpec {
    if let Some(name) = detected {
        match name.parse::<Tz>() {
            Ok(tz) => {
                info!("using detected timezone {name}");
                return TimeZoneSpec::Named(tz);
            }
            Err(_) => warn!("detected timezone {name} is unknown, using {}", configured.name()),
        }
    }
    configured
}

/// Restrict plugins to the guessed OS preset unless the user already
/// selected plugins explicitly.
fn apply_os_preset(filter: Filter, preprocess: &PreprocessContext) -> Result<Filter, EngineError> {
    let Some(preset) = preprocess.guessed_os.filter_preset() else {
        return Ok(filter);
    };
    if filter.mentions_field("parser") {
        return Ok(filter);
    }
    info!("applying {preset} plugin preset");
    filter
        .with_parser_preset(preset)
        .map_err(|err| bad_option(format!("invalid filter expression: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::preprocess::GuessedOs;

    fn loaded(source: &Path, output: &Path) -> LoadedConfig {
        LoadedConfig::from_config(EngineConfig {
            source_path: Some(source.to_path_buf()),
            output_path: output.to_path_buf(),
            worker_count: 2,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn directory_requires_recursive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut loaded = loaded(dir.path(), &dir.path().join("out"));
        let err = validate(&loaded).err().expect("should fail");
        assert!(matches!(err, EngineError::BadConfigOption(msg) if msg.contains("has to be a file")));

        loaded.config.recursive = true;
        let plan = validate(&loaded).expect("valid");
        assert_eq!(plan.kind, SourceKind::Directory);
    }

    #[test]
    fn missing_source_and_zero_workers_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = loaded(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(matches!(validate(&missing), Err(EngineError::BadConfigOption(_))));

        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").expect("write");
        let mut zero = loaded(&file, &dir.path().join("out"));
        zero.config.worker_count = 0;
        assert!(matches!(validate(&zero), Err(EngineError::BadConfigOption(_))));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").expect("write");
        let mut loaded = loaded(&file, &dir.path().join("out"));
        loaded.config.timezone_name = "Mars/Olympus".to_string();
        let plan = validate(&loaded).expect("valid");
        assert_eq!(plan.configured_zone, TimeZoneSpec::Utc);
    }

    #[test]
    fn bad_filter_and_shadow_store_zero_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").expect("write");

        let mut bad_filter = loaded(&file, &dir.path().join("out"));
        bad_filter.config.filter_expression = "parser inlist".to_string();
        assert!(matches!(validate(&bad_filter), Err(EngineError::BadConfigOption(_))));

        let mut zero_store = loaded(&file, &dir.path().join("out"));
        zero_store.config.parse_shadow_stores = true;
        zero_store.config.shadow_store_selection = Some(vec![0, 1]);
        assert!(matches!(validate(&zero_store), Err(EngineError::BadConfigOption(_))));
    }

    #[test]
    fn detected_zone_wins_when_valid() {
        let configured = TimeZoneSpec::parse("Europe/Berlin").expect("zone");
        assert_eq!(
            resolve_zone(Some("America/Chicago"), configured).name(),
            "America/Chicago"
        );
        assert_eq!(resolve_zone(Some("Nowhere/City"), configured), configured);
        assert_eq!(resolve_zone(None, configured), configured);
    }

    #[test]
    fn os_preset_respects_explicit_parser_terms() {
        let linux = PreprocessContext {
            guessed_os: GuessedOs::Linux,
            ..PreprocessContext::default()
        };
        let plain = Filter::parse("data_type is \"fs:stat\"").expect("filter");
        let applied = apply_os_preset(plain, &linux).expect("preset");
        assert_eq!(
            applied.as_str(),
            "parser inlist \"linux\" and (data_type is \"fs:stat\")"
        );

        let explicit = Filter::parse("parser is \"mactime\"").expect("filter");
        let kept = apply_os_preset(explicit, &linux).expect("preset");
        assert_eq!(kept.as_str(), "parser is \"mactime\"");

        let unknown = PreprocessContext::default();
        assert!(apply_os_preset(Filter::default(), &unknown).expect("none").is_empty());
    }
}
