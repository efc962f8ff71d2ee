use std::path::PathBuf;

use clap::Parser;

use crate::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Evidence to process: a file, a directory (with --recursive) or an image
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Output directory for the event store and run metadata
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Treat the source as a storage media image
    #[arg(long)]
    pub image: bool,

    /// Image offset, in sectors
    #[arg(long)]
    pub image_offset: Option<u64>,

    /// Image offset, in bytes (wins over --image-offset)
    #[arg(long)]
    pub image_offset_bytes: Option<u64>,

    /// Walk a directory source recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// File with path patterns, one per line; only matching paths are collected
    #[arg(short = 'f', long)]
    pub file_filter: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    /// Storage buffer size, in bytes
    #[arg(long)]
    pub buffer_size: Option<u64>,

    /// Run every stage on the calling thread
    #[arg(long)]
    pub single_thread: bool,

    /// Debug logging; with --single-thread, an interrupt opens a post-mortem view
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Timezone for naive timestamps (IANA name, UTC or local)
    #[arg(short = 'z', long)]
    pub zone: Option<String>,

    /// Collect entries of volume shadow stores
    #[arg(long)]
    pub vss: bool,

    /// Only these shadow stores (comma-separated, 1-based); implies --vss
    #[arg(long, value_delimiter = ',')]
    pub vss_stores: Option<Vec<u32>>,

    /// Filter expression selecting plugins and events
    #[arg(long)]
    pub filter: Option<String>,

    /// Print the available plugins and exit
    #[arg(long)]
    pub list_plugins: bool,
}

impl CliOptions {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(source) = &self.source {
            config.source_path = Some(source.clone());
        }
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if self.image {
            config.is_image = true;
        }
        if let Some(offset) = self.image_offset {
            config.image_offset = offset;
        }
        if let Some(bytes) = self.image_offset_bytes {
            config.image_offset_bytes = Some(bytes);
        }
        if self.recursive {
            config.recursive = true;
        }
        if let Some(filter) = &self.file_filter {
            config.file_filter = Some(filter.clone());
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if self.single_thread {
            config.single_threaded = true;
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(zone) = &self.zone {
            config.timezone_name = zone.clone();
        }
        if self.vss {
            config.parse_shadow_stores = true;
        }
        if let Some(stores) = &self.vss_stores {
            config.parse_shadow_stores = true;
            config.shadow_store_selection = Some(stores.clone());
        }
        if let Some(filter) = &self.filter {
            config.filter_expression = filter.clone();
        }
    }
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
