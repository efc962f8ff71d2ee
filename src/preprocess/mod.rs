//! # Preprocessing
//!
//! Weighted plugins that inspect the source once, before collection, and
//! fill the [`PreprocessContext`] shared by the run: guessed operating
//! system, timezone, hostname. A failing plugin is logged and skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::evidence::{EvidenceError, ImageVolume};

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("evidence error: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("{0} not found")]
    Missing(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Read-only view of the source's file system for preprocessing plugins.
/// Paths are slash separated and relative to the source root.
pub trait PreprocessSource {
    fn exists(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> Result<Vec<u8>, PreprocessError>;
    fn read_link(&self, path: &str) -> Result<String, PreprocessError> {
        Err(PreprocessError::Unsupported(format!("symlink lookup of {path}")))
    }
}

/// A live directory tree.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Fails when the root cannot be listed.
    pub fn open(root: &Path) -> Result<Self, PreprocessError> {
        std::fs::read_dir(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

impl PreprocessSource for DirectorySource {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, PreprocessError> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(PreprocessError::Missing(path.to_string()));
        }
        Ok(std::fs::read(full)?)
    }

    fn read_link(&self, path: &str) -> Result<String, PreprocessError> {
        let target = std::fs::read_link(self.resolve(path))?;
        Ok(target.to_string_lossy().replace('\\', "/"))
    }
}

/// An opened image volume.
pub struct VolumeSource {
    volume: Arc<dyn ImageVolume>,
}

impl VolumeSource {
    pub fn new(volume: Arc<dyn ImageVolume>) -> Self {
        Self { volume }
    }
}

impl PreprocessSource for VolumeSource {
    fn exists(&self, path: &str) -> bool {
        self.volume.exists(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, PreprocessError> {
        Ok(self.volume.read_file(path)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum GuessedOs {
    #[default]
    Unknown,
    Windows,
    MacOsx,
    Linux,
}

impl GuessedOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuessedOs::Unknown => "Unknown",
            GuessedOs::Windows => "Windows",
            GuessedOs::MacOsx => "MacOSX",
            GuessedOs::Linux => "Linux",
        }
    }

    /// Plugin preset selected for this OS, if any.
    pub fn filter_preset(&self) -> Option<&'static str> {
        match self {
            GuessedOs::Windows => Some("win7"),
            GuessedOs::MacOsx => Some("macosx"),
            GuessedOs::Linux => Some("linux"),
            GuessedOs::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreprocessContext {
    pub guessed_os: GuessedOs,
    pub time_zone: Option<String>,
    pub hostname: Option<String>,
}

pub trait PreprocessPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    /// Lower weights run first.
    fn weight(&self) -> u32;
    fn supports(&self, os: GuessedOs) -> bool;
    fn run(
        &self,
        source: &dyn PreprocessSource,
        ctx: &mut PreprocessContext,
    ) -> Result<(), PreprocessError>;
}

pub fn default_plugins() -> Vec<Arc<dyn PreprocessPlugin>> {
    vec![
        Arc::new(GuessOs),
        Arc::new(LinuxTimezone),
        Arc::new(Hostname),
        Arc::new(LocaltimeLink),
    ]
}

/// Run `plugins` in weight order against `source`.
pub fn run_preprocess(
    plugins: &[Arc<dyn PreprocessPlugin>],
    source: &dyn PreprocessSource,
) -> PreprocessContext {
    let mut ordered: Vec<&Arc<dyn PreprocessPlugin>> = plugins.iter().collect();
    ordered.sort_by_key(|plugin| plugin.weight());

    let mut ctx = PreprocessContext::default();
    for plugin in ordered {
        if !plugin.supports(ctx.guessed_os) {
            debug!("preprocess plugin {} skipped for {}", plugin.name(), ctx.guessed_os.as_str());
            continue;
        }
        match plugin.run(source, &mut ctx) {
            Ok(()) => debug!("preprocess plugin {} done", plugin.name()),
            Err(err) => warn!("preprocess plugin {} failed: {err}", plugin.name()),
        }
    }
    info!(
        "preprocess os={} zone={} hostname={}",
        ctx.guessed_os.as_str(),
        ctx.time_zone.as_deref().unwrap_or("-"),
        ctx.hostname.as_deref().unwrap_or("-")
    );
    ctx
}

fn first_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

pub struct GuessOs;

impl PreprocessPlugin for GuessOs {
    fn name(&self) -> &'static str {
        "guess_os"
    }

    fn weight(&self) -> u32 {
        1
    }

    fn supports(&self, _os: GuessedOs) -> bool {
        true
    }

    fn run(
        &self,
        source: &dyn PreprocessSource,
        ctx: &mut PreprocessContext,
    ) -> Result<(), PreprocessError> {
        ctx.guessed_os = if source.exists("Windows/System32") || source.exists("WINDOWS/system32") {
            GuessedOs::Windows
        } else if source.exists("System/Library") {
            GuessedOs::MacOsx
        } else if source.exists("etc") {
            GuessedOs::Linux
        } else {
            GuessedOs::Unknown
        };
        Ok(())
    }
}

pub struct LinuxTimezone;

impl PreprocessPlugin for LinuxTimezone {
    fn name(&self) -> &'static str {
        "linux_timezone"
    }

    fn weight(&self) -> u32 {
        2
    }

    fn supports(&self, os: GuessedOs) -> bool {
        os == GuessedOs::Linux
    }

    fn run(
        &self,
        source: &dyn PreprocessSource,
        ctx: &mut PreprocessContext,
    ) -> Result<(), PreprocessError> {
        let bytes = source.read_file("etc/timezone")?;
        ctx.time_zone = first_line(&bytes);
        Ok(())
    }
}

pub struct Hostname;

impl PreprocessPlugin for Hostname {
    fn name(&self) -> &'static str {
        "hostname"
    }

    fn weight(&self) -> u32 {
        2
    }

    fn supports(&self, os: GuessedOs) -> bool {
        os == GuessedOs::Linux
    }

    fn run(
        &self,
        source: &dyn PreprocessSource,
        ctx: &mut PreprocessContext,
    ) -> Result<(), PreprocessError> {
        let bytes = source.read_file("etc/hostname")?;
        ctx.hostname = first_line(&bytes);
        Ok(())
    }
}

/// Derives the zone from the `localtime` symlink when no zone file named one.
pub struct LocaltimeLink;

impl PreprocessPlugin for LocaltimeLink {
    fn name(&self) -> &'static str {
        "localtime_link"
    }

    fn weight(&self) -> u32 {
        3
    }

    fn supports(&self, os: GuessedOs) -> bool {
        matches!(os, GuessedOs::Linux | GuessedOs::MacOsx)
    }

    fn run(
        &self,
        source: &dyn PreprocessSource,
        ctx: &mut PreprocessContext,
    ) -> Result<(), PreprocessError> {
        if ctx.time_zone.is_some() {
            return Ok(());
        }
        let path = if source.exists("private/etc/localtime") {
            "private/etc/localtime"
        } else {
            "etc/localtime"
        };
        let target = source.read_link(path)?;
        match target.split_once("zoneinfo/") {
            Some((_, zone)) if !zone.is_empty() => {
                ctx.time_zone = Some(zone.to_string());
                Ok(())
            }
            _ => Err(PreprocessError::Missing(format!("zone name in link {target}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl PreprocessPlugin for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn weight(&self) -> u32 {
            0
        }
        fn supports(&self, _os: GuessedOs) -> bool {
            true
        }
        fn run(
            &self,
            _source: &dyn PreprocessSource,
            _ctx: &mut PreprocessContext,
        ) -> Result<(), PreprocessError> {
            Err(PreprocessError::Missing("everything".to_string()))
        }
    }

    fn linux_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        std::fs::write(dir.path().join("etc/timezone"), "Europe/Zurich\n").expect("write");
        std::fs::write(dir.path().join("etc/hostname"), "# comment\nforensic-box\n").expect("write");
        dir
    }

    #[test]
    fn linux_tree_yields_os_zone_and_hostname() {
        let dir = linux_tree();
        let source = DirectorySource::open(dir.path()).expect("open");
        let ctx = run_preprocess(&default_plugins(), &source);
        assert_eq!(ctx.guessed_os, GuessedOs::Linux);
        assert_eq!(ctx.time_zone.as_deref(), Some("Europe/Zurich"));
        assert_eq!(ctx.hostname.as_deref(), Some("forensic-box"));
    }

    #[test]
    fn plugin_failures_are_skipped() {
        let dir = linux_tree();
        let source = DirectorySource::open(dir.path()).expect("open");
        let mut plugins = default_plugins();
        plugins.push(Arc::new(Failing));
        let ctx = run_preprocess(&plugins, &source);
        assert_eq!(ctx.guessed_os, GuessedOs::Linux);
    }

    #[test]
    fn windows_tree_gets_windows_preset() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("Windows/System32")).expect("mkdir");
        let source = DirectorySource::open(dir.path()).expect("open");
        let ctx = run_preprocess(&default_plugins(), &source);
        assert_eq!(ctx.guessed_os, GuessedOs::Windows);
        assert_eq!(ctx.guessed_os.filter_preset(), Some("win7"));
        assert!(ctx.time_zone.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn localtime_symlink_names_zone() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        std::os::unix::fs::symlink(
            "/usr/share/zoneinfo/America/Chicago",
            dir.path().join("etc/localtime"),
        )
        .expect("symlink");
        let source = DirectorySource::open(dir.path()).expect("open");
        let ctx = run_preprocess(&default_plugins(), &source);
        assert_eq!(ctx.time_zone.as_deref(), Some("America/Chicago"));
    }

    #[test]
    fn unreadable_root_fails_to_open() {
        assert!(DirectorySource::open(Path::new("/nonexistent/plumbline/root")).is_err());
    }
}
