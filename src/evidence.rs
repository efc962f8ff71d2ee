//! # Evidence
//!
//! Item locators, readers over raw evidence, and the collector that
//! enumerates items onto the ingestion queue.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::pipeline::queue::Queue;
use crate::pipeline::tasks::CancelToken;
use crate::util;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported evidence type: {0}")]
    Unsupported(String),
    #[error("unable to open image {path}: {reason}")]
    Image { path: String, reason: String },
    #[error("invalid path filter pattern {pattern}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A file on a live filesystem.
    File,
    /// An entry inside an image volume.
    ImageEntry,
    /// An entry inside a shadow/snapshot store of an image.
    ShadowStoreEntry,
    /// A sub-item discovered inside another item by a container plugin.
    Embedded,
}

/// Locator for one unit of raw input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    location: PathBuf,
    kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<EvidenceItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shadow_store: Option<u32>,
    #[serde(skip)]
    data: Option<Arc<[u8]>>,
}

impl EvidenceItem {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_kind(path.into(), ItemKind::File)
    }

    pub fn image_entry(location: impl Into<PathBuf>, offset: u64, size: u64) -> Self {
        let mut item = Self::with_kind(location.into(), ItemKind::ImageEntry);
        item.offset = Some(offset);
        item.size = Some(size);
        item
    }

    pub fn shadow_store_entry(location: impl Into<PathBuf>, store: u32) -> Self {
        let mut item = Self::with_kind(location.into(), ItemKind::ShadowStoreEntry);
        item.shadow_store = Some(store);
        item
    }

    /// A sub-item whose bytes were extracted by the parent's plugin.
    pub fn embedded(parent: &EvidenceItem, location: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let mut item = Self::with_kind(location.into(), ItemKind::Embedded);
        item.size = Some(data.len() as u64);
        item.parent = Some(Box::new(parent.clone()));
        item.data = Some(Arc::from(data));
        item
    }

    fn with_kind(location: PathBuf, kind: ItemKind) -> Self {
        Self {
            location,
            kind,
            offset: None,
            size: None,
            parent: None,
            type_hint: None,
            shadow_store: None,
            data: None,
        }
    }

    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn parent(&self) -> Option<&EvidenceItem> {
        self.parent.as_deref()
    }

    pub fn type_hint(&self) -> Option<&str> {
        self.type_hint.as_deref()
    }

    pub fn shadow_store(&self) -> Option<u32> {
        self.shadow_store
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Number of containers above this item.
    pub fn nesting_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent();
        }
        depth
    }
}

impl fmt::Display for EvidenceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent} >> ")?;
        }
        if let Some(store) = self.shadow_store {
            write!(f, "vss{store}:")?;
        }
        write!(f, "{}", self.location.display())?;
        if let Some(offset) = self.offset {
            write!(f, "@0x{offset:X}")?;
        }
        Ok(())
    }
}

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub type ItemReader = Box<dyn ReadSeek>;

/// A bounded window over a file, read with positional reads.
pub struct FileWindow {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
    #[cfg(not(unix))]
    lock: std::sync::Mutex<()>,
}

impl FileWindow {
    pub fn open(path: &Path, start: u64, len: Option<u64>) -> Result<Self, EvidenceError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if start > file_len {
            return Err(EvidenceError::Unsupported(format!(
                "offset {start} is beyond the end of {} ({file_len} bytes)",
                path.display()
            )));
        }
        let available = file_len - start;
        let len = len.map(|l| l.min(available)).unwrap_or(available);
        Ok(Self {
            file,
            start,
            len,
            pos: 0,
            #[cfg(not(unix))]
            lock: std::sync::Mutex::new(()),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError> {
        if offset >= self.len {
            return Ok(0);
        }
        let max = buf.len().min((self.len - offset) as usize);
        let absolute = self.start + offset;
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(&mut buf[..max], absolute)?)
        }
        #[cfg(not(unix))]
        {
            let _guard = self
                .lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut f = &self.file;
            f.seek(SeekFrom::Start(absolute))?;
            Ok(f.read(&mut buf[..max])?)
        }
    }
}

impl Read for FileWindow {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.pos, buf).map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileWindow {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of evidence item",
            )),
        }
    }
}

/// An opened image volume. Implementations are supplied by filesystem
/// backends; the engine only enumerates entries and opens them.
pub trait ImageVolume: Send + Sync {
    fn entries(&self) -> Result<Vec<EvidenceItem>, EvidenceError>;

    fn shadow_store_count(&self) -> u32 {
        0
    }

    /// Entries of the zero-based shadow store `store`.
    fn shadow_store_entries(&self, store: u32) -> Result<Vec<EvidenceItem>, EvidenceError> {
        Err(EvidenceError::Unsupported(format!(
            "shadow store {store} is not available on this volume"
        )))
    }

    fn open_entry(&self, item: &EvidenceItem) -> Result<ItemReader, EvidenceError>;

    /// Whether `path` (slash separated, relative to the volume root) exists.
    fn exists(&self, _path: &str) -> bool {
        false
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, EvidenceError> {
        Err(EvidenceError::Unsupported(format!(
            "file access to {path} is not supported by this volume"
        )))
    }
}

pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn open(&self, path: &Path, offset: u64) -> Result<Arc<dyn ImageVolume>, EvidenceError>;
}

/// Treats the image, from the configured offset, as one opaque item.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawImageBackend;

impl ImageBackend for RawImageBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn open(&self, path: &Path, offset: u64) -> Result<Arc<dyn ImageVolume>, EvidenceError> {
        let window = FileWindow::open(path, offset, None).map_err(|err| EvidenceError::Image {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        if window.is_empty() {
            return Err(EvidenceError::Image {
                path: path.display().to_string(),
                reason: format!("no data after offset {offset}"),
            });
        }
        Ok(Arc::new(RawImageVolume {
            path: path.to_path_buf(),
            offset,
            len: window.len(),
        }))
    }
}

struct RawImageVolume {
    path: PathBuf,
    offset: u64,
    len: u64,
}

impl ImageVolume for RawImageVolume {
    fn entries(&self) -> Result<Vec<EvidenceItem>, EvidenceError> {
        Ok(vec![EvidenceItem::image_entry(&self.path, self.offset, self.len)])
    }

    fn open_entry(&self, item: &EvidenceItem) -> Result<ItemReader, EvidenceError> {
        let start = item.offset().unwrap_or(self.offset);
        Ok(Box::new(FileWindow::open(&self.path, start, item.size())?))
    }
}

/// Opens item bytes regardless of where the item lives.
#[derive(Clone, Default)]
pub struct EvidenceResolver {
    volume: Option<Arc<dyn ImageVolume>>,
}

impl EvidenceResolver {
    pub fn new(volume: Option<Arc<dyn ImageVolume>>) -> Self {
        Self { volume }
    }

    pub fn open(&self, item: &EvidenceItem) -> Result<ItemReader, EvidenceError> {
        if let Some(data) = &item.data {
            return Ok(Box::new(io::Cursor::new(data.clone())));
        }
        match item.kind {
            ItemKind::File => Ok(Box::new(FileWindow::open(
                item.location(),
                item.offset().unwrap_or(0),
                item.size(),
            )?)),
            ItemKind::ImageEntry | ItemKind::ShadowStoreEntry => match &self.volume {
                Some(volume) => volume.open_entry(item),
                None => Err(EvidenceError::Unsupported(format!(
                    "no image volume available to open {item}"
                ))),
            },
            ItemKind::Embedded => Err(EvidenceError::Unsupported(format!(
                "embedded item {item} carries no data"
            ))),
        }
    }

    /// Read up to `len` bytes from the start of the item.
    pub fn read_header(&self, item: &EvidenceItem, len: usize) -> Result<Vec<u8>, EvidenceError> {
        let reader = self.open(item)?;
        let mut buf = Vec::with_capacity(len);
        reader.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Path patterns restricting a targeted collection.
#[derive(Debug, Clone)]
pub struct PathFilter {
    patterns: Vec<Regex>,
    sources: Vec<String>,
}

impl PathFilter {
    pub fn from_file(path: &Path) -> Result<Self, EvidenceError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_lines(content.lines())
    }

    /// One regular expression per line, matched case-insensitively against
    /// the slash-separated path relative to the collection root. Empty lines
    /// and `#` comments are skipped.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, EvidenceError> {
        let mut patterns = Vec::new();
        let mut sources = Vec::new();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let anchored = if trimmed.starts_with('/') {
                format!("(?i)^{trimmed}$")
            } else {
                format!("(?i)^/{trimmed}$")
            };
            let regex = Regex::new(&anchored).map_err(|source| EvidenceError::InvalidFilter {
                pattern: trimmed.to_string(),
                source,
            })?;
            patterns.push(regex);
            sources.push(trimmed.to_string());
        }
        Ok(Self { patterns, sources })
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(relative_path))
    }

    pub fn describe(&self) -> String {
        self.sources.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowStoreSelection {
    Skip,
    All,
    /// One-based store numbers.
    Selected(Vec<u32>),
}

#[derive(Debug, Clone)]
pub enum CollectionSource {
    File(PathBuf),
    Directory(PathBuf),
    Image { path: PathBuf, offset: u64 },
}

impl CollectionSource {
    pub fn is_single_file(&self) -> bool {
        matches!(self, CollectionSource::File(_))
    }
}

/// Enumerates evidence items onto the ingestion queue.
pub struct Collector {
    source: CollectionSource,
    path_filter: Option<PathFilter>,
    shadow_stores: ShadowStoreSelection,
    volume: Option<Arc<dyn ImageVolume>>,
}

impl Collector {
    pub fn new(source: CollectionSource) -> Self {
        Self {
            source,
            path_filter: None,
            shadow_stores: ShadowStoreSelection::Skip,
            volume: None,
        }
    }

    pub fn with_path_filter(mut self, filter: Option<PathFilter>) -> Self {
        self.path_filter = filter;
        self
    }

    pub fn with_shadow_stores(mut self, selection: ShadowStoreSelection) -> Self {
        self.shadow_stores = selection;
        self
    }

    pub fn with_volume(mut self, volume: Option<Arc<dyn ImageVolume>>) -> Self {
        self.volume = volume;
        self
    }

    pub fn source(&self) -> &CollectionSource {
        &self.source
    }

    /// Collect every item, then signal end-of-input on `queue`, whatever
    /// the outcome.
    pub fn run<Q>(&self, queue: &Q, cancel: &CancelToken) -> Result<u64, EvidenceError>
    where
        Q: Queue<EvidenceItem> + ?Sized,
    {
        let result = self.collect(queue, cancel);
        queue.close();
        result
    }

    /// Push items onto `queue` without closing it. Returns the number of
    /// items pushed.
    pub fn collect<Q>(&self, queue: &Q, cancel: &CancelToken) -> Result<u64, EvidenceError>
    where
        Q: Queue<EvidenceItem> + ?Sized,
    {
        let mut sink = ItemSink {
            queue,
            cancel,
            pushed: 0,
            stopped: false,
        };
        match &self.source {
            CollectionSource::File(path) => {
                let size = std::fs::metadata(path)?.len();
                sink.push(EvidenceItem::file(path).with_size(size));
            }
            CollectionSource::Directory(root) => self.collect_directory(root, &mut sink),
            CollectionSource::Image { path, offset } => {
                let volume = self.volume.as_ref().ok_or_else(|| EvidenceError::Image {
                    path: path.display().to_string(),
                    reason: format!("volume at offset {offset} was not opened"),
                })?;
                self.collect_volume(volume.as_ref(), &mut sink)?;
            }
        }
        if sink.stopped {
            info!("collection stopped early after {} items", sink.pushed);
        } else {
            info!("collection done items={}", sink.pushed);
        }
        Ok(sink.pushed)
    }

    fn collect_directory<Q>(&self, root: &Path, sink: &mut ItemSink<'_, Q>)
    where
        Q: Queue<EvidenceItem> + ?Sized,
    {
        debug!("collecting from directory {}", root.display());
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            if sink.stopped {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("unable to read directory entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(filter) = &self.path_filter {
                let relative = util::relative_slash_path(root, entry.path());
                if !filter.matches(&relative) {
                    continue;
                }
            }
            let mut item = EvidenceItem::file(entry.path());
            if let Ok(metadata) = entry.metadata() {
                item = item.with_size(metadata.len());
            }
            sink.push(item);
        }
    }

    fn collect_volume<Q>(
        &self,
        volume: &dyn ImageVolume,
        sink: &mut ItemSink<'_, Q>,
    ) -> Result<(), EvidenceError>
    where
        Q: Queue<EvidenceItem> + ?Sized,
    {
        for item in volume.entries()? {
            if sink.stopped {
                return Ok(());
            }
            if self.accepts(&item) {
                sink.push(item);
            }
        }

        let available = volume.shadow_store_count();
        let stores: Vec<u32> = match &self.shadow_stores {
            ShadowStoreSelection::Skip => Vec::new(),
            ShadowStoreSelection::All => (1..=available).collect(),
            ShadowStoreSelection::Selected(selected) => selected
                .iter()
                .copied()
                .filter(|store| {
                    let valid = *store >= 1 && *store <= available;
                    if !valid {
                        warn!("shadow store {store} not present (volume has {available})");
                    }
                    valid
                })
                .collect(),
        };
        for store in stores {
            debug!("collecting shadow store {store}");
            let entries = match volume.shadow_store_entries(store - 1) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("unable to collect shadow store {store}: {err}");
                    continue;
                }
            };
            for item in entries {
                if sink.stopped {
                    return Ok(());
                }
                if self.accepts(&item) {
                    sink.push(item);
                }
            }
        }
        Ok(())
    }

    fn accepts(&self, item: &EvidenceItem) -> bool {
        match &self.path_filter {
            Some(filter) => {
                let path = item.location().to_string_lossy().replace('\\', "/");
                let path = if path.starts_with('/') {
                    path
                } else {
                    format!("/{path}")
                };
                filter.matches(&path)
            }
            None => true,
        }
    }
}

struct ItemSink<'a, Q: ?Sized> {
    queue: &'a Q,
    cancel: &'a CancelToken,
    pushed: u64,
    stopped: bool,
}

impl<Q> ItemSink<'_, Q>
where
    Q: Queue<EvidenceItem> + ?Sized,
{
    fn push(&mut self, item: EvidenceItem) {
        if self.cancel.is_cancelled() {
            self.stopped = true;
            return;
        }
        debug!("collected {item}");
        match self.queue.push(item) {
            Ok(()) => self.pushed += 1,
            Err(err) => {
                warn!("stopping collection: {err}");
                self.stopped = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::SequentialQueue;
    use std::io::Write;

    fn drain(queue: &SequentialQueue<EvidenceItem>) -> Vec<EvidenceItem> {
        let mut items = Vec::new();
        while let Some(item) = queue.pop() {
            items.push(item);
        }
        items
    }

    #[test]
    fn file_window_limits_reads_to_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.raw");
        std::fs::write(&path, b"0123456789").expect("write");

        let mut window = FileWindow::open(&path, 2, Some(4)).expect("window");
        let mut buf = Vec::new();
        window.read_to_end(&mut buf).expect("read");
        assert_eq!(buf, b"2345");

        window.seek(SeekFrom::End(-1)).expect("seek");
        let mut one = [0u8; 4];
        let n = window.read(&mut one).expect("read");
        assert_eq!(&one[..n], b"5");
        assert!(window.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn directory_collection_honours_path_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("var/log")).expect("mkdir");
        std::fs::write(dir.path().join("etc/passwd"), b"root").expect("write");
        std::fs::write(dir.path().join("var/log/syslog"), b"boot").expect("write");
        std::fs::write(dir.path().join("var/log/auth.log"), b"login").expect("write");

        let filter = PathFilter::from_lines(["# logs only", "/var/log/.+"]).expect("filter");
        let collector = Collector::new(CollectionSource::Directory(dir.path().to_path_buf()))
            .with_path_filter(Some(filter));
        let queue = SequentialQueue::new();
        let count = collector
            .run(&queue, &CancelToken::new())
            .expect("collect");

        assert_eq!(count, 2);
        let names: Vec<String> = drain(&queue)
            .iter()
            .map(|item| item.location().file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["auth.log", "syslog"]);
        assert!(queue.is_closed());
    }

    #[test]
    fn cancelled_collection_pushes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"a").expect("write");
        let cancel = CancelToken::new();
        cancel.cancel();

        let collector = Collector::new(CollectionSource::Directory(dir.path().to_path_buf()));
        let queue = SequentialQueue::new();
        let count = collector.run(&queue, &cancel).expect("collect");
        assert_eq!(count, 0);
    }

    #[test]
    fn raw_image_exposes_one_entry_from_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dd");
        let mut file = File::create(&path).expect("create");
        file.write_all(&[0u8; 512]).expect("write");
        file.write_all(b"PAYLOAD").expect("write");
        drop(file);

        let volume = RawImageBackend.open(&path, 512).expect("open");
        let entries = volume.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset(), Some(512));
        assert_eq!(entries[0].size(), Some(7));

        let resolver = EvidenceResolver::new(Some(volume));
        let header = resolver.read_header(&entries[0], 64).expect("header");
        assert_eq!(header, b"PAYLOAD");
    }

    #[test]
    fn raw_image_rejects_offset_past_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.dd");
        std::fs::write(&path, b"abc").expect("write");
        assert!(RawImageBackend.open(&path, 512).is_err());
    }

    #[test]
    fn embedded_items_read_from_memory_and_track_parent() {
        let parent = EvidenceItem::file("/evidence/archive.zip");
        let child = EvidenceItem::embedded(&parent, "inner/history.db", b"SQLite".to_vec());
        assert_eq!(child.nesting_depth(), 1);
        assert_eq!(child.to_string(), "/evidence/archive.zip >> inner/history.db");

        let header = EvidenceResolver::default()
            .read_header(&child, 3)
            .expect("header");
        assert_eq!(header, b"SQL");
    }
}
