//! # Plugins
//!
//! The dispatch contract between the engine and format-specific parsers,
//! and the registry that maps format categories to plugins.
//!
//! A plugin declares a [`PluginDescriptor`] and implements
//! [`Plugin::process`]. Declining an item is an ordinary result
//! ([`ProcessOutcome::NotApplicable`]), never a panic.

pub mod context;
pub mod filestat;
pub mod mactime;
pub mod sniff;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::evidence::{EvidenceError, EvidenceItem};
use crate::filter::{FieldSource, Filter};
use crate::pipeline::queue::QueueError;

pub use context::ParserContext;

/// Category whose plugins are candidates for every item.
pub const ANY_CATEGORY: &str = "any";

/// Operating system presets a plugin can be tagged with.
pub const OS_PRESETS: &[&str] = &["winxp", "win7", "macosx", "linux"];

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("evidence error: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("output unavailable: {0}")]
    OutputClosed(#[from] QueueError),
    #[error("recursion depth limit {limit} reached at {item}")]
    RecursionLimit { limit: usize, item: String },
    #[error("invalid format: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin {0} is already registered")]
    Duplicate(String),
}

/// A byte sequence expected at a fixed offset of the item.
#[derive(Debug, Clone, Copy)]
pub struct Marker {
    pub offset: usize,
    pub bytes: &'static [u8],
}

impl Marker {
    pub const fn at(offset: usize, bytes: &'static [u8]) -> Self {
        Self { offset, bytes }
    }
}

/// Structural markers an item must carry before a plugin is invoked. An
/// empty signature accepts every item; the plugin decides itself.
#[derive(Debug, Clone, Copy)]
pub struct ApplicabilitySignature {
    pub markers: &'static [Marker],
}

impl ApplicabilitySignature {
    pub const ANY: ApplicabilitySignature = ApplicabilitySignature { markers: &[] };

    pub const fn requires(markers: &'static [Marker]) -> Self {
        Self { markers }
    }

    pub fn matches(&self, header: &[u8]) -> bool {
        self.markers.iter().all(|marker| {
            let end = marker.offset + marker.bytes.len();
            header.len() >= end && &header[marker.offset..end] == marker.bytes
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub signature: ApplicabilitySignature,
    /// Lower weights run first.
    pub weight: u32,
    /// Preset tags (`winxp`, `linux`, ...) used by `parser inlist` filters.
    pub presets: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The plugin handled the item; it may have produced zero events.
    Applicable,
    NotApplicable(String),
    Failed(String),
}

impl From<PluginError> for ProcessOutcome {
    fn from(err: PluginError) -> Self {
        ProcessOutcome::Failed(err.to_string())
    }
}

pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    fn process(&self, ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> ProcessOutcome;
}

/// Filter fields of a plugin: `parser` answers with its name, category and
/// presets. Every other field is unknown.
pub(crate) struct DescriptorFields<'a>(pub &'a PluginDescriptor);

impl FieldSource for DescriptorFields<'_> {
    fn field_values(&self, field: &str) -> Option<Vec<String>> {
        if !field.eq_ignore_ascii_case("parser") {
            return None;
        }
        let descriptor = self.0;
        let mut values = vec![descriptor.name.to_string(), descriptor.category.to_string()];
        values.extend(descriptor.presets.iter().map(|p| p.to_string()));
        Some(values)
    }
}

/// Append-only collection of plugins, frozen by [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
    names: HashSet<&'static str>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<&mut Self, RegistryError> {
        let name = plugin.name();
        if !self.names.insert(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.plugins.push(plugin);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        let mut any = Vec::new();
        let mut by_category: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
        for (idx, plugin) in self.plugins.iter().enumerate() {
            let category = plugin.descriptor().category;
            if category == ANY_CATEGORY {
                any.push(idx);
            } else {
                by_category.entry(category).or_default().push(idx);
            }
        }
        let weight = |idx: &usize| self.plugins[*idx].descriptor().weight;
        any.sort_by_key(weight);
        for indices in by_category.values_mut() {
            indices.extend(any.iter().copied());
            // Stable: equal weights keep registration order.
            indices.sort_by_key(|idx| (weight(idx), *idx));
        }
        Registry {
            plugins: self.plugins,
            any,
            by_category,
        }
    }
}

/// Read-only plugin table shared by every worker of a run.
pub struct Registry {
    plugins: Vec<Arc<dyn Plugin>>,
    any: Vec<usize>,
    by_category: BTreeMap<&'static str, Vec<usize>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    /// Registry holding the built-in plugins.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Arc::new(filestat::FileStatPlugin))?
            .register(Arc::new(mactime::MactimePlugin))?;
        Ok(builder.build())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().map(|p| p.descriptor())
    }

    /// Candidates for `category`, lowest weight first, wildcard plugins
    /// included.
    pub fn candidates(&self, category: &str) -> Vec<&dyn Plugin> {
        let indices = self.by_category.get(category).unwrap_or(&self.any);
        indices.iter().map(|idx| self.plugins[*idx].as_ref()).collect()
    }

    /// A new registry holding only the plugins `filter` admits.
    pub fn filtered(&self, filter: &Filter) -> Registry {
        if filter.is_empty() {
            return self.retain(|_| true);
        }
        self.retain(|descriptor| filter.admits(&DescriptorFields(descriptor)))
    }

    fn retain(&self, mut keep: impl FnMut(&PluginDescriptor) -> bool) -> Registry {
        let mut builder = RegistryBuilder::new();
        for plugin in &self.plugins {
            if keep(plugin.descriptor()) {
                builder.names.insert(plugin.name());
                builder.plugins.push(plugin.clone());
            }
        }
        builder.build()
    }

    /// `category: name, name` lines for run metadata.
    pub fn listing(&self) -> BTreeMap<String, Vec<String>> {
        let mut listing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for descriptor in self.descriptors() {
            listing
                .entry(descriptor.category.to_string())
                .or_default()
                .push(descriptor.name.to_string());
        }
        listing
    }
}
