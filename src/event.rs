//! # Events
//!
//! The unit of output. An [`Event`] is built by a plugin, handed to
//! `ParserContext::produce_event`, and is immutable from then on: the
//! context stamps the parser chain and originating item, the storage writer
//! only reads it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceItem;

/// What a timestamp means for the artifact it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUsage {
    Creation,
    Modification,
    Access,
    Change,
    FirstConnected,
    LastConnected,
    Downloaded,
    AccountCreated,
    LastLogin,
    PasswordReset,
    LastVisited,
    Written,
    Unknown,
}

impl TimestampUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampUsage::Creation => "creation",
            TimestampUsage::Modification => "modification",
            TimestampUsage::Access => "access",
            TimestampUsage::Change => "change",
            TimestampUsage::FirstConnected => "first_connected",
            TimestampUsage::LastConnected => "last_connected",
            TimestampUsage::Downloaded => "downloaded",
            TimestampUsage::AccountCreated => "account_created",
            TimestampUsage::LastLogin => "last_login",
            TimestampUsage::PasswordReset => "password_reset",
            TimestampUsage::LastVisited => "last_visited",
            TimestampUsage::Written => "written",
            TimestampUsage::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TimestampUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heterogeneous attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Text form used by filter comparisons.
    pub fn to_text(&self) -> String {
        match self {
            AttributeValue::Bool(v) => v.to_string(),
            AttributeValue::Int(v) => v.to_string(),
            AttributeValue::UInt(v) => v.to_string(),
            AttributeValue::Float(v) => v.to_string(),
            AttributeValue::Text(v) => v.clone(),
            AttributeValue::List(values) => values
                .iter()
                .map(AttributeValue::to_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn estimated_size(&self) -> usize {
        match self {
            AttributeValue::Text(v) => v.len() + 2,
            AttributeValue::List(values) => {
                values.iter().map(AttributeValue::estimated_size).sum::<usize>() + 2
            }
            _ => 8,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::UInt(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::UInt(u64::from(value))
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

/// Names of the plugins that successively handled an item, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParserChain(Vec<String>);

impl ParserChain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: &str) {
        self.0.push(name.to_string());
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// Drop trailing entries back to `len`. Only used by dispatch to unwind
    /// its own push once a plugin returns.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl fmt::Display for ParserChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    timestamp: DateTime<Utc>,
    timestamp_desc: TimestampUsage,
    data_type: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    parser_chain: ParserChain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<EvidenceItem>,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        timestamp_desc: TimestampUsage,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            timestamp_desc,
            data_type: data_type.into(),
            attributes: BTreeMap::new(),
            parser_chain: ParserChain::new(),
            source: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_desc(&self) -> TimestampUsage {
        self.timestamp_desc
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn parser_chain(&self) -> &ParserChain {
        &self.parser_chain
    }

    pub fn source(&self) -> Option<&EvidenceItem> {
        self.source.as_ref()
    }

    pub(crate) fn with_provenance(mut self, chain: ParserChain, source: Option<EvidenceItem>) -> Self {
        self.parser_chain = chain;
        self.source = source;
        self
    }

    /// Rough serialized size, used for batch thresholds.
    pub fn estimated_size(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.estimated_size() + 4)
            .sum();
        let chain: usize = self.parser_chain.names().iter().map(|n| n.len() + 3).sum();
        let source = self
            .source
            .as_ref()
            .map(|item| item.location().as_os_str().len() + 32)
            .unwrap_or(0);
        96 + self.data_type.len() + attributes + chain + source
    }
}
