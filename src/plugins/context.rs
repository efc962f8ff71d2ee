//! Per-item dispatch state handed to plugins.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use super::{PluginError, ProcessOutcome, Registry, sniff};
use crate::config::RunContext;
use crate::constants::SNIFF_HEADER_LEN;
use crate::event::{Event, ParserChain};
use crate::evidence::{EvidenceItem, EvidenceResolver, ItemReader};
use crate::filter::FieldSource;
use crate::pipeline::queue::{Queue, QueueError};
use crate::pipeline::tasks::catch_panic;
use crate::pipeline::workers::DispatchStats;

/// Dispatches items to candidate plugins and carries what those plugins
/// need: the run context, the output queue, and the current parser chain.
pub struct ParserContext<'a> {
    run: &'a RunContext,
    registry: &'a Registry,
    resolver: &'a EvidenceResolver,
    output: &'a dyn Queue<Event>,
    stats: &'a mut DispatchStats,
    chain: ParserChain,
    item: Option<EvidenceItem>,
    header: Vec<u8>,
    depth: usize,
    output_closed: bool,
}

impl<'a> ParserContext<'a> {
    pub fn new(
        run: &'a RunContext,
        registry: &'a Registry,
        resolver: &'a EvidenceResolver,
        output: &'a dyn Queue<Event>,
        stats: &'a mut DispatchStats,
    ) -> Self {
        Self {
            run,
            registry,
            resolver,
            output,
            stats,
            chain: ParserChain::new(),
            item: None,
            header: Vec::new(),
            depth: 0,
            output_closed: false,
        }
    }

    pub fn run_context(&self) -> &RunContext {
        self.run
    }

    pub fn chain(&self) -> &ParserChain {
        &self.chain
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Leading bytes of the current item, as used for sniffing.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn output_closed(&self) -> bool {
        self.output_closed
    }

    pub fn open_item(&self, item: &EvidenceItem) -> Result<ItemReader, PluginError> {
        Ok(self.resolver.open(item)?)
    }

    /// Interpret a naive timestamp in the run's timezone.
    pub fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        self.run.zone.localize(naive)
    }

    /// Run every candidate plugin over `item`. Plugin failures and panics
    /// are recorded and never propagate.
    pub fn dispatch(&mut self, item: &EvidenceItem) {
        let header = match self.resolver.read_header(item, SNIFF_HEADER_LEN) {
            Ok(header) => header,
            Err(err) => {
                warn!("unable to read {item}: {err}");
                self.stats.unreadable_items += 1;
                return;
            }
        };
        let category = match item.type_hint() {
            Some(hint) => hint.to_string(),
            None => sniff::sniff_category(&header, item.location()).to_string(),
        };

        let previous_item = self.item.replace(item.clone());
        let previous_header = std::mem::replace(&mut self.header, header);
        self.run_candidates(item, &category);
        self.item = previous_item;
        self.header = previous_header;
    }

    fn run_candidates(&mut self, item: &EvidenceItem, category: &str) {
        let registry = self.registry;
        let candidates = registry.candidates(category);
        if candidates.is_empty() {
            debug!("no plugins for {item} category={category}");
            return;
        }
        for plugin in candidates {
            if self.output_closed {
                debug!("output closed, skipping remaining plugins for {item}");
                break;
            }
            let descriptor = plugin.descriptor();
            if !descriptor.signature.matches(&self.header) {
                self.stats.not_applicable += 1;
                continue;
            }

            let mark = self.chain.len();
            self.chain.push(descriptor.name);
            let outcome = catch_panic(|| plugin.process(self, item))
                .unwrap_or_else(|msg| ProcessOutcome::Failed(format!("panicked: {msg}")));
            self.chain.truncate(mark);

            match outcome {
                ProcessOutcome::Applicable => {
                    debug!("plugin {} handled {item}", descriptor.name);
                }
                ProcessOutcome::NotApplicable(reason) => {
                    debug!("plugin {} not applicable to {item}: {reason}", descriptor.name);
                    self.stats.not_applicable += 1;
                }
                ProcessOutcome::Failed(reason) => {
                    warn!("plugin {} failed on {item}: {reason}", descriptor.name);
                    self.stats.plugin_failures += 1;
                }
            }
        }
    }

    /// Dispatch a sub-item found inside the current item. The calling
    /// plugin is already on the chain.
    pub fn dispatch_embedded(&mut self, child: EvidenceItem) -> Result<(), PluginError> {
        let limit = self.run.max_recursion_depth;
        if self.depth >= limit {
            self.stats.recursion_limited += 1;
            warn!("recursion limit {limit} reached, skipping {child}");
            return Err(PluginError::RecursionLimit {
                limit,
                item: child.to_string(),
            });
        }
        self.depth += 1;
        self.dispatch(&child);
        self.depth -= 1;
        Ok(())
    }

    /// Stamp `event` with the parser chain and current item, apply the event
    /// filter, and push it to the output queue. Blocks while the queue is
    /// full.
    pub fn produce_event(&mut self, event: Event) -> Result<(), PluginError> {
        if self.output_closed {
            return Err(QueueError::Closed("output".to_string()).into());
        }
        let event = event.with_provenance(self.chain.clone(), self.item.clone());
        let filter = &self.run.filter;
        if !filter.is_empty()
            && !filter.admits(&EventFields {
                event: &event,
                registry: self.registry,
            })
        {
            self.stats.events_filtered += 1;
            return Ok(());
        }
        match self.output.push(event) {
            Ok(()) => {
                self.stats.events_produced += 1;
                Ok(())
            }
            Err(err) => {
                self.output_closed = true;
                Err(err.into())
            }
        }
    }
}

/// Filter fields of an event. `parser` answers with the chain's names plus
/// each chained plugin's category and presets.
struct EventFields<'a> {
    event: &'a Event,
    registry: &'a Registry,
}

impl FieldSource for EventFields<'_> {
    fn field_values(&self, field: &str) -> Option<Vec<String>> {
        let event = self.event;
        let values = match field {
            "parser" => {
                let mut values = Vec::new();
                for name in event.parser_chain().names() {
                    values.push(name.clone());
                    if let Some(plugin) = self.registry.get(name) {
                        let descriptor = plugin.descriptor();
                        values.push(descriptor.category.to_string());
                        values.extend(descriptor.presets.iter().map(|p| p.to_string()));
                    }
                }
                values
            }
            "data_type" => vec![event.data_type().to_string()],
            "timestamp_desc" => vec![event.timestamp_desc().to_string()],
            "timestamp" => vec![event.timestamp().to_rfc3339()],
            "filename" => event
                .source()
                .map(|item| vec![item.location().display().to_string()])
                .unwrap_or_default(),
            other => event
                .attribute(other)
                .map(|value| vec![value.to_text()])
                .unwrap_or_default(),
        };
        Some(values)
    }
}
