use chrono::{DateTime, Utc};

use super::{
    ANY_CATEGORY, ApplicabilitySignature, OS_PRESETS, ParserContext, Plugin, PluginDescriptor,
    PluginError, ProcessOutcome,
};
use crate::event::{Event, TimestampUsage};
use crate::evidence::{EvidenceItem, ItemKind};

pub const DATA_TYPE: &str = "fs:stat";

static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    name: "filestat",
    description: "Timestamps from file system metadata",
    category: ANY_CATEGORY,
    signature: ApplicabilitySignature::ANY,
    weight: 0,
    presets: OS_PRESETS,
};

/// Emits creation/modification/access/change events for live filesystem
/// entries.
pub struct FileStatPlugin;

impl Plugin for FileStatPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &DESCRIPTOR
    }

    fn process(&self, ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> ProcessOutcome {
        if item.kind() != ItemKind::File {
            return ProcessOutcome::NotApplicable("not a file system entry".to_string());
        }
        match emit_stat_events(ctx, item) {
            Ok(()) => ProcessOutcome::Applicable,
            Err(err) => err.into(),
        }
    }
}

fn emit_stat_events(ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> Result<(), PluginError> {
    let metadata = std::fs::symlink_metadata(item.location())?;
    let mut stamps: Vec<(TimestampUsage, DateTime<Utc>)> = Vec::with_capacity(4);
    if let Ok(time) = metadata.modified() {
        stamps.push((TimestampUsage::Modification, time.into()));
    }
    if let Ok(time) = metadata.accessed() {
        stamps.push((TimestampUsage::Access, time.into()));
    }
    if let Ok(time) = metadata.created() {
        stamps.push((TimestampUsage::Creation, time.into()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Some(time) = DateTime::from_timestamp(metadata.ctime(), metadata.ctime_nsec() as u32) {
            stamps.push((TimestampUsage::Change, time));
        }
    }

    let path = item.location().display().to_string();
    for (usage, timestamp) in stamps {
        let event = Event::new(timestamp, usage, DATA_TYPE)
            .with_attribute("filename", path.clone())
            .with_attribute("file_size", metadata.len())
            .with_attribute("is_directory", metadata.is_dir())
            .with_attribute("file_system_type", "OS");
        ctx.produce_event(event)?;
    }
    Ok(())
}
