//! Bodyfile (mactime) parser.
//!
//! Each line is `MD5|name|inode|mode|UID|GID|size|atime|mtime|ctime|crtime`
//! with POSIX epoch seconds; zero means "not set".

use std::io::{BufRead, BufReader};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    ApplicabilitySignature, OS_PRESETS, ParserContext, Plugin, PluginDescriptor, PluginError,
    ProcessOutcome, sniff::CATEGORY_TEXT,
};
use crate::event::{Event, TimestampUsage};
use crate::evidence::EvidenceItem;

pub const DATA_TYPE: &str = "fs:mactime:line";

const FIELD_COUNT: usize = 11;

static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    name: "mactime",
    description: "Parser for SleuthKit bodyfiles",
    category: CATEGORY_TEXT,
    signature: ApplicabilitySignature::ANY,
    weight: 1,
    presets: OS_PRESETS,
};

pub struct MactimePlugin;

impl Plugin for MactimePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &DESCRIPTOR
    }

    fn process(&self, ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> ProcessOutcome {
        let first_line = ctx
            .header()
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .find(|line| !line.is_empty());
        let Some(first_line) = first_line else {
            return ProcessOutcome::NotApplicable("empty file".to_string());
        };
        if BodyLine::parse(&String::from_utf8_lossy(first_line)).is_none() {
            return ProcessOutcome::NotApplicable("not a bodyfile".to_string());
        }
        match parse_bodyfile(ctx, item) {
            Ok(()) => ProcessOutcome::Applicable,
            Err(err) => err.into(),
        }
    }
}

struct BodyLine<'a> {
    md5: &'a str,
    name: &'a str,
    inode: &'a str,
    mode: &'a str,
    uid: u64,
    gid: u64,
    size: u64,
    times: [(TimestampUsage, i64); 4],
}

impl<'a> BodyLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != FIELD_COUNT {
            return None;
        }
        let number = |idx: usize| fields[idx].trim().parse::<i64>().ok();
        Some(Self {
            md5: fields[0],
            name: fields[1],
            inode: fields[2],
            mode: fields[3],
            uid: fields[4].trim().parse().ok()?,
            gid: fields[5].trim().parse().ok()?,
            size: fields[6].trim().parse().ok()?,
            times: [
                (TimestampUsage::Access, number(7)?),
                (TimestampUsage::Modification, number(8)?),
                (TimestampUsage::Change, number(9)?),
                (TimestampUsage::Creation, number(10)?),
            ],
        })
    }
}

fn parse_bodyfile(ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> Result<(), PluginError> {
    let reader = BufReader::new(ctx.open_item(item)?);
    let mut skipped = 0u64;
    for (line_no, raw) in reader.split(b'\n').enumerate() {
        let raw = raw?;
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            continue;
        }
        let Some(line) = BodyLine::parse(text) else {
            debug!("mactime: skipping malformed line {} in {item}", line_no + 1);
            skipped += 1;
            continue;
        };
        for (usage, seconds) in line.times {
            if seconds == 0 {
                continue;
            }
            let Some(timestamp) = DateTime::<Utc>::from_timestamp(seconds, 0) else {
                continue;
            };
            let mut event = Event::new(timestamp, usage, DATA_TYPE)
                .with_attribute("filename", line.name)
                .with_attribute("inode", line.inode)
                .with_attribute("mode_as_string", line.mode)
                .with_attribute("uid", line.uid)
                .with_attribute("gid", line.gid)
                .with_attribute("size", line.size);
            if line.md5 != "0" && !line.md5.is_empty() {
                event = event.with_attribute("md5", line.md5);
            }
            ctx.produce_event(event)?;
        }
    }
    if skipped > 0 {
        debug!("mactime: {skipped} malformed lines in {item}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunContext;
    use crate::evidence::EvidenceResolver;
    use crate::pipeline::queue::{Queue, SequentialQueue};
    use crate::pipeline::workers::DispatchStats;
    use crate::plugins::Registry;

    fn dispatch_file(content: &[u8]) -> (Vec<Event>, DispatchStats) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bodyfile");
        std::fs::write(&path, content).expect("write");

        let mut builder = Registry::builder();
        builder
            .register(std::sync::Arc::new(MactimePlugin))
            .expect("register");
        let registry = builder.build();
        let run = RunContext::default();
        let resolver = EvidenceResolver::default();
        let output = SequentialQueue::new();
        let mut stats = DispatchStats::default();
        {
            let mut ctx = ParserContext::new(&run, &registry, &resolver, &output, &mut stats);
            ctx.dispatch(&EvidenceItem::file(&path));
        }
        output.close();
        (std::iter::from_fn(|| output.pop()).collect(), stats)
    }

    #[test]
    fn parses_non_zero_timestamps() {
        let body = b"0|/etc/passwd|1234|r/rrw-r--r--|0|0|2048|1700000000|1700000100|0|0\n\
d41d8cd98f00b204e9800998ecf8427e|/tmp/x|7|r/rrw-------|1000|1000|0|0|0|1700000200|1600000000\n";
        let (events, stats) = dispatch_file(body);
        assert_eq!(events.len(), 4);
        assert_eq!(stats.not_applicable, 0);

        let first = &events[0];
        assert_eq!(first.timestamp_desc(), TimestampUsage::Access);
        assert_eq!(first.timestamp().timestamp(), 1_700_000_000);
        assert_eq!(first.attribute("filename").map(|v| v.to_text()), Some("/etc/passwd".to_string()));
        assert!(first.attribute("md5").is_none());
        assert!(events[3].attribute("md5").is_some());
        assert_eq!(events[3].timestamp_desc(), TimestampUsage::Creation);
    }

    #[test]
    fn declines_plain_text() {
        let (events, stats) = dispatch_file(b"just some notes\nwith two lines\n");
        assert!(events.is_empty());
        assert_eq!(stats.not_applicable, 1);
        assert_eq!(stats.plugin_failures, 0);
    }

    #[test]
    fn skips_malformed_lines_after_header() {
        let body = b"0|/a|1|r|0|0|1|1700000000|0|0|0\ngarbage line\n0|/b|2|r|0|0|1|0|1700000001|0|0\n";
        let (events, _) = dispatch_file(body);
        assert_eq!(events.len(), 2);
    }
}
