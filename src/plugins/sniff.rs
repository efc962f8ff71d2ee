//! Format category detection from item headers.

use std::path::Path;

pub const CATEGORY_TEXT: &str = "text";
pub const CATEGORY_BINARY: &str = "binary";

struct Magic {
    category: &'static str,
    offset: usize,
    bytes: &'static [u8],
}

const MAGICS: &[Magic] = &[
    Magic { category: "sqlite", offset: 0, bytes: b"SQLite format 3\0" },
    Magic { category: "olecf", offset: 0, bytes: &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1] },
    Magic { category: "plist", offset: 0, bytes: b"bplist0" },
    Magic { category: "winreg", offset: 0, bytes: b"regf" },
    Magic { category: "esedb", offset: 4, bytes: &[0xEF, 0xCD, 0xAB, 0x89] },
    Magic { category: "pcap", offset: 0, bytes: &[0xD4, 0xC3, 0xB2, 0xA1] },
    Magic { category: "pcap", offset: 0, bytes: &[0xA1, 0xB2, 0xC3, 0xD4] },
    Magic { category: "pcap", offset: 0, bytes: &[0x0A, 0x0D, 0x0D, 0x0A] },
    Magic { category: "zip", offset: 0, bytes: b"PK\x03\x04" },
    Magic { category: "gzip", offset: 0, bytes: &[0x1F, 0x8B] },
    Magic { category: "prefetch", offset: 4, bytes: b"SCCA" },
    Magic { category: "prefetch", offset: 0, bytes: b"MAM\x04" },
    Magic { category: "msiecf", offset: 0, bytes: b"Client UrlCache MMF Ver " },
    Magic { category: "lnk", offset: 0, bytes: &[0x4C, 0x00, 0x00, 0x00, 0x01, 0x14, 0x02, 0x00] },
    Magic { category: "evt", offset: 4, bytes: b"LfLe" },
    Magic { category: "evtx", offset: 0, bytes: b"ElfFile\0" },
];

/// Classify an item by its leading bytes. Items without a known magic are
/// `text` when the header holds no NUL byte and decodes as UTF-8 (ignoring a
/// possibly cut final character), `binary` otherwise.
pub fn sniff_category(header: &[u8], path: &Path) -> &'static str {
    for magic in MAGICS {
        let end = magic.offset + magic.bytes.len();
        if header.len() >= end && &header[magic.offset..end] == magic.bytes {
            return magic.category;
        }
    }
    if header.starts_with(b"<?xml") && path.extension().is_some_and(|ext| ext == "plist") {
        return "plist";
    }
    if header.is_empty() || memchr::memchr(0, header).is_some() {
        return CATEGORY_BINARY;
    }
    match std::str::from_utf8(header) {
        Ok(_) => CATEGORY_TEXT,
        Err(err) if err.error_len().is_none() => CATEGORY_TEXT,
        Err(_) => CATEGORY_BINARY,
    }
}
