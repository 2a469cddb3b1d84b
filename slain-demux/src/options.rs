//! Session configuration.
//!
//! `DemuxOptions` is plain data and round-trips through JSON so a player can
//! keep its demuxer tuning next to the rest of its settings. Runtime hooks
//! that cannot be serialized (interrupt callback, tag handler) live in
//! [`OpenOptions`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{DemuxError, Result};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_PROBESIZE: i64 = 5_000_000;
pub const DEFAULT_FORMAT_PROBESIZE: usize = 1 << 20;
pub const DEFAULT_MAX_PROBE_PACKETS: i32 = 2500;
pub const DEFAULT_MAX_INDEX_SIZE: usize = 1 << 20;
pub const DEFAULT_IO_BUFFER_SIZE: usize = 32768;
pub const DEFAULT_SHORT_SEEK_THRESHOLD: i32 = 32768;

/// Bytes read per end-of-file sampling round in duration estimation.
pub const DURATION_DEFAULT_MAX_READ_SIZE: i64 = 250_000;
pub const DURATION_DEFAULT_MAX_RETRY: u32 = 6;

bitflags! {
    /// Demuxing behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FormatFlags: u32 {
        /// Generate missing pts from later packets of the same stream.
        const GENPTS = 0x0001;
        /// Ignore the container's index.
        const IGNIDX = 0x0002;
        /// Do not fill in values that can be exactly calculated.
        const NOFILLIN = 0x0010;
        /// Disable codec parsers.
        const NOPARSE = 0x0020;
        /// Ignore container dts values.
        const IGNDTS = 0x0008;
        /// Drop packets flagged corrupt instead of delivering them.
        const DISCARD_CORRUPT = 0x0100;
        const SORT_DTS = 0x10000;
        const FAST_SEEK = 0x80000;
        /// Do not buffer packets during stream analysis.
        const NOBUFFER = 0x0040;
    }
}

/// What to do with a malformed tag or chunk inside a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagPolicy {
    /// Skip the offending region and keep parsing.
    #[default]
    Lenient,
    /// Abort the header parse with `InvalidData`.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxOptions {
    pub probesize: i64,
    pub format_probesize: usize,
    /// Microseconds; 0 picks a per-format default.
    pub max_analyze_duration: i64,
    pub max_probe_packets: i32,
    /// Frames used to estimate frame rate; -1 picks the default.
    pub fps_probe_size: i32,
    pub max_index_size: usize,
    pub max_ts_probe: i32,
    pub max_streams: usize,
    pub skip_initial_bytes: i64,
    pub correct_ts_overflow: bool,
    pub seek2any: bool,
    pub skip_estimate_duration_from_pts: bool,
    /// Bytes per sampling round in pts based duration estimation; 0 = default.
    pub duration_probesize: i64,
    pub duration_max_retry: u32,
    pub flags: FormatFlags,
    pub tag_policy: TagPolicy,
    pub io_buffer_size: usize,
    pub short_seek_threshold: i32,
    /// Microseconds; `None` waits forever on would-block conditions.
    pub rw_timeout: Option<i64>,
    pub protocol_whitelist: Option<String>,
    pub protocol_blacklist: Option<String>,
    pub format_whitelist: Option<String>,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            probesize: DEFAULT_PROBESIZE,
            format_probesize: DEFAULT_FORMAT_PROBESIZE,
            max_analyze_duration: 0,
            max_probe_packets: DEFAULT_MAX_PROBE_PACKETS,
            fps_probe_size: -1,
            max_index_size: DEFAULT_MAX_INDEX_SIZE,
            max_ts_probe: 50,
            max_streams: 1000,
            skip_initial_bytes: 0,
            correct_ts_overflow: true,
            seek2any: false,
            skip_estimate_duration_from_pts: false,
            duration_probesize: 0,
            duration_max_retry: DURATION_DEFAULT_MAX_RETRY,
            flags: FormatFlags::empty(),
            tag_policy: TagPolicy::Lenient,
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            short_seek_threshold: DEFAULT_SHORT_SEEK_THRESHOLD,
            rw_timeout: None,
            protocol_whitelist: None,
            protocol_blacklist: None,
            format_whitelist: None,
        }
    }
}

impl DemuxOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| DemuxError::invalid_data(format!("Failed to parse options: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DemuxError::io(0, e))?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DemuxError::invalid_data(format!("Failed to serialize options: {}", e)))
    }

    pub fn has_flag(&self, flag: FormatFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// Polled during blocking I/O; returning true aborts with `Interrupted`.
pub type InterruptCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Hook for tag blocks (ID3v2 and friends) found ahead of the container
/// payload. Returns the number of bytes the tag occupied so the engine can
/// skip it; metadata goes into the supplied map.
pub trait TagHandler: Send + Sync {
    fn probe_len(&self, header: &[u8]) -> Option<usize>;
    fn parse(&self, tag: &[u8], metadata: &mut std::collections::HashMap<String, String>) -> Result<()>;
}

/// Everything `Session::open_input` accepts besides the URL.
#[derive(Clone, Default)]
pub struct OpenOptions {
    pub demux: DemuxOptions,
    pub interrupt: Option<InterruptCallback>,
    pub tag_handler: Option<Arc<dyn TagHandler>>,
}

impl OpenOptions {
    pub fn new(demux: DemuxOptions) -> Self {
        Self { demux, ..Default::default() }
    }

    pub fn with_interrupt(mut self, cb: InterruptCallback) -> Self {
        self.interrupt = Some(cb);
        self
    }

    pub fn with_tag_handler(mut self, handler: Arc<dyn TagHandler>) -> Self {
        self.tag_handler = Some(handler);
        self
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("demux", &self.demux)
            .field("interrupt", &self.interrupt.is_some())
            .field("tag_handler", &self.tag_handler.is_some())
            .finish()
    }
}

/// Splits a comma separated allow/deny list.
pub(crate) fn list_contains(list: &str, name: &str) -> bool {
    list.split(',').map(str::trim).any(|item| !item.is_empty() && item == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_tuning() {
        let opts = DemuxOptions::default();
        assert_eq!(opts.probesize, 5_000_000);
        assert_eq!(opts.max_probe_packets, 2500);
        assert_eq!(opts.max_index_size, 1 << 20);
        assert!(opts.correct_ts_overflow);
        assert_eq!(opts.tag_policy, TagPolicy::Lenient);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts = DemuxOptions::from_json(r#"{ "probesize": 1024, "tag_policy": "strict" }"#)
            .expect("options");
        assert_eq!(opts.probesize, 1024);
        assert_eq!(opts.tag_policy, TagPolicy::Strict);
        assert_eq!(opts.format_probesize, DEFAULT_FORMAT_PROBESIZE);
    }

    #[test]
    fn json_round_trip_keeps_flags() {
        let mut opts = DemuxOptions::default();
        opts.flags = FormatFlags::GENPTS | FormatFlags::IGNDTS;
        let text = opts.to_json().expect("json");
        let back = DemuxOptions::from_json(&text).expect("parse");
        assert!(back.has_flag(FormatFlags::GENPTS));
        assert!(back.has_flag(FormatFlags::IGNDTS));
        assert!(!back.has_flag(FormatFlags::NOPARSE));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demux.json");
        std::fs::write(&path, r#"{ "max_ts_probe": 7 }"#).expect("write");
        let opts = DemuxOptions::load(&path).expect("load");
        assert_eq!(opts.max_ts_probe, 7);
    }

    #[test]
    fn list_matching_is_exact() {
        assert!(list_contains("file,memory", "memory"));
        assert!(!list_contains("file,memory", "mem"));
        assert!(!list_contains("", "file"));
    }
}
