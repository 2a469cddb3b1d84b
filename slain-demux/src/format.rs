//! Container format descriptors and the demuxer interface.
//!
//! An [`InputFormat`] is the static description of a container (name,
//! extensions, sniffer); [`InputFormat::create`] builds the [`Demuxer`] that
//! holds per-file state. Demuxers never own the I/O context or the stream
//! list: both live in the [`FormatContext`] handed to every call.

use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::codec::CodecId;
use crate::context::FormatContext;
use crate::error::Result;
use crate::formats;
use crate::packet::Packet;
use crate::seek::SeekFlags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFormatFlags: u32 {
        /// Opens its own input; no byte source is supplied.
        const NOFILE = 0x0001;
        /// Stream ids are meaningful and worth showing.
        const SHOW_IDS = 0x0008;
        /// Packets carry no timestamps.
        const NOTIMESTAMPS = 0x0080;
        /// Build the seek index from key packets while reading.
        const GENERIC_INDEX = 0x0100;
        /// Timestamps may jump.
        const TS_DISCONT = 0x0200;
        const NOBINSEARCH = 0x2000;
        const NOGENSEARCH = 0x4000;
        const NO_BYTE_SEEK = 0x8000;
        /// Seeking targets pts rather than dts.
        const SEEK_TO_PTS = 0x0400_0000;
    }
}

/// Bytes and hints a sniffer gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ProbeData<'a> {
    pub filename: &'a str,
    pub buf: &'a [u8],
    pub mime_type: Option<&'a str>,
}

impl<'a> ProbeData<'a> {
    pub fn new(filename: &'a str, buf: &'a [u8]) -> Self {
        Self { filename, buf, mime_type: None }
    }
}

pub trait InputFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    /// Comma separated, without dots.
    fn extensions(&self) -> &'static str {
        ""
    }

    /// Comma separated.
    fn mime_types(&self) -> &'static str {
        ""
    }

    fn flags(&self) -> InputFormatFlags {
        InputFormatFlags::empty()
    }

    /// Codec of the single stream a raw elementary-stream format carries.
    fn raw_codec_id(&self) -> CodecId {
        CodecId::None
    }

    /// Confidence in `0..=SCORE_MAX` that `pd` is this format; `None` when
    /// the format has no sniffer and relies on extension and MIME matches.
    fn probe(&self, _pd: &ProbeData<'_>) -> Option<i32> {
        None
    }

    fn create(&self) -> Box<dyn Demuxer>;
}

/// Per-file demuxing state.
pub trait Demuxer: Send {
    /// Parses the container header and creates the streams it announces.
    fn read_header(&mut self, ctx: &mut FormatContext) -> Result<()>;

    /// Returns the next packet. `Err(Redo)` asks the caller to call again,
    /// `Err(Eof)` ends the stream.
    fn read_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet>;

    fn read_close(&mut self, _ctx: &mut FormatContext) -> Result<()> {
        Ok(())
    }

    /// Container-specific seek; `None` defers to the generic strategies.
    fn read_seek(
        &mut self,
        _ctx: &mut FormatContext,
        _stream: usize,
        _timestamp: i64,
        _flags: SeekFlags,
    ) -> Option<Result<()>> {
        None
    }

    /// Whether [`Demuxer::read_timestamp`] is implemented; enables the
    /// binary-search seek.
    fn has_read_timestamp(&self) -> bool {
        false
    }

    /// Timestamp of the first packet of `stream` at or after `*pos`, not
    /// searching beyond `pos_limit`. Updates `*pos` to that packet's offset.
    fn read_timestamp(
        &mut self,
        _ctx: &mut FormatContext,
        _stream: usize,
        _pos: &mut i64,
        _pos_limit: i64,
    ) -> Option<i64> {
        None
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn InputFormat>>,
}

static DEFAULT_FORMATS: Lazy<FormatRegistry> = Lazy::new(|| {
    let mut registry = FormatRegistry::empty();
    for fmt in formats::builtin() {
        registry.register(fmt);
    }
    registry
});

impl Default for FormatRegistry {
    fn default() -> Self {
        DEFAULT_FORMATS.clone()
    }
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self { formats: Vec::new() }
    }

    pub fn register(&mut self, format: Arc<dyn InputFormat>) {
        self.formats.push(format);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn InputFormat>> {
        self.formats.iter()
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn InputFormat>> {
        self.formats.iter().find(|f| f.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    /// Keeps only the formats named in a comma separated whitelist.
    pub fn restricted_to(&self, whitelist: &str) -> Self {
        Self {
            formats: self
                .formats
                .iter()
                .filter(|f| crate::options::list_contains(whitelist, f.name()))
                .cloned()
                .collect(),
        }
    }

    /// Keeps only raw elementary-stream formats, the candidates for
    /// identifying a codec from payload bytes.
    pub fn elementary_only(&self) -> Self {
        Self {
            formats: self.formats.iter().filter(|f| f.raw_codec_id() != CodecId::None).cloned().collect(),
        }
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins() {
        let reg = FormatRegistry::default();
        for name in ["mpegts", "avi", "h264", "aac", "ac3", "mp3"] {
            assert!(reg.find(name).is_some(), "missing {name}");
        }
        assert_eq!(reg.find("h264").map(|f| f.raw_codec_id()), Some(CodecId::H264));
    }

    #[test]
    fn whitelist_restricts_formats() {
        let reg = FormatRegistry::default().restricted_to("avi,mp3");
        assert_eq!(reg.names(), vec!["avi", "mp3"]);
    }
}
