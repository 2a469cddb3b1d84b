//! Public entry point: open an input, analyse it, read packets, seek, close.
//!
//! ```no_run
//! use slain_demux::{OpenOptions, Session};
//!
//! let mut session = Session::open_input("movie.ts", None, OpenOptions::default())?;
//! session.find_stream_info()?;
//! while let Ok(pkt) = session.read_frame() {
//!     println!("stream {} pts {:?}", pkt.stream_index, pkt.pts);
//! }
//! session.close_input()?;
//! # Ok::<(), slain_demux::DemuxError>(())
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::FormatContext;
use crate::duration::DurationEstimation;
use crate::error::{DemuxError, Result};
use crate::format::{Demuxer, FormatRegistry, InputFormat, InputFormatFlags, ProbeData};
use crate::io::IoContext;
use crate::options::{list_contains, DemuxOptions, OpenOptions, TagHandler, TagPolicy};
use crate::probe::{probe_input_buffer, probe_input_format, SCORE_MAX, SCORE_RETRY};
use crate::protocol::{ProtocolFlags, ProtocolRegistry, Whence};
use crate::stream::{Chapter, Program, Stream, StreamSummary};

/// Bytes handed to [`TagHandler::probe_len`].
const TAG_PEEK_LEN: usize = 10;

/// An open input.
pub struct Session {
    pub(crate) ctx: FormatContext,
    pub(crate) demuxer: Box<dyn Demuxer>,
    format: Arc<dyn InputFormat>,
}

/// Serializable description of an opened input.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub url: String,
    pub format_name: &'static str,
    pub format_long_name: &'static str,
    pub probe_score: i32,
    /// Microseconds.
    pub start_time: Option<i64>,
    /// Microseconds.
    pub duration: Option<i64>,
    pub duration_estimation: DurationEstimation,
    pub bit_rate: i64,
    pub streams: Vec<StreamSummary>,
    pub chapters: Vec<Chapter>,
    pub programs: usize,
    pub metadata: HashMap<String, String>,
}

fn format_registry(options: &DemuxOptions) -> FormatRegistry {
    match options.format_whitelist.as_deref() {
        Some(list) => FormatRegistry::default().restricted_to(list),
        None => FormatRegistry::default(),
    }
}

fn forced_format(registry: &FormatRegistry, name: Option<&str>) -> Result<Option<Arc<dyn InputFormat>>> {
    match name {
        None => Ok(None),
        Some(name) => registry
            .find(name)
            .map(Some)
            .ok_or_else(|| DemuxError::unsupported(format!("unknown input format '{}'", name))),
    }
}

impl Session {
    /// Opens `url` through the protocol registry and identifies its format,
    /// unless `forced` names one.
    pub fn open_input(url: &str, forced: Option<&str>, options: OpenOptions) -> Result<Self> {
        let registry = format_registry(&options.demux);
        let mut format = forced_format(&registry, forced)?;
        let mut score = if format.is_some() { SCORE_MAX } else { SCORE_RETRY };

        if format.is_none() {
            // formats that open their own input only get the file name
            let pd = ProbeData::new(url, &[]);
            if let (Some(fmt), s) = probe_input_format(&pd, false, &registry) {
                format = Some(fmt);
                score = s;
            }
        }

        let nofile = format.as_ref().is_some_and(|f| f.flags().contains(InputFormatFlags::NOFILE));
        if nofile {
            let Some(format) = format else {
                return Err(DemuxError::unsupported("no format for input"));
            };
            return Self::open_with_format(None, url, format, score, options);
        }

        let demux = &options.demux;
        let mut url_ctx = ProtocolRegistry::default().open(
            url,
            ProtocolFlags::READ,
            demux.protocol_whitelist.as_deref(),
            demux.protocol_blacklist.as_deref(),
        )?;
        url_ctx.rw_timeout = demux.rw_timeout.map(|us| Duration::from_micros(us.max(0) as u64));
        url_ctx.interrupt = options.interrupt.clone();
        let mut io = IoContext::from_url(url_ctx, demux.io_buffer_size, false);
        io.set_short_seek_threshold(demux.short_seek_threshold);

        let (format, score) = match format {
            Some(format) => (format, score),
            None => probe_input_buffer(&mut io, url, None, &registry, demux.format_probesize)?,
        };
        Self::open_with_format(Some(io), url, format, score, options)
    }

    /// Opens an input from a caller-supplied byte source. `url_hint` only
    /// feeds extension matching and log messages. The source is handed back
    /// by [`Session::close_input`].
    pub fn open_io(io: IoContext, url_hint: &str, forced: Option<&str>, options: OpenOptions) -> Result<Self> {
        let registry = format_registry(&options.demux);
        let mut io = io;
        let (format, score) = match forced_format(&registry, forced)? {
            Some(format) => {
                if format.flags().contains(InputFormatFlags::NOFILE) {
                    warn!(format = format.name(), "Custom I/O makes no sense with a format that opens its own input");
                }
                (format, SCORE_MAX)
            }
            None => probe_input_buffer(&mut io, url_hint, None, &registry, options.demux.format_probesize)?,
        };
        let mut session = Self::open_with_format(Some(io), url_hint, format, score, options)?;
        session.ctx.custom_io = true;
        Ok(session)
    }

    /// Runs the open sequence once the format is known.
    pub(crate) fn open_with_format(
        io: Option<IoContext>,
        url: &str,
        format: Arc<dyn InputFormat>,
        score: i32,
        options: OpenOptions,
    ) -> Result<Self> {
        if let Some(list) = options.demux.format_whitelist.as_deref() {
            if !list_contains(list, format.name()) {
                error!(format = format.name(), whitelist = list, "Format not on whitelist");
                return Err(DemuxError::NotAllowed(format!("format '{}' not on whitelist '{}'", format.name(), list)));
            }
        }

        let mut ctx = FormatContext::new(options.demux);
        ctx.url = url.to_string();
        ctx.interrupt = options.interrupt;
        ctx.format_name = format.name();
        ctx.format_flags = format.flags();
        ctx.probe_score = score;
        ctx.io = if format.flags().contains(InputFormatFlags::NOFILE) { None } else { io };

        let skip = ctx.options.skip_initial_bytes;
        if skip > 0 {
            ctx.io()?.skip(skip)?;
        }

        let tag_metadata = match options.tag_handler.as_deref() {
            Some(handler) => read_leading_tags(&mut ctx, handler)?,
            None => HashMap::new(),
        };

        let mut demuxer = format.create();
        if let Err(e) = demuxer.read_header(&mut ctx) {
            debug!(format = format.name(), error = %e, "read_header failed");
            if let Err(close) = demuxer.read_close(&mut ctx) {
                warn!(format = format.name(), error = %close, "read_close after failed header");
            }
            return Err(e);
        }

        if ctx.metadata.is_empty() {
            ctx.metadata = tag_metadata;
        } else if !tag_metadata.is_empty() {
            warn!("Discarding ID3 tags because more suitable tags were found.");
        }

        ctx.queue_attached_pictures();

        if ctx.data_offset == 0 {
            if let Some(io) = ctx.io.as_ref() {
                ctx.data_offset = io.tell();
            }
        }
        ctx.raw_buffer_size = 0;

        info!(
            url,
            format = format.name(),
            score,
            streams = ctx.streams.len(),
            data_offset = ctx.data_offset,
            "Input opened"
        );
        Ok(Self { ctx, demuxer, format })
    }

    /// Ends the session. Returns the byte source when the caller supplied it.
    pub fn close_input(mut self) -> Result<Option<IoContext>> {
        let closed = self.demuxer.read_close(&mut self.ctx);
        self.ctx.flush_packet_queues();
        let io = self.ctx.io.take();
        let io = match io {
            Some(io) if self.ctx.custom_io => Some(io),
            Some(io) => {
                io.close()?;
                None
            }
            None => None,
        };
        closed?;
        debug!(url = %self.ctx.url, "Input closed");
        Ok(io)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn context(&self) -> &FormatContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut FormatContext {
        &mut self.ctx
    }

    pub fn streams(&self) -> &[Stream] {
        &self.ctx.streams
    }

    /// For changing a stream's discard level between reads.
    pub fn stream_mut(&mut self, index: usize) -> Result<&mut Stream> {
        self.ctx.stream_mut(index)
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.ctx.chapters
    }

    pub fn programs(&self) -> &[Program] {
        &self.ctx.programs
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.ctx.metadata
    }

    /// Microseconds.
    pub fn duration(&self) -> Option<i64> {
        self.ctx.duration
    }

    /// Microseconds.
    pub fn start_time(&self) -> Option<i64> {
        self.ctx.start_time
    }

    pub fn bit_rate(&self) -> i64 {
        self.ctx.bit_rate
    }

    pub fn probe_score(&self) -> i32 {
        self.ctx.probe_score
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    pub fn format_long_name(&self) -> &'static str {
        self.format.long_name()
    }

    pub fn duration_estimation(&self) -> DurationEstimation {
        self.ctx.duration_estimation
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            url: self.ctx.url.clone(),
            format_name: self.format.name(),
            format_long_name: self.format.long_name(),
            probe_score: self.ctx.probe_score,
            start_time: self.ctx.start_time,
            duration: self.ctx.duration,
            duration_estimation: self.ctx.duration_estimation,
            bit_rate: self.ctx.bit_rate,
            streams: self.ctx.streams.iter().map(Stream::summary).collect(),
            chapters: self.ctx.chapters.clone(),
            programs: self.ctx.programs.len(),
            metadata: self.ctx.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("format", &self.format.name()).field("ctx", &self.ctx).finish()
    }
}

/// Hands every tag block at the current position to `handler` and skips
/// past it. Returns the metadata the handler extracted.
fn read_leading_tags(ctx: &mut FormatContext, handler: &dyn TagHandler) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    let policy = ctx.options.tag_policy;
    let Some(io) = ctx.io.as_mut() else {
        return Ok(metadata);
    };

    loop {
        let start = io.tell();
        let mut header = [0u8; TAG_PEEK_LEN];
        let n = match io.read(&mut header) {
            Ok(n) => n,
            Err(DemuxError::Eof) => 0,
            Err(e) => return Err(e),
        };
        io.seek(start, Whence::Start)?;
        let Some(len) = handler.probe_len(&header[..n]).filter(|&len| len > 0) else {
            break;
        };

        let tag = match io.read_bytes(len) {
            Ok(tag) if tag.len() == len => tag,
            Ok(_) | Err(DemuxError::Eof) => {
                if policy == TagPolicy::Strict {
                    return Err(DemuxError::invalid_data("tag runs past end of input"));
                }
                warn!(offset = start, len, "Truncated tag, ignoring");
                io.seek(start, Whence::Start)?;
                break;
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = handler.parse(&tag, &mut metadata) {
            if policy == TagPolicy::Strict {
                return Err(DemuxError::invalid_data(format!("malformed tag at {}: {}", start, e)));
            }
            warn!(offset = start, len, error = %e, "Skipping malformed tag");
        }
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecId, MediaType};
    use crate::testing::{init_test_logging, open_synth, synth_file, ScriptedPacket, SynthFormat};
    use crate::timestamps::is_relative;
    use bytes::Bytes;

    struct PrefixTags;

    impl TagHandler for PrefixTags {
        fn probe_len(&self, header: &[u8]) -> Option<usize> {
            if header.len() >= 4 && &header[..3] == b"TAG" {
                Some(header[3] as usize)
            } else {
                None
            }
        }

        fn parse(&self, tag: &[u8], metadata: &mut HashMap<String, String>) -> Result<()> {
            let body = std::str::from_utf8(&tag[4..]).map_err(|_| DemuxError::invalid_data("tag text"))?;
            let (key, value) = body.split_once('=').ok_or_else(|| DemuxError::invalid_data("tag pair"))?;
            metadata.insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    fn tag(body: &str) -> Vec<u8> {
        let mut out = b"TAG".to_vec();
        out.push((body.len() + 4) as u8);
        out.extend_from_slice(body.as_bytes());
        out
    }

    fn synth_bytes(n: i64) -> Vec<u8> {
        let packets: Vec<_> = (0..n)
            .map(|i| ScriptedPacket::new(0, vec![0x11; 32]).pts(i * 40).dts(i * 40).duration(40).key())
            .collect();
        synth_file(&[CodecId::Mpeg4], &packets, 1000)
    }

    fn open_synth_bytes(data: Vec<u8>, options: OpenOptions) -> Result<Session> {
        let io = IoContext::from_bytes(Bytes::from(data));
        Session::open_with_format(Some(io), "clip.synth", Arc::new(SynthFormat::new(InputFormatFlags::empty())), SCORE_MAX, options)
    }

    #[test]
    fn leading_tags_become_metadata() {
        init_test_logging();
        let mut data = tag("title=Intro");
        data.extend(tag("artist=Nobody"));
        data.extend(synth_bytes(3));
        let opts = OpenOptions::default().with_tag_handler(Arc::new(PrefixTags));
        let mut session = open_synth_bytes(data, opts).expect("open");
        assert_eq!(session.metadata().get("title").map(String::as_str), Some("Intro"));
        assert_eq!(session.metadata().get("artist").map(String::as_str), Some("Nobody"));
        assert_eq!(session.read_frame().expect("frame").pts, Some(0));
    }

    #[test]
    fn malformed_tag_policy() {
        let mut data = tag("no-separator");
        data.extend(synth_bytes(2));

        let lenient = OpenOptions::default().with_tag_handler(Arc::new(PrefixTags));
        let session = open_synth_bytes(data.clone(), lenient).expect("lenient open");
        assert!(session.metadata().is_empty());
        assert_eq!(session.streams().len(), 1);

        let mut strict = OpenOptions::default().with_tag_handler(Arc::new(PrefixTags));
        strict.demux.tag_policy = TagPolicy::Strict;
        assert!(matches!(open_synth_bytes(data, strict), Err(DemuxError::InvalidData(_))));
    }

    #[test]
    fn skip_initial_bytes_and_whitelist() {
        let mut data = vec![0xEE; 7];
        data.extend(synth_bytes(2));
        let mut opts = OpenOptions::default();
        opts.demux.skip_initial_bytes = 7;
        let session = open_synth_bytes(data.clone(), opts).expect("skipped junk");
        assert_eq!(session.streams().len(), 1);

        let mut opts = OpenOptions::default();
        opts.demux.format_whitelist = Some("mpegts,avi".to_string());
        assert!(matches!(open_synth_bytes(data, opts), Err(DemuxError::NotAllowed(_))));
    }

    #[test]
    fn open_io_probes_builtin_formats() {
        let mut frames = Vec::new();
        for _ in 0..20 {
            frames.extend(crate::parsers::adts::tests::adts_frame(200));
        }
        let io = IoContext::from_bytes(Bytes::from(frames));
        let mut session = Session::open_io(io, "stream.bin", None, OpenOptions::default()).expect("open");
        assert_eq!(session.format_name(), "aac");
        assert!(session.probe_score() > SCORE_RETRY);
        session.find_stream_info().expect("info");
        assert_eq!(session.streams()[0].codecpar.codec_id, CodecId::Aac);
        assert_eq!(session.streams()[0].codecpar.sample_rate, 48_000);

        let info = session.info();
        assert_eq!(info.format_name, "aac");
        let json = serde_json::to_value(&info).expect("json");
        assert_eq!(json["streams"][0]["codec"]["sample_rate"], 48_000);

        let io = session.close_input().expect("close");
        assert!(io.is_some());
    }

    #[test]
    fn open_input_reads_memory_urls() {
        crate::protocol::register_memory_buffer("session-test-clip", Bytes::from(synth_bytes(1)));
        let err = Session::open_input("memory:session-test-clip", Some("nope"), OpenOptions::default());
        assert!(matches!(err, Err(DemuxError::Unsupported(_))));

        let mut opts = OpenOptions::default();
        opts.demux.protocol_whitelist = Some("file".to_string());
        let err = Session::open_input("memory:session-test-clip", None, opts);
        assert!(matches!(err, Err(DemuxError::NotAllowed(_))));
        crate::protocol::unregister_memory_buffer("session-test-clip");
    }

    /// Ten streams, one of which never carries timestamps: after analysis
    /// every stream has a usable dts and dts never runs backwards.
    #[test]
    fn many_streams_end_to_end() {
        const BASE: i64 = 900_000;
        let mut codecs = vec![CodecId::Mpeg4];
        codecs.extend(std::iter::repeat(CodecId::Mp2).take(8));
        codecs.push(CodecId::Mp2);

        let mut packets = Vec::new();
        for k in 0..60i64 {
            packets.push(
                ScriptedPacket::new(0, vec![0x20; 64]).pts(BASE + k * 3600).dts(BASE + k * 3600).duration(3600).key(),
            );
            for s in 1..9usize {
                let ts = BASE + k * 2160;
                packets.push(ScriptedPacket::new(s, vec![s as u8; 48]).pts(ts).dts(ts).duration(2160).key());
            }
            packets.push(ScriptedPacket::new(9, vec![0x77; 48]).duration(2160).key());
        }
        let mut session = open_synth(SynthFormat::new(InputFormatFlags::empty()), &codecs, packets, 90_000);
        session.find_stream_info().expect("info");

        for st in session.streams() {
            assert!(st.cur_dts().is_some(), "stream {} has no cur_dts", st.index);
            assert_eq!(st.media_type(), if st.index == 0 { MediaType::Video } else { MediaType::Audio });
        }
        assert_eq!(session.start_time(), Some(10_000_000));

        let mut last = vec![i64::MIN; codecs.len()];
        let mut count = 0;
        while let Ok(pkt) = session.read_frame() {
            if let Some(dts) = pkt.dts {
                assert!(!is_relative(dts));
                assert!(dts >= last[pkt.stream_index], "stream {} went backwards", pkt.stream_index);
                last[pkt.stream_index] = dts;
            }
            count += 1;
        }
        assert_eq!(count, 600);
        assert!(last[9] > i64::MIN);
    }

    struct BrokenHeader {
        closes: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl InputFormat for BrokenHeader {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn long_name(&self) -> &'static str {
            "header that never parses"
        }

        fn create(&self) -> Box<dyn Demuxer> {
            Box::new(BrokenDemuxer { closes: self.closes.clone() })
        }
    }

    struct BrokenDemuxer {
        closes: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Demuxer for BrokenDemuxer {
        fn read_header(&mut self, _ctx: &mut FormatContext) -> Result<()> {
            Err(DemuxError::invalid_data("bad header"))
        }

        fn read_packet(&mut self, _ctx: &mut FormatContext) -> Result<crate::packet::Packet> {
            Err(DemuxError::Eof)
        }

        fn read_close(&mut self, _ctx: &mut FormatContext) -> Result<()> {
            self.closes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(DemuxError::unsupported("close failed too"))
        }
    }

    #[test]
    fn header_error_wins_over_close_error() {
        init_test_logging();
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let format = Arc::new(BrokenHeader { closes: closes.clone() });
        let io = IoContext::from_bytes(Bytes::from_static(b"anything"));
        let err = Session::open_with_format(Some(io), "x.bin", format, SCORE_MAX, OpenOptions::default())
            .err()
            .expect("open fails");
        assert!(matches!(err, DemuxError::InvalidData(ref m) if m == "bad header"), "{err}");
        assert_eq!(closes.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
