//! Per-file demuxing state shared by the engine and the container demuxers.
//!
//! The demuxer instance itself lives next to this in [`crate::Session`]; every
//! `Demuxer` call borrows the context mutably, so a demuxer reaches the I/O
//! and the stream list only through here.

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::codec::MediaType;
use crate::duration::DurationEstimation;
use crate::error::{DemuxError, Result};
use crate::format::{FormatRegistry, InputFormatFlags};
use crate::index::{IndexFlags, SeekIndex};
use crate::io::IoContext;
use crate::options::{DemuxOptions, FormatFlags, InterruptCallback};
use crate::parser::ParserRegistry;
use crate::queue::PacketQueue;
use crate::rational::Rational;
use crate::stream::{Chapter, Discard, Program, Stream};
use crate::stream_info::AnalysisState;
use crate::timestamps::{is_relative, wrap_timestamp, RELATIVE_TS_BASE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        /// Streams may appear after the header has been read.
        const NOHEADER = 0x0001;
        const UNSEEKABLE = 0x0002;
    }
}

pub struct FormatContext {
    pub(crate) io: Option<IoContext>,
    pub(crate) streams: Vec<Stream>,
    pub(crate) programs: Vec<Program>,
    pub(crate) chapters: Vec<Chapter>,
    pub metadata: HashMap<String, String>,
    pub(crate) options: DemuxOptions,
    pub(crate) format_name: &'static str,
    pub(crate) format_flags: InputFormatFlags,
    pub ctx_flags: ContextFlags,
    /// Microseconds.
    pub start_time: Option<i64>,
    /// Microseconds.
    pub duration: Option<i64>,
    /// bit/s, 0 when unknown.
    pub bit_rate: i64,
    pub(crate) duration_estimation: DurationEstimation,
    /// Offset of the first packet after the header.
    pub(crate) data_offset: i64,
    pub(crate) probe_score: i32,
    pub(crate) url: String,
    pub(crate) interrupt: Option<InterruptCallback>,
    pub(crate) custom_io: bool,

    /// Packets held back while their stream's codec is still being probed.
    pub(crate) raw_buffer: PacketQueue,
    pub(crate) raw_buffer_size: i64,
    /// Frames produced by the codec parsers, not yet returned.
    pub(crate) parse_queue: PacketQueue,
    /// Read-ahead from stream analysis and pts generation.
    pub(crate) packet_buffer: PacketQueue,

    pub(crate) parsers: ParserRegistry,
    /// Elementary-stream formats used to identify codecs from payload bytes.
    pub(crate) codec_probe_formats: FormatRegistry,
}

impl FormatContext {
    pub fn new(options: DemuxOptions) -> Self {
        Self {
            io: None,
            streams: Vec::new(),
            programs: Vec::new(),
            chapters: Vec::new(),
            metadata: HashMap::new(),
            options,
            format_name: "",
            format_flags: InputFormatFlags::empty(),
            ctx_flags: ContextFlags::empty(),
            start_time: None,
            duration: None,
            bit_rate: 0,
            duration_estimation: DurationEstimation::FromPts,
            data_offset: 0,
            probe_score: 0,
            url: String::new(),
            interrupt: None,
            custom_io: false,
            raw_buffer: PacketQueue::new(),
            raw_buffer_size: 0,
            parse_queue: PacketQueue::new(),
            packet_buffer: PacketQueue::new(),
            parsers: ParserRegistry::default(),
            codec_probe_formats: FormatRegistry::default().elementary_only(),
        }
    }

    pub fn options(&self) -> &DemuxOptions {
        &self.options
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format_name(&self) -> &'static str {
        self.format_name
    }

    /// The byte source. Fails for formats that open their own input.
    pub fn io(&mut self) -> Result<&mut IoContext> {
        self.io.as_mut().ok_or_else(|| DemuxError::unsupported("format has no byte source"))
    }

    pub fn has_io(&self) -> bool {
        self.io.is_some()
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|cb| cb())
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, index: usize) -> Result<&Stream> {
        self.streams.get(index).ok_or(DemuxError::StreamNotFound(index))
    }

    pub fn stream_mut(&mut self, index: usize) -> Result<&mut Stream> {
        self.streams.get_mut(index).ok_or(DemuxError::StreamNotFound(index))
    }

    pub fn nb_streams(&self) -> usize {
        self.streams.len()
    }

    /// Appends a stream with the next dense index.
    pub fn new_stream(&mut self) -> Result<&mut Stream> {
        if self.streams.len() >= self.options.max_streams {
            error!(max = self.options.max_streams, "Number of streams exceeds max_streams parameter");
            return Err(DemuxError::invalid_data("too many streams"));
        }
        let index = self.streams.len();
        let mut st = Stream::new(index, self.options.max_probe_packets);
        st.info = Some(Box::default());
        self.streams.push(st);
        Ok(&mut self.streams[index])
    }

    /// Sets a stream's time base and timestamp width. An invalid time base
    /// is logged and ignored.
    pub fn set_pts_info(&mut self, index: usize, pts_wrap_bits: u32, num: u32, den: u32) {
        let Some(st) = self.streams.get_mut(index) else {
            return;
        };
        let (tb, exact) = Rational::reduce(num as i64, den as i64, i32::MAX as i64);
        if !exact || tb.num as u32 != num {
            debug!(stream = index, num, den, reduced_num = tb.num, reduced_den = tb.den, "st time base modified");
        }
        if tb.num <= 0 || tb.den <= 0 {
            error!(stream = index, num = tb.num, den = tb.den, "Ignoring attempt to set invalid timebase");
            return;
        }
        st.time_base = tb;
        st.pts_wrap_bits = pts_wrap_bits;
    }

    /// Stream that best represents the file for seeking and wrap handling.
    pub fn default_stream_index(&self) -> Option<usize> {
        let mut best = None;
        let mut best_score = i32::MIN;
        for (i, st) in self.streams.iter().enumerate() {
            let mut score = 0;
            match st.media_type() {
                MediaType::Video => {
                    if st.is_attached_pic() {
                        score -= 400;
                    }
                    if st.codecpar.width > 0 && st.codecpar.height > 0 {
                        score += 50;
                    }
                    score += 25;
                }
                MediaType::Audio if st.codecpar.sample_rate > 0 => score += 50,
                _ => {}
            }
            if st.codec_info_nb_frames > 0 {
                score += 12;
            }
            if st.discard != Discard::All {
                score += 200;
            }
            if score > best_score {
                best_score = score;
                best = Some(i);
            }
        }
        best
    }

    // ------------------------------------------------------------------------
    // Programs and chapters
    // ------------------------------------------------------------------------

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    /// Returns the program with `id`, creating it if needed.
    pub fn new_program(&mut self, id: i32) -> &mut Program {
        let pos = match self.programs.iter().position(|p| p.id == id) {
            Some(pos) => pos,
            None => {
                self.programs.push(Program::new(id));
                self.programs.len() - 1
            }
        };
        &mut self.programs[pos]
    }

    pub fn add_stream_to_program(&mut self, program_id: i32, stream: usize) {
        let Some(program) = self.programs.iter_mut().find(|p| p.id == program_id) else {
            return;
        };
        if !program.contains(stream) {
            program.stream_indices.push(stream);
        }
    }

    /// Adds or updates a chapter. Chapters with `end < start` are rejected.
    pub fn new_chapter(
        &mut self,
        id: i64,
        time_base: Rational,
        start: i64,
        end: Option<i64>,
        title: Option<&str>,
    ) -> Result<&mut Chapter> {
        if let Some(end) = end {
            if end < start {
                error!(id, start, end, "Chapter end time is before start time");
                return Err(DemuxError::invalid_data("chapter ends before it starts"));
            }
        }
        let pos = match self.chapters.iter().position(|c| c.id == id) {
            Some(pos) => pos,
            None => {
                self.chapters.push(Chapter { id, ..Default::default() });
                self.chapters.len() - 1
            }
        };
        let ch = &mut self.chapters[pos];
        ch.time_base = time_base;
        ch.start = start;
        ch.end = end;
        if let Some(title) = title {
            ch.metadata.insert("title".to_string(), title.to_string());
        }
        Ok(ch)
    }

    // ------------------------------------------------------------------------
    // Seek index
    // ------------------------------------------------------------------------

    /// Records a seek point for `stream`. The timestamp is unwrapped first.
    pub fn add_index_entry(
        &mut self,
        stream: usize,
        pos: i64,
        timestamp: Option<i64>,
        size: i32,
        distance: i32,
        flags: IndexFlags,
    ) -> Option<usize> {
        let st = self.streams.get_mut(stream)?;
        let timestamp = match timestamp {
            Some(ts) if !is_relative(ts) => wrap_timestamp(st, Some(ts)),
            other => other,
        };
        st.index_entries.add(pos, timestamp, size, distance, flags)
    }

    /// Halves the stream's index once it reaches the memory ceiling.
    pub(crate) fn reduce_index(&mut self, stream: usize) {
        let max = SeekIndex::max_entries(self.options.max_index_size);
        if let Some(st) = self.streams.get_mut(stream) {
            st.index_entries.reduce(max);
        }
    }

    pub fn set_no_header(&mut self) {
        self.ctx_flags |= ContextFlags::NOHEADER;
    }

    pub(crate) fn has_flag(&self, flag: FormatFlags) -> bool {
        self.options.has_flag(flag)
    }

    // ------------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------------

    pub(crate) fn flush_packet_queues(&mut self) {
        self.parse_queue.clear();
        self.packet_buffer.clear();
        self.raw_buffer.clear();
        self.raw_buffer_size = 0;
    }

    /// Drops everything buffered and forgets per-stream read state, as after
    /// a seek.
    pub(crate) fn read_frame_flush(&mut self) {
        self.flush_packet_queues();
        let max_probe_packets = self.options.max_probe_packets;
        for st in &mut self.streams {
            st.parser = None;
            st.reset_reorder_state();
            st.cur_dts = if st.first_dts.is_none() { Some(RELATIVE_TS_BASE) } else { None };
            st.probe_packets = max_probe_packets;
            st.skip_samples = 0;
        }
    }

    /// Puts every cover-art packet back in front of the reader.
    pub(crate) fn queue_attached_pictures(&mut self) {
        for st in &self.streams {
            if !st.is_attached_pic() || st.discard >= Discard::All {
                continue;
            }
            match &st.attached_pic {
                Some(pic) if pic.size() > 0 => {
                    self.raw_buffer.push_back(pic.clone());
                }
                _ => warn!(stream = st.index, "Attached picture has invalid size, ignoring"),
            }
        }
    }

    /// Drops the analysis state of every stream.
    pub(crate) fn free_analysis_state(&mut self) {
        for st in &mut self.streams {
            st.info = None;
        }
    }

    pub(crate) fn analysis(&mut self, stream: usize) -> Option<&mut AnalysisState> {
        self.streams.get_mut(stream)?.info.as_deref_mut()
    }
}

impl std::fmt::Debug for FormatContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatContext")
            .field("url", &self.url)
            .field("format", &self.format_name)
            .field("streams", &self.streams.len())
            .field("raw_buffer", &self.raw_buffer.len())
            .field("parse_queue", &self.parse_queue.len())
            .field("packet_buffer", &self.packet_buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::stream::Disposition;

    #[test]
    fn stream_indices_are_dense() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        for i in 0..3 {
            assert_eq!(ctx.new_stream().expect("stream").index, i);
        }
        assert!(ctx.stream(3).is_err());
    }

    #[test]
    fn max_streams_is_enforced() {
        let opts = DemuxOptions { max_streams: 1, ..Default::default() };
        let mut ctx = FormatContext::new(opts);
        ctx.new_stream().expect("first");
        assert!(ctx.new_stream().is_err());
    }

    #[test]
    fn pts_info_reduces_and_rejects_invalid() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_stream().expect("stream");
        ctx.set_pts_info(0, 64, 2, 50);
        assert_eq!(ctx.streams[0].time_base, Rational::new(1, 25));
        assert_eq!(ctx.streams[0].pts_wrap_bits, 64);
        ctx.set_pts_info(0, 33, 1, 0);
        assert_eq!(ctx.streams[0].time_base, Rational::new(1, 25));
    }

    #[test]
    fn default_stream_prefers_real_video() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_stream().expect("a").codecpar.set_codec(CodecId::Aac);
        let cover = ctx.new_stream().expect("cover");
        cover.codecpar.set_codec(CodecId::Mjpeg);
        cover.disposition |= Disposition::ATTACHED_PIC;
        let v = ctx.new_stream().expect("v");
        v.codecpar.set_codec(CodecId::H264);
        v.codecpar.width = 640;
        v.codecpar.height = 480;
        assert_eq!(ctx.default_stream_index(), Some(2));

        ctx.streams[2].discard = Discard::All;
        assert_eq!(ctx.default_stream_index(), Some(0));
        assert_eq!(FormatContext::new(DemuxOptions::default()).default_stream_index(), None);
    }

    #[test]
    fn programs_and_chapters() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_program(1).program_num = 1;
        ctx.add_stream_to_program(1, 0);
        ctx.add_stream_to_program(1, 0);
        assert_eq!(ctx.programs()[0].stream_indices, vec![0]);

        ctx.new_chapter(7, Rational::new(1, 1000), 0, Some(500), Some("Intro")).expect("chapter");
        ctx.new_chapter(7, Rational::new(1, 1000), 100, None, None).expect("update");
        assert_eq!(ctx.chapters().len(), 1);
        assert_eq!(ctx.chapters()[0].start, 100);
        assert!(ctx.new_chapter(8, Rational::new(1, 1000), 10, Some(5), None).is_err());
    }

    #[test]
    fn read_frame_flush_resets_streams() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_stream().expect("a");
        ctx.new_stream().expect("b");
        ctx.streams[0].first_dts = Some(0);
        ctx.streams[1].probe_packets = 0;
        ctx.raw_buffer.push_back(crate::packet::Packet::default());
        ctx.raw_buffer_size = 10;
        ctx.read_frame_flush();
        assert_eq!(ctx.streams[0].cur_dts(), None);
        assert_eq!(ctx.streams[1].cur_dts(), Some(RELATIVE_TS_BASE));
        assert_eq!(ctx.streams[1].probe_packets, ctx.options.max_probe_packets);
        assert!(ctx.raw_buffer.is_empty());
        assert_eq!(ctx.raw_buffer_size, 0);
    }
}
