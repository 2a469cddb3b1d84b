//! Streams, programs and chapters.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::Serialize;

use crate::codec::{CodecParameters, MediaType};
use crate::index::SeekIndex;
use crate::packet::Packet;
use crate::parser::ParserContext;
use crate::rational::Rational;
use crate::stream_info::AnalysisState;
use crate::timestamps::{MAX_REORDER_DELAY, RELATIVE_TS_BASE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Disposition: u32 {
        const DEFAULT = 0x0001;
        const DUB = 0x0002;
        const ORIGINAL = 0x0004;
        const COMMENT = 0x0008;
        const LYRICS = 0x0010;
        const KARAOKE = 0x0020;
        const FORCED = 0x0040;
        const HEARING_IMPAIRED = 0x0080;
        const VISUAL_IMPAIRED = 0x0100;
        const CLEAN_EFFECTS = 0x0200;
        /// Single cover-art packet carried in `Stream::attached_pic`.
        const ATTACHED_PIC = 0x0400;
        const CAPTIONS = 0x10000;
        const DESCRIPTIONS = 0x20000;
        const METADATA = 0x40000;
    }
}

/// Which packets of a stream the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum Discard {
    None,
    #[default]
    Default,
    NonRef,
    Bidir,
    NonIntra,
    NonKey,
    All,
}

/// How much a codec parser should be involved with a stream's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum NeedParsing {
    #[default]
    None,
    /// Split and inspect every packet.
    Full,
    /// Packets are whole frames; only read headers.
    Headers,
    /// Only interpolate timestamps.
    Timestamps,
    /// Split the first frame fully, then treat packets as whole frames.
    FullOnce,
    /// Split, and take byte positions from the parser.
    FullRaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum WrapBehavior {
    #[default]
    Ignore,
    /// Timestamps below the reference have wrapped; add `2^bits`.
    AddOffset,
    /// Timestamps at or above the reference predate the wrap; subtract `2^bits`.
    SubOffset,
}

#[derive(Debug)]
pub struct Stream {
    pub index: usize,
    /// Container-specific id (PID, track number).
    pub id: i32,
    pub codecpar: CodecParameters,
    pub time_base: Rational,
    pub start_time: Option<i64>,
    pub duration: Option<i64>,
    /// 0 when unknown.
    pub nb_frames: i64,
    pub disposition: Disposition,
    pub discard: Discard,
    pub metadata: HashMap<String, String>,
    pub avg_frame_rate: Rational,
    /// Lowest rate at which all timestamps can be represented exactly.
    pub r_frame_rate: Rational,
    pub attached_pic: Option<Packet>,
    pub pts_wrap_bits: u32,
    pub need_parsing: NeedParsing,
    /// > 0 while the codec is still being sniffed from payload bytes; the
    /// value is the minimum score a raw-format match must beat.
    pub request_probe: i32,

    pub(crate) first_dts: Option<i64>,
    pub(crate) cur_dts: Option<i64>,
    pub(crate) last_ip_pts: Option<i64>,
    pub(crate) last_ip_duration: i64,
    pub(crate) pts_wrap_reference: Option<i64>,
    pub(crate) pts_wrap_behavior: WrapBehavior,
    pub(crate) parser: Option<ParserContext>,
    pub(crate) probe_data: Vec<u8>,
    pub(crate) probe_packets: i32,
    pub(crate) pts_buffer: [Option<i64>; MAX_REORDER_DELAY + 1],
    pub(crate) pts_reorder_error: [i64; MAX_REORDER_DELAY + 1],
    pub(crate) pts_reorder_error_count: [u8; MAX_REORDER_DELAY + 1],
    pub(crate) dts_ordered: i32,
    pub(crate) dts_misordered: i32,
    pub(crate) last_dts_for_order_check: Option<i64>,
    /// Decoder reorder depth.
    pub(crate) has_b_frames: i32,
    pub(crate) skip_samples: i64,
    pub(crate) start_skip_samples: i64,
    pub(crate) first_discard_sample: i64,
    pub(crate) last_discard_sample: i64,
    pub(crate) skip_to_keyframe: bool,
    pub(crate) update_initial_durations_done: bool,
    pub(crate) need_context_update: bool,
    pub(crate) codec_info_nb_frames: i32,
    pub(crate) info: Option<Box<AnalysisState>>,
    pub(crate) index_entries: SeekIndex,
}

impl Stream {
    pub(crate) fn new(index: usize, max_probe_packets: i32) -> Self {
        Self {
            index,
            id: 0,
            codecpar: CodecParameters::default(),
            time_base: Rational::new(1, 90_000),
            start_time: None,
            duration: None,
            nb_frames: 0,
            disposition: Disposition::empty(),
            discard: Discard::Default,
            metadata: HashMap::new(),
            avg_frame_rate: Rational::default(),
            r_frame_rate: Rational::default(),
            attached_pic: None,
            pts_wrap_bits: 33,
            need_parsing: NeedParsing::None,
            request_probe: 0,
            first_dts: None,
            cur_dts: Some(RELATIVE_TS_BASE),
            last_ip_pts: None,
            last_ip_duration: 0,
            pts_wrap_reference: None,
            pts_wrap_behavior: WrapBehavior::Ignore,
            parser: None,
            probe_data: Vec::new(),
            probe_packets: max_probe_packets,
            pts_buffer: [None; MAX_REORDER_DELAY + 1],
            pts_reorder_error: [0; MAX_REORDER_DELAY + 1],
            pts_reorder_error_count: [0; MAX_REORDER_DELAY + 1],
            dts_ordered: 0,
            dts_misordered: 0,
            last_dts_for_order_check: None,
            has_b_frames: 0,
            skip_samples: 0,
            start_skip_samples: 0,
            first_discard_sample: 0,
            last_discard_sample: 0,
            skip_to_keyframe: false,
            update_initial_durations_done: false,
            need_context_update: true,
            codec_info_nb_frames: 0,
            info: None,
            index_entries: SeekIndex::new(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.codecpar.codec_type
    }

    pub fn is_attached_pic(&self) -> bool {
        self.disposition.contains(Disposition::ATTACHED_PIC)
    }

    pub fn first_dts(&self) -> Option<i64> {
        self.first_dts
    }

    /// Timestamp the next packet is expected to carry.
    pub fn cur_dts(&self) -> Option<i64> {
        self.cur_dts
    }

    pub fn wrap_reference(&self) -> Option<i64> {
        self.pts_wrap_reference
    }

    pub fn wrap_behavior(&self) -> WrapBehavior {
        self.pts_wrap_behavior
    }

    pub fn index_entries(&self) -> &SeekIndex {
        &self.index_entries
    }

    /// Frames seen so far by stream analysis.
    pub fn codec_info_frames(&self) -> i32 {
        self.codec_info_nb_frames
    }

    /// Samples to drop at the start of decoding (encoder delay).
    pub fn set_start_skip_samples(&mut self, samples: i64) {
        self.start_skip_samples = samples;
        self.skip_samples = samples;
    }

    /// Sample range, counted from the stream start, to mark as padding.
    pub fn set_discard_samples(&mut self, first: i64, last: i64) {
        self.first_discard_sample = first;
        self.last_discard_sample = last;
    }

    pub(crate) fn reset_reorder_state(&mut self) {
        self.pts_buffer = [None; MAX_REORDER_DELAY + 1];
        self.last_ip_pts = None;
        self.last_dts_for_order_check = None;
    }

    pub(crate) fn summary(&self) -> StreamSummary {
        StreamSummary {
            index: self.index,
            id: self.id,
            codec: self.codecpar.clone(),
            time_base: self.time_base,
            start_time: self.start_time,
            duration: self.duration,
            nb_frames: self.nb_frames,
            avg_frame_rate: self.avg_frame_rate,
            r_frame_rate: self.r_frame_rate,
            disposition: self.disposition,
            language: self.metadata.get("language").cloned(),
        }
    }
}

/// Serializable snapshot of a stream for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub index: usize,
    pub id: i32,
    pub codec: CodecParameters,
    pub time_base: Rational,
    pub start_time: Option<i64>,
    pub duration: Option<i64>,
    pub nb_frames: i64,
    pub avg_frame_rate: Rational,
    pub r_frame_rate: Rational,
    pub disposition: Disposition,
    pub language: Option<String>,
}

/// A group of streams presented together (an MPEG-TS program).
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub id: i32,
    pub program_num: i32,
    pub pmt_pid: i32,
    pub stream_indices: Vec<usize>,
    pub metadata: HashMap<String, String>,
    pub discard: Discard,
    /// Microseconds.
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub(crate) pts_wrap_reference: Option<i64>,
    pub(crate) pts_wrap_behavior: WrapBehavior,
}

impl Program {
    pub fn new(id: i32) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn contains(&self, stream: usize) -> bool {
        self.stream_indices.contains(&stream)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Chapter {
    pub id: i64,
    pub time_base: Rational,
    pub start: i64,
    /// `None` until filled from the next chapter or the file duration.
    pub end: Option<i64>,
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stream_defaults() {
        let st = Stream::new(3, 2500);
        assert_eq!(st.index, 3);
        assert_eq!(st.time_base, Rational::new(1, 90_000));
        assert_eq!(st.pts_wrap_bits, 33);
        assert_eq!(st.cur_dts(), Some(RELATIVE_TS_BASE));
        assert_eq!(st.first_dts(), None);
        assert_eq!(st.probe_packets, 2500);
        assert!(st.pts_buffer.iter().all(Option::is_none));
    }

    #[test]
    fn discard_levels_are_ordered() {
        assert!(Discard::None < Discard::Default);
        assert!(Discard::NonKey < Discard::All);
    }

    #[test]
    fn skip_sample_setters() {
        let mut st = Stream::new(0, 1);
        st.set_start_skip_samples(1024);
        st.set_discard_samples(4000, 4100);
        assert_eq!(st.skip_samples, 1024);
        assert_eq!(st.start_skip_samples, 1024);
        assert_eq!((st.first_discard_sample, st.last_discard_sample), (4000, 4100));
    }
}
