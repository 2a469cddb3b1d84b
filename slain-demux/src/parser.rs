//! Codec parsers: split container payloads into frames and read what the
//! frame headers reveal.
//!
//! A [`CodecParser`] only knows its bitstream. [`ParserContext`] adds frame
//! reassembly across packets and maps input timestamps onto output frames:
//! the last four input packets are remembered by byte range, and every
//! output frame takes the timestamps of the packet its first byte came
//! from.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::codec::{CodecId, CodecParameters};
use crate::parsers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PictType {
    #[default]
    None,
    I,
    P,
    B,
    S,
    Si,
    Sp,
}

/// What a parser learned about one output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// 1 key, 0 not key, -1 unknown (decided from `pict_type`).
    pub key_frame: i32,
    pub pict_type: PictType,
    /// Samples for audio; 0 when unknown.
    pub duration: i32,
    /// Extra fields the frame is displayed for.
    pub repeat_pict: i32,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self { key_frame: -1, pict_type: PictType::I, duration: 0, repeat_pict: 0 }
    }
}

pub trait CodecParser: Send {
    fn codec_ids(&self) -> &'static [CodecId];

    /// Offset of the next frame start in `data`, which begins at a frame
    /// start. `None` means the current frame continues past the end.
    fn find_frame_end(&mut self, data: &[u8]) -> Option<usize>;

    /// Reads the headers of a complete frame.
    fn inspect(&mut self, frame: &[u8], info: &mut FrameInfo, codec: &mut CodecParameters);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParserFlags: u32 {
        /// Input packets are whole frames.
        const COMPLETE_FRAMES = 0x0001;
        /// Split only until the first frame is out.
        const ONCE = 0x0002;
        const FETCHED_OFFSET = 0x0004;
        /// Output positions come from the parser, not the packets.
        const USE_CODEC_TS = 0x1000;
    }
}

const PTS_SLOTS: usize = 4;

/// Parser state copied out for timestamp computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParserState {
    pub pict_type: PictType,
    pub repeat_pict: i32,
    /// Bytes between the start of the input packet and the current frame.
    pub offset: i64,
}

pub struct ParserContext {
    parser: Box<dyn CodecParser>,
    codec_id: CodecId,
    pub(crate) flags: ParserFlags,
    pending: Vec<u8>,
    got_first: bool,

    cur_offset: i64,
    next_frame_offset: i64,
    pub(crate) frame_offset: i64,
    cur_frame_start_index: usize,
    cur_frame_offset: [i64; PTS_SLOTS],
    cur_frame_end: [i64; PTS_SLOTS],
    cur_frame_pts: [Option<i64>; PTS_SLOTS],
    cur_frame_dts: [Option<i64>; PTS_SLOTS],
    cur_frame_pos: [i64; PTS_SLOTS],
    fetch_timestamp: bool,

    pub(crate) pts: Option<i64>,
    pub(crate) dts: Option<i64>,
    pub(crate) pos: i64,
    pub(crate) offset: i64,
    pub(crate) last_pts: Option<i64>,
    pub(crate) last_dts: Option<i64>,
    pub(crate) last_pos: i64,

    pub(crate) key_frame: i32,
    pub(crate) pict_type: PictType,
    pub(crate) repeat_pict: i32,
    pub(crate) duration: i32,
}

impl ParserContext {
    pub fn new(parser: Box<dyn CodecParser>, codec_id: CodecId) -> Self {
        Self {
            parser,
            codec_id,
            flags: ParserFlags::empty(),
            pending: Vec::new(),
            got_first: false,
            cur_offset: 0,
            next_frame_offset: 0,
            frame_offset: 0,
            cur_frame_start_index: 0,
            cur_frame_offset: [0; PTS_SLOTS],
            cur_frame_end: [0; PTS_SLOTS],
            cur_frame_pts: [None; PTS_SLOTS],
            cur_frame_dts: [None; PTS_SLOTS],
            cur_frame_pos: [0; PTS_SLOTS],
            fetch_timestamp: true,
            pts: None,
            dts: None,
            pos: -1,
            offset: 0,
            last_pts: None,
            last_dts: None,
            last_pos: -1,
            key_frame: -1,
            pict_type: PictType::I,
            repeat_pict: 0,
            duration: 0,
        }
    }

    pub fn codec_id(&self) -> CodecId {
        self.codec_id
    }

    pub(crate) fn state(&self) -> ParserState {
        ParserState { pict_type: self.pict_type, repeat_pict: self.repeat_pict, offset: self.offset }
    }

    /// Feeds `buf` (empty to flush) and returns the bytes consumed plus a
    /// frame if one completed. `pts`, `dts` and `pos` (-1 when unknown)
    /// describe the packet `buf` starts.
    pub fn parse(
        &mut self,
        codec: &mut CodecParameters,
        buf: &[u8],
        pts: Option<i64>,
        dts: Option<i64>,
        pos: i64,
    ) -> (usize, Option<Bytes>) {
        if !self.flags.contains(ParserFlags::FETCHED_OFFSET) {
            self.next_frame_offset = pos;
            self.cur_offset = pos;
            self.flags |= ParserFlags::FETCHED_OFFSET;
        }

        let size = buf.len() as i64;
        if size > 0 && self.cur_offset + size != self.cur_frame_end[self.cur_frame_start_index] {
            let i = (self.cur_frame_start_index + 1) & (PTS_SLOTS - 1);
            self.cur_frame_start_index = i;
            self.cur_frame_offset[i] = self.cur_offset;
            self.cur_frame_end[i] = self.cur_offset + size;
            self.cur_frame_pts[i] = pts;
            self.cur_frame_dts[i] = dts;
            self.cur_frame_pos[i] = pos;
        }

        if self.fetch_timestamp {
            self.fetch_timestamp = false;
            self.last_pts = self.pts;
            self.last_dts = self.dts;
            self.last_pos = self.pos;
            self.fetch(0, false, false);
        }

        let (index, out) = self.split(codec, buf);
        if out.is_some() {
            self.frame_offset = self.next_frame_offset;
            self.next_frame_offset = self.cur_offset + index;
            self.fetch_timestamp = true;
        }
        let index = index.max(0);
        self.cur_offset += index;
        (index as usize, out)
    }

    fn fetch(&mut self, off: i64, remove: bool, fuzzy: bool) {
        if !fuzzy {
            self.dts = None;
            self.pts = None;
            self.pos = -1;
            self.offset = 0;
        }
        for i in 0..PTS_SLOTS {
            let first_frame = self.frame_offset == 0 && self.next_frame_offset == 0;
            if self.cur_offset + off >= self.cur_frame_offset[i]
                && (self.frame_offset < self.cur_frame_offset[i] || first_frame)
                && self.cur_frame_end[i] != 0
            {
                if !fuzzy || self.cur_frame_dts[i].is_some() {
                    self.dts = self.cur_frame_dts[i];
                    self.pts = self.cur_frame_pts[i];
                    self.pos = self.cur_frame_pos[i];
                    self.offset = self.next_frame_offset - self.cur_frame_offset[i];
                }
                if remove {
                    self.cur_frame_offset[i] = i64::MAX;
                }
                if self.cur_offset + off < self.cur_frame_end[i] {
                    break;
                }
            }
        }
    }

    /// Returns the input bytes consumed (negative when the frame ended
    /// inside previously buffered data) and the completed frame.
    fn split(&mut self, codec: &mut CodecParameters, buf: &[u8]) -> (i64, Option<Bytes>) {
        let whole = self.flags.contains(ParserFlags::COMPLETE_FRAMES)
            || (self.flags.contains(ParserFlags::ONCE) && self.got_first);
        if whole && self.pending.is_empty() {
            if buf.is_empty() {
                return (0, None);
            }
            let frame = Bytes::copy_from_slice(buf);
            self.inspect(codec, &frame);
            return (buf.len() as i64, Some(frame));
        }

        let before = self.pending.len();
        self.pending.extend_from_slice(buf);
        let end = if buf.is_empty() || whole {
            if self.pending.is_empty() {
                return (0, None);
            }
            if whole {
                before.max(1).min(self.pending.len())
            } else {
                self.pending.len()
            }
        } else {
            match self.parser.find_frame_end(&self.pending) {
                Some(end) if end > 0 => end.min(self.pending.len()),
                _ => return (buf.len() as i64, None),
            }
        };

        let frame: Vec<u8> = if end >= before {
            self.pending.truncate(end);
            std::mem::take(&mut self.pending)
        } else {
            self.pending.truncate(before);
            self.pending.drain(..end).collect()
        };
        let frame = Bytes::from(frame);
        self.inspect(codec, &frame);
        (end as i64 - before as i64, Some(frame))
    }

    fn inspect(&mut self, codec: &mut CodecParameters, frame: &[u8]) {
        let mut info = FrameInfo::default();
        self.parser.inspect(frame, &mut info, codec);
        self.key_frame = info.key_frame;
        self.pict_type = info.pict_type;
        self.duration = info.duration;
        self.repeat_pict = info.repeat_pict;
        self.got_first = true;
    }
}

impl std::fmt::Debug for ParserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserContext")
            .field("codec_id", &self.codec_id)
            .field("flags", &self.flags)
            .field("pending", &self.pending.len())
            .field("cur_offset", &self.cur_offset)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn CodecParser> + Send + Sync>;

#[derive(Clone)]
pub struct ParserRegistry {
    entries: Vec<(&'static [CodecId], ParserFactory)>,
}

static DEFAULT_PARSERS: Lazy<ParserRegistry> = Lazy::new(|| {
    let mut registry = ParserRegistry::empty();
    for (ids, factory) in parsers::builtin() {
        registry.register(ids, factory);
    }
    registry
});

impl Default for ParserRegistry {
    fn default() -> Self {
        DEFAULT_PARSERS.clone()
    }
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(&mut self, codec_ids: &'static [CodecId], factory: ParserFactory) {
        self.entries.push((codec_ids, factory));
    }

    pub fn create(&self, codec_id: CodecId) -> Option<ParserContext> {
        if codec_id == CodecId::None {
            return None;
        }
        self.entries
            .iter()
            .find(|(ids, _)| ids.contains(&codec_id))
            .map(|(_, factory)| ParserContext::new((**factory)(), codec_id))
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(ids, _)| ids)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frames are runs starting with 0xAA.
    struct Marker;

    impl CodecParser for Marker {
        fn codec_ids(&self) -> &'static [CodecId] {
            &[CodecId::Bin]
        }
        fn find_frame_end(&mut self, data: &[u8]) -> Option<usize> {
            data.iter().skip(1).position(|&b| b == 0xAA).map(|p| p + 1)
        }
        fn inspect(&mut self, frame: &[u8], info: &mut FrameInfo, _codec: &mut CodecParameters) {
            info.duration = frame.len() as i32;
            info.key_frame = 1;
        }
    }

    fn ctx() -> ParserContext {
        ParserContext::new(Box::new(Marker), CodecId::Bin)
    }

    /// Feeds one packet fully, collecting (frame, pts, dts, pos).
    fn feed(
        p: &mut ParserContext,
        data: &[u8],
        pts: Option<i64>,
        pos: i64,
    ) -> Vec<(Vec<u8>, Option<i64>, i64)> {
        let mut codec = CodecParameters::default();
        let mut out = Vec::new();
        let mut rest = data;
        let (mut pts, mut pos) = (pts, pos);
        loop {
            let (used, frame) = p.parse(&mut codec, rest, pts, pts, pos);
            pts = None;
            pos = -1;
            rest = &rest[used..];
            if let Some(f) = frame {
                out.push((f.to_vec(), p.pts, p.pos));
            }
            if rest.is_empty() {
                break;
            }
        }
        out
    }

    #[test]
    fn frames_span_packets_and_take_first_packet_timestamp() {
        let mut p = ctx();
        assert!(feed(&mut p, &[0xAA, 1, 2], Some(100), 0).is_empty());
        let out = feed(&mut p, &[3, 0xAA, 4], Some(200), 3);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, vec![0xAA, 1, 2, 3]);
        assert_eq!(out[0].1, Some(100));
        assert_eq!(out[0].2, 0);

        let out = feed(&mut p, &[0xAA, 5], Some(300), 6);
        assert_eq!(out[0].0, vec![0xAA, 4]);
        assert_eq!(out[0].1, Some(200));

        let mut codec = CodecParameters::default();
        let (_, tail) = p.parse(&mut codec, &[], None, None, -1);
        assert_eq!(tail.map(|b| b.to_vec()), Some(vec![0xAA, 5]));
        assert_eq!(p.pts, Some(300));
        assert_eq!(p.duration, 2);
    }

    #[test]
    fn several_frames_in_one_packet() {
        let mut p = ctx();
        let out = feed(&mut p, &[0xAA, 1, 0xAA, 2, 0xAA, 3], Some(10), 0);
        let frames: Vec<Vec<u8>> = out.iter().map(|o| o.0.clone()).collect();
        assert_eq!(frames, vec![vec![0xAA, 1], vec![0xAA, 2]]);
        assert_eq!(out[0].1, Some(10));
        assert_eq!(out[1].1, None);
    }

    #[test]
    fn complete_frames_pass_through() {
        let mut p = ctx();
        p.flags |= ParserFlags::COMPLETE_FRAMES;
        let out = feed(&mut p, &[1, 2, 3], Some(7), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, vec![1, 2, 3]);
        assert_eq!(out[0].1, Some(7));
    }

    #[test]
    fn registry_knows_builtin_codecs() {
        let reg = ParserRegistry::default();
        for id in [CodecId::H264, CodecId::Aac, CodecId::Ac3, CodecId::Eac3, CodecId::Mp3, CodecId::Mp2] {
            assert!(reg.create(id).is_some(), "no parser for {id}");
        }
        assert!(reg.create(CodecId::Png).is_none());
        assert!(reg.create(CodecId::None).is_none());
    }
}
