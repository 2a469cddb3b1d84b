//! # Packet read flow
//!
//! ```text
//!   demuxer.read_packet ──► handle_new_packet ──► raw_buffer (codec probing)
//!                                  │                    │
//!                                  ▼                    ▼
//!                           read_raw_packet ◄───────────┘
//!                                  │
//!                 parser? ── yes ──► parse_packet ──► parse_queue
//!                    │                                   │
//!                    no ── compute_pkt_fields ──► read_frame_internal
//!                                                        │
//!                                     (GENPTS look-ahead via packet_buffer)
//!                                                        ▼
//!                                                   read_frame
//! ```

use tracing::{debug, trace, warn};

use crate::codec::MediaType;
use crate::context::FormatContext;
use crate::error::{DemuxError, Result};
use crate::format::{InputFormatFlags, ProbeData};
use crate::index::IndexFlags;
use crate::options::FormatFlags;
use crate::packet::{Packet, PacketFlags, SideData};
use crate::parser::{ParserFlags, PictType};
use crate::probe::{probe_input_format, SCORE_STREAM_RETRY};
use crate::rational::{compare_mod, rescale, rescale_q_rnd, Rational, Rounding};
use crate::session::Session;
use crate::stream::{Discard, NeedParsing};
use crate::timestamps::{is_relative, RELATIVE_TS_BASE};

fn log2(v: usize) -> u32 {
    if v == 0 {
        0
    } else {
        usize::BITS - 1 - v.leading_zeros()
    }
}

impl FormatContext {
    /// Scores the stream's probe buffer against the elementary-stream
    /// formats and adopts the winner's codec. Returns the accepted score, 0
    /// when nothing was adopted.
    fn set_codec_from_probe_data(&mut self, idx: usize) -> i32 {
        let st = &self.streams[idx];
        let pd = ProbeData { filename: "", buf: &st.probe_data, mime_type: None };
        let (fmt, score) = probe_input_format(&pd, true, &self.codec_probe_formats);
        let Some(fmt) = fmt else {
            return 0;
        };
        debug!(
            stream = idx,
            size = st.probe_data.len(),
            packets = st.probe_packets,
            format = fmt.name(),
            score,
            "Probe detected format"
        );
        let codec_id = fmt.raw_codec_id();
        if codec_id.media_type() != MediaType::Audio && st.codecpar.sample_rate > 0 {
            return 0;
        }
        if st.request_probe > score && st.codecpar.codec_id != codec_id {
            return 0;
        }
        let st = &mut self.streams[idx];
        st.codecpar.set_codec(codec_id);
        st.need_context_update = true;
        score
    }

    /// Feeds a packet (or, with `None`, the end of input) to the codec
    /// prober of stream `idx`.
    pub(crate) fn probe_codec(&mut self, idx: usize, pkt: Option<&Packet>) {
        let probesize = self.options.probesize;
        let raw_buffer_size = self.raw_buffer_size;
        let st = &mut self.streams[idx];
        if st.request_probe <= 0 {
            return;
        }
        trace!(stream = idx, packets = st.probe_packets, "Probing stream");
        st.probe_packets -= 1;
        let added = match pkt {
            Some(pkt) => {
                st.probe_data.extend_from_slice(&pkt.data);
                pkt.size()
            }
            None => {
                st.probe_packets = 0;
                if st.probe_data.is_empty() {
                    warn!(stream = idx, "nothing to probe for stream");
                }
                0
            }
        };

        let end = raw_buffer_size >= probesize || st.probe_packets <= 0;
        let len = st.probe_data.len();
        if !end && log2(len) == log2(len - added) {
            return;
        }

        let score = self.set_codec_from_probe_data(idx);
        let st = &mut self.streams[idx];
        if (st.codecpar.codec_id != crate::codec::CodecId::None && score > SCORE_STREAM_RETRY) || end {
            st.probe_data = Vec::new();
            st.request_probe = -1;
            if st.codecpar.codec_id != crate::codec::CodecId::None {
                debug!(stream = idx, codec = %st.codecpar.codec_id, score, "probed stream");
            } else {
                warn!(stream = idx, "probed stream failed");
            }
        }
    }

    /// Applies corruption policy and wrap correction to a freshly read
    /// packet. Returns it when it can go straight out; otherwise it has been
    /// held in the raw buffer (or dropped).
    pub(crate) fn handle_new_packet(&mut self, mut pkt: Packet, allow_passthrough: bool) -> Option<Packet> {
        let idx = pkt.stream_index;
        if pkt.is_corrupt() {
            warn!(stream = idx, dts = ?pkt.dts, pos = ?pkt.pos, "Packet corrupt");
            if self.has_flag(FormatFlags::DISCARD_CORRUPT) {
                return None;
            }
        }

        self.update_timestamps(&mut pkt);

        if self.streams[idx].request_probe <= 0 && allow_passthrough && self.raw_buffer.is_empty() {
            return Some(pkt);
        }

        self.raw_buffer_size += pkt.size() as i64;
        let probe = pkt.clone();
        self.raw_buffer.push_back(pkt);
        self.probe_codec(idx, Some(&probe));
        None
    }

    /// Runs `pkt` (or, when flushing, the parser's leftovers) through the
    /// stream's parser and queues the frames that come out.
    pub(crate) fn parse_packet(&mut self, pkt: Option<Packet>, idx: usize, flush: bool) {
        let mut pkt = pkt.unwrap_or_else(|| Packet { stream_index: idx, ..Default::default() });
        let Some(parser) = self.streams[idx].parser.as_ref() else {
            return;
        };
        let complete = parser.flags.contains(ParserFlags::COMPLETE_FRAMES);

        if pkt.data.is_empty() && !flush && complete {
            let state = parser.state();
            let (dts, pts) = (pkt.dts, pkt.pts);
            self.compute_pkt_fields(idx, Some(&state), &mut pkt, dts, pts);
            return;
        }

        let data = pkt.data.clone();
        let mut offset = 0usize;
        let mut got_output = flush;
        while offset < data.len() || (flush && got_output) {
            let next_pts = pkt.pts;
            let next_dts = pkt.dts;

            let st = &mut self.streams[idx];
            let is_audio = st.media_type() == MediaType::Audio;
            let Some(parser) = st.parser.as_mut() else {
                break;
            };
            let (len, out) = parser.parse(&mut st.codecpar, &data[offset..], pkt.pts, pkt.dts, pkt.pos.unwrap_or(-1));
            pkt.pts = None;
            pkt.dts = None;
            pkt.pos = None;
            offset += len;

            got_output = out.is_some();
            let Some(frame) = out else {
                continue;
            };

            let state = parser.state();
            let mut out = Packet::new(idx, frame);
            out.side_data = pkt.take_side_data();
            out.duration = if complete { pkt.duration } else { 0 };
            if is_audio && st.codecpar.sample_rate > 0 {
                out.duration = rescale_q_rnd(
                    parser.duration as i64,
                    Rational::new(1, st.codecpar.sample_rate as i32),
                    st.time_base,
                    Rounding::Down,
                );
            }
            out.pts = parser.pts;
            out.dts = parser.dts;
            out.pos = (parser.pos >= 0).then_some(parser.pos);
            out.flags |= pkt.flags & (PacketFlags::DISCARD | PacketFlags::CORRUPT);
            if st.need_parsing == NeedParsing::FullRaw {
                out.pos = Some(parser.frame_offset);
            }
            if parser.key_frame == 1 || (parser.key_frame == -1 && parser.pict_type == PictType::I) {
                out.flags |= PacketFlags::KEY;
            }
            if parser.key_frame == -1 && parser.pict_type == PictType::None && pkt.is_key() {
                out.flags |= PacketFlags::KEY;
            }

            self.compute_pkt_fields(idx, Some(&state), &mut out, next_dts, next_pts);
            self.parse_queue.push_back(out);
        }

        if flush {
            self.streams[idx].parser = None;
        }
    }

    /// Attaches skip-samples side data for encoder delay and trailing
    /// padding.
    fn inject_skip_samples(&mut self, pkt: &mut Packet) {
        let st = &mut self.streams[pkt.stream_index];
        let to_samples = |ts: i64| rescale(ts, st.time_base.num as i64 * st.codecpar.sample_rate as i64, st.time_base.den as i64);

        let mut discard_padding = 0;
        if st.first_discard_sample != 0 {
            if let Some(pts) = pkt.pts {
                let pts = if is_relative(pts) { pts - RELATIVE_TS_BASE } else { pts };
                let sample = to_samples(pts);
                let duration = to_samples(pkt.duration);
                let end_sample = sample + duration;
                if duration > 0 && end_sample >= st.first_discard_sample && sample < st.last_discard_sample {
                    discard_padding = (end_sample - st.first_discard_sample).min(duration);
                }
            }
        }
        if st.start_skip_samples != 0 && (pkt.pts == Some(0) || pkt.pts == Some(RELATIVE_TS_BASE)) {
            st.skip_samples = st.start_skip_samples;
        }
        st.skip_samples = st.skip_samples.max(0);
        if st.skip_samples != 0 || discard_padding != 0 {
            debug!(stream = pkt.stream_index, skip = st.skip_samples, discard = discard_padding, "demuxer injecting skip");
            pkt.set_side_data(SideData::SkipSamples {
                skip_start: st.skip_samples as u32,
                skip_end: discard_padding as u32,
                reason_start: 0,
                reason_end: 0,
            });
            st.skip_samples = 0;
        }
    }

    /// Adds a key packet to a generic-index format's seek index.
    fn add_generic_index_entry(&mut self, pkt: &Packet) {
        if self.format_flags.contains(InputFormatFlags::GENERIC_INDEX) && pkt.is_key() {
            self.reduce_index(pkt.stream_index);
            self.add_index_entry(pkt.stream_index, pkt.pos.unwrap_or(-1), pkt.dts, 0, 0, IndexFlags::KEYFRAME);
        }
    }

    /// Error to hand out in place of `Eof` when the byte source failed.
    fn latched_io_error(&self) -> Option<DemuxError> {
        let err = self.io.as_ref()?.error()?;
        (!err.is_transient()).then(|| err.duplicate())
    }
}

impl Session {
    /// Next packet from the container, after codec probing has released it.
    pub(crate) fn read_raw_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(head) = self.ctx.raw_buffer.front() {
                let idx = head.stream_index;
                if self.ctx.raw_buffer_size >= self.ctx.options.probesize {
                    self.ctx.probe_codec(idx, None);
                }
                if self.ctx.streams[idx].request_probe <= 0 {
                    if let Some(pkt) = self.ctx.raw_buffer.pop_front() {
                        self.ctx.raw_buffer_size -= pkt.size() as i64;
                        return Ok(pkt);
                    }
                }
            }

            let pkt = match self.demuxer.read_packet(&mut self.ctx) {
                Ok(pkt) => pkt,
                Err(DemuxError::Redo) => continue,
                Err(e) => {
                    if self.ctx.raw_buffer.is_empty() || e.is_transient() {
                        return Err(e);
                    }
                    for idx in 0..self.ctx.streams.len() {
                        let st = &self.ctx.streams[idx];
                        if st.probe_packets != 0 || st.request_probe > 0 {
                            self.ctx.probe_codec(idx, None);
                        }
                    }
                    continue;
                }
            };

            if pkt.stream_index >= self.ctx.streams.len() {
                warn!(stream = pkt.stream_index, "Invalid stream index");
                continue;
            }
            if let Some(pkt) = self.ctx.handle_new_packet(pkt, true) {
                return Ok(pkt);
            }
        }
    }

    /// Next complete frame with filled-in timestamps, without look-ahead.
    pub(crate) fn read_frame_internal(&mut self) -> Result<Packet> {
        let mut got: Option<Packet> = None;
        let mut read_err: Option<DemuxError> = None;

        while got.is_none() && self.ctx.parse_queue.is_empty() {
            let mut pkt = match self.read_raw_packet() {
                Ok(pkt) => pkt,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    for idx in 0..self.ctx.streams.len() {
                        let st = &self.ctx.streams[idx];
                        if st.parser.is_some() && st.need_parsing != NeedParsing::None {
                            self.ctx.parse_packet(None, idx, true);
                        }
                    }
                    read_err = Some(e);
                    break;
                }
            };
            let idx = pkt.stream_index;
            let no_parse = self.ctx.has_flag(FormatFlags::NOPARSE);

            let st = &mut self.ctx.streams[idx];
            if st.need_context_update {
                if st.parser.as_ref().is_some_and(|p| p.codec_id() != st.codecpar.codec_id) {
                    st.parser = None;
                }
                st.need_context_update = false;
            }

            if let (Some(pts), Some(dts)) = (pkt.pts, pkt.dts) {
                if pts < dts {
                    warn!(stream = idx, pts, dts, size = pkt.size(), "Invalid timestamps");
                }
            }

            if st.need_parsing != NeedParsing::None && st.parser.is_none() && !no_parse {
                match self.ctx.parsers.create(st.codecpar.codec_id) {
                    None => {
                        debug!(
                            stream = idx,
                            codec = %st.codecpar.codec_id,
                            "parser not found for codec, packets or times may be invalid"
                        );
                        st.need_parsing = NeedParsing::None;
                    }
                    Some(mut parser) => {
                        match st.need_parsing {
                            NeedParsing::Headers => parser.flags |= ParserFlags::COMPLETE_FRAMES,
                            NeedParsing::FullOnce => parser.flags |= ParserFlags::ONCE,
                            NeedParsing::FullRaw => parser.flags |= ParserFlags::USE_CODEC_TS,
                            _ => {}
                        }
                        st.parser = Some(parser);
                    }
                }
            }

            if st.need_parsing == NeedParsing::None || st.parser.is_none() {
                self.ctx.compute_pkt_fields(idx, None, &mut pkt, None, None);
                if self.ctx.format_flags.contains(InputFormatFlags::GENERIC_INDEX) && pkt.is_key() && pkt.dts.is_some() {
                    self.ctx.reduce_index(idx);
                    self.ctx.add_index_entry(idx, pkt.pos.unwrap_or(-1), pkt.dts, 0, 0, IndexFlags::KEYFRAME);
                }
                let st = &mut self.ctx.streams[idx];
                if pkt.is_key() {
                    st.skip_to_keyframe = false;
                }
                if !st.skip_to_keyframe {
                    got = Some(pkt);
                }
            } else if st.discard < Discard::All {
                self.ctx.parse_packet(Some(pkt), idx, false);
            }
        }

        let mut pkt = match got.or_else(|| self.ctx.parse_queue.pop_front()) {
            Some(pkt) => pkt,
            None => {
                let err = read_err.unwrap_or(DemuxError::Eof);
                if err.is_eof() {
                    if let Some(io_err) = self.ctx.latched_io_error() {
                        return Err(io_err);
                    }
                }
                return Err(err);
            }
        };

        self.ctx.inject_skip_samples(&mut pkt);
        Ok(pkt)
    }

    /// Returns the next frame of the file.
    ///
    /// Timestamps are in the stream's time base with relative placeholders
    /// removed. With `GENPTS`, packets without pts are held back until a
    /// later packet of the same stream supplies one.
    pub fn read_frame(&mut self) -> Result<Packet> {
        let mut pkt = if !self.ctx.has_flag(FormatFlags::GENPTS) {
            match self.ctx.packet_buffer.pop_front() {
                Some(pkt) => pkt,
                None => self.read_frame_internal()?,
            }
        } else {
            self.read_frame_genpts()?
        };

        self.ctx.add_generic_index_entry(&pkt);

        if pkt.dts.is_some_and(is_relative) {
            pkt.dts = pkt.dts.map(|d| d - RELATIVE_TS_BASE);
        }
        if pkt.pts.is_some_and(is_relative) {
            pkt.pts = pkt.pts.map(|p| p - RELATIVE_TS_BASE);
        }
        Ok(pkt)
    }

    fn read_frame_genpts(&mut self) -> Result<Packet> {
        let mut eof = false;
        loop {
            if let Some(head) = self.ctx.packet_buffer.front() {
                let idx = head.stream_index;
                if let Some(dts) = head.dts {
                    let modulus = 2u64.wrapping_shl(self.ctx.streams[idx].pts_wrap_bits.saturating_sub(1));
                    let mut pts = head.pts;
                    let mut last_dts = dts;
                    for p in self.ctx.packet_buffer.iter() {
                        if pts.is_some() {
                            break;
                        }
                        let Some(pd) = p.dts.filter(|_| p.stream_index == idx) else {
                            continue;
                        };
                        if compare_mod(dts as u64, pd as u64, modulus) < 0 {
                            if p.pts.map_or(true, |pp| compare_mod(pp as u64, pd as u64, modulus) != 0) {
                                pts = Some(pd);
                            }
                            last_dts = pd;
                        }
                    }
                    let duration = head.duration;
                    if eof && pts.is_none() {
                        pts = Some(last_dts + duration);
                    }
                    if let Some(head) = self.ctx.packet_buffer.front_mut() {
                        head.pts = pts;
                    }
                }

                if let Some(head) = self.ctx.packet_buffer.front() {
                    let discard = self.ctx.streams[head.stream_index].discard;
                    let waiting = head.pts.is_none() && discard < Discard::All && head.dts.is_some() && !eof;
                    if !waiting {
                        if let Some(pkt) = self.ctx.packet_buffer.pop_front() {
                            return Ok(pkt);
                        }
                    }
                }
            }

            match self.read_frame_internal() {
                Ok(pkt) => {
                    self.ctx.packet_buffer.push_back(pkt);
                }
                Err(e) if !self.ctx.packet_buffer.is_empty() && !e.is_transient() => {
                    eof = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::options::DemuxOptions;
    use crate::parsers::adts::tests::adts_frame;
    use crate::testing::{session_with_packets, ScriptedPacket};
    use bytes::Bytes;

    #[test]
    fn log2_of_sizes() {
        assert_eq!(log2(0), 0);
        assert_eq!(log2(1), 0);
        assert_eq!(log2(2048), 11);
        assert_eq!(log2(4095), 11);
    }

    #[test]
    fn corrupt_packets_dropped_on_request() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_stream().expect("stream").codecpar.set_codec(CodecId::Aac);
        let mut pkt = Packet::new(0, Bytes::from_static(b"xx"));
        pkt.flags |= PacketFlags::CORRUPT;
        assert!(ctx.handle_new_packet(pkt.clone(), true).is_some());

        ctx.options.flags |= FormatFlags::DISCARD_CORRUPT;
        assert!(ctx.handle_new_packet(pkt, true).is_none());
        assert!(ctx.raw_buffer.is_empty());
    }

    #[test]
    fn codec_probe_identifies_adts() {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        ctx.new_stream().expect("stream").request_probe = 1;
        let mut held = 0;
        for _ in 0..40 {
            let pkt = Packet::new(0, Bytes::from(adts_frame(256)));
            if ctx.handle_new_packet(pkt, true).is_none() {
                held += 1;
            }
            if ctx.streams[0].request_probe <= 0 {
                break;
            }
        }
        let st = &ctx.streams[0];
        assert_eq!(st.codecpar.codec_id, CodecId::Aac);
        assert_eq!(st.request_probe, -1);
        assert!(st.probe_data.is_empty());
        assert_eq!(ctx.raw_buffer.len(), held);
    }

    #[test]
    fn probe_gives_up_when_packets_run_out() {
        let opts = DemuxOptions { max_probe_packets: 3, ..Default::default() };
        let mut ctx = FormatContext::new(opts);
        ctx.new_stream().expect("stream").request_probe = 1;
        for _ in 0..3 {
            ctx.handle_new_packet(Packet::new(0, Bytes::from_static(&[0x42; 64])), true);
        }
        assert_eq!(ctx.streams[0].request_probe, -1);
        assert_eq!(ctx.streams[0].codecpar.codec_id, CodecId::None);
        assert_eq!(ctx.raw_buffer.len(), 3);
    }

    #[test]
    fn raw_buffer_released_after_probing() {
        let mut frames = Vec::new();
        for i in 0..30 {
            frames.push(ScriptedPacket::new(0, adts_frame(300)).pts(i * 1920));
        }
        let mut session = session_with_packets(&[CodecId::None], frames, |ctx| {
            ctx.streams[0].request_probe = 1;
            ctx.streams[0].time_base = Rational::new(1, 90_000);
        });
        let first = session.read_frame().expect("frame");
        assert_eq!(session.streams()[0].codecpar.codec_id, CodecId::Aac);
        assert_eq!(first.pts, Some(0));
        let mut n = 1;
        while session.read_frame().is_ok() {
            n += 1;
        }
        assert_eq!(n, 30);
    }

    #[test]
    fn genpts_fills_pts_from_following_dts() {
        let packets = vec![
            ScriptedPacket::new(0, vec![1; 10]).dts(0).key(),
            ScriptedPacket::new(0, vec![2; 10]).dts(1).pts(3),
            ScriptedPacket::new(0, vec![3; 10]).dts(2).pts(1),
            ScriptedPacket::new(0, vec![4; 10]).dts(3).pts(2),
        ];
        let mut session = session_with_packets(&[CodecId::Mpeg4], packets, |ctx| {
            ctx.options.flags |= FormatFlags::GENPTS | FormatFlags::NOFILLIN;
        });
        let first = session.read_frame().expect("first");
        assert_eq!(first.dts, Some(0));
        assert_eq!(first.pts, Some(1));
    }

    #[test]
    fn parsers_split_and_stamp_frames() {
        let mut blob = Vec::new();
        for _ in 0..4 {
            blob.extend(adts_frame(200));
        }
        let packets = vec![
            ScriptedPacket::new(0, blob[..300].to_vec()).pts(0),
            ScriptedPacket::new(0, blob[300..].to_vec()).pts(9000),
        ];
        let mut session = session_with_packets(&[CodecId::Aac], packets, |ctx| {
            ctx.streams[0].need_parsing = NeedParsing::Full;
            ctx.streams[0].codecpar.sample_rate = 48_000;
        });
        let mut out = Vec::new();
        while let Ok(pkt) = session.read_frame() {
            out.push(pkt);
        }
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|p| p.size() == 200 && p.is_key()));
        assert_eq!(out[0].pts, Some(0));
        assert_eq!(out[0].duration, 1920);
        assert_eq!(out[1].pts, Some(1920));
    }
}
