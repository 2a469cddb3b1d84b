//! Stream analysis: reads ahead until every stream's codec parameters and
//! first timestamps are known, estimating frame rates on the way.
//!
//! The packets read here are kept in the packet buffer and handed out by
//! the following `read_frame` calls, so nothing is lost.

use tracing::{debug, info, warn};

use crate::codec::{CodecId, MediaType};
use crate::context::{ContextFlags, FormatContext};
use crate::error::{DemuxError, Result};
use crate::format::InputFormatFlags;
use crate::options::FormatFlags;
use crate::parser::ParserFlags;
use crate::rational::{compare_ts, gcd, rescale_q, Rational, TIME_BASE, TIME_BASE_Q};
use crate::session::Session;
use crate::stream::{Disposition, NeedParsing, Stream};
use crate::timestamps::{has_decode_delay_been_guessed, is_relative, RELATIVE_TS_BASE};

/// Candidate frame rates scanned by the rate estimator.
pub const MAX_STD_TIMEBASES: usize = 30 * 12 + 30 + 3 + 6;

/// Standard frame rate `i`, in units of `1 / (12 * 1001)` fps.
pub fn get_std_framerate(i: usize) -> i32 {
    if i < 30 * 12 {
        return (i as i32 + 1) * 1001;
    }
    let i = i - 30 * 12;
    if i < 30 {
        return (i as i32 + 31) * 1001 * 12;
    }
    let i = i - 30;
    if i < 3 {
        return [80, 120, 240][i] * 1001 * 12;
    }
    [24, 30, 60, 12, 15, 48][i - 3] * 1000 * 12
}

type DurationError = [[[f64; MAX_STD_TIMEBASES]; 2]; 2];

/// Per-stream accumulators, alive from stream creation until analysis ends.
#[derive(Debug, Clone)]
pub struct AnalysisState {
    pub(crate) last_dts: Option<i64>,
    pub(crate) duration_gcd: i64,
    pub(crate) duration_count: i32,
    pub(crate) rfps_duration_sum: i64,
    /// `[half-tick offset][sum, sum of squares][candidate rate]`.
    pub(crate) duration_error: Option<Box<DurationError>>,
    pub(crate) codec_info_duration: i64,
    pub(crate) codec_info_duration_fields: i64,
    pub(crate) frame_delay_evidence: bool,
    pub(crate) fps_first_dts: Option<i64>,
    pub(crate) fps_first_dts_idx: i32,
    pub(crate) fps_last_dts: Option<i64>,
    pub(crate) fps_last_dts_idx: i32,
    /// Last end-of-file duration candidate seen by the pts estimator.
    pub(crate) last_duration: i64,
}

impl Default for AnalysisState {
    fn default() -> Self {
        Self {
            last_dts: None,
            duration_gcd: 0,
            duration_count: 0,
            rfps_duration_sum: 0,
            duration_error: None,
            codec_info_duration: 0,
            codec_info_duration_fields: 0,
            frame_delay_evidence: false,
            fps_first_dts: None,
            fps_first_dts_idx: 0,
            fps_last_dts: None,
            fps_last_dts_idx: 0,
            last_duration: 0,
        }
    }
}

/// Why a stream's parameters are incomplete, `None` when they are usable.
pub fn missing_codec_parameters(st: &Stream) -> Option<&'static str> {
    let par = &st.codecpar;
    if par.codec_id == CodecId::None && par.codec_type != MediaType::Data {
        return Some("unknown codec");
    }
    match par.codec_type {
        MediaType::Audio => {
            let determinable = matches!(par.codec_id, CodecId::Mp1 | CodecId::Mp2 | CodecId::Mp3);
            if par.frame_size == 0 && determinable {
                return Some("unspecified frame size");
            }
            if par.sample_rate == 0 {
                return Some("unspecified sample rate");
            }
            if par.channels == 0 {
                return Some("unspecified number of channels");
            }
        }
        MediaType::Video if par.width == 0 => return Some("unspecified size"),
        MediaType::Subtitle if par.codec_id == CodecId::HdmvPgsSubtitle && par.width == 0 => {
            return Some("unspecified size")
        }
        _ => {}
    }
    None
}

pub fn has_codec_parameters(st: &Stream) -> bool {
    missing_codec_parameters(st).is_none()
}

/// The time base is too fine or too coarse to read a frame rate off it, or
/// the codec is known to carry misleading timing.
fn tb_unreliable(ctx_flags: ContextFlags, st: &Stream) -> bool {
    let par = &st.codecpar;
    let fields = if par.codec_id.has_fields() { 2 } else { 1 };
    let tb = if par.framerate.num != 0 {
        Rational::new(par.framerate.den, par.framerate.num.saturating_mul(fields))
    } else if ctx_flags.contains(ContextFlags::NOHEADER) || par.codec_type == MediaType::Audio {
        Rational::new(0, 1)
    } else {
        st.time_base
    };
    let (num, den) = (tb.num as i64, tb.den as i64);
    den >= 101 * num
        || den < 5 * num
        || par.codec_tag == u32::from_le_bytes(*b"mp4v")
        || matches!(par.codec_id, CodecId::Mpeg2Video | CodecId::Hevc | CodecId::H264)
}

impl FormatContext {
    /// Feeds one dts into the frame-rate estimator of stream `idx`.
    pub(crate) fn rfps_add_frame(&mut self, idx: usize, ts: Option<i64>) {
        let st = &mut self.streams[idx];
        let tb = st.time_base;
        let Some(info) = st.info.as_deref_mut() else {
            return;
        };

        if let (Some(ts), Some(last)) = (ts, info.last_dts) {
            if ts > last && (ts as u64).wrapping_sub(last as u64) < i64::MAX as u64 {
                let base = if is_relative(ts) { ts - RELATIVE_TS_BASE } else { ts };
                let dts = base as f64 * tb.to_f64();
                let duration = ts - last;
                let errors = info.duration_error.get_or_insert_with(|| Box::new([[[0.0; MAX_STD_TIMEBASES]; 2]; 2]));

                for i in 0..MAX_STD_TIMEBASES {
                    if errors[0][1][i] < 1e10 {
                        let sdts = dts * get_std_framerate(i) as f64 / (1001.0 * 12.0);
                        for j in 0..2 {
                            let ticks = (sdts + j as f64 * 0.5).round();
                            let error = sdts - ticks + j as f64 * 0.5;
                            errors[j][0][i] += error;
                            errors[j][1][i] += error * error;
                        }
                    }
                }
                if info.rfps_duration_sum <= i64::MAX - duration {
                    info.duration_count += 1;
                    info.rfps_duration_sum += duration;
                }

                if info.duration_count % 10 == 0 {
                    let n = info.duration_count as f64;
                    for i in 0..MAX_STD_TIMEBASES {
                        if errors[0][1][i] < 1e10 {
                            let a0 = errors[0][0][i] / n;
                            let error0 = errors[0][1][i] / n - a0 * a0;
                            let a1 = errors[1][0][i] / n;
                            let error1 = errors[1][1][i] / n - a1 * a1;
                            if error0 > 0.04 && error1 > 0.04 {
                                errors[0][1][i] = 2e10;
                                errors[1][1][i] = 2e10;
                            }
                        }
                    }
                }

                // the first few deltas carry start-up jitter
                if info.duration_count > 3 && is_relative(ts) == is_relative(last) {
                    info.duration_gcd = gcd(info.duration_gcd, duration);
                }
            }
        }
        if ts.is_some() {
            info.last_dts = ts;
        }
    }

    /// Derives `r_frame_rate` (and, failing better data, `avg_frame_rate`)
    /// for video streams from the accumulated dts deltas.
    pub(crate) fn rfps_calculate(&mut self) {
        let ctx_flags = self.ctx_flags;
        for st in &mut self.streams {
            if st.media_type() != MediaType::Video {
                continue;
            }
            let unreliable = tb_unreliable(ctx_flags, st);
            let tb = st.time_base;
            let Some(info) = st.info.as_deref_mut() else {
                continue;
            };

            let min_gcd = (tb.den as i64 / (500 * tb.num as i64)).max(1);
            if unreliable
                && info.duration_count > 15
                && info.duration_gcd > min_gcd
                && st.r_frame_rate.num == 0
                && info.duration_gcd < i64::MAX / tb.num as i64
            {
                st.r_frame_rate = Rational::reduce(tb.den as i64, tb.num as i64 * info.duration_gcd, i32::MAX as i64).0;
            }

            if info.duration_count > 1 && st.r_frame_rate.num == 0 && unreliable {
                let mut num = 0;
                let mut best_error = 0.01;
                let ref_rate = if st.r_frame_rate.num != 0 { st.r_frame_rate } else { tb.invert() };
                let tb_f = tb.to_f64();
                let n = info.duration_count as f64;

                if let Some(errors) = info.duration_error.as_deref() {
                    for j in 0..MAX_STD_TIMEBASES {
                        let rate = get_std_framerate(j) as f64;
                        if info.codec_info_duration != 0
                            && (info.codec_info_duration as f64) * tb_f < (1001.0 * 11.5) / rate
                        {
                            continue;
                        }
                        if info.codec_info_duration == 0 && get_std_framerate(j) < 1001 * 12 {
                            continue;
                        }
                        if tb_f * info.rfps_duration_sum as f64 / n < (1001.0 * 12.0 * 0.8) / rate {
                            continue;
                        }
                        for k in 0..2 {
                            let a = errors[k][0][j] / n;
                            let error = errors[k][1][j] / n - a * a;
                            if error < best_error && best_error > 0.000_000_001 {
                                best_error = error;
                                num = get_std_framerate(j);
                            }
                            if error < 0.02 {
                                debug!(fps = rate / 12.0 / 1001.0, error, "rfps");
                            }
                        }
                    }
                }
                // never raise the rate by more than 1 % to hit a standard one
                if num != 0 && (ref_rate.num == 0 || num as f64 / (12.0 * 1001.0) < 1.01 * ref_rate.to_f64()) {
                    st.r_frame_rate = Rational::reduce(num as i64, 12 * 1001, i32::MAX as i64).0;
                }
            }

            if st.avg_frame_rate.num == 0
                && st.r_frame_rate.num != 0
                && info.rfps_duration_sum != 0
                && info.codec_info_duration <= 0
                && info.duration_count > 2
                && (1.0 / (st.r_frame_rate.to_f64() * tb.to_f64())
                    - info.rfps_duration_sum as f64 / info.duration_count as f64)
                    .abs()
                    <= 1.0
            {
                debug!(stream = st.index, "Setting avg frame rate based on r frame rate");
                st.avg_frame_rate = st.r_frame_rate;
            }

            info.duration_error = None;
            info.last_dts = None;
            info.duration_count = 0;
            info.rfps_duration_sum = 0;
        }
    }

    /// Fills in open chapter ends from the next chapter's start or the end
    /// of the file.
    pub(crate) fn compute_chapters_end(&mut self) {
        if self.chapters.is_empty() {
            return;
        }
        let max_time = match (self.duration, self.start_time) {
            (Some(d), start) if d > 0 && start.unwrap_or(0) < i64::MAX - d => d + start.unwrap_or(0),
            _ => 0,
        };

        let mut order: Vec<usize> = (0..self.chapters.len()).collect();
        order.sort_by(|&a, &b| {
            let (ca, cb) = (&self.chapters[a], &self.chapters[b]);
            compare_ts(ca.start, ca.time_base, cb.start, cb.time_base)
        });

        for (pos, &i) in order.iter().enumerate() {
            if self.chapters[i].end.is_some() {
                continue;
            }
            let ch = &self.chapters[i];
            let mut end = if max_time != 0 { rescale_q(max_time, TIME_BASE_Q, ch.time_base) } else { i64::MAX };
            if let Some(&next) = order.get(pos + 1) {
                let ch1 = &self.chapters[next];
                let next_start = rescale_q(ch1.start, ch1.time_base, ch.time_base);
                if next_start > ch.start && next_start < end {
                    end = next_start;
                }
            }
            let start = ch.start;
            self.chapters[i].end = Some(if end == i64::MAX || end < start { start } else { end });
        }
    }

    /// Updates the dts-span and duration accumulators with a packet seen
    /// during analysis.
    fn track_analysis_packet(&mut self, idx: usize, dts: Option<i64>) {
        let st = &mut self.streams[idx];
        let frames = st.codec_info_nb_frames;
        let Some(info) = st.info.as_deref_mut() else {
            return;
        };
        let Some(dts) = dts.filter(|_| frames > 1) else {
            return;
        };

        if let Some(last) = info.fps_last_dts {
            if last >= dts {
                debug!(
                    stream = idx,
                    packet = frames,
                    dts,
                    last_packet = info.fps_last_dts_idx,
                    last_dts = last,
                    "Non-increasing DTS"
                );
                info.fps_first_dts = None;
                info.fps_last_dts = None;
            }
        }
        if let (Some(first), Some(last)) = (info.fps_first_dts, info.fps_last_dts) {
            if info.fps_last_dts_idx > info.fps_first_dts_idx {
                let gap = (dts as u64).wrapping_sub(last as u64) / 1000;
                let span = (last as u64).wrapping_sub(first as u64) / (info.fps_last_dts_idx - info.fps_first_dts_idx) as u64;
                if gap > span {
                    warn!(
                        stream = idx,
                        packet = frames,
                        dts,
                        last_packet = info.fps_last_dts_idx,
                        last_dts = last,
                        "DTS discontinuity"
                    );
                    info.fps_first_dts = None;
                    info.fps_last_dts = None;
                }
            }
        }
        if info.fps_first_dts.is_none() {
            info.fps_first_dts = Some(dts);
            info.fps_first_dts_idx = frames;
        }
        info.fps_last_dts = Some(dts);
        info.fps_last_dts_idx = frames;
    }

    /// Microseconds of stream `idx` covered by analysis so far.
    fn analyzed_duration(&self, idx: usize) -> i64 {
        let st = &self.streams[idx];
        let Some(info) = st.info.as_deref() else {
            return 0;
        };
        let mut t = 0;
        if st.time_base.den > 0 {
            t = rescale_q(info.codec_info_duration, st.time_base, TIME_BASE_Q);
        }
        if st.avg_frame_rate.num > 0 {
            t = t.max(rescale_q(st.codec_info_nb_frames as i64, st.avg_frame_rate.invert(), TIME_BASE_Q));
        }
        if t == 0 && st.codec_info_nb_frames > 30 {
            if let (Some(first), Some(last)) = (info.fps_first_dts, info.fps_last_dts) {
                t = t.max(rescale_q(last.saturating_sub(first), st.time_base, TIME_BASE_Q));
            }
        }
        t
    }

    /// Whether analysis still needs packets for stream `idx`.
    fn stream_needs_analysis(&self, idx: usize) -> bool {
        let st = &self.streams[idx];
        if !has_codec_parameters(st) {
            return true;
        }
        let Some(info) = st.info.as_deref() else {
            return false;
        };
        let mut fps_analyze_framecount = 20;
        if st.time_base.to_f64() > 0.0005 {
            fps_analyze_framecount *= 2;
        }
        if !tb_unreliable(self.ctx_flags, st) {
            fps_analyze_framecount = 0;
        }
        if self.options.fps_probe_size >= 0 {
            fps_analyze_framecount = self.options.fps_probe_size;
        }
        if st.is_attached_pic() {
            fps_analyze_framecount = 0;
        }
        let no_timestamps = self.format_flags.contains(InputFormatFlags::NOTIMESTAMPS);
        let count = if no_timestamps { (info.codec_info_duration_fields / 2) as i32 } else { info.duration_count };
        let video = st.media_type() == MediaType::Video;
        if !(st.r_frame_rate.num != 0 && st.avg_frame_rate.num != 0) && video && count < fps_analyze_framecount {
            return true;
        }
        if info.frame_delay_evidence && count < 2 && st.codecpar.video_delay == 0 {
            return true;
        }
        let ts_probe = if st.disposition.contains(Disposition::ATTACHED_PIC) { 1 } else { self.options.max_ts_probe };
        st.first_dts.is_none()
            && (!no_timestamps || st.need_parsing == NeedParsing::FullRaw)
            && st.codec_info_nb_frames < ts_probe
            && matches!(st.media_type(), MediaType::Video | MediaType::Audio)
    }

}

/// Average frame rate from the analysed duration, snapped to a standard
/// rate within 1 %.
fn estimate_avg_frame_rate(st: &mut Stream) {
    let Some(info) = st.info.as_deref() else {
        return;
    };
    if info.codec_info_duration_fields == 0 || st.avg_frame_rate.num != 0 || info.codec_info_duration == 0 {
        return;
    }
    let tb = st.time_base;
    if info.codec_info_duration >= i64::MAX / tb.num as i64 / 2
        || info.codec_info_duration_fields >= i64::MAX / tb.den as i64
        || info.codec_info_duration < 0
    {
        return;
    }
    st.avg_frame_rate = Rational::reduce(
        info.codec_info_duration_fields * tb.den as i64,
        info.codec_info_duration * 2 * tb.num as i64,
        60000,
    )
    .0;

    let mut best_fps = 0;
    let mut best_error = 0.01;
    for j in 0..MAX_STD_TIMEBASES {
        let std_fps = get_std_framerate(j) as f64 / (12.0 * 1001.0);
        let error = (st.avg_frame_rate.to_f64() / std_fps - 1.0).abs();
        if error < best_error {
            best_error = error;
            best_fps = get_std_framerate(j);
        }
    }
    if best_fps != 0 {
        st.avg_frame_rate = Rational::reduce(best_fps as i64, 12 * 1001, i32::MAX as i64).0;
    }
}

impl Session {
    /// Reads ahead until every stream is described well enough to use.
    ///
    /// Codec parameters, first timestamps and frame rates are filled in,
    /// then the durations are estimated. The packets read stay buffered.
    /// Fails only when streams exist and none of them could be identified.
    pub fn find_stream_info(&mut self) -> Result<()> {
        let old_offset = match self.ctx.io.as_ref() {
            Some(io) => io.tell(),
            None => 0,
        };
        let mut max_analyze_duration = self.ctx.options.max_analyze_duration;
        let mut max_stream_analyze_duration = max_analyze_duration;
        let mut max_subtitle_analyze_duration = max_analyze_duration;
        if max_analyze_duration == 0 {
            max_analyze_duration = 5 * TIME_BASE;
            max_stream_analyze_duration = max_analyze_duration;
            max_subtitle_analyze_duration = 30 * TIME_BASE;
            if self.ctx.format_name == "mpegts" {
                max_stream_analyze_duration = 7 * TIME_BASE;
            }
        }
        let probesize = self.ctx.options.probesize;
        let no_parse = self.ctx.has_flag(FormatFlags::NOPARSE);

        for st in &mut self.ctx.streams {
            if st.parser.is_none() && st.need_parsing != NeedParsing::None && !no_parse {
                match self.ctx.parsers.create(st.codecpar.codec_id) {
                    Some(mut parser) => {
                        match st.need_parsing {
                            NeedParsing::Headers => parser.flags |= ParserFlags::COMPLETE_FRAMES,
                            NeedParsing::FullRaw => parser.flags |= ParserFlags::USE_CODEC_TS,
                            _ => {}
                        }
                        st.parser = Some(parser);
                    }
                    None => debug!(stream = st.index, codec = %st.codecpar.codec_id, "parser not found"),
                }
            }
            if st.info.is_none() {
                st.info = Some(Box::default());
            }
        }

        let mut count = 0u64;
        let mut read_size = 0i64;
        let mut eof_reached = false;
        loop {
            if self.ctx.interrupted() {
                debug!(count, "interrupted");
                self.ctx.free_analysis_state();
                return Err(DemuxError::Interrupted);
            }

            let pending = (0..self.ctx.streams.len()).find(|&i| self.ctx.stream_needs_analysis(i));
            let analyzed_all_streams = pending.is_none();
            if analyzed_all_streams && !self.ctx.ctx_flags.contains(ContextFlags::NOHEADER) {
                debug!(count, "All info found");
                break;
            }
            if read_size >= probesize {
                debug!(probesize, "Probe buffer size limit reached");
                for st in &self.ctx.streams {
                    let few = st.info.as_deref().is_some_and(|info| info.duration_count <= 1);
                    if st.r_frame_rate.num == 0 && few && st.media_type() == MediaType::Video {
                        warn!(
                            stream = st.index,
                            "not enough frames to estimate rate; consider increasing probesize"
                        );
                    }
                }
                break;
            }

            let pkt = match self.read_frame_internal() {
                Ok(pkt) => pkt,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    debug!(error = %e, "end of input during stream analysis");
                    eof_reached = true;
                    break;
                }
            };
            let idx = pkt.stream_index;
            let (size, dts, pts, duration) = (pkt.size() as i64, pkt.dts, pkt.pts, pkt.duration);
            if !self.ctx.has_flag(FormatFlags::NOBUFFER) {
                self.ctx.packet_buffer.push_back(pkt);
            }

            if !self.ctx.streams[idx].is_attached_pic() {
                read_size += size;
            }

            self.ctx.track_analysis_packet(idx, dts);

            if self.ctx.streams[idx].codec_info_nb_frames > 1 {
                let t = self.ctx.analyzed_duration(idx);
                let limit = if analyzed_all_streams {
                    max_analyze_duration
                } else if self.ctx.streams[idx].media_type() == MediaType::Subtitle {
                    max_subtitle_analyze_duration
                } else {
                    max_stream_analyze_duration
                };
                if t >= limit {
                    info!(limit, t, stream = idx, "max_analyze_duration reached");
                    break;
                }
                if duration > 0 {
                    let st = &mut self.ctx.streams[idx];
                    let fields_per_frame = match &st.parser {
                        Some(parser) if st.need_parsing != NeedParsing::None && st.codecpar.codec_id.has_fields() => {
                            parser.repeat_pict as i64 + 1
                        }
                        _ => 2,
                    };
                    let subtitle = st.media_type() == MediaType::Subtitle;
                    let start_time = st.start_time;
                    if let Some(info) = st.info.as_deref_mut() {
                        match (pts, start_time) {
                            (Some(pts), Some(start)) if subtitle && pts >= start => {
                                info.codec_info_duration = (pts - start).min(info.codec_info_duration + duration);
                            }
                            _ => info.codec_info_duration += duration,
                        }
                        info.codec_info_duration_fields += fields_per_frame;
                    }
                }
            }

            if self.ctx.streams[idx].media_type() == MediaType::Video {
                self.ctx.rfps_add_frame(idx, dts);
                if dts != pts && dts.is_some() && pts.is_some() {
                    if let Some(info) = self.ctx.analysis(idx) {
                        info.frame_delay_evidence = true;
                    }
                }
            }

            self.ctx.streams[idx].codec_info_nb_frames += 1;
            count += 1;
        }

        if eof_reached {
            for idx in 0..self.ctx.streams.len() {
                if !self.ctx.packet_buffer.is_empty() && !has_decode_delay_been_guessed(&self.ctx.streams[idx]) {
                    self.ctx.update_dts_from_pts(idx);
                }
            }
        }

        self.ctx.rfps_calculate();

        for st in &mut self.ctx.streams {
            if st.media_type() != MediaType::Video {
                continue;
            }
            estimate_avg_frame_rate(st);
            if st.r_frame_rate.num == 0 {
                let mul = if st.codecpar.codec_id.has_fields() { 2 } else { 1 };
                let fr = Rational::new(st.codecpar.framerate.num.saturating_mul(mul), st.codecpar.framerate.den);
                let tb = st.time_base;
                if fr.num != 0 && fr.den != 0 && compare_ts(1, tb, 1, fr.invert()) != std::cmp::Ordering::Greater {
                    st.r_frame_rate = fr;
                } else {
                    st.r_frame_rate = tb.invert();
                }
            }
        }

        if probesize > 0 {
            self.estimate_timings(old_offset);
        }

        let mut any_known = self.ctx.streams.is_empty();
        for st in &self.ctx.streams {
            match missing_codec_parameters(st) {
                Some(reason) => warn!(
                    stream = st.index,
                    codec = %st.codecpar.codec_id,
                    reason,
                    analyzeduration = max_analyze_duration as f64 / TIME_BASE as f64,
                    probesize,
                    "Could not find codec parameters; consider increasing analyzeduration and probesize"
                ),
                None => any_known = true,
            }
        }

        self.ctx.compute_chapters_end();
        self.ctx.free_analysis_state();

        if let Some(io) = self.ctx.io.as_ref() {
            debug!(
                pos = io.tell(),
                bytes_read = io.bytes_read(),
                seeks = io.seek_count(),
                frames = count,
                "After find_stream_info"
            );
        }

        if any_known {
            Ok(())
        } else {
            Err(DemuxError::invalid_data("could not find codec parameters for any stream"))
        }
    }
}
