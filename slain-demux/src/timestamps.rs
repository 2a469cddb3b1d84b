//! # Timestamp correction
//!
//! Every packet that leaves the demuxer passes through here twice:
//!
//! - [`FormatContext::update_timestamps`] as soon as it is read, which
//!   establishes the per-stream wrap reference and unwraps pts/dts;
//! - [`FormatContext::compute_pkt_fields`] once it is a complete frame, which
//!   fills in missing dts/pts/duration, recovers decode order for codecs
//!   with reordering, and keeps `cur_dts` moving forward.
//!
//! Streams that have not seen a real timestamp yet count from
//! [`RELATIVE_TS_BASE`]. When the first real dts shows up, every queued
//! packet still carrying a relative value is shifted onto the real
//! timeline.

use tracing::{debug, warn};

use crate::codec::MediaType;
use crate::context::FormatContext;
use crate::format::InputFormatFlags;
use crate::options::FormatFlags;
use crate::packet::{Packet, PacketFlags};
use crate::parser::{ParserState, PictType};
use crate::queue::PacketQueue;
use crate::rational::{add_stable, rescale, rescale_q, rescale_rnd, Rational, Rounding};
use crate::stream::{NeedParsing, Stream, WrapBehavior};

/// Origin of the placeholder timeline used before a stream's first real dts.
pub const RELATIVE_TS_BASE: i64 = i64::MAX - (1 << 48);

/// Deepest decoder reorder delay the pts buffer can model.
pub const MAX_REORDER_DELAY: usize = 16;

pub fn is_relative(ts: i64) -> bool {
    ts > RELATIVE_TS_BASE - (1 << 48)
}

fn is_relative_opt(ts: Option<i64>) -> bool {
    ts.is_some_and(is_relative)
}

/// Applies the stream's wrap decision to `ts`.
pub fn wrap_timestamp(st: &Stream, ts: Option<i64>) -> Option<i64> {
    let (Some(ts), Some(reference)) = (ts, st.pts_wrap_reference) else {
        return ts;
    };
    if st.pts_wrap_bits >= 64 {
        return Some(ts);
    }
    let period = 1i64.wrapping_shl(st.pts_wrap_bits);
    Some(match st.pts_wrap_behavior {
        WrapBehavior::AddOffset if ts < reference => ts.wrapping_add(period),
        WrapBehavior::SubOffset if ts >= reference => ts.wrapping_sub(period),
        _ => ts,
    })
}

/// Walks the read-ahead buffer and then the parse queue until `f` returns
/// false. Returns true when the walk stopped early.
pub(crate) fn walk_queued<F>(packet_buffer: &mut PacketQueue, parse_queue: &mut PacketQueue, mut f: F) -> bool
where
    F: FnMut(&mut Packet) -> bool,
{
    let mut stopped = false;
    for queue in [packet_buffer, parse_queue] {
        queue.for_each_mut(|pkt| {
            stopped = !f(pkt);
            !stopped
        });
        if stopped {
            break;
        }
    }
    stopped
}

pub(crate) fn has_decode_delay_been_guessed(st: &Stream) -> bool {
    if st.codecpar.codec_id != crate::codec::CodecId::H264 || st.info.is_none() {
        return true;
    }
    match st.has_b_frames {
        0..=2 => st.codec_info_nb_frames >= 7,
        3 => st.codec_info_nb_frames >= 18,
        _ => st.codec_info_nb_frames >= 20,
    }
}

/// Picks the dts for a packet from the sorted pts window. With a known
/// dts, only the per-slot error estimates are updated.
fn select_from_pts_buffer(
    st: &mut Stream,
    pts_buffer: &[Option<i64>; MAX_REORDER_DELAY + 1],
    mut dts: Option<i64>,
) -> Option<i64> {
    if st.codecpar.codec_id.has_complex_reorder() {
        let delay = (st.has_b_frames.max(0) as usize).min(MAX_REORDER_DELAY);
        match dts {
            None => {
                let mut best = i64::MAX;
                for i in 0..delay {
                    let count = st.pts_reorder_error_count[i];
                    if count != 0 {
                        let score = st.pts_reorder_error[i] / count as i64;
                        if score < best {
                            best = score;
                            dts = pts_buffer[i];
                        }
                    }
                }
            }
            Some(d) => {
                for i in 0..delay {
                    let Some(p) = pts_buffer[i] else { continue };
                    let err = st.pts_reorder_error[i];
                    let diff = (p.wrapping_sub(d).unsigned_abs().wrapping_add(err as u64)) as i64;
                    st.pts_reorder_error[i] = diff.max(err);
                    st.pts_reorder_error_count[i] += 1;
                    if st.pts_reorder_error_count[i] > 250 {
                        st.pts_reorder_error[i] >>= 1;
                        st.pts_reorder_error_count[i] >>= 1;
                    }
                }
            }
        }
    }
    dts.or(pts_buffer[0])
}

/// Inserts `pts` at the front of the window and bubbles it into place.
fn push_pts(buffer: &mut [Option<i64>; MAX_REORDER_DELAY + 1], pts: i64, delay: usize) {
    buffer[0] = Some(pts);
    let mut i = 0;
    while i < delay && buffer[i] > buffer[i + 1] {
        buffer.swap(i, i + 1);
        i += 1;
    }
}

impl FormatContext {
    /// Establishes the wrap reference from the first timestamped packet of a
    /// stream and shares it with the streams that belong with it. Returns
    /// true if a reference was set.
    pub(crate) fn update_wrap_reference(&mut self, idx: usize, pkt: &Packet) -> bool {
        let st = &self.streams[idx];
        let Some(first) = pkt.dts.or(pkt.pts) else {
            return false;
        };
        if st.pts_wrap_reference.is_some() || st.pts_wrap_bits >= 63 || !self.options.correct_ts_overflow {
            return false;
        }

        let bits = st.pts_wrap_bits;
        let first = first & ((1i64 << bits) - 1);
        let sixty = rescale(60, st.time_base.den as i64, st.time_base.num as i64);
        let mut reference = first - sixty;
        let mut behavior = if first < (1i64 << bits) - (1i64 << (bits - 3)) || first < (1i64 << bits) - sixty {
            WrapBehavior::AddOffset
        } else {
            WrapBehavior::SubOffset
        };

        if !self.programs.iter().any(|p| p.contains(idx)) {
            let Some(default) = self.default_stream_index() else {
                return false;
            };
            let default_ref = self.streams[default].pts_wrap_reference;
            if default_ref.is_none() {
                for i in 0..self.streams.len() {
                    if self.programs.iter().any(|p| p.contains(i)) {
                        continue;
                    }
                    self.streams[i].pts_wrap_reference = Some(reference);
                    self.streams[i].pts_wrap_behavior = behavior;
                }
            } else {
                let default_behavior = self.streams[default].pts_wrap_behavior;
                self.streams[idx].pts_wrap_reference = default_ref;
                self.streams[idx].pts_wrap_behavior = default_behavior;
            }
        } else {
            if let Some(p) = self
                .programs
                .iter()
                .find(|p| p.contains(idx) && p.pts_wrap_reference.is_some())
            {
                reference = p.pts_wrap_reference.unwrap_or(reference);
                behavior = p.pts_wrap_behavior;
            }
            for program in self.programs.iter_mut().filter(|p| p.contains(idx)) {
                if program.pts_wrap_reference == Some(reference) {
                    continue;
                }
                for &s in &program.stream_indices {
                    if let Some(st) = self.streams.get_mut(s) {
                        st.pts_wrap_reference = Some(reference);
                        st.pts_wrap_behavior = behavior;
                    }
                }
                program.pts_wrap_reference = Some(reference);
                program.pts_wrap_behavior = behavior;
            }
        }
        debug!(stream = idx, reference, ?behavior, "Wrap reference established");
        true
    }

    /// Unwraps a freshly read packet's timestamps. The first timestamp of a
    /// stream that predates a wrap also moves the stream's already known
    /// start values below zero.
    pub(crate) fn update_timestamps(&mut self, pkt: &mut Packet) {
        let idx = pkt.stream_index;
        if self.update_wrap_reference(idx, pkt) && self.streams[idx].pts_wrap_behavior == WrapBehavior::SubOffset {
            let st = &mut self.streams[idx];
            if !is_relative_opt(st.first_dts) {
                st.first_dts = wrap_timestamp(st, st.first_dts);
            }
            if !is_relative_opt(st.start_time) {
                st.start_time = wrap_timestamp(st, st.start_time);
            }
            if !is_relative_opt(st.cur_dts) {
                st.cur_dts = wrap_timestamp(st, st.cur_dts);
            }
        }
        let st = &self.streams[idx];
        pkt.dts = wrap_timestamp(st, pkt.dts);
        pkt.pts = wrap_timestamp(st, pkt.pts);
    }

    /// Re-derives the dts of queued packets of stream `idx` from their pts.
    pub(crate) fn update_dts_from_pts(&mut self, idx: usize) {
        let Self { streams, packet_buffer, parse_queue, .. } = self;
        let st = &mut streams[idx];
        let delay = st.has_b_frames.max(0) as usize;
        if delay > MAX_REORDER_DELAY {
            return;
        }
        let mut pts_buffer = [None; MAX_REORDER_DELAY + 1];
        walk_queued(packet_buffer, parse_queue, |pkt| {
            if pkt.stream_index == idx {
                if let Some(pts) = pkt.pts {
                    push_pts(&mut pts_buffer, pts, delay);
                    pkt.dts = select_from_pts_buffer(st, &pts_buffer, pkt.dts);
                }
            }
            true
        });
    }

    /// Moves a stream from the relative timeline onto real timestamps once
    /// its first real dts is known, shifting every queued packet with it.
    pub(crate) fn update_initial_timestamps(
        &mut self,
        idx: usize,
        dts: Option<i64>,
        pts: Option<i64>,
        discard: bool,
    ) {
        let st = &self.streams[idx];
        let (Some(dts), Some(cur_dts)) = (dts, st.cur_dts) else {
            return;
        };
        if st.first_dts.is_some()
            || cur_dts < i32::MIN as i64 + RELATIVE_TS_BASE
            || dts < (i32::MIN as i64).saturating_add(cur_dts - RELATIVE_TS_BASE)
            || is_relative(dts)
        {
            return;
        }

        let first_dts = dts - (cur_dts - RELATIVE_TS_BASE);
        let shift = first_dts.wrapping_sub(RELATIVE_TS_BASE);
        let pts = pts.map(|p| if is_relative(p) { p.wrapping_add(shift) } else { p });

        let Self { streams, packet_buffer, parse_queue, .. } = self;
        let st = &mut streams[idx];
        st.first_dts = Some(first_dts);
        st.cur_dts = Some(dts);

        let skip = audio_skip_offset(st);
        walk_queued(packet_buffer, parse_queue, |pkt| {
            if pkt.stream_index != idx {
                return true;
            }
            if is_relative_opt(pkt.pts) {
                pkt.pts = pkt.pts.map(|p| p.wrapping_add(shift));
            }
            if is_relative_opt(pkt.dts) {
                pkt.dts = pkt.dts.map(|d| d.wrapping_add(shift));
            }
            if st.start_time.is_none() {
                if let Some(p) = pkt.pts {
                    st.start_time = Some(p.saturating_add(skip));
                }
            }
            true
        });

        if has_decode_delay_been_guessed(&self.streams[idx]) {
            self.update_dts_from_pts(idx);
        }

        let st = &mut self.streams[idx];
        if st.start_time.is_none() {
            if st.media_type() == MediaType::Audio || !discard {
                st.start_time = pts;
            }
            if st.media_type() == MediaType::Audio {
                st.start_time = st.start_time.map(|t| t.saturating_add(skip));
            }
        }
    }

    /// Gives queued packets that arrived without timestamps or duration a
    /// run of `duration`-spaced dts, ending at the stream's first dts.
    fn update_initial_durations(&mut self, idx: usize, duration: i64) {
        let Self { streams, packet_buffer, parse_queue, .. } = self;
        let st = &mut streams[idx];
        let mut cur_dts = RELATIVE_TS_BASE;

        if let Some(first_dts) = st.first_dts {
            if st.update_initial_durations_done {
                return;
            }
            st.update_initial_durations_done = true;
            cur_dts = first_dts;

            let mut anchor: Option<Option<i64>> = None;
            walk_queued(packet_buffer, parse_queue, |pkt| {
                if pkt.stream_index != idx {
                    return true;
                }
                if pkt.pts != pkt.dts || pkt.dts.is_some() || pkt.duration != 0 {
                    anchor = Some(pkt.dts);
                    return false;
                }
                cur_dts -= duration;
                true
            });
            match anchor {
                None => {
                    debug!(stream = idx, first_dts, "first_dts but no packet with dts in the queue");
                    return;
                }
                Some(dts) if dts != Some(first_dts) => {
                    debug!(stream = idx, first_dts, ?dts, "first_dts not matching first queued dts");
                    return;
                }
                Some(_) => {}
            }
            st.first_dts = Some(cur_dts);
        } else if st.cur_dts != Some(RELATIVE_TS_BASE) {
            return;
        }

        let first_dts = st.first_dts;
        let has_b_frames = st.has_b_frames;
        let stopped = walk_queued(packet_buffer, parse_queue, |pkt| {
            if pkt.stream_index != idx {
                return true;
            }
            let fillable = (pkt.pts == pkt.dts || pkt.pts.is_none())
                && (pkt.dts.is_none() || pkt.dts == first_dts || pkt.dts == Some(RELATIVE_TS_BASE))
                && pkt.duration == 0
                && cur_dts.checked_add(duration).is_some();
            if !fillable {
                return false;
            }
            pkt.dts = Some(cur_dts);
            if has_b_frames == 0 {
                pkt.pts = Some(cur_dts);
            }
            pkt.duration = duration;
            cur_dts += duration;
            true
        });
        if !stopped {
            st.cur_dts = Some(cur_dts);
        }
    }

    /// Frame duration as `num/den` seconds, `(0, 0)` when unknown.
    pub(crate) fn compute_frame_duration(&self, idx: usize, pc: Option<&ParserState>, pkt: &Packet) -> (i64, i64) {
        let st = &self.streams[idx];
        match st.media_type() {
            MediaType::Video => {
                let codec_rate = st.codecpar.framerate;
                let avg = st.avg_frame_rate;
                let tb = st.time_base;
                if st.r_frame_rate.num != 0 && (pc.is_none() || codec_rate.num == 0) {
                    (st.r_frame_rate.den as i64, st.r_frame_rate.num as i64)
                } else if self.format_flags.contains(InputFormatFlags::NOTIMESTAMPS)
                    && codec_rate.num == 0
                    && avg.num != 0
                    && avg.den != 0
                {
                    (avg.den as i64, avg.num as i64)
                } else if tb.num as i64 * 1000 > tb.den as i64 {
                    (tb.num as i64, tb.den as i64)
                } else if codec_rate.den as i64 * 1000 > codec_rate.num as i64 {
                    let fields = st.codecpar.codec_id.has_fields();
                    let ticks = if fields { 2 } else { 1 };
                    let (mut r, _) = Rational::reduce(codec_rate.den as i64, codec_rate.num as i64 * ticks, i32::MAX as i64);
                    if let Some(pc) = pc.filter(|pc| pc.repeat_pict != 0) {
                        r = Rational::reduce(r.num as i64 * (1 + pc.repeat_pict as i64), r.den as i64, i32::MAX as i64).0;
                    }
                    if fields && pc.is_none() {
                        (0, 0)
                    } else {
                        (r.num as i64, r.den as i64)
                    }
                } else {
                    (0, 0)
                }
            }
            MediaType::Audio => {
                let frame_size = st.codecpar.audio_frame_duration(pkt.size());
                let sample_rate = st.codecpar.sample_rate as i64;
                if frame_size <= 0 || sample_rate <= 0 {
                    (0, 0)
                } else {
                    (frame_size, sample_rate)
                }
            }
            _ => (0, 0),
        }
    }

    /// Completes a packet's pts, dts and duration and advances the stream's
    /// expected dts. `pc` is the state of the parser that produced the
    /// packet; `next_dts`/`next_pts` are the timestamps of the input packet
    /// the parser is consuming.
    pub(crate) fn compute_pkt_fields(
        &mut self,
        idx: usize,
        pc: Option<&ParserState>,
        pkt: &mut Packet,
        next_dts: Option<i64>,
        next_pts: Option<i64>,
    ) {
        if self.options.has_flag(FormatFlags::NOFILLIN) {
            return;
        }
        let ign_dts = self.options.has_flag(FormatFlags::IGNDTS);
        let queued = !self.packet_buffer.is_empty() || !self.parse_queue.is_empty();

        let st = &mut self.streams[idx];
        let one_in_one_out = !st.codecpar.codec_id.has_complex_reorder();

        if st.media_type() == MediaType::Video {
            if let Some(dts) = pkt.dts {
                if pkt.pts == Some(dts) {
                    if let Some(last) = st.last_dts_for_order_check {
                        if last <= dts {
                            st.dts_ordered += 1;
                        } else {
                            if st.dts_misordered != 0 {
                                debug!(stream = idx, dts, last, "DTS out of order");
                            } else {
                                warn!(stream = idx, dts, last, "DTS out of order");
                            }
                            st.dts_misordered += 1;
                        }
                        if st.dts_ordered + st.dts_misordered > 250 {
                            st.dts_ordered >>= 1;
                            st.dts_misordered >>= 1;
                        }
                    }
                }
                st.last_dts_for_order_check = Some(dts);
                if st.dts_ordered < 8 * st.dts_misordered && pkt.pts == Some(dts) {
                    pkt.dts = None;
                }
            }
        }

        if ign_dts && pkt.pts.is_some() {
            pkt.dts = None;
        }

        if pc.is_some_and(|pc| pc.pict_type == PictType::B) && st.has_b_frames == 0 {
            st.has_b_frames = 1;
        }

        let delay = st.has_b_frames.max(0) as usize;
        let mut presentation_delayed = delay != 0 && pc.is_some_and(|pc| pc.pict_type != PictType::B);

        if let (Some(pts), Some(dts)) = (pkt.pts, pkt.dts) {
            let bits = st.pts_wrap_bits;
            if bits < 63 && dts > i64::MIN + (1i64 << bits) && dts - (1i64 << (bits - 1)) > pts {
                let half = dts - (1i64 << (bits - 1));
                if st.cur_dts.map_or(true, |c| is_relative(c) || half > c) {
                    pkt.dts = Some(dts - (1i64 << bits));
                } else {
                    pkt.dts = Some(dts + (1i64 << bits));
                }
            }
        }

        if delay == 1 && pkt.dts.is_some() && pkt.dts == pkt.pts && presentation_delayed {
            debug!(stream = idx, dts = ?pkt.dts, "Invalid dts/pts combination");
            pkt.dts = None;
        }

        let tb = st.time_base;
        let mut duration = Rational::reduce(pkt.duration.saturating_mul(tb.num as i64), tb.den as i64, i32::MAX as i64).0;
        if pkt.duration <= 0 {
            let (num, den) = self.compute_frame_duration(idx, pc, pkt);
            if num != 0 && den != 0 {
                duration = Rational::reduce(num, den, i32::MAX as i64).0;
                pkt.duration = rescale_rnd(1, num * tb.den as i64, den * tb.num as i64, Rounding::Down);
            }
        }

        if pkt.duration > 0 && queued {
            self.update_initial_durations(idx, pkt.duration);
        }

        let st = &self.streams[idx];
        if let Some(pc) = pc {
            if st.need_parsing == NeedParsing::Timestamps && pkt.size() != 0 {
                let offset = rescale(pc.offset, pkt.duration, pkt.size() as i64);
                pkt.pts = pkt.pts.map(|p| p + offset);
                pkt.dts = pkt.dts.map(|d| d + offset);
            }
        }

        if let (Some(pts), Some(dts)) = (pkt.pts, pkt.dts) {
            if pts > dts {
                presentation_delayed = true;
            }
        }

        let discard = pkt.flags.contains(PacketFlags::DISCARD);
        if (delay == 0 || (delay == 1 && pc.is_some())) && one_in_one_out {
            if presentation_delayed {
                if pkt.dts.is_none() {
                    pkt.dts = self.streams[idx].last_ip_pts;
                }
                self.update_initial_timestamps(idx, pkt.dts, pkt.pts, discard);
                let st = &mut self.streams[idx];
                if pkt.dts.is_none() {
                    pkt.dts = st.cur_dts;
                }
                if st.last_ip_duration == 0 && (0..=i32::MAX as i64).contains(&pkt.duration) {
                    st.last_ip_duration = pkt.duration;
                }
                if let Some(dts) = pkt.dts {
                    st.cur_dts = Some(dts.saturating_add(st.last_ip_duration));
                }
                if let (Some(_), Some(_), Some(cur), Some(nd), Some(_)) = (pkt.dts, pkt.pts, st.cur_dts, next_dts, next_pts) {
                    if st.last_ip_duration > 0
                        && (cur.wrapping_sub(nd).wrapping_add(1) as u64) <= 2
                        && next_dts != next_pts
                    {
                        pkt.pts = next_dts;
                    }
                }
                if (0..=i32::MAX as i64).contains(&pkt.duration) {
                    st.last_ip_duration = pkt.duration;
                }
                st.last_ip_pts = pkt.pts;
            } else if pkt.pts.is_some() || pkt.dts.is_some() || pkt.duration > 0 {
                if pkt.pts.is_none() {
                    pkt.pts = pkt.dts;
                }
                self.update_initial_timestamps(idx, pkt.pts, pkt.pts, discard);
                let st = &mut self.streams[idx];
                if pkt.pts.is_none() {
                    pkt.pts = st.cur_dts;
                }
                pkt.dts = pkt.pts;
                if let Some(pts) = pkt.pts {
                    if duration.num >= 0 {
                        st.cur_dts = Some(add_stable(st.time_base, pts, duration, 1));
                    }
                }
            }
        }

        let st = &mut self.streams[idx];
        if let Some(pts) = pkt.pts {
            if delay <= MAX_REORDER_DELAY {
                push_pts(&mut st.pts_buffer, pts, delay);
                if has_decode_delay_been_guessed(st) {
                    let window = st.pts_buffer;
                    pkt.dts = select_from_pts_buffer(st, &window, pkt.dts);
                }
            }
        }

        if !one_in_one_out {
            self.update_initial_timestamps(idx, pkt.dts, pkt.pts, discard);
        }

        let st = &mut self.streams[idx];
        if pkt.dts > st.cur_dts {
            st.cur_dts = pkt.dts;
        }

        if st.media_type() == MediaType::Data || st.codecpar.codec_id.is_intra_only() {
            pkt.flags |= PacketFlags::KEY;
        }
    }
}

/// Encoder delay of an audio stream in its time base.
fn audio_skip_offset(st: &Stream) -> i64 {
    if st.media_type() != MediaType::Audio || st.codecpar.sample_rate == 0 {
        return 0;
    }
    rescale_q(st.skip_samples, Rational::new(1, st.codecpar.sample_rate as i32), st.time_base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::options::DemuxOptions;

    fn ctx_with(codec: CodecId, tb: Rational) -> FormatContext {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        let st = ctx.new_stream().expect("stream");
        st.codecpar.set_codec(codec);
        st.time_base = tb;
        ctx
    }

    fn pkt(pts: Option<i64>, dts: Option<i64>) -> Packet {
        let mut p = Packet::new(0, bytes::Bytes::from_static(&[0; 16]));
        p.pts = pts;
        p.dts = dts;
        p
    }

    #[test]
    fn relative_base_is_detected() {
        assert!(is_relative(RELATIVE_TS_BASE));
        assert!(is_relative(RELATIVE_TS_BASE + 1_000));
        assert!(!is_relative(0));
        assert!(!is_relative(1 << 40));
    }

    #[test]
    fn wrap_crossing_is_monotonic() {
        let mut ctx = ctx_with(CodecId::Mp2, Rational::new(1, 90_000));
        let wrap = 1i64 << 33;
        let mut ts = wrap - 450_000;
        let mut out = Vec::new();
        for _ in 0..20 {
            let mut p = pkt(Some(ts % wrap), Some(ts % wrap));
            ctx.update_timestamps(&mut p);
            out.push(p.dts.expect("dts"));
            ts += 45_000;
        }
        assert_eq!(ctx.streams[0].wrap_behavior(), WrapBehavior::SubOffset);
        assert!(out[0] < 0);
        assert!(out.windows(2).all(|w| w[0] <= w[1]), "{:?}", out);
    }

    #[test]
    fn early_timestamps_add_offset() {
        let mut ctx = ctx_with(CodecId::Mp2, Rational::new(1, 90_000));
        let mut p = pkt(Some(900_000), None);
        ctx.update_timestamps(&mut p);
        assert_eq!(ctx.streams[0].wrap_behavior(), WrapBehavior::AddOffset);
        assert_eq!(ctx.streams[0].wrap_reference(), Some(900_000 - 5_400_000));
        assert_eq!(p.pts, Some(900_000));
    }

    #[test]
    fn reorder_recovers_dts_from_pts() {
        let mut ctx = ctx_with(CodecId::H264, Rational::new(1, 90_000));
        ctx.streams[0].has_b_frames = 2;
        ctx.streams[0].info = None;
        let mut dts = Vec::new();
        for pts in [3, 1, 2, 6, 4, 5] {
            let mut p = pkt(Some(pts), None);
            ctx.compute_pkt_fields(0, None, &mut p, None, None);
            dts.push(p.dts);
        }
        assert_eq!(dts, vec![None, None, Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(ctx.streams[0].first_dts(), Some(1));
    }

    #[test]
    fn missing_timestamps_accumulate_duration() {
        let mut ctx = ctx_with(CodecId::Mp2, Rational::new(1, 48_000));
        ctx.streams[0].codecpar.sample_rate = 48_000;
        let mut last = None;
        for i in 0..4 {
            let mut p = pkt(None, None);
            ctx.compute_pkt_fields(0, None, &mut p, None, None);
            assert_eq!(p.duration, 1152);
            let dts = p.dts.expect("dts");
            assert!(is_relative(dts));
            assert_eq!(dts - RELATIVE_TS_BASE, 1152 * i);
            assert_eq!(p.pts, p.dts);
            last = Some(dts);
        }
        assert_eq!(ctx.streams[0].cur_dts(), last.map(|d| d + 1152));
    }

    #[test]
    fn first_real_dts_rebases_queued_packets() {
        let mut ctx = ctx_with(CodecId::Mp2, Rational::new(1, 48_000));
        ctx.streams[0].codecpar.sample_rate = 48_000;
        for _ in 0..2 {
            let mut p = pkt(None, None);
            ctx.compute_pkt_fields(0, None, &mut p, None, None);
            ctx.parse_queue.push_back(p);
        }
        let mut p = pkt(Some(10_000), Some(10_000));
        ctx.compute_pkt_fields(0, None, &mut p, None, None);

        let queued: Vec<_> = ctx.parse_queue.iter().map(|p| p.dts).collect();
        assert_eq!(queued, vec![Some(10_000 - 2304), Some(10_000 - 1152)]);
        assert_eq!(ctx.streams[0].first_dts(), Some(10_000 - 2304));
        assert_eq!(ctx.streams[0].start_time, Some(10_000 - 2304));
        assert_eq!(ctx.streams[0].cur_dts(), Some(11_152));
    }

    #[test]
    fn out_of_order_dts_is_dropped_when_frequent() {
        let mut ctx = ctx_with(CodecId::Mpeg4, Rational::new(1, 25));
        for ts in [10, 5, 11, 4, 12, 3, 13, 2] {
            let mut p = pkt(Some(ts), Some(ts));
            ctx.compute_pkt_fields(0, None, &mut p, None, None);
        }
        let st = &ctx.streams[0];
        assert!(st.dts_misordered > 0);
        assert!(st.dts_ordered < 8 * st.dts_misordered);
    }
}
