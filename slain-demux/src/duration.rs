//! Start time, duration and bit rate of a file.
//!
//! Three estimators, from most to least precise: scanning the tail of the file
//! for the last timestamps (MPEG-TS only), trusting durations the container
//! announced, and dividing the file size by the bit rate.

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::codec::MediaType;
use crate::context::FormatContext;
use crate::error::DemuxError;
use crate::format::InputFormatFlags;
use crate::io::Seekability;
use crate::options::DURATION_DEFAULT_MAX_READ_SIZE;
use crate::protocol::Whence;
use crate::rational::{rescale, rescale_q, rescale_q_rnd, rescale_rnd, Rounding, TIME_BASE, TIME_BASE_Q};
use crate::session::Session;

const DURATION_MAX_RETRY: u32 = 1;

/// How [`FormatContext::duration`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationEstimation {
    /// From the timestamps of the first and last packets.
    #[default]
    FromPts,
    /// From a duration announced by a stream or the container.
    FromStream,
    /// From the file size and bit rate; least accurate.
    FromBitrate,
}

fn is_text(media_type: MediaType) -> bool {
    matches!(media_type, MediaType::Subtitle | MediaType::Data)
}

impl FormatContext {
    fn file_size(&mut self) -> i64 {
        if self.format_flags.contains(InputFormatFlags::NOFILE) {
            return 0;
        }
        match self.io.as_mut() {
            Some(io) => io.size().unwrap_or(0).max(0),
            None => 0,
        }
    }

    fn has_duration(&self) -> bool {
        self.duration.is_some() || self.streams.iter().any(|st| st.duration.is_some())
    }

    /// Derives the file's start time, duration and bit rate from the
    /// streams. Subtitle and data streams only count when nothing else does
    /// or when they are within a second of the audio/video bounds.
    pub(crate) fn update_stream_timings(&mut self) {
        let mut start_time = i64::MAX;
        let mut start_time_text = i64::MAX;
        let mut end_time = i64::MIN;
        let mut end_time_text = i64::MIN;
        let mut duration = i64::MIN;
        let mut duration_text = i64::MIN;

        for i in 0..self.streams.len() {
            let st = &self.streams[i];
            let text = is_text(st.media_type());

            if let Some(st_start) = st.start_time.filter(|_| st.time_base.den != 0) {
                let start1 = rescale_q(st_start, st.time_base, TIME_BASE_Q);
                if text {
                    start_time_text = start_time_text.min(start1);
                } else {
                    start_time = start_time.min(start1);
                }
                let end1 = st
                    .duration
                    .map(|d| rescale_q_rnd(d, st.time_base, TIME_BASE_Q, Rounding::NearInf))
                    .and_then(|d| start1.checked_add(d));
                if let Some(end1) = end1 {
                    if text {
                        end_time_text = end_time_text.max(end1);
                    } else {
                        end_time = end_time.max(end1);
                    }
                }
                for p in self.programs.iter_mut().filter(|p| p.contains(i)) {
                    if p.start_time.map_or(true, |s| s > start1) {
                        p.start_time = Some(start1);
                    }
                    if p.end_time < end1 {
                        p.end_time = end1;
                    }
                }
            }
            let st = &self.streams[i];
            if let Some(d) = st.duration {
                let d1 = rescale_q(d, st.time_base, TIME_BASE_Q);
                if text {
                    duration_text = duration_text.max(d1);
                } else {
                    duration = duration.max(d1);
                }
            }
        }

        if start_time == i64::MAX
            || (start_time > start_time_text && (start_time as i128 - start_time_text as i128) < TIME_BASE as i128)
        {
            start_time = start_time_text;
        } else if start_time > start_time_text {
            debug!(start = start_time_text as f64 / TIME_BASE as f64, "Ignoring outlier non primary stream starttime");
        }

        if end_time == i64::MIN
            || (end_time < end_time_text && (end_time_text as i128 - end_time as i128) < TIME_BASE as i128)
        {
            end_time = end_time_text;
        } else if end_time < end_time_text {
            debug!(end = end_time_text as f64 / TIME_BASE as f64, "Ignoring outlier non primary stream endtime");
        }

        if duration == i64::MIN
            || (duration < duration_text && (duration_text as i128 - duration as i128) < TIME_BASE as i128)
        {
            duration = duration_text;
        } else if duration < duration_text {
            debug!(duration = duration_text as f64 / TIME_BASE as f64, "Ignoring outlier non primary stream duration");
        }

        if start_time != i64::MAX {
            self.start_time = Some(start_time);
            if end_time != i64::MIN {
                if self.programs.len() > 1 {
                    for p in &self.programs {
                        if let (Some(ps), Some(pe)) = (p.start_time, p.end_time) {
                            if pe > ps {
                                if let Some(span) = pe.checked_sub(ps) {
                                    duration = duration.max(span);
                                }
                            }
                        }
                    }
                } else if end_time >= start_time {
                    if let Some(span) = end_time.checked_sub(start_time) {
                        duration = duration.max(span);
                    }
                }
            }
        }

        if duration != i64::MIN && duration > 0 && self.duration.is_none() {
            self.duration = Some(duration);
        }

        let filesize = self.io.as_mut().and_then(|io| io.size().ok()).unwrap_or(0);
        if let Some(d) = self.duration.filter(|&d| d > 0) {
            if filesize > 0 {
                let bitrate = filesize as f64 * 8.0 * TIME_BASE as f64 / d as f64;
                if (0.0..=i64::MAX as f64).contains(&bitrate) {
                    self.bit_rate = bitrate as i64;
                }
            }
        }
    }

    /// Spreads the file's timings to streams that announced none.
    fn fill_all_stream_timings(&mut self) {
        self.update_stream_timings();
        let (start, duration) = (self.start_time, self.duration);
        for st in &mut self.streams {
            if st.start_time.is_none() {
                if let Some(start) = start {
                    st.start_time = Some(rescale_q(start, TIME_BASE_Q, st.time_base));
                }
                if let Some(duration) = duration {
                    st.duration = Some(rescale_q(duration, TIME_BASE_Q, st.time_base));
                }
            }
        }
    }

    fn estimate_timings_from_bit_rate(&mut self) {
        if self.bit_rate <= 0 {
            let mut bit_rate: i64 = 0;
            for st in &self.streams {
                if st.codecpar.bit_rate > 0 {
                    match bit_rate.checked_add(st.codecpar.bit_rate) {
                        Some(sum) => bit_rate = sum,
                        None => {
                            bit_rate = 0;
                            break;
                        }
                    }
                } else if st.media_type() == MediaType::Video && st.codec_info_nb_frames > 1 {
                    // a video stream with packets but no rate makes the sum meaningless
                    bit_rate = 0;
                    break;
                }
            }
            self.bit_rate = bit_rate;
        }

        let mut estimated = false;
        if self.duration.is_none() && self.bit_rate != 0 {
            let filesize = self.io.as_mut().and_then(|io| io.size().ok()).unwrap_or(0);
            if filesize > self.data_offset {
                let payload = filesize - self.data_offset;
                let bit_rate = self.bit_rate;
                for st in &mut self.streams {
                    if st.time_base.num as i64 <= i64::MAX / bit_rate && st.duration.is_none() {
                        st.duration = Some(rescale(payload, 8 * st.time_base.den as i64, bit_rate * st.time_base.num as i64));
                        estimated = true;
                    }
                }
            }
        }
        if estimated {
            warn!("Estimating duration from bitrate, this may be inaccurate");
        }
    }
}

impl Session {
    /// Fills in start time, duration and bit rate after stream analysis.
    /// `old_offset` is where reading resumes when the estimator had to scan
    /// elsewhere in the file.
    pub(crate) fn estimate_timings(&mut self, old_offset: i64) {
        let file_size = self.ctx.file_size();
        let seekable = self.ctx.io.as_ref().is_some_and(|io| io.seekable() == Seekability::Normal);

        if self.ctx.format_name == "mpegts" && file_size > 0 && seekable {
            self.estimate_timings_from_pts(old_offset);
            self.ctx.duration_estimation = DurationEstimation::FromPts;
        } else if self.ctx.has_duration() {
            self.ctx.fill_all_stream_timings();
            self.ctx.duration_estimation = DurationEstimation::FromStream;
        } else {
            self.ctx.estimate_timings_from_bit_rate();
            self.ctx.duration_estimation = DurationEstimation::FromBitrate;
        }
        self.ctx.update_stream_timings();

        for st in &self.ctx.streams {
            if st.time_base.den != 0 {
                trace!(stream = st.index, start_time = ?st.start_time, duration = ?st.duration, "stream timings");
            }
        }
        trace!(
            start_time = ?self.ctx.start_time,
            duration = ?self.ctx.duration,
            method = ?self.ctx.duration_estimation,
            bitrate_kbs = self.ctx.bit_rate / 1000,
            "format timings"
        );
    }

    /// Reads packets from growing windows at the end of the file until every
    /// audio and video stream has a last timestamp.
    fn estimate_timings_from_pts(&mut self, old_offset: i64) {
        let (max_read_size, max_retry) = match self.ctx.options.duration_probesize {
            0 => (DURATION_DEFAULT_MAX_READ_SIZE, self.ctx.options.duration_max_retry),
            probesize => (probesize >> DURATION_MAX_RETRY, DURATION_MAX_RETRY),
        };

        self.ctx.flush_packet_queues();
        for st in &mut self.ctx.streams {
            if st.start_time.is_none() && st.first_dts.is_none() && st.media_type() != MediaType::Unknown {
                warn!(stream = st.index, "start time is not set in estimate_timings_from_pts");
            }
            st.parser = None;
        }

        if self.ctx.options.skip_estimate_duration_from_pts {
            info!("Skipping duration calculation in estimate_timings_from_pts");
        } else {
            self.scan_tail_for_durations(max_read_size, max_retry);
        }

        self.ctx.fill_all_stream_timings();

        if let Some(io) = self.ctx.io.as_mut() {
            if let Err(e) = io.seek(old_offset, Whence::Start) {
                warn!(offset = old_offset, error = %e, "could not seek back after duration scan");
            }
        }
        for st in &mut self.ctx.streams {
            st.cur_dts = st.first_dts;
            st.reset_reorder_state();
        }
    }

    fn scan_tail_for_durations(&mut self, max_read_size: i64, max_retry: u32) {
        let filesize = self.ctx.file_size();
        let mut found_duration = false;
        let mut retry: u32 = 0;

        loop {
            let mut is_end = found_duration;
            let offset = (filesize - (max_read_size << retry)).max(0);
            if let Some(io) = self.ctx.io.as_mut() {
                if io.seek(offset, Whence::Start).is_err() {
                    break;
                }
            }

            let read_limit = max_read_size << retry.saturating_sub(1);
            let mut read_size: i64 = 0;
            while read_size < read_limit {
                let mut pkt = match self.read_raw_packet() {
                    Ok(pkt) => pkt,
                    Err(DemuxError::WouldBlock) => continue,
                    Err(_) => break,
                };
                read_size += pkt.size() as i64;
                let idx = pkt.stream_index;
                let Some(pts) = pkt.pts else { continue };
                let (start_time, first_dts) = (self.ctx.streams[idx].start_time, self.ctx.streams[idx].first_dts);
                let Some(origin) = start_time.or(first_dts) else { continue };

                if pkt.duration == 0 {
                    let (num, den) = self.ctx.compute_frame_duration(idx, None, &pkt);
                    if num != 0 && den != 0 {
                        let tb = self.ctx.streams[idx].time_base;
                        pkt.duration =
                            rescale_rnd(1, num * tb.den as i64, den * tb.num as i64, Rounding::Down);
                    }
                }
                let duration = pts + pkt.duration - origin;
                found_duration = true;
                if duration > 0 {
                    let st = &mut self.ctx.streams[idx];
                    let window = 60 * st.time_base.den as i64 / st.time_base.num.max(1) as i64;
                    let Some(info) = st.info.as_deref_mut() else { continue };
                    let accept = match st.duration {
                        None => true,
                        Some(_) if info.last_duration <= 0 => true,
                        Some(cur) => cur < duration && (duration - info.last_duration).abs() < window,
                    };
                    if accept {
                        st.duration = Some(duration);
                    }
                    info.last_duration = duration;
                }
            }

            if !is_end {
                is_end = self
                    .ctx
                    .streams
                    .iter()
                    .filter(|st| matches!(st.media_type(), MediaType::Video | MediaType::Audio))
                    .all(|st| st.duration.is_some());
            }
            retry += 1;
            if is_end || offset == 0 || retry > max_retry {
                break;
            }
        }

        for st in &self.ctx.streams {
            if st.duration.is_none() && matches!(st.media_type(), MediaType::Video | MediaType::Audio) {
                if st.start_time.is_some() || st.first_dts.is_some() {
                    warn!(stream = st.index, "no PTS found at end of file, duration not set");
                } else {
                    warn!(stream = st.index, "no TS found at start of file, duration not set");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::format::InputFormatFlags;
    use crate::io::IoContext;
    use crate::options::DemuxOptions;
    use crate::rational::Rational;
    use crate::testing::{open_synth, ScriptedPacket, SynthFormat};

    fn ctx_with_streams(kinds: &[CodecId]) -> FormatContext {
        let mut ctx = FormatContext::new(DemuxOptions::default());
        for &codec in kinds {
            ctx.new_stream().expect("stream").codecpar.set_codec(codec);
        }
        ctx
    }

    #[test]
    fn duration_from_bit_rate() {
        let mut ctx = ctx_with_streams(&[CodecId::Mp3]);
        ctx.io = Some(IoContext::from_bytes(vec![0u8; 100_000].into()));
        ctx.streams[0].codecpar.bit_rate = 80_000;

        ctx.estimate_timings_from_bit_rate();
        ctx.update_stream_timings();

        assert_eq!(ctx.bit_rate, 80_000);
        assert_eq!(ctx.streams[0].duration, Some(900_000));
        assert_eq!(ctx.duration, Some(10_000_000));
        assert_eq!(ctx.start_time, None);
    }

    #[test]
    fn video_without_rate_spoils_bit_rate_sum() {
        let mut ctx = ctx_with_streams(&[CodecId::Mp3, CodecId::H264]);
        ctx.io = Some(IoContext::from_bytes(vec![0u8; 1000].into()));
        ctx.streams[0].codecpar.bit_rate = 128_000;
        ctx.streams[1].codec_info_nb_frames = 5;
        ctx.estimate_timings_from_bit_rate();
        assert_eq!(ctx.bit_rate, 0);
        assert!(ctx.streams.iter().all(|st| st.duration.is_none()));
    }

    #[test]
    fn announced_durations_fill_other_streams() {
        let mut ctx = ctx_with_streams(&[CodecId::H264, CodecId::Aac]);
        ctx.streams[0].time_base = Rational::new(1, 1000);
        ctx.streams[0].start_time = Some(500);
        ctx.streams[0].duration = Some(20_000);
        ctx.streams[1].time_base = Rational::new(1, 48_000);

        assert!(ctx.has_duration());
        ctx.fill_all_stream_timings();

        assert_eq!(ctx.start_time, Some(500_000));
        assert_eq!(ctx.duration, Some(20_000_000));
        assert_eq!(ctx.streams[1].start_time, Some(24_000));
        assert_eq!(ctx.streams[1].duration, Some(960_000));
    }

    #[test]
    fn text_streams_only_count_when_close() {
        let mut ctx = ctx_with_streams(&[CodecId::H264, CodecId::Text]);
        for st in &mut ctx.streams {
            st.time_base = Rational::new(1, 1000);
        }
        ctx.streams[0].start_time = Some(10_000);
        ctx.streams[0].duration = Some(5_000);
        // subtitle starts 9s earlier: an outlier
        ctx.streams[1].start_time = Some(1_000);
        ctx.streams[1].duration = Some(1_000);
        ctx.update_stream_timings();
        assert_eq!(ctx.start_time, Some(10_000_000));
        assert_eq!(ctx.duration, Some(5_000_000));

        let mut ctx = ctx_with_streams(&[CodecId::Text]);
        ctx.streams[0].time_base = Rational::new(1, 1000);
        ctx.streams[0].start_time = Some(2_000);
        ctx.streams[0].duration = Some(3_000);
        ctx.update_stream_timings();
        assert_eq!(ctx.start_time, Some(2_000_000));
        assert_eq!(ctx.duration, Some(3_000_000));
    }

    #[test]
    fn programs_track_their_streams() {
        let mut ctx = ctx_with_streams(&[CodecId::H264, CodecId::Aac]);
        ctx.new_program(1);
        ctx.add_stream_to_program(1, 0);
        ctx.new_program(2);
        ctx.add_stream_to_program(2, 1);
        ctx.streams[0].start_time = Some(90_000);
        ctx.streams[0].duration = Some(900_000);
        ctx.streams[1].start_time = Some(0);
        ctx.streams[1].duration = Some(180_000);
        ctx.update_stream_timings();

        assert_eq!(ctx.programs[0].start_time, Some(1_000_000));
        assert_eq!(ctx.programs[0].end_time, Some(11_000_000));
        assert_eq!(ctx.programs[1].end_time, Some(2_000_000));
        assert_eq!(ctx.start_time, Some(0));
        assert_eq!(ctx.duration, Some(10_000_000));
    }

    #[test]
    fn tail_scan_finds_last_timestamp() {
        let packets = (0..200)
            .map(|i| ScriptedPacket::new(0, vec![0x55; 188]).pts(i * 3600).dts(i * 3600).duration(3600).key())
            .collect();
        let mut session = open_synth(SynthFormat::new(InputFormatFlags::empty()), &[CodecId::H264], packets, 90_000);
        session.read_frame().expect("first frame");
        let resume = session.ctx.io().expect("io").tell();

        session.estimate_timings_from_pts(resume);

        assert_eq!(session.ctx.streams[0].duration, Some(720_000));
        assert_eq!(session.ctx.duration, Some(8_000_000));
        assert_eq!(session.ctx.io().expect("io").tell(), resume);
        assert_eq!(session.ctx.streams[0].cur_dts(), session.ctx.streams[0].first_dts());
    }

    #[test]
    fn tail_scan_widens_window_until_all_streams_found() {
        // stream 1 stops carrying timestamps after the first 700 kB
        let packets = (0..100i64)
            .map(|i| {
                let stream = (i % 2) as usize;
                let mut p = ScriptedPacket::new(stream, vec![0x33; 10_000]).duration(3600);
                if stream == 0 || i < 70 {
                    p = p.pts(i * 3600).dts(i * 3600).key();
                }
                p
            })
            .collect();
        let mut session =
            open_synth(SynthFormat::new(InputFormatFlags::empty()), &[CodecId::H264, CodecId::Aac], packets, 90_000);
        session.ctx.streams[0].first_dts = Some(0);
        session.ctx.streams[1].first_dts = Some(3600);
        let seeks_before = session.ctx.io().expect("io").seek_count();

        session.estimate_timings_from_pts(0);

        let video = session.ctx.streams[0].duration.expect("video duration");
        let audio = session.ctx.streams[1].duration.expect("audio duration");
        assert_eq!(video, 99 * 3600);
        assert_eq!(audio, 69 * 3600 + 3600 - 3600);
        assert!(session.ctx.io().expect("io").seek_count() >= seeks_before + 3);
    }

    #[test]
    fn skip_option_leaves_durations_unset() {
        let packets = (0..10)
            .map(|i| ScriptedPacket::new(0, vec![1; 64]).pts(i * 3600).dts(i * 3600).duration(3600).key())
            .collect();
        let mut session = open_synth(SynthFormat::new(InputFormatFlags::empty()), &[CodecId::H264], packets, 90_000);
        session.ctx.options.skip_estimate_duration_from_pts = true;
        session.ctx.streams[0].first_dts = Some(0);
        session.estimate_timings_from_pts(0);
        assert_eq!(session.ctx.streams[0].duration, None);
        assert_eq!(session.ctx.duration, None);
    }
}
