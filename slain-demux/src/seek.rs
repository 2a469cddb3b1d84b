//! Seeking.
//!
//! Strategies, tried in order for a timestamp seek:
//! 1. the demuxer's own `read_seek`;
//! 2. bisection over byte positions using `read_timestamp`, seeded from the
//!    seek index when there is one;
//! 3. the generic index, reading forward to extend it when the target lies
//!    past its last entry.
//!
//! A byte seek just repositions the input inside the data area. Every
//! successful seek drops buffered packets and re-anchors `cur_dts`.

use bitflags::bitflags;
use tracing::{debug, error, trace};

use crate::context::FormatContext;
use crate::error::{DemuxError, Result};
use crate::format::InputFormatFlags;
use crate::protocol::Whence;
use crate::rational::{rescale, TIME_BASE};
use crate::session::Session;
use crate::timestamps::wrap_timestamp;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SeekFlags: u32 {
        /// Land at or before the target.
        const BACKWARD = 0x1;
        /// The target is a byte offset.
        const BYTE = 0x2;
        /// Accept non-keyframes.
        const ANY = 0x4;
        /// The target is a frame number.
        const FRAME = 0x8;
    }
}

/// Non-key packets tolerated past the target while extending the index.
const MAX_NONKEY_AFTER_TARGET: u32 = 1000;

fn no_seek_target() -> DemuxError {
    DemuxError::unsupported("seek target not reachable")
}

impl FormatContext {
    /// Re-anchors every stream's expected dts at `timestamp`, given in the
    /// time base of stream `reference`.
    pub(crate) fn update_cur_dts(&mut self, reference: usize, timestamp: i64) {
        let ref_tb = self.streams[reference].time_base;
        for st in &mut self.streams {
            st.cur_dts = Some(rescale(
                timestamp,
                st.time_base.den as i64 * ref_tb.num as i64,
                st.time_base.num as i64 * ref_tb.den as i64,
            ));
        }
    }

    fn seek_io(&mut self, pos: i64) -> Result<()> {
        self.io()?.seek(pos, Whence::Start)?;
        Ok(())
    }
}

impl Session {
    /// Seeks so the next packet of `stream` is at (or, with `BACKWARD`,
    /// before) `timestamp`.
    ///
    /// `stream = None` picks the default stream and takes `timestamp` in
    /// microseconds; otherwise it is in the stream's time base. With
    /// [`SeekFlags::BYTE`] the timestamp is a byte offset.
    pub fn seek_frame(&mut self, stream: Option<usize>, timestamp: i64, flags: SeekFlags) -> Result<()> {
        if let Some(idx) = stream {
            self.ctx.stream(idx)?;
        }
        self.seek_frame_internal(stream, timestamp, flags)?;
        self.ctx.queue_attached_pictures();
        Ok(())
    }

    /// Seeks to a point in `[min_ts, max_ts]` as close as possible to `ts`.
    pub fn seek_file(
        &mut self,
        stream: Option<usize>,
        min_ts: i64,
        ts: i64,
        max_ts: i64,
        flags: SeekFlags,
    ) -> Result<()> {
        if min_ts > ts || max_ts < ts {
            return Err(DemuxError::OutOfRange);
        }
        if let Some(idx) = stream {
            self.ctx.stream(idx)?;
        }
        let mut flags = flags - SeekFlags::BACKWARD;
        if self.ctx.options.seek2any {
            flags |= SeekFlags::ANY;
        }

        // Lean toward whichever bound is farther away.
        let dir = if (ts as u64).wrapping_sub(min_ts as u64) > (max_ts as u64).wrapping_sub(ts as u64) {
            SeekFlags::BACKWARD
        } else {
            SeekFlags::empty()
        };
        let result = self.seek_frame(stream, ts, flags | dir);
        if result.is_err() && ts != min_ts && ts != max_ts {
            let bound = if dir.is_empty() { min_ts } else { max_ts };
            self.seek_frame(stream, bound, flags | dir)?;
            return self.seek_frame(stream, ts, flags | (dir ^ SeekFlags::BACKWARD));
        }
        result
    }

    fn seek_frame_internal(&mut self, stream: Option<usize>, timestamp: i64, flags: SeekFlags) -> Result<()> {
        if flags.contains(SeekFlags::BYTE) {
            if self.ctx.format_flags.contains(InputFormatFlags::NO_BYTE_SEEK) {
                return Err(DemuxError::unsupported("format does not support byte seeking"));
            }
            self.ctx.read_frame_flush();
            return self.seek_frame_byte(timestamp);
        }

        let (idx, timestamp) = match stream {
            Some(idx) => (idx, timestamp),
            None => {
                let idx = self.ctx.default_stream_index().ok_or(DemuxError::StreamNotFound(0))?;
                let tb = self.ctx.streams[idx].time_base;
                (idx, rescale(timestamp, tb.den as i64, TIME_BASE * tb.num as i64))
            }
        };
        debug!(stream = idx, timestamp, ?flags, "seek");

        self.ctx.read_frame_flush();
        if let Some(Ok(())) = self.demuxer.read_seek(&mut self.ctx, idx, timestamp, flags) {
            return Ok(());
        }

        let format_flags = self.ctx.format_flags;
        if self.demuxer.has_read_timestamp() && !format_flags.contains(InputFormatFlags::NOBINSEARCH) {
            self.ctx.read_frame_flush();
            self.seek_frame_binary(idx, timestamp, flags)
        } else if !format_flags.contains(InputFormatFlags::NOGENSEARCH) {
            self.ctx.read_frame_flush();
            self.seek_frame_generic(idx, timestamp, flags)
        } else {
            Err(DemuxError::unsupported("format has no seek method"))
        }
    }

    fn seek_frame_byte(&mut self, pos: i64) -> Result<()> {
        let pos_min = self.ctx.data_offset;
        let pos_max = self.ctx.io()?.size()? - 1;
        let pos = pos.min(pos_max).max(pos_min);
        self.ctx.seek_io(pos)
    }

    /// Wrapped timestamp of the first packet of `stream` at or after `*pos`.
    fn read_timestamp(&mut self, stream: usize, pos: &mut i64, pos_limit: i64) -> Option<i64> {
        let ts = self.demuxer.read_timestamp(&mut self.ctx, stream, pos, pos_limit);
        wrap_timestamp(&self.ctx.streams[stream], ts)
    }

    fn seek_frame_binary(&mut self, idx: usize, target_ts: i64, flags: SeekFlags) -> Result<()> {
        trace!(stream = idx, target_ts, "read_seek");
        let mut pos_min = 0;
        let mut pos_max = 0;
        let mut pos_limit = -1;
        let mut ts_min = None;
        let mut ts_max = None;

        let index = &self.ctx.streams[idx].index_entries;
        if !index.is_empty() {
            let i = index.search(target_ts, flags | SeekFlags::BACKWARD).unwrap_or(0);
            if let Some(e) = index.get(i) {
                if e.timestamp <= target_ts || e.pos == e.min_distance as i64 {
                    pos_min = e.pos;
                    ts_min = Some(e.timestamp);
                    trace!(pos_min, ts_min = e.timestamp, "using cached lower bound");
                }
            }
            if let Some(e) = index.search(target_ts, flags - SeekFlags::BACKWARD).and_then(|i| index.get(i)) {
                pos_max = e.pos;
                ts_max = Some(e.timestamp);
                pos_limit = pos_max - e.min_distance as i64;
                trace!(pos_max, pos_limit, ts_max = e.timestamp, "using cached upper bound");
            }
        }

        let (pos, ts) = self.gen_search(idx, target_ts, pos_min, pos_max, pos_limit, ts_min, ts_max, flags)?;
        self.ctx.seek_io(pos)?;
        self.ctx.read_frame_flush();
        self.ctx.update_cur_dts(idx, ts);
        Ok(())
    }

    /// Position and timestamp of the last packet of `stream` in the file.
    fn find_last_ts(&mut self, idx: usize) -> Result<(i64, i64)> {
        let filesize = self.ctx.io()?.size()?;
        let mut pos_max = filesize - 1;
        let mut step = 1024;
        let mut ts_max;
        loop {
            let limit = pos_max;
            pos_max = (pos_max - step).max(0);
            ts_max = self.read_timestamp(idx, &mut pos_max, limit);
            step += step;
            if ts_max.is_some() || 2 * limit <= step {
                break;
            }
        }
        let Some(mut ts_max) = ts_max else {
            return Err(no_seek_target());
        };

        loop {
            let mut tmp_pos = pos_max + 1;
            let Some(tmp_ts) = self.read_timestamp(idx, &mut tmp_pos, i64::MAX) else {
                break;
            };
            if tmp_pos <= pos_max {
                break;
            }
            ts_max = tmp_ts;
            pos_max = tmp_pos;
            if tmp_pos >= filesize {
                break;
            }
        }
        Ok((pos_max, ts_max))
    }

    /// Interpolating bisection for the byte position of `target_ts`.
    #[allow(clippy::too_many_arguments)]
    fn gen_search(
        &mut self,
        idx: usize,
        target_ts: i64,
        mut pos_min: i64,
        mut pos_max: i64,
        mut pos_limit: i64,
        ts_min: Option<i64>,
        ts_max: Option<i64>,
        flags: SeekFlags,
    ) -> Result<(i64, i64)> {
        trace!(stream = idx, target_ts, "gen_seek");
        let mut ts_min = match ts_min {
            Some(ts) => ts,
            None => {
                pos_min = self.ctx.data_offset;
                self.read_timestamp(idx, &mut pos_min, i64::MAX).ok_or_else(no_seek_target)?
            }
        };
        if ts_min >= target_ts {
            return Ok((pos_min, ts_min));
        }

        let mut ts_max = match ts_max {
            Some(ts) => ts,
            None => {
                let (pos, ts) = self.find_last_ts(idx)?;
                pos_max = pos;
                pos_limit = pos_max;
                ts
            }
        };
        if ts_max <= target_ts {
            return Ok((pos_max, ts_max));
        }
        if ts_min >= ts_max {
            return Err(no_seek_target());
        }

        let mut no_change = 0;
        while pos_min < pos_limit {
            let mut pos = match no_change {
                0 => {
                    let keyframe_distance = pos_max - pos_limit;
                    rescale(target_ts - ts_min, pos_max - pos_min, ts_max - ts_min) + pos_min - keyframe_distance
                }
                1 => (pos_min + pos_limit) >> 1,
                _ => pos_min,
            };
            if pos <= pos_min {
                pos = pos_min + 1;
            } else if pos > pos_limit {
                pos = pos_limit;
            }
            let start_pos = pos;

            let ts = self.read_timestamp(idx, &mut pos, i64::MAX);
            if pos == pos_max {
                no_change += 1;
            } else {
                no_change = 0;
            }
            let Some(ts) = ts else {
                error!(stream = idx, pos = start_pos, "read_timestamp() failed in the middle");
                return Err(no_seek_target());
            };
            trace!(pos_min, pos_max, pos_limit, pos, ts, "bisect");
            if target_ts <= ts {
                pos_limit = start_pos - 1;
                pos_max = pos;
                ts_max = ts;
            }
            if target_ts >= ts {
                pos_min = pos;
                ts_min = ts;
            }
        }

        Ok(if flags.contains(SeekFlags::BACKWARD) { (pos_min, ts_min) } else { (pos_max, ts_max) })
    }

    fn seek_frame_generic(&mut self, idx: usize, timestamp: i64, flags: SeekFlags) -> Result<()> {
        let index = &self.ctx.streams[idx].index_entries;
        let mut found = index.search(timestamp, flags);
        if found.is_none() && index.get(0).is_some_and(|first| timestamp < first.timestamp) {
            return Err(no_seek_target());
        }

        if found.is_none() || found == Some(index.len() - 1) {
            // Read forward from the end of the index until a keyframe past
            // the target shows up.
            match index.last().map(|e| (e.pos, e.timestamp)) {
                Some((pos, ts)) => {
                    self.ctx.seek_io(pos)?;
                    self.ctx.update_cur_dts(idx, ts);
                }
                None => {
                    let data_offset = self.ctx.data_offset;
                    self.ctx.seek_io(data_offset)?;
                }
            }
            let mut nonkey = 0;
            loop {
                let pkt = match self.read_frame() {
                    Ok(pkt) => pkt,
                    Err(e) if e.is_transient() => continue,
                    Err(_) => break,
                };
                if pkt.stream_index == idx && pkt.dts.is_some_and(|dts| dts > timestamp) {
                    if pkt.is_key() {
                        break;
                    }
                    nonkey += 1;
                    if nonkey > MAX_NONKEY_AFTER_TARGET {
                        error!(
                            stream = idx,
                            nonkey, "seek_frame_generic failed as this stream seems to contain no keyframes after the target timestamp"
                        );
                        break;
                    }
                }
            }
            found = self.ctx.streams[idx].index_entries.search(timestamp, flags);
        }
        let Some(found) = found else {
            return Err(no_seek_target());
        };

        self.ctx.read_frame_flush();
        if let Some(Ok(())) = self.demuxer.read_seek(&mut self.ctx, idx, timestamp, flags) {
            return Ok(());
        }
        let (pos, ts) = match self.ctx.streams[idx].index_entries.get(found) {
            Some(e) => (e.pos, e.timestamp),
            None => return Err(no_seek_target()),
        };
        self.ctx.seek_io(pos)?;
        self.ctx.update_cur_dts(idx, ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::format::InputFormatFlags;
    use crate::testing::{open_synth, ScriptedPacket, SynthFormat};

    /// One key packet per 10 frames, 40 ms apart in a 1/1000 time base.
    fn video_packets(n: i64) -> Vec<ScriptedPacket> {
        (0..n)
            .map(|i| {
                let p = ScriptedPacket::new(0, vec![i as u8; 500]).pts(i * 40).dts(i * 40).duration(40);
                if i % 10 == 0 {
                    p.key()
                } else {
                    p
                }
            })
            .collect()
    }

    fn first_key_after_seek(session: &mut Session) -> (i64, bool) {
        let pkt = session.read_frame().expect("packet after seek");
        (pkt.dts.expect("dts"), pkt.is_key())
    }

    #[test]
    fn byte_seek_is_clamped_to_data_area() {
        let format = SynthFormat::new(InputFormatFlags::empty());
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(20), 1000);
        let data_offset = session.ctx.data_offset;
        session.seek_frame(None, -500, SeekFlags::BYTE).expect("seek");
        assert_eq!(session.ctx.io().expect("io").tell(), data_offset);

        let size = session.ctx.io().expect("io").size().expect("size");
        session.seek_frame(None, size + 100, SeekFlags::BYTE).expect("seek");
        assert_eq!(session.ctx.io().expect("io").tell(), size - 1);
    }

    #[test]
    fn binary_search_lands_on_keyframe_before_target() {
        let format = SynthFormat::new(InputFormatFlags::empty()).with_read_timestamp();
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(100), 1000);
        session.seek_frame(Some(0), 2210, SeekFlags::BACKWARD).expect("seek");
        let (dts, key) = first_key_after_seek(&mut session);
        assert!(key);
        assert_eq!(dts, 2000);
        assert_eq!(session.streams()[0].cur_dts().map(|d| d > 2000), Some(true));
    }

    #[test]
    fn binary_search_forward_and_edges() {
        let format = SynthFormat::new(InputFormatFlags::empty()).with_read_timestamp();
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(100), 1000);
        session.seek_frame(Some(0), 2210, SeekFlags::empty()).expect("seek");
        assert_eq!(first_key_after_seek(&mut session), (2400, true));

        session.seek_frame(Some(0), -100, SeekFlags::empty()).expect("before start");
        assert_eq!(first_key_after_seek(&mut session), (0, true));

        session.seek_frame(Some(0), 1_000_000, SeekFlags::BACKWARD).expect("past end");
        assert_eq!(first_key_after_seek(&mut session).0, 3600);
    }

    #[test]
    fn generic_seek_extends_index_by_reading() {
        let format = SynthFormat::new(InputFormatFlags::GENERIC_INDEX);
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(100), 1000);
        assert!(session.streams()[0].index_entries().is_empty());

        session.seek_frame(Some(0), 2210, SeekFlags::BACKWARD).expect("seek");
        let entries = session.streams()[0].index_entries();
        assert!(entries.len() >= 3);
        assert!(entries.entries().windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(first_key_after_seek(&mut session), (2000, true));

        // Second seek is served from the index.
        session.seek_frame(Some(0), 450, SeekFlags::BACKWARD).expect("seek back");
        assert_eq!(first_key_after_seek(&mut session), (400, true));
    }

    #[test]
    fn generic_seek_before_first_entry_fails() {
        let format = SynthFormat::new(InputFormatFlags::GENERIC_INDEX);
        let mut packets = video_packets(30);
        for p in &mut packets {
            p.shift(1000);
        }
        let mut session = open_synth(format, &[CodecId::Mpeg4], packets, 1000);
        session.seek_frame(Some(0), 1500, SeekFlags::BACKWARD).expect("build index");
        assert!(session.seek_frame(Some(0), 10, SeekFlags::BACKWARD).is_err());
    }

    #[test]
    fn seek_file_rejects_inverted_range() {
        let format = SynthFormat::new(InputFormatFlags::GENERIC_INDEX);
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(10), 1000);
        assert!(matches!(
            session.seek_file(Some(0), 100, 50, 200, SeekFlags::empty()),
            Err(DemuxError::OutOfRange)
        ));
        assert!(session.seek_file(Some(7), 0, 0, 0, SeekFlags::empty()).is_err());
    }

    #[test]
    fn seek_file_picks_keyframe_in_range() {
        let format = SynthFormat::new(InputFormatFlags::empty()).with_read_timestamp();
        let mut session = open_synth(format, &[CodecId::Mpeg4], video_packets(100), 1000);
        session.seek_file(Some(0), 0, 2210, 2300, SeekFlags::empty()).expect("seek");
        assert_eq!(first_key_after_seek(&mut session), (2000, true));
    }

    #[test]
    fn update_cur_dts_rescales_between_streams() {
        let format = SynthFormat::new(InputFormatFlags::empty());
        let mut session = open_synth(format, &[CodecId::Mpeg4, CodecId::Mp2], Vec::new(), 1000);
        session.ctx.streams[1].time_base = crate::rational::Rational::new(1, 90_000);
        session.ctx.update_cur_dts(0, 2000);
        assert_eq!(session.streams()[0].cur_dts(), Some(2000));
        assert_eq!(session.streams()[1].cur_dts(), Some(180_000));
    }
}
