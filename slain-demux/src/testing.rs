//! Fixtures shared by the unit tests: byte sources that count what the I/O
//! layer asks of them, and a tiny synthetic container whose packets carry
//! exactly the timestamps a test scripts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use bytes::Bytes;

use crate::codec::CodecId;
use crate::context::FormatContext;
use crate::error::{DemuxError, Result};
use crate::format::{Demuxer, InputFormat, InputFormatFlags, ProbeData};
use crate::io::IoContext;
use crate::options::OpenOptions;
use crate::packet::{Packet, PacketFlags};
use crate::probe::SCORE_MAX;
use crate::protocol::{Protocol, Whence};
use crate::session::Session;

pub(crate) fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `n` bytes where every position is recognisable: `pattern(n)[i]` only
/// depends on `i`.
pub(crate) fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

// ============================================================================
// Counting protocol
// ============================================================================

#[derive(Clone, Default)]
pub(crate) struct IoStats {
    seeks: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
}

impl IoStats {
    /// Position changes requested from the protocol; size queries excluded.
    pub(crate) fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    pub(crate) fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

/// In-memory protocol recording the calls it receives.
pub(crate) struct CountingProtocol {
    data: Vec<u8>,
    pos: usize,
    stats: IoStats,
    pub(crate) streamed: bool,
    /// Fail every read once this many bytes have been delivered.
    pub(crate) fail_after: Option<usize>,
}

impl CountingProtocol {
    pub(crate) fn new(data: Vec<u8>) -> (Self, IoStats) {
        let stats = IoStats::default();
        let proto = Self { data, pos: 0, stats: stats.clone(), streamed: false, fail_after: None };
        (proto, stats)
    }
}

impl Protocol for CountingProtocol {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let mut end = self.data.len();
        if let Some(limit) = self.fail_after {
            if self.pos >= limit {
                return Err(DemuxError::io(
                    self.pos as i64,
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "scripted failure"),
                ));
            }
            end = end.min(limit);
        }
        if self.pos >= end {
            return Err(DemuxError::Eof);
        }
        let n = (end - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        // A pipe knows neither its size nor how to go back.
        if self.streamed {
            return Err(DemuxError::NotSeekable);
        }
        let base = match whence {
            Whence::Size => return Ok(self.data.len() as i64),
            Whence::Start => 0,
            Whence::Current => self.pos as i64,
            Whence::End => self.data.len() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(DemuxError::invalid_data("seek before start"));
        }
        self.stats.seeks.fetch_add(1, Ordering::Relaxed);
        self.pos = target as usize;
        Ok(target)
    }

    fn is_streamed(&self) -> bool {
        self.streamed
    }
}

// ============================================================================
// Synthetic container
// ============================================================================
//
// file   := "SYNT" u8:nb_streams stream* record*
// stream := u8:codec u32:tb_den u16:width u16:height u32:sample_rate u8:channels
// record := "SYNC" u8:stream u8:flags i64:pts i64:dts i64:duration u32:size payload
//
// All integers big-endian. flags: 1 key, 2 pts present, 4 dts present.

const FILE_MAGIC: &[u8; 4] = b"SYNT";
const RECORD_SYNC: u32 = u32::from_be_bytes(*b"SYNC");
const FLAG_KEY: u8 = 1;
const FLAG_PTS: u8 = 2;
const FLAG_DTS: u8 = 4;

const CODEC_TABLE: &[CodecId] = &[
    CodecId::None,
    CodecId::H264,
    CodecId::Hevc,
    CodecId::Mpeg1Video,
    CodecId::Mpeg2Video,
    CodecId::Mpeg4,
    CodecId::Mjpeg,
    CodecId::Png,
    CodecId::RawVideo,
    CodecId::Aac,
    CodecId::Ac3,
    CodecId::Eac3,
    CodecId::Dts,
    CodecId::TrueHd,
    CodecId::Mp1,
    CodecId::Mp2,
    CodecId::Mp3,
    CodecId::PcmS16Le,
    CodecId::PcmU8,
    CodecId::DvbSubtitle,
    CodecId::HdmvPgsSubtitle,
    CodecId::Text,
    CodecId::Smpte2038,
    CodecId::Bin,
];

fn codec_code(id: CodecId) -> u8 {
    CODEC_TABLE.iter().position(|&c| c == id).unwrap_or(0) as u8
}

/// A packet as the synthetic container will store it.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedPacket {
    pub(crate) stream: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) pts: Option<i64>,
    pub(crate) dts: Option<i64>,
    pub(crate) duration: i64,
    pub(crate) key: bool,
}

impl ScriptedPacket {
    pub(crate) fn new(stream: usize, data: Vec<u8>) -> Self {
        Self { stream, data, pts: None, dts: None, duration: 0, key: false }
    }

    pub(crate) fn pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub(crate) fn dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub(crate) fn duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub(crate) fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Moves both timestamps by `delta`.
    pub(crate) fn shift(&mut self, delta: i64) {
        self.pts = self.pts.map(|t| t + delta);
        self.dts = self.dts.map(|t| t + delta);
    }
}

fn default_dimensions(id: CodecId) -> (u16, u16, u32, u8) {
    use crate::codec::MediaType;
    match id.media_type() {
        MediaType::Video => (320, 240, 0, 0),
        MediaType::Audio => (0, 0, 48_000, 2),
        _ => (0, 0, 0, 0),
    }
}

/// Serialises a synthetic file.
pub(crate) fn synth_file(codecs: &[CodecId], packets: &[ScriptedPacket], tb_den: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(FILE_MAGIC);
    out.push(codecs.len() as u8);
    for &codec in codecs {
        let (w, h, rate, ch) = default_dimensions(codec);
        out.push(codec_code(codec));
        out.extend_from_slice(&tb_den.to_be_bytes());
        out.extend_from_slice(&w.to_be_bytes());
        out.extend_from_slice(&h.to_be_bytes());
        out.extend_from_slice(&rate.to_be_bytes());
        out.push(ch);
    }
    for p in packets {
        let mut flags = 0;
        if p.key {
            flags |= FLAG_KEY;
        }
        if p.pts.is_some() {
            flags |= FLAG_PTS;
        }
        if p.dts.is_some() {
            flags |= FLAG_DTS;
        }
        out.extend_from_slice(&RECORD_SYNC.to_be_bytes());
        out.push(p.stream as u8);
        out.push(flags);
        out.extend_from_slice(&p.pts.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&p.dts.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&p.duration.to_be_bytes());
        out.extend_from_slice(&(p.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&p.data);
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SynthFormat {
    flags: InputFormatFlags,
    read_timestamp: bool,
}

impl SynthFormat {
    pub(crate) fn new(flags: InputFormatFlags) -> Self {
        Self { flags, read_timestamp: false }
    }

    /// Lets the binary-search seek locate key packets by scanning records.
    pub(crate) fn with_read_timestamp(mut self) -> Self {
        self.read_timestamp = true;
        self
    }
}

impl InputFormat for SynthFormat {
    fn name(&self) -> &'static str {
        "synth"
    }

    fn long_name(&self) -> &'static str {
        "Synthetic test container"
    }

    fn extensions(&self) -> &'static str {
        "synth"
    }

    fn flags(&self) -> InputFormatFlags {
        self.flags
    }

    fn probe(&self, pd: &ProbeData<'_>) -> Option<i32> {
        Some(if pd.buf.starts_with(FILE_MAGIC) { SCORE_MAX } else { 0 })
    }

    fn create(&self) -> Box<dyn Demuxer> {
        Box::new(SynthDemuxer { read_timestamp: self.read_timestamp })
    }
}

struct Record {
    pos: i64,
    stream: usize,
    flags: u8,
    pts: i64,
    dts: i64,
    duration: i64,
    size: u32,
}

pub(crate) struct SynthDemuxer {
    read_timestamp: bool,
}

impl SynthDemuxer {
    /// Finds the next record header at or after the current position.
    fn next_record(io: &mut IoContext) -> Result<Record> {
        let mut window = io.rb32()?;
        while window != RECORD_SYNC {
            window = (window << 8) | io.r8()? as u32;
        }
        let pos = io.tell() - 4;
        Ok(Record {
            pos,
            stream: io.r8()? as usize,
            flags: io.r8()?,
            pts: io.rb64()? as i64,
            dts: io.rb64()? as i64,
            duration: io.rb64()? as i64,
            size: io.rb32()?,
        })
    }
}

impl Demuxer for SynthDemuxer {
    fn read_header(&mut self, ctx: &mut FormatContext) -> Result<()> {
        let io = ctx.io()?;
        let mut magic = [0u8; 4];
        io.read_exact(&mut magic)?;
        if &magic != FILE_MAGIC {
            return Err(DemuxError::invalid_data("not a synthetic file"));
        }
        let nb_streams = io.r8()?;
        let mut headers = Vec::new();
        for _ in 0..nb_streams {
            let io = ctx.io()?;
            let codec = CODEC_TABLE.get(io.r8()? as usize).copied().unwrap_or(CodecId::None);
            let tb_den = io.rb32()?;
            let width = io.rb16()?;
            let height = io.rb16()?;
            let sample_rate = io.rb32()?;
            let channels = io.r8()?;
            headers.push((codec, tb_den, width, height, sample_rate, channels));
        }
        for (codec, tb_den, width, height, sample_rate, channels) in headers {
            let st = ctx.new_stream()?;
            st.codecpar.set_codec(codec);
            st.codecpar.width = width as u32;
            st.codecpar.height = height as u32;
            st.codecpar.sample_rate = sample_rate;
            st.codecpar.channels = channels as u32;
            let index = st.index;
            ctx.set_pts_info(index, 64, 1, tb_den);
        }
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet> {
        let io = ctx.io()?;
        let rec = Self::next_record(io)?;
        let data = io.read_bytes(rec.size as usize)?;
        let mut pkt = Packet::new(rec.stream, data);
        pkt.pos = Some(rec.pos);
        pkt.duration = rec.duration;
        if rec.flags & FLAG_PTS != 0 {
            pkt.pts = Some(rec.pts);
        }
        if rec.flags & FLAG_DTS != 0 {
            pkt.dts = Some(rec.dts);
        }
        if rec.flags & FLAG_KEY != 0 {
            pkt.flags |= PacketFlags::KEY;
        }
        Ok(pkt)
    }

    fn has_read_timestamp(&self) -> bool {
        self.read_timestamp
    }

    fn read_timestamp(&mut self, ctx: &mut FormatContext, stream: usize, pos: &mut i64, pos_limit: i64) -> Option<i64> {
        let io = ctx.io().ok()?;
        io.seek(*pos, Whence::Start).ok()?;
        loop {
            let rec = Self::next_record(io).ok()?;
            if rec.pos > pos_limit {
                return None;
            }
            let keyed = rec.flags & FLAG_KEY != 0;
            let stamp = if rec.flags & FLAG_DTS != 0 {
                Some(rec.dts)
            } else if rec.flags & FLAG_PTS != 0 {
                Some(rec.pts)
            } else {
                None
            };
            if rec.stream == stream && keyed {
                if let Some(ts) = stamp {
                    *pos = rec.pos;
                    return Some(ts);
                }
            }
            io.skip(rec.size as i64).ok()?;
        }
    }
}

/// Opens a synthetic file holding `packets` with the given stream codecs.
/// Every stream gets the time base `1/tb_den`; stream analysis is not run.
pub(crate) fn open_synth(
    format: SynthFormat,
    codecs: &[CodecId],
    packets: Vec<ScriptedPacket>,
    tb_den: i32,
) -> Session {
    init_test_logging();
    let bytes = synth_file(codecs, &packets, tb_den as u32);
    let io = IoContext::from_bytes(Bytes::from(bytes));
    Session::open_with_format(Some(io), "test.synth", Arc::new(format), SCORE_MAX, OpenOptions::default())
        .expect("synthetic file opens")
}

/// Like [`open_synth`] with a 1/90000 time base, then lets the test adjust
/// the context before the first read.
pub(crate) fn session_with_packets<F>(codecs: &[CodecId], packets: Vec<ScriptedPacket>, configure: F) -> Session
where
    F: FnOnce(&mut FormatContext),
{
    let mut session = open_synth(SynthFormat::new(InputFormatFlags::empty()), codecs, packets, 90_000);
    configure(&mut session.ctx);
    session
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synth_records_round_trip_through_demuxer() {
        let packets = vec![
            ScriptedPacket::new(0, vec![9; 12]).pts(5).dts(4).duration(1).key(),
            ScriptedPacket::new(1, vec![7; 3]),
        ];
        let mut session = open_synth(
            SynthFormat::new(InputFormatFlags::empty()),
            &[CodecId::H264, CodecId::Aac],
            packets,
            1000,
        );
        assert_eq!(session.streams().len(), 2);
        assert_eq!(session.streams()[1].codecpar.sample_rate, 48_000);

        let first = session.demuxer.read_packet(&mut session.ctx).expect("first");
        assert_eq!((first.pts, first.dts, first.is_key()), (Some(5), Some(4), true));
        assert_eq!(first.pos, Some(session.ctx.data_offset));
        let second = session.demuxer.read_packet(&mut session.ctx).expect("second");
        assert_eq!((second.stream_index, second.pts, second.size()), (1, None, 3));
        assert!(session.demuxer.read_packet(&mut session.ctx).unwrap_err().is_eof());
    }

    #[test]
    fn pattern_is_position_dependent() {
        let long = pattern(1000);
        assert_eq!(&pattern(10)[..], &long[..10]);
        assert_ne!(long[1], long[2]);
    }
}
