// AVI DEMUXER - RIFF/AVI Parser
//
// AVI is Microsoft's container from 1992.
// Still common for legacy content and screen recordings.
//
// RIFF 'AVI '
// ├── LIST 'hdrl'
// │   ├── avih (main header)
// │   └── LIST 'strl' (per stream)
// │       ├── strh (stream header)
// │       ├── strf (stream format)
// │       └── strn (stream name)
// ├── LIST 'INFO' (optional tags)
// ├── LIST 'movi'
// │   ├── 00dc (video data)
// │   └── 01wb (audio data)
// └── idx1 (index)

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::codec::{CodecId, MediaType};
use crate::context::FormatContext;
use crate::error::{DemuxError, Result};
use crate::format::{Demuxer, InputFormat, InputFormatFlags, ProbeData};
use crate::index::IndexFlags;
use crate::io::{IoContext, Seekability};
use crate::options::TagPolicy;
use crate::packet::{Packet, PacketFlags};
use crate::probe::SCORE_MAX;
use crate::protocol::Whence;
use crate::seek::SeekFlags;
use crate::stream::{Discard, NeedParsing};

// ============================================================================
// RIFF/AVI Constants
// ============================================================================

const RIFF: u32 = 0x46464952; // "RIFF" little-endian
const AVI_: u32 = 0x20495641; // "AVI " little-endian
const AVIX: u32 = 0x58495641; // "AVIX" - OpenDML extension
const LIST: u32 = 0x5453494C; // "LIST" little-endian
const HDRL: u32 = 0x6C726468; // "hdrl" - header list
const AVIH: u32 = 0x68697661; // "avih" - main AVI header
const STRL: u32 = 0x6C727473; // "strl" - stream list
const STRH: u32 = 0x68727473; // "strh" - stream header
const STRF: u32 = 0x66727473; // "strf" - stream format
const STRN: u32 = 0x6E727473; // "strn" - stream name
const INFO: u32 = 0x4F464E49; // "INFO" - tag list
const MOVI: u32 = 0x69766F6D; // "movi" - movie data
const IDX1: u32 = 0x31786469; // "idx1" - index

// Stream types
const VIDS: u32 = 0x73646976; // "vids" - video stream
const AUDS: u32 = 0x73647561; // "auds" - audio stream

// Video codecs (FourCC)
const XVID: u32 = 0x44495658;
const DIVX: u32 = 0x58564944;
const DX50: u32 = 0x30355844;
const FMP4: u32 = 0x34504D46;
const H264: u32 = 0x34363248;
const AVC1: u32 = 0x31435641;
const X264: u32 = 0x34363278;
const HEVC: u32 = 0x43564548;
const MJPG: u32 = 0x47504A4D;
const MPG2: u32 = 0x3247504D;
const I420: u32 = 0x30323449; // Raw YUV
const YV12: u32 = 0x32315659;

// WAVEFORMATEX tags
const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_MPEG: u16 = 0x0050;
const WAVE_FORMAT_MPEGLAYER3: u16 = 0x0055;
const WAVE_FORMAT_AAC: u16 = 0x00FF;
const WAVE_FORMAT_DOLBY_AC3: u16 = 0x2000;
const WAVE_FORMAT_DTS: u16 = 0x2001;

/// idx1 flag of chunks that start a keyframe.
const AVIIF_KEYFRAME: u32 = 0x10;

// ============================================================================
// Headers
// ============================================================================

#[derive(Debug, Clone, Default)]
struct MainHeader {
    microsec_per_frame: u32,
    total_frames: u32,
    streams: u32,
    width: u32,
    height: u32,
}

/// strh, 56 bytes.
#[derive(Debug, Clone, Default)]
struct StreamHeader {
    fcc_type: u32,
    fcc_handler: u32,
    scale: u32,
    rate: u32,
    start: u32,
    length: u32,
    sample_size: u32,
}

const STRH_SIZE: u32 = 56;

// ============================================================================
// Per-stream state
// ============================================================================

#[derive(Debug, Clone, Default)]
struct AviStream {
    /// Bytes per sample for constant-rate audio, 0 when every chunk is one frame.
    sample_size: u32,
    /// Timestamp of the next chunk, in the stream time base.
    next_ts: i64,
    start: i64,
    /// Timestamp after the last indexed chunk.
    index_end: i64,
}

impl AviStream {
    fn chunk_duration(&self, size: usize) -> i64 {
        if self.sample_size > 0 {
            (size as i64 / self.sample_size as i64).max(1)
        } else {
            1
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fourcc_to_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b == b' ')
        .map(|&b| b as char)
        .collect()
}

fn fourcc_upper(fourcc: u32) -> u32 {
    u32::from_le_bytes(fourcc.to_le_bytes().map(|b| b.to_ascii_uppercase()))
}

fn identify_video_codec(fourcc: u32) -> CodecId {
    match fourcc_upper(fourcc) {
        H264 | AVC1 | X264 => CodecId::H264,
        HEVC => CodecId::Hevc,
        XVID | DIVX | DX50 | FMP4 => CodecId::Mpeg4,
        MJPG => CodecId::Mjpeg,
        MPG2 => CodecId::Mpeg2Video,
        I420 | YV12 => CodecId::RawVideo,
        _ => {
            let s = fourcc_to_string(fourcc).to_uppercase();
            if s.contains("264") || s.contains("AVC") {
                CodecId::H264
            } else if s.contains("XVID") || s.contains("DIVX") || s.contains("MP4") {
                CodecId::Mpeg4
            } else {
                CodecId::None
            }
        }
    }
}

fn identify_audio_codec(format_tag: u16, bits_per_sample: u16) -> CodecId {
    match format_tag {
        WAVE_FORMAT_PCM if bits_per_sample == 8 => CodecId::PcmU8,
        WAVE_FORMAT_PCM => CodecId::PcmS16Le,
        WAVE_FORMAT_MPEG => CodecId::Mp2,
        WAVE_FORMAT_MPEGLAYER3 => CodecId::Mp3,
        WAVE_FORMAT_AAC | 0x1610 | 0x706D => CodecId::Aac,
        WAVE_FORMAT_DOLBY_AC3 => CodecId::Ac3,
        WAVE_FORMAT_DTS => CodecId::Dts,
        _ => CodecId::None,
    }
}

/// Stream number of a movi chunk such as `01wb`.
fn chunk_stream(tag: u32) -> Option<usize> {
    let [b0, b1, ..] = tag.to_le_bytes();
    if b0.is_ascii_digit() && b1.is_ascii_digit() {
        Some(((b0 - b'0') * 10 + (b1 - b'0')) as usize)
    } else {
        None
    }
}

fn info_key(tag: u32) -> Option<&'static str> {
    Some(match &tag.to_le_bytes() {
        b"INAM" => "title",
        b"IART" => "artist",
        b"ICMT" => "comment",
        b"ICOP" => "copyright",
        b"ICRD" => "date",
        b"IGNR" => "genre",
        b"ISFT" => "encoder",
        b"ILNG" => "language",
        _ => return None,
    })
}

fn read_string(io: &mut IoContext, size: u32) -> Result<String> {
    let data = io.read_bytes(size as usize)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).trim().to_string())
}

/// Reports a chunk that does not fit the structure around it.
fn malformed(policy: TagPolicy, what: &str, pos: i64) -> Result<()> {
    match policy {
        TagPolicy::Strict => Err(DemuxError::invalid_data(format!("{what} at offset {pos}"))),
        TagPolicy::Lenient => {
            warn!(pos, "{what}, skipping");
            Ok(())
        }
    }
}

// ============================================================================
// Format
// ============================================================================

pub struct AviFormat;

impl InputFormat for AviFormat {
    fn name(&self) -> &'static str {
        "avi"
    }

    fn long_name(&self) -> &'static str {
        "AVI (Audio Video Interleaved)"
    }

    fn extensions(&self) -> &'static str {
        "avi"
    }

    fn mime_types(&self) -> &'static str {
        "video/avi,video/x-msvideo"
    }

    /// Chunk timestamps come from counting chunks since the start of movi,
    /// so only the idx1 seek can land at a known timestamp.
    fn flags(&self) -> InputFormatFlags {
        InputFormatFlags::NOGENSEARCH | InputFormatFlags::NO_BYTE_SEEK
    }

    fn probe(&self, pd: &ProbeData<'_>) -> Option<i32> {
        let buf = pd.buf;
        if buf.len() < 12 {
            return Some(0);
        }
        let riff = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let form = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Some(if riff == RIFF && (form == AVI_ || form == AVIX) { SCORE_MAX } else { 0 })
    }

    fn create(&self) -> Box<dyn Demuxer> {
        Box::new(AviDemuxer::default())
    }
}

// ============================================================================
// AVI Demuxer
// ============================================================================

#[derive(Default)]
pub struct AviDemuxer {
    header: MainHeader,
    streams: Vec<AviStream>,
    /// Offset of the `movi` list type; idx1 offsets are relative to it.
    movi_list: i64,
    movi_end: i64,
    has_index: bool,
    /// Chunk offsets that idx1 flags as keyframes.
    keyframes: HashSet<i64>,
}

impl AviDemuxer {
    fn parse_hdrl(&mut self, ctx: &mut FormatContext, end: i64) -> Result<()> {
        let policy = ctx.options.tag_policy;

        while ctx.io()?.tell() + 8 <= end {
            let io = ctx.io()?;
            let pos = io.tell();
            let fourcc = io.rl32()?;
            let chunk_size = io.rl32()?;
            let chunk_end = io.tell() + chunk_size as i64;
            if chunk_end > end {
                malformed(policy, "hdrl chunk overruns its list", pos)?;
                break;
            }

            match fourcc {
                AVIH => self.parse_avih(ctx.io()?)?,
                LIST => {
                    let list_type = ctx.io()?.rl32()?;
                    if list_type == STRL {
                        self.parse_strl(ctx, chunk_end)?;
                    }
                }
                _ => {}
            }

            ctx.io()?.seek(chunk_end + (chunk_size & 1) as i64, Whence::Start)?;
        }

        ctx.io()?.seek(end, Whence::Start)?;
        Ok(())
    }

    fn parse_avih(&mut self, io: &mut IoContext) -> Result<()> {
        let microsec_per_frame = io.rl32()?;
        let _max_bytes_per_sec = io.rl32()?;
        let _padding_granularity = io.rl32()?;
        let _flags = io.rl32()?;
        let total_frames = io.rl32()?;
        let _initial_frames = io.rl32()?;
        let streams = io.rl32()?;
        let _suggested_buffer_size = io.rl32()?;
        let width = io.rl32()?;
        let height = io.rl32()?;

        self.header = MainHeader { microsec_per_frame, total_frames, streams, width, height };
        debug!(?self.header, "avih");
        Ok(())
    }

    fn read_strh(io: &mut IoContext) -> Result<StreamHeader> {
        let fcc_type = io.rl32()?;
        let fcc_handler = io.rl32()?;
        let _flags = io.rl32()?;
        let _priority = io.rl16()?;
        let _language = io.rl16()?;
        let _initial_frames = io.rl32()?;
        let scale = io.rl32()?;
        let rate = io.rl32()?;
        let start = io.rl32()?;
        let length = io.rl32()?;
        let _suggested_buffer_size = io.rl32()?;
        let _quality = io.rl32()?;
        let sample_size = io.rl32()?;
        Ok(StreamHeader { fcc_type, fcc_handler, scale, rate, start, length, sample_size })
    }

    fn parse_strl(&mut self, ctx: &mut FormatContext, end: i64) -> Result<()> {
        let policy = ctx.options.tag_policy;
        let mut index = None;

        while ctx.io()?.tell() + 8 <= end {
            let io = ctx.io()?;
            let pos = io.tell();
            let fourcc = io.rl32()?;
            let chunk_size = io.rl32()?;
            let chunk_end = io.tell() + chunk_size as i64;
            if chunk_end > end {
                malformed(policy, "strl chunk overruns its list", pos)?;
                break;
            }

            match (fourcc, index) {
                (STRH, None) if chunk_size >= STRH_SIZE => {
                    let strh = Self::read_strh(ctx.io()?)?;
                    index = Some(self.add_stream(ctx, &strh)?);
                }
                (STRH, _) => malformed(policy, "unexpected strh chunk", pos)?,
                (STRF, Some(idx)) => match ctx.streams[idx].media_type() {
                    MediaType::Video if chunk_size >= 40 => parse_video_format(ctx, idx, chunk_size)?,
                    MediaType::Audio if chunk_size >= 16 => parse_audio_format(ctx, idx, chunk_size)?,
                    MediaType::Video | MediaType::Audio => malformed(policy, "truncated strf chunk", pos)?,
                    _ => {}
                },
                (STRN, Some(idx)) => {
                    let name = read_string(ctx.io()?, chunk_size)?;
                    if !name.is_empty() {
                        ctx.streams[idx].metadata.insert("title".to_string(), name);
                    }
                }
                _ => {}
            }

            ctx.io()?.seek(chunk_end + (chunk_size & 1) as i64, Whence::Start)?;
        }

        if let Some(idx) = index {
            finish_stream_codec(ctx, idx);
        }
        Ok(())
    }

    fn add_stream(&mut self, ctx: &mut FormatContext, strh: &StreamHeader) -> Result<usize> {
        let st = ctx.new_stream()?;
        let idx = st.index;
        st.id = idx as i32;

        match strh.fcc_type {
            VIDS => {
                st.codecpar.set_codec(identify_video_codec(strh.fcc_handler));
                st.codecpar.codec_type = MediaType::Video;
                st.codecpar.codec_tag = strh.fcc_handler;
                st.nb_frames = strh.length as i64;
            }
            AUDS => st.codecpar.codec_type = MediaType::Audio,
            other => {
                debug!(stream = idx, fcc_type = %fourcc_to_string(other), "unsupported stream type");
                st.discard = Discard::All;
            }
        }
        if strh.length > 0 {
            st.duration = Some(strh.length as i64);
        }
        st.start_time = Some(strh.start as i64);

        let (scale, rate) = if strh.scale == 0 || strh.rate == 0 {
            warn!(stream = idx, scale = strh.scale, rate = strh.rate, "invalid stream rate, assuming 25/1");
            (1, 25)
        } else {
            (strh.scale, strh.rate)
        };
        ctx.set_pts_info(idx, 64, scale, rate);

        self.streams.push(AviStream {
            sample_size: strh.sample_size,
            next_ts: strh.start as i64,
            start: strh.start as i64,
            index_end: strh.start as i64,
        });
        debug!(
            stream = idx,
            handler = %fourcc_to_string(strh.fcc_handler),
            scale,
            rate,
            length = strh.length,
            "strh"
        );
        Ok(idx)
    }

    fn parse_info(&mut self, ctx: &mut FormatContext, end: i64) -> Result<()> {
        while ctx.io()?.tell() + 8 <= end {
            let io = ctx.io()?;
            let tag = io.rl32()?;
            let size = io.rl32()?;
            let chunk_end = io.tell() + size as i64;
            if chunk_end > end {
                malformed(ctx.options.tag_policy, "INFO tag overruns its list", chunk_end)?;
                break;
            }
            if let Some(key) = info_key(tag) {
                let value = read_string(ctx.io()?, size)?;
                if !value.is_empty() {
                    ctx.metadata.insert(key.to_string(), value);
                }
            }
            ctx.io()?.seek(chunk_end + (size & 1) as i64, Whence::Start)?;
        }
        ctx.io()?.seek(end, Whence::Start)?;
        Ok(())
    }

    /// Looks for idx1 after the movi list; leaves the position undefined.
    fn find_idx1(&mut self, ctx: &mut FormatContext) -> Result<()> {
        let file_size = ctx.io()?.size()?;
        let mut pos = self.movi_end + (self.movi_end & 1);

        while pos + 8 <= file_size {
            let io = ctx.io()?;
            io.seek(pos, Whence::Start)?;
            let tag = io.rl32()?;
            let size = io.rl32()?;
            if tag == IDX1 {
                return self.parse_idx1(ctx, size);
            }
            pos += 8 + size as i64 + (size & 1) as i64;
        }
        debug!("no idx1 index");
        Ok(())
    }

    fn parse_idx1(&mut self, ctx: &mut FormatContext, size: u32) -> Result<()> {
        if size % 16 != 0 {
            malformed(ctx.options.tag_policy, "idx1 size is not a multiple of 16", ctx.io()?.tell())?;
        }
        let entries = size / 16;
        let mut base = None;
        let mut next_ts: Vec<i64> = self.streams.iter().map(|s| s.start).collect();

        for _ in 0..entries {
            let io = ctx.io()?;
            let tag = io.rl32()?;
            let flags = io.rl32()?;
            let offset = io.rl32()? as i64;
            let chunk_size = io.rl32()?;

            let Some(idx) = chunk_stream(tag).filter(|&i| i < self.streams.len()) else {
                continue;
            };
            // Some writers store absolute offsets instead of movi-relative ones.
            let base = *base.get_or_insert(if offset > self.movi_list { 0 } else { self.movi_list });
            let pos = base + offset;

            let ts = next_ts[idx];
            next_ts[idx] += self.streams[idx].chunk_duration(chunk_size as usize);

            let audio = ctx.streams[idx].media_type() == MediaType::Audio;
            let key = flags & AVIIF_KEYFRAME != 0 || audio;
            if key {
                self.keyframes.insert(pos);
            }
            let index_flags = if key { IndexFlags::KEYFRAME } else { IndexFlags::empty() };
            ctx.add_index_entry(idx, pos, Some(ts), chunk_size as i32, 0, index_flags);
        }

        for (st, end) in self.streams.iter_mut().zip(next_ts) {
            st.index_end = end;
        }
        self.has_index = entries > 0;
        debug!(entries, "idx1");
        Ok(())
    }
}

fn parse_video_format(ctx: &mut FormatContext, idx: usize, size: u32) -> Result<()> {
    // BITMAPINFOHEADER
    let io = ctx.io()?;
    let _bih_size = io.rl32()?;
    let width = io.rl32()? as i32;
    let height = io.rl32()? as i32;
    let _planes = io.rl16()?;
    let bit_count = io.rl16()?;
    let compression = io.rl32()?;
    io.skip(20)?;
    let extradata = if size > 40 { io.read_bytes((size - 40) as usize)? } else { Default::default() };

    let par = &mut ctx.streams[idx].codecpar;
    par.width = width.unsigned_abs();
    par.height = height.unsigned_abs();
    par.bits_per_coded_sample = bit_count as u32;
    par.extradata = extradata;
    // The compression field is more specific than the strh handler.
    if compression != 0 {
        let codec = identify_video_codec(compression);
        if codec != CodecId::None || par.codec_id == CodecId::None {
            par.set_codec(codec);
        }
        par.codec_tag = compression;
    } else if par.codec_id == CodecId::None {
        par.set_codec(CodecId::RawVideo);
    }
    par.codec_type = MediaType::Video;
    Ok(())
}

fn parse_audio_format(ctx: &mut FormatContext, idx: usize, size: u32) -> Result<()> {
    // WAVEFORMATEX
    let io = ctx.io()?;
    let format_tag = io.rl16()?;
    let channels = io.rl16()?;
    let sample_rate = io.rl32()?;
    let avg_bytes_per_sec = io.rl32()?;
    let block_align = io.rl16()?;
    let bits_per_sample = io.rl16()?;
    let extradata = if size >= 18 {
        let cb_size = io.rl16()? as u32;
        io.read_bytes(cb_size.min(size - 18) as usize)?
    } else {
        Default::default()
    };

    let par = &mut ctx.streams[idx].codecpar;
    par.set_codec(identify_audio_codec(format_tag, bits_per_sample));
    par.codec_type = MediaType::Audio;
    par.codec_tag = format_tag as u32;
    par.channels = channels as u32;
    par.sample_rate = sample_rate;
    par.bit_rate = avg_bytes_per_sec as i64 * 8;
    par.block_align = block_align as u32;
    par.bits_per_coded_sample = bits_per_sample as u32;
    par.extradata = extradata;
    Ok(())
}

/// Chunks of compressed audio and of H.264 need not hold whole frames.
fn finish_stream_codec(ctx: &mut FormatContext, idx: usize) {
    let st = &mut ctx.streams[idx];
    st.need_parsing = match st.codecpar.codec_id {
        CodecId::Mp2 | CodecId::Mp3 | CodecId::Ac3 | CodecId::Dts => NeedParsing::Full,
        CodecId::H264 | CodecId::Hevc => NeedParsing::Headers,
        _ => NeedParsing::None,
    };
    if st.codecpar.codec_id == CodecId::None && st.discard < Discard::All {
        st.request_probe = 1;
    }
}

impl Demuxer for AviDemuxer {
    fn read_header(&mut self, ctx: &mut FormatContext) -> Result<()> {
        let io = ctx.io()?;
        if io.rl32()? != RIFF {
            return Err(DemuxError::invalid_data("not a RIFF file"));
        }
        let _riff_size = io.rl32()?;
        if io.rl32()? != AVI_ {
            return Err(DemuxError::invalid_data("not an AVI file"));
        }

        loop {
            let io = ctx.io()?;
            let pos = io.tell();
            let fourcc = match io.rl32() {
                Ok(f) => f,
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e),
            };
            let size = io.rl32()?;
            let chunk_end = io.tell() + size as i64;

            match fourcc {
                LIST if size >= 4 || size == 0 => match io.rl32()? {
                    HDRL => self.parse_hdrl(ctx, chunk_end)?,
                    INFO => self.parse_info(ctx, chunk_end)?,
                    MOVI => {
                        self.movi_list = pos + 8;
                        let file_size = match io.seekable() {
                            Seekability::None => None,
                            _ => io.size().ok().filter(|&s| s > 0),
                        };
                        self.movi_end = match file_size {
                            Some(file_size) if size == 0 || chunk_end > file_size => {
                                warn!(size, file_size, "movi list size does not match the file");
                                file_size
                            }
                            // Unknown length: read chunks until the input ends.
                            None if size == 0 => i64::MAX,
                            _ => chunk_end,
                        };
                        break;
                    }
                    _ => {}
                },
                _ => trace!(tag = %fourcc_to_string(fourcc), size, "skipping chunk"),
            }

            ctx.io()?.seek(chunk_end + (size & 1) as i64, Whence::Start)?;
        }

        if self.movi_list == 0 {
            return Err(DemuxError::invalid_data("AVI without movi list"));
        }
        if self.streams.is_empty() {
            return Err(DemuxError::invalid_data("AVI without streams"));
        }
        if self.header.streams as usize != self.streams.len() {
            debug!(announced = self.header.streams, found = self.streams.len(), "stream count mismatch");
        }
        if self.header.microsec_per_frame > 0 {
            debug!(
                duration_us = self.header.total_frames as i64 * self.header.microsec_per_frame as i64,
                "avih duration"
            );
        }
        for st in ctx.streams.iter_mut().filter(|st| st.media_type() == MediaType::Video) {
            if st.codecpar.width == 0 {
                st.codecpar.width = self.header.width;
                st.codecpar.height = self.header.height;
            }
        }

        if ctx.io()?.seekable() != Seekability::None {
            self.find_idx1(ctx)?;
        }
        ctx.io()?.seek(self.movi_list + 4, Whence::Start)?;
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet> {
        loop {
            let io = ctx.io()?;
            let pos = io.tell();
            if pos + 8 > self.movi_end {
                return Err(DemuxError::Eof);
            }
            let tag = io.rl32()?;
            let size = io.rl32()?;

            if tag == LIST {
                // rec lists group interleaved chunks; read into them
                io.rl32()?;
                continue;
            }
            if tag == IDX1 {
                return Err(DemuxError::Eof);
            }

            let Some(idx) = chunk_stream(tag).filter(|&i| i < self.streams.len()) else {
                trace!(pos, tag = %fourcc_to_string(tag), size, "skipping chunk");
                io.skip(size as i64 + (size & 1) as i64)?;
                continue;
            };
            // palette changes
            if &tag.to_le_bytes()[2..] == b"pc" {
                io.skip(size as i64 + (size & 1) as i64)?;
                continue;
            }

            let ts = self.streams[idx].next_ts;
            let duration = self.streams[idx].chunk_duration(size as usize);
            self.streams[idx].next_ts += duration;

            let discard = ctx.streams[idx].discard >= Discard::All;
            let audio = ctx.streams[idx].media_type() == MediaType::Audio;
            let io = ctx.io()?;
            // Empty chunks are dropped frames.
            if size == 0 || discard {
                io.skip(size as i64 + (size & 1) as i64)?;
                continue;
            }

            let data = io.read_bytes(size as usize)?;
            if data.len() < size as usize {
                warn!(pos, size, got = data.len(), "truncated chunk");
            } else if size & 1 == 1 {
                io.skip(1)?;
            }

            let mut pkt = Packet::new(idx, data);
            pkt.pts = Some(ts);
            pkt.dts = Some(ts);
            pkt.duration = duration;
            pkt.pos = Some(pos);
            if !self.has_index || audio || self.keyframes.contains(&pos) {
                pkt.flags |= PacketFlags::KEY;
            }
            return Ok(pkt);
        }
    }

    fn read_close(&mut self, _ctx: &mut FormatContext) -> Result<()> {
        self.keyframes.clear();
        self.streams.clear();
        Ok(())
    }

    /// Seeks through idx1 and restarts every stream's chunk counter from
    /// the index.
    fn read_seek(
        &mut self,
        ctx: &mut FormatContext,
        stream: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Option<Result<()>> {
        let index = &ctx.streams.get(stream)?.index_entries;
        let entry = index.get(index.search(timestamp, flags)?)?;
        let (pos, ts) = (entry.pos, entry.timestamp);
        debug!(stream, timestamp, pos, ts, "idx1 seek");

        for (i, avi) in self.streams.iter_mut().enumerate() {
            avi.next_ts = ctx.streams[i]
                .index_entries
                .entries()
                .iter()
                .find(|e| e.pos >= pos)
                .map_or(avi.index_end, |e| e.timestamp);
        }

        let result = ctx.io().and_then(|io| io.seek(pos, Whence::Start)).map(|_| ());
        if result.is_ok() {
            ctx.update_cur_dts(stream, ts);
        }
        Some(result)
    }
}
