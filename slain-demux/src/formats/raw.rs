//! Raw elementary streams: H.264 Annex B, AAC in ADTS, AC-3 and MPEG audio.
//!
//! These formats carry a single stream with no container framing. The
//! demuxer hands out fixed-size chunks and leaves frame splitting and
//! timestamps to the codec parser. The same descriptors score the probe
//! buffers of streams whose codec a container did not announce.

use bytes::Bytes;

use crate::codec::CodecId;
use crate::context::FormatContext;
use crate::error::Result;
use crate::format::{Demuxer, InputFormat, InputFormatFlags, ProbeData};
use crate::packet::Packet;
use crate::parsers::{ac3, adts, mpegaudio};
use crate::probe::SCORE_EXTENSION;
use crate::rational::Rational;
use crate::stream::NeedParsing;

/// Bytes per packet handed to the parser.
pub const RAW_PACKET_SIZE: usize = 1024;

/// Descriptor of a raw elementary-stream format.
pub struct RawFormat {
    name: &'static str,
    long_name: &'static str,
    extensions: &'static str,
    mime_types: &'static str,
    codec: CodecId,
    flags: InputFormatFlags,
    probe: fn(&[u8]) -> i32,
    /// Denominator of the stream time base.
    time_base: u32,
}

pub const H264: RawFormat = RawFormat {
    name: "h264",
    long_name: "raw H.264 video",
    extensions: "h26l,h264,264,avc",
    mime_types: "",
    codec: CodecId::H264,
    flags: InputFormatFlags::GENERIC_INDEX.union(InputFormatFlags::NOTIMESTAMPS),
    probe: h264_probe,
    time_base: 1_200_000,
};

pub const AAC: RawFormat = RawFormat {
    name: "aac",
    long_name: "raw ADTS AAC (Advanced Audio Coding)",
    extensions: "aac",
    mime_types: "audio/aac,audio/aacp,audio/x-aac",
    codec: CodecId::Aac,
    flags: InputFormatFlags::GENERIC_INDEX,
    probe: adts_probe,
    time_base: 28_224_000,
};

pub const AC3: RawFormat = RawFormat {
    name: "ac3",
    long_name: "raw AC-3",
    extensions: "ac3",
    mime_types: "audio/ac3",
    codec: CodecId::Ac3,
    flags: InputFormatFlags::GENERIC_INDEX,
    probe: ac3_probe,
    time_base: 90_000,
};

pub const MP3: RawFormat = RawFormat {
    name: "mp3",
    long_name: "MP2/3 (MPEG audio layer 2/3)",
    extensions: "mp2,mp3,m2a,mpa",
    mime_types: "audio/mpeg",
    codec: CodecId::Mp3,
    flags: InputFormatFlags::GENERIC_INDEX,
    probe: mpegaudio_probe,
    time_base: 14_112_000,
};

impl InputFormat for RawFormat {
    fn name(&self) -> &'static str {
        self.name
    }

    fn long_name(&self) -> &'static str {
        self.long_name
    }

    fn extensions(&self) -> &'static str {
        self.extensions
    }

    fn mime_types(&self) -> &'static str {
        self.mime_types
    }

    fn flags(&self) -> InputFormatFlags {
        self.flags
    }

    fn raw_codec_id(&self) -> CodecId {
        self.codec
    }

    fn probe(&self, pd: &ProbeData<'_>) -> Option<i32> {
        Some((self.probe)(pd.buf))
    }

    fn create(&self) -> Box<dyn Demuxer> {
        Box::new(RawDemuxer { codec: self.codec, time_base: self.time_base })
    }
}

pub struct RawDemuxer {
    codec: CodecId,
    time_base: u32,
}

impl Demuxer for RawDemuxer {
    fn read_header(&mut self, ctx: &mut FormatContext) -> Result<()> {
        let st = ctx.new_stream()?;
        st.codecpar.set_codec(self.codec);
        st.need_parsing = NeedParsing::FullRaw;
        if self.codec == CodecId::H264 {
            st.codecpar.framerate = Rational::new(25, 1);
        } else {
            st.start_time = Some(0);
        }
        let index = st.index;
        ctx.set_pts_info(index, 64, 1, self.time_base);
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet> {
        let io = ctx.io()?;
        let pos = io.tell();
        let mut buf = vec![0u8; RAW_PACKET_SIZE];
        let n = io.read_partial(&mut buf)?;
        buf.truncate(n);
        let mut pkt = Packet::new(0, Bytes::from(buf));
        pkt.pos = Some(pos);
        Ok(pkt)
    }
}

// ============================================================================
// Sniffers
// ============================================================================

/// Counts runs of back-to-back frames. `frame_len` returns the size of the
/// frame at the slice head, `None` when no frame starts there. Returns the
/// run length from offset 0 and the longest run seen anywhere.
fn count_frames<F>(buf: &[u8], tail: usize, mut frame_len: F) -> (usize, usize)
where
    F: FnMut(&[u8]) -> Option<usize>,
{
    let end = buf.len().saturating_sub(tail);
    let mut first_frames = 0;
    let mut max_frames = 0;
    for start in 0..end {
        let mut pos = start;
        let mut frames = 0;
        while pos < end {
            match frame_len(&buf[pos..]) {
                Some(len) if len > 0 => pos += len,
                _ => break,
            }
            frames += 1;
        }
        max_frames = max_frames.max(frames);
        if start == 0 {
            first_frames = frames;
        }
    }
    (first_frames, max_frames)
}

fn adts_probe(buf: &[u8]) -> i32 {
    let mut first_frames = 0;
    let mut max_frames = 0;
    for start in 0..buf.len().saturating_sub(adts::ADTS_HEADER_SIZE) {
        let mut pos = start;
        let mut frames = 0;
        while pos + adts::ADTS_HEADER_SIZE <= buf.len() {
            let b = &buf[pos..];
            if b[0] != 0xFF || b[1] & 0xF6 != 0xF0 {
                // something other than a header, away from the buffer start
                if start != 0 {
                    frames = 0;
                }
                break;
            }
            let fsize = (((b[3] & 0x03) as usize) << 11) | ((b[4] as usize) << 3) | (b[5] >> 5) as usize;
            if fsize < adts::ADTS_HEADER_SIZE {
                break;
            }
            pos += fsize.min(buf.len() - pos);
            frames += 1;
        }
        max_frames = max_frames.max(frames);
        if start == 0 {
            first_frames = frames;
        }
    }
    if first_frames >= 3 {
        SCORE_EXTENSION + 1
    } else if max_frames > 100 {
        SCORE_EXTENSION
    } else if max_frames >= 3 {
        SCORE_EXTENSION / 2
    } else if max_frames >= 1 {
        1
    } else {
        0
    }
}

fn mpegaudio_probe(buf: &[u8]) -> i32 {
    let lead = buf.iter().take_while(|&&b| b == 0).count();
    let body = &buf[lead..];
    let end = body.len().saturating_sub(mpegaudio::MPA_HEADER_SIZE);
    let (mut first_frames, mut max_frames, mut max_bytes) = (0, 0, 0);
    let mut whole_used = false;
    for start in 0..end {
        let mut pos = start;
        let mut frames = 0;
        while pos < end {
            match mpegaudio::parse_header(&body[pos..]) {
                Some(h) if h.frame_size > 0 => pos += h.frame_size,
                _ => break,
            }
            frames += 1;
        }
        max_frames = max_frames.max(frames);
        max_bytes = max_bytes.max(pos - start);
        if start == 0 {
            first_frames = frames;
            whole_used = pos == body.len();
        }
    }

    let size = buf.len();
    if first_frames >= 7 {
        SCORE_EXTENSION + 1
    } else if max_frames > 200 && size < 2 * max_bytes {
        SCORE_EXTENSION
    } else if max_frames >= 4 && size < 2 * max_bytes {
        SCORE_EXTENSION / 2
    } else if first_frames > 1 && whole_used {
        5
    } else if max_frames >= 1 && size < 10 * max_bytes {
        1
    } else {
        0
    }
}

fn ac3_probe(buf: &[u8]) -> i32 {
    let mut eac3 = false;
    let (first_frames, max_frames) = count_frames(buf, 0, |b| {
        let header = ac3::parse_header(b)?;
        eac3 |= header.is_eac3();
        Some(header.frame_size)
    });
    if eac3 {
        return 0;
    }
    if first_frames >= 7 {
        SCORE_EXTENSION + 1
    } else if max_frames > 200 {
        SCORE_EXTENSION
    } else if max_frames >= 4 {
        SCORE_EXTENSION / 2
    } else if max_frames >= 1 {
        1
    } else {
        0
    }
}

/// Per NAL type: 1 requires nal_ref_idc zero, -1 requires it non-zero,
/// 2 marks a type that never appears in a plain stream.
const NAL_REF_ZERO: [i8; 32] = [
    2, 0, 0, 0, 0, -1, 1, -1, -1, 1, 1, 1, 1, -1, 2, 2, 2, 2, 2, 0, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
];

fn h264_probe(buf: &[u8]) -> i32 {
    let (mut sps, mut pps, mut idr, mut sli, mut res) = (0, 0, 0, 0, 0);
    let mut code: u32 = u32::MAX;
    for i in 0..buf.len().saturating_sub(2) {
        code = (code << 8) | buf[i] as u32;
        if code & 0xFFFF_FF00 != 0x100 {
            continue;
        }
        let ref_idc = (code >> 5) & 3;
        let nal_type = (code & 0x1F) as usize;
        if code & 0x80 != 0 {
            return 0;
        }
        match NAL_REF_ZERO[nal_type] {
            1 if ref_idc != 0 => return 0,
            -1 if ref_idc == 0 => return 0,
            2 if !(code == 0x100 && buf[i + 1] == 0 && buf[i + 2] == 0) => res += 1,
            _ => {}
        }
        match nal_type {
            1 => sli += 1,
            5 => idr += 1,
            7 => {
                let rbsp = crate::parsers::h264::unescape_rbsp(&buf[i + 1..buf.len().min(i + 32)]);
                if crate::parsers::h264::parse_sps(&rbsp).is_some() {
                    sps += 1;
                }
            }
            8 => pps += 1,
            _ => {}
        }
    }
    if sps > 0 && pps > 0 && (idr > 0 || sli > 3) && res < sps + pps + idr {
        SCORE_EXTENSION + 1
    } else {
        0
    }
}
