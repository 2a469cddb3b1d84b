//! MPEG-1/2 audio layers I-III.

use crate::codec::{CodecId, CodecParameters};
use crate::parser::{CodecParser, FrameInfo};

pub const MPA_HEADER_SIZE: usize = 4;

/// kbit/s by [lsf][layer - 1][index].
const BITRATES: [[[u16; 15]; 3]; 2] = [
    [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    ],
    [
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    ],
];

const SAMPLE_RATES: [u32; 3] = [44100, 48000, 32000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaHeader {
    pub layer: u8,
    /// MPEG-2 or 2.5 low sampling frequency.
    pub lsf: bool,
    pub sample_rate: u32,
    pub channels: u32,
    pub bit_rate: u32,
    pub frame_size: usize,
    pub samples: u32,
}

impl MpaHeader {
    pub fn codec_id(&self) -> CodecId {
        match self.layer {
            1 => CodecId::Mp1,
            2 => CodecId::Mp2,
            _ => CodecId::Mp3,
        }
    }
}

/// Header word sanity check, without the free-format rejection.
pub fn check_header(h: u32) -> bool {
    (h & 0xFFE0_0000) == 0xFFE0_0000
        && (h >> 19) & 3 != 1
        && (h >> 17) & 3 != 0
        && (h >> 12) & 0xF != 0xF
        && (h >> 10) & 3 != 3
}

pub fn parse_header(buf: &[u8]) -> Option<MpaHeader> {
    let word = u32::from_be_bytes(buf.get(..MPA_HEADER_SIZE)?.try_into().ok()?);
    if !check_header(word) {
        return None;
    }
    let version = (word >> 19) & 3;
    let layer = 4 - ((word >> 17) & 3) as u8;
    let br_index = ((word >> 12) & 0xF) as usize;
    if br_index == 0 {
        return None;
    }
    let lsf = version != 3;
    let shift = match version {
        3 => 0,
        2 => 1,
        _ => 2,
    };
    let sample_rate = SAMPLE_RATES[((word >> 10) & 3) as usize] >> shift;
    let padding = ((word >> 9) & 1) as usize;
    let channels = if (word >> 6) & 3 == 3 { 1 } else { 2 };

    let kbps = BITRATES[lsf as usize][layer as usize - 1][br_index] as usize;
    let br = kbps * 1000;
    let sr = sample_rate as usize;
    let (frame_size, samples) = match layer {
        1 => ((12 * br / sr + padding) * 4, 384),
        2 => (144 * br / sr + padding, 1152),
        _ if lsf => (72 * br / sr + padding, 576),
        _ => (144 * br / sr + padding, 1152),
    };

    Some(MpaHeader {
        layer,
        lsf,
        sample_rate,
        channels,
        bit_rate: br as u32,
        frame_size,
        samples,
    })
}

#[derive(Debug, Default)]
pub struct MpegAudioParser;

impl CodecParser for MpegAudioParser {
    fn codec_ids(&self) -> &'static [CodecId] {
        &[CodecId::Mp1, CodecId::Mp2, CodecId::Mp3]
    }

    fn find_frame_end(&mut self, data: &[u8]) -> Option<usize> {
        match parse_header(data) {
            Some(h) => (data.len() >= h.frame_size).then_some(h.frame_size),
            None if data.len() < MPA_HEADER_SIZE => None,
            None => (1..data.len().saturating_sub(MPA_HEADER_SIZE - 1))
                .find(|&i| parse_header(&data[i..]).is_some()),
        }
    }

    fn inspect(&mut self, frame: &[u8], info: &mut FrameInfo, codec: &mut CodecParameters) {
        let Some(h) = parse_header(frame) else {
            info.duration = 0;
            return;
        };
        info.duration = h.samples as i32;
        info.key_frame = 1;
        codec.sample_rate = h.sample_rate;
        codec.channels = h.channels;
        codec.bit_rate = h.bit_rate as i64;
        codec.frame_size = h.samples;
        if codec.codec_id != h.codec_id() {
            codec.set_codec(h.codec_id());
        }
    }
}
