//! AAC in ADTS framing.

use crate::codec::{CodecId, CodecParameters};
use crate::parser::{CodecParser, FrameInfo};

pub const ADTS_HEADER_SIZE: usize = 7;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_length: usize,
    pub samples: u32,
    pub crc_absent: bool,
}

impl AdtsHeader {
    pub fn bit_rate(&self) -> i64 {
        self.frame_length as i64 * 8 * self.sample_rate as i64 / self.samples as i64
    }
}

pub fn parse_header(buf: &[u8]) -> Option<AdtsHeader> {
    if buf.len() < ADTS_HEADER_SIZE {
        return None;
    }
    // 12-bit sync, layer must be 0
    if buf[0] != 0xFF || buf[1] & 0xF6 != 0xF0 {
        return None;
    }
    let crc_absent = buf[1] & 0x01 != 0;
    let object_type = (buf[2] >> 6) + 1;
    let sr_index = ((buf[2] >> 2) & 0x0F) as usize;
    let sample_rate = *SAMPLE_RATES.get(sr_index)?;
    let channels = (((buf[2] & 0x01) << 2) | (buf[3] >> 6)) as u32;
    let frame_length = (((buf[3] & 0x03) as usize) << 11) | ((buf[4] as usize) << 3) | (buf[5] >> 5) as usize;
    if frame_length < ADTS_HEADER_SIZE {
        return None;
    }
    let raw_blocks = (buf[6] & 0x03) as u32;
    Some(AdtsHeader {
        object_type,
        sample_rate,
        channels,
        frame_length,
        samples: (raw_blocks + 1) * 1024,
        crc_absent,
    })
}

#[derive(Debug, Default)]
pub struct AdtsParser;

impl CodecParser for AdtsParser {
    fn codec_ids(&self) -> &'static [CodecId] {
        &[CodecId::Aac]
    }

    fn find_frame_end(&mut self, data: &[u8]) -> Option<usize> {
        match parse_header(data) {
            Some(h) => (data.len() >= h.frame_length).then_some(h.frame_length),
            None if data.len() < ADTS_HEADER_SIZE => None,
            // Junk before the next sync goes out as its own frame.
            None => (1..data.len().saturating_sub(ADTS_HEADER_SIZE - 1))
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
        if h.channels > 0 {
            codec.channels = h.channels;
        }
        codec.profile = h.object_type as i32 - 1;
        codec.bit_rate = h.bit_rate();
        codec.frame_size = h.samples;
    }
}
