//! AC-3 and E-AC-3 sync frames.

use crate::codec::{CodecId, CodecParameters};
use crate::parser::{CodecParser, FrameInfo};
use crate::parsers::BitReader;

pub const AC3_HEADER_SIZE: usize = 7;

const SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];
const EAC3_HALF_RATES: [u32; 3] = [24000, 22050, 16000];

/// kbit/s, indexed by `frmsizecod / 2`.
const BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

/// 16-bit words per frame at 44.1 kHz; odd `frmsizecod` adds one word.
const WORDS_44: [u16; 19] = [
    69, 87, 104, 121, 139, 174, 208, 243, 278, 348, 417, 487, 557, 696, 835, 975, 1114, 1253, 1393,
];

const CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];
const EAC3_BLOCKS: [u32; 4] = [1, 2, 3, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3Header {
    pub bsid: u8,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_size: usize,
    pub samples: u32,
    /// bit/s; 0 for E-AC-3 where it follows from the frame size.
    pub bit_rate: u32,
}

impl Ac3Header {
    pub fn is_eac3(&self) -> bool {
        self.bsid > 10
    }
}

pub fn parse_header(buf: &[u8]) -> Option<Ac3Header> {
    if buf.len() < AC3_HEADER_SIZE || buf[0] != 0x0B || buf[1] != 0x77 {
        return None;
    }
    let bsid = buf[5] >> 3;
    if bsid > 16 {
        return None;
    }
    if bsid <= 10 {
        parse_ac3(buf, bsid)
    } else {
        parse_eac3(buf, bsid)
    }
}

fn read_lfe(br: &mut BitReader<'_>, acmod: u32) -> Option<bool> {
    if acmod & 1 != 0 && acmod != 1 {
        br.skip(2)?;
    }
    if acmod & 4 != 0 {
        br.skip(2)?;
    }
    if acmod == 2 {
        br.skip(2)?;
    }
    br.read_bit()
}

fn parse_ac3(buf: &[u8], bsid: u8) -> Option<Ac3Header> {
    let fscod = (buf[4] >> 6) as usize;
    let frmsizecod = (buf[4] & 0x3F) as usize;
    if fscod >= 3 || frmsizecod >= 38 {
        return None;
    }
    let kbps = BITRATES[frmsizecod / 2];
    let words = match fscod {
        0 => kbps * 2,
        1 => WORDS_44[frmsizecod / 2] as u32 + (frmsizecod & 1) as u32,
        _ => kbps * 3,
    };

    let mut br = BitReader::new(&buf[5..]);
    br.skip(8)?;
    let acmod = br.read_bits(3)?;
    let lfe = read_lfe(&mut br, acmod)?;

    Some(Ac3Header {
        bsid,
        sample_rate: SAMPLE_RATES[fscod],
        channels: CHANNELS[acmod as usize] + lfe as u32,
        frame_size: words as usize * 2,
        samples: 1536,
        bit_rate: kbps * 1000,
    })
}

fn parse_eac3(buf: &[u8], bsid: u8) -> Option<Ac3Header> {
    let mut br = BitReader::new(&buf[2..]);
    let strmtyp = br.read_bits(2)?;
    if strmtyp == 3 {
        return None;
    }
    br.skip(3)?;
    let frmsiz = br.read_bits(11)? as usize;
    let fscod = br.read_bits(2)? as usize;
    let (sample_rate, blocks) = if fscod == 3 {
        let fscod2 = br.read_bits(2)? as usize;
        (*EAC3_HALF_RATES.get(fscod2)?, 6)
    } else {
        let numblkscod = br.read_bits(2)? as usize;
        (SAMPLE_RATES[fscod], EAC3_BLOCKS[numblkscod])
    };
    let acmod = br.read_bits(3)?;
    let lfe = br.read_bit()?;
    Some(Ac3Header {
        bsid,
        sample_rate,
        channels: CHANNELS[acmod as usize] + lfe as u32,
        frame_size: (frmsiz + 1) * 2,
        samples: 256 * blocks,
        bit_rate: 0,
    })
}

#[derive(Debug, Default)]
pub struct Ac3Parser;

impl CodecParser for Ac3Parser {
    fn codec_ids(&self) -> &'static [CodecId] {
        &[CodecId::Ac3, CodecId::Eac3]
    }

    fn find_frame_end(&mut self, data: &[u8]) -> Option<usize> {
        match parse_header(data) {
            Some(h) => (data.len() >= h.frame_size).then_some(h.frame_size),
            None if data.len() < AC3_HEADER_SIZE => None,
            None => (1..data.len().saturating_sub(AC3_HEADER_SIZE - 1))
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
        codec.frame_size = h.samples;
        codec.bit_rate = if h.bit_rate > 0 {
            h.bit_rate as i64
        } else {
            h.frame_size as i64 * 8 * h.sample_rate as i64 / h.samples as i64
        };
        if h.is_eac3() && codec.codec_id == CodecId::Ac3 {
            codec.set_codec(CodecId::Eac3);
        }
    }
}
