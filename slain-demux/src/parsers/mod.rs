//! Built-in codec parsers and the bit reader they share.

pub mod ac3;
pub mod adts;
pub mod h264;
pub mod mpegaudio;

use std::sync::Arc;

use crate::codec::CodecId;
use crate::parser::{CodecParser, ParserFactory};

pub(crate) fn builtin() -> Vec<(&'static [CodecId], ParserFactory)> {
    fn entry<P: CodecParser + Default + 'static>() -> (&'static [CodecId], ParserFactory) {
        let ids = P::default().codec_ids();
        let factory: ParserFactory = Arc::new(|| Box::new(P::default()) as Box<dyn CodecParser>);
        (ids, factory)
    }
    vec![
        entry::<h264::H264Parser>(),
        entry::<adts::AdtsParser>(),
        entry::<ac3::Ac3Parser>(),
        entry::<mpegaudio::MpegAudioParser>(),
    ]
}

/// MSB-first bit reader over a byte slice. Reads past the end yield `None`.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit != 0)
    }

    /// Up to 32 bits.
    pub fn read_bits(&mut self, n: u32) -> Option<u32> {
        if n > 32 || self.remaining_bits() < n as usize {
            return None;
        }
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Some(value)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining_bits() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// Unsigned Exp-Golomb, ue(v).
    pub fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0u32;
        while !self.read_bit()? {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        if zeros == 0 {
            return Some(0);
        }
        let suffix = self.read_bits(zeros)?;
        Some(((1u64 << zeros) - 1 + suffix as u64) as u32)
    }

    /// Signed Exp-Golomb, se(v).
    pub fn read_se(&mut self) -> Option<i32> {
        let ue = self.read_ue()? as i64;
        let v = (ue + 1) / 2;
        Some(if ue % 2 == 0 { -v } else { v } as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb_values() {
        // 1 | 010 | 011 | 00100 | 00101
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_ue(), Some(0));
        assert_eq!(br.read_ue(), Some(1));
        assert_eq!(br.read_ue(), Some(2));
        assert_eq!(br.read_ue(), Some(3));
        assert_eq!(br.read_se(), Some(-2));
    }

    #[test]
    fn read_past_end_is_none() {
        let mut br = BitReader::new(&[0xF0]);
        assert_eq!(br.read_bits(4), Some(0xF));
        assert_eq!(br.read_bits(5), None);
        assert_eq!(br.read_bits(4), Some(0));
        assert_eq!(br.read_bit(), None);
    }
}
