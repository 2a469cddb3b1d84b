//! H.264 Annex B access-unit splitter.
//!
//! A new access unit starts at the first VCL NAL with `first_mb_in_slice`
//! zero, or at an SEI, SPS, PPS, AUD or reserved 14-18 NAL, once the current
//! unit already holds a slice. The headers of each unit give key frame
//! status, picture type and, from the SPS, the coded dimensions.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{CodecId, CodecParameters};
use crate::parser::{CodecParser, FrameInfo, PictType};
use crate::parsers::BitReader;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

const SEI_RECOVERY_POINT: u32 = 6;

/// Offset of the first byte of the next `00 00 01` at or after `from`.
pub fn next_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?.windows(3).position(|w| w == [0, 0, 1]).map(|p| p + from)
}

/// NAL unit payloads (header byte first) of an Annex B buffer.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = next_start_code(data, 0).map(|sc| sc + 3);
    std::iter::from_fn(move || {
        let start = pos?;
        let (end, next) = match next_start_code(data, start) {
            Some(sc) => (sc, Some(sc + 3)),
            None => (data.len(), None),
        };
        pos = next;
        let mut nal = &data[start..end];
        while let [rest @ .., 0] = nal {
            nal = rest;
        }
        Some(nal)
    })
    .filter(|nal| !nal.is_empty())
}

/// Strips emulation prevention bytes.
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    pub log2_max_frame_num: u32,
    pub frame_mbs_only: bool,
    pub width: u32,
    pub height: u32,
}

fn skip_scaling_list(br: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = br.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Parses an SPS RBSP (after the NAL header byte, emulation prevention
/// removed).
pub fn parse_sps(rbsp: &[u8]) -> Option<Sps> {
    let mut br = BitReader::new(rbsp);
    let profile_idc = br.read_bits(8)? as u8;
    br.skip(8)?;
    let level_idc = br.read_bits(8)? as u8;
    let sps_id = br.read_ue()?;
    if sps_id > 31 {
        return None;
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
        chroma_format_idc = br.read_ue()?;
        if chroma_format_idc > 3 {
            return None;
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = br.read_bit()?;
        }
        br.read_ue()?; // bit_depth_luma_minus8
        br.read_ue()?; // bit_depth_chroma_minus8
        br.skip(1)?;
        if br.read_bit()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if br.read_bit()? {
                    skip_scaling_list(&mut br, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let log2_max_frame_num = br.read_ue()? + 4;
    match br.read_ue()? {
        0 => {
            br.read_ue()?;
        }
        1 => {
            br.skip(1)?;
            br.read_se()?;
            br.read_se()?;
            let cycle = br.read_ue()?;
            if cycle > 255 {
                return None;
            }
            for _ in 0..cycle {
                br.read_se()?;
            }
        }
        2 => {}
        _ => return None,
    }
    br.read_ue()?; // max_num_ref_frames
    br.skip(1)?;
    let width_mbs = br.read_ue()? + 1;
    let height_map_units = br.read_ue()? + 1;
    let frame_mbs_only = br.read_bit()?;
    if !frame_mbs_only {
        br.skip(1)?;
    }
    br.skip(1)?;

    let mut width = width_mbs * 16;
    let mut height = (2 - frame_mbs_only as u32) * height_map_units * 16;
    if br.read_bit()? {
        let left = br.read_ue()?;
        let right = br.read_ue()?;
        let top = br.read_ue()?;
        let bottom = br.read_ue()?;
        let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
        let (unit_x, unit_y) = match chroma_array_type {
            0 => (1, 1),
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let unit_y = unit_y * (2 - frame_mbs_only as u32);
        width = width.checked_sub((left + right) * unit_x)?;
        height = height.checked_sub((top + bottom) * unit_y)?;
    }

    Some(Sps {
        profile_idc,
        level_idc,
        sps_id,
        chroma_format_idc,
        separate_colour_plane,
        log2_max_frame_num,
        frame_mbs_only,
        width,
        height,
    })
}

fn has_recovery_point(rbsp: &[u8]) -> bool {
    let mut i = 0;
    while i + 2 <= rbsp.len() && rbsp[i] != 0x80 {
        let read_ff = |i: &mut usize| -> Option<u32> {
            let mut v = 0u32;
            loop {
                let b = *rbsp.get(*i)?;
                *i += 1;
                v += b as u32;
                if b != 0xFF {
                    return Some(v);
                }
            }
        };
        let (Some(kind), Some(size)) = (read_ff(&mut i), read_ff(&mut i)) else {
            return false;
        };
        if kind == SEI_RECOVERY_POINT {
            return true;
        }
        i += size as usize;
    }
    false
}

#[derive(Debug, Default)]
pub struct H264Parser {
    sps: Option<Sps>,
    sps_nal: Option<Bytes>,
    pps_nal: Option<Bytes>,
}

impl H264Parser {
    /// Picture type and field flag from a slice header.
    fn slice_info(&self, nal: &[u8]) -> Option<(PictType, bool)> {
        let rbsp = unescape_rbsp(nal.get(1..)?);
        let mut br = BitReader::new(&rbsp);
        br.read_ue()?;
        let pict = match br.read_ue()? % 5 {
            0 => PictType::P,
            1 => PictType::B,
            2 => PictType::I,
            3 => PictType::Sp,
            _ => PictType::Si,
        };
        let Some(sps) = self.sps else {
            return Some((pict, false));
        };
        br.read_ue()?; // pps_id
        if sps.separate_colour_plane {
            br.skip(2)?;
        }
        br.skip(sps.log2_max_frame_num as usize)?;
        let field = !sps.frame_mbs_only && br.read_bit()?;
        Some((pict, field))
    }
}

impl CodecParser for H264Parser {
    fn codec_ids(&self) -> &'static [CodecId] {
        &[CodecId::H264]
    }

    fn find_frame_end(&mut self, data: &[u8]) -> Option<usize> {
        let mut seen_vcl = false;
        let mut pos = 0;
        while let Some(sc) = next_start_code(data, pos) {
            let nal = sc + 3;
            let header = *data.get(nal)?;
            let start = if sc > 0 && data[sc - 1] == 0 { sc - 1 } else { sc };
            match header & 0x1F {
                1..=5 => {
                    let first_mb = BitReader::new(&data[nal + 1..]).read_ue()?;
                    if seen_vcl && first_mb == 0 {
                        return Some(start);
                    }
                    seen_vcl = true;
                }
                6..=9 | 14..=18 if seen_vcl => return Some(start),
                _ => {}
            }
            pos = nal + 1;
        }
        None
    }

    fn inspect(&mut self, frame: &[u8], info: &mut FrameInfo, codec: &mut CodecParameters) {
        let mut idr = false;
        let mut recovery = false;
        let mut slice = None;

        for nal in nal_units(frame) {
            match nal[0] & 0x1F {
                NAL_SPS => {
                    if let Some(sps) = parse_sps(&unescape_rbsp(&nal[1..])) {
                        codec.width = sps.width;
                        codec.height = sps.height;
                        codec.profile = sps.profile_idc as i32;
                        codec.level = sps.level_idc as i32;
                        self.sps = Some(sps);
                        self.sps_nal = Some(Bytes::copy_from_slice(nal));
                    }
                }
                NAL_PPS => self.pps_nal = Some(Bytes::copy_from_slice(nal)),
                NAL_SEI => recovery |= has_recovery_point(&unescape_rbsp(&nal[1..])),
                t @ NAL_SLICE..=NAL_IDR if slice.is_none() => {
                    idr |= t == NAL_IDR;
                    slice = self.slice_info(nal);
                }
                NAL_IDR => idr = true,
                _ => {}
            }
        }

        if let Some((pict, field)) = slice {
            info.key_frame = (idr || recovery) as i32;
            info.pict_type = pict;
            info.repeat_pict = if field { 0 } else { 1 };
        }

        if codec.extradata.is_empty() {
            if let (Some(sps), Some(pps)) = (&self.sps_nal, &self.pps_nal) {
                let mut extradata = BytesMut::with_capacity(sps.len() + pps.len() + 8);
                extradata.put_slice(&START_CODE);
                extradata.put_slice(sps);
                extradata.put_slice(&START_CODE);
                extradata.put_slice(pps);
                codec.extradata = extradata.freeze();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bits: usize,
    }

    impl BitWriter {
        pub(crate) fn bit(&mut self, b: bool) {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if b {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }

        pub(crate) fn bits(&mut self, v: u32, n: u32) {
            for i in (0..n).rev() {
                self.bit((v >> i) & 1 != 0);
            }
        }

        pub(crate) fn ue(&mut self, v: u32) {
            let code = v + 1;
            let len = 32 - code.leading_zeros();
            self.bits(0, len - 1);
            self.bits(code, len);
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            self.bit(true);
            self.bytes
        }
    }

    /// Baseline SPS NAL for `mbs_w` x `mbs_h` macroblocks.
    pub(crate) fn sps_nal(mbs_w: u32, mbs_h: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bits(66, 8);
        w.bits(0xC0, 8);
        w.bits(30, 8);
        w.ue(0);
        w.ue(0); // log2_max_frame_num - 4
        w.ue(2); // poc type
        w.ue(1);
        w.bit(false);
        w.ue(mbs_w - 1);
        w.ue(mbs_h - 1);
        w.bit(true); // frame_mbs_only
        w.bit(true);
        w.bit(false); // no cropping
        w.bit(false); // no vui
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    /// Slice NAL: `slice_type` 7 = I, 5 = P, 6 = B.
    pub(crate) fn slice_nal(idr: bool, first_mb: u32, slice_type: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.ue(first_mb);
        w.ue(slice_type);
        w.ue(0);
        w.bits(0, 4);
        let mut nal = vec![if idr { 0x65 } else { 0x41 }];
        nal.extend(w.finish());
        nal.extend([0xAA; 8]);
        nal
    }

    pub(crate) fn annexb(nals: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend(START_CODE);
            out.extend(nal);
        }
        out
    }

    /// One coded picture, with parameter sets when `idr`.
    pub(crate) fn access_unit(idr: bool, slice_type: u32) -> Vec<u8> {
        let mut nals = Vec::new();
        if idr {
            nals.push(sps_nal(20, 15));
            nals.push(vec![0x68, 0xCE, 0x38, 0x80]);
        }
        nals.push(slice_nal(idr, 0, slice_type));
        annexb(&nals)
    }

    #[test]
    fn sps_dimensions() {
        let nal = sps_nal(20, 15);
        let sps = parse_sps(&unescape_rbsp(&nal[1..])).expect("sps");
        assert_eq!((sps.width, sps.height), (320, 240));
        assert_eq!(sps.profile_idc, 66);
        assert!(sps.frame_mbs_only);
    }

    #[test]
    fn splits_at_next_first_slice() {
        let first = access_unit(true, 7);
        let mut data = first.clone();
        data.extend(access_unit(false, 5));
        let mut p = H264Parser::default();
        assert_eq!(p.find_frame_end(&data), Some(first.len()));
        assert_eq!(p.find_frame_end(&first), None);
    }

    #[test]
    fn continuation_slices_stay_in_unit() {
        let au = annexb(&[slice_nal(false, 0, 5), slice_nal(false, 40, 5)]);
        let mut p = H264Parser::default();
        assert_eq!(p.find_frame_end(&au), None);
    }

    #[test]
    fn inspect_reads_keyframe_and_type() {
        let mut p = H264Parser::default();
        let mut codec = CodecParameters::new(CodecId::H264);

        let mut info = FrameInfo::default();
        p.inspect(&access_unit(true, 7), &mut info, &mut codec);
        assert_eq!(info.key_frame, 1);
        assert_eq!(info.pict_type, PictType::I);
        assert_eq!(info.repeat_pict, 1);
        assert_eq!((codec.width, codec.height), (320, 240));
        assert!(codec.extradata.starts_with(&START_CODE));

        let mut info = FrameInfo::default();
        p.inspect(&access_unit(false, 6), &mut info, &mut codec);
        assert_eq!(info.key_frame, 0);
        assert_eq!(info.pict_type, PictType::B);
    }

    #[test]
    fn unescape_drops_emulation_bytes() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1, 0, 0, 3, 0]), vec![0, 0, 1, 0, 0, 0]);
    }
}
