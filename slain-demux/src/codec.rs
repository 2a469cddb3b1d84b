//! Codec identifiers and the parameters a demuxer can discover about them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::rational::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    Unknown,
    Video,
    Audio,
    Data,
    Subtitle,
    Attachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CodecId {
    #[default]
    None,
    // Video
    H264,
    Hevc,
    Mpeg1Video,
    Mpeg2Video,
    Mpeg4,
    Mjpeg,
    Png,
    RawVideo,
    // Audio
    Aac,
    Ac3,
    Eac3,
    Dts,
    TrueHd,
    Mp1,
    Mp2,
    Mp3,
    PcmS16Le,
    PcmU8,
    // Subtitle
    DvbSubtitle,
    HdmvPgsSubtitle,
    Text,
    // Data
    Smpte2038,
    Bin,
}

impl CodecId {
    pub fn media_type(self) -> MediaType {
        use CodecId::*;
        match self {
            None => MediaType::Unknown,
            H264 | Hevc | Mpeg1Video | Mpeg2Video | Mpeg4 | Mjpeg | Png | RawVideo => {
                MediaType::Video
            }
            Aac | Ac3 | Eac3 | Dts | TrueHd | Mp1 | Mp2 | Mp3 | PcmS16Le | PcmU8 => {
                MediaType::Audio
            }
            DvbSubtitle | HdmvPgsSubtitle | Text => MediaType::Subtitle,
            Smpte2038 | Bin => MediaType::Data,
        }
    }

    pub fn name(self) -> &'static str {
        use CodecId::*;
        match self {
            None => "none",
            H264 => "h264",
            Hevc => "hevc",
            Mpeg1Video => "mpeg1video",
            Mpeg2Video => "mpeg2video",
            Mpeg4 => "mpeg4",
            Mjpeg => "mjpeg",
            Png => "png",
            RawVideo => "rawvideo",
            Aac => "aac",
            Ac3 => "ac3",
            Eac3 => "eac3",
            Dts => "dts",
            TrueHd => "truehd",
            Mp1 => "mp1",
            Mp2 => "mp2",
            Mp3 => "mp3",
            PcmS16Le => "pcm_s16le",
            PcmU8 => "pcm_u8",
            DvbSubtitle => "dvb_subtitle",
            HdmvPgsSubtitle => "hdmv_pgs_subtitle",
            Text => "text",
            Smpte2038 => "smpte_2038",
            Bin => "bin_data",
        }
    }

    /// Every frame decodes on its own.
    pub fn is_intra_only(self) -> bool {
        use CodecId::*;
        match self.media_type() {
            MediaType::Video => matches!(self, Mjpeg | Png | RawVideo),
            MediaType::Audio => !matches!(self, TrueHd),
            MediaType::Unknown => false,
            _ => true,
        }
    }

    /// Frames may be coded as field pairs; frame durations count fields.
    pub fn has_fields(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::Mpeg1Video | CodecId::Mpeg2Video)
    }

    /// Decoder output order differs from input order in ways a one-slot
    /// delay cannot describe.
    pub fn has_complex_reorder(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::Hevc)
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream properties known without decoding.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CodecParameters {
    pub codec_type: MediaType,
    pub codec_id: CodecId,
    /// Container-level fourcc or stream type.
    pub codec_tag: u32,
    #[serde(skip)]
    pub extradata: Bytes,
    pub bit_rate: i64,
    pub bits_per_coded_sample: u32,
    pub profile: i32,
    pub level: i32,
    // Video
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Rational,
    /// Frame rate signalled by the bitstream.
    pub framerate: Rational,
    /// Number of frames the decoder holds back for reordering.
    pub video_delay: i32,
    // Audio
    pub sample_rate: u32,
    pub channels: u32,
    pub block_align: u32,
    /// Samples per frame, 0 when variable or unknown.
    pub frame_size: u32,
    pub initial_padding: u32,
    pub trailing_padding: u32,
    pub seek_preroll: u32,
}

impl CodecParameters {
    pub fn new(codec_id: CodecId) -> Self {
        Self { codec_type: codec_id.media_type(), codec_id, ..Default::default() }
    }

    pub fn set_codec(&mut self, codec_id: CodecId) {
        self.codec_id = codec_id;
        self.codec_type = codec_id.media_type();
    }

    /// Samples carried by a frame of `frame_bytes`, 0 when it cannot be
    /// worked out from the parameters alone.
    pub fn audio_frame_duration(&self, frame_bytes: usize) -> i64 {
        if self.frame_size > 0 {
            return self.frame_size as i64;
        }
        let bytes = frame_bytes as i64;
        match self.codec_id {
            CodecId::PcmS16Le if self.channels > 0 => bytes / (2 * self.channels as i64),
            CodecId::PcmU8 if self.channels > 0 => bytes / self.channels as i64,
            CodecId::Ac3 => 1536,
            CodecId::Mp1 => 384,
            CodecId::Mp2 => 1152,
            CodecId::Mp3 if self.sample_rate > 0 => {
                if self.sample_rate < 32_000 {
                    576
                } else {
                    1152
                }
            }
            CodecId::Aac if bytes > 0 => 1024,
            _ if self.block_align > 0 && self.bits_per_coded_sample > 0 && self.channels > 0 => {
                bytes * 8 / (self.bits_per_coded_sample as i64 * self.channels as i64)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_types() {
        assert_eq!(CodecId::H264.media_type(), MediaType::Video);
        assert_eq!(CodecId::Eac3.media_type(), MediaType::Audio);
        assert_eq!(CodecId::Smpte2038.media_type(), MediaType::Data);
        assert_eq!(CodecId::None.media_type(), MediaType::Unknown);
    }

    #[test]
    fn intra_only_classes() {
        assert!(CodecId::Aac.is_intra_only());
        assert!(!CodecId::TrueHd.is_intra_only());
        assert!(!CodecId::H264.is_intra_only());
        assert!(CodecId::Mjpeg.is_intra_only());
        assert!(CodecId::Text.is_intra_only());
    }

    #[test]
    fn pcm_frame_duration_from_size() {
        let mut par = CodecParameters::new(CodecId::PcmS16Le);
        par.channels = 2;
        assert_eq!(par.audio_frame_duration(4096), 1024);
        par.frame_size = 960;
        assert_eq!(par.audio_frame_duration(4096), 960);
    }
}
