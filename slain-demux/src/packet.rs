//! Demuxed packets and their side data.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        const KEY = 0x0001;
        /// Payload is known to be damaged.
        const CORRUPT = 0x0002;
        /// Needed for decoding but should not be output.
        const DISCARD = 0x0004;
    }
}

/// Out-of-band data travelling with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideData {
    /// Samples to drop from the start and end of the decoded frame.
    SkipSamples {
        skip_start: u32,
        skip_end: u32,
        reason_start: u8,
        reason_end: u8,
    },
    /// Replacement codec extradata, effective from this packet on.
    NewExtradata(Bytes),
    ParamChange(Bytes),
    Other { kind: u32, data: Bytes },
}

impl SideData {
    /// Wire layout used by decoders: LE32 skip, LE32 discard, u8 reason, u8 reason.
    pub fn skip_samples_bytes(&self) -> Option<Bytes> {
        match self {
            SideData::SkipSamples { skip_start, skip_end, reason_start, reason_end } => {
                let mut buf = BytesMut::with_capacity(10);
                buf.put_u32_le(*skip_start);
                buf.put_u32_le(*skip_end);
                buf.put_u8(*reason_start);
                buf.put_u8(*reason_end);
                Some(buf.freeze())
            }
            _ => None,
        }
    }
}

/// One access unit (or container chunk before parsing).
///
/// Timestamps are in the owning stream's time base. Cloning shares the
/// payload.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub data: Bytes,
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// 0 when unknown.
    pub duration: i64,
    /// Byte offset in the source, if known.
    pub pos: Option<i64>,
    pub flags: PacketFlags,
    pub side_data: Vec<SideData>,
}

impl Packet {
    pub fn new(stream_index: usize, data: Bytes) -> Self {
        Self { data, stream_index, ..Default::default() }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key(&self) -> bool {
        self.flags.contains(PacketFlags::KEY)
    }

    pub fn is_corrupt(&self) -> bool {
        self.flags.contains(PacketFlags::CORRUPT)
    }

    pub fn skip_samples(&self) -> Option<(u32, u32)> {
        self.side_data.iter().find_map(|sd| match sd {
            SideData::SkipSamples { skip_start, skip_end, .. } => Some((*skip_start, *skip_end)),
            _ => None,
        })
    }

    /// Replaces any existing side data of the same kind.
    pub fn set_side_data(&mut self, sd: SideData) {
        let kind = std::mem::discriminant(&sd);
        self.side_data.retain(|s| std::mem::discriminant(s) != kind);
        self.side_data.push(sd);
    }

    pub fn take_side_data(&mut self) -> Vec<SideData> {
        std::mem::take(&mut self.side_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_payload() {
        let pkt = Packet::new(0, Bytes::from_static(b"abcd"));
        let copy = pkt.clone();
        assert_eq!(pkt.data.as_ptr(), copy.data.as_ptr());
        assert_eq!(copy.size(), 4);
    }

    #[test]
    fn skip_samples_layout() {
        let sd = SideData::SkipSamples { skip_start: 1024, skip_end: 7, reason_start: 0, reason_end: 1 };
        let raw = sd.skip_samples_bytes().expect("layout");
        assert_eq!(&raw[..], &[0x00, 0x04, 0, 0, 7, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn set_side_data_replaces_same_kind() {
        let mut pkt = Packet::default();
        pkt.set_side_data(SideData::SkipSamples { skip_start: 1, skip_end: 0, reason_start: 0, reason_end: 0 });
        pkt.set_side_data(SideData::NewExtradata(Bytes::from_static(b"x")));
        pkt.set_side_data(SideData::SkipSamples { skip_start: 9, skip_end: 2, reason_start: 0, reason_end: 0 });
        assert_eq!(pkt.side_data.len(), 2);
        assert_eq!(pkt.skip_samples(), Some((9, 2)));
    }
}
