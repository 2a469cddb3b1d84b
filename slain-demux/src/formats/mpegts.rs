// TS DEMUXER - MPEG Transport Stream
//
// TS is the container for:
// • IPTV streams
// • DVB broadcasts
// • Blu-ray discs (M2TS variant)
// • ATSC broadcasts
//
// Fixed 188-byte packets, optionally followed by a 4-byte (M2TS) or 16-byte
// (FEC) trailer. PAT and PMT sections announce programs and their streams;
// PES packets carry the payload with timestamps in a 90 kHz clock.

use std::collections::{HashMap, VecDeque};

use bytes::BytesMut;
use once_cell::sync::Lazy;
use tracing::{debug, trace, warn};

use crate::codec::{CodecId, MediaType};
use crate::context::FormatContext;
use crate::error::{DemuxError, Result};
use crate::format::{Demuxer, InputFormat, InputFormatFlags, ProbeData};
use crate::io::{IoContext, Seekability};
use crate::packet::{Packet, PacketFlags};
use crate::probe::SCORE_MAX;
use crate::protocol::Whence;
use crate::stream::{Discard, NeedParsing};

// ============================================================================
// Constants
// ============================================================================

const TS_PACKET_SIZE: usize = 188;
const TS_DVHS_PACKET_SIZE: usize = 192;
const TS_FEC_PACKET_SIZE: usize = 204;
const TS_MAX_PACKET_SIZE: usize = 204;
const TS_SYNC_BYTE: u8 = 0x47;

// PIDs
const PAT_PID: u16 = 0x0000;
const NULL_PID: u16 = 0x1FFF;

// Table ids
const PAT_TID: u8 = 0x00;
const PMT_TID: u8 = 0x02;

// Stream types
const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
const STREAM_TYPE_AAC: u8 = 0x0F;
const STREAM_TYPE_MPEG4_VIDEO: u8 = 0x10;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_H265: u8 = 0x24;
const STREAM_TYPE_AC3: u8 = 0x81;
const STREAM_TYPE_DTS: u8 = 0x82;
const STREAM_TYPE_TRUEHD: u8 = 0x83;
const STREAM_TYPE_EAC3_HDMV: u8 = 0x84;
const STREAM_TYPE_DTS_HD: u8 = 0x85;
const STREAM_TYPE_DTS_HD_MA: u8 = 0x86;
const STREAM_TYPE_EAC3: u8 = 0x87;
const STREAM_TYPE_HDMV_PGS: u8 = 0x90;

// Descriptor tags
const DESC_REGISTRATION: u8 = 0x05;
const DESC_ISO639_LANGUAGE: u8 = 0x0A;
const DESC_DVB_SUBTITLE: u8 = 0x59;
const DESC_DVB_AC3: u8 = 0x6A;
const DESC_DVB_EAC3: u8 = 0x7A;
const DESC_DVB_DTS: u8 = 0x7B;

/// Bytes examined when detecting the packet size.
const PROBE_PACKET_MAX_BUF: usize = 8192;
/// Bytes skipped at most while looking for a sync byte.
const MAX_RESYNC_SIZE: usize = 65536;
/// Packets read at most while looking for the program tables.
const MAX_SCAN_PACKETS: usize = 5000;

const CHECK_COUNT: usize = 10;
const CHECK_BLOCK: usize = 100;

// ============================================================================
// CRC (MPEG-2, non-reflected)
// ============================================================================

static CRC_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut c = (i as u32) << 24;
        for _ in 0..8 {
            c = if c & 0x8000_0000 != 0 { (c << 1) ^ 0x04C1_1DB7 } else { c << 1 };
        }
        *entry = c;
    }
    table
});

/// Zero over a section that ends in its own valid CRC.
fn crc32(data: &[u8]) -> u32 {
    data.iter()
        .fold(0xFFFF_FFFF, |crc, &b| (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ b) as usize])
}

// ============================================================================
// TS Packet Header
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TsHeader {
    transport_error: bool,
    payload_unit_start: bool,
    pid: u16,
    adaptation_field_exists: bool,
    payload_exists: bool,
    continuity_counter: u8,
}

impl TsHeader {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != TS_SYNC_BYTE {
            return None;
        }

        Some(Self {
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            payload_exists: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }
}

// ============================================================================
// Adaptation Field
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct AdaptationField {
    length: u8,
    discontinuity: bool,
    random_access: bool,
}

impl AdaptationField {
    /// `data` starts at the length byte.
    fn parse(data: &[u8]) -> Self {
        let length = data.first().copied().unwrap_or(0);
        match data.get(1) {
            Some(&flags) if length > 0 => Self {
                length,
                discontinuity: (flags & 0x80) != 0,
                random_access: (flags & 0x40) != 0,
            },
            _ => Self { length, ..Default::default() },
        }
    }
}

/// Adaptation field and payload offset of a packet.
fn packet_layout(header: &TsHeader, packet: &[u8]) -> (AdaptationField, usize) {
    if header.adaptation_field_exists {
        let af = AdaptationField::parse(&packet[4..]);
        (af, 5 + af.length as usize)
    } else {
        (AdaptationField::default(), 4)
    }
}

// ============================================================================
// PES Parsing
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PesHeader {
    pts: Option<i64>,
    dts: Option<i64>,
    header_len: usize,
}

/// Stream ids whose PES packets have no optional header.
fn pes_has_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF)
}

/// Declared size of the PES starting at `data`, 0 when unbounded.
fn pes_total_size(data: &[u8]) -> usize {
    if data.len() < 6 || data[..3] != [0, 0, 1] {
        return 0;
    }
    match ((data[4] as usize) << 8) | data[5] as usize {
        0 => 0,
        len => 6 + len,
    }
}

fn parse_pes_header(data: &[u8]) -> Option<PesHeader> {
    if data.len() < 6 || data[..3] != [0, 0, 1] {
        return None;
    }
    if !pes_has_header(data[3]) {
        return Some(PesHeader { pts: None, dts: None, header_len: 6 });
    }
    if data.len() < 9 || data[6] & 0xC0 != 0x80 {
        return None;
    }

    let flags = data[7];
    let header_len = 9 + data[8] as usize;
    if data.len() < header_len {
        return None;
    }

    // A PTS without DTS stands for both.
    let (pts, dts) = match flags & 0xC0 {
        0x80 if header_len >= 14 => {
            let pts = parse_timestamp(&data[9..14]);
            (Some(pts), Some(pts))
        }
        0xC0 if header_len >= 19 => (Some(parse_timestamp(&data[9..14])), Some(parse_timestamp(&data[14..19]))),
        _ => (None, None),
    };

    Some(PesHeader { pts, dts, header_len })
}

/// 33-bit timestamp encoded in 5 bytes, in 90 kHz units.
fn parse_timestamp(data: &[u8]) -> i64 {
    (((data[0] as i64) >> 1) & 0x07) << 30
        | ((data[1] as i64) << 22)
        | (((data[2] as i64) >> 1) << 15)
        | ((data[3] as i64) << 7)
        | ((data[4] as i64) >> 1)
}

// ============================================================================
// Descriptors
// ============================================================================

fn codec_for_stream_type(stream_type: u8) -> CodecId {
    match stream_type {
        STREAM_TYPE_MPEG1_VIDEO => CodecId::Mpeg1Video,
        STREAM_TYPE_MPEG2_VIDEO => CodecId::Mpeg2Video,
        STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => CodecId::Mp3,
        STREAM_TYPE_AAC => CodecId::Aac,
        STREAM_TYPE_MPEG4_VIDEO => CodecId::Mpeg4,
        STREAM_TYPE_H264 => CodecId::H264,
        STREAM_TYPE_H265 => CodecId::Hevc,
        STREAM_TYPE_AC3 => CodecId::Ac3,
        STREAM_TYPE_DTS | STREAM_TYPE_DTS_HD | STREAM_TYPE_DTS_HD_MA => CodecId::Dts,
        STREAM_TYPE_TRUEHD => CodecId::TrueHd,
        STREAM_TYPE_EAC3 | STREAM_TYPE_EAC3_HDMV => CodecId::Eac3,
        STREAM_TYPE_HDMV_PGS => CodecId::HdmvPgsSubtitle,
        _ => CodecId::None,
    }
}

#[derive(Debug, Default)]
struct EsDescriptors {
    language: Option<String>,
    codec: Option<CodecId>,
}

fn parse_es_descriptors(data: &[u8]) -> EsDescriptors {
    let mut out = EsDescriptors::default();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let length = data[pos + 1] as usize;
        let Some(body) = data.get(pos + 2..pos + 2 + length) else {
            break;
        };

        match tag {
            DESC_ISO639_LANGUAGE | DESC_DVB_SUBTITLE if length >= 3 => {
                let lang = &body[..3];
                if out.language.is_none() && lang.iter().all(|b| b.is_ascii_alphabetic()) {
                    out.language = Some(String::from_utf8_lossy(lang).to_string());
                }
                if tag == DESC_DVB_SUBTITLE {
                    out.codec = Some(CodecId::DvbSubtitle);
                }
            }
            DESC_REGISTRATION if length >= 4 => {
                let codec = match &body[..4] {
                    b"AC-3" => Some(CodecId::Ac3),
                    b"EAC3" => Some(CodecId::Eac3),
                    b"HEVC" => Some(CodecId::Hevc),
                    b"DTS1" | b"DTS2" | b"DTS3" => Some(CodecId::Dts),
                    _ => None,
                };
                out.codec = out.codec.or(codec);
            }
            DESC_DVB_AC3 => out.codec = Some(CodecId::Ac3),
            DESC_DVB_EAC3 => out.codec = Some(CodecId::Eac3),
            DESC_DVB_DTS => out.codec = Some(CodecId::Dts),
            _ => {}
        }

        pos += 2 + length;
    }

    out
}

// ============================================================================
// Packet size detection
// ============================================================================

/// Sync byte regularity for `packet_size`. In probe mode only packets that
/// carry payload or are null packets count.
fn analyze(buf: &[u8], packet_size: usize, probe: bool) -> i32 {
    let mut stat = [0i32; TS_MAX_PACKET_SIZE];
    let mut stat_all = 0;
    let mut best = 0;

    for i in 0..buf.len().saturating_sub(3) {
        if buf[i] != TS_SYNC_BYTE {
            continue;
        }
        let pid = ((buf[i + 1] as u16 & 0x1F) << 8) | buf[i + 2] as u16;
        let asc = buf[i + 3] & 0x30;
        if !probe || pid == NULL_PID || asc != 0 {
            let x = i % packet_size;
            stat[x] += 1;
            stat_all += 1;
            best = best.max(stat[x]);
        }
    }

    best - (stat_all - 10 * best).max(0) / 10
}

fn detect_packet_size(buf: &[u8]) -> Option<usize> {
    let score = analyze(buf, TS_PACKET_SIZE, false);
    let dvhs_score = analyze(buf, TS_DVHS_PACKET_SIZE, false);
    let fec_score = analyze(buf, TS_FEC_PACKET_SIZE, false);
    trace!(score, dvhs_score, fec_score, "packet size scores");

    if score > fec_score && score > dvhs_score && score > 6 {
        Some(TS_PACKET_SIZE)
    } else if dvhs_score > score && dvhs_score > fec_score && dvhs_score > 6 {
        Some(TS_DVHS_PACKET_SIZE)
    } else if score < fec_score && dvhs_score < fec_score && fec_score > 6 {
        Some(TS_FEC_PACKET_SIZE)
    } else {
        None
    }
}

/// Leaves `io` on the next sync byte.
fn resync(io: &mut IoContext) -> Result<()> {
    for _ in 0..MAX_RESYNC_SIZE {
        if io.r8()? == TS_SYNC_BYTE {
            io.seek(-1, Whence::Current)?;
            return Ok(());
        }
    }
    Err(DemuxError::invalid_data("mpegts resync failed"))
}

// ============================================================================
// Format
// ============================================================================

pub struct MpegTsFormat;

impl InputFormat for MpegTsFormat {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    fn long_name(&self) -> &'static str {
        "MPEG-TS (MPEG-2 Transport Stream)"
    }

    fn extensions(&self) -> &'static str {
        "ts,m2t,m2ts,mts"
    }

    fn mime_types(&self) -> &'static str {
        "video/mp2t"
    }

    fn flags(&self) -> InputFormatFlags {
        InputFormatFlags::SHOW_IDS | InputFormatFlags::TS_DISCONT
    }

    fn probe(&self, pd: &ProbeData<'_>) -> Option<i32> {
        let buf = pd.buf;
        let check_count = buf.len() / TS_FEC_PACKET_SIZE;
        if check_count < CHECK_COUNT {
            return Some(0);
        }

        let mut sumscore = 0i32;
        let mut maxscore = 0i32;
        for i in (0..check_count).step_by(CHECK_BLOCK) {
            let left = (check_count - i).min(CHECK_BLOCK);
            let score = [TS_PACKET_SIZE, TS_DVHS_PACKET_SIZE, TS_FEC_PACKET_SIZE]
                .iter()
                .map(|&size| analyze(&buf[size * i..size * (i + left)], size, true))
                .max()
                .unwrap_or(0);
            sumscore += score;
            maxscore = maxscore.max(score);
        }

        let check_count = check_count as i32;
        let sumscore = sumscore * CHECK_COUNT as i32 / check_count;
        let maxscore = maxscore * CHECK_COUNT as i32 / CHECK_BLOCK as i32;

        let score = if check_count > CHECK_COUNT as i32 && sumscore > 6 {
            SCORE_MAX + sumscore - CHECK_COUNT as i32
        } else if check_count >= CHECK_COUNT as i32 && (sumscore > 6 || maxscore > 6) {
            SCORE_MAX / 2 + sumscore - CHECK_COUNT as i32
        } else if sumscore > 6 {
            2
        } else {
            0
        };
        Some(score.clamp(0, SCORE_MAX))
    }

    fn create(&self) -> Box<dyn Demuxer> {
        Box::new(MpegTsDemuxer::new())
    }
}

// ============================================================================
// TS Demuxer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Pat,
    Pmt { program: u16 },
}

#[derive(Debug)]
struct SectionFilter {
    kind: SectionKind,
    buf: Vec<u8>,
    started: bool,
    version: Option<u8>,
}

impl SectionFilter {
    /// Splits off every complete section at the head of the buffer.
    fn drain_sections(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while self.buf.len() >= 3 {
            if self.buf[0] == 0xFF {
                // stuffing up to the end of the packet
                self.buf.clear();
                self.started = false;
                break;
            }
            let len = 3 + ((((self.buf[1] & 0x0F) as usize) << 8) | self.buf[2] as usize);
            if self.buf.len() < len {
                break;
            }
            out.push(self.buf.drain(..len).collect());
        }
        out
    }
}

#[derive(Debug)]
struct PesFilter {
    stream: usize,
    buf: BytesMut,
    /// Inside a PES; cleared after a seek until the next unit start.
    collecting: bool,
    total: usize,
    pos: i64,
    key: bool,
    corrupt: bool,
}

#[derive(Debug)]
enum Filter {
    Section(SectionFilter),
    Pes(PesFilter),
}

#[derive(Debug)]
struct PidContext {
    last_cc: Option<u8>,
    filter: Filter,
}

impl PidContext {
    fn section(kind: SectionKind) -> Self {
        Self {
            last_cc: None,
            filter: Filter::Section(SectionFilter { kind, buf: Vec::new(), started: false, version: None }),
        }
    }

    fn pes(stream: usize) -> Self {
        Self {
            last_cc: None,
            filter: Filter::Pes(PesFilter {
                stream,
                buf: BytesMut::new(),
                collecting: false,
                total: 0,
                pos: -1,
                key: false,
                corrupt: false,
            }),
        }
    }
}

pub struct MpegTsDemuxer {
    packet_size: usize,
    pids: HashMap<u16, PidContext>,
    ready: VecDeque<Packet>,
    /// Input position after the last packet handed out; any other position
    /// on entry means the caller seeked.
    last_pos: i64,
}

impl MpegTsDemuxer {
    pub fn new() -> Self {
        let mut pids = HashMap::new();
        pids.insert(PAT_PID, PidContext::section(SectionKind::Pat));
        Self { packet_size: TS_PACKET_SIZE, pids, ready: VecDeque::new(), last_pos: -1 }
    }

    /// Whether every program of the PAT has had its PMT parsed.
    fn tables_complete(&self) -> bool {
        let mut pmts = self.pids.values().filter_map(|p| match &p.filter {
            Filter::Section(s) if matches!(s.kind, SectionKind::Pmt { .. }) => Some(s),
            _ => None,
        });
        let mut any = false;
        let all = pmts.all(|s| {
            any = true;
            s.version.is_some()
        });
        any && all
    }

    /// Forgets partial PES data and continuity state.
    fn reset_pes_state(&mut self) {
        for ctx in self.pids.values_mut() {
            ctx.last_cc = None;
            match &mut ctx.filter {
                Filter::Pes(pes) => {
                    pes.buf.clear();
                    pes.collecting = false;
                    pes.corrupt = false;
                }
                Filter::Section(sec) => {
                    sec.buf.clear();
                    sec.started = false;
                }
            }
        }
        self.ready.clear();
    }

    fn read_ts_packet(&self, io: &mut IoContext) -> Result<([u8; TS_PACKET_SIZE], i64)> {
        loop {
            let pos = io.tell();
            let mut buf = [0u8; TS_MAX_PACKET_SIZE];
            let n = io.read(&mut buf[..self.packet_size])?;
            if n < TS_PACKET_SIZE {
                return Err(DemuxError::Eof);
            }
            if buf[0] != TS_SYNC_BYTE {
                trace!(pos, "lost sync");
                io.seek(pos + 1, Whence::Start)?;
                resync(io)?;
                continue;
            }
            let mut packet = [0u8; TS_PACKET_SIZE];
            packet.copy_from_slice(&buf[..TS_PACKET_SIZE]);
            return Ok((packet, pos));
        }
    }

    fn handle_packet(&mut self, ctx: &mut FormatContext, packet: &[u8], pos: i64) {
        let Some(header) = TsHeader::parse(packet) else {
            return;
        };
        if header.pid == NULL_PID {
            return;
        }
        let Some(pid_ctx) = self.pids.get_mut(&header.pid) else {
            return;
        };

        let (af, offset) = packet_layout(&header, packet);

        if let Some(last) = pid_ctx.last_cc {
            let expected = if header.payload_exists { (last + 1) & 0x0F } else { last };
            if !af.discontinuity && header.continuity_counter != expected {
                warn!(
                    pid = header.pid,
                    expected,
                    got = header.continuity_counter,
                    "Continuity check failed"
                );
                if let Filter::Pes(pes) = &mut pid_ctx.filter {
                    pes.corrupt = true;
                }
            }
        }
        pid_ctx.last_cc = Some(header.continuity_counter);
        if header.transport_error {
            if let Filter::Pes(pes) = &mut pid_ctx.filter {
                pes.corrupt = true;
            }
        }

        if !header.payload_exists || offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if matches!(pid_ctx.filter, Filter::Section(_)) {
            self.push_section(ctx, header.pid, header.payload_unit_start, payload);
        } else {
            self.push_pes(ctx, header.pid, header.payload_unit_start, af.random_access, payload, pos);
        }
    }

    fn push_pes(&mut self, ctx: &FormatContext, pid: u16, unit_start: bool, rai: bool, payload: &[u8], pos: i64) {
        let Some(PidContext { filter: Filter::Pes(pes), .. }) = self.pids.get_mut(&pid) else {
            return;
        };
        if ctx.streams.get(pes.stream).map_or(true, |st| st.discard >= Discard::All) {
            pes.buf.clear();
            pes.collecting = false;
            return;
        }

        if unit_start {
            if pes.collecting && !pes.buf.is_empty() {
                if let Some(pkt) = finish_pes(ctx, pes) {
                    self.ready.push_back(pkt);
                }
            }
            pes.buf.clear();
            pes.buf.extend_from_slice(payload);
            pes.collecting = true;
            pes.total = pes_total_size(payload);
            pes.pos = pos;
            pes.key = rai;
        } else if pes.collecting {
            pes.buf.extend_from_slice(payload);
        } else {
            return;
        }

        if pes.total > 0 && pes.buf.len() >= pes.total {
            pes.buf.truncate(pes.total);
            if let Some(pkt) = finish_pes(ctx, pes) {
                self.ready.push_back(pkt);
            }
        }
    }

    fn push_section(&mut self, ctx: &mut FormatContext, pid: u16, unit_start: bool, payload: &[u8]) {
        let Some(PidContext { filter: Filter::Section(sec), .. }) = self.pids.get_mut(&pid) else {
            return;
        };

        let mut sections = Vec::new();
        if unit_start {
            let pointer = payload[0] as usize;
            let rest = &payload[1..];
            if sec.started {
                sec.buf.extend_from_slice(&rest[..pointer.min(rest.len())]);
                sections.extend(sec.drain_sections());
            }
            sec.buf.clear();
            sec.started = true;
            if let Some(new) = rest.get(pointer..) {
                sec.buf.extend_from_slice(new);
            }
        } else if sec.started {
            sec.buf.extend_from_slice(payload);
        } else {
            return;
        }
        sections.extend(sec.drain_sections());

        let kind = sec.kind;
        for section in sections {
            self.handle_section(ctx, pid, kind, &section);
        }
    }

    fn handle_section(&mut self, ctx: &mut FormatContext, pid: u16, kind: SectionKind, section: &[u8]) {
        if section.len() < 12 {
            return;
        }
        if crc32(section) != 0 {
            warn!(pid, table_id = section[0], "section CRC mismatch, ignoring");
            return;
        }
        let version = (section[5] >> 1) & 0x1F;
        if section[5] & 0x01 == 0 {
            return;
        }
        if let Some(PidContext { filter: Filter::Section(sec), .. }) = self.pids.get_mut(&pid) {
            if sec.version == Some(version) {
                return;
            }
            sec.version = Some(version);
        }

        match kind {
            SectionKind::Pat if section[0] == PAT_TID => self.parse_pat(ctx, section),
            SectionKind::Pmt { program } if section[0] == PMT_TID => self.parse_pmt(ctx, program, section),
            _ => {}
        }
    }

    fn parse_pat(&mut self, ctx: &mut FormatContext, section: &[u8]) {
        let end = section.len() - 4;
        let mut pos = 8;

        while pos + 4 <= end {
            let program_num = ((section[pos] as u16) << 8) | section[pos + 1] as u16;
            let pmt_pid = (((section[pos + 2] as u16) & 0x1F) << 8) | section[pos + 3] as u16;
            pos += 4;

            // program 0 points at the network information table
            if program_num == 0 {
                continue;
            }
            debug!(program = program_num, pmt_pid, "PAT entry");
            let program = ctx.new_program(program_num as i32);
            program.program_num = program_num as i32;
            program.pmt_pid = pmt_pid as i32;
            self.pids
                .entry(pmt_pid)
                .or_insert_with(|| PidContext::section(SectionKind::Pmt { program: program_num }));
        }
    }

    fn parse_pmt(&mut self, ctx: &mut FormatContext, program: u16, section: &[u8]) {
        let end = section.len() - 4;
        let pcr_pid = (((section[8] as u16) & 0x1F) << 8) | section[9] as u16;
        let program_info_length = (((section[10] as usize) & 0x0F) << 8) | section[11] as usize;
        debug!(program, pcr_pid, "PMT");

        let mut pos = 12 + program_info_length;
        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = (((section[pos + 1] as u16) & 0x1F) << 8) | section[pos + 2] as u16;
            let es_info_length = (((section[pos + 3] as usize) & 0x0F) << 8) | section[pos + 4] as usize;
            let desc_end = (pos + 5 + es_info_length).min(end);
            let descriptors = parse_es_descriptors(&section[pos + 5..desc_end]);
            pos += 5 + es_info_length;

            self.add_elementary_stream(ctx, program, stream_type, pid, descriptors);
        }
    }

    fn add_elementary_stream(
        &mut self,
        ctx: &mut FormatContext,
        program: u16,
        stream_type: u8,
        pid: u16,
        descriptors: EsDescriptors,
    ) {
        match self.pids.get(&pid) {
            Some(PidContext { filter: Filter::Pes(pes), .. }) => {
                ctx.add_stream_to_program(program as i32, pes.stream);
                return;
            }
            Some(_) => {
                warn!(pid, "PID already carries a table, ignoring stream");
                return;
            }
            None => {}
        }

        let codec = match codec_for_stream_type(stream_type) {
            CodecId::None => descriptors.codec.unwrap_or(CodecId::None),
            codec => codec,
        };

        let st = match ctx.new_stream() {
            Ok(st) => st,
            Err(e) => {
                warn!(pid, error = %e, "cannot add stream");
                return;
            }
        };
        st.id = pid as i32;
        st.codecpar.set_codec(codec);
        st.need_parsing = NeedParsing::Full;
        if codec == CodecId::None {
            st.request_probe = 1;
        }
        if let Some(lang) = descriptors.language {
            st.metadata.insert("language".to_string(), lang);
        }
        let index = st.index;
        ctx.set_pts_info(index, 33, 1, 90_000);
        ctx.add_stream_to_program(program as i32, index);
        self.pids.insert(pid, PidContext::pes(index));
        debug!(pid, stream = index, stream_type, codec = %codec, "new PES stream");
    }

    /// Emits every partially assembled PES, in stream order.
    fn flush_pes(&mut self, ctx: &FormatContext) {
        let mut pending: Vec<&mut PesFilter> = self
            .pids
            .values_mut()
            .filter_map(|p| match &mut p.filter {
                Filter::Pes(pes) if pes.collecting && !pes.buf.is_empty() => Some(pes),
                _ => None,
            })
            .collect();
        pending.sort_by_key(|pes| pes.stream);
        for pes in pending {
            if let Some(pkt) = finish_pes(ctx, pes) {
                self.ready.push_back(pkt);
            }
        }
    }

    fn next_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet> {
        loop {
            if let Some(pkt) = self.ready.pop_front() {
                return Ok(pkt);
            }
            let read = self.read_ts_packet(ctx.io()?);
            match read {
                Ok((packet, pos)) => self.handle_packet(ctx, &packet, pos),
                Err(e) if e.is_eof() => {
                    self.flush_pes(ctx);
                    return self.ready.pop_front().ok_or(DemuxError::Eof);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for MpegTsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns the collected bytes of a PES into a packet.
fn finish_pes(ctx: &FormatContext, pes: &mut PesFilter) -> Option<Packet> {
    let data = std::mem::take(&mut pes.buf).freeze();
    let corrupt = std::mem::take(&mut pes.corrupt);
    pes.collecting = false;

    let Some(header) = parse_pes_header(&data) else {
        warn!(stream = pes.stream, size = data.len(), "invalid PES header, dropping packet");
        return None;
    };
    let mut pkt = Packet::new(pes.stream, data.slice(header.header_len..));
    pkt.pts = header.pts;
    pkt.dts = header.dts;
    pkt.pos = Some(pes.pos);
    let audio = ctx.streams.get(pes.stream).is_some_and(|st| st.media_type() == MediaType::Audio);
    if pes.key || audio {
        pkt.flags |= PacketFlags::KEY;
    }
    if corrupt {
        pkt.flags |= PacketFlags::CORRUPT;
    }
    Some(pkt)
}

impl Demuxer for MpegTsDemuxer {
    fn read_header(&mut self, ctx: &mut FormatContext) -> Result<()> {
        let scan_budget = usize::try_from(ctx.options.probesize).unwrap_or(0);
        let io = ctx.io()?;
        let start = io.tell();
        io.ensure_seekback(PROBE_PACKET_MAX_BUF)?;
        let mut probe = vec![0u8; PROBE_PACKET_MAX_BUF];
        let n = match io.read(&mut probe) {
            Ok(n) => n,
            Err(e) if e.is_eof() => 0,
            Err(e) => return Err(e),
        };
        probe.truncate(n);
        self.packet_size =
            detect_packet_size(&probe).ok_or_else(|| DemuxError::invalid_data("no MPEG-TS packet size found"))?;

        io.seek(start, Whence::Start)?;
        resync(io)?;
        let scan_start = io.tell();
        // Streamed input can only come back to `scan_start` through the buffer.
        let scan_packets = if io.seekable() == Seekability::None {
            MAX_SCAN_PACKETS.min(scan_budget / self.packet_size).max(1)
        } else {
            MAX_SCAN_PACKETS
        };
        io.ensure_seekback(scan_packets * self.packet_size)?;
        debug!(packet_size = self.packet_size, offset = scan_start, "scanning for program tables");

        // Streams can still appear later through new PMTs.
        ctx.set_no_header();

        for _ in 0..scan_packets {
            if self.tables_complete() {
                break;
            }
            let read = self.read_ts_packet(ctx.io()?);
            let (packet, pos) = match read {
                Ok(p) => p,
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e),
            };
            self.handle_packet(ctx, &packet, pos);
        }

        ctx.io()?.seek(scan_start, Whence::Start)?;
        self.reset_pes_state();
        self.last_pos = scan_start;
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut FormatContext) -> Result<Packet> {
        if ctx.io()?.tell() != self.last_pos {
            trace!(from = self.last_pos, "input moved, dropping partial PES data");
            self.reset_pes_state();
        }
        let result = self.next_packet(ctx);
        if let Ok(io) = ctx.io() {
            self.last_pos = io.tell();
        }
        result
    }

    fn read_close(&mut self, _ctx: &mut FormatContext) -> Result<()> {
        self.pids.clear();
        self.ready.clear();
        Ok(())
    }

    fn has_read_timestamp(&self) -> bool {
        true
    }

    /// Looks for a PES start of `stream` that is a random access point (or
    /// any PES start for audio), scanning packet-aligned positions.
    fn read_timestamp(&mut self, ctx: &mut FormatContext, stream: usize, pos: &mut i64, pos_limit: i64) -> Option<i64> {
        let st = ctx.streams.get(stream)?;
        let pid = u16::try_from(st.id).ok()?;
        let audio = st.media_type() == MediaType::Audio;
        let packet_size = self.packet_size as i64;
        let data_offset = ctx.data_offset;

        let mut p = data_offset + ((*pos - data_offset).max(0) + packet_size - 1) / packet_size * packet_size;
        let io = ctx.io().ok()?;
        loop {
            if p > pos_limit {
                return None;
            }
            io.seek(p, Whence::Start).ok()?;
            let mut buf = [0u8; TS_PACKET_SIZE];
            if io.read(&mut buf).ok()? < TS_PACKET_SIZE {
                return None;
            }
            if let Some(header) = TsHeader::parse(&buf) {
                if header.pid == pid && header.payload_unit_start && header.payload_exists {
                    let (af, offset) = packet_layout(&header, &buf);
                    if (af.random_access || audio) && offset < TS_PACKET_SIZE {
                        if let Some(ts) = parse_pes_header(&buf[offset..]).and_then(|h| h.dts.or(h.pts)) {
                            *pos = p;
                            return Some(ts);
                        }
                    }
                }
            }
            p += packet_size;
        }
    }
}
