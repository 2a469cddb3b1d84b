//! Format detection.
//!
//! Every registered format scores the probe window; the strict maximum wins
//! and ties detect nothing. [`probe_input_buffer`] grows the window until a
//! format is confident enough, then hands the bytes back to the I/O context
//! so nothing is re-read.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{DemuxError, Result};
use crate::format::{FormatRegistry, InputFormat, InputFormatFlags, ProbeData};
use crate::io::IoContext;

pub const SCORE_MAX: i32 = 100;
pub const SCORE_MIME: i32 = 75;
pub const SCORE_EXTENSION: i32 = 50;
/// Below this a match is treated as a guess.
pub const SCORE_RETRY: i32 = SCORE_MAX / 4;
/// Acceptance bar for codec probing of a single stream.
pub const SCORE_STREAM_RETRY: i32 = SCORE_MAX / 4 - 1;

pub const PROBE_BUF_MIN: usize = 2048;
pub const PROBE_BUF_MAX: usize = 1 << 20;

const ID3V2_HEADER_SIZE: usize = 10;

/// Length of an ID3v2 tag (header, body and optional footer) starting at
/// `buf[0]`.
pub fn id3v2_tag_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < ID3V2_HEADER_SIZE || &buf[..3] != b"ID3" || buf[3] == 0xff || buf[4] == 0xff {
        return None;
    }
    if buf[6..10].iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let body = ((buf[6] as usize) << 21) | ((buf[7] as usize) << 14) | ((buf[8] as usize) << 7) | buf[9] as usize;
    let footer = if buf[5] & 0x10 != 0 { ID3V2_HEADER_SIZE } else { 0 };
    Some(body + ID3V2_HEADER_SIZE + footer)
}

/// Case-insensitive match of the final extension of `filename` against a
/// comma separated list.
pub fn extension_matches(filename: &str, extensions: &str) -> bool {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    if ext.is_empty() || ext.contains('/') {
        return false;
    }
    extensions.split(',').map(str::trim).any(|e| !e.is_empty() && e.eq_ignore_ascii_case(ext))
}

fn mime_matches(mime: Option<&str>, mime_types: &str) -> bool {
    let Some(mime) = mime else {
        return false;
    };
    let mime = mime.split(';').next().unwrap_or(mime).trim();
    !mime.is_empty() && mime_types.split(',').map(str::trim).any(|m| m.eq_ignore_ascii_case(mime))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Id3Lead {
    None,
    /// The tag leaves less probe data behind it than it occupies.
    AlmostGreaterThanProbe,
    /// The whole window is tag.
    GreaterThanProbe,
    GreaterThanMaxProbe,
}

/// Scores every format against `pd`; returns the unique best and its score.
///
/// With `is_opened` false only formats that open their own input take part,
/// otherwise only formats that read from a byte source.
pub fn probe_input_format(
    pd: &ProbeData<'_>,
    is_opened: bool,
    registry: &FormatRegistry,
) -> (Option<Arc<dyn InputFormat>>, i32) {
    let mut lpd = *pd;
    let mut lead = Id3Lead::None;

    if lpd.buf.len() > ID3V2_HEADER_SIZE {
        if let Some(id3len) = id3v2_tag_len(lpd.buf) {
            if lpd.buf.len() > id3len + 16 {
                if lpd.buf.len() < 2 * id3len + 16 {
                    lead = Id3Lead::AlmostGreaterThanProbe;
                }
                lpd.buf = &lpd.buf[id3len..];
            } else if id3len >= PROBE_BUF_MAX {
                lead = Id3Lead::GreaterThanMaxProbe;
            } else {
                lead = Id3Lead::GreaterThanProbe;
            }
        }
    }

    let mut best: Option<Arc<dyn InputFormat>> = None;
    let mut score_max = 0;

    for fmt in registry.iter() {
        if is_opened == fmt.flags().contains(InputFormatFlags::NOFILE) {
            continue;
        }
        let extension_hit = !fmt.extensions().is_empty() && extension_matches(lpd.filename, fmt.extensions());
        let mut score = match fmt.probe(&lpd) {
            Some(mut s) => {
                if s != 0 {
                    trace!(format = fmt.name(), score = s, size = lpd.buf.len(), "Probing");
                }
                if extension_hit {
                    s = match lead {
                        Id3Lead::None => s.max(1),
                        Id3Lead::GreaterThanProbe | Id3Lead::AlmostGreaterThanProbe => {
                            s.max(SCORE_EXTENSION / 2 - 1)
                        }
                        Id3Lead::GreaterThanMaxProbe => s.max(SCORE_EXTENSION),
                    };
                }
                s
            }
            None if extension_hit => SCORE_EXTENSION,
            None => 0,
        };
        if mime_matches(lpd.mime_type, fmt.mime_types()) && score < SCORE_MIME {
            score = SCORE_MIME;
        }

        if score > score_max {
            score_max = score;
            best = Some(fmt.clone());
        } else if score == score_max {
            best = None;
        }
    }

    if lead == Id3Lead::GreaterThanProbe {
        score_max = score_max.min(SCORE_EXTENSION / 2 - 1);
    }
    (best, score_max)
}

/// Reads growing windows from `io` until a format beats the round's bar.
///
/// The bar is `SCORE_RETRY` while the window can still grow and 0 for the
/// final window. Hitting end of file also drops the bar to 0 and caps the
/// reported score at `SCORE_RETRY`. The consumed bytes are spliced back
/// into `io` whatever the outcome.
pub fn probe_input_buffer(
    io: &mut IoContext,
    filename: &str,
    mime_type: Option<&str>,
    registry: &FormatRegistry,
    max_probe_size: usize,
) -> Result<(Arc<dyn InputFormat>, i32)> {
    let max_probe_size = if max_probe_size == 0 { PROBE_BUF_MAX } else { max_probe_size };
    if max_probe_size < PROBE_BUF_MIN {
        return Err(DemuxError::invalid_data(format!(
            "probe window {} below minimum {}",
            max_probe_size, PROBE_BUF_MIN
        )));
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut found: Option<(Arc<dyn InputFormat>, i32)> = None;
    let mut eof = false;
    let mut failure: Option<DemuxError> = None;
    let mut probe_size = PROBE_BUF_MIN;

    while probe_size <= max_probe_size && found.is_none() && !eof {
        let mut bar = if probe_size < max_probe_size { SCORE_RETRY } else { 0 };

        let have = buf.len();
        buf.resize(probe_size, 0);
        match io.read(&mut buf[have..]) {
            Ok(n) => buf.truncate(have + n),
            Err(DemuxError::Eof) => {
                buf.truncate(have);
                bar = 0;
                eof = true;
            }
            Err(e) => {
                buf.truncate(have);
                failure = Some(e);
                break;
            }
        }

        let pd = ProbeData { filename, buf: &buf, mime_type };
        let (fmt, score) = probe_input_format(&pd, true, registry);
        debug!(size = buf.len(), score, format = fmt.as_ref().map(|f| f.name()), "Probe round");
        if let Some(fmt) = fmt {
            if score > bar {
                let score = if eof { score.min(SCORE_RETRY) } else { score };
                if score <= SCORE_RETRY {
                    warn!(format = fmt.name(), score, "Format detected only with low score, misdetection possible");
                } else {
                    debug!(format = fmt.name(), size = probe_size, score, "Format probed");
                }
                found = Some((fmt, score));
            }
        }

        probe_size = (probe_size << 1).min(max_probe_size.max(probe_size + 1));
    }

    let rewind = io.rewind_with_probe_data(buf);
    if let Some(e) = failure {
        return Err(e);
    }
    rewind?;
    found.ok_or_else(|| DemuxError::unsupported(format!("no format matched '{}'", filename)))
}
