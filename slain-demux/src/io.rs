//! # Buffered I/O Context
//!
//! A single contiguous buffer sits between the demuxers and the protocol.
//!
//! ```text
//!   file offset:   pos - buf_end             pos
//!                     |                       |
//!   buffer:        [  consumed  | unread      ]  free  ]
//!                  0          buf_ptr      buf_end   buffer.len()
//! ```
//!
//! Reads refill only when the cursor runs off `buf_end`; writes accumulate
//! until the buffer fills and then flush through the backend. Seeks are
//! tiered so that slow or streamed sources see as few real seeks as possible:
//!
//! 1. target inside the buffered window: move the cursor;
//! 2. target a short distance ahead (or the source can't seek): read forward;
//! 3. target slightly behind the window: reseek a half buffer earlier, refill,
//!    and retry;
//! 4. anything else: flush and seek the backend.

use bytes::Bytes;

use crate::error::{DemuxError, Result};
use crate::options::{DEFAULT_IO_BUFFER_SIZE, DEFAULT_SHORT_SEEK_THRESHOLD};
use crate::protocol::{MemoryProtocol, Protocol, UrlContext, Whence};

const DYN_BUFFER_IO_SIZE: usize = 1024;
const DYN_BUFFER_MAX: usize = i32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seekability {
    None,
    Normal,
    /// Seeking by time is supported by the transport.
    TimeBased,
}

// ============================================================================
// Backends
// ============================================================================

enum Backend {
    Url(UrlContext),
    Custom(Box<dyn Protocol>),
    Dyn(DynBuffer),
}

impl Backend {
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Backend::Url(url) => url.read(buf),
            Backend::Custom(proto) => proto.read(buf),
            Backend::Dyn(_) => Err(DemuxError::unsupported("dynamic buffer is write-only")),
        }
    }

    fn write_packet(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Backend::Url(url) => url.write(buf),
            Backend::Custom(proto) => proto.write(buf),
            Backend::Dyn(d) => d.write(buf),
        }
    }

    fn can_seek(&self) -> bool {
        match self {
            Backend::Dyn(d) => !d.packetized,
            _ => true,
        }
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        match self {
            Backend::Url(url) => url.seek(offset, whence),
            Backend::Custom(proto) => proto.seek(offset, whence),
            Backend::Dyn(d) => d.seek(offset, whence),
        }
    }

    fn short_seek_threshold(&self) -> Option<i32> {
        match self {
            Backend::Url(url) => url.short_seek_threshold(),
            Backend::Custom(proto) => proto.short_seek_threshold(),
            Backend::Dyn(_) => None,
        }
    }

    fn can_read(&self) -> bool {
        !matches!(self, Backend::Dyn(_))
    }
}

/// Growable in-memory sink behind `open_dyn_buf`.
struct DynBuffer {
    data: Vec<u8>,
    pos: usize,
    size: usize,
    packetized: bool,
}

impl DynBuffer {
    fn new(packetized: bool) -> Self {
        Self { data: Vec::new(), pos: 0, size: 0, packetized }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.packetized {
            let len = u32::try_from(buf.len()).map_err(|_| DemuxError::OutOfRange)?;
            self.append(&len.to_be_bytes())?;
        }
        self.append(buf)?;
        Ok(buf.len())
    }

    fn append(&mut self, buf: &[u8]) -> Result<()> {
        let new_size = self.pos.checked_add(buf.len()).ok_or(DemuxError::OutOfRange)?;
        if new_size > DYN_BUFFER_MAX {
            return Err(DemuxError::OutOfRange);
        }

        if new_size > self.data.len() {
            let mut alloc = if self.data.is_empty() { new_size } else { self.data.len() };
            while new_size > alloc {
                alloc += alloc / 2 + 1;
            }
            alloc = alloc.min(DYN_BUFFER_MAX);
            self.data
                .try_reserve(alloc - self.data.len())
                .map_err(|_| DemuxError::OutOfMemory)?;
            self.data.resize(alloc, 0);
        }

        self.data[self.pos..new_size].copy_from_slice(buf);
        self.pos = new_size;
        self.size = self.size.max(self.pos);
        Ok(())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = match whence {
            Whence::Start => offset,
            Whence::Current => offset + self.pos as i64,
            Whence::End => offset + self.size as i64,
            Whence::Size => return Ok(self.size as i64),
        };
        if target < 0 {
            return Err(DemuxError::invalid_data("seek before start of dynamic buffer"));
        }
        if target > DYN_BUFFER_MAX as i64 {
            return Err(DemuxError::OutOfRange);
        }
        self.pos = target as usize;
        Ok(target)
    }

    fn allocated(&self) -> usize {
        self.data.len()
    }
}

// ============================================================================
// IoContext
// ============================================================================

pub struct IoContext {
    buffer: Vec<u8>,
    orig_buffer_size: usize,
    buf_ptr: usize,
    buf_end: usize,
    buf_ptr_max: usize,
    /// File offset of `buf_end` when reading, of the buffer start when writing.
    pos: i64,
    eof_reached: bool,
    error: Option<DemuxError>,
    write_flag: bool,
    seekable: Seekability,
    max_packet_size: usize,
    short_seek_threshold: i32,
    seek_count: u64,
    bytes_read: i64,
    backend: Backend,
}

impl IoContext {
    fn with_backend(backend: Backend, buffer_size: usize, write: bool, seekable: Seekability) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            buffer: vec![0u8; buffer_size],
            orig_buffer_size: buffer_size,
            buf_ptr: 0,
            buf_end: if write { buffer_size } else { 0 },
            buf_ptr_max: 0,
            pos: 0,
            eof_reached: false,
            error: None,
            write_flag: write,
            seekable,
            max_packet_size: 0,
            short_seek_threshold: DEFAULT_SHORT_SEEK_THRESHOLD,
            seek_count: 0,
            bytes_read: 0,
            backend,
        }
    }

    /// Wraps an opened URL.
    pub fn from_url(url: UrlContext, buffer_size: usize, write: bool) -> Self {
        let seekable = if url.is_streamed() { Seekability::None } else { Seekability::Normal };
        Self::with_backend(Backend::Url(url), buffer_size, write, seekable)
    }

    /// Wraps a caller supplied transport.
    pub fn from_protocol(proto: Box<dyn Protocol>, buffer_size: usize, write: bool) -> Self {
        let seekable = if proto.is_streamed() { Seekability::None } else { Seekability::Normal };
        Self::with_backend(Backend::Custom(proto), buffer_size, write, seekable)
    }

    /// Read-only context over an in-memory buffer.
    pub fn from_bytes(data: Bytes) -> Self {
        Self::from_protocol(Box::new(MemoryProtocol::new(data)), DEFAULT_IO_BUFFER_SIZE, false)
    }

    /// Growable in-memory output buffer.
    pub fn open_dyn_buf() -> Self {
        Self::with_backend(Backend::Dyn(DynBuffer::new(false)), DYN_BUFFER_IO_SIZE, true, Seekability::Normal)
    }

    /// Output buffer that frames every flushed chunk with a 32-bit big-endian
    /// length. Each chunk is at most `max_packet_size` bytes.
    pub fn open_dyn_packet_buf(max_packet_size: usize) -> Result<Self> {
        if max_packet_size == 0 {
            return Err(DemuxError::invalid_data("packet size must be positive"));
        }
        let mut ctx =
            Self::with_backend(Backend::Dyn(DynBuffer::new(true)), max_packet_size, true, Seekability::None);
        ctx.max_packet_size = max_packet_size;
        Ok(ctx)
    }

    /// Flushes a dynamic buffer and returns everything written to it.
    pub fn close_dyn_buf(mut self) -> Result<Bytes> {
        self.flush()?;
        match self.backend {
            Backend::Dyn(mut d) => {
                d.data.truncate(d.size);
                Ok(Bytes::from(d.data))
            }
            _ => Err(DemuxError::unsupported("not a dynamic buffer")),
        }
    }

    /// Closes the underlying transport.
    pub fn close(mut self) -> Result<()> {
        if self.write_flag {
            self.flush()?;
        }
        match self.backend {
            Backend::Url(url) => url.close(),
            Backend::Custom(mut proto) => proto.close(),
            Backend::Dyn(_) => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn seekable(&self) -> Seekability {
        self.seekable
    }

    pub fn set_seekable(&mut self, seekable: Seekability) {
        self.seekable = seekable;
    }

    pub fn is_write(&self) -> bool {
        self.write_flag
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Real backend seeks issued so far.
    pub fn seek_count(&self) -> u64 {
        self.seek_count
    }

    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    pub fn set_short_seek_threshold(&mut self, threshold: i32) {
        self.short_seek_threshold = threshold;
    }

    /// Latched error, if one has been observed.
    pub fn error(&self) -> Option<&DemuxError> {
        self.error.as_ref()
    }

    /// The URL context behind this I/O, if it was opened from one.
    pub fn url_context(&mut self) -> Option<&mut UrlContext> {
        match &mut self.backend {
            Backend::Url(url) => Some(url),
            _ => None,
        }
    }

    /// Bytes between the cursor and the end of the buffered window.
    pub fn buffered_remaining(&self) -> usize {
        self.buf_end - self.buf_ptr
    }

    fn buffer_start_pos(&self) -> i64 {
        if self.write_flag {
            self.pos
        } else {
            self.pos - self.buf_end as i64
        }
    }

    pub fn tell(&self) -> i64 {
        self.buffer_start_pos() + self.buf_ptr as i64
    }

    /// End of stream check. Clears a stale eof flag by trying one refill.
    pub fn feof(&mut self) -> bool {
        if self.eof_reached {
            self.eof_reached = false;
            self.fill_buffer();
        }
        self.eof_reached
    }

    fn take_error(&self) -> DemuxError {
        match &self.error {
            Some(e) => e.duplicate(),
            None => DemuxError::Eof,
        }
    }

    // ------------------------------------------------------------------------
    // Refill
    // ------------------------------------------------------------------------

    fn set_buf_size(&mut self, size: usize) {
        self.buffer = vec![0u8; size];
        self.buf_ptr = 0;
        self.buf_end = if self.write_flag { size } else { 0 };
        self.buf_ptr_max = 0;
    }

    fn fill_buffer(&mut self) {
        let max_buffer_size = if self.max_packet_size > 0 { self.max_packet_size } else { DEFAULT_IO_BUFFER_SIZE };
        let mut dst = if self.buf_end + max_buffer_size <= self.buffer.len() { self.buf_end } else { 0 };
        let mut len = self.buffer.len() - dst;

        if !self.backend.can_read() && self.buf_ptr >= self.buf_end {
            self.eof_reached = true;
        }
        if self.eof_reached {
            return;
        }

        if self.buffer.len() > self.orig_buffer_size && len >= self.orig_buffer_size {
            if dst == 0 && self.buf_ptr != 0 {
                self.set_buf_size(self.orig_buffer_size);
                dst = 0;
            }
            len = self.orig_buffer_size.min(self.buffer.len() - dst);
        }

        match self.backend.read_packet(&mut self.buffer[dst..dst + len]) {
            Ok(0) | Err(DemuxError::Eof) => self.eof_reached = true,
            Ok(n) => {
                self.pos += n as i64;
                self.buf_ptr = dst;
                self.buf_end = dst + n;
                self.bytes_read += n as i64;
            }
            Err(e) => {
                tracing::debug!(offset = self.pos, error = %e, "Refill failed");
                self.eof_reached = true;
                self.error = Some(e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Reads up to `buf.len()` bytes. Errors only when nothing could be read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let total = buf.len();
        let mut done = 0usize;

        while done < total {
            let avail = self.buf_end.saturating_sub(self.buf_ptr).min(total - done);
            if avail == 0 || self.write_flag {
                if total - done > self.buffer.len() && self.backend.can_read() {
                    match self.backend.read_packet(&mut buf[done..]) {
                        Ok(0) | Err(DemuxError::Eof) => {
                            self.eof_reached = true;
                            break;
                        }
                        Ok(n) => {
                            self.pos += n as i64;
                            self.bytes_read += n as i64;
                            done += n;
                            self.buf_ptr = 0;
                            self.buf_end = 0;
                        }
                        Err(e) => {
                            self.eof_reached = true;
                            self.error = Some(e);
                            break;
                        }
                    }
                } else {
                    self.fill_buffer();
                    if self.buf_end == self.buf_ptr {
                        break;
                    }
                }
            } else {
                buf[done..done + avail].copy_from_slice(&self.buffer[self.buf_ptr..self.buf_ptr + avail]);
                self.buf_ptr += avail;
                done += avail;
            }
        }

        if done == 0 && total > 0 {
            if self.error.is_some() {
                return Err(self.take_error());
            }
            if self.feof() {
                return Err(DemuxError::Eof);
            }
        }
        Ok(done)
    }

    /// Reads exactly `buf.len()` bytes or fails with `InvalidData`.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.read(buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Err(e) if !e.is_eof() => Err(e),
            _ => Err(DemuxError::invalid_data("truncated read")),
        }
    }

    /// Returns whatever is buffered, or a single backend read.
    pub fn read_partial(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.write_flag {
            return Err(DemuxError::unsupported("read on a write context"));
        }
        let mut len = self.buf_end - self.buf_ptr;
        if len == 0 {
            self.buf_ptr = 0;
            self.buf_end = 0;
            match self.backend.read_packet(buf) {
                Ok(0) | Err(DemuxError::Eof) => {
                    self.eof_reached = true;
                    return Err(DemuxError::Eof);
                }
                Ok(n) => {
                    self.pos += n as i64;
                    self.bytes_read += n as i64;
                    return Ok(n);
                }
                Err(e) => {
                    self.eof_reached = true;
                    self.error = Some(e.duplicate());
                    return Err(e);
                }
            }
        }
        len = len.min(buf.len());
        buf[..len].copy_from_slice(&self.buffer[self.buf_ptr..self.buf_ptr + len]);
        self.buf_ptr += len;
        Ok(len)
    }

    /// Reads `n` bytes into a fresh buffer. Short only at end of input.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let mut out = vec![0u8; n];
        let got = if n == 0 { 0 } else { self.read(&mut out)? };
        out.truncate(got);
        Ok(Bytes::from(out))
    }

    pub fn r8(&mut self) -> Result<u8> {
        if self.buf_ptr >= self.buf_end {
            self.fill_buffer();
        }
        if self.buf_ptr < self.buf_end {
            let b = self.buffer[self.buf_ptr];
            self.buf_ptr += 1;
            return Ok(b);
        }
        Err(self.take_error())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        if self.buf_end - self.buf_ptr >= N {
            out.copy_from_slice(&self.buffer[self.buf_ptr..self.buf_ptr + N]);
            self.buf_ptr += N;
            return Ok(out);
        }
        for b in out.iter_mut() {
            *b = self.r8()?;
        }
        Ok(out)
    }

    pub fn rl16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn rl24(&mut self) -> Result<u32> {
        let b: [u8; 3] = self.read_array()?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn rl32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn rl64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn rb16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn rb24(&mut self) -> Result<u32> {
        let b: [u8; 3] = self.read_array()?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn rb32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn rb64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn skip(&mut self, n: i64) -> Result<i64> {
        self.seek(n, Whence::Current)
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    fn writeout(&mut self, start: usize, end: usize) {
        if self.error.is_none() {
            let data = &self.buffer[start..end];
            if let Err(e) = self.backend.write_packet(data) {
                self.error = Some(e);
            }
        }
        self.pos += (end - start) as i64;
    }

    fn flush_buffer(&mut self) {
        self.buf_ptr_max = self.buf_ptr_max.max(self.buf_ptr);
        if self.write_flag && self.buf_ptr_max > 0 {
            self.writeout(0, self.buf_ptr_max);
        }
        self.buf_ptr = 0;
        self.buf_ptr_max = 0;
        if !self.write_flag {
            self.buf_end = 0;
        }
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if !self.write_flag {
            return Err(DemuxError::unsupported("write on a read context"));
        }
        while !data.is_empty() {
            let len = (self.buf_end - self.buf_ptr).min(data.len());
            self.buffer[self.buf_ptr..self.buf_ptr + len].copy_from_slice(&data[..len]);
            self.buf_ptr += len;
            if self.buf_ptr >= self.buf_end {
                self.flush_buffer();
            }
            data = &data[len..];
        }
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    pub fn w8(&mut self, b: u8) -> Result<()> {
        self.write(&[b])
    }

    pub fn wl16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_le_bytes())
    }

    pub fn wl32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_le_bytes())
    }

    pub fn wb16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn wb32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn wb64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        let seekback = if self.write_flag { self.buf_ptr_max.saturating_sub(self.buf_ptr) } else { 0 };
        self.flush_buffer();
        if seekback > 0 {
            // Restore the logical position after writing out data past the cursor.
            self.seek(-(seekback as i64), Whence::Current)?;
        }
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------------

    /// Total size of the underlying source.
    pub fn size(&mut self) -> Result<i64> {
        if !self.backend.can_seek() {
            return Err(DemuxError::NotSeekable);
        }
        match self.backend.seek(0, Whence::Size) {
            Ok(size) if size >= 0 => Ok(size),
            _ => {
                let size = self.backend.seek(-1, Whence::End)? + 1;
                let pos = self.pos;
                if let Err(e) = self.backend.seek(pos, Whence::Start) {
                    tracing::debug!(offset = pos, error = %e, "Restoring position after size query failed");
                    self.eof_reached = true;
                    self.error = Some(e.duplicate());
                    return Err(e);
                }
                Ok(size)
            }
        }
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let mut offset = offset;
        match whence {
            Whence::Current => {
                let cur = self.tell();
                if offset == 0 {
                    return Ok(cur);
                }
                offset = cur.checked_add(offset).ok_or(DemuxError::OutOfRange)?;
            }
            Whence::Size => return self.size(),
            Whence::End => {
                if self.write_flag {
                    self.flush_buffer();
                }
                let size = self.size()?;
                offset = size.checked_add(offset).ok_or(DemuxError::OutOfRange)?;
            }
            Whence::Start => {}
        }
        self.seek_to(offset, whence == Whence::End)
    }

    fn seek_to(&mut self, offset: i64, from_end: bool) -> Result<i64> {
        if offset < 0 {
            return Err(DemuxError::invalid_data("negative seek target"));
        }

        let short_seek = match self.backend.short_seek_threshold() {
            Some(t) => t.max(self.short_seek_threshold),
            None => self.short_seek_threshold,
        } as i64;

        let buffer_size = self.buf_end as i64;
        let mut pos = self.pos - if self.write_flag { 0 } else { buffer_size };
        let offset1 = offset - pos;
        self.buf_ptr_max = self.buf_ptr_max.max(self.buf_ptr);
        let window = if self.write_flag { self.buf_ptr_max as i64 } else { buffer_size };

        if offset1 >= 0 && offset1 <= window {
            // Inside the buffered window.
            self.buf_ptr = offset1 as usize;
        } else if (self.seekable == Seekability::None || offset1 <= buffer_size + short_seek)
            && !self.write_flag
            && offset1 >= 0
            && !from_end
        {
            while self.pos < offset && !self.eof_reached {
                self.fill_buffer();
            }
            if self.eof_reached {
                return Err(self.take_error());
            }
            self.buf_ptr = (self.buf_end as i64 - (self.pos - offset)) as usize;
        } else if !self.write_flag
            && offset1 < 0
            && -offset1 < buffer_size >> 1
            && self.backend.can_seek()
            && self.seekable != Seekability::None
            && offset > 0
        {
            pos -= (buffer_size >> 1).min(pos);
            self.backend.seek(pos, Whence::Start)?;
            self.seek_count += 1;
            self.buf_ptr = 0;
            self.buf_end = 0;
            self.pos = pos;
            self.eof_reached = false;
            self.fill_buffer();
            return self.seek_to(offset, from_end);
        } else {
            if self.write_flag {
                self.flush_buffer();
            }
            if !self.backend.can_seek() {
                return Err(DemuxError::NotSeekable);
            }
            self.backend.seek(offset, Whence::Start)?;
            self.seek_count += 1;
            if !self.write_flag {
                self.buf_end = 0;
            }
            self.buf_ptr = 0;
            self.buf_ptr_max = 0;
            self.pos = offset;
        }
        self.eof_reached = false;
        Ok(offset)
    }

    /// Grows the buffer so that `n` bytes read from the cursor can be
    /// seeked back over without touching the backend.
    pub fn ensure_seekback(&mut self, n: usize) -> Result<()> {
        if n <= self.buf_end - self.buf_ptr {
            return Ok(());
        }
        let max_buffer_size = if self.max_packet_size > 0 { self.max_packet_size } else { DEFAULT_IO_BUFFER_SIZE };
        if n > i32::MAX as usize - max_buffer_size {
            return Err(DemuxError::OutOfRange);
        }
        let want = n + max_buffer_size - 1;
        if want + self.buf_ptr <= self.buffer.len() || self.seekable != Seekability::None || !self.backend.can_read() {
            return Ok(());
        }

        let unread = self.buf_end - self.buf_ptr;
        if want <= self.buffer.len() {
            self.buffer.copy_within(self.buf_ptr..self.buf_end, 0);
        } else {
            let mut grown = Vec::new();
            grown.try_reserve_exact(want).map_err(|_| DemuxError::OutOfMemory)?;
            grown.extend_from_slice(&self.buffer[self.buf_ptr..self.buf_end]);
            grown.resize(want, 0);
            self.buffer = grown;
        }
        self.buf_ptr = 0;
        self.buf_end = unread;
        Ok(())
    }

    /// Puts bytes consumed during probing back in front of the live buffer.
    ///
    /// `probe` holds the stream bytes from offset 0; they must touch or
    /// overlap what is currently buffered. Afterwards the cursor sits at
    /// offset 0 and nothing is re-read from the backend.
    pub fn rewind_with_probe_data(&mut self, probe: Vec<u8>) -> Result<()> {
        if self.write_flag || !self.backend.can_read() {
            return Err(DemuxError::unsupported("rewind on a write context"));
        }
        let probe_len = probe.len() as i64;
        let buffer_size = self.buf_end as i64;
        let buffer_start = self.pos - buffer_size;
        if buffer_start > probe_len {
            return Err(DemuxError::invalid_data("probe data does not overlap the I/O buffer"));
        }

        let overlap = (probe_len - buffer_start) as usize;
        let mut joined = probe;
        if overlap < self.buf_end {
            joined.extend_from_slice(&self.buffer[overlap..self.buf_end]);
        }
        let new_size = joined.len();
        let alloc = self.buffer.len().max(new_size);
        joined.resize(alloc, 0);

        self.buffer = joined;
        self.buf_ptr = 0;
        self.buf_end = new_size;
        self.pos = new_size as i64;
        self.eof_reached = false;
        Ok(())
    }

    /// Returns the bytes already in the buffer ahead of the cursor, refilling
    /// once if it is empty.
    pub(crate) fn peek_buffered(&mut self) -> &[u8] {
        if self.buf_ptr >= self.buf_end {
            self.fill_buffer();
        }
        &self.buffer[self.buf_ptr..self.buf_end]
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("pos", &self.tell())
            .field("buffer_size", &self.buffer.len())
            .field("buffered", &(self.buf_end - self.buf_ptr))
            .field("eof", &self.eof_reached)
            .field("write", &self.write_flag)
            .field("seekable", &self.seekable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pattern, CountingProtocol};

    #[test]
    fn reads_across_refills() {
        let data = pattern(100_000);
        let mut io = IoContext::from_bytes(Bytes::from(data.clone()));
        let mut out = vec![0u8; 70_000];
        io.read_exact(&mut out).expect("read");
        assert_eq!(&out[..], &data[..70_000]);
        assert_eq!(io.tell(), 70_000);
        assert_eq!(io.r8().expect("byte"), data[70_000]);
    }

    #[test]
    fn integer_readers() {
        let mut io = IoContext::from_bytes(Bytes::from_static(&[
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
        ]));
        assert_eq!(io.rl16().expect("rl16"), 0x0201);
        assert_eq!(io.rb16().expect("rb16"), 0x0304);
        assert_eq!(io.rl32().expect("rl32"), 0x0807_0605);
        assert_eq!(io.rb16().expect("rb16"), 0x090A);
        assert!(io.r8().unwrap_err().is_eof());
    }

    #[test]
    fn in_buffer_seek_skips_protocol() {
        let (proto, stats) = CountingProtocol::new(pattern(200_000));
        let mut io = IoContext::from_protocol(Box::new(proto), 32768, false);

        let mut buf = [0u8; 1000];
        io.read_exact(&mut buf).expect("read");
        let window_start = io.tell() - 1000;
        let window_end = window_start + io.buffered_remaining() as i64 + 1000;

        for target in [0, 10, 500, 999, 20_000, window_end - 1] {
            assert!(target >= window_start && target < window_end);
            assert_eq!(io.seek(target, Whence::Start).expect("seek"), target);
            assert_eq!(io.r8().expect("byte"), pattern_byte(target));
        }
        assert_eq!(stats.seeks(), 0);
        assert_eq!(io.seek_count(), 0);
    }

    fn pattern_byte(pos: i64) -> u8 {
        pattern(pos as usize + 1)[pos as usize]
    }

    #[test]
    fn short_forward_seek_reads_through() {
        let (proto, stats) = CountingProtocol::new(pattern(300_000));
        let mut io = IoContext::from_protocol(Box::new(proto), 32768, false);
        io.r8().expect("prime");
        io.seek(50_000, Whence::Start).expect("seek");
        assert_eq!(io.r8().expect("byte"), pattern_byte(50_000));
        assert_eq!(stats.seeks(), 0);
    }

    #[test]
    fn far_seek_hits_protocol_once() {
        let (proto, stats) = CountingProtocol::new(pattern(300_000));
        let mut io = IoContext::from_protocol(Box::new(proto), 32768, false);
        io.r8().expect("prime");
        io.seek(250_000, Whence::Start).expect("seek");
        assert_eq!(io.r8().expect("byte"), pattern_byte(250_000));
        assert_eq!(stats.seeks(), 1);
        assert_eq!(io.seek_count(), 1);
    }

    #[test]
    fn short_backward_seek_rewinds_half_buffer() {
        let (proto, stats) = CountingProtocol::new(pattern(300_000));
        let mut io = IoContext::from_protocol(Box::new(proto), 32768, false);
        io.seek(100_000, Whence::Start).expect("far seek");
        io.r8().expect("fill");
        let before = stats.seeks();
        io.seek(99_000, Whence::Start).expect("back seek");
        assert_eq!(io.r8().expect("byte"), pattern_byte(99_000));
        assert_eq!(stats.seeks(), before + 1);
        assert_eq!(io.seek_count(), stats.seeks());
    }

    #[test]
    fn unseekable_source_reads_forward() {
        let (mut proto, stats) = CountingProtocol::new(pattern(200_000));
        proto.streamed = true;
        let mut io = IoContext::from_protocol(Box::new(proto), 4096, false);
        assert_eq!(io.seekable(), Seekability::None);
        io.seek(150_000, Whence::Start).expect("seek");
        assert_eq!(io.r8().expect("byte"), pattern_byte(150_000));
        assert_eq!(stats.seeks(), 0);
    }

    #[test]
    fn seek_past_end_of_stream_reports_eof() {
        let (mut proto, _) = CountingProtocol::new(pattern(1000));
        proto.streamed = true;
        let mut io = IoContext::from_protocol(Box::new(proto), 4096, false);
        assert!(io.seek(5000, Whence::Start).unwrap_err().is_eof());
    }

    #[test]
    fn seek_current_zero_is_free() {
        let (proto, stats) = CountingProtocol::new(pattern(10));
        let mut io = IoContext::from_protocol(Box::new(proto), 4096, false);
        assert_eq!(io.seek(0, Whence::Current).expect("tell"), 0);
        assert_eq!(stats.reads(), 0);
    }

    #[test]
    fn size_queries_backend() {
        let mut io = IoContext::from_bytes(Bytes::from(pattern(4321)));
        assert_eq!(io.size().expect("size"), 4321);
        assert_eq!(io.seek(-21, Whence::End).expect("seek end"), 4300);
        assert_eq!(io.r8().expect("byte"), pattern_byte(4300));
    }

    /// Answers size queries only through an end seek and cannot go back.
    struct ForwardOnly {
        data: Vec<u8>,
        pos: usize,
    }

    impl Protocol for ForwardOnly {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.pos >= self.data.len() {
                return Err(DemuxError::Eof);
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
            match whence {
                Whence::End => {
                    self.pos = (self.data.len() as i64 + offset) as usize;
                    Ok(self.pos as i64)
                }
                _ => Err(DemuxError::NotSeekable),
            }
        }
    }

    #[test]
    fn failed_restore_after_size_query_is_latched() {
        let proto = ForwardOnly { data: pattern(10_000), pos: 0 };
        let mut io = IoContext::from_protocol(Box::new(proto), 4096, false);
        io.r8().expect("first byte");
        assert!(matches!(io.size(), Err(DemuxError::NotSeekable)));
        assert!(io.error().is_some());

        // The buffered window is still valid; nothing past it is read from the wrong offset.
        let mut rest = vec![0u8; 4095];
        io.read_exact(&mut rest).expect("buffered bytes");
        assert_eq!(rest, pattern(4096)[1..]);
        assert!(io.r8().is_err());
    }

    #[test]
    fn read_exact_reports_truncation() {
        let mut io = IoContext::from_bytes(Bytes::from_static(b"abc"));
        let mut buf = [0u8; 8];
        assert!(matches!(io.read_exact(&mut buf), Err(DemuxError::InvalidData(_))));
    }

    #[test]
    fn large_read_bypasses_buffer() {
        let data = pattern(50_000);
        let (proto, stats) = CountingProtocol::new(data.clone());
        let mut io = IoContext::from_protocol(Box::new(proto), 1024, false);
        let mut out = vec![0u8; 40_000];
        io.read_exact(&mut out).expect("read");
        assert_eq!(out, data[..40_000]);
        assert!(stats.reads() <= 2);
    }

    #[test]
    fn dyn_buf_round_trip() {
        let data = pattern(10_000);
        let mut io = IoContext::open_dyn_buf();
        let mut off = 0;
        let mut step = 1;
        while off < data.len() {
            let end = (off + step).min(data.len());
            io.write(&data[off..end]).expect("write");
            off = end;
            step = step * 3 % 997 + 1;
        }
        let out = io.close_dyn_buf().expect("close");
        assert_eq!(&out[..], &data[..]);

        let mut reader = IoContext::from_bytes(out);
        let mut back = vec![0u8; data.len()];
        reader.read_exact(&mut back).expect("read back");
        assert_eq!(back, data);
    }

    #[test]
    fn dyn_buf_seek_overwrites() {
        let mut io = IoContext::open_dyn_buf();
        io.write(b"hello world").expect("write");
        io.seek(0, Whence::Start).expect("seek");
        io.write(b"J").expect("patch");
        io.seek(0, Whence::End).expect("end");
        io.write(b"!").expect("append");
        let out = io.close_dyn_buf().expect("close");
        assert_eq!(&out[..], b"Jello world!");
    }

    #[test]
    fn dyn_buf_rejects_growth_past_limit() {
        let mut d = DynBuffer::new(false);
        d.seek(i32::MAX as i64 - 2, Whence::Start).expect("seek near limit");
        assert!(matches!(d.write(b"0123456789"), Err(DemuxError::OutOfRange)));
        assert!(matches!(d.seek(i32::MAX as i64 + 1, Whence::Start), Err(DemuxError::OutOfRange)));
        assert_eq!(d.allocated(), 0);
    }

    #[test]
    fn dyn_buf_growth_is_geometric() {
        let mut d = DynBuffer::new(false);
        d.write(&[0u8; 100]).expect("first");
        assert_eq!(d.allocated(), 100);
        d.write(&[0u8; 1]).expect("second");
        assert_eq!(d.allocated(), 151);
    }

    #[test]
    fn dyn_packet_buf_frames_chunks() {
        let mut io = IoContext::open_dyn_packet_buf(4).expect("open");
        io.write(b"abcdef").expect("write");
        let out = io.close_dyn_buf().expect("close");
        assert_eq!(&out[..], b"\x00\x00\x00\x04abcd\x00\x00\x00\x02ef");
    }

    #[test]
    fn rewind_with_probe_data_splices() {
        let data = pattern(100_000);
        let (proto, stats) = CountingProtocol::new(data.clone());
        let mut io = IoContext::from_protocol(Box::new(proto), 32768, false);

        let mut probe = vec![0u8; 2048];
        io.read_exact(&mut probe).expect("probe");
        io.rewind_with_probe_data(probe).expect("rewind");
        assert_eq!(io.tell(), 0);

        let reads_before = stats.reads();
        let mut head = vec![0u8; 4096];
        io.read_exact(&mut head).expect("head");
        assert_eq!(head, data[..4096]);
        assert_eq!(stats.seeks(), 0);
        assert!(stats.reads() >= reads_before);
    }

    #[test]
    fn rewind_rejects_gap() {
        let (proto, _) = CountingProtocol::new(pattern(100_000));
        let mut io = IoContext::from_protocol(Box::new(proto), 1024, false);
        io.seek(50_000, Whence::Start).expect("seek");
        io.r8().expect("fill");
        assert!(io.rewind_with_probe_data(vec![0u8; 10]).is_err());
    }

    #[test]
    fn errors_are_latched() {
        let (mut proto, _) = CountingProtocol::new(pattern(100));
        proto.fail_after = Some(50);
        let mut io = IoContext::from_protocol(Box::new(proto), 16, false);
        let mut buf = [0u8; 64];
        let n = io.read(&mut buf).expect("partial");
        assert_eq!(n, 50);
        assert!(matches!(io.read(&mut buf), Err(DemuxError::Io { .. })));
        assert!(matches!(io.r8(), Err(DemuxError::Io { .. })));
        assert!(io.error().is_some());
    }
}
