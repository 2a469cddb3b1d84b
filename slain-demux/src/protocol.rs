//! Byte-source protocols.
//!
//! A [`ProtocolFactory`] turns a URL into a live [`Protocol`] handle. The
//! [`UrlContext`] wrapper adds what every transport needs on top: bounded
//! retries on would-block, an advisory timeout, the interrupt callback and
//! the streamed/seekable classification.
//!
//! Supported URL forms:
//! - `file:/path/to/movie.ts`, `file:///path`, or a bare path
//! - `memory:<name>` for buffers registered with [`register_memory_buffer`]

use std::collections::HashMap;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use url::Url;

use crate::error::{DemuxError, Result};
use crate::options::{list_contains, InterruptCallback};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    /// Query the total size without moving.
    Size,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// Return would-block to the caller instead of retrying.
        const NONBLOCK = 0x8;
    }
}

const URL_SCHEME_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+-.";

const FAST_RETRIES: u32 = 5;

/// A live connection to a byte source.
///
/// `read` returns `Ok(n)` with `n > 0`, `Err(Eof)` at the end, or
/// `Err(WouldBlock)` when the source has nothing available yet.
pub trait Protocol: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(DemuxError::unsupported("protocol is read-only"))
    }

    /// Returns the new absolute position, or the size for `Whence::Size`.
    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<i64> {
        Err(DemuxError::NotSeekable)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Forward distance below which reading is cheaper than seeking.
    fn short_seek_threshold(&self) -> Option<i32> {
        None
    }

    /// Timestamp at a byte position, for time-based transports.
    fn get_timestamp(&mut self, _stream: usize, _pos_hint: i64) -> Option<i64> {
        None
    }

    fn is_streamed(&self) -> bool {
        false
    }
}

pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, url: &str, flags: ProtocolFlags) -> Result<Box<dyn Protocol>>;

    /// Protocols allowed for nested opens when the caller gave no whitelist.
    fn default_whitelist(&self) -> Option<&'static str> {
        None
    }

    /// Whether `name+inner:` style URLs resolve to this protocol.
    fn nested_scheme(&self) -> bool {
        false
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn ProtocolFactory>>,
}

static DEFAULT_PROTOCOLS: Lazy<ProtocolRegistry> = Lazy::new(|| {
    let mut registry = ProtocolRegistry::empty();
    registry.register(Arc::new(FileProtocolFactory));
    registry.register(Arc::new(MemoryProtocolFactory));
    registry
});

impl Default for ProtocolRegistry {
    fn default() -> Self {
        DEFAULT_PROTOCOLS.clone()
    }
}

impl ProtocolRegistry {
    pub fn empty() -> Self {
        Self { protocols: Vec::new() }
    }

    pub fn register(&mut self, factory: Arc<dyn ProtocolFactory>) {
        self.protocols.push(factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.protocols.iter().map(|p| p.name()).collect()
    }

    pub fn find_protocol(&self, url: &str) -> Option<Arc<dyn ProtocolFactory>> {
        let scheme = url_scheme(url);
        let nested = scheme.split('+').next().unwrap_or(&scheme).to_string();

        for proto in &self.protocols {
            if proto.name() == scheme {
                return Some(proto.clone());
            }
            if proto.nested_scheme() && proto.name() == nested {
                return Some(proto.clone());
            }
        }
        None
    }

    /// Resolves, gates and opens `url`.
    pub fn open(
        &self,
        url: &str,
        flags: ProtocolFlags,
        whitelist: Option<&str>,
        blacklist: Option<&str>,
    ) -> Result<UrlContext> {
        let factory = self
            .find_protocol(url)
            .ok_or_else(|| DemuxError::ProtocolNotFound(url_scheme(url)))?;
        let name = factory.name();

        let whitelist = whitelist.or(factory.default_whitelist());
        if let Some(list) = whitelist {
            if !list_contains(list, name) {
                tracing::error!(protocol = name, whitelist = list, "Protocol not on whitelist");
                return Err(DemuxError::NotAllowed(format!("protocol '{}' not on whitelist '{}'", name, list)));
            }
        }
        if let Some(list) = blacklist {
            if list_contains(list, name) {
                tracing::error!(protocol = name, blacklist = list, "Protocol on blacklist");
                return Err(DemuxError::NotAllowed(format!("protocol '{}' on blacklist '{}'", name, list)));
            }
        }

        let inner = factory.open(url, flags)?;
        let mut ctx = UrlContext::new(name, url, inner, flags);

        if flags.contains(ProtocolFlags::WRITE) || name == "file" {
            if !ctx.is_streamed && ctx.seek(0, Whence::Start).is_err() {
                ctx.is_streamed = true;
            }
        }

        tracing::debug!(protocol = name, url, streamed = ctx.is_streamed, "Opened protocol");
        Ok(ctx)
    }
}

fn is_dos_path(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

/// Scheme of `url`, defaulting to `file` for plain and DOS paths.
pub fn url_scheme(url: &str) -> String {
    if is_dos_path(url) {
        return "file".to_string();
    }
    if let Ok(parsed) = Url::parse(url) {
        return parsed.scheme().to_string();
    }

    let len = url.bytes().take_while(|b| URL_SCHEME_CHARS.as_bytes().contains(b)).count();
    if len > 0 && url.as_bytes().get(len) == Some(&b':') {
        url[..len].to_ascii_lowercase()
    } else {
        "file".to_string()
    }
}

// ============================================================================
// URL Context (retry wrapper)
// ============================================================================

pub struct UrlContext {
    protocol_name: &'static str,
    url: String,
    inner: Box<dyn Protocol>,
    flags: ProtocolFlags,
    pub(crate) is_streamed: bool,
    pub rw_timeout: Option<Duration>,
    pub interrupt: Option<InterruptCallback>,
}

struct RetryPolicy<'a> {
    interrupt: Option<&'a InterruptCallback>,
    rw_timeout: Option<Duration>,
    nonblock: bool,
}

fn check_interrupt(cb: Option<&InterruptCallback>) -> bool {
    cb.map(|f| (**f)()).unwrap_or(false)
}

/// Calls `transfer` until at least `size_min` bytes moved.
fn retry_transfer<F>(policy: &RetryPolicy<'_>, size_min: usize, mut transfer: F) -> Result<usize>
where
    F: FnMut(usize) -> Result<usize>,
{
    let mut len = 0usize;
    let mut fast_retries = FAST_RETRIES;
    let mut wait_since: Option<Instant> = None;

    while len < size_min {
        if check_interrupt(policy.interrupt) {
            return Err(DemuxError::Interrupted);
        }

        let ret = transfer(len);
        if policy.nonblock {
            return ret.map(|n| len + n);
        }

        let n = match ret {
            Ok(0) | Err(DemuxError::Eof) => {
                return if len > 0 { Ok(len) } else { Err(DemuxError::Eof) };
            }
            Ok(n) => n,
            Err(DemuxError::WouldBlock) => {
                if fast_retries > 0 {
                    fast_retries -= 1;
                } else {
                    if let Some(timeout) = policy.rw_timeout {
                        match wait_since {
                            None => wait_since = Some(Instant::now()),
                            Some(start) if start.elapsed() > timeout => return Err(DemuxError::TimedOut),
                            Some(_) => {}
                        }
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                0
            }
            Err(e) => return Err(e),
        };

        if n > 0 {
            fast_retries = fast_retries.max(2);
            wait_since = None;
        }
        len += n;
    }
    Ok(len)
}

impl UrlContext {
    pub fn new(protocol_name: &'static str, url: &str, inner: Box<dyn Protocol>, flags: ProtocolFlags) -> Self {
        let is_streamed = inner.is_streamed();
        Self {
            protocol_name,
            url: url.to_string(),
            inner,
            flags,
            is_streamed,
            rw_timeout: None,
            interrupt: None,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol_name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn flags(&self) -> ProtocolFlags {
        self.flags
    }

    pub fn is_streamed(&self) -> bool {
        self.is_streamed
    }

    pub fn set_nonblocking(&mut self, nonblock: bool) {
        self.flags.set(ProtocolFlags::NONBLOCK, nonblock);
    }

    /// Reads at least one byte.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(ProtocolFlags::READ) {
            return Err(DemuxError::unsupported("context not opened for reading"));
        }
        let policy = RetryPolicy {
            interrupt: self.interrupt.as_ref(),
            rw_timeout: self.rw_timeout,
            nonblock: self.flags.contains(ProtocolFlags::NONBLOCK),
        };
        let inner = &mut self.inner;
        retry_transfer(&policy, 1, |off| inner.read(&mut buf[off..]))
    }

    /// Reads until `buf` is full or the source ends.
    pub fn read_complete(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(ProtocolFlags::READ) {
            return Err(DemuxError::unsupported("context not opened for reading"));
        }
        let size = buf.len();
        let policy = RetryPolicy {
            interrupt: self.interrupt.as_ref(),
            rw_timeout: self.rw_timeout,
            nonblock: self.flags.contains(ProtocolFlags::NONBLOCK),
        };
        let inner = &mut self.inner;
        retry_transfer(&policy, size, |off| inner.read(&mut buf[off..]))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flags.contains(ProtocolFlags::WRITE) {
            return Err(DemuxError::unsupported("context not opened for writing"));
        }
        let policy = RetryPolicy {
            interrupt: self.interrupt.as_ref(),
            rw_timeout: self.rw_timeout,
            nonblock: self.flags.contains(ProtocolFlags::NONBLOCK),
        };
        let inner = &mut self.inner;
        retry_transfer(&policy, buf.len(), |off| inner.write(&buf[off..]))
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        self.inner.seek(offset, whence)
    }

    pub fn size(&mut self) -> Result<i64> {
        match self.inner.seek(0, Whence::Size) {
            Ok(size) => Ok(size),
            Err(_) => {
                let pos = self.inner.seek(0, Whence::Current)?;
                let size = self.inner.seek(-1, Whence::End)? + 1;
                self.inner.seek(pos, Whence::Start)?;
                Ok(size)
            }
        }
    }

    pub fn short_seek_threshold(&self) -> Option<i32> {
        self.inner.short_seek_threshold()
    }

    pub fn get_timestamp(&mut self, stream: usize, pos_hint: i64) -> Option<i64> {
        self.inner.get_timestamp(stream, pos_hint)
    }

    pub fn interrupted(&self) -> bool {
        check_interrupt(self.interrupt.as_ref())
    }

    pub fn close(mut self) -> Result<()> {
        self.inner.close()
    }
}

// ============================================================================
// file:
// ============================================================================

pub struct FileProtocolFactory;

pub struct FileProtocol {
    file: File,
    pos: i64,
}

fn file_path(url: &str) -> PathBuf {
    if url.starts_with("file://") {
        if let Ok(parsed) = Url::parse(url) {
            if let Ok(path) = parsed.to_file_path() {
                return path;
            }
        }
    }
    if let Some(rest) = url.strip_prefix("file:") {
        if !is_dos_path(url) {
            return PathBuf::from(rest);
        }
    }
    PathBuf::from(url)
}

impl ProtocolFactory for FileProtocolFactory {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, url: &str, flags: ProtocolFlags) -> Result<Box<dyn Protocol>> {
        let path = file_path(url);
        let file = if flags.contains(ProtocolFlags::WRITE) {
            FsOpenOptions::new()
                .read(flags.contains(ProtocolFlags::READ))
                .write(true)
                .create(true)
                .truncate(!flags.contains(ProtocolFlags::READ))
                .open(&path)
        } else {
            File::open(&path)
        }
        .map_err(|e| DemuxError::io(0, e))?;

        Ok(Box::new(FileProtocol { file, pos: 0 }))
    }
}

impl Protocol for FileProtocol {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.file.read(buf) {
                Ok(0) if !buf.is_empty() => return Err(DemuxError::Eof),
                Ok(n) => {
                    self.pos += n as i64;
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(DemuxError::WouldBlock),
                Err(e) => return Err(DemuxError::io(self.pos, e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.file.write(buf).map_err(|e| DemuxError::io(self.pos, e))?;
        self.pos += n as i64;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = match whence {
            Whence::Size => {
                let meta = self.file.metadata().map_err(|e| DemuxError::io(self.pos, e))?;
                return Ok(meta.len() as i64);
            }
            Whence::Start => {
                if offset < 0 {
                    return Err(DemuxError::invalid_data("negative seek"));
                }
                SeekFrom::Start(offset as u64)
            }
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        let pos = self.file.seek(target).map_err(|e| DemuxError::io(self.pos, e))?;
        self.pos = pos as i64;
        Ok(self.pos)
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| DemuxError::io(self.pos, e))
    }
}

// ============================================================================
// memory:
// ============================================================================

static MEMORY_BUFFERS: Lazy<Mutex<HashMap<String, Bytes>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Makes `data` reachable as `memory:<name>`.
pub fn register_memory_buffer(name: &str, data: Bytes) {
    MEMORY_BUFFERS.lock().insert(name.to_string(), data);
}

pub fn unregister_memory_buffer(name: &str) -> Option<Bytes> {
    MEMORY_BUFFERS.lock().remove(name)
}

pub struct MemoryProtocolFactory;

/// Read-only view of a shared in-process buffer.
pub struct MemoryProtocol {
    data: Bytes,
    pos: usize,
}

impl MemoryProtocol {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }
}

impl ProtocolFactory for MemoryProtocolFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, url: &str, flags: ProtocolFlags) -> Result<Box<dyn Protocol>> {
        if flags.contains(ProtocolFlags::WRITE) {
            return Err(DemuxError::unsupported("memory protocol is read-only"));
        }
        let name = url.strip_prefix("memory:").unwrap_or(url);
        let data = MEMORY_BUFFERS
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DemuxError::io(0, std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string())))?;
        Ok(Box::new(MemoryProtocol::new(data)))
    }
}

impl Protocol for MemoryProtocol {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data.len().saturating_sub(self.pos);
        if remaining == 0 {
            return Err(DemuxError::Eof);
        }
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let base = match whence {
            Whence::Size => return Ok(self.data.len() as i64),
            Whence::Start => 0,
            Whence::Current => self.pos as i64,
            Whence::End => self.data.len() as i64,
        };
        let target = base.checked_add(offset).ok_or(DemuxError::OutOfRange)?;
        if target < 0 {
            return Err(DemuxError::invalid_data("seek before start"));
        }
        self.pos = target as usize;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scheme_defaults_to_file() {
        assert_eq!(url_scheme("/tmp/movie.ts"), "file");
        assert_eq!(url_scheme("movie.ts"), "file");
        assert_eq!(url_scheme("C:\\video\\movie.avi"), "file");
        assert_eq!(url_scheme("file:///tmp/a.ts"), "file");
        assert_eq!(url_scheme("memory:clip"), "memory");
        assert_eq!(url_scheme("crypto+http://host/a"), "crypto+http");
    }

    #[test]
    fn find_protocol_resolves_builtins() {
        let reg = ProtocolRegistry::default();
        assert_eq!(reg.find_protocol("memory:x").map(|p| p.name()), Some("memory"));
        assert_eq!(reg.find_protocol("/a/b.ts").map(|p| p.name()), Some("file"));
        assert!(reg.find_protocol("rtmp://host/live").is_none());
    }

    #[test]
    fn whitelist_and_blacklist_gate_open() {
        register_memory_buffer("proto-gate", Bytes::from_static(b"abc"));
        let reg = ProtocolRegistry::default();
        let err = reg
            .open("memory:proto-gate", ProtocolFlags::READ, Some("file"), None)
            .err()
            .expect("whitelist rejection");
        assert!(matches!(err, DemuxError::NotAllowed(_)));

        let err = reg
            .open("memory:proto-gate", ProtocolFlags::READ, None, Some("memory,http"))
            .err()
            .expect("blacklist rejection");
        assert!(matches!(err, DemuxError::NotAllowed(_)));

        assert!(reg.open("memory:proto-gate", ProtocolFlags::READ, Some("memory"), None).is_ok());
        unregister_memory_buffer("proto-gate");
    }

    #[test]
    fn file_protocol_reads_and_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").expect("write");

        let reg = ProtocolRegistry::default();
        let mut ctx = reg
            .open(path.to_str().expect("utf8 path"), ProtocolFlags::READ, None, None)
            .expect("open");
        assert!(!ctx.is_streamed());
        assert_eq!(ctx.size().expect("size"), 10);

        let mut buf = [0u8; 4];
        assert_eq!(ctx.read_complete(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"0123");
        ctx.seek(8, Whence::Start).expect("seek");
        let mut rest = [0u8; 8];
        assert_eq!(ctx.read_complete(&mut rest).expect("tail"), 2);
        assert!(ctx.read(&mut rest).unwrap_err().is_eof());
    }

    struct Flaky {
        stalls: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Protocol for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stalls > 0 {
                self.stalls -= 1;
                return Err(DemuxError::WouldBlock);
            }
            buf[0] = 7;
            Ok(1)
        }
    }

    #[test]
    fn retry_rides_out_would_block() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proto = Flaky { stalls: 8, calls: calls.clone() };
        let mut ctx = UrlContext::new("flaky", "flaky:", Box::new(proto), ProtocolFlags::READ);
        let mut buf = [0u8; 1];
        assert_eq!(ctx.read(&mut buf).expect("read"), 1);
        assert_eq!(buf[0], 7);
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn retry_times_out() {
        let proto = Flaky { stalls: usize::MAX, calls: Arc::new(AtomicUsize::new(0)) };
        let mut ctx = UrlContext::new("flaky", "flaky:", Box::new(proto), ProtocolFlags::READ);
        ctx.rw_timeout = Some(Duration::from_millis(5));
        let mut buf = [0u8; 1];
        assert!(matches!(ctx.read(&mut buf), Err(DemuxError::TimedOut)));
    }

    #[test]
    fn nonblocking_surfaces_would_block() {
        let proto = Flaky { stalls: 1, calls: Arc::new(AtomicUsize::new(0)) };
        let mut ctx = UrlContext::new("flaky", "flaky:", Box::new(proto), ProtocolFlags::READ);
        ctx.set_nonblocking(true);
        let mut buf = [0u8; 1];
        assert!(matches!(ctx.read(&mut buf), Err(DemuxError::WouldBlock)));
        assert_eq!(ctx.read(&mut buf).expect("second read"), 1);
    }

    #[test]
    fn interrupt_wins_over_retry() {
        let proto = Flaky { stalls: usize::MAX, calls: Arc::new(AtomicUsize::new(0)) };
        let mut ctx = UrlContext::new("flaky", "flaky:", Box::new(proto), ProtocolFlags::READ);
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        ctx.interrupt = Some(Arc::new(move || t.fetch_add(1, Ordering::SeqCst) >= 20));
        let mut buf = [0u8; 1];
        assert!(matches!(ctx.read(&mut buf), Err(DemuxError::Interrupted)));
    }
}
