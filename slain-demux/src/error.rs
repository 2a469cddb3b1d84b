//! Error types shared by every layer of the demuxer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemuxError {
    /// The source has no data right now; the transfer wrapper retries this.
    #[error("Resource temporarily unavailable")]
    WouldBlock,
    #[error("End of file")]
    Eof,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Protocol not found: {0}")]
    ProtocolNotFound(String),
    #[error("Not allowed: {0}")]
    NotAllowed(String),
    #[error("Value out of range")]
    OutOfRange,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("I/O error at offset {offset}: {source}")]
    Io {
        offset: i64,
        #[source]
        source: std::io::Error,
    },
    #[error("Interrupted by callback")]
    Interrupted,
    #[error("Timed out")]
    TimedOut,
    #[error("Source is not seekable")]
    NotSeekable,
    #[error("Stream {0} not found")]
    StreamNotFound(usize),
    /// Demuxer consumed input but produced no packet; the read loop tries again.
    #[error("Try again")]
    Redo,
}

pub type Result<T> = std::result::Result<T, DemuxError>;

impl DemuxError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        DemuxError::InvalidData(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        DemuxError::Unsupported(msg.into())
    }

    pub fn io(offset: i64, source: std::io::Error) -> Self {
        DemuxError::Io { offset, source }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, DemuxError::Eof)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DemuxError::WouldBlock)
    }

    /// Rebuilds an equivalent error so a latched copy can be handed out
    /// while the original stays recorded.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            DemuxError::WouldBlock => DemuxError::WouldBlock,
            DemuxError::Eof => DemuxError::Eof,
            DemuxError::InvalidData(m) => DemuxError::InvalidData(m.clone()),
            DemuxError::Unsupported(m) => DemuxError::Unsupported(m.clone()),
            DemuxError::ProtocolNotFound(m) => DemuxError::ProtocolNotFound(m.clone()),
            DemuxError::NotAllowed(m) => DemuxError::NotAllowed(m.clone()),
            DemuxError::OutOfRange => DemuxError::OutOfRange,
            DemuxError::OutOfMemory => DemuxError::OutOfMemory,
            DemuxError::Io { offset, source } => DemuxError::Io {
                offset: *offset,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            DemuxError::Interrupted => DemuxError::Interrupted,
            DemuxError::TimedOut => DemuxError::TimedOut,
            DemuxError::NotSeekable => DemuxError::NotSeekable,
            DemuxError::StreamNotFound(i) => DemuxError::StreamNotFound(*i),
            DemuxError::Redo => DemuxError::Redo,
        }
    }
}
