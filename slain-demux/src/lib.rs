//! # SLAIN Demux
//!
//! Pure Rust container demultiplexing engine: byte sources, format probing,
//! packet reading with timestamp repair, stream analysis and seeking.
//!
//! ```no_run
//! use slain_demux::{OpenOptions, Session};
//!
//! let mut session = Session::open_input("file:movie.ts", None, OpenOptions::default())?;
//! session.find_stream_info()?;
//! while let Ok(pkt) = session.read_frame() {
//!     println!("stream {} pts {:?}", pkt.stream_index, pkt.pts);
//! }
//! # Ok::<(), slain_demux::DemuxError>(())
//! ```

// ============================================================================
// Foundations
// ============================================================================
pub mod error;
pub mod rational;
pub mod options;

// ============================================================================
// Byte I/O
// ============================================================================
pub mod protocol;
pub mod io;

// ============================================================================
// Packets / Streams
// ============================================================================
pub mod packet;
pub mod queue;
pub mod codec;
pub mod index;
pub mod stream;

// ============================================================================
// Formats / Probing
// ============================================================================
pub mod format;
pub mod probe;
pub mod formats;

// ============================================================================
// Frame Parsers
// ============================================================================
pub mod parser;
pub mod parsers;

// ============================================================================
// Demux Engine
// ============================================================================
pub mod context;
pub mod timestamps;
pub mod demux;
pub mod seek;
pub mod stream_info;
pub mod duration;
pub mod session;

#[cfg(test)]
mod testing;

pub use codec::{CodecId, CodecParameters, MediaType};
pub use context::{ContextFlags, FormatContext};
pub use duration::DurationEstimation;
pub use error::{DemuxError, Result};
pub use format::{Demuxer, FormatRegistry, InputFormat, InputFormatFlags, ProbeData};
pub use io::IoContext;
pub use options::{DemuxOptions, OpenOptions, TagPolicy};
pub use packet::{Packet, PacketFlags};
pub use rational::Rational;
pub use seek::SeekFlags;
pub use session::{Session, SessionInfo};
pub use stream::{Chapter, Discard, Program, Stream};
