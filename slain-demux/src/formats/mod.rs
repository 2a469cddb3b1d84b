//! Built-in container formats.

pub mod avi;
pub mod mpegts;
pub mod raw;

use std::sync::Arc;

use crate::format::InputFormat;

/// Formats registered by default, in probing order.
pub(crate) fn builtin() -> Vec<Arc<dyn InputFormat>> {
    vec![
        Arc::new(mpegts::MpegTsFormat),
        Arc::new(avi::AviFormat),
        Arc::new(raw::H264),
        Arc::new(raw::AAC),
        Arc::new(raw::AC3),
        Arc::new(raw::MP3),
    ]
}
