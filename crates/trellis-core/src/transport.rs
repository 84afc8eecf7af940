//! The byte-transport contract spoken by endpoint drivers.
//!
//! A driver owns exactly one transport for its lifetime. Downward it enqueues
//! writes and closes; upward the transport feeds a single registered
//! [`TransportObserver`] with received bytes, EOF, and errors. Everything runs
//! on one event loop, so callbacks are plain `Rc` handles.

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::EndpointError;

/// Flags attached to a single transport write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Hold the write back for coalescing with the next one when possible.
    pub cork: bool,
    /// Marks the end of an application record.
    pub eor: bool,
}

/// Completion callback for one transport write.
///
/// `write_err` reports how many bytes made it onto the wire before the
/// failure.
pub trait WriteCallback {
    fn write_success(&self);
    fn write_err(&self, bytes_written: usize, error: EndpointError);
}

/// A chunk of bytes headed for the wire, with its completion callback.
pub struct WireWrite {
    pub data: Bytes,
    pub flags: WriteFlags,
    pub callback: Option<Rc<dyn WriteCallback>>,
}

impl WireWrite {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: WriteFlags::default(),
            callback: None,
        }
    }

    pub fn with_flags(mut self, flags: WriteFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_callback(mut self, callback: Rc<dyn WriteCallback>) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl fmt::Debug for WireWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireWrite")
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Upward events from a transport to the driver that registered itself.
pub trait TransportObserver {
    fn bytes_received(&self, data: Bytes);
    fn read_eof(&self);
    fn transport_error(&self, error: EndpointError);
}

/// Downward contract implemented by byte transports.
pub trait Transport {
    /// Install or clear the single observer receiving read-side events.
    fn set_observer(&mut self, observer: Option<Rc<dyn TransportObserver>>);

    /// Enqueue bytes; the write callback fires when the chunk is flushed or
    /// fails.
    fn write(&mut self, write: WireWrite);

    /// Flush queued writes, then close.
    fn close(&mut self);

    /// Close immediately; queued writes are attempted best-effort.
    fn close_now(&mut self);

    /// Drop the connection without an orderly flush.
    fn close_with_reset(&mut self);

    fn good(&self) -> bool;
    fn connecting(&self) -> bool;
    fn error(&self) -> bool;
    fn is_detachable(&self) -> bool;

    /// Backpressure: stop delivering `bytes_received` until resumed.
    fn pause_reads(&mut self);
    fn resume_reads(&mut self);
}
