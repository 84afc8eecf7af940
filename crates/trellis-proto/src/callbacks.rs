//! Application-facing callback traits.
//!
//! Everything runs on the driver's event loop, so callbacks are `Rc` handles
//! with interior mutability left to the implementor. A driver guards every
//! invocation: destroying the driver from inside a callback is safe and stops
//! further processing.

use bytes::Bytes;
use trellis_core::error::EndpointError;

/// Receives decrypted application data and read-side lifecycle events.
pub trait ReadCallback {
    fn read_available(&self, data: Bytes);
    fn read_eof(&self);
    fn read_error(&self, error: EndpointError);
}

/// Notified exactly once when the connection becomes replay-safe.
pub trait ReplaySafetyCallback {
    fn on_replay_safe(&self);
}

/// Outcome of a client handshake.
///
/// `handshake_success` fires once: at the end of the full handshake, or
/// already at the early (0-RTT) handshake when the server accepts early data.
/// In the early case a later full-handshake failure is surfaced through the
/// read and write paths, never through `handshake_error`.
pub trait ClientHandshakeCallback {
    fn handshake_success(&self);
    fn handshake_error(&self, error: EndpointError);
}

/// Outcome of a server handshake.
pub trait ServerHandshakeCallback {
    fn handshake_success(&self);
    fn handshake_error(&self, error: EndpointError);

    /// The client requires a pre-1.3 protocol stack. `client_hello` is the
    /// original ClientHello concatenated with everything else the transport
    /// already delivered, so a downstream implementation sees a continuous
    /// stream. The driver does not touch the transport afterwards.
    fn handshake_attempt_fallback(&self, client_hello: Bytes);
}

/// Outcome of dialing the peer for a client constructed without a transport.
pub trait ConnectCallback {
    fn connect_success(&self);
    fn connect_err(&self, error: EndpointError);
}
