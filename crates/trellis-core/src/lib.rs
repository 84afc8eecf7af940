//! Core transport primitives for Trellis endpoints.
//!
//! This crate holds the pieces shared by every Trellis endpoint: the
//! application-facing error surface, the TLS 1.3 wire identifier tables, the
//! byte-transport contract the drivers speak downward, and a tokio-backed
//! adapter implementing that contract over any async byte stream.

pub mod error;
pub mod ids;
pub mod net;
pub mod transport;

pub use error::EndpointError;
pub use ids::{
    real_draft, AlertDescription, CipherSuite, ExtensionType, NamedGroup, NotTls13,
    ProtocolVersion, PskKeyExchangeMode, SignatureScheme,
};
pub use net::TokioTransport;
pub use transport::{Transport, TransportObserver, WireWrite, WriteCallback, WriteFlags};
