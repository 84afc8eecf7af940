use std::fmt;

use bytes::Bytes;

/// Opaque handle to an endpoint certificate.
///
/// Drivers never inspect certificates beyond the identity string used for
/// early-data compatibility checks; verification happens in the handshake
/// state machine.
pub trait PeerCert: fmt::Debug {
    /// Stable identity of the certified peer (typically the leaf subject).
    fn identity(&self) -> String;

    /// DER encoding of the leaf certificate, when one was materialized.
    fn x509(&self) -> Option<Bytes>;
}

/// Compare two optional cert handles by identity.
pub fn same_identity(
    a: &Option<std::rc::Rc<dyn PeerCert>>,
    b: &Option<std::rc::Rc<dyn PeerCert>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.identity() == b.identity(),
        _ => false,
    }
}
