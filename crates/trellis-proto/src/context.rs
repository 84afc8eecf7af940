//! Shared endpoint configuration.
//!
//! A context is shared by every driver created from it (all bound to the same
//! event loop) and outlives the longest-lived of them. It carries the PSK
//! cache handle and the reference tables of parameters the endpoint offers.

use std::fmt;
use std::rc::Rc;

use trellis_core::ids::{CipherSuite, ProtocolVersion};

use crate::psk::{MemoryPskCache, PskCache};

const DEFAULT_MAX_EARLY_DATA: u32 = 16 * 1024;

fn default_versions() -> Vec<ProtocolVersion> {
    vec![ProtocolVersion::Tls13]
}

fn default_ciphers() -> Vec<CipherSuite> {
    vec![
        CipherSuite::Aes128GcmSha256,
        CipherSuite::Aes256GcmSha384,
        CipherSuite::Chacha20Poly1305Sha256,
    ]
}

/// Configuration shared by client drivers.
pub struct ClientContext {
    psk_cache: Rc<dyn PskCache>,
    send_early_data: bool,
    supported_versions: Vec<ProtocolVersion>,
    supported_ciphers: Vec<CipherSuite>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self {
            psk_cache: Rc::new(MemoryPskCache::default()),
            send_early_data: false,
            supported_versions: default_versions(),
            supported_ciphers: default_ciphers(),
        }
    }

    pub fn with_psk_cache(mut self, cache: Rc<dyn PskCache>) -> Self {
        self.psk_cache = cache;
        self
    }

    /// Allow 0-RTT flights when a cached PSK advertises an early-data budget.
    pub fn with_early_data(mut self, enable: bool) -> Self {
        self.send_early_data = enable;
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn with_supported_ciphers(mut self, ciphers: Vec<CipherSuite>) -> Self {
        self.supported_ciphers = ciphers;
        self
    }

    pub fn psk_cache(&self) -> &Rc<dyn PskCache> {
        &self.psk_cache
    }

    pub fn send_early_data(&self) -> bool {
        self.send_early_data
    }

    pub fn supported_versions(&self) -> &[ProtocolVersion] {
        &self.supported_versions
    }

    pub fn supported_ciphers(&self) -> &[CipherSuite] {
        &self.supported_ciphers
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        ClientContext::new()
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("send_early_data", &self.send_early_data)
            .field("supported_versions", &self.supported_versions)
            .field("supported_ciphers", &self.supported_ciphers)
            .finish()
    }
}

/// Configuration shared by server drivers.
pub struct ServerContext {
    psk_cache: Rc<dyn PskCache>,
    supported_versions: Vec<ProtocolVersion>,
    supported_ciphers: Vec<CipherSuite>,
    max_early_data_size: u32,
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            psk_cache: Rc::new(MemoryPskCache::default()),
            supported_versions: default_versions(),
            supported_ciphers: default_ciphers(),
            max_early_data_size: DEFAULT_MAX_EARLY_DATA,
        }
    }

    pub fn with_psk_cache(mut self, cache: Rc<dyn PskCache>) -> Self {
        self.psk_cache = cache;
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn with_supported_ciphers(mut self, ciphers: Vec<CipherSuite>) -> Self {
        self.supported_ciphers = ciphers;
        self
    }

    /// Cap on the 0-RTT bytes this server advertises to resuming clients.
    pub fn with_max_early_data(mut self, max: u32) -> Self {
        self.max_early_data_size = max;
        self
    }

    pub fn psk_cache(&self) -> &Rc<dyn PskCache> {
        &self.psk_cache
    }

    pub fn supported_versions(&self) -> &[ProtocolVersion] {
        &self.supported_versions
    }

    pub fn supported_ciphers(&self) -> &[CipherSuite] {
        &self.supported_ciphers
    }

    pub fn max_early_data_size(&self) -> u32 {
        self.max_early_data_size
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        ServerContext::new()
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("supported_versions", &self.supported_versions)
            .field("supported_ciphers", &self.supported_ciphers)
            .field("max_early_data_size", &self.max_early_data_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let context = ClientContext::new();
        assert!(!context.send_early_data());
        assert_eq!(context.supported_versions(), &[ProtocolVersion::Tls13]);
        assert_eq!(context.supported_ciphers().len(), 3);
    }

    #[test]
    fn server_early_data_cap() {
        let context = ServerContext::new().with_max_early_data(4096);
        assert_eq!(context.max_early_data_size(), 4096);
    }
}
